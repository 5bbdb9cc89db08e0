//! Domain types for change auditing: tracked values, entity models,
//! durable audit records and the rule deciding when edits collapse.

#![forbid(unsafe_code)]

mod audit_log;
mod merge;
mod model;
mod schema;
mod value;

pub use audit_log::{AuditContext, AuditEntryState, AuditLogProperty, AuditLogRecord};
pub use merge::can_extend;
pub use model::{
    EntityModel, EntityModelBuilder, FieldModel, LabelError, LabelFn, LabelSource,
    ReferenceModel,
};
pub use schema::{
    ACTING_USER_ID_COLUMN, AuditSchema, ColumnDescriptor, RecordShape, SchemaFingerprint,
    StoreType, TableDescriptor,
};
pub use value::{FieldKind, FieldValue, FieldValues};
