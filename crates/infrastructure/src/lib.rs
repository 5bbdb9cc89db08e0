//! Storage adapters for the audit pipeline.

#![forbid(unsafe_code)]

mod in_memory_audit_log_store;
mod in_memory_persistence_context;
mod merge_statement;
mod merge_statement_cache;
mod postgres_audit_log_reader;
mod postgres_audit_log_store;
mod postgres_schema_inspector;

pub use in_memory_audit_log_store::InMemoryAuditLogStore;
pub use in_memory_persistence_context::{
    InMemoryDatabase, InMemoryPersistenceContext, SaveOutcome,
};
pub use merge_statement::MergeStatement;
pub use merge_statement_cache::{DEFAULT_STATEMENT_CAPACITY, MergeStatementCache};
pub use postgres_audit_log_reader::PostgresAuditLogReader;
pub use postgres_audit_log_store::{MergeStrategy, PostgresAuditLogStore};
pub use postgres_schema_inspector::PostgresSchemaInspector;
