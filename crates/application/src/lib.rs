//! Audit configuration, ports and the save-lifecycle pipeline.

#![forbid(unsafe_code)]

mod audit_config;
mod audit_options;
mod audit_ports;
mod audit_service;

pub use audit_config::AuditConfiguration;
pub use audit_options::{AuditOptions, DescriptionMode, MergeMode, PropertyDescriptionMode};
pub use audit_ports::{
    AuditClock, AuditEnrichment, AuditLogReader, AuditLogStore, ChangeTracker, EntryHandle,
    FoundRecord, MAX_HISTORY_LIMIT, SystemClock, TrackedEntry, TrackedState,
    clamp_history_limit,
};
pub use audit_service::{AuditInterceptor, AuditOutcome, ChangeEntry, ChangeProperty, PendingAudit};
