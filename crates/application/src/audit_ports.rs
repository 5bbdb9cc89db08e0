//! Ports the audit pipeline consumes from the host and the backing store.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use trailkeep_core::AppResult;
use trailkeep_domain::{
    AuditLogRecord, AuditSchema, EntityModel, FieldValue, FieldValues, ReferenceModel,
};

// ---------------------------------------------------------------------------
// Host change tracker
// ---------------------------------------------------------------------------

static NULL_VALUE: FieldValue = FieldValue::Null;

/// Opaque identity of a tracked record within one persistence context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntryHandle(u64);

impl EntryHandle {
    /// Wraps a host-assigned identity.
    #[must_use]
    pub fn new(value: u64) -> Self {
        Self(value)
    }

    /// Returns the host-assigned identity.
    #[must_use]
    pub fn value(self) -> u64 {
        self.0
    }
}

/// Change-tracker state of a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrackedState {
    /// Pending insert.
    Added,
    /// Pending update.
    Modified,
    /// Pending delete.
    Deleted,
    /// Tracked without pending changes.
    Unchanged,
    /// No longer tracked.
    Detached,
}

/// Snapshot of one tracked record.
#[derive(Debug, Clone)]
pub struct TrackedEntry {
    /// Tracker identity.
    pub handle: EntryHandle,
    /// Entity metadata.
    pub model: Arc<EntityModel>,
    /// Tracker state.
    pub state: TrackedState,
    /// Values as last loaded from or saved to the store.
    pub original: FieldValues,
    /// Values as currently held by the host.
    pub current: FieldValues,
}

impl TrackedEntry {
    /// Returns the original value of a field, null when absent.
    #[must_use]
    pub fn original_value(&self, field: &str) -> &FieldValue {
        self.original.get(field).unwrap_or(&NULL_VALUE)
    }

    /// Returns the current value of a field, null when absent.
    #[must_use]
    pub fn current_value(&self, field: &str) -> &FieldValue {
        self.current.get(field).unwrap_or(&NULL_VALUE)
    }

    /// Returns whether the field's current value differs from its original.
    #[must_use]
    pub fn is_field_modified(&self, field: &str) -> bool {
        self.original_value(field) != self.current_value(field)
    }

    /// Returns whether any foreign key field of the reference changed.
    #[must_use]
    pub fn is_reference_modified(&self, reference: &ReferenceModel) -> bool {
        reference
            .foreign_key_fields()
            .iter()
            .any(|field| self.is_field_modified(field))
    }
}

/// Result of a primary key lookup through the host tracker.
#[derive(Debug, Clone)]
pub struct FoundRecord {
    /// Tracker identity of the loaded record.
    pub handle: EntryHandle,
    /// Entity metadata.
    pub model: Arc<EntityModel>,
    /// Values before any change pending in the current save.
    pub original: FieldValues,
    /// Values including changes pending in the current save.
    pub current: FieldValues,
    /// Whether the lookup attached a record that was not tracked before.
    pub newly_attached: bool,
}

/// Port over the host persistence context's change tracker.
#[async_trait]
pub trait ChangeTracker: Send + Sync {
    /// Returns every tracked record after change detection.
    fn tracked_entries(&self) -> Vec<TrackedEntry>;

    /// Returns a fresh snapshot, or `None` once the record is detached.
    fn entry(&self, handle: EntryHandle) -> Option<TrackedEntry>;

    /// Returns metadata for an entity type.
    fn model(&self, entity_type: &str) -> Option<Arc<EntityModel>>;

    /// Loads a record by primary key values in key order.
    async fn find_by_key(
        &self,
        entity_type: &str,
        key: &[FieldValue],
    ) -> AppResult<Option<FoundRecord>>;

    /// Stops tracking a record that [`ChangeTracker::find_by_key`] attached.
    fn release(&self, found: &FoundRecord);
}

// ---------------------------------------------------------------------------
// Audit store
// ---------------------------------------------------------------------------

/// Port for persisting audit log records.
#[async_trait]
pub trait AuditLogStore: Send + Sync {
    /// Returns the schema the store writes to.
    fn schema(&self) -> &AuditSchema;

    /// Returns whether the store can extend recent records in one batch.
    fn supports_merge(&self) -> bool;

    /// Extends or inserts each record, returning the number of records processed.
    async fn merge_records(&self, records: &[AuditLogRecord], window: Duration)
    -> AppResult<u64>;

    /// Inserts every record as new, returning the number of records written.
    async fn insert_records(&self, records: &[AuditLogRecord]) -> AppResult<u64>;
}

/// Port for reading and pruning persisted audit history.
#[async_trait]
pub trait AuditLogReader: Send + Sync {
    /// Lists records for one entity, newest first, properties ordered by field name.
    async fn list_entity_history(
        &self,
        entity_type: &str,
        key_value: &str,
        limit: usize,
    ) -> AppResult<Vec<AuditLogRecord>>;

    /// Deletes records older than `cutoff`, returning the number removed.
    async fn purge_older_than(&self, cutoff: DateTime<Utc>) -> AppResult<u64>;
}

/// Largest page returned by [`AuditLogReader::list_entity_history`].
pub const MAX_HISTORY_LIMIT: usize = 500;

/// Clamps a requested history page size to `1..=MAX_HISTORY_LIMIT`.
#[must_use]
pub fn clamp_history_limit(limit: usize) -> usize {
    limit.clamp(1, MAX_HISTORY_LIMIT)
}

// ---------------------------------------------------------------------------
// Customization seams
// ---------------------------------------------------------------------------

/// Host hook stamping contextual values onto each materialized record.
pub trait AuditEnrichment: Send + Sync {
    /// Fills enrichment values and may adjust per-property merge eligibility.
    fn enrich(&self, record: &mut AuditLogRecord, entry: &TrackedEntry);
}

/// Time source for batch timestamps.
pub trait AuditClock: Send + Sync {
    /// Returns the current instant.
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl AuditClock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}
