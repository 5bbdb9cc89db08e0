use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use tokio::sync::RwLock;

use trailkeep_application::{AuditLogReader, AuditLogStore, clamp_history_limit};
use trailkeep_core::{AppError, AppResult};
use trailkeep_domain::{AuditLogRecord, AuditSchema, can_extend};

/// In-memory audit log store.
///
/// Applies the same merge rule as the generated PostgreSQL routine, one
/// incoming record at a time.
#[derive(Debug)]
pub struct InMemoryAuditLogStore {
    schema: AuditSchema,
    supports_merge: bool,
    state: RwLock<StoreState>,
}

#[derive(Debug, Default)]
struct StoreState {
    records: Vec<AuditLogRecord>,
    next_record_id: i64,
    next_property_id: i64,
}

impl StoreState {
    fn push(&mut self, record: &AuditLogRecord) {
        self.next_record_id += 1;
        let record_id = self.next_record_id;

        let mut stored = record.clone();
        stored.id = Some(record_id);
        for property in &mut stored.properties {
            self.next_property_id += 1;
            property.id = Some(self.next_property_id);
            property.parent_id = Some(record_id);
        }
        self.records.push(stored);
    }

    fn assign_property_ids(&mut self, index: usize) {
        let Some(record) = self.records.get_mut(index) else {
            return;
        };
        for property in &mut record.properties {
            if property.id.is_none() {
                self.next_property_id += 1;
                property.id = Some(self.next_property_id);
                property.parent_id = record.id;
            }
        }
    }
}

impl InMemoryAuditLogStore {
    /// Creates an empty merge-capable store for the standard schema.
    #[must_use]
    pub fn new() -> Self {
        Self::with_schema(AuditSchema::standard())
    }

    /// Creates an empty merge-capable store for `schema`.
    #[must_use]
    pub fn with_schema(schema: AuditSchema) -> Self {
        Self {
            schema,
            supports_merge: true,
            state: RwLock::new(StoreState::default()),
        }
    }

    /// Creates a store that cannot merge, so every record is inserted.
    #[must_use]
    pub fn append_only() -> Self {
        Self {
            supports_merge: false,
            ..Self::new()
        }
    }

    /// Returns every stored record in insertion order.
    pub async fn records(&self) -> Vec<AuditLogRecord> {
        self.state.read().await.records.clone()
    }
}

impl Default for InMemoryAuditLogStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AuditLogStore for InMemoryAuditLogStore {
    fn schema(&self) -> &AuditSchema {
        &self.schema
    }

    fn supports_merge(&self) -> bool {
        self.supports_merge
    }

    async fn merge_records(
        &self,
        records: &[AuditLogRecord],
        window: Duration,
    ) -> AppResult<u64> {
        if !self.supports_merge {
            return Err(AppError::Conflict(
                "append-only audit store cannot merge records".to_owned(),
            ));
        }
        let window = TimeDelta::from_std(window).map_err(|error| {
            AppError::Validation(format!("invalid merge window {window:?}: {error}"))
        })?;

        let mut state = self.state.write().await;
        for incoming in records {
            let newest = state.records.iter().rposition(|existing| {
                existing.entity_type == incoming.entity_type
                    && existing.key_value.is_some()
                    && existing.key_value == incoming.key_value
            });

            let extendable = newest.filter(|index| {
                can_extend(&state.records[*index], incoming, &self.schema, window)
            });
            match extendable {
                Some(index) => {
                    state.records[index].absorb(incoming);
                    state.assign_property_ids(index);
                }
                None => state.push(incoming),
            }
        }

        Ok(u64::try_from(records.len()).unwrap_or(u64::MAX))
    }

    async fn insert_records(&self, records: &[AuditLogRecord]) -> AppResult<u64> {
        let mut state = self.state.write().await;
        for record in records {
            state.push(record);
        }

        Ok(u64::try_from(records.len()).unwrap_or(u64::MAX))
    }
}

#[async_trait]
impl AuditLogReader for InMemoryAuditLogStore {
    async fn list_entity_history(
        &self,
        entity_type: &str,
        key_value: &str,
        limit: usize,
    ) -> AppResult<Vec<AuditLogRecord>> {
        let state = self.state.read().await;

        Ok(state
            .records
            .iter()
            .rev()
            .filter(|record| {
                record.entity_type == entity_type && record.key_value.as_deref() == Some(key_value)
            })
            .take(clamp_history_limit(limit))
            .map(|record| {
                let mut record = record.clone();
                record
                    .properties
                    .sort_by(|left, right| left.field_name.cmp(&right.field_name));
                record
            })
            .collect())
    }

    async fn purge_older_than(&self, cutoff: DateTime<Utc>) -> AppResult<u64> {
        let mut state = self.state.write().await;
        let before = state.records.len();
        state.records.retain(|record| record.timestamp >= cutoff);

        Ok(u64::try_from(before - state.records.len()).unwrap_or(u64::MAX))
    }
}
