//! Save-lifecycle audit pipeline.
//!
//! `saving_changes` runs before the host writes and captures original values.
//! `saved_changes` runs after the host commits, fills in new values and
//! persists the batch. The audit write never rolls back the host write: a
//! persistence failure is returned to the caller after the primary data is
//! already committed.

use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::runtime::{Handle, RuntimeFlavor};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use trailkeep_core::{AppError, AppResult};
use trailkeep_domain::{
    AuditEntryState, AuditLogProperty, AuditLogRecord, AuditSchema, EntityModel, FieldModel,
    FieldValues, ReferenceModel,
};

use crate::{
    AuditClock, AuditConfiguration, AuditEnrichment, AuditLogStore, AuditOptions, ChangeTracker,
    DescriptionMode, EntryHandle, PropertyDescriptionMode, SystemClock, TrackedEntry,
    TrackedState,
};

mod capture;
mod descriptions;
mod finalize;
mod materialize;
mod persistence;

#[cfg(test)]
mod tests;

/// One changed field of a pending entry, rendered for storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeProperty {
    /// Field name.
    pub field_name: String,
    /// Whether the field is part of the primary key.
    pub is_key: bool,
    /// Rendered value before the write.
    pub old_value: Option<String>,
    /// Rendered value after the write.
    pub new_value: Option<String>,
    /// Referenced record label before the write.
    pub old_description: Option<String>,
    /// Referenced record label after the write.
    pub new_description: Option<String>,
}

impl ChangeProperty {
    fn new(field: &FieldModel, old_value: Option<String>, new_value: Option<String>) -> Self {
        Self {
            field_name: field.name().to_owned(),
            is_key: field.is_primary_key(),
            old_value,
            new_value,
            old_description: None,
            new_description: None,
        }
    }
}

/// One audited record of a pending save.
#[derive(Debug, Clone)]
pub struct ChangeEntry {
    handle: EntryHandle,
    model: Arc<EntityModel>,
    state: AuditEntryState,
    properties: Vec<ChangeProperty>,
    snapshot: TrackedEntry,
    changed_references: BTreeSet<String>,
    reclassified: bool,
}

impl ChangeEntry {
    /// Returns the tracker handle.
    #[must_use]
    pub fn handle(&self) -> EntryHandle {
        self.handle
    }

    /// Returns the audited entity type name.
    #[must_use]
    pub fn entity_type(&self) -> &str {
        self.model.name()
    }

    /// Returns the change state.
    #[must_use]
    pub fn state(&self) -> AuditEntryState {
        self.state
    }

    /// Returns captured properties.
    #[must_use]
    pub fn properties(&self) -> &[ChangeProperty] {
        &self.properties
    }

    /// Returns whether a modified record vanished during the write.
    #[must_use]
    pub fn was_reclassified(&self) -> bool {
        self.reclassified
    }

    fn property_mut(&mut self, field_name: &str) -> Option<&mut ChangeProperty> {
        self.properties
            .iter_mut()
            .find(|property| property.field_name == field_name)
    }
}

/// The audit batch of one save, from capture until persistence.
///
/// Owned by the save that created it and consumed by `saved_changes`.
#[derive(Debug)]
pub struct PendingAudit {
    entries: Vec<ChangeEntry>,
}

impl PendingAudit {
    /// Returns the captured entries.
    #[must_use]
    pub fn entries(&self) -> &[ChangeEntry] {
        &self.entries
    }

    /// Returns whether nothing was captured.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// What happened to one persisted batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AuditOutcome {
    /// Records materialized from the batch.
    pub records: usize,
    /// Records sent through the merge path.
    pub merged: u64,
    /// Records inserted without merging.
    pub inserted: u64,
}

/// Lifecycle adapter the host calls around each save.
#[derive(Clone)]
pub struct AuditInterceptor {
    configuration: Arc<AuditConfiguration>,
    options: AuditOptions,
    store: Arc<dyn AuditLogStore>,
    enrichment: Option<Arc<dyn AuditEnrichment>>,
    clock: Arc<dyn AuditClock>,
    runtime: Option<Handle>,
}

impl AuditInterceptor {
    /// Creates an interceptor writing to `store`.
    #[must_use]
    pub fn new(
        configuration: AuditConfiguration,
        options: AuditOptions,
        store: Arc<dyn AuditLogStore>,
    ) -> Self {
        Self {
            configuration: Arc::new(configuration),
            options,
            store,
            enrichment: None,
            clock: Arc::new(SystemClock),
            runtime: Handle::try_current().ok(),
        }
    }

    /// Installs an enrichment hook.
    #[must_use]
    pub fn with_enrichment(mut self, enrichment: Arc<dyn AuditEnrichment>) -> Self {
        self.enrichment = Some(enrichment);
        self
    }

    /// Replaces the batch clock.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn AuditClock>) -> Self {
        self.clock = clock;
        self
    }

    /// Sets the runtime the blocking twins drive the store on from threads
    /// outside any runtime.
    ///
    /// Defaults to the runtime current when the interceptor was created.
    #[must_use]
    pub fn with_runtime(mut self, runtime: Handle) -> Self {
        self.runtime = Some(runtime);
        self
    }

    /// Returns the runtime options.
    #[must_use]
    pub fn options(&self) -> &AuditOptions {
        &self.options
    }

    /// Captures original values before the host write.
    ///
    /// Returns `None` when auditing is suppressed for this save.
    pub async fn saving_changes(
        &self,
        tracker: &dyn ChangeTracker,
        suppress: bool,
    ) -> Option<PendingAudit> {
        if suppress {
            debug!("audit suppressed for this save");
            return None;
        }

        let mut entries = capture::capture_entries(&self.configuration, tracker);
        if self.options.property_description_mode == PropertyDescriptionMode::ForeignKeyLabel {
            descriptions::resolve_old_descriptions(tracker, &mut entries).await;
        }

        debug!(entries = entries.len(), "captured audit entries");
        Some(PendingAudit { entries })
    }

    /// Finalizes and persists a batch after the host write committed.
    pub async fn saved_changes(
        &self,
        tracker: &dyn ChangeTracker,
        pending: PendingAudit,
        cancellation: &CancellationToken,
    ) -> AppResult<AuditOutcome> {
        let mut entries = pending.entries;
        finalize::finalize_entries(&self.configuration, tracker, &mut entries);
        if self.options.property_description_mode == PropertyDescriptionMode::ForeignKeyLabel {
            descriptions::resolve_new_descriptions(tracker, &mut entries).await;
        }

        let timestamp = self.clock.now();
        let records = self.materialize(entries, timestamp);
        self.persist(records, cancellation).await
    }

    /// Blocking twin of [`AuditInterceptor::saving_changes`].
    ///
    /// Fails inside a current-thread runtime, which cannot be blocked without
    /// stalling the store it would drive.
    pub fn saving_changes_blocking(
        &self,
        tracker: &dyn ChangeTracker,
        suppress: bool,
    ) -> AppResult<Option<PendingAudit>> {
        self.block_on(self.saving_changes(tracker, suppress))
    }

    /// Blocking twin of [`AuditInterceptor::saved_changes`].
    pub fn saved_changes_blocking(
        &self,
        tracker: &dyn ChangeTracker,
        pending: PendingAudit,
        cancellation: &CancellationToken,
    ) -> AppResult<AuditOutcome> {
        self.block_on(self.saved_changes(tracker, pending, cancellation))?
    }

    /// Runs `future` to completion on the calling thread.
    ///
    /// Inside a multi-thread runtime the worker is handed off with
    /// `block_in_place`. Outside any runtime the configured runtime drives the
    /// future, and without one a local executor does, which suits only stores
    /// that need no reactor.
    pub fn block_on<F: Future>(&self, future: F) -> AppResult<F::Output> {
        match Handle::try_current() {
            Ok(current) if current.runtime_flavor() == RuntimeFlavor::MultiThread => {
                Ok(tokio::task::block_in_place(|| current.block_on(future)))
            }
            Ok(_) => Err(AppError::Conflict(
                "blocking audit save cannot run inside a current-thread runtime".to_owned(),
            )),
            Err(_) => Ok(match &self.runtime {
                Some(runtime) => runtime.block_on(future),
                None => futures::executor::block_on(future),
            }),
        }
    }
}
