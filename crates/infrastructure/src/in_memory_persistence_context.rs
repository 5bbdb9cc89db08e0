use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use trailkeep_application::{
    AuditInterceptor, AuditOutcome, ChangeTracker, EntryHandle, FoundRecord, TrackedEntry,
    TrackedState,
};
use trailkeep_core::{AppError, AppResult};
use trailkeep_domain::{EntityModel, FieldKind, FieldValue, FieldValues};


/// Rows shared by every context opened on the same database.
#[derive(Debug, Default)]
pub struct InMemoryDatabase {
    tables: RwLock<Tables>,
}

#[derive(Debug, Default)]
struct Tables {
    rows: HashMap<String, BTreeMap<String, FieldValues>>,
    sequences: HashMap<String, i64>,
}

impl InMemoryDatabase {
    /// Creates an empty database.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the committed row with the given key.
    pub async fn row(&self, entity_type: &str, key_value: &str) -> Option<FieldValues> {
        self.tables
            .read()
            .await
            .rows
            .get(entity_type)
            .and_then(|rows| rows.get(key_value))
            .cloned()
    }

    /// Returns the number of committed rows of one entity type.
    pub async fn row_count(&self, entity_type: &str) -> usize {
        self.tables
            .read()
            .await
            .rows
            .get(entity_type)
            .map_or(0, BTreeMap::len)
    }

    /// Deletes a committed row, bypassing every context.
    pub async fn delete_row(&self, entity_type: &str, key_value: &str) -> bool {
        self.tables
            .write()
            .await
            .rows
            .get_mut(entity_type)
            .and_then(|rows| rows.remove(key_value))
            .is_some()
    }
}

/// What one save wrote.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SaveOutcome {
    /// Rows inserted, updated or deleted.
    pub rows_written: usize,
    /// Audit records persisted after the write.
    pub audit: AuditOutcome,
}

/// Unit of work over an [`InMemoryDatabase`] with change tracking.
///
/// Serves as the reference host for [`AuditInterceptor`]: original values are
/// captured before the write, and the audit batch is persisted once the rows
/// are committed. An audit failure is returned from the save but leaves the
/// committed rows in place.
pub struct InMemoryPersistenceContext {
    database: Arc<InMemoryDatabase>,
    models: HashMap<String, Arc<EntityModel>>,
    interceptor: Option<AuditInterceptor>,
    audit_suppressed: AtomicBool,
    session: Mutex<Session>,
}

#[derive(Debug, Default)]
struct Session {
    entries: Vec<TrackedEntry>,
    next_handle: u64,
}

impl Session {
    fn track(
        &mut self,
        model: Arc<EntityModel>,
        state: TrackedState,
        original: FieldValues,
        current: FieldValues,
    ) -> EntryHandle {
        self.next_handle += 1;
        let handle = EntryHandle::new(self.next_handle);
        self.entries.push(TrackedEntry {
            handle,
            model,
            state,
            original,
            current,
        });
        handle
    }

    fn entry_mut(&mut self, handle: EntryHandle) -> AppResult<&mut TrackedEntry> {
        self.entries
            .iter_mut()
            .find(|entry| entry.handle == handle)
            .ok_or_else(|| {
                AppError::NotFound(format!("entry {} is not tracked", handle.value()))
            })
    }

    fn forget(&mut self, handle: EntryHandle) {
        self.entries.retain(|entry| entry.handle != handle);
    }
}

enum WriteOp {
    Insert {
        handle: EntryHandle,
        entity_type: String,
        key_value: String,
        values: FieldValues,
    },
    Update {
        handle: EntryHandle,
        entity_type: String,
        key_value: String,
        values: FieldValues,
    },
    Delete {
        handle: EntryHandle,
        entity_type: String,
        key_value: String,
    },
    Vanished {
        handle: EntryHandle,
    },
}

fn lock(session: &Mutex<Session>) -> MutexGuard<'_, Session> {
    session.lock().unwrap_or_else(PoisonError::into_inner)
}

impl InMemoryPersistenceContext {
    /// Opens a context over `database` knowing the given entity models.
    pub fn new(
        database: Arc<InMemoryDatabase>,
        models: impl IntoIterator<Item = Arc<EntityModel>>,
    ) -> Self {
        Self {
            database,
            models: models
                .into_iter()
                .map(|model| (model.name().to_owned(), model))
                .collect(),
            interceptor: None,
            audit_suppressed: AtomicBool::new(false),
            session: Mutex::new(Session::default()),
        }
    }

    /// Audits every save through `interceptor`.
    #[must_use]
    pub fn with_auditing(mut self, interceptor: AuditInterceptor) -> Self {
        self.interceptor = Some(interceptor);
        self
    }

    /// Turns auditing off or on for subsequent saves.
    pub fn suppress_auditing(&self, suppressed: bool) {
        self.audit_suppressed.store(suppressed, Ordering::Relaxed);
    }

    /// Tracks a new row.
    pub fn add(&self, entity_type: &str, values: FieldValues) -> AppResult<EntryHandle> {
        let model = self.require_model(entity_type)?;
        for field in values.keys() {
            require_field(&model, field)?;
        }

        Ok(lock(&self.session).track(model, TrackedState::Added, FieldValues::new(), values))
    }

    /// Loads and tracks a committed row by primary key.
    pub async fn find(
        &self,
        entity_type: &str,
        key: &[FieldValue],
    ) -> AppResult<Option<EntryHandle>> {
        let model = self.require_model(entity_type)?;
        let key_value = key_text(&model, key)?;

        if let Some(handle) = self.tracked_handle(&model, &key_value) {
            return Ok(Some(handle));
        }

        let Some(row) = self.database.row(entity_type, &key_value).await else {
            return Ok(None);
        };
        Ok(Some(lock(&self.session).track(
            model,
            TrackedState::Unchanged,
            row.clone(),
            row,
        )))
    }

    /// Sets one field of a tracked row.
    pub fn update(
        &self,
        handle: EntryHandle,
        field: &str,
        value: impl Into<FieldValue>,
    ) -> AppResult<()> {
        let mut session = lock(&self.session);
        let entry = session.entry_mut(handle)?;
        require_field(&entry.model, field)?;

        match entry.state {
            TrackedState::Deleted | TrackedState::Detached => {
                return Err(AppError::Conflict(format!(
                    "cannot update {} entry {}",
                    entry.model.name(),
                    handle.value()
                )));
            }
            TrackedState::Unchanged => entry.state = TrackedState::Modified,
            TrackedState::Added | TrackedState::Modified => {}
        }

        entry.current.insert(field.to_owned(), value.into());
        Ok(())
    }

    /// Marks a tracked row for deletion; an unsaved row is simply forgotten.
    pub fn remove(&self, handle: EntryHandle) -> AppResult<()> {
        let mut session = lock(&self.session);
        let entry = session.entry_mut(handle)?;

        if entry.state == TrackedState::Added {
            session.forget(handle);
        } else {
            entry.state = TrackedState::Deleted;
        }
        Ok(())
    }

    /// Returns the current values of a tracked row.
    #[must_use]
    pub fn values(&self, handle: EntryHandle) -> Option<FieldValues> {
        lock(&self.session)
            .entries
            .iter()
            .find(|entry| entry.handle == handle)
            .map(|entry| entry.current.clone())
    }

    /// Returns the number of tracked rows.
    #[must_use]
    pub fn tracked_count(&self) -> usize {
        lock(&self.session).entries.len()
    }

    /// Writes every pending change, then persists the audit batch.
    pub async fn save_changes(&self, cancellation: &CancellationToken) -> AppResult<SaveOutcome> {
        let suppressed = self.audit_suppressed.load(Ordering::Relaxed);
        let pending = match &self.interceptor {
            Some(interceptor) => interceptor.saving_changes(self, suppressed).await,
            None => None,
        };

        let rows_written = self.write_changes().await?;

        let audit = match (&self.interceptor, pending) {
            (Some(interceptor), Some(pending)) => {
                interceptor
                    .saved_changes(self, pending, cancellation)
                    .await?
            }
            _ => AuditOutcome::default(),
        };

        Ok(SaveOutcome {
            rows_written,
            audit,
        })
    }

    /// Blocking twin of [`InMemoryPersistenceContext::save_changes`].
    ///
    /// Audit work runs through the interceptor's blocking twins, so the store
    /// is driven on the interceptor's runtime.
    pub fn save_changes_blocking(&self) -> AppResult<SaveOutcome> {
        let suppressed = self.audit_suppressed.load(Ordering::Relaxed);
        let pending = match &self.interceptor {
            Some(interceptor) => interceptor.saving_changes_blocking(self, suppressed)?,
            None => None,
        };

        let rows_written = futures::executor::block_on(self.write_changes())?;

        let audit = match (&self.interceptor, pending) {
            (Some(interceptor), Some(pending)) => {
                interceptor.saved_changes_blocking(self, pending, &CancellationToken::new())?
            }
            _ => AuditOutcome::default(),
        };

        Ok(SaveOutcome {
            rows_written,
            audit,
        })
    }

    fn require_model(&self, entity_type: &str) -> AppResult<Arc<EntityModel>> {
        self.models.get(entity_type).cloned().ok_or_else(|| {
            AppError::Validation(format!("unknown entity type '{entity_type}'"))
        })
    }

    fn tracked_handle(&self, model: &EntityModel, key_value: &str) -> Option<EntryHandle> {
        lock(&self.session)
            .entries
            .iter()
            .find(|entry| {
                entry.model.name() == model.name()
                    && entry.state != TrackedState::Added
                    && model.key_value(&entry.original).as_deref() == Some(key_value)
            })
            .map(|entry| entry.handle)
    }

    async fn write_changes(&self) -> AppResult<usize> {
        let entries = lock(&self.session).entries.clone();
        let mut tables = self.database.tables.write().await;

        let mut operations = Vec::new();
        for entry in entries {
            let entity_type = entry.model.name().to_owned();
            match entry.state {
                TrackedState::Added => {
                    let mut values = entry.current;
                    assign_generated_key(&mut tables, &entry.model, &mut values);
                    let key_value = require_key(&entry.model, &values)?;
                    if tables
                        .rows
                        .get(&entity_type)
                        .is_some_and(|rows| rows.contains_key(&key_value))
                    {
                        return Err(AppError::Conflict(format!(
                            "{entity_type} '{key_value}' already exists"
                        )));
                    }
                    operations.push(WriteOp::Insert {
                        handle: entry.handle,
                        entity_type,
                        key_value,
                        values,
                    });
                }
                TrackedState::Modified => {
                    let key_value = require_key(&entry.model, &entry.original)?;
                    let exists = tables
                        .rows
                        .get(&entity_type)
                        .is_some_and(|rows| rows.contains_key(&key_value));
                    if exists {
                        operations.push(WriteOp::Update {
                            handle: entry.handle,
                            entity_type,
                            key_value,
                            values: entry.current,
                        });
                    } else {
                        debug!(
                            entity_type = %entity_type,
                            key_value = %key_value,
                            "row vanished before update, detaching entry"
                        );
                        operations.push(WriteOp::Vanished {
                            handle: entry.handle,
                        });
                    }
                }
                TrackedState::Deleted => {
                    let key_value = require_key(&entry.model, &entry.original)?;
                    operations.push(WriteOp::Delete {
                        handle: entry.handle,
                        entity_type,
                        key_value,
                    });
                }
                TrackedState::Unchanged | TrackedState::Detached => {}
            }
        }

        let mut session = lock(&self.session);
        let mut written = 0;
        for operation in operations {
            match operation {
                WriteOp::Insert {
                    handle,
                    entity_type,
                    key_value,
                    values,
                }
                | WriteOp::Update {
                    handle,
                    entity_type,
                    key_value,
                    values,
                } => {
                    tables
                        .rows
                        .entry(entity_type)
                        .or_default()
                        .insert(key_value, values.clone());
                    if let Ok(entry) = session.entry_mut(handle) {
                        entry.state = TrackedState::Unchanged;
                        entry.original = values.clone();
                        entry.current = values;
                    }
                    written += 1;
                }
                WriteOp::Delete {
                    handle,
                    entity_type,
                    key_value,
                } => {
                    if let Some(rows) = tables.rows.get_mut(&entity_type) {
                        rows.remove(&key_value);
                    }
                    session.forget(handle);
                    written += 1;
                }
                WriteOp::Vanished { handle } => session.forget(handle),
            }
        }

        Ok(written)
    }
}

#[async_trait]
impl ChangeTracker for InMemoryPersistenceContext {
    fn tracked_entries(&self) -> Vec<TrackedEntry> {
        lock(&self.session).entries.clone()
    }

    fn entry(&self, handle: EntryHandle) -> Option<TrackedEntry> {
        lock(&self.session)
            .entries
            .iter()
            .find(|entry| entry.handle == handle)
            .cloned()
    }

    fn model(&self, entity_type: &str) -> Option<Arc<EntityModel>> {
        self.models.get(entity_type).cloned()
    }

    async fn find_by_key(
        &self,
        entity_type: &str,
        key: &[FieldValue],
    ) -> AppResult<Option<FoundRecord>> {
        let Some(model) = self.models.get(entity_type).cloned() else {
            return Ok(None);
        };
        let key_value = key_text(&model, key)?;

        if let Some(handle) = self.tracked_handle(&model, &key_value) {
            return Ok(self.entry(handle).map(|entry| FoundRecord {
                handle,
                model: entry.model,
                original: entry.original,
                current: entry.current,
                newly_attached: false,
            }));
        }

        let Some(row) = self.database.row(entity_type, &key_value).await else {
            return Ok(None);
        };
        let handle = lock(&self.session).track(
            Arc::clone(&model),
            TrackedState::Unchanged,
            row.clone(),
            row.clone(),
        );

        Ok(Some(FoundRecord {
            handle,
            model,
            original: row.clone(),
            current: row,
            newly_attached: true,
        }))
    }

    fn release(&self, found: &FoundRecord) {
        let mut session = lock(&self.session);
        let unchanged = session
            .entries
            .iter()
            .any(|entry| entry.handle == found.handle && entry.state == TrackedState::Unchanged);
        if unchanged {
            session.forget(found.handle);
        }
    }
}

fn require_field(model: &EntityModel, field: &str) -> AppResult<()> {
    model.field(field).map(|_| ()).ok_or_else(|| {
        AppError::Validation(format!("{} has no field '{field}'", model.name()))
    })
}

fn require_key(model: &EntityModel, values: &FieldValues) -> AppResult<String> {
    model.key_value(values).ok_or_else(|| {
        AppError::Validation(format!("{} has no primary key", model.name()))
    })
}

fn key_text(model: &EntityModel, key: &[FieldValue]) -> AppResult<String> {
    if key.len() != model.primary_key().len() {
        return Err(AppError::Validation(format!(
            "{} key needs {} values, got {}",
            model.name(),
            model.primary_key().len(),
            key.len()
        )));
    }

    let values = model
        .primary_key()
        .iter()
        .cloned()
        .zip(key.iter().cloned())
        .collect::<FieldValues>();
    require_key(model, &values)
}

/// Fills a single integer primary key left empty or zero from the entity's sequence.
fn assign_generated_key(tables: &mut Tables, model: &EntityModel, values: &mut FieldValues) {
    let [key_field] = model.primary_key() else {
        return;
    };
    if model
        .field(key_field)
        .is_none_or(|field| field.kind() != FieldKind::Integer)
    {
        return;
    }
    let needs_key = values
        .get(key_field)
        .is_none_or(|value| value.is_null() || value.is_zero_value());
    if !needs_key {
        return;
    }

    let taken = tables.rows.get(model.name());
    let sequence = tables.sequences.entry(model.name().to_owned()).or_insert(0);
    loop {
        *sequence += 1;
        let candidate = sequence.to_string();
        if !taken.is_some_and(|rows| rows.contains_key(&candidate)) {
            break;
        }
    }
    values.insert(key_field.clone(), FieldValue::Integer(*sequence));
}
