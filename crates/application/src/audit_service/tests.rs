use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use trailkeep_core::{AppError, AppResult};
use trailkeep_domain::{
    AuditContext, AuditEntryState, AuditLogRecord, AuditSchema, EntityModel, FieldKind,
    FieldValue, FieldValues, LabelError,
};

use crate::{
    AuditClock, AuditConfiguration, AuditEnrichment, AuditLogStore, AuditOptions, AuditOutcome,
    ChangeTracker, DescriptionMode, EntryHandle, FoundRecord, TrackedEntry, TrackedState,
};

use super::AuditInterceptor;

fn lock<T>(mutex: &StdMutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn fixed_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 1, 2, 3, 4, 5)
        .single()
        .unwrap_or_default()
}

struct ManualClock(DateTime<Utc>);

impl AuditClock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        self.0
    }
}

struct FakeStore {
    schema: AuditSchema,
    supports_merge: bool,
    failure: Option<String>,
    stall: bool,
    cancel_after_merge: Option<CancellationToken>,
    merged: Mutex<Vec<AuditLogRecord>>,
    inserted: Mutex<Vec<AuditLogRecord>>,
}

impl FakeStore {
    fn new(supports_merge: bool) -> Self {
        Self {
            schema: AuditSchema::standard(),
            supports_merge,
            failure: None,
            stall: false,
            cancel_after_merge: None,
            merged: Mutex::new(Vec::new()),
            inserted: Mutex::new(Vec::new()),
        }
    }

    fn failing(message: &str) -> Self {
        Self {
            failure: Some(message.to_owned()),
            ..Self::new(true)
        }
    }

    fn stalled() -> Self {
        Self {
            stall: true,
            ..Self::new(true)
        }
    }

    fn cancelling_after_merge(cancellation: &CancellationToken) -> Self {
        Self {
            cancel_after_merge: Some(cancellation.clone()),
            ..Self::new(true)
        }
    }

    async fn merged(&self) -> Vec<AuditLogRecord> {
        self.merged.lock().await.clone()
    }

    async fn inserted(&self) -> Vec<AuditLogRecord> {
        self.inserted.lock().await.clone()
    }

    async fn check(&self) -> AppResult<()> {
        if self.stall {
            std::future::pending::<()>().await;
        }
        if let Some(message) = &self.failure {
            return Err(AppError::Internal(message.clone()));
        }
        Ok(())
    }
}

#[async_trait]
impl AuditLogStore for FakeStore {
    fn schema(&self) -> &AuditSchema {
        &self.schema
    }

    fn supports_merge(&self) -> bool {
        self.supports_merge
    }

    async fn merge_records(
        &self,
        records: &[AuditLogRecord],
        _window: Duration,
    ) -> AppResult<u64> {
        self.check().await?;
        self.merged.lock().await.extend(records.iter().cloned());
        if let Some(cancellation) = &self.cancel_after_merge {
            cancellation.cancel();
        }
        Ok(records.len() as u64)
    }

    async fn insert_records(&self, records: &[AuditLogRecord]) -> AppResult<u64> {
        self.check().await?;
        self.inserted.lock().await.extend(records.iter().cloned());
        Ok(records.len() as u64)
    }
}

struct FakeTracker {
    models: HashMap<String, Arc<EntityModel>>,
    entries: StdMutex<Vec<TrackedEntry>>,
    rows: HashMap<(String, String), FieldValues>,
    lookups: StdMutex<usize>,
    released: StdMutex<usize>,
}

impl FakeTracker {
    fn new(models: &[&Arc<EntityModel>], entries: Vec<TrackedEntry>) -> Self {
        Self {
            models: models
                .iter()
                .map(|model| (model.name().to_owned(), Arc::clone(model)))
                .collect(),
            entries: StdMutex::new(entries),
            rows: HashMap::new(),
            lookups: StdMutex::new(0),
            released: StdMutex::new(0),
        }
    }

    fn with_row(mut self, model: &Arc<EntityModel>, row: FieldValues) -> Self {
        let key = model.key_value(&row).unwrap_or_default();
        self.rows.insert((model.name().to_owned(), key), row);
        self
    }

    fn replace_entries(&self, entries: Vec<TrackedEntry>) {
        *lock(&self.entries) = entries;
    }

    fn lookups(&self) -> usize {
        *lock(&self.lookups)
    }

    fn released(&self) -> usize {
        *lock(&self.released)
    }
}

#[async_trait]
impl ChangeTracker for FakeTracker {
    fn tracked_entries(&self) -> Vec<TrackedEntry> {
        lock(&self.entries).clone()
    }

    fn entry(&self, handle: EntryHandle) -> Option<TrackedEntry> {
        lock(&self.entries)
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
        *lock(&self.lookups) += 1;
        let key = key
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(";");

        let Some(model) = self.models.get(entity_type) else {
            return Ok(None);
        };
        Ok(self
            .rows
            .get(&(entity_type.to_owned(), key))
            .map(|values| FoundRecord {
                handle: EntryHandle::new(1_000),
                model: Arc::clone(model),
                original: values.clone(),
                current: values.clone(),
                newly_attached: true,
            }))
    }

    fn release(&self, _found: &FoundRecord) {
        *lock(&self.released) += 1;
    }
}

struct ActingUser {
    user_id: Uuid,
    disable_merging: bool,
}

impl AuditEnrichment for ActingUser {
    fn enrich(&self, record: &mut AuditLogRecord, _entry: &TrackedEntry) {
        record.context = AuditContext::with_acting_user(self.user_id);
        if self.disable_merging {
            for property in &mut record.properties {
                property.can_merge = false;
            }
        }
    }
}

fn widget_model() -> Arc<EntityModel> {
    let model = EntityModel::builder("Widget")
        .and_then(|builder| builder.field("Id", FieldKind::Integer))
        .and_then(|builder| builder.nullable_field("Name", FieldKind::Text))
        .and_then(|builder| builder.nullable_field("Color", FieldKind::Text))
        .and_then(|builder| builder.field("Count", FieldKind::Integer))
        .and_then(|builder| builder.field("Price", FieldKind::Decimal))
        .and_then(|builder| builder.field("Active", FieldKind::Boolean))
        .and_then(|builder| builder.nullable_field("Secret", FieldKind::Text))
        .map(|builder| builder.primary_key(["Id"]).label_field("Name"))
        .and_then(|builder| builder.build())
        .unwrap_or_else(|_| unreachable!());
    Arc::new(model)
}

fn customer_model() -> Arc<EntityModel> {
    let model = EntityModel::builder("Customer")
        .and_then(|builder| builder.field("Id", FieldKind::Integer))
        .and_then(|builder| builder.nullable_field("Name", FieldKind::Text))
        .map(|builder| builder.primary_key(["Id"]).label_field("Name"))
        .and_then(|builder| builder.build())
        .unwrap_or_else(|_| unreachable!());
    Arc::new(model)
}

fn order_model() -> Arc<EntityModel> {
    let model = EntityModel::builder("Order")
        .and_then(|builder| builder.field("Id", FieldKind::Integer))
        .and_then(|builder| builder.nullable_field("CustomerId", FieldKind::Integer))
        .and_then(|builder| builder.nullable_field("Notes", FieldKind::Text))
        .map(|builder| builder.primary_key(["Id"]))
        .and_then(|builder| builder.reference("Customer", "Customer", ["CustomerId"]))
        .and_then(|builder| builder.build())
        .unwrap_or_else(|_| unreachable!());
    Arc::new(model)
}

fn values(pairs: &[(&str, FieldValue)]) -> FieldValues {
    pairs
        .iter()
        .map(|(name, value)| ((*name).to_owned(), value.clone()))
        .collect()
}

fn with(mut row: FieldValues, field: &str, value: FieldValue) -> FieldValues {
    row.insert(field.to_owned(), value);
    row
}

fn widget_row(id: i64, name: &str) -> FieldValues {
    values(&[
        ("Id", id.into()),
        ("Name", name.into()),
        ("Color", "Red".into()),
        ("Count", 3_i64.into()),
        ("Price", 1.5.into()),
        ("Active", true.into()),
        ("Secret", "s".into()),
    ])
}

fn tracked(
    handle: u64,
    model: &Arc<EntityModel>,
    state: TrackedState,
    original: FieldValues,
    current: FieldValues,
) -> TrackedEntry {
    TrackedEntry {
        handle: EntryHandle::new(handle),
        model: Arc::clone(model),
        state,
        original,
        current,
    }
}

fn interceptor(
    configuration: AuditConfiguration,
    options: AuditOptions,
    store: &Arc<FakeStore>,
) -> AuditInterceptor {
    AuditInterceptor::new(configuration, options, store.clone())
        .with_clock(Arc::new(ManualClock(fixed_time())))
}

async fn run_save(
    interceptor: &AuditInterceptor,
    tracker: &FakeTracker,
    after: Vec<TrackedEntry>,
) -> AppResult<AuditOutcome> {
    let pending = interceptor
        .saving_changes(tracker, false)
        .await
        .unwrap_or_else(|| unreachable!());
    tracker.replace_entries(after);
    interceptor
        .saved_changes(tracker, pending, &CancellationToken::new())
        .await
}

#[tokio::test]
async fn modified_records_capture_only_changed_audited_fields() {
    let widget = widget_model();
    let before = widget_row(1, "A");
    let after = with(with(before.clone(), "Name", "B".into()), "Secret", "t".into());
    let tracker = FakeTracker::new(
        &[&widget],
        vec![tracked(1, &widget, TrackedState::Modified, before, after.clone())],
    );
    let store = Arc::new(FakeStore::new(true));
    let interceptor = interceptor(
        AuditConfiguration::new().exclude_fields("Widget", ["Secret"]),
        AuditOptions::default(),
        &store,
    );

    let outcome = run_save(
        &interceptor,
        &tracker,
        vec![tracked(1, &widget, TrackedState::Unchanged, after.clone(), after)],
    )
    .await;

    assert_eq!(
        outcome.ok(),
        Some(AuditOutcome {
            records: 1,
            merged: 1,
            inserted: 0
        })
    );
    let merged = store.merged().await;
    assert_eq!(merged.len(), 1);
    assert_eq!(merged[0].key_value.as_deref(), Some("1"));
    assert_eq!(merged[0].sorted_field_names(), vec!["Name"]);
    assert_eq!(merged[0].properties[0].old_value.as_deref(), Some("A"));
    assert_eq!(merged[0].properties[0].new_value.as_deref(), Some("B"));
}

#[tokio::test]
async fn added_records_skip_zero_values_and_nulls() {
    let widget = widget_model();
    let pending_row = values(&[
        ("Id", 0_i64.into()),
        ("Name", "A".into()),
        ("Color", FieldValue::Null),
        ("Count", 0_i64.into()),
        ("Price", 0.0.into()),
        ("Active", false.into()),
    ]);
    let saved_row = with(pending_row.clone(), "Id", 7_i64.into());

    for (keep_defaults, expected) in [
        (false, vec!["Id", "Name"]),
        (true, vec!["Active", "Count", "Id", "Name", "Price"]),
    ] {
        let tracker = FakeTracker::new(
            &[&widget],
            vec![tracked(
                1,
                &widget,
                TrackedState::Added,
                FieldValues::new(),
                pending_row.clone(),
            )],
        );
        let store = Arc::new(FakeStore::new(true));
        let interceptor = interceptor(
            AuditConfiguration::new().include_added_default_values(keep_defaults),
            AuditOptions::default(),
            &store,
        );

        let outcome = run_save(
            &interceptor,
            &tracker,
            vec![tracked(
                1,
                &widget,
                TrackedState::Unchanged,
                saved_row.clone(),
                saved_row.clone(),
            )],
        )
        .await;

        assert!(outcome.is_ok());
        let inserted = store.inserted().await;
        assert_eq!(inserted.len(), 1);
        assert_eq!(inserted[0].state, AuditEntryState::Added);
        assert_eq!(inserted[0].key_value.as_deref(), Some("7"));
        assert_eq!(inserted[0].sorted_field_names(), expected);
        assert!(
            inserted[0]
                .properties
                .iter()
                .all(|property| property.old_value.is_none())
        );
    }
}

#[tokio::test]
async fn changes_limited_to_excluded_fields_are_dropped() {
    let widget = widget_model();
    let before = widget_row(1, "A");
    let after = with(before.clone(), "Secret", "t".into());
    let tracker = FakeTracker::new(
        &[&widget],
        vec![tracked(1, &widget, TrackedState::Modified, before, after.clone())],
    );
    let store = Arc::new(FakeStore::new(true));
    let interceptor = interceptor(
        AuditConfiguration::new().exclude_fields("Widget", ["Secret"]),
        AuditOptions::default(),
        &store,
    );

    let outcome = run_save(
        &interceptor,
        &tracker,
        vec![tracked(1, &widget, TrackedState::Unchanged, after.clone(), after)],
    )
    .await;

    assert_eq!(outcome.ok(), Some(AuditOutcome::default()));
    assert!(store.merged().await.is_empty());
    assert!(store.inserted().await.is_empty());
}

#[tokio::test]
async fn modified_record_detached_during_save_keeps_only_key() {
    let widget = widget_model();
    let before = widget_row(1, "A");
    let after = with(before.clone(), "Name", "B".into());
    let tracker = FakeTracker::new(
        &[&widget],
        vec![tracked(1, &widget, TrackedState::Modified, before, after)],
    );
    let store = Arc::new(FakeStore::new(true));
    let interceptor = interceptor(AuditConfiguration::new(), AuditOptions::default(), &store);

    let outcome = run_save(&interceptor, &tracker, Vec::new()).await;

    assert!(outcome.is_ok());
    let inserted = store.inserted().await;
    assert_eq!(inserted.len(), 1);
    assert_eq!(inserted[0].state, AuditEntryState::Deleted);
    assert_eq!(inserted[0].sorted_field_names(), vec!["Id"]);
    assert_eq!(inserted[0].properties[0].old_value.as_deref(), Some("1"));
    assert_eq!(inserted[0].properties[0].new_value, None);
}

#[tokio::test]
async fn values_rendering_identically_are_not_changes() {
    let widget = widget_model();
    let before = with(widget_row(1, "A"), "Price", 1.2.into());
    let after = with(before.clone(), "Price", 1.4.into());
    let tracker = FakeTracker::new(
        &[&widget],
        vec![tracked(1, &widget, TrackedState::Modified, before, after.clone())],
    );
    let store = Arc::new(FakeStore::new(true));
    let configuration =
        AuditConfiguration::new().format_kind(FieldKind::Decimal, |value| match value {
            FieldValue::Decimal(amount) => format!("{amount:.0}"),
            other => other.to_string(),
        });
    let interceptor = interceptor(configuration, AuditOptions::default(), &store);

    let outcome = run_save(
        &interceptor,
        &tracker,
        vec![tracked(1, &widget, TrackedState::Unchanged, after.clone(), after)],
    )
    .await;

    assert_eq!(outcome.ok(), Some(AuditOutcome::default()));
    assert!(store.merged().await.is_empty());
}

#[tokio::test]
async fn foreign_key_changes_carry_old_and_new_labels() {
    let customer = customer_model();
    let order = order_model();
    let before = values(&[
        ("Id", 5_i64.into()),
        ("CustomerId", 1_i64.into()),
        ("Notes", "n".into()),
    ]);
    let after = with(before.clone(), "CustomerId", 2_i64.into());
    let tracker = FakeTracker::new(
        &[&customer, &order],
        vec![tracked(1, &order, TrackedState::Modified, before, after.clone())],
    )
    .with_row(
        &customer,
        values(&[("Id", 1_i64.into()), ("Name", "Contoso".into())]),
    )
    .with_row(
        &customer,
        values(&[("Id", 2_i64.into()), ("Name", "Fabrikam".into())]),
    );
    let store = Arc::new(FakeStore::new(true));
    let interceptor = interceptor(AuditConfiguration::new(), AuditOptions::default(), &store);

    let outcome = run_save(
        &interceptor,
        &tracker,
        vec![tracked(1, &order, TrackedState::Unchanged, after.clone(), after)],
    )
    .await;

    assert!(outcome.is_ok());
    let inserted = store.inserted().await;
    assert_eq!(inserted.len(), 1);
    let property = &inserted[0].properties[0];
    assert_eq!(property.field_name, "CustomerId");
    assert_eq!(property.old_value_description.as_deref(), Some("Contoso"));
    assert_eq!(property.new_value_description.as_deref(), Some("Fabrikam"));
    assert!(!property.can_merge);
    assert_eq!(tracker.lookups(), 2);
    assert_eq!(tracker.released(), 2);
}

#[tokio::test]
async fn label_failures_leave_descriptions_empty() {
    let customer = Arc::new(
        EntityModel::builder("Customer")
            .and_then(|builder| builder.field("Id", FieldKind::Integer))
            .map(|builder| {
                builder
                    .primary_key(["Id"])
                    .computed_label(|_| Err(LabelError("first name missing".to_owned())))
            })
            .and_then(|builder| builder.build())
            .unwrap_or_else(|_| unreachable!()),
    );
    let order = order_model();
    let before = values(&[("Id", 5_i64.into()), ("CustomerId", 1_i64.into())]);
    let after = with(before.clone(), "CustomerId", 2_i64.into());
    let tracker = FakeTracker::new(
        &[&customer, &order],
        vec![tracked(1, &order, TrackedState::Modified, before, after.clone())],
    )
    .with_row(&customer, values(&[("Id", 1_i64.into())]))
    .with_row(&customer, values(&[("Id", 2_i64.into())]));
    let store = Arc::new(FakeStore::new(true));
    let interceptor = interceptor(AuditConfiguration::new(), AuditOptions::default(), &store);

    let outcome = run_save(
        &interceptor,
        &tracker,
        vec![tracked(1, &order, TrackedState::Unchanged, after.clone(), after)],
    )
    .await;

    assert!(outcome.is_ok());
    let inserted = store.inserted().await;
    assert_eq!(inserted.len(), 1);
    assert_eq!(inserted[0].properties[0].old_value_description, None);
    assert_eq!(inserted[0].properties[0].new_value_description, None);
    assert_eq!(tracker.lookups(), 2);
}

#[tokio::test]
async fn unsuitable_references_are_never_looked_up() {
    let customer = customer_model();
    let address = Arc::new(
        EntityModel::builder("Address")
            .and_then(|builder| builder.field("Id", FieldKind::Integer))
            .and_then(|builder| builder.nullable_field("Street", FieldKind::Text))
            .map(|builder| builder.primary_key(["Id"]).label_field("Street").owned())
            .and_then(|builder| builder.build())
            .unwrap_or_else(|_| unreachable!()),
    );
    let tag = Arc::new(
        EntityModel::builder("Tag")
            .and_then(|builder| builder.field("Code", FieldKind::Text))
            .map(|builder| builder.primary_key(["Code"]).label_field("Code"))
            .and_then(|builder| builder.build())
            .unwrap_or_else(|_| unreachable!()),
    );
    let invoice = Arc::new(
        EntityModel::builder("Invoice")
            .and_then(|builder| builder.field("Id", FieldKind::Integer))
            .and_then(|builder| builder.nullable_field("CustomerCode", FieldKind::Text))
            .and_then(|builder| builder.nullable_field("AddressId", FieldKind::Integer))
            .and_then(|builder| builder.nullable_field("TagCode", FieldKind::Text))
            .map(|builder| builder.primary_key(["Id"]))
            .and_then(|builder| {
                builder.alternate_key_reference("Customer", "Customer", ["CustomerCode"])
            })
            .and_then(|builder| builder.reference("Address", "Address", ["AddressId"]))
            .and_then(|builder| builder.reference("Tag", "Tag", ["TagCode"]))
            .and_then(|builder| builder.build())
            .unwrap_or_else(|_| unreachable!()),
    );
    let before = values(&[
        ("Id", 1_i64.into()),
        ("CustomerCode", "C1".into()),
        ("AddressId", 1_i64.into()),
        ("TagCode", "red".into()),
    ]);
    let after = values(&[
        ("Id", 1_i64.into()),
        ("CustomerCode", "C2".into()),
        ("AddressId", 2_i64.into()),
        ("TagCode", "blue".into()),
    ]);
    let tracker = FakeTracker::new(
        &[&customer, &address, &tag, &invoice],
        vec![tracked(1, &invoice, TrackedState::Modified, before, after.clone())],
    );
    let store = Arc::new(FakeStore::new(true));
    let interceptor = interceptor(AuditConfiguration::new(), AuditOptions::default(), &store);

    let outcome = run_save(
        &interceptor,
        &tracker,
        vec![tracked(1, &invoice, TrackedState::Unchanged, after.clone(), after)],
    )
    .await;

    assert!(outcome.is_ok());
    assert_eq!(tracker.lookups(), 0);
    let inserted = store.inserted().await;
    assert_eq!(
        inserted[0].sorted_field_names(),
        vec!["AddressId", "CustomerCode", "TagCode"]
    );
}

#[tokio::test]
async fn deleted_records_snapshot_every_audited_field() {
    let customer = customer_model();
    let order = order_model();
    let row = values(&[
        ("Id", 5_i64.into()),
        ("CustomerId", 1_i64.into()),
        ("Notes", "fragile".into()),
    ]);
    let tracker = FakeTracker::new(
        &[&customer, &order],
        vec![tracked(1, &order, TrackedState::Deleted, row.clone(), row)],
    )
    .with_row(
        &customer,
        values(&[("Id", 1_i64.into()), ("Name", "Contoso".into())]),
    );
    let store = Arc::new(FakeStore::new(true));
    let interceptor = interceptor(AuditConfiguration::new(), AuditOptions::default(), &store);

    let outcome = run_save(&interceptor, &tracker, Vec::new()).await;

    assert!(outcome.is_ok());
    let inserted = store.inserted().await;
    assert_eq!(inserted.len(), 1);
    assert_eq!(inserted[0].state, AuditEntryState::Deleted);
    assert_eq!(
        inserted[0].sorted_field_names(),
        vec!["CustomerId", "Id", "Notes"]
    );
    assert!(
        inserted[0]
            .properties
            .iter()
            .all(|property| property.new_value.is_none())
    );
    let customer_property = inserted[0]
        .properties
        .iter()
        .find(|property| property.field_name == "CustomerId")
        .unwrap_or_else(|| unreachable!());
    assert_eq!(
        customer_property.old_value_description.as_deref(),
        Some("Contoso")
    );
}

#[tokio::test]
async fn record_description_follows_description_mode() {
    let widget = widget_model();
    let before = widget_row(1, "A");
    let after = with(before.clone(), "Name", "B".into());

    for (mode, expected) in [
        (DescriptionMode::Label, Some("B")),
        (DescriptionMode::None, None),
    ] {
        let tracker = FakeTracker::new(
            &[&widget],
            vec![tracked(
                1,
                &widget,
                TrackedState::Modified,
                before.clone(),
                after.clone(),
            )],
        );
        let store = Arc::new(FakeStore::new(true));
        let options = AuditOptions {
            description_mode: mode,
            ..AuditOptions::default()
        };
        let interceptor = interceptor(AuditConfiguration::new(), options, &store);

        let outcome = run_save(
            &interceptor,
            &tracker,
            vec![tracked(
                1,
                &widget,
                TrackedState::Unchanged,
                after.clone(),
                after.clone(),
            )],
        )
        .await;

        assert!(outcome.is_ok());
        assert_eq!(store.merged().await[0].description.as_deref(), expected);
    }
}

#[tokio::test]
async fn suppressed_saves_capture_nothing() {
    let widget = widget_model();
    let row = widget_row(1, "A");
    let tracker = FakeTracker::new(
        &[&widget],
        vec![tracked(1, &widget, TrackedState::Deleted, row.clone(), row)],
    );
    let store = Arc::new(FakeStore::new(true));
    let interceptor = interceptor(AuditConfiguration::new(), AuditOptions::default(), &store);

    assert!(interceptor.saving_changes(&tracker, true).await.is_none());
}

#[tokio::test]
async fn audit_tables_are_never_audited() {
    let audit_log = Arc::new(
        EntityModel::builder("AuditLog")
            .and_then(|builder| builder.table("audit_logs"))
            .and_then(|builder| builder.field("Id", FieldKind::Integer))
            .and_then(|builder| builder.nullable_field("Type", FieldKind::Text))
            .map(|builder| builder.primary_key(["Id"]))
            .and_then(|builder| builder.build())
            .unwrap_or_else(|_| unreachable!()),
    );
    let row = values(&[("Id", 3_i64.into()), ("Type", "Widget".into())]);
    let tracker = FakeTracker::new(
        &[&audit_log],
        vec![tracked(
            1,
            &audit_log,
            TrackedState::Added,
            FieldValues::new(),
            row.clone(),
        )],
    );
    let store = Arc::new(FakeStore::new(true));
    let interceptor = interceptor(AuditConfiguration::new(), AuditOptions::default(), &store);

    let outcome = run_save(
        &interceptor,
        &tracker,
        vec![tracked(1, &audit_log, TrackedState::Unchanged, row.clone(), row)],
    )
    .await;

    assert_eq!(outcome.ok(), Some(AuditOutcome::default()));
}

#[tokio::test]
async fn batch_shares_one_timestamp() {
    let widget = widget_model();
    let first_before = widget_row(1, "A");
    let first_after = with(first_before.clone(), "Name", "B".into());
    let second_before = widget_row(2, "X");
    let second_after = with(second_before.clone(), "Name", "Y".into());
    let tracker = FakeTracker::new(
        &[&widget],
        vec![
            tracked(
                1,
                &widget,
                TrackedState::Modified,
                first_before,
                first_after.clone(),
            ),
            tracked(
                2,
                &widget,
                TrackedState::Modified,
                second_before,
                second_after.clone(),
            ),
        ],
    );
    let store = Arc::new(FakeStore::new(true));
    let interceptor = interceptor(AuditConfiguration::new(), AuditOptions::default(), &store);

    let outcome = run_save(
        &interceptor,
        &tracker,
        vec![
            tracked(
                1,
                &widget,
                TrackedState::Unchanged,
                first_after.clone(),
                first_after,
            ),
            tracked(
                2,
                &widget,
                TrackedState::Unchanged,
                second_after.clone(),
                second_after,
            ),
        ],
    )
    .await;

    assert!(outcome.is_ok());
    let merged = store.merged().await;
    assert_eq!(merged.len(), 2);
    assert!(merged.iter().all(|record| record.timestamp == fixed_time()));
}

#[tokio::test]
async fn enrichment_stamps_context_and_may_disable_merging() {
    let widget = widget_model();
    let before = widget_row(1, "A");
    let after = with(before.clone(), "Name", "B".into());
    let user_id = Uuid::new_v4();
    let tracker = FakeTracker::new(
        &[&widget],
        vec![tracked(1, &widget, TrackedState::Modified, before, after.clone())],
    );
    let store = Arc::new(FakeStore::new(true));
    let interceptor = interceptor(AuditConfiguration::new(), AuditOptions::default(), &store)
        .with_enrichment(Arc::new(ActingUser {
            user_id,
            disable_merging: true,
        }));

    let outcome = run_save(
        &interceptor,
        &tracker,
        vec![tracked(1, &widget, TrackedState::Unchanged, after.clone(), after)],
    )
    .await;

    assert_eq!(
        outcome.ok(),
        Some(AuditOutcome {
            records: 1,
            merged: 0,
            inserted: 1
        })
    );
    let inserted = store.inserted().await;
    assert_eq!(inserted[0].context.acting_user_id(), Some(user_id));
    assert_eq!(
        inserted[0]
            .context
            .get("acting_user_id")
            .and_then(serde_json::Value::as_str),
        Some(user_id.to_string().as_str())
    );
}

#[tokio::test]
async fn discrete_changes_and_disabled_window_bypass_merge_path() {
    let widget = widget_model();
    let before = widget_row(1, "A");
    let toggled = with(before.clone(), "Active", false.into());
    let renamed = with(before.clone(), "Name", "B".into());

    let cases = [
        (toggled, AuditOptions::default()),
        (
            renamed,
            AuditOptions {
                merge_window: Duration::ZERO,
                ..AuditOptions::default()
            },
        ),
    ];
    for (after, options) in cases {
        let tracker = FakeTracker::new(
            &[&widget],
            vec![tracked(
                1,
                &widget,
                TrackedState::Modified,
                before.clone(),
                after.clone(),
            )],
        );
        let store = Arc::new(FakeStore::new(true));
        let interceptor = interceptor(AuditConfiguration::new(), options, &store);

        let outcome = run_save(
            &interceptor,
            &tracker,
            vec![tracked(1, &widget, TrackedState::Unchanged, after.clone(), after)],
        )
        .await;

        assert_eq!(
            outcome.ok(),
            Some(AuditOutcome {
                records: 1,
                merged: 0,
                inserted: 1
            })
        );
    }
}

#[tokio::test]
async fn store_without_merge_support_inserts_everything() {
    let widget = widget_model();
    let before = widget_row(1, "A");
    let after = with(before.clone(), "Name", "B".into());
    let tracker = FakeTracker::new(
        &[&widget],
        vec![tracked(1, &widget, TrackedState::Modified, before, after.clone())],
    );
    let store = Arc::new(FakeStore::new(false));
    let interceptor = interceptor(AuditConfiguration::new(), AuditOptions::default(), &store);

    let outcome = run_save(
        &interceptor,
        &tracker,
        vec![tracked(1, &widget, TrackedState::Unchanged, after.clone(), after)],
    )
    .await;

    assert_eq!(outcome.map(|outcome| outcome.inserted).ok(), Some(1));
    assert!(store.merged().await.is_empty());
}

#[tokio::test]
async fn store_failures_are_returned_to_the_caller() {
    let widget = widget_model();
    let before = widget_row(1, "A");
    let after = with(before.clone(), "Name", "B".into());
    let tracker = FakeTracker::new(
        &[&widget],
        vec![tracked(1, &widget, TrackedState::Modified, before, after.clone())],
    );
    let store = Arc::new(FakeStore::failing("audit table is read-only"));
    let interceptor = interceptor(AuditConfiguration::new(), AuditOptions::default(), &store);

    let outcome = run_save(
        &interceptor,
        &tracker,
        vec![tracked(1, &widget, TrackedState::Unchanged, after.clone(), after)],
    )
    .await;

    assert!(matches!(outcome, Err(AppError::Internal(message)) if message.contains("read-only")));
}

#[tokio::test]
async fn cancellation_aborts_persistence() {
    let widget = widget_model();
    let before = widget_row(1, "A");
    let after = with(before.clone(), "Name", "B".into());
    let tracker = FakeTracker::new(
        &[&widget],
        vec![tracked(1, &widget, TrackedState::Modified, before, after.clone())],
    );
    let store = Arc::new(FakeStore::stalled());
    let interceptor = interceptor(AuditConfiguration::new(), AuditOptions::default(), &store);

    let pending = interceptor
        .saving_changes(&tracker, false)
        .await
        .unwrap_or_else(|| unreachable!());
    tracker.replace_entries(vec![tracked(
        1,
        &widget,
        TrackedState::Unchanged,
        after.clone(),
        after,
    )]);
    let cancellation = CancellationToken::new();
    cancellation.cancel();

    let outcome = interceptor
        .saved_changes(&tracker, pending, &cancellation)
        .await;

    assert!(matches!(outcome, Err(AppError::Cancelled(_))));
}

#[tokio::test]
async fn cancellation_after_the_merge_reports_what_was_written() {
    let widget = widget_model();
    let before = widget_row(1, "A");
    let after = with(before.clone(), "Name", "B".into());
    let added = widget_row(2, "New");
    let tracker = FakeTracker::new(
        &[&widget],
        vec![
            tracked(1, &widget, TrackedState::Modified, before, after.clone()),
            tracked(2, &widget, TrackedState::Added, FieldValues::new(), added.clone()),
        ],
    );
    let cancellation = CancellationToken::new();
    let store = Arc::new(FakeStore::cancelling_after_merge(&cancellation));
    let interceptor = interceptor(AuditConfiguration::new(), AuditOptions::default(), &store);

    let pending = interceptor
        .saving_changes(&tracker, false)
        .await
        .unwrap_or_else(|| unreachable!());
    tracker.replace_entries(vec![
        tracked(1, &widget, TrackedState::Unchanged, after.clone(), after),
        tracked(2, &widget, TrackedState::Unchanged, added.clone(), added),
    ]);

    let outcome = interceptor
        .saved_changes(&tracker, pending, &cancellation)
        .await;

    assert!(matches!(
        outcome,
        Err(AppError::Cancelled(message)) if message.contains("after merging 1 records")
    ));
    assert_eq!(store.merged().await.len(), 1);
    assert!(store.inserted().await.is_empty());
}

#[tokio::test]
async fn cancelled_batches_write_nothing() {
    let widget = widget_model();
    let before = widget_row(1, "A");
    let after = with(before.clone(), "Name", "B".into());
    let tracker = FakeTracker::new(
        &[&widget],
        vec![tracked(1, &widget, TrackedState::Modified, before, after.clone())],
    );
    let store = Arc::new(FakeStore::new(true));
    let interceptor = interceptor(AuditConfiguration::new(), AuditOptions::default(), &store);

    let pending = interceptor
        .saving_changes(&tracker, false)
        .await
        .unwrap_or_else(|| unreachable!());
    tracker.replace_entries(vec![tracked(
        1,
        &widget,
        TrackedState::Unchanged,
        after.clone(),
        after,
    )]);
    let cancellation = CancellationToken::new();
    cancellation.cancel();

    let outcome = interceptor
        .saved_changes(&tracker, pending, &cancellation)
        .await;

    assert!(matches!(outcome, Err(AppError::Cancelled(_))));
    assert!(store.merged().await.is_empty());
}

#[test]
fn blocking_twins_run_the_same_pipeline() {
    let widget = widget_model();
    let before = widget_row(1, "A");
    let after = with(before.clone(), "Name", "B".into());
    let tracker = FakeTracker::new(
        &[&widget],
        vec![tracked(1, &widget, TrackedState::Modified, before, after.clone())],
    );
    let store = Arc::new(FakeStore::new(true));
    let interceptor = interceptor(AuditConfiguration::new(), AuditOptions::default(), &store);

    let pending = interceptor
        .saving_changes_blocking(&tracker, false)
        .ok()
        .flatten()
        .unwrap_or_else(|| unreachable!());
    assert_eq!(pending.entries().len(), 1);
    tracker.replace_entries(vec![tracked(
        1,
        &widget,
        TrackedState::Unchanged,
        after.clone(),
        after,
    )]);

    let outcome = interceptor.saved_changes_blocking(&tracker, pending, &CancellationToken::new());

    assert_eq!(
        outcome.ok(),
        Some(AuditOutcome {
            records: 1,
            merged: 1,
            inserted: 0
        })
    );
    let merged = futures::executor::block_on(store.merged());
    assert_eq!(merged[0].properties[0].new_value.as_deref(), Some("B"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn blocking_twins_hand_off_a_multi_thread_worker() {
    let widget = widget_model();
    let before = widget_row(1, "A");
    let after = with(before.clone(), "Name", "B".into());
    let tracker = FakeTracker::new(
        &[&widget],
        vec![tracked(1, &widget, TrackedState::Modified, before, after.clone())],
    );
    let store = Arc::new(FakeStore::new(true));
    let interceptor = interceptor(AuditConfiguration::new(), AuditOptions::default(), &store);

    let pending = interceptor
        .saving_changes_blocking(&tracker, false)
        .ok()
        .flatten()
        .unwrap_or_else(|| unreachable!());
    tracker.replace_entries(vec![tracked(
        1,
        &widget,
        TrackedState::Unchanged,
        after.clone(),
        after,
    )]);
    let outcome = interceptor.saved_changes_blocking(&tracker, pending, &CancellationToken::new());

    assert_eq!(outcome.map(|outcome| outcome.merged).ok(), Some(1));
}

#[tokio::test]
async fn blocking_twins_refuse_a_current_thread_runtime() {
    let widget = widget_model();
    let before = widget_row(1, "A");
    let after = with(before.clone(), "Name", "B".into());
    let tracker = FakeTracker::new(
        &[&widget],
        vec![tracked(1, &widget, TrackedState::Modified, before, after)],
    );
    let store = Arc::new(FakeStore::new(true));
    let interceptor = interceptor(AuditConfiguration::new(), AuditOptions::default(), &store);

    let pending = interceptor.saving_changes_blocking(&tracker, false);

    assert!(matches!(pending, Err(AppError::Conflict(_))));
}
