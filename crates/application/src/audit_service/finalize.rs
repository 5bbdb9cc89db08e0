use super::*;

pub(super) fn finalize_entries(
    configuration: &AuditConfiguration,
    tracker: &dyn ChangeTracker,
    entries: &mut [ChangeEntry],
) {
    for entry in entries.iter_mut() {
        match entry.state {
            AuditEntryState::Added => finalize_added(configuration, tracker, entry),
            AuditEntryState::Modified => finalize_modified(configuration, tracker, entry),
            AuditEntryState::Deleted => {}
        }
    }
}

fn finalize_added(
    configuration: &AuditConfiguration,
    tracker: &dyn ChangeTracker,
    entry: &mut ChangeEntry,
) {
    if let Some(snapshot) = tracker.entry(entry.handle) {
        entry.snapshot = snapshot;
    }

    let model = Arc::clone(&entry.model);
    let keep_defaults = configuration.keeps_added_default_values();
    let properties = model
        .fields()
        .iter()
        .filter(|field| configuration.is_audited_field(&model, field))
        .filter_map(|field| {
            let value = entry.snapshot.current_value(field.name());
            if value.is_null() {
                return None;
            }
            if !keep_defaults && field.has_implicit_default() && value.is_zero_value() {
                return None;
            }

            let new_value = configuration.format_value(&model, field, value);
            Some(ChangeProperty::new(field, None, new_value))
        })
        .collect();

    entry.properties = properties;
}

fn finalize_modified(
    configuration: &AuditConfiguration,
    tracker: &dyn ChangeTracker,
    entry: &mut ChangeEntry,
) {
    match tracker.entry(entry.handle) {
        Some(snapshot) if snapshot.state != TrackedState::Detached => {
            let model = Arc::clone(&entry.model);
            for property in &mut entry.properties {
                property.new_value = model.field(&property.field_name).and_then(|field| {
                    configuration.format_value(
                        &model,
                        field,
                        snapshot.current_value(field.name()),
                    )
                });
            }
            entry.snapshot = snapshot;
        }
        _ => {
            debug!(
                entity_type = entry.model.name(),
                "modified record detached during save, recording as deleted"
            );
            entry.state = AuditEntryState::Deleted;
            entry.reclassified = true;
            entry.changed_references.clear();
            entry.properties.retain(|property| property.is_key);
            for property in &mut entry.properties {
                property.new_value = None;
                property.old_description = None;
                property.new_description = None;
            }
        }
    }
}
