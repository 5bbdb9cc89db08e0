use super::*;

pub(super) fn capture_entries(
    configuration: &AuditConfiguration,
    tracker: &dyn ChangeTracker,
) -> Vec<ChangeEntry> {
    tracker
        .tracked_entries()
        .into_iter()
        .filter_map(|entry| capture_entry(configuration, entry))
        .collect()
}

fn capture_entry(configuration: &AuditConfiguration, entry: TrackedEntry) -> Option<ChangeEntry> {
    let state = match entry.state {
        TrackedState::Added => AuditEntryState::Added,
        TrackedState::Modified => AuditEntryState::Modified,
        TrackedState::Deleted => AuditEntryState::Deleted,
        TrackedState::Unchanged | TrackedState::Detached => return None,
    };

    let model = Arc::clone(&entry.model);
    if !configuration.is_audited_entity(&model) {
        debug!(entity_type = model.name(), "entity excluded from audit");
        return None;
    }

    let properties = match state {
        // Generated keys and defaults are only known after the write.
        AuditEntryState::Added => Vec::new(),
        AuditEntryState::Deleted => model
            .fields()
            .iter()
            .filter(|field| configuration.is_audited_field(&model, field))
            .map(|field| {
                let old_value =
                    configuration.format_value(&model, field, entry.original_value(field.name()));
                ChangeProperty::new(field, old_value, None)
            })
            .collect(),
        AuditEntryState::Modified => model
            .fields()
            .iter()
            .filter(|field| {
                configuration.is_audited_field(&model, field)
                    && (field.is_primary_key() || entry.is_field_modified(field.name()))
            })
            .map(|field| {
                let old_value =
                    configuration.format_value(&model, field, entry.original_value(field.name()));
                ChangeProperty::new(field, old_value, None)
            })
            .collect(),
    };

    Some(ChangeEntry {
        handle: entry.handle,
        model,
        state,
        properties,
        snapshot: entry,
        changed_references: BTreeSet::new(),
        reclassified: false,
    })
}
