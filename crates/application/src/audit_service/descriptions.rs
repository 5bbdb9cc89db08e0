use super::*;

/// Labels the referenced records as they were before the write.
///
/// Modified entries only consider references whose key changed, and remember
/// them for [`resolve_new_descriptions`].
pub(super) async fn resolve_old_descriptions(
    tracker: &dyn ChangeTracker,
    entries: &mut [ChangeEntry],
) {
    for entry in entries.iter_mut() {
        if entry.state == AuditEntryState::Added {
            continue;
        }

        let model = Arc::clone(&entry.model);
        for reference in model.references() {
            if entry.state == AuditEntryState::Modified {
                if !entry.snapshot.is_reference_modified(reference) {
                    continue;
                }
                entry
                    .changed_references
                    .insert(reference.name().to_owned());
            }

            let Some(field) = reference.description_field() else {
                continue;
            };
            if entry.property_mut(field).is_none() {
                continue;
            }

            let description = describe_reference(
                tracker,
                reference,
                &entry.snapshot.original,
                LabelPhase::Original,
            )
            .await;
            if let Some(property) = entry.property_mut(field) {
                property.old_description = description;
            }
        }
    }
}

/// Labels the referenced records as they are after the write.
pub(super) async fn resolve_new_descriptions(
    tracker: &dyn ChangeTracker,
    entries: &mut [ChangeEntry],
) {
    for entry in entries.iter_mut() {
        if entry.state == AuditEntryState::Deleted {
            continue;
        }

        let model = Arc::clone(&entry.model);
        for reference in model.references() {
            // Post-save the tracker no longer reports the reference as modified.
            if entry.state == AuditEntryState::Modified
                && !entry.changed_references.contains(reference.name())
            {
                continue;
            }

            let Some(field) = reference.description_field() else {
                continue;
            };
            if entry.property_mut(field).is_none() {
                continue;
            }

            let description = describe_reference(
                tracker,
                reference,
                &entry.snapshot.current,
                LabelPhase::Current,
            )
            .await;
            if let Some(property) = entry.property_mut(field) {
                property.new_description = description;
            }
        }
    }
}

/// Which values of the referenced record the label is read from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LabelPhase {
    Original,
    Current,
}

async fn describe_reference(
    tracker: &dyn ChangeTracker,
    reference: &ReferenceModel,
    values: &FieldValues,
    phase: LabelPhase,
) -> Option<String> {
    if !reference.targets_primary_key() {
        return None;
    }

    let target = tracker.model(reference.target_entity())?;
    if target.is_owned() || !target.has_descriptive_label() {
        return None;
    }

    let mut key = Vec::with_capacity(reference.foreign_key_fields().len());
    for field in reference.foreign_key_fields() {
        match values.get(field) {
            Some(value) if !value.is_null() => key.push(value.clone()),
            _ => return None,
        }
    }

    let found = match tracker.find_by_key(target.name(), &key).await {
        Ok(Some(found)) => found,
        Ok(None) => return None,
        Err(error) => {
            debug!(
                entity_type = target.name(),
                %error,
                "reference lookup failed, description omitted"
            );
            return None;
        }
    };

    let target_values = match phase {
        LabelPhase::Original => &found.original,
        LabelPhase::Current => &found.current,
    };
    let label = match found.model.read_label(target_values) {
        Ok(label) => label,
        Err(error) => {
            debug!(
                entity_type = target.name(),
                %error,
                "label unavailable, description omitted"
            );
            None
        }
    };

    if found.newly_attached {
        tracker.release(&found);
    }

    label
}
