use super::*;

impl AuditInterceptor {
    /// Turns finalized entries into durable records sharing one timestamp.
    pub(super) fn materialize(
        &self,
        entries: Vec<ChangeEntry>,
        timestamp: DateTime<Utc>,
    ) -> Vec<AuditLogRecord> {
        let schema = self.store.schema();
        entries
            .into_iter()
            .filter_map(|entry| self.materialize_entry(schema, entry, timestamp))
            .collect()
    }

    fn materialize_entry(
        &self,
        schema: &AuditSchema,
        entry: ChangeEntry,
        timestamp: DateTime<Utc>,
    ) -> Option<AuditLogRecord> {
        let model = Arc::clone(&entry.model);
        if schema.owns_table(model.table_name()) {
            return None;
        }

        // The key is always captured, so a lone key field means nothing audited changed.
        if !entry.reclassified && !entry.properties.iter().any(|property| !property.is_key) {
            debug!(
                entity_type = model.name(),
                state = entry.state.as_str(),
                "no audited changes beyond the key"
            );
            return None;
        }

        let mut record = AuditLogRecord::new(
            model.name(),
            model.key_value(&entry.snapshot.current),
            entry.state,
            timestamp,
        );

        let describes = schema.shape().has_descriptions();
        if describes
            && self.options.description_mode == DescriptionMode::Label
            && model.has_descriptive_label()
        {
            record.description = match model.read_label(&entry.snapshot.current) {
                Ok(label) => label,
                Err(error) => {
                    debug!(
                        entity_type = model.name(),
                        %error,
                        "label unavailable, record description omitted"
                    );
                    None
                }
            };
        }

        record.properties = entry
            .properties
            .into_iter()
            .map(|property| AuditLogProperty {
                id: None,
                parent_id: None,
                can_merge: model
                    .field(&property.field_name)
                    .is_some_and(|field| self.options.merge_mode.can_merge(field)),
                field_name: property.field_name,
                old_value: property.old_value,
                old_value_description: property.old_description.filter(|_| describes),
                new_value: property.new_value,
                new_value_description: property.new_description.filter(|_| describes),
            })
            .filter(|property| !property.is_noop())
            .collect();

        if let Some(enrichment) = &self.enrichment {
            enrichment.enrich(&mut record, &entry.snapshot);
        }

        if record.properties.is_empty() {
            debug!(
                entity_type = model.name(),
                "no property changed its stored form, record dropped"
            );
            return None;
        }

        Some(record)
    }
}
