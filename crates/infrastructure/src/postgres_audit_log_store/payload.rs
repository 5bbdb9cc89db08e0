use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

use super::*;

const PROPERTIES_KEY: &str = "properties";

#[derive(Serialize)]
struct RecordPayload<'a> {
    #[serde(rename = "type")]
    entity_type: &'a str,
    key_value: Option<&'a str>,
    description: Option<&'a str>,
    state: i16,
    timestamp: DateTime<Utc>,
    #[serde(flatten)]
    enrichment: BTreeMap<&'a str, &'a Value>,
    properties: Vec<PropertyPayload<'a>>,
}

#[derive(Serialize)]
struct PropertyPayload<'a> {
    field_name: &'a str,
    old_value: Option<&'a str>,
    old_value_description: Option<&'a str>,
    new_value: Option<&'a str>,
    new_value_description: Option<&'a str>,
}

/// Serializes the batch into the merge routine's `jsonb` argument.
///
/// Only the schema's enrichment columns are carried; other context values are dropped.
pub(super) fn encode(schema: &AuditSchema, records: &[AuditLogRecord]) -> AppResult<String> {
    if schema
        .enrichment_columns()
        .iter()
        .any(|column| column.name() == PROPERTIES_KEY)
    {
        return Err(AppError::Validation(format!(
            "enrichment column '{PROPERTIES_KEY}' is reserved by the merge payload"
        )));
    }

    let payload = records
        .iter()
        .map(|record| RecordPayload {
            entity_type: record.entity_type.as_str(),
            key_value: record.key_value.as_deref(),
            description: record.description.as_deref(),
            state: record.state.as_i16(),
            timestamp: record.timestamp,
            enrichment: schema
                .enrichment_columns()
                .iter()
                .filter_map(|column| {
                    record
                        .context
                        .get(column.name())
                        .map(|value| (column.name(), value))
                })
                .collect(),
            properties: record
                .properties
                .iter()
                .map(|property| PropertyPayload {
                    field_name: property.field_name.as_str(),
                    old_value: property.old_value.as_deref(),
                    old_value_description: property.old_value_description.as_deref(),
                    new_value: property.new_value.as_deref(),
                    new_value_description: property.new_value_description.as_deref(),
                })
                .collect(),
        })
        .collect::<Vec<_>>();

    serde_json::to_string(&payload).map_err(|error| {
        AppError::Internal(format!("failed to serialize audit merge payload: {error}"))
    })
}
