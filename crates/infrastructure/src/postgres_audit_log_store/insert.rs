use serde_json::Value;

use super::*;

impl PostgresAuditLogStore {
    /// Inserts every record and its properties in one transaction.
    pub(super) async fn insert_plain(&self, records: &[AuditLogRecord]) -> AppResult<u64> {
        let record_sql = record_insert_sql(&self.schema);
        let property_sql = property_insert_sql(&self.schema);
        let describes = self.schema.shape().has_descriptions();

        let mut transaction = self.pool.begin().await.map_err(|error| {
            AppError::Internal(format!(
                "failed to start audit insert transaction: {error}"
            ))
        })?;

        for record in records {
            let mut query = sqlx::query_scalar::<_, i64>(&record_sql)
                .bind(record.entity_type.as_str())
                .bind(record.key_value.as_deref());
            if describes {
                query = query.bind(record.description.as_deref());
            }
            query = query.bind(record.state.as_i16()).bind(record.timestamp);
            for column in self.schema.enrichment_columns() {
                query = query.bind(enrichment_text(record.context.get(column.name())));
            }

            let record_id = query
                .fetch_one(&mut *transaction)
                .await
                .map_err(|error| {
                    AppError::Internal(format!(
                        "failed to insert audit record for '{}': {error}",
                        record.entity_type
                    ))
                })?;

            for property in &record.properties {
                let mut query = sqlx::query(&property_sql)
                    .bind(record_id)
                    .bind(property.field_name.as_str())
                    .bind(property.old_value.as_deref());
                if describes {
                    query = query.bind(property.old_value_description.as_deref());
                }
                query = query.bind(property.new_value.as_deref());
                if describes {
                    query = query.bind(property.new_value_description.as_deref());
                }

                query.execute(&mut *transaction).await.map_err(|error| {
                    AppError::Internal(format!(
                        "failed to insert audit property '{}' for '{}': {error}",
                        property.field_name, record.entity_type
                    ))
                })?;
            }
        }

        transaction.commit().await.map_err(|error| {
            AppError::Internal(format!(
                "failed to commit audit insert transaction: {error}"
            ))
        })?;

        debug!(records = records.len(), "inserted audit batch");
        Ok(u64::try_from(records.len()).unwrap_or(u64::MAX))
    }
}

pub(super) fn record_insert_sql(schema: &AuditSchema) -> String {
    let mut columns = vec!["\"type\"".to_owned(), "\"key_value\"".to_owned()];
    if schema.shape().has_descriptions() {
        columns.push("\"description\"".to_owned());
    }
    columns.push("\"state\"".to_owned());
    columns.push("\"timestamp\"".to_owned());

    let mut placeholders = (1..=columns.len())
        .map(|index| format!("${index}"))
        .collect::<Vec<_>>();
    for column in schema.enrichment_columns() {
        columns.push(column.quoted());
        placeholders.push(format!(
            "${}::{}",
            placeholders.len() + 1,
            column.store_type().as_sql()
        ));
    }

    format!(
        "INSERT INTO {} ({}) VALUES ({}) RETURNING \"id\"",
        schema.record_table().qualified(),
        columns.join(", "),
        placeholders.join(", ")
    )
}

pub(super) fn property_insert_sql(schema: &AuditSchema) -> String {
    let columns = schema.property_columns()[1..]
        .iter()
        .map(|name| format!("\"{name}\""))
        .collect::<Vec<_>>();
    let placeholders = (1..=columns.len())
        .map(|index| format!("${index}"))
        .collect::<Vec<_>>();

    format!(
        "INSERT INTO {} ({}) VALUES ({})",
        schema.property_table().qualified(),
        columns.join(", "),
        placeholders.join(", ")
    )
}

/// Renders an enrichment value as text for an explicit cast to its column type.
pub(super) fn enrichment_text(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::Null => None,
        Value::String(text) => Some(text.clone()),
        other => Some(other.to_string()),
    }
}
