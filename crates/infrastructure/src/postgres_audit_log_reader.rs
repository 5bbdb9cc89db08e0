use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use sqlx::{FromRow, PgPool};

use trailkeep_application::{AuditLogReader, clamp_history_limit};
use trailkeep_core::{AppError, AppResult};
use trailkeep_domain::{
    AuditContext, AuditEntryState, AuditLogProperty, AuditLogRecord, AuditSchema,
};

/// PostgreSQL-backed reader for persisted audit history.
#[derive(Clone)]
pub struct PostgresAuditLogReader {
    pool: PgPool,
    schema: AuditSchema,
}

impl PostgresAuditLogReader {
    /// Creates a reader over the tables described by `schema`.
    #[must_use]
    pub fn new(pool: PgPool, schema: AuditSchema) -> Self {
        Self { pool, schema }
    }

    fn record_select_sql(&self) -> String {
        let description = if self.schema.shape().has_descriptions() {
            "\"description\""
        } else {
            "NULL::text"
        };
        let context = if self.schema.enrichment_columns().is_empty() {
            "'{}'".to_owned()
        } else {
            let pairs = self
                .schema
                .enrichment_columns()
                .iter()
                .map(|column| format!("'{}', {}", column.name(), column.quoted()))
                .collect::<Vec<_>>()
                .join(", ");
            format!("jsonb_build_object({pairs})::text")
        };

        format!(
            r#"
            SELECT
                "id",
                "type" AS entity_type,
                "key_value",
                {description} AS description,
                "state",
                "timestamp",
                {context} AS context
            FROM {records}
            WHERE "type" = $1 AND "key_value" = $2
            ORDER BY "id" DESC
            LIMIT $3
            "#,
            records = self.schema.record_table().qualified(),
        )
    }

    fn property_select_sql(&self) -> String {
        let (old_description, new_description) = if self.schema.shape().has_descriptions() {
            ("\"old_value_description\"", "\"new_value_description\"")
        } else {
            ("NULL::text", "NULL::text")
        };

        format!(
            r#"
            SELECT
                "id",
                "parent_id",
                "field_name",
                "old_value",
                {old_description} AS old_value_description,
                "new_value",
                {new_description} AS new_value_description
            FROM {properties}
            WHERE "parent_id" = ANY($1)
            ORDER BY "parent_id", "field_name"
            "#,
            properties = self.schema.property_table().qualified(),
        )
    }
}

#[derive(Debug, FromRow)]
struct RecordRow {
    id: i64,
    entity_type: String,
    key_value: Option<String>,
    description: Option<String>,
    state: i16,
    timestamp: DateTime<Utc>,
    context: String,
}

#[derive(Debug, FromRow)]
struct PropertyRow {
    id: i64,
    parent_id: i64,
    field_name: String,
    old_value: Option<String>,
    old_value_description: Option<String>,
    new_value: Option<String>,
    new_value_description: Option<String>,
}

#[async_trait]
impl AuditLogReader for PostgresAuditLogReader {
    async fn list_entity_history(
        &self,
        entity_type: &str,
        key_value: &str,
        limit: usize,
    ) -> AppResult<Vec<AuditLogRecord>> {
        let capped_limit = i64::try_from(clamp_history_limit(limit)).unwrap_or(i64::MAX);
        let record_sql = self.record_select_sql();
        let rows = sqlx::query_as::<_, RecordRow>(&record_sql)
            .bind(entity_type)
            .bind(key_value)
            .bind(capped_limit)
            .fetch_all(&self.pool)
            .await
            .map_err(|error| {
                AppError::Internal(format!(
                    "failed to list audit history for '{entity_type}' '{key_value}': {error}"
                ))
            })?;

        let record_ids = rows.iter().map(|row| row.id).collect::<Vec<_>>();
        let property_sql = self.property_select_sql();
        let property_rows = sqlx::query_as::<_, PropertyRow>(&property_sql)
            .bind(record_ids)
            .fetch_all(&self.pool)
            .await
            .map_err(|error| {
                AppError::Internal(format!(
                    "failed to list audit properties for '{entity_type}' '{key_value}': {error}"
                ))
            })?;

        let mut properties: HashMap<i64, Vec<AuditLogProperty>> = HashMap::new();
        for row in property_rows {
            properties
                .entry(row.parent_id)
                .or_default()
                .push(AuditLogProperty {
                    id: Some(row.id),
                    parent_id: Some(row.parent_id),
                    field_name: row.field_name,
                    old_value: row.old_value,
                    old_value_description: row.old_value_description,
                    new_value: row.new_value,
                    new_value_description: row.new_value_description,
                    can_merge: false,
                });
        }

        rows.into_iter()
            .map(|row| {
                Ok(AuditLogRecord {
                    id: Some(row.id),
                    entity_type: row.entity_type,
                    key_value: row.key_value,
                    description: row.description,
                    state: AuditEntryState::from_i16(row.state)?,
                    timestamp: row.timestamp,
                    context: parse_context(&row.context)?,
                    properties: properties.remove(&row.id).unwrap_or_default(),
                })
            })
            .collect()
    }

    async fn purge_older_than(&self, cutoff: DateTime<Utc>) -> AppResult<u64> {
        let sql = format!(
            r#"
            DELETE FROM {records}
            WHERE "timestamp" < $1
            "#,
            records = self.schema.record_table().qualified(),
        );

        let result = sqlx::query(&sql)
            .bind(cutoff)
            .execute(&self.pool)
            .await
            .map_err(|error| {
                AppError::Internal(format!("failed to purge audit records: {error}"))
            })?;

        Ok(result.rows_affected())
    }
}

fn parse_context(text: &str) -> AppResult<AuditContext> {
    let values: Map<String, Value> = serde_json::from_str(text).map_err(|error| {
        AppError::Internal(format!("failed to decode audit context: {error}"))
    })?;

    let mut context = AuditContext::default();
    for (column, value) in values {
        context.set(column, value);
    }
    Ok(context)
}
