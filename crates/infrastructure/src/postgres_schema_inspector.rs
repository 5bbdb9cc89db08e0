use sqlx::{FromRow, PgPool};
use tracing::info;

use trailkeep_core::{AppError, AppResult};
use trailkeep_domain::{
    AuditSchema, ColumnDescriptor, RecordShape, StoreType, TableDescriptor,
};

/// Reads the audit tables' layout from `information_schema`.
///
/// Meant to run once at startup; the resulting [`AuditSchema`] is handed to
/// the store and reader.
#[derive(Clone)]
pub struct PostgresSchemaInspector {
    pool: PgPool,
}

impl PostgresSchemaInspector {
    /// Creates an inspector with the provided connection pool.
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Describes the record and property tables.
    ///
    /// The shape follows the description columns present, and every record
    /// column beyond the base set becomes an enrichment column.
    pub async fn inspect(
        &self,
        record_table: &TableDescriptor,
        property_table: &TableDescriptor,
    ) -> AppResult<AuditSchema> {
        let record_columns = self.columns(record_table).await?;
        let property_columns = self.columns(property_table).await?;

        let has = |columns: &[ColumnRow], name: &str| {
            columns.iter().any(|column| column.column_name == name)
        };
        let shape = if has(&record_columns, "description")
            && has(&property_columns, "old_value_description")
            && has(&property_columns, "new_value_description")
        {
            RecordShape::AuditLog
        } else {
            RecordShape::ObjectChange
        };

        let probe = AuditSchema::new(
            shape,
            record_table.clone(),
            property_table.clone(),
            Vec::new(),
        )?;
        require_columns(record_table, &record_columns, probe.base_record_columns())?;
        require_columns(property_table, &property_columns, probe.property_columns())?;

        let enrichment_columns = record_columns
            .iter()
            .filter(|column| {
                !probe
                    .base_record_columns()
                    .contains(&column.column_name.as_str())
            })
            .map(|column| {
                ColumnDescriptor::new(
                    column.column_name.as_str(),
                    StoreType::from_data_type(&column.data_type)?,
                )
            })
            .collect::<AppResult<Vec<_>>>()?;

        let schema = AuditSchema::new(
            shape,
            record_table.clone(),
            property_table.clone(),
            enrichment_columns,
        )?;

        info!(
            record_table = %record_table,
            property_table = %property_table,
            shape = shape.as_str(),
            enrichment_columns = schema.enrichment_columns().len(),
            fingerprint = %schema.fingerprint(),
            "inspected audit schema"
        );
        Ok(schema)
    }

    async fn columns(&self, table: &TableDescriptor) -> AppResult<Vec<ColumnRow>> {
        let columns = sqlx::query_as::<_, ColumnRow>(
            r#"
            SELECT column_name::TEXT AS column_name, data_type::TEXT AS data_type
            FROM information_schema.columns
            WHERE table_schema = COALESCE($1, current_schema())
                AND table_name = $2
            ORDER BY ordinal_position
            "#,
        )
        .bind(table.schema())
        .bind(table.name())
        .fetch_all(&self.pool)
        .await
        .map_err(|error| {
            AppError::Internal(format!("failed to inspect columns of '{table}': {error}"))
        })?;

        if columns.is_empty() {
            return Err(AppError::NotFound(format!(
                "audit table '{table}' does not exist"
            )));
        }

        Ok(columns)
    }
}

#[derive(Debug, FromRow)]
struct ColumnRow {
    column_name: String,
    data_type: String,
}

fn require_columns(
    table: &TableDescriptor,
    columns: &[ColumnRow],
    required: &[&str],
) -> AppResult<()> {
    let missing = required
        .iter()
        .filter(|name| !columns.iter().any(|column| column.column_name == **name))
        .copied()
        .collect::<Vec<_>>();

    if missing.is_empty() {
        return Ok(());
    }

    Err(AppError::Validation(format!(
        "audit table '{table}' is missing columns: {}",
        missing.join(", ")
    )))
}
