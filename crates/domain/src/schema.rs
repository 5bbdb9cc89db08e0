use std::fmt::{Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use trailkeep_core::{AppError, AppResult};

/// Enrichment column carrying the acting user in the standard schema.
pub const ACTING_USER_ID_COLUMN: &str = "acting_user_id";

const AUDIT_LOG_RECORD_COLUMNS: &[&str] = &[
    "id",
    "type",
    "key_value",
    "description",
    "state",
    "timestamp",
];
const OBJECT_CHANGE_RECORD_COLUMNS: &[&str] = &["id", "type", "key_value", "state", "timestamp"];
const AUDIT_LOG_PROPERTY_COLUMNS: &[&str] = &[
    "id",
    "parent_id",
    "field_name",
    "old_value",
    "old_value_description",
    "new_value",
    "new_value_description",
];
const OBJECT_CHANGE_PROPERTY_COLUMNS: &[&str] =
    &["id", "parent_id", "field_name", "old_value", "new_value"];

/// Column store type an enrichment value is cast to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreType {
    /// `text`
    Text,
    /// `uuid`
    Uuid,
    /// `bigint`
    BigInt,
    /// `integer`
    Integer,
    /// `smallint`
    SmallInt,
    /// `boolean`
    Boolean,
    /// `timestamptz`
    TimestampTz,
    /// `double precision`
    DoublePrecision,
}

impl StoreType {
    /// Returns the SQL type name.
    #[must_use]
    pub fn as_sql(&self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Uuid => "uuid",
            Self::BigInt => "bigint",
            Self::Integer => "integer",
            Self::SmallInt => "smallint",
            Self::Boolean => "boolean",
            Self::TimestampTz => "timestamptz",
            Self::DoublePrecision => "double precision",
        }
    }

    /// Maps an `information_schema.columns.data_type` value.
    pub fn from_data_type(data_type: &str) -> AppResult<Self> {
        match data_type {
            "text" | "character varying" => Ok(Self::Text),
            "uuid" => Ok(Self::Uuid),
            "bigint" => Ok(Self::BigInt),
            "integer" => Ok(Self::Integer),
            "smallint" => Ok(Self::SmallInt),
            "boolean" => Ok(Self::Boolean),
            "timestamp with time zone" => Ok(Self::TimestampTz),
            "double precision" => Ok(Self::DoublePrecision),
            _ => Err(AppError::Validation(format!(
                "unsupported audit column type '{data_type}'"
            ))),
        }
    }
}

fn validate_identifier(value: &str) -> AppResult<()> {
    let mut chars = value.chars();
    let starts_well = chars
        .next()
        .is_some_and(|first| first.is_ascii_alphabetic() || first == '_');
    let rest_valid = chars.all(|char| char.is_ascii_alphanumeric() || char == '_');

    if !starts_well || !rest_valid || value.len() > 63 {
        return Err(AppError::Validation(format!(
            "'{value}' is not a valid sql identifier"
        )));
    }

    Ok(())
}

fn quote(identifier: &str) -> String {
    format!("\"{identifier}\"")
}

/// A typed record column.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ColumnDescriptor {
    name: String,
    store_type: StoreType,
}

impl ColumnDescriptor {
    /// Creates a column descriptor after validating the identifier.
    pub fn new(name: impl Into<String>, store_type: StoreType) -> AppResult<Self> {
        let name = name.into();
        validate_identifier(&name)?;
        Ok(Self { name, store_type })
    }

    /// Returns the column name.
    #[must_use]
    pub fn name(&self) -> &str {
        self.name.as_str()
    }

    /// Returns the store type.
    #[must_use]
    pub fn store_type(&self) -> StoreType {
        self.store_type
    }

    /// Returns the quoted identifier.
    #[must_use]
    pub fn quoted(&self) -> String {
        quote(&self.name)
    }
}

/// A table, optionally schema-qualified.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TableDescriptor {
    schema: Option<String>,
    name: String,
}

impl TableDescriptor {
    /// Parses `table` or `schema.table`.
    pub fn parse(value: &str) -> AppResult<Self> {
        let (schema, name) = match value.split_once('.') {
            Some((schema, name)) => (Some(schema.to_owned()), name.to_owned()),
            None => (None, value.to_owned()),
        };

        if let Some(schema) = &schema {
            validate_identifier(schema)?;
        }
        validate_identifier(&name)?;

        Ok(Self { schema, name })
    }

    /// Returns the unqualified table name.
    #[must_use]
    pub fn name(&self) -> &str {
        self.name.as_str()
    }

    /// Returns the schema, when qualified.
    #[must_use]
    pub fn schema(&self) -> Option<&str> {
        self.schema.as_deref()
    }

    /// Returns the quoted, qualified name.
    #[must_use]
    pub fn qualified(&self) -> String {
        match &self.schema {
            Some(schema) => format!("{}.{}", quote(schema), quote(&self.name)),
            None => quote(&self.name),
        }
    }
}

impl Display for TableDescriptor {
    fn fmt(&self, formatter: &mut Formatter<'_>) -> std::fmt::Result {
        match &self.schema {
            Some(schema) => write!(formatter, "{schema}.{}", self.name),
            None => formatter.write_str(&self.name),
        }
    }
}

/// Persisted record shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordShape {
    /// Records and properties carry descriptions.
    AuditLog,
    /// Legacy shape without description columns.
    ObjectChange,
}

impl RecordShape {
    /// Returns a stable text value.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AuditLog => "audit_log",
            Self::ObjectChange => "object_change",
        }
    }

    /// Returns whether record and property descriptions are persisted.
    #[must_use]
    pub fn has_descriptions(self) -> bool {
        matches!(self, Self::AuditLog)
    }
}

impl FromStr for RecordShape {
    type Err = AppError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "audit_log" => Ok(Self::AuditLog),
            "object_change" => Ok(Self::ObjectChange),
            _ => Err(AppError::Validation(format!(
                "unknown record shape '{value}'"
            ))),
        }
    }
}

/// Stable digest of an [`AuditSchema`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SchemaFingerprint(String);

impl SchemaFingerprint {
    /// Returns the full hex digest.
    #[must_use]
    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

impl Display for SchemaFingerprint {
    fn fmt(&self, formatter: &mut Formatter<'_>) -> std::fmt::Result {
        formatter.write_str(&self.0)
    }
}

/// Tables, columns and shape of the audit store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditSchema {
    shape: RecordShape,
    record_table: TableDescriptor,
    property_table: TableDescriptor,
    enrichment_columns: Vec<ColumnDescriptor>,
}

impl AuditSchema {
    /// Builds a schema after checking enrichment columns against base columns.
    pub fn new(
        shape: RecordShape,
        record_table: TableDescriptor,
        property_table: TableDescriptor,
        enrichment_columns: Vec<ColumnDescriptor>,
    ) -> AppResult<Self> {
        if record_table == property_table {
            return Err(AppError::Validation(format!(
                "record and property tables must differ, both are '{record_table}'"
            )));
        }

        let base = Self::base_record_columns_for(shape);
        for (index, column) in enrichment_columns.iter().enumerate() {
            if base.contains(&column.name()) {
                return Err(AppError::Validation(format!(
                    "enrichment column '{}' collides with a base column",
                    column.name()
                )));
            }
            if enrichment_columns[..index]
                .iter()
                .any(|other| other.name() == column.name())
            {
                return Err(AppError::Validation(format!(
                    "enrichment column '{}' is declared twice",
                    column.name()
                )));
            }
        }

        Ok(Self {
            shape,
            record_table,
            property_table,
            enrichment_columns,
        })
    }

    /// Describes the bundled `audit_logs` migration.
    #[must_use]
    pub fn standard() -> Self {
        Self {
            shape: RecordShape::AuditLog,
            record_table: TableDescriptor {
                schema: None,
                name: "audit_logs".to_owned(),
            },
            property_table: TableDescriptor {
                schema: None,
                name: "audit_log_properties".to_owned(),
            },
            enrichment_columns: vec![ColumnDescriptor {
                name: ACTING_USER_ID_COLUMN.to_owned(),
                store_type: StoreType::Uuid,
            }],
        }
    }

    /// Describes the legacy `object_changes` layout.
    #[must_use]
    pub fn object_change() -> Self {
        Self {
            shape: RecordShape::ObjectChange,
            record_table: TableDescriptor {
                schema: None,
                name: "object_changes".to_owned(),
            },
            property_table: TableDescriptor {
                schema: None,
                name: "object_change_properties".to_owned(),
            },
            enrichment_columns: vec![ColumnDescriptor {
                name: ACTING_USER_ID_COLUMN.to_owned(),
                store_type: StoreType::Uuid,
            }],
        }
    }

    /// Returns the record shape.
    #[must_use]
    pub fn shape(&self) -> RecordShape {
        self.shape
    }

    /// Returns the record table.
    #[must_use]
    pub fn record_table(&self) -> &TableDescriptor {
        &self.record_table
    }

    /// Returns the property table.
    #[must_use]
    pub fn property_table(&self) -> &TableDescriptor {
        &self.property_table
    }

    /// Returns extra record columns filled by enrichment.
    #[must_use]
    pub fn enrichment_columns(&self) -> &[ColumnDescriptor] {
        &self.enrichment_columns
    }

    /// Returns the base record columns for this shape.
    #[must_use]
    pub fn base_record_columns(&self) -> &'static [&'static str] {
        Self::base_record_columns_for(self.shape)
    }

    /// Returns the property columns for this shape.
    #[must_use]
    pub fn property_columns(&self) -> &'static [&'static str] {
        match self.shape {
            RecordShape::AuditLog => AUDIT_LOG_PROPERTY_COLUMNS,
            RecordShape::ObjectChange => OBJECT_CHANGE_PROPERTY_COLUMNS,
        }
    }

    /// Returns whether an entity stored in `table_name` is part of the audit store.
    #[must_use]
    pub fn owns_table(&self, table_name: &str) -> bool {
        table_name == self.record_table.name() || table_name == self.property_table.name()
    }

    /// Computes the digest of the canonical descriptor text.
    #[must_use]
    pub fn fingerprint(&self) -> SchemaFingerprint {
        let mut hasher = Sha256::new();
        hasher.update(self.canonical_text().as_bytes());
        SchemaFingerprint(hex::encode(hasher.finalize()))
    }

    fn canonical_text(&self) -> String {
        let mut text = format!(
            "shape={}\nrecord={}\nproperty={}\n",
            self.shape.as_str(),
            self.record_table,
            self.property_table
        );
        for column in &self.enrichment_columns {
            text.push_str(&format!(
                "column={}:{}\n",
                column.name(),
                column.store_type().as_sql()
            ));
        }
        text
    }

    fn base_record_columns_for(shape: RecordShape) -> &'static [&'static str] {
        match shape {
            RecordShape::AuditLog => AUDIT_LOG_RECORD_COLUMNS,
            RecordShape::ObjectChange => OBJECT_CHANGE_RECORD_COLUMNS,
        }
    }
}
