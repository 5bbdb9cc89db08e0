use std::collections::BTreeMap;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use trailkeep_core::{AppError, AppResult};
use uuid::Uuid;

use crate::schema::{ACTING_USER_ID_COLUMN, ColumnDescriptor};

/// Persisted state of an audit log record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEntryState {
    /// Record was inserted.
    Added,
    /// Record was removed.
    Deleted,
    /// Record was updated.
    Modified,
}

impl AuditEntryState {
    /// Returns the stored ordinal.
    #[must_use]
    pub fn as_i16(self) -> i16 {
        match self {
            Self::Added => 0,
            Self::Deleted => 1,
            Self::Modified => 2,
        }
    }

    /// Parses a stored ordinal.
    pub fn from_i16(value: i16) -> AppResult<Self> {
        match value {
            0 => Ok(Self::Added),
            1 => Ok(Self::Deleted),
            2 => Ok(Self::Modified),
            _ => Err(AppError::Validation(format!(
                "unknown audit entry state '{value}'"
            ))),
        }
    }

    /// Returns a stable text value.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Added => "added",
            Self::Deleted => "deleted",
            Self::Modified => "modified",
        }
    }
}

impl FromStr for AuditEntryState {
    type Err = AppError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "added" => Ok(Self::Added),
            "deleted" => Ok(Self::Deleted),
            "modified" => Ok(Self::Modified),
            _ => Err(AppError::Validation(format!(
                "unknown audit entry state '{value}'"
            ))),
        }
    }
}

/// Enrichment values stamped onto a record, keyed by column name.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AuditContext(BTreeMap<String, Value>);

impl AuditContext {
    /// Creates a context carrying the acting user.
    #[must_use]
    pub fn with_acting_user(user_id: Uuid) -> Self {
        let mut context = Self::default();
        context.set(ACTING_USER_ID_COLUMN, user_id.to_string());
        context
    }

    /// Sets an enrichment value. Null removes the entry.
    pub fn set(&mut self, column: impl Into<String>, value: impl Into<Value>) {
        let column = column.into();
        match value.into() {
            Value::Null => {
                self.0.remove(&column);
            }
            value => {
                self.0.insert(column, value);
            }
        }
    }

    /// Returns an enrichment value.
    #[must_use]
    pub fn get(&self, column: &str) -> Option<&Value> {
        self.0.get(column)
    }

    /// Returns the acting user when one was stamped.
    #[must_use]
    pub fn acting_user_id(&self) -> Option<Uuid> {
        self.get(ACTING_USER_ID_COLUMN)
            .and_then(Value::as_str)
            .and_then(|value| Uuid::parse_str(value).ok())
    }

    /// Returns whether every listed column is equal or absent on both sides.
    #[must_use]
    pub fn matches_on(&self, other: &Self, columns: &[ColumnDescriptor]) -> bool {
        columns
            .iter()
            .all(|column| self.get(column.name()) == other.get(column.name()))
    }

    /// Iterates the stamped values.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.0.iter().map(|(column, value)| (column.as_str(), value))
    }
}

/// One changed field on an audit log record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditLogProperty {
    /// Store identity once persisted.
    pub id: Option<i64>,
    /// Owning record identity once persisted.
    pub parent_id: Option<i64>,
    /// Field name on the audited entity.
    pub field_name: String,
    /// Display value before the change.
    pub old_value: Option<String>,
    /// Label of the referenced record before the change.
    pub old_value_description: Option<String>,
    /// Display value after the change.
    pub new_value: Option<String>,
    /// Label of the referenced record after the change.
    pub new_value_description: Option<String>,
    /// Whether a later edit may extend this property in place.
    #[serde(skip)]
    pub can_merge: bool,
}

impl AuditLogProperty {
    /// Creates an unsaved property.
    #[must_use]
    pub fn new(
        field_name: impl Into<String>,
        old_value: Option<String>,
        new_value: Option<String>,
    ) -> Self {
        Self {
            id: None,
            parent_id: None,
            field_name: field_name.into(),
            old_value,
            old_value_description: None,
            new_value,
            new_value_description: None,
            can_merge: false,
        }
    }

    /// Returns whether both value and description are unchanged.
    #[must_use]
    pub fn is_noop(&self) -> bool {
        self.old_value == self.new_value
            && self.old_value_description == self.new_value_description
    }
}

/// Durable record of one change to one entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditLogRecord {
    /// Store identity once persisted.
    pub id: Option<i64>,
    /// Audited entity type name.
    pub entity_type: String,
    /// Primary key values joined with `;`.
    pub key_value: Option<String>,
    /// Label of the audited record.
    pub description: Option<String>,
    /// Kind of change.
    pub state: AuditEntryState,
    /// Batch timestamp, or the latest edit once extended.
    pub timestamp: DateTime<Utc>,
    /// Enrichment values.
    pub context: AuditContext,
    /// Changed fields.
    pub properties: Vec<AuditLogProperty>,
}

impl AuditLogRecord {
    /// Creates an unsaved record without properties.
    #[must_use]
    pub fn new(
        entity_type: impl Into<String>,
        key_value: Option<String>,
        state: AuditEntryState,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            id: None,
            entity_type: entity_type.into(),
            key_value,
            description: None,
            state,
            timestamp,
            context: AuditContext::default(),
            properties: Vec::new(),
        }
    }

    /// Returns the property field names in ascending order.
    #[must_use]
    pub fn sorted_field_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self
            .properties
            .iter()
            .map(|property| property.field_name.as_str())
            .collect();
        names.sort_unstable();
        names
    }

    /// Returns whether every property may be extended by a later edit.
    #[must_use]
    pub fn is_fully_mergeable(&self) -> bool {
        !self.properties.is_empty() && self.properties.iter().all(|property| property.can_merge)
    }

    /// Extends this record with a later edit to the same entity.
    ///
    /// Takes the incoming timestamp and new values; old values stay as first recorded.
    pub fn absorb(&mut self, incoming: &Self) {
        self.timestamp = incoming.timestamp;
        for property in &incoming.properties {
            match self
                .properties
                .iter_mut()
                .find(|existing| existing.field_name == property.field_name)
            {
                Some(existing) => {
                    existing.new_value.clone_from(&property.new_value);
                    existing
                        .new_value_description
                        .clone_from(&property.new_value_description);
                }
                None => {
                    let mut added = property.clone();
                    added.parent_id = self.id;
                    self.properties.push(added);
                }
            }
        }
    }
}
