use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};
use std::str::FromStr;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use trailkeep_core::AppError;
use uuid::Uuid;

/// Field values of one tracked record keyed by field name.
pub type FieldValues = BTreeMap<String, FieldValue>;

/// Storage kind of a host entity field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldKind {
    /// UTF-8 text.
    Text,
    /// Signed integer.
    Integer,
    /// Floating point number.
    Decimal,
    /// Boolean flag.
    Boolean,
    /// UUID identifier.
    Uuid,
    /// UTC timestamp.
    Timestamp,
    /// Enumeration stored as an ordinal with a display name.
    Enum,
}

impl FieldKind {
    /// Returns a stable storage value for the kind.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Integer => "integer",
            Self::Decimal => "decimal",
            Self::Boolean => "boolean",
            Self::Uuid => "uuid",
            Self::Timestamp => "timestamp",
            Self::Enum => "enum",
        }
    }

    /// Returns whether a non-null value of this kind has a zero value.
    ///
    /// Text has no zero value: an unset text field is null.
    #[must_use]
    pub fn has_zero_value(self) -> bool {
        !matches!(self, Self::Text)
    }

    /// Returns whether values of this kind come from a small closed set.
    #[must_use]
    pub fn is_discrete(self) -> bool {
        matches!(self, Self::Boolean | Self::Enum)
    }
}

impl FromStr for FieldKind {
    type Err = AppError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "text" => Ok(Self::Text),
            "integer" => Ok(Self::Integer),
            "decimal" => Ok(Self::Decimal),
            "boolean" => Ok(Self::Boolean),
            "uuid" => Ok(Self::Uuid),
            "timestamp" => Ok(Self::Timestamp),
            "enum" => Ok(Self::Enum),
            _ => Err(AppError::Validation(format!(
                "unknown field kind '{value}'"
            ))),
        }
    }
}

/// A typed value read from the host change tracker.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum FieldValue {
    /// Absent value.
    #[default]
    Null,
    /// Text value.
    Text(String),
    /// Integer value.
    Integer(i64),
    /// Floating point value.
    Decimal(f64),
    /// Boolean value.
    Boolean(bool),
    /// UUID value.
    Uuid(Uuid),
    /// UTC timestamp value.
    Timestamp(DateTime<Utc>),
    /// Enumeration value.
    Enum {
        /// Stored ordinal.
        ordinal: i64,
        /// Display name of the member.
        name: String,
    },
}

impl FieldValue {
    /// Creates an enumeration value.
    #[must_use]
    pub fn enumeration(ordinal: i64, name: impl Into<String>) -> Self {
        Self::Enum {
            ordinal,
            name: name.into(),
        }
    }

    /// Returns whether the value is null.
    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Returns the kind of a non-null value.
    #[must_use]
    pub fn kind(&self) -> Option<FieldKind> {
        match self {
            Self::Null => None,
            Self::Text(_) => Some(FieldKind::Text),
            Self::Integer(_) => Some(FieldKind::Integer),
            Self::Decimal(_) => Some(FieldKind::Decimal),
            Self::Boolean(_) => Some(FieldKind::Boolean),
            Self::Uuid(_) => Some(FieldKind::Uuid),
            Self::Timestamp(_) => Some(FieldKind::Timestamp),
            Self::Enum { .. } => Some(FieldKind::Enum),
        }
    }

    /// Returns whether the value equals the zero value of its kind.
    #[must_use]
    pub fn is_zero_value(&self) -> bool {
        match self {
            Self::Null | Self::Text(_) => false,
            Self::Integer(value) => *value == 0,
            Self::Decimal(value) => *value == 0.0,
            Self::Boolean(value) => !*value,
            Self::Uuid(value) => value.is_nil(),
            Self::Timestamp(value) => *value == DateTime::<Utc>::default(),
            Self::Enum { ordinal, .. } => *ordinal == 0,
        }
    }

    /// Returns the canonical display string, or `None` for null.
    #[must_use]
    pub fn to_display(&self) -> Option<String> {
        (!self.is_null()).then(|| self.to_string())
    }
}

impl Display for FieldValue {
    fn fmt(&self, formatter: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Null => Ok(()),
            Self::Text(value) => formatter.write_str(value),
            Self::Integer(value) => write!(formatter, "{value}"),
            Self::Decimal(value) => write!(formatter, "{value}"),
            Self::Boolean(value) => write!(formatter, "{value}"),
            Self::Uuid(value) => write!(formatter, "{value}"),
            Self::Timestamp(value) => {
                formatter.write_str(&value.to_rfc3339_opts(SecondsFormat::AutoSi, true))
            }
            Self::Enum { name, .. } => formatter.write_str(name),
        }
    }
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_owned())
    }
}

impl From<String> for FieldValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<i64> for FieldValue {
    fn from(value: i64) -> Self {
        Self::Integer(value)
    }
}

impl From<f64> for FieldValue {
    fn from(value: f64) -> Self {
        Self::Decimal(value)
    }
}

impl From<bool> for FieldValue {
    fn from(value: bool) -> Self {
        Self::Boolean(value)
    }
}

impl From<Uuid> for FieldValue {
    fn from(value: Uuid) -> Self {
        Self::Uuid(value)
    }
}

impl From<DateTime<Utc>> for FieldValue {
    fn from(value: DateTime<Utc>) -> Self {
        Self::Timestamp(value)
    }
}

impl<T> From<Option<T>> for FieldValue
where
    T: Into<FieldValue>,
{
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(Self::Null)
    }
}
