//! Runtime options of the audit pipeline.

use std::env;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use trailkeep_core::{AppError, AppResult};
use trailkeep_domain::{FieldKind, FieldModel};

/// Which persisted properties may be extended by a later edit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeMode {
    /// Never extend.
    None,
    /// Every property may be extended.
    All,
    /// Everything except foreign keys, enums and booleans.
    #[default]
    NonDiscreteOnly,
    /// Only text fields that are not foreign keys.
    StringsOnly,
}

impl MergeMode {
    /// Returns a stable text value.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::All => "all",
            Self::NonDiscreteOnly => "non_discrete",
            Self::StringsOnly => "strings",
        }
    }

    /// Returns whether changes to `field` may be collapsed.
    #[must_use]
    pub fn can_merge(self, field: &FieldModel) -> bool {
        match self {
            Self::None => false,
            Self::All => true,
            Self::NonDiscreteOnly => !field.is_foreign_key() && !field.kind().is_discrete(),
            Self::StringsOnly => !field.is_foreign_key() && field.kind() == FieldKind::Text,
        }
    }
}

impl FromStr for MergeMode {
    type Err = AppError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "none" => Ok(Self::None),
            "all" => Ok(Self::All),
            "non_discrete" => Ok(Self::NonDiscreteOnly),
            "strings" => Ok(Self::StringsOnly),
            _ => Err(AppError::Validation(format!("unknown merge mode '{value}'"))),
        }
    }
}

/// Whether records carry the audited entity's own label.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DescriptionMode {
    /// No record description.
    None,
    /// Label of the audited record.
    #[default]
    Label,
}

impl FromStr for DescriptionMode {
    type Err = AppError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "none" => Ok(Self::None),
            "label" => Ok(Self::Label),
            _ => Err(AppError::Validation(format!(
                "unknown description mode '{value}'"
            ))),
        }
    }
}

/// Whether foreign key properties carry the referenced record's label.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PropertyDescriptionMode {
    /// No property descriptions.
    None,
    /// Label of the referenced record, before and after.
    #[default]
    ForeignKeyLabel,
}

impl FromStr for PropertyDescriptionMode {
    type Err = AppError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "none" => Ok(Self::None),
            "fk_label" => Ok(Self::ForeignKeyLabel),
            _ => Err(AppError::Validation(format!(
                "unknown property description mode '{value}'"
            ))),
        }
    }
}

/// Runtime options of the audit pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditOptions {
    /// Edits to one entity closer together than this collapse. Zero disables merging.
    pub merge_window: Duration,
    /// Per-property merge eligibility.
    pub merge_mode: MergeMode,
    /// Record description source.
    pub description_mode: DescriptionMode,
    /// Property description source.
    pub property_description_mode: PropertyDescriptionMode,
    /// Whether capable stores install a persistent merge routine.
    pub use_stored_routines: bool,
}

impl Default for AuditOptions {
    fn default() -> Self {
        Self {
            merge_window: Duration::from_secs(30),
            merge_mode: MergeMode::default(),
            description_mode: DescriptionMode::default(),
            property_description_mode: PropertyDescriptionMode::default(),
            use_stored_routines: true,
        }
    }
}

impl AuditOptions {
    /// Reads options from `AUDIT_*` environment variables.
    pub fn from_env() -> AppResult<Self> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Reads options through `lookup`, falling back to defaults for unset names.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> AppResult<Self> {
        let defaults = Self::default();

        let merge_window = match lookup("AUDIT_MERGE_WINDOW_SECONDS") {
            Some(value) => value
                .trim()
                .parse::<u64>()
                .map(Duration::from_secs)
                .map_err(|error| {
                    AppError::Validation(format!(
                        "invalid AUDIT_MERGE_WINDOW_SECONDS value '{value}': {error}"
                    ))
                })?,
            None => defaults.merge_window,
        };

        let merge_mode = parse_or(&lookup, "AUDIT_MERGE_MODE", defaults.merge_mode)?;
        let description_mode =
            parse_or(&lookup, "AUDIT_DESCRIPTIONS", defaults.description_mode)?;
        let property_description_mode = parse_or(
            &lookup,
            "AUDIT_PROPERTY_DESCRIPTIONS",
            defaults.property_description_mode,
        )?;

        let use_stored_routines = match lookup("AUDIT_USE_STORED_ROUTINES") {
            Some(value) if value.eq_ignore_ascii_case("true") => true,
            Some(value) if value.eq_ignore_ascii_case("false") => false,
            Some(value) => {
                return Err(AppError::Validation(format!(
                    "AUDIT_USE_STORED_ROUTINES must be either 'true' or 'false', got '{value}'"
                )));
            }
            None => defaults.use_stored_routines,
        };

        Ok(Self {
            merge_window,
            merge_mode,
            description_mode,
            property_description_mode,
            use_stored_routines,
        })
    }

    /// Returns whether edits may collapse at all.
    #[must_use]
    pub fn merge_enabled(&self) -> bool {
        !self.merge_window.is_zero()
    }
}

fn parse_or<T>(lookup: &impl Fn(&str) -> Option<String>, name: &str, default: T) -> AppResult<T>
where
    T: FromStr<Err = AppError>,
{
    match lookup(name) {
        Some(value) => value
            .trim()
            .parse::<T>()
            .map_err(|error| AppError::Validation(format!("invalid {name}: {error}"))),
        None => Ok(default),
    }
}
