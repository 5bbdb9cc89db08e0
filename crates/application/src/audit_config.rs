//! Host-supplied rules deciding what is audited and how values are rendered.
//!
//! Rules are evaluated newest first. The first rule with an opinion decides;
//! with no opinion, entities and fields are audited.

use std::collections::BTreeSet;
use std::fmt::{Debug, Formatter};
use std::sync::Arc;

use trailkeep_domain::{EntityModel, FieldKind, FieldModel, FieldValue};

type EntityPredicate = Arc<dyn Fn(&EntityModel) -> bool + Send + Sync>;
type FieldPredicate = Arc<dyn Fn(&EntityModel, &FieldModel) -> bool + Send + Sync>;
type ValueFormatter = Arc<dyn Fn(&FieldValue) -> String + Send + Sync>;

#[derive(Clone)]
enum EntityRule {
    Include(String),
    Exclude(String),
    IncludeWhere(EntityPredicate),
    ExcludeWhere(EntityPredicate),
}

impl EntityRule {
    fn verdict(&self, model: &EntityModel) -> Option<bool> {
        match self {
            Self::Include(name) => (name == model.name()).then_some(true),
            Self::Exclude(name) => (name == model.name()).then_some(false),
            Self::IncludeWhere(predicate) => predicate(model).then_some(true),
            Self::ExcludeWhere(predicate) => predicate(model).then_some(false),
        }
    }
}

#[derive(Clone)]
enum FieldRule {
    Exclude {
        entity: String,
        fields: BTreeSet<String>,
    },
    ExcludeWhere(FieldPredicate),
    IncludeWhere(FieldPredicate),
}

impl FieldRule {
    fn verdict(&self, model: &EntityModel, field: &FieldModel) -> Option<bool> {
        match self {
            Self::Exclude { entity, fields } => {
                (entity == model.name() && fields.contains(field.name())).then_some(false)
            }
            Self::ExcludeWhere(predicate) => predicate(model, field).then_some(false),
            Self::IncludeWhere(predicate) => predicate(model, field).then_some(true),
        }
    }
}

#[derive(Clone)]
enum FormatTarget {
    Fields {
        entity: String,
        fields: BTreeSet<String>,
    },
    Kind(FieldKind),
}

#[derive(Clone)]
struct FormatRule {
    target: FormatTarget,
    format: ValueFormatter,
}

impl FormatRule {
    fn applies_to(&self, model: &EntityModel, field: &FieldModel) -> bool {
        match &self.target {
            FormatTarget::Fields { entity, fields } => {
                entity == model.name() && fields.contains(field.name())
            }
            FormatTarget::Kind(kind) => *kind == field.kind(),
        }
    }
}

/// Audit rules supplied once by the host and read-only during saves.
#[derive(Clone, Default)]
pub struct AuditConfiguration {
    entity_rules: Vec<EntityRule>,
    field_rules: Vec<FieldRule>,
    format_rules: Vec<FormatRule>,
    include_added_default_values: bool,
}

impl AuditConfiguration {
    /// Creates a configuration that audits everything.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Audits the named entity type.
    #[must_use]
    pub fn include(mut self, entity_type: impl Into<String>) -> Self {
        self.entity_rules.push(EntityRule::Include(entity_type.into()));
        self
    }

    /// Stops auditing the named entity type.
    #[must_use]
    pub fn exclude(mut self, entity_type: impl Into<String>) -> Self {
        self.entity_rules.push(EntityRule::Exclude(entity_type.into()));
        self
    }

    /// Audits entity types matching the predicate.
    #[must_use]
    pub fn include_where<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&EntityModel) -> bool + Send + Sync + 'static,
    {
        self.entity_rules
            .push(EntityRule::IncludeWhere(Arc::new(predicate)));
        self
    }

    /// Stops auditing entity types matching the predicate.
    #[must_use]
    pub fn exclude_where<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&EntityModel) -> bool + Send + Sync + 'static,
    {
        self.entity_rules
            .push(EntityRule::ExcludeWhere(Arc::new(predicate)));
        self
    }

    /// Stops auditing the listed fields of one entity type.
    #[must_use]
    pub fn exclude_fields<I, S>(mut self, entity_type: impl Into<String>, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.field_rules.push(FieldRule::Exclude {
            entity: entity_type.into(),
            fields: fields.into_iter().map(Into::into).collect(),
        });
        self
    }

    /// Stops auditing fields matching the predicate.
    #[must_use]
    pub fn exclude_field_where<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&EntityModel, &FieldModel) -> bool + Send + Sync + 'static,
    {
        self.field_rules
            .push(FieldRule::ExcludeWhere(Arc::new(predicate)));
        self
    }

    /// Audits fields matching the predicate.
    #[must_use]
    pub fn include_field_where<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&EntityModel, &FieldModel) -> bool + Send + Sync + 'static,
    {
        self.field_rules
            .push(FieldRule::IncludeWhere(Arc::new(predicate)));
        self
    }

    /// Renders the listed fields of one entity type with `format`.
    #[must_use]
    pub fn format_fields<I, S, F>(
        mut self,
        entity_type: impl Into<String>,
        fields: I,
        format: F,
    ) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
        F: Fn(&FieldValue) -> String + Send + Sync + 'static,
    {
        self.format_rules.push(FormatRule {
            target: FormatTarget::Fields {
                entity: entity_type.into(),
                fields: fields.into_iter().map(Into::into).collect(),
            },
            format: Arc::new(format),
        });
        self
    }

    /// Renders every field of `kind` with `format`.
    #[must_use]
    pub fn format_kind<F>(mut self, kind: FieldKind, format: F) -> Self
    where
        F: Fn(&FieldValue) -> String + Send + Sync + 'static,
    {
        self.format_rules.push(FormatRule {
            target: FormatTarget::Kind(kind),
            format: Arc::new(format),
        });
        self
    }

    /// Keeps zero-valued fields of inserted records (skipped by default).
    #[must_use]
    pub fn include_added_default_values(mut self, include: bool) -> Self {
        self.include_added_default_values = include;
        self
    }

    /// Returns whether zero-valued fields of inserted records are kept.
    #[must_use]
    pub fn keeps_added_default_values(&self) -> bool {
        self.include_added_default_values
    }

    /// Returns whether changes to the entity type are audited.
    #[must_use]
    pub fn is_audited_entity(&self, model: &EntityModel) -> bool {
        self.entity_rules
            .iter()
            .rev()
            .find_map(|rule| rule.verdict(model))
            .unwrap_or(true)
    }

    /// Returns whether changes to the field are audited.
    ///
    /// Primary key fields are always audited.
    #[must_use]
    pub fn is_audited_field(&self, model: &EntityModel, field: &FieldModel) -> bool {
        if field.is_primary_key() {
            return true;
        }

        self.field_rules
            .iter()
            .rev()
            .find_map(|rule| rule.verdict(model, field))
            .unwrap_or(true)
    }

    /// Renders a value for storage. Null renders as absent.
    #[must_use]
    pub fn format_value(
        &self,
        model: &EntityModel,
        field: &FieldModel,
        value: &FieldValue,
    ) -> Option<String> {
        if value.is_null() {
            return None;
        }

        let formatted = self
            .format_rules
            .iter()
            .rev()
            .find(|rule| rule.applies_to(model, field))
            .map(|rule| (rule.format)(value));

        Some(formatted.unwrap_or_else(|| value.to_string()))
    }
}

impl Debug for AuditConfiguration {
    fn fmt(&self, formatter: &mut Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("AuditConfiguration")
            .field("entity_rules", &self.entity_rules.len())
            .field("field_rules", &self.field_rules.len())
            .field("format_rules", &self.format_rules.len())
            .field(
                "include_added_default_values",
                &self.include_added_default_values,
            )
            .finish()
    }
}
