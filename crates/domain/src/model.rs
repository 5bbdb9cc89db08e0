use std::collections::BTreeSet;
use std::fmt::{Debug, Formatter};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use thiserror::Error;
use trailkeep_core::{AppError, AppResult, NonEmptyString};

use crate::value::{FieldKind, FieldValues};

/// Failure raised by host label logic. Never surfaces as a save error.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("label unavailable: {0}")]
pub struct LabelError(pub String);

/// Host-supplied computed label.
pub type LabelFn = Arc<dyn Fn(&FieldValues) -> Result<Option<String>, LabelError> + Send + Sync>;

/// Where an entity's human-readable label comes from.
#[derive(Clone)]
pub enum LabelSource {
    /// A stored field read from tracked values.
    Field(String),
    /// A computed accessor over the record's values.
    Computed(LabelFn),
}

impl Debug for LabelSource {
    fn fmt(&self, formatter: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Field(name) => formatter.debug_tuple("Field").field(name).finish(),
            Self::Computed(_) => formatter.write_str("Computed(..)"),
        }
    }
}

/// Field metadata of a host entity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldModel {
    name: NonEmptyString,
    kind: FieldKind,
    is_nullable: bool,
    is_primary_key: bool,
    is_foreign_key: bool,
}

impl FieldModel {
    /// Returns the field name.
    #[must_use]
    pub fn name(&self) -> &str {
        self.name.as_str()
    }

    /// Returns the storage kind.
    #[must_use]
    pub fn kind(&self) -> FieldKind {
        self.kind
    }

    /// Returns whether null is a legal value.
    #[must_use]
    pub fn is_nullable(&self) -> bool {
        self.is_nullable
    }

    /// Returns whether the field is part of the primary key.
    #[must_use]
    pub fn is_primary_key(&self) -> bool {
        self.is_primary_key
    }

    /// Returns whether the field backs a reference relationship.
    #[must_use]
    pub fn is_foreign_key(&self) -> bool {
        self.is_foreign_key
    }

    /// Returns whether a zero value of this field is indistinguishable from unset.
    #[must_use]
    pub fn has_implicit_default(&self) -> bool {
        !self.is_nullable && self.kind.has_zero_value()
    }
}

/// A reference from one entity to another through foreign key fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReferenceModel {
    name: NonEmptyString,
    target_entity: NonEmptyString,
    foreign_key_fields: Vec<String>,
    targets_primary_key: bool,
}

impl ReferenceModel {
    /// Returns the relationship name.
    #[must_use]
    pub fn name(&self) -> &str {
        self.name.as_str()
    }

    /// Returns the referenced entity type name.
    #[must_use]
    pub fn target_entity(&self) -> &str {
        self.target_entity.as_str()
    }

    /// Returns the foreign key fields in key order.
    #[must_use]
    pub fn foreign_key_fields(&self) -> &[String] {
        &self.foreign_key_fields
    }

    /// Returns whether the foreign key points at the target's primary key.
    #[must_use]
    pub fn targets_primary_key(&self) -> bool {
        self.targets_primary_key
    }

    /// Returns the field that carries the description of this reference.
    ///
    /// Composite keys use their last column, the part most specific to the target.
    #[must_use]
    pub fn description_field(&self) -> Option<&str> {
        self.foreign_key_fields.last().map(String::as_str)
    }
}

/// Metadata of one host entity type.
#[derive(Debug, Clone)]
pub struct EntityModel {
    name: NonEmptyString,
    table_name: NonEmptyString,
    fields: Vec<FieldModel>,
    primary_key: Vec<String>,
    references: Vec<ReferenceModel>,
    label: Option<LabelSource>,
    is_owned: bool,
}

impl EntityModel {
    /// Starts a model for the given entity type name.
    pub fn builder(name: impl Into<String>) -> AppResult<EntityModelBuilder> {
        let name = NonEmptyString::new(name)?;
        Ok(EntityModelBuilder {
            table_name: name.clone(),
            name,
            fields: Vec::new(),
            primary_key: Vec::new(),
            references: Vec::new(),
            label: None,
            is_owned: false,
        })
    }

    /// Returns the entity type name.
    #[must_use]
    pub fn name(&self) -> &str {
        self.name.as_str()
    }

    /// Returns the table the entity is stored in.
    #[must_use]
    pub fn table_name(&self) -> &str {
        self.table_name.as_str()
    }

    /// Returns all mapped fields in declaration order.
    #[must_use]
    pub fn fields(&self) -> &[FieldModel] {
        &self.fields
    }

    /// Finds a field by name.
    #[must_use]
    pub fn field(&self, name: &str) -> Option<&FieldModel> {
        self.fields.iter().find(|field| field.name() == name)
    }

    /// Returns primary key field names in key order.
    #[must_use]
    pub fn primary_key(&self) -> &[String] {
        &self.primary_key
    }

    /// Returns reference relationships.
    #[must_use]
    pub fn references(&self) -> &[ReferenceModel] {
        &self.references
    }

    /// Returns the configured label source.
    #[must_use]
    pub fn label(&self) -> Option<&LabelSource> {
        self.label.as_ref()
    }

    /// Returns whether the entity is embedded in an owner.
    #[must_use]
    pub fn is_owned(&self) -> bool {
        self.is_owned
    }

    /// Returns whether a label exists and is not just the primary key.
    #[must_use]
    pub fn has_descriptive_label(&self) -> bool {
        match &self.label {
            Some(LabelSource::Field(name)) => !self.primary_key.contains(name),
            Some(LabelSource::Computed(_)) => true,
            None => false,
        }
    }

    /// Reads the label from a set of values.
    ///
    /// A computed label that panics yields a [`LabelError`].
    pub fn read_label(&self, values: &FieldValues) -> Result<Option<String>, LabelError> {
        match &self.label {
            Some(LabelSource::Field(name)) => {
                Ok(values.get(name).and_then(|value| value.to_display()))
            }
            Some(LabelSource::Computed(label)) => {
                panic::catch_unwind(AssertUnwindSafe(|| label(values))).unwrap_or_else(|_| {
                    Err(LabelError(format!(
                        "computed label of {} panicked",
                        self.name()
                    )))
                })
            }
            None => Ok(None),
        }
    }

    /// Joins the primary key values with `;`, null parts rendering empty.
    #[must_use]
    pub fn key_value(&self, values: &FieldValues) -> Option<String> {
        if self.primary_key.is_empty() {
            return None;
        }

        let parts: Vec<String> = self
            .primary_key
            .iter()
            .map(|name| {
                values
                    .get(name)
                    .and_then(|value| value.to_display())
                    .unwrap_or_default()
            })
            .collect();

        Some(parts.join(";"))
    }
}

/// Builder for [`EntityModel`].
#[derive(Debug)]
pub struct EntityModelBuilder {
    name: NonEmptyString,
    table_name: NonEmptyString,
    fields: Vec<FieldModel>,
    primary_key: Vec<String>,
    references: Vec<ReferenceModel>,
    label: Option<LabelSource>,
    is_owned: bool,
}

impl EntityModelBuilder {
    /// Overrides the table name (defaults to the entity name).
    pub fn table(mut self, table_name: impl Into<String>) -> AppResult<Self> {
        self.table_name = NonEmptyString::new(table_name)?;
        Ok(self)
    }

    /// Adds a non-nullable field.
    pub fn field(self, name: impl Into<String>, kind: FieldKind) -> AppResult<Self> {
        self.push_field(name, kind, false)
    }

    /// Adds a nullable field.
    pub fn nullable_field(self, name: impl Into<String>, kind: FieldKind) -> AppResult<Self> {
        self.push_field(name, kind, true)
    }

    /// Declares the primary key fields.
    #[must_use]
    pub fn primary_key<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.primary_key = fields.into_iter().map(Into::into).collect();
        self
    }

    /// Declares a reference to the target's primary key.
    pub fn reference<I, S>(
        self,
        name: impl Into<String>,
        target_entity: impl Into<String>,
        foreign_key_fields: I,
    ) -> AppResult<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.push_reference(name, target_entity, foreign_key_fields, true)
    }

    /// Declares a reference to an alternate key of the target.
    pub fn alternate_key_reference<I, S>(
        self,
        name: impl Into<String>,
        target_entity: impl Into<String>,
        foreign_key_fields: I,
    ) -> AppResult<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.push_reference(name, target_entity, foreign_key_fields, false)
    }

    /// Uses a stored field as the label.
    #[must_use]
    pub fn label_field(mut self, name: impl Into<String>) -> Self {
        self.label = Some(LabelSource::Field(name.into()));
        self
    }

    /// Uses a computed accessor as the label.
    #[must_use]
    pub fn computed_label<F>(mut self, label: F) -> Self
    where
        F: Fn(&FieldValues) -> Result<Option<String>, LabelError> + Send + Sync + 'static,
    {
        self.label = Some(LabelSource::Computed(Arc::new(label)));
        self
    }

    /// Marks the entity as embedded in an owner.
    #[must_use]
    pub fn owned(mut self) -> Self {
        self.is_owned = true;
        self
    }

    /// Validates field references and builds the model.
    pub fn build(mut self) -> AppResult<EntityModel> {
        let mut names = BTreeSet::new();
        for field in &self.fields {
            if !names.insert(field.name()) {
                return Err(AppError::Validation(format!(
                    "entity '{}' declares field '{}' twice",
                    self.name,
                    field.name()
                )));
            }
        }

        self.require_fields(self.primary_key.iter(), "primary key")?;
        for reference in &self.references {
            self.require_fields(reference.foreign_key_fields.iter(), "foreign key")?;
        }
        if let Some(LabelSource::Field(name)) = &self.label {
            self.require_fields(std::iter::once(name), "label")?;
        }

        let primary_key = self.primary_key.clone();
        let foreign_keys: BTreeSet<String> = self
            .references
            .iter()
            .flat_map(|reference| reference.foreign_key_fields.iter().cloned())
            .collect();
        for field in &mut self.fields {
            field.is_primary_key = primary_key.iter().any(|name| name == field.name());
            field.is_foreign_key = foreign_keys.contains(field.name());
        }

        Ok(EntityModel {
            name: self.name,
            table_name: self.table_name,
            fields: self.fields,
            primary_key,
            references: self.references,
            label: self.label,
            is_owned: self.is_owned,
        })
    }

    fn push_field(
        mut self,
        name: impl Into<String>,
        kind: FieldKind,
        is_nullable: bool,
    ) -> AppResult<Self> {
        self.fields.push(FieldModel {
            name: NonEmptyString::new(name)?,
            kind,
            is_nullable,
            is_primary_key: false,
            is_foreign_key: false,
        });
        Ok(self)
    }

    fn push_reference<I, S>(
        mut self,
        name: impl Into<String>,
        target_entity: impl Into<String>,
        foreign_key_fields: I,
        targets_primary_key: bool,
    ) -> AppResult<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let foreign_key_fields: Vec<String> =
            foreign_key_fields.into_iter().map(Into::into).collect();
        if foreign_key_fields.is_empty() {
            return Err(AppError::Validation(
                "reference must declare at least one foreign key field".to_owned(),
            ));
        }

        self.references.push(ReferenceModel {
            name: NonEmptyString::new(name)?,
            target_entity: NonEmptyString::new(target_entity)?,
            foreign_key_fields,
            targets_primary_key,
        });
        Ok(self)
    }

    fn require_fields<'a>(
        &self,
        names: impl Iterator<Item = &'a String>,
        role: &str,
    ) -> AppResult<()> {
        for name in names {
            if !self.fields.iter().any(|field| field.name() == name) {
                return Err(AppError::Validation(format!(
                    "{role} field '{name}' is not declared on entity '{}'",
                    self.name
                )));
            }
        }

        Ok(())
    }
}
