//! Model schema definition and validation.
//!
//! A [`ModelSchema`] describes one record type: its fields, which of them are
//! required, and how it relates to other record types. Schemas are collected
//! into a [`SchemaRegistry`], which is passed explicitly to whatever needs to
//! resolve model names (there is no global registry).

use crate::{error::Result, Error, ModelName, SchemaVersion};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

/// Name of the primary key field every model carries.
pub const ID_FIELD: &str = "id";

/// Prefix reserved for internal system tables.
pub const SYSTEM_MODEL_PREFIX: &str = "__";

/// Field types supported in schemas.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FieldType {
    Id,
    String,
    Int,
    Float,
    Bool,
    Date,
    Time,
    DateTime,
    Timestamp,
    /// Arbitrary nested JSON
    Json,
    /// Named enum, stored as its string value
    Enum(String),
    List(Box<FieldType>),
}

impl FieldType {
    /// Whether values of this type have an ordering usable by range operators.
    pub fn is_ordered(&self) -> bool {
        matches!(
            self,
            FieldType::Id
                | FieldType::String
                | FieldType::Int
                | FieldType::Float
                | FieldType::Date
                | FieldType::Time
                | FieldType::DateTime
                | FieldType::Timestamp
                | FieldType::Enum(_)
        )
    }

    /// Date, Time and DateTime: ordered by instant, not by their text.
    pub fn is_temporal(&self) -> bool {
        matches!(self, FieldType::Date | FieldType::Time | FieldType::DateTime)
    }
}

impl std::fmt::Display for FieldType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FieldType::Id => write!(f, "ID"),
            FieldType::String => write!(f, "String"),
            FieldType::Int => write!(f, "Int"),
            FieldType::Float => write!(f, "Float"),
            FieldType::Bool => write!(f, "Boolean"),
            FieldType::Date => write!(f, "AWSDate"),
            FieldType::Time => write!(f, "AWSTime"),
            FieldType::DateTime => write!(f, "AWSDateTime"),
            FieldType::Timestamp => write!(f, "AWSTimestamp"),
            FieldType::Json => write!(f, "AWSJSON"),
            FieldType::Enum(name) => write!(f, "{}", name),
            FieldType::List(inner) => write!(f, "[{}]", inner),
        }
    }
}

/// How a field links to another model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum Relation {
    /// The field stores the id of a `target` record.
    BelongsTo { target: ModelName },
    /// The field is a lazily resolved collection of `target` records whose
    /// `associated_with` field holds this record's id. Not stored.
    #[serde(rename_all = "camelCase")]
    HasMany {
        target: ModelName,
        associated_with: String,
    },
}

/// Definition of a field in a model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldDef {
    /// Field name
    pub name: String,
    /// Field type
    pub field_type: FieldType,
    /// Whether this field is required
    pub required: bool,
    /// Relationship to another model, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub relation: Option<Relation>,
}

impl FieldDef {
    /// Create a new required field definition.
    pub fn required(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
            required: true,
            relation: None,
        }
    }

    /// Create a new optional field definition.
    pub fn optional(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
            required: false,
            relation: None,
        }
    }

    /// A foreign key to `target`.
    pub fn belongs_to(name: impl Into<String>, target: impl Into<ModelName>, required: bool) -> Self {
        Self {
            name: name.into(),
            field_type: FieldType::Id,
            required,
            relation: Some(Relation::BelongsTo {
                target: target.into(),
            }),
        }
    }

    /// A collection of `target` records pointing back through `associated_with`.
    pub fn has_many(
        name: impl Into<String>,
        target: impl Into<ModelName>,
        associated_with: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            field_type: FieldType::List(Box::new(FieldType::Id)),
            required: false,
            relation: Some(Relation::HasMany {
                target: target.into(),
                associated_with: associated_with.into(),
            }),
        }
    }

    /// Whether values of this field are persisted with the record.
    pub fn is_stored(&self) -> bool {
        !matches!(self.relation, Some(Relation::HasMany { .. }))
    }

    /// Validate a JSON value against this field definition.
    pub fn validate(&self, model: &str, value: Option<&serde_json::Value>) -> Result<()> {
        match value {
            None | Some(serde_json::Value::Null) if self.required => {
                Err(Error::MissingRequiredField {
                    model: model.to_string(),
                    field: self.name.clone(),
                })
            }
            None | Some(serde_json::Value::Null) => Ok(()),
            Some(v) => crate::FieldValue::from_json(&self.name, v, &self.field_type).map(|_| ()),
        }
    }
}

/// Schema for a single model type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelSchema {
    /// Model name
    pub name: ModelName,
    /// Field definitions, `id` first
    pub fields: Vec<FieldDef>,
}

impl ModelSchema {
    /// Create a new model schema. An `id` field is added when absent.
    pub fn new(name: impl Into<ModelName>, fields: Vec<FieldDef>) -> Self {
        let mut fields = fields;
        if !fields.iter().any(|f| f.name == ID_FIELD) {
            fields.insert(0, FieldDef::required(ID_FIELD, FieldType::Id));
        }
        Self {
            name: name.into(),
            fields,
        }
    }

    /// Look a field up by name.
    pub fn field(&self, name: &str) -> Option<&FieldDef> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Look a field up by name, failing when the schema has no such field.
    pub fn require_field(&self, name: &str) -> Result<&FieldDef> {
        self.field(name).ok_or_else(|| Error::FieldNotFound {
            model: self.name.clone(),
            field: name.to_string(),
        })
    }

    /// Fields persisted with each record.
    pub fn stored_fields(&self) -> impl Iterator<Item = &FieldDef> {
        self.fields.iter().filter(|f| f.is_stored())
    }

    /// Check the definition itself for malformed annotations.
    pub fn validate_definition(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(Error::InvalidSchema("model name must not be empty".into()));
        }
        let mut seen = HashSet::new();
        for field in &self.fields {
            if !is_identifier(&field.name) {
                return Err(Error::InvalidSchema(format!(
                    "model {} has a field named '{}'; field names must be identifiers",
                    self.name, field.name
                )));
            }
            if !seen.insert(field.name.as_str()) {
                return Err(Error::InvalidSchema(format!(
                    "model {} declares field '{}' more than once",
                    self.name, field.name
                )));
            }
            if let FieldType::Enum(enum_name) = &field.field_type {
                if enum_name.trim().is_empty() {
                    return Err(Error::InvalidSchema(format!(
                        "enum field '{}' on {} has no enum type name",
                        field.name, self.name
                    )));
                }
            }
            if let Some(Relation::HasMany { associated_with, .. }) = &field.relation {
                if field.required || associated_with.trim().is_empty() {
                    return Err(Error::InvalidSchema(format!(
                        "hasMany field '{}' on {} must be optional and name its associated field",
                        field.name, self.name
                    )));
                }
            }
        }
        let id = self.require_field(ID_FIELD)?;
        if id.field_type != FieldType::Id || !id.required {
            return Err(Error::InvalidSchema(format!(
                "model {} must declare '{}' as a required ID",
                self.name, ID_FIELD
            )));
        }
        Ok(())
    }

    /// Validate a JSON payload against this schema.
    pub fn validate_payload(&self, payload: &serde_json::Value) -> Result<()> {
        let obj = payload
            .as_object()
            .ok_or_else(|| Error::InvalidRecord("payload must be an object".into()))?;

        for field in self.stored_fields() {
            field.validate(&self.name, obj.get(&field.name))?;
        }

        Ok(())
    }
}

/// `[A-Za-z_][A-Za-z0-9_]*`, the names that can appear in a JSON path.
pub fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Registry of every model schema known to a store.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchemaRegistry {
    /// Schema version for migrations
    pub version: SchemaVersion,
    /// Model schemas by name
    pub models: BTreeMap<ModelName, ModelSchema>,
}

impl SchemaRegistry {
    /// Create a new, empty registry.
    pub fn new(version: SchemaVersion) -> Self {
        Self {
            version,
            models: BTreeMap::new(),
        }
    }

    /// Build a registry from a list of schemas, validating all of them.
    pub fn from_schemas(version: SchemaVersion, schemas: Vec<ModelSchema>) -> Result<Self> {
        let mut registry = Self::new(version);
        for schema in schemas {
            registry.register(schema)?;
        }
        registry.validate()?;
        Ok(registry)
    }

    /// Add a model schema. Duplicate names and reserved names are rejected.
    pub fn register(&mut self, schema: ModelSchema) -> Result<&mut Self> {
        schema.validate_definition()?;
        if schema.name.starts_with(SYSTEM_MODEL_PREFIX) {
            return Err(Error::InvalidSchema(format!(
                "model name {} uses the reserved prefix '{}'",
                schema.name, SYSTEM_MODEL_PREFIX
            )));
        }
        if self.models.contains_key(&schema.name) {
            return Err(Error::InvalidSchema(format!(
                "model {} is registered more than once",
                schema.name
            )));
        }
        self.models.insert(schema.name.clone(), schema);
        Ok(self)
    }

    /// Builder-style method to add a model.
    pub fn with_model(mut self, schema: ModelSchema) -> Result<Self> {
        self.register(schema)?;
        Ok(self)
    }

    /// Get a model schema by name.
    pub fn get(&self, name: &str) -> Result<&ModelSchema> {
        self.models
            .get(name)
            .ok_or_else(|| Error::ModelNotFound(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.models.contains_key(name)
    }

    pub fn schemas(&self) -> impl Iterator<Item = &ModelSchema> {
        self.models.values()
    }

    /// Check that every relation points at a registered model and field.
    pub fn validate(&self) -> Result<()> {
        for schema in self.models.values() {
            for field in &schema.fields {
                match &field.relation {
                    Some(Relation::BelongsTo { target }) => {
                        if !self.models.contains_key(target) {
                            return Err(Error::InvalidSchema(format!(
                                "{}.{} belongs to unknown model {}",
                                schema.name, field.name, target
                            )));
                        }
                    }
                    Some(Relation::HasMany {
                        target,
                        associated_with,
                    }) => {
                        let child = self.models.get(target).ok_or_else(|| {
                            Error::InvalidSchema(format!(
                                "{}.{} has many of unknown model {}",
                                schema.name, field.name, target
                            ))
                        })?;
                        if child.field(associated_with).is_none() {
                            return Err(Error::InvalidSchema(format!(
                                "{}.{} is associated with missing field {}.{}",
                                schema.name, field.name, target, associated_with
                            )));
                        }
                    }
                    None => {}
                }
            }
        }
        Ok(())
    }

    /// Models that hold foreign keys to `parent` through a hasMany relation,
    /// as `(child schema, foreign key field)` pairs.
    pub fn children_of(&self, parent: &str) -> Vec<(&ModelSchema, &str)> {
        let Some(schema) = self.models.get(parent) else {
            return Vec::new();
        };
        schema
            .fields
            .iter()
            .filter_map(|field| match &field.relation {
                Some(Relation::HasMany {
                    target,
                    associated_with,
                }) => self
                    .models
                    .get(target)
                    .map(|child| (child, associated_with.as_str())),
                _ => None,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn todo_schema() -> ModelSchema {
        ModelSchema::new(
            "Todo",
            vec![
                FieldDef::required("title", FieldType::String),
                FieldDef::required("priority", FieldType::Int),
                FieldDef::optional("due", FieldType::Date),
            ],
        )
    }

    fn blog_registry() -> SchemaRegistry {
        SchemaRegistry::from_schemas(
            1,
            vec![
                ModelSchema::new(
                    "Blog",
                    vec![
                        FieldDef::required("name", FieldType::String),
                        FieldDef::has_many("posts", "Post", "blogId"),
                    ],
                ),
                ModelSchema::new(
                    "Post",
                    vec![
                        FieldDef::required("title", FieldType::String),
                        FieldDef::belongs_to("blogId", "Blog", false),
                    ],
                ),
            ],
        )
        .unwrap()
    }

    #[test]
    fn id_field_is_added() {
        let schema = todo_schema();
        assert_eq!(schema.fields[0].name, "id");
        assert_eq!(schema.fields[0].field_type, FieldType::Id);
        assert!(schema.validate_definition().is_ok());
    }

    #[test]
    fn validate_valid_payload() {
        let schema = todo_schema();
        let payload = json!({"id": "a", "title": "Buy milk", "priority": 1});
        assert!(schema.validate_payload(&payload).is_ok());

        let with_optional = json!({"id": "a", "title": "Buy milk", "priority": 1, "due": "2024-01-01"});
        assert!(schema.validate_payload(&with_optional).is_ok());
    }

    #[test]
    fn validate_missing_required_field() {
        let schema = todo_schema();
        let result = schema.validate_payload(&json!({"id": "a", "title": "Buy milk"}));
        assert!(matches!(result, Err(Error::MissingRequiredField { field, .. }) if field == "priority"));
    }

    #[test]
    fn validate_wrong_type() {
        let schema = todo_schema();
        let result = schema.validate_payload(&json!({"id": "a", "title": "x", "priority": "high"}));
        assert!(matches!(result, Err(Error::TypeMismatch { field, .. }) if field == "priority"));
    }

    #[test]
    fn duplicate_field_names_rejected() {
        let schema = ModelSchema::new(
            "Todo",
            vec![
                FieldDef::required("title", FieldType::String),
                FieldDef::optional("title", FieldType::String),
            ],
        );
        assert!(matches!(
            schema.validate_definition(),
            Err(Error::InvalidSchema(_))
        ));
    }

    #[test]
    fn field_names_must_be_identifiers() {
        for name in ["o'clock", "", "2fa", "due date", "a.b", "x\"y"] {
            let schema = ModelSchema::new("Todo", vec![FieldDef::optional(name, FieldType::String)]);
            assert!(
                matches!(schema.validate_definition(), Err(Error::InvalidSchema(_))),
                "{:?} accepted",
                name
            );
        }
        assert!(is_identifier("_owner2"));
        assert!(is_identifier("createdAt"));
    }

    #[test]
    fn id_must_be_required_id() {
        let schema = ModelSchema::new("Todo", vec![FieldDef::optional("id", FieldType::String)]);
        assert!(matches!(
            schema.validate_definition(),
            Err(Error::InvalidSchema(_))
        ));
    }

    #[test]
    fn duplicate_models_rejected() {
        let result = SchemaRegistry::from_schemas(1, vec![todo_schema(), todo_schema()]);
        assert!(matches!(result, Err(Error::InvalidSchema(msg)) if msg.contains("more than once")));
    }

    #[test]
    fn reserved_prefix_rejected() {
        let mut registry = SchemaRegistry::new(1);
        let result = registry.register(ModelSchema::new("__Internal", vec![]));
        assert!(matches!(result, Err(Error::InvalidSchema(_))));
    }

    #[test]
    fn unknown_relation_target_rejected() {
        let result = SchemaRegistry::from_schemas(
            1,
            vec![ModelSchema::new(
                "Post",
                vec![FieldDef::belongs_to("blogId", "Blog", true)],
            )],
        );
        assert!(matches!(result, Err(Error::InvalidSchema(msg)) if msg.contains("unknown model Blog")));
    }

    #[test]
    fn children_of_follows_has_many() {
        let registry = blog_registry();
        let children = registry.children_of("Blog");
        assert_eq!(children.len(), 1);
        assert_eq!(children[0].0.name, "Post");
        assert_eq!(children[0].1, "blogId");
        assert!(registry.children_of("Post").is_empty());
    }

    #[test]
    fn has_many_fields_are_not_stored() {
        let registry = blog_registry();
        let blog = registry.get("Blog").unwrap();
        let stored: Vec<_> = blog.stored_fields().map(|f| f.name.as_str()).collect();
        assert_eq!(stored, vec!["id", "name"]);
    }

    #[test]
    fn model_not_found() {
        let registry = blog_registry();
        assert!(matches!(registry.get("Comment"), Err(Error::ModelNotFound(m)) if m == "Comment"));
    }

    #[test]
    fn field_type_display() {
        assert_eq!(FieldType::Bool.to_string(), "Boolean");
        assert_eq!(FieldType::DateTime.to_string(), "AWSDateTime");
        assert_eq!(
            FieldType::List(Box::new(FieldType::String)).to_string(),
            "[String]"
        );
    }

    #[test]
    fn registry_serialization() {
        let registry = blog_registry();
        let json = serde_json::to_string(&registry).unwrap();
        let parsed: SchemaRegistry = serde_json::from_str(&json).unwrap();
        assert_eq!(registry, parsed);
    }
}
