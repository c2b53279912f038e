//! Records (models) and field extraction.
//!
//! A [`Model`] is an immutable, uniquely identified record. New instances are
//! produced through [`ModelBuilder`]; "mutating" a record means building a new
//! instance with the same id via [`Model::to_builder`].

use crate::schema::{ModelSchema, ID_FIELD};
use crate::value::json_type_name;
use crate::{error::Result, Error, FieldValue, ModelId, ModelName};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

static NULL: FieldValue = FieldValue::Null;

/// A record of some model type.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Model {
    id: ModelId,
    model_name: ModelName,
    fields: BTreeMap<String, FieldValue>,
}

impl Model {
    /// Start building a record of `model_name` with a fresh UUID.
    pub fn builder(model_name: impl Into<ModelName>) -> ModelBuilder {
        ModelBuilder::new(model_name)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn model_name(&self) -> &str {
        &self.model_name
    }

    /// Value of a field, `None` when the record does not carry it.
    pub fn get(&self, field: &str) -> Option<&FieldValue> {
        if field == ID_FIELD {
            return None;
        }
        self.fields.get(field)
    }

    /// All non-id fields, ordered by name.
    pub fn fields(&self) -> &BTreeMap<String, FieldValue> {
        &self.fields
    }

    /// A builder seeded with this record's id and fields.
    pub fn to_builder(&self) -> ModelBuilder {
        ModelBuilder {
            model_name: self.model_name.clone(),
            id: Some(self.id.clone()),
            fields: self.fields.clone(),
        }
    }

    /// Check the record against its schema: every field must be declared
    /// and stored, values must conform to the declared type, and required
    /// fields must be present.
    pub fn validate(&self, schema: &ModelSchema) -> Result<()> {
        if schema.name != self.model_name {
            return Err(Error::InvalidRecord(format!(
                "record of {} validated against schema {}",
                self.model_name, schema.name
            )));
        }
        for (name, value) in &self.fields {
            let def = schema.require_field(name)?;
            if !def.is_stored() {
                return Err(Error::InvalidRecord(format!(
                    "{}.{} is a hasMany relation and cannot hold a value",
                    schema.name, name
                )));
            }
            if !value.conforms_to(&def.field_type) {
                return Err(Error::TypeMismatch {
                    field: name.clone(),
                    expected: def.field_type.to_string(),
                    got: value.type_name().to_string(),
                });
            }
            if !value.is_finite() {
                return Err(Error::InvalidRecord(format!(
                    "{}.{} holds a NaN or infinite float, which JSON cannot store",
                    schema.name, name
                )));
            }
        }
        for def in schema.stored_fields() {
            if def.required && def.name != ID_FIELD && !self.fields.contains_key(&def.name) {
                return Err(Error::MissingRequiredField {
                    model: schema.name.clone(),
                    field: def.name.clone(),
                });
            }
        }
        Ok(())
    }

    /// Encode as the JSON object stored by drivers (`id` plus every field).
    pub fn to_json(&self) -> serde_json::Value {
        let mut obj = serde_json::Map::new();
        obj.insert(ID_FIELD.to_string(), serde_json::Value::String(self.id.clone()));
        for (name, value) in &self.fields {
            obj.insert(name.clone(), value.to_json());
        }
        serde_json::Value::Object(obj)
    }

    /// Decode a stored JSON object using the schema's declared field types.
    ///
    /// `null` values are treated as absent. Values for hasMany fields are
    /// ignored, since they are resolved from the related table.
    pub fn from_json(schema: &ModelSchema, payload: &serde_json::Value) -> Result<Self> {
        Self::decode(schema, payload, false).map(|(model, _)| model)
    }

    /// Decode a row written by a driver, skipping fields `schema` no longer
    /// declares. Returns the names of the skipped fields.
    pub fn from_stored_json(
        schema: &ModelSchema,
        payload: &serde_json::Value,
    ) -> Result<(Self, Vec<String>)> {
        Self::decode(schema, payload, true)
    }

    fn decode(
        schema: &ModelSchema,
        payload: &serde_json::Value,
        skip_unknown: bool,
    ) -> Result<(Self, Vec<String>)> {
        let obj = payload.as_object().ok_or_else(|| {
            Error::InvalidRecord(format!(
                "{} payload must be an object, got {}",
                schema.name,
                json_type_name(payload)
            ))
        })?;
        let id = match obj.get(ID_FIELD) {
            Some(serde_json::Value::String(id)) => id.clone(),
            _ => {
                return Err(Error::MissingRequiredField {
                    model: schema.name.clone(),
                    field: ID_FIELD.to_string(),
                })
            }
        };
        let mut builder = ModelBuilder::new(schema.name.clone()).id(id);
        let mut unknown = Vec::new();
        for (name, raw) in obj {
            if name == ID_FIELD || raw.is_null() {
                continue;
            }
            let def = match schema.field(name) {
                Some(def) => def,
                None if skip_unknown => {
                    unknown.push(name.clone());
                    continue;
                }
                None => {
                    return Err(Error::FieldNotFound {
                        model: schema.name.clone(),
                        field: name.clone(),
                    })
                }
            };
            if !def.is_stored() {
                continue;
            }
            builder = builder.set(name.clone(), FieldValue::from_json(name, raw, &def.field_type)?);
        }
        let model = builder.build()?;
        model.validate(schema)?;
        Ok((model, unknown))
    }
}

impl fmt::Display for Model {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{{id={}", self.model_name, self.id)?;
        for (name, value) in &self.fields {
            write!(f, ", {}={}", name, value)?;
        }
        write!(f, "}}")
    }
}

/// Runtime-checked builder for [`Model`].
#[derive(Debug, Clone)]
pub struct ModelBuilder {
    model_name: ModelName,
    id: Option<ModelId>,
    fields: BTreeMap<String, FieldValue>,
}

impl ModelBuilder {
    pub fn new(model_name: impl Into<ModelName>) -> Self {
        Self {
            model_name: model_name.into(),
            id: None,
            fields: BTreeMap::new(),
        }
    }

    /// Use an explicit id. It must be a UUID.
    pub fn id(mut self, id: impl Into<ModelId>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Set a field. Setting `Null` removes it.
    pub fn set(mut self, field: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        let field = field.into();
        match value.into() {
            FieldValue::Null => {
                self.fields.remove(&field);
            }
            value => {
                self.fields.insert(field, value);
            }
        }
        self
    }

    /// Build without schema checks beyond the id format.
    pub fn build(self) -> Result<Model> {
        if self.model_name.trim().is_empty() {
            return Err(Error::InvalidRecord("model name must not be empty".into()));
        }
        if self.fields.contains_key(ID_FIELD) {
            return Err(Error::InvalidRecord(
                "the id is set with ModelBuilder::id, not as a field".into(),
            ));
        }
        let id = match self.id {
            Some(id) => {
                uuid::Uuid::parse_str(&id).map_err(|_| Error::InvalidId(id.clone()))?;
                id
            }
            None => uuid::Uuid::new_v4().to_string(),
        };
        Ok(Model {
            id,
            model_name: self.model_name,
            fields: self.fields,
        })
    }

    /// Build and validate against `schema`.
    pub fn build_for(self, schema: &ModelSchema) -> Result<Model> {
        let model = self.build()?;
        model.validate(schema)?;
        Ok(model)
    }
}

/// A Rust struct that maps onto a [`Model`] through serde.
///
/// The struct's serialized form must be an object keyed by field names and
/// must carry an `id` string.
pub trait TypedModel: Serialize + DeserializeOwned {
    /// Name of the model in the schema registry.
    const MODEL_NAME: &'static str;

    fn to_model(&self, schema: &ModelSchema) -> Result<Model> {
        let json =
            serde_json::to_value(self).map_err(|e| Error::InvalidRecord(e.to_string()))?;
        Model::from_json(schema, &json)
    }

    fn from_model(model: &Model) -> Result<Self> {
        if model.model_name() != Self::MODEL_NAME {
            return Err(Error::InvalidRecord(format!(
                "cannot read a {} record as {}",
                model.model_name(),
                Self::MODEL_NAME
            )));
        }
        serde_json::from_value(model.to_json()).map_err(|e| Error::InvalidRecord(e.to_string()))
    }
}

/// Extracts field values from records by name, resolving names against a
/// schema.
#[derive(Debug, Clone, Copy)]
pub struct FieldFinder<'a> {
    schema: &'a ModelSchema,
}

impl<'a> FieldFinder<'a> {
    pub fn new(schema: &'a ModelSchema) -> Self {
        Self { schema }
    }

    /// Value of `field` on `model`. Absent values read as `Null`; names the
    /// schema does not declare fail with `FieldNotFound`.
    pub fn find<'m>(&self, model: &'m Model, field: &str) -> Result<FieldRef<'m>> {
        self.schema.require_field(field)?;
        if field == ID_FIELD {
            return Ok(FieldRef::Id(model.id()));
        }
        Ok(FieldRef::Value(model.get(field).unwrap_or(&NULL)))
    }

    /// Owned value of `field` on a typed record.
    pub fn find_typed<T: TypedModel>(&self, record: &T, field: &str) -> Result<FieldValue> {
        let model = record.to_model(self.schema)?;
        Ok(self.find(&model, field)?.to_value())
    }
}

/// A borrowed field value. The id lives outside the field map, so it is
/// handed out as a plain string.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FieldRef<'m> {
    Id(&'m str),
    Value(&'m FieldValue),
}

impl FieldRef<'_> {
    pub fn to_value(self) -> FieldValue {
        match self {
            FieldRef::Id(id) => FieldValue::String(id.to_string()),
            FieldRef::Value(v) => v.clone(),
        }
    }
}
