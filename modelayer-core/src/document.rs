//! Runtime documents.
//!
//! A [`Document`] is one record of a model: its raw BSON data plus the schema it belongs to.
//! Documents come out of finds, go into inserts and are what hooks receive in
//! [`HookState::docs`](crate::hook::HookState).
//!
//! Reads through [`Document::get`] are virtual-aware: an unpinned virtual is recomputed by its
//! getter on every read, so a getter reading another virtual sees that virtual's current value
//! even when it was never materialized.

use bson::{
    Bson, Document as BsonDocument, de::deserialize_from_bson, oid::ObjectId,
    ser::serialize_to_bson,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::{collections::HashSet, fmt, sync::Arc};

use crate::{
    error::{ModelError, ModelResult},
    projection::get_path,
    schema::Schema,
};

/// Name of the primary key field of every model.
pub const PRIMARY_KEY: &str = "_id";

#[derive(Clone)]
pub struct Document {
    schema: Arc<Schema>,
    data: BsonDocument,
    /// Virtuals whose materialized value is pinned and no longer recomputed.
    pinned: HashSet<String>,
}

impl Document {
    /// Wraps a document as read from storage.
    pub fn from_store(schema: Arc<Schema>, data: BsonDocument) -> Self {
        Self { schema, data, pinned: HashSet::new() }
    }

    /// Builds a new document from a caller payload, ready to be persisted.
    ///
    /// Payload keys naming a virtual go through the virtual's setter (after plain fields are
    /// copied), missing fields receive their defaults, a primary key is generated when absent
    /// and the result is validated against the schema.
    pub fn for_insert(schema: Arc<Schema>, payload: BsonDocument) -> ModelResult<Self> {
        let mut document = Self::from_store(Arc::clone(&schema), BsonDocument::new());
        let mut assignments = Vec::new();

        for (key, value) in payload {
            if let Some(definition) = schema.virtual_field(&key) {
                let setter = definition.setter.clone().ok_or_else(|| {
                    ModelError::validation(format!(
                        "virtual `{key}` on model `{}` is read-only",
                        schema.name()
                    ))
                })?;
                assignments.push((setter, value));
            } else if schema.relationship(&key).is_some() {
                return Err(ModelError::validation(format!(
                    "relationship `{key}` on model `{}` cannot be assigned directly",
                    schema.name()
                )));
            } else {
                document.data.insert(key, value);
            }
        }

        for (setter, value) in assignments {
            setter(&mut document, value)?;
        }

        for field in schema.fields() {
            if document.data.contains_key(&field.name) {
                continue;
            }

            if let Some(default) = &field.default {
                let value = default.resolve(&document.data);
                document.data.insert(field.name.clone(), value);
            }
        }

        if !document.data.contains_key(PRIMARY_KEY) {
            document.data.insert(PRIMARY_KEY, ObjectId::new());
        }

        document.validate()?;
        Ok(document)
    }

    /// Checks required fields and field types.
    pub fn validate(&self) -> ModelResult<()> {
        for field in self.schema.fields() {
            match self.data.get(&field.name) {
                None | Some(Bson::Null) if field.required => {
                    return Err(ModelError::validation(format!(
                        "field `{}` on model `{}` is required",
                        field.name,
                        self.schema.name()
                    )));
                }
                Some(value) if !field.field_type.accepts(value) => {
                    return Err(ModelError::validation(format!(
                        "field `{}` on model `{}` expects {:?}, got {:?}",
                        field.name,
                        self.schema.name(),
                        field.field_type,
                        value.element_type()
                    )));
                }
                _ => {}
            }
        }

        Ok(())
    }

    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    pub fn id(&self) -> Option<&Bson> {
        self.data.get(PRIMARY_KEY)
    }

    /// Raw data, including materialized virtuals and populated relationships.
    pub fn data(&self) -> &BsonDocument {
        &self.data
    }

    pub(crate) fn data_mut(&mut self) -> &mut BsonDocument {
        &mut self.data
    }

    /// Replaces the raw data. Pins of keys that no longer exist are dropped.
    pub(crate) fn replace_data(&mut self, data: BsonDocument) {
        self.pinned.retain(|key| data.contains_key(key));
        self.data = data;
    }

    pub(crate) fn pin(&mut self, name: &str) {
        self.pinned.insert(name.to_string());
    }

    pub fn is_pinned(&self, name: &str) -> bool {
        self.pinned.contains(name)
    }

    /// Whether `name` has a value stored on the document itself, as opposed to one that
    /// would be computed by a getter.
    pub fn has_own(&self, name: &str) -> bool {
        self.data.contains_key(name)
    }

    /// Reads a top-level value.
    ///
    /// Virtuals are recomputed from their getter unless their value is pinned.
    pub fn get(&self, name: &str) -> Option<Bson> {
        match self.schema.virtual_field(name) {
            Some(definition) if !self.pinned.contains(name) && definition.getter.is_some() => {
                definition.compute(self).or_else(|| self.data.get(name).cloned())
            }
            _ => self.data.get(name).cloned(),
        }
    }

    /// Reads a dot-path from the raw data.
    pub fn get_path(&self, path: &str) -> Option<&Bson> {
        get_path(&self.data, path)
    }

    /// Assigns a top-level value. Virtuals are assigned through their setter.
    pub fn set(&mut self, name: &str, value: impl Into<Bson>) -> ModelResult<()> {
        let value = value.into();
        let schema = Arc::clone(&self.schema);

        if let Some(definition) = schema.virtual_field(name) {
            let setter = definition.setter.as_ref().ok_or_else(|| {
                ModelError::validation(format!(
                    "virtual `{name}` on model `{}` is read-only",
                    schema.name()
                ))
            })?;
            return setter(self, value);
        }

        if schema.relationship(name).is_some() {
            return Err(ModelError::validation(format!(
                "relationship `{name}` on model `{}` cannot be assigned directly",
                schema.name()
            )));
        }

        self.data.insert(name, value);
        Ok(())
    }

    pub fn remove(&mut self, name: &str) -> Option<Bson> {
        self.pinned.remove(name);
        self.data.remove(name)
    }

    /// The document as presented to callers: hidden fields removed.
    pub fn to_output(&self) -> BsonDocument {
        self.data
            .iter()
            .filter(|(key, _)| self.schema.field(key).is_none_or(|field| field.output))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect()
    }

    /// The document as written to storage: virtuals, populated relationships and transient
    /// fields removed.
    pub fn to_persisted(&self) -> BsonDocument {
        self.data
            .iter()
            .filter(|(key, _)| !self.schema.is_computed(key))
            .filter(|(key, _)| self.schema.field(key).is_none_or(|field| field.persisted))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect()
    }

    /// Deserializes the output form into a typed value.
    pub fn deserialize<T>(&self) -> ModelResult<T>
    where
        T: for<'de> Deserialize<'de>,
    {
        Ok(deserialize_from_bson(Bson::Document(self.to_output()))?)
    }

    pub fn to_json(&self) -> ModelResult<Value> {
        Ok(serde_json::to_value(self.to_output())?)
    }
}

impl fmt::Debug for Document {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Document")
            .field("model", &self.schema.name())
            .field("data", &self.data)
            .finish()
    }
}

/// Serializes a typed value into an insert payload.
pub fn to_payload<T: Serialize>(value: &T) -> ModelResult<BsonDocument> {
    match serialize_to_bson(value)? {
        Bson::Document(document) => Ok(document),
        other => Err(ModelError::Serialization(format!(
            "expected a document payload, got {:?}",
            other.element_type()
        ))),
    }
}
