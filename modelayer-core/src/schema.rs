//! Model schemas.
//!
//! A [`Schema`] is the static description of one model: its stored fields, its virtual
//! (computed) fields, its relationships to other models and its lifecycle hooks. Schemas are
//! immutable once built and are shared between the connection registry and every document
//! they produce.
//!
//! Field, virtual and relationship names live in one namespace. Registering a relationship
//! also registers its left-key field (unless declared explicitly) and an `afterFind` hook named
//! after the relationship that performs population.
//!
//! ```ignore
//! use modelayer::schema::{FieldDef, FieldType, RelationshipDef, SchemaBuilder, VirtualDef};
//!
//! let posts = SchemaBuilder::new("posts")
//!     .field(FieldDef::new("title", FieldType::String).required())
//!     .virtual_field(
//!         VirtualDef::new("headline")
//!             .requires(["title"])
//!             .get(|doc| doc.get("title").map(|title| format!("** {title} **").into())),
//!     )
//!     .relationship(RelationshipDef::single("author", "users"))
//!     .build()?;
//! ```

use bson::{Bson, Document as BsonDocument};
use indexmap::IndexMap;
use std::{collections::HashMap, fmt, sync::Arc};

use crate::{
    document::{Document, PRIMARY_KEY},
    error::{ModelError, ModelResult},
    hook::{HookDef, HookRef, Phase},
    projection::split_root,
};

/// Key holding the target id inside a polymorphic foreign key.
pub const POLYMORPHIC_ID_KEY: &str = "id";
/// Key holding the target model name inside a polymorphic foreign key.
pub const POLYMORPHIC_MODEL_KEY: &str = "modelName";

/// Storage type of a field, checked when documents are created for insertion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FieldType {
    #[default]
    Any,
    String,
    Int,
    Double,
    Bool,
    DateTime,
    ObjectId,
    Array,
    Document,
}

impl FieldType {
    /// Whether `value` is acceptable for this type. `null` is accepted everywhere.
    pub fn accepts(&self, value: &Bson) -> bool {
        match (self, value) {
            (_, Bson::Null) | (FieldType::Any, _) => true,
            (FieldType::String, Bson::String(_)) => true,
            (FieldType::Int, Bson::Int32(_) | Bson::Int64(_)) => true,
            (FieldType::Double, Bson::Double(_) | Bson::Int32(_) | Bson::Int64(_)) => true,
            (FieldType::Bool, Bson::Boolean(_)) => true,
            (FieldType::DateTime, Bson::DateTime(_)) => true,
            (FieldType::ObjectId, Bson::ObjectId(_)) => true,
            (FieldType::Array, Bson::Array(_)) => true,
            (FieldType::Document, Bson::Document(_)) => true,
            _ => false,
        }
    }
}

pub type ComputedDefault = Arc<dyn Fn(&BsonDocument) -> Bson + Send + Sync>;

#[derive(Clone)]
pub enum DefaultValue {
    Static(Bson),
    /// Computed from the document's data as it stands before defaults are applied.
    Computed(ComputedDefault),
}

impl DefaultValue {
    pub fn resolve(&self, data: &BsonDocument) -> Bson {
        match self {
            DefaultValue::Static(value) => value.clone(),
            DefaultValue::Computed(compute) => compute(data),
        }
    }
}

impl fmt::Debug for DefaultValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DefaultValue::Static(value) => f.debug_tuple("Static").field(value).finish(),
            DefaultValue::Computed(_) => f.write_str("Computed(..)"),
        }
    }
}

/// A stored field.
#[derive(Debug, Clone)]
pub struct FieldDef {
    pub name: String,
    pub field_type: FieldType,
    pub default: Option<DefaultValue>,
    pub required: bool,
    /// Written to storage on insert and save.
    pub persisted: bool,
    /// Included in [`Document::to_output`].
    pub output: bool,
}

impl FieldDef {
    pub fn new(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
            default: None,
            required: false,
            persisted: true,
            output: true,
        }
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    /// Keeps the field in memory only.
    pub fn transient(mut self) -> Self {
        self.persisted = false;
        self
    }

    /// Hides the field from output serialization.
    pub fn hidden(mut self) -> Self {
        self.output = false;
        self
    }

    pub fn default_value(mut self, value: impl Into<Bson>) -> Self {
        self.default = Some(DefaultValue::Static(value.into()));
        self
    }

    pub fn default_with<F>(mut self, compute: F) -> Self
    where
        F: Fn(&BsonDocument) -> Bson + Send + Sync + 'static,
    {
        self.default = Some(DefaultValue::Computed(Arc::new(compute)));
        self
    }
}

pub type VirtualGetter = Arc<dyn Fn(&Document) -> Option<Bson> + Send + Sync>;
pub type VirtualSetter = Arc<dyn Fn(&mut Document, Bson) -> ModelResult<()> + Send + Sync>;

/// A computed field.
///
/// `required_fields` lists the paths the getter reads (stored fields, other virtuals or
/// relationship paths like `author.name`). `required_hooks` lists hooks that must run for the
/// getter to see its inputs, in `<phase>_<name>` form, optionally prefixed by a relationship.
#[derive(Clone)]
pub struct VirtualDef {
    pub name: String,
    pub getter: Option<VirtualGetter>,
    pub setter: Option<VirtualSetter>,
    /// Materialized when a find selects all fields.
    pub enumerable: bool,
    /// Pins the first materialized value on the document.
    pub cache: bool,
    pub required_fields: Vec<String>,
    pub required_hooks: Vec<String>,
}

impl VirtualDef {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            getter: None,
            setter: None,
            enumerable: true,
            cache: false,
            required_fields: Vec::new(),
            required_hooks: Vec::new(),
        }
    }

    pub fn get<F>(mut self, getter: F) -> Self
    where
        F: Fn(&Document) -> Option<Bson> + Send + Sync + 'static,
    {
        self.getter = Some(Arc::new(getter));
        self
    }

    pub fn set<F>(mut self, setter: F) -> Self
    where
        F: Fn(&mut Document, Bson) -> ModelResult<()> + Send + Sync + 'static,
    {
        self.setter = Some(Arc::new(setter));
        self
    }

    pub fn cached(mut self) -> Self {
        self.cache = true;
        self
    }

    pub fn non_enumerable(mut self) -> Self {
        self.enumerable = false;
        self
    }

    pub fn requires<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.required_fields.extend(fields.into_iter().map(Into::into));
        self
    }

    pub fn requires_hooks<I, S>(mut self, hooks: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.required_hooks.extend(hooks.into_iter().map(Into::into));
        self
    }

    /// Invokes the getter against `document`. A virtual without a getter has no value.
    pub fn compute(&self, document: &Document) -> Option<Bson> {
        self.getter.as_ref().and_then(|getter| getter(document))
    }
}

impl fmt::Debug for VirtualDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VirtualDef")
            .field("name", &self.name)
            .field("getter", &self.getter.is_some())
            .field("setter", &self.setter.is_some())
            .field("enumerable", &self.enumerable)
            .field("cache", &self.cache)
            .field("required_fields", &self.required_fields)
            .field("required_hooks", &self.required_hooks)
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cardinality {
    Single,
    Multiple,
}

/// A link from this model to documents of one or more target models.
///
/// The left key is the field on this model holding the foreign key(s); it defaults to
/// `<name>_id` for single and `<name>_ids` for multiple relationships. The right key is the
/// matched field on the target and defaults to the primary key. Polymorphic relationships
/// store `{ id, modelName }` documents instead of bare ids.
#[derive(Debug, Clone, PartialEq)]
pub struct RelationshipDef {
    pub name: String,
    pub cardinality: Cardinality,
    pub polymorphic: bool,
    pub targets: Vec<String>,
    left_key: Option<String>,
    right_key: Option<String>,
}

impl RelationshipDef {
    pub fn single(name: impl Into<String>, target: impl Into<String>) -> Self {
        Self::new(name, Cardinality::Single, false, vec![target.into()])
    }

    pub fn multiple(name: impl Into<String>, target: impl Into<String>) -> Self {
        Self::new(name, Cardinality::Multiple, false, vec![target.into()])
    }

    pub fn polymorphic<I, S>(name: impl Into<String>, cardinality: Cardinality, targets: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(name, cardinality, true, targets.into_iter().map(Into::into).collect())
    }

    fn new(name: impl Into<String>, cardinality: Cardinality, polymorphic: bool, targets: Vec<String>) -> Self {
        Self {
            name: name.into(),
            cardinality,
            polymorphic,
            targets,
            left_key: None,
            right_key: None,
        }
    }

    pub fn with_left_key(mut self, key: impl Into<String>) -> Self {
        self.left_key = Some(key.into());
        self
    }

    pub fn with_right_key(mut self, key: impl Into<String>) -> Self {
        self.right_key = Some(key.into());
        self
    }

    pub fn left_key(&self) -> String {
        match (&self.left_key, self.cardinality) {
            (Some(key), _) => key.clone(),
            (None, Cardinality::Single) => format!("{}_id", self.name),
            (None, Cardinality::Multiple) => format!("{}_ids", self.name),
        }
    }

    pub fn right_key(&self) -> &str {
        self.right_key.as_deref().unwrap_or(PRIMARY_KEY)
    }

    pub fn is_multiple(&self) -> bool {
        self.cardinality == Cardinality::Multiple
    }

    fn left_key_type(&self) -> FieldType {
        match (self.cardinality, self.polymorphic) {
            (Cardinality::Multiple, _) => FieldType::Array,
            (Cardinality::Single, true) => FieldType::Document,
            (Cardinality::Single, false) => FieldType::Any,
        }
    }
}

/// The static description of a model.
#[derive(Clone)]
pub struct Schema {
    name: String,
    collection: String,
    fields: IndexMap<String, FieldDef>,
    virtuals: IndexMap<String, VirtualDef>,
    relationships: IndexMap<String, RelationshipDef>,
    hooks: HashMap<Phase, IndexMap<String, HookDef>>,
}

impl Schema {
    /// Creates an empty schema whose collection is named after the model.
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            collection: name.clone(),
            name,
            fields: IndexMap::new(),
            virtuals: IndexMap::new(),
            relationships: IndexMap::new(),
            hooks: HashMap::new(),
        }
    }

    pub fn builder(name: impl Into<String>) -> SchemaBuilder {
        SchemaBuilder::new(name)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    pub fn set_collection(&mut self, collection: impl Into<String>) {
        self.collection = collection.into();
    }

    pub fn add_field(&mut self, field: FieldDef) -> ModelResult<()> {
        self.ensure_name_free(&field.name)?;
        self.fields.insert(field.name.clone(), field);
        Ok(())
    }

    pub fn add_virtual(&mut self, definition: VirtualDef) -> ModelResult<()> {
        self.ensure_name_free(&definition.name)?;

        for hook in &definition.required_hooks {
            if let (_, None) = split_root(hook) {
                HookRef::parse(hook)?;
            }
        }

        self.virtuals.insert(definition.name.clone(), definition);
        Ok(())
    }

    pub fn add_relationship(&mut self, relationship: RelationshipDef) -> ModelResult<()> {
        self.ensure_name_free(&relationship.name)?;

        if relationship.targets.is_empty() {
            return Err(ModelError::configuration(format!(
                "relationship `{}` on model `{}` has no target model",
                relationship.name, self.name
            )));
        }

        if !relationship.polymorphic && relationship.targets.len() > 1 {
            return Err(ModelError::configuration(format!(
                "relationship `{}` on model `{}` has several targets but is not polymorphic",
                relationship.name, self.name
            )));
        }

        let left_key = relationship.left_key();
        if self.virtuals.contains_key(&left_key) || self.relationships.contains_key(&left_key) {
            return Err(ModelError::configuration(format!(
                "left key `{left_key}` of relationship `{}` collides with another member of `{}`",
                relationship.name, self.name
            )));
        }

        self.add_hook(HookDef::populate(&relationship.name))?;

        if !self.fields.contains_key(&left_key) {
            let field = FieldDef::new(left_key.clone(), relationship.left_key_type());
            self.fields.insert(left_key, field);
        }

        self.relationships.insert(relationship.name.clone(), relationship);
        Ok(())
    }

    pub fn add_hook(&mut self, hook: HookDef) -> ModelResult<()> {
        let phase_hooks = self.hooks.entry(hook.phase).or_default();

        if phase_hooks.contains_key(&hook.name) {
            return Err(ModelError::configuration(format!(
                "hook `{}` is already registered on model `{}`",
                hook.hook_ref(),
                self.name
            )));
        }

        phase_hooks.insert(hook.name.clone(), hook);
        Ok(())
    }

    fn ensure_name_free(&self, name: &str) -> ModelResult<()> {
        if name.is_empty() || name.contains(crate::projection::PATH_SEPARATOR) {
            return Err(ModelError::configuration(format!(
                "invalid member name `{name}` on model `{}`",
                self.name
            )));
        }

        if self.fields.contains_key(name)
            || self.virtuals.contains_key(name)
            || self.relationships.contains_key(name)
        {
            return Err(ModelError::configuration(format!(
                "`{name}` is already defined on model `{}`",
                self.name
            )));
        }

        Ok(())
    }

    pub fn field(&self, name: &str) -> Option<&FieldDef> {
        self.fields.get(name)
    }

    pub fn fields(&self) -> impl Iterator<Item = &FieldDef> {
        self.fields.values()
    }

    pub fn virtual_field(&self, name: &str) -> Option<&VirtualDef> {
        self.virtuals.get(name)
    }

    pub fn virtuals(&self) -> impl Iterator<Item = &VirtualDef> {
        self.virtuals.values()
    }

    pub fn relationship(&self, name: &str) -> Option<&RelationshipDef> {
        self.relationships.get(name)
    }

    pub fn relationships(&self) -> impl Iterator<Item = &RelationshipDef> {
        self.relationships.values()
    }

    pub fn hook(&self, phase: Phase, name: &str) -> Option<&HookDef> {
        self.hooks.get(&phase).and_then(|hooks| hooks.get(name))
    }

    /// Hooks registered for `phase`, in registration order.
    pub fn hooks_for(&self, phase: Phase) -> impl Iterator<Item = &HookDef> {
        self.hooks.get(&phase).into_iter().flat_map(|hooks| hooks.values())
    }

    /// Whether `name` is a virtual or relationship, i.e. not something storage knows about.
    pub fn is_computed(&self, name: &str) -> bool {
        self.virtuals.contains_key(name) || self.relationships.contains_key(name)
    }
}

impl fmt::Debug for Schema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Schema")
            .field("name", &self.name)
            .field("collection", &self.collection)
            .field("fields", &self.fields.keys().collect::<Vec<_>>())
            .field("virtuals", &self.virtuals.keys().collect::<Vec<_>>())
            .field("relationships", &self.relationships.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Fluent construction of a [`Schema`].
///
/// Definition errors are collected and reported by [`SchemaBuilder::build`], so a chain of
/// calls never needs intermediate `?`s.
pub struct SchemaBuilder {
    schema: Schema,
    error: Option<ModelError>,
}

impl SchemaBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self { schema: Schema::new(name), error: None }
    }

    pub fn collection(mut self, collection: impl Into<String>) -> Self {
        self.schema.set_collection(collection);
        self
    }

    pub fn field(self, field: FieldDef) -> Self {
        self.apply(|schema| schema.add_field(field))
    }

    pub fn virtual_field(self, definition: VirtualDef) -> Self {
        self.apply(|schema| schema.add_virtual(definition))
    }

    pub fn relationship(self, relationship: RelationshipDef) -> Self {
        self.apply(|schema| schema.add_relationship(relationship))
    }

    pub fn hook(self, hook: HookDef) -> Self {
        self.apply(|schema| schema.add_hook(hook))
    }

    fn apply(mut self, step: impl FnOnce(&mut Schema) -> ModelResult<()>) -> Self {
        if self.error.is_none() {
            if let Err(err) = step(&mut self.schema) {
                self.error = Some(err);
            }
        }
        self
    }

    pub fn build(self) -> ModelResult<Schema> {
        match self.error {
            Some(err) => Err(err),
            None => Ok(self.schema),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hook::HookState;

    fn noop(state: HookState, _args: Option<Bson>) -> ModelResult<HookState> {
        Ok(state)
    }

    #[test]
    fn relationship_registers_left_key_and_populate_hook() {
        let schema = Schema::builder("posts")
            .relationship(RelationshipDef::single("author", "users"))
            .relationship(RelationshipDef::multiple("tags", "tags"))
            .build()
            .unwrap();

        assert_eq!(schema.field("author_id").map(|f| f.field_type), Some(FieldType::Any));
        assert_eq!(schema.field("tags_ids").map(|f| f.field_type), Some(FieldType::Array));
        assert!(schema.hook(Phase::AfterFind, "author").is_some_and(HookDef::is_populate));
        assert!(schema.hook(Phase::AfterFind, "tags").is_some_and(HookDef::is_populate));
        assert_eq!(schema.relationship("author").map(RelationshipDef::right_key), Some("_id"));
    }

    #[test]
    fn explicit_left_key_field_is_kept() {
        let schema = Schema::builder("posts")
            .field(FieldDef::new("writer", FieldType::ObjectId).required())
            .relationship(RelationshipDef::single("author", "users").with_left_key("writer"))
            .build()
            .unwrap();

        let field = schema.field("writer").unwrap();
        assert_eq!(field.field_type, FieldType::ObjectId);
        assert!(field.required);
    }

    #[test]
    fn members_share_one_namespace() {
        let err = Schema::builder("posts")
            .field(FieldDef::new("title", FieldType::String))
            .virtual_field(VirtualDef::new("title"))
            .build()
            .unwrap_err();

        assert!(matches!(err, ModelError::Configuration(_)));
    }

    #[test]
    fn relationship_hook_name_collides_with_user_hook() {
        let err = Schema::builder("posts")
            .hook(HookDef::new(Phase::AfterFind, "author", noop))
            .relationship(RelationshipDef::single("author", "users"))
            .build()
            .unwrap_err();

        assert!(matches!(err, ModelError::Configuration(_)));
    }

    #[test]
    fn hooks_are_unique_per_phase_only() {
        let schema = Schema::builder("posts")
            .hook(HookDef::new(Phase::BeforeFind, "audit", noop))
            .hook(HookDef::new(Phase::AfterFind, "audit", noop))
            .build();
        assert!(schema.is_ok());

        let err = Schema::builder("posts")
            .hook(HookDef::new(Phase::BeforeFind, "audit", noop))
            .hook(HookDef::new(Phase::BeforeFind, "audit", noop))
            .build()
            .unwrap_err();
        assert!(matches!(err, ModelError::Configuration(_)));
    }

    #[test]
    fn virtual_required_hooks_must_name_a_phase() {
        let err = Schema::builder("posts")
            .virtual_field(VirtualDef::new("v").requires_hooks(["sometime_track"]))
            .build()
            .unwrap_err();
        assert!(matches!(err, ModelError::Configuration(_)));

        let ok = Schema::builder("posts")
            .virtual_field(VirtualDef::new("v").requires_hooks(["author.whatever"]))
            .build();
        assert!(ok.is_ok());
    }

    #[test]
    fn non_polymorphic_relationship_takes_one_target() {
        let ambiguous = RelationshipDef {
            targets: vec!["posts".into(), "photos".into()],
            ..RelationshipDef::single("subject", "posts")
        };
        let err = Schema::builder("comments")
            .relationship(ambiguous)
            .build()
            .unwrap_err();
        assert!(matches!(err, ModelError::Configuration(_)));

        let schema = Schema::builder("comments")
            .relationship(RelationshipDef::polymorphic("subject", Cardinality::Single, ["posts", "photos"]))
            .build()
            .unwrap();
        assert_eq!(schema.field("subject_id").map(|f| f.field_type), Some(FieldType::Document));
    }

    #[test]
    fn field_types_accept_null() {
        assert!(FieldType::String.accepts(&Bson::Null));
        assert!(FieldType::Double.accepts(&Bson::Int32(1)));
        assert!(!FieldType::Int.accepts(&Bson::String("1".into())));
    }
}
