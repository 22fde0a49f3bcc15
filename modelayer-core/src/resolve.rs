//! Dependency resolution.
//!
//! A caller asks for a [`Selection`]: a set of field paths and a list of hooks. Before any
//! storage I/O happens the resolver expands that selection into a [`ResolutionPlan`]:
//!
//! - every requested virtual pulls in the fields and hooks its getter needs, transitively,
//!   with each dependency placed ahead of the virtual that needs it;
//! - every requested relationship pulls in its left key and its population hook;
//! - paths and hooks addressed through a relationship (`author.name`,
//!   `author.afterFind_track`) are split off into a per-relationship child selection.
//!
//! The plan keeps the caller's original projection around so that the extra fields can be
//! trimmed off once the documents are materialized.

use bson::Bson;
use indexmap::IndexMap;
use tracing::trace;

use crate::{
    document::PRIMARY_KEY,
    error::{ModelError, ModelResult},
    hook::{HookCall, HookRef, HookRequest, Phase},
    projection::{Projection, split_root},
    schema::{RelationshipDef, Schema, VirtualDef},
};

/// What a caller asks a find to return.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Selection {
    /// Requested paths. Paths through a relationship address the related document.
    pub fields: Projection,
    /// Requested hooks, in call order. Duplicates run once per occurrence.
    pub hooks: Vec<HookRequest>,
}

impl Selection {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the requested paths.
    pub fn fields(mut self, fields: Projection) -> Self {
        self.fields = fields;
        self
    }

    /// Includes a field, virtual or relationship path, e.g. `author.name`.
    pub fn field(mut self, path: impl Into<String>) -> Self {
        self.fields.set(path, true);
        self
    }

    /// Requests a hook by key, either `<phase>_<name>` or `<relationship>.<phase>_<name>`.
    pub fn hook(mut self, key: impl Into<String>) -> Self {
        self.hooks.push(HookRequest::new(key));
        self
    }

    /// Requests a hook and passes `args` to its handler.
    pub fn hook_with(mut self, key: impl Into<String>, args: impl Into<Bson>) -> Self {
        self.hooks.push(HookRequest::with_args(key, args));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty() && self.hooks.is_empty()
    }
}

/// A selection split into its local part and its per-relationship parts.
#[derive(Debug, Clone, Default)]
pub struct RequestTree {
    /// Local paths. A relationship addressed only through sub-paths appears here by its root.
    pub fields: Projection,
    /// Local hook requests with their arguments.
    pub hooks: Vec<(HookRef, Option<Bson>)>,
    /// Selections addressed through each relationship.
    pub children: IndexMap<String, Selection>,
}

impl RequestTree {
    /// Splits `selection` by relationship root. Fails when a local hook key has no phase.
    pub fn build(schema: &Schema, selection: &Selection) -> ModelResult<Self> {
        let mut tree = RequestTree::default();

        for (path, include) in selection.fields.iter() {
            match split_root(path) {
                (root, Some(rest)) if schema.relationship(root).is_some() => {
                    tree.children
                        .entry(root.to_string())
                        .or_default()
                        .fields
                        .set(rest, include);

                    if include {
                        tree.fields.insert_if_absent(root, true);
                    }
                }
                _ => tree.fields.set(path, include),
            }
        }

        for request in &selection.hooks {
            match split_root(&request.key) {
                (root, Some(rest)) if schema.relationship(root).is_some() => {
                    tree.children
                        .entry(root.to_string())
                        .or_default()
                        .hooks
                        .push(HookRequest { key: rest.to_string(), args: request.args.clone() });
                }
                (root, Some(_)) => {
                    trace!(model = schema.name(), hook = %request.key, %root, "dropping hook scoped to a non-relationship");
                }
                (_, None) => tree.hooks.push((HookRef::parse(&request.key)?, request.args.clone())),
            }
        }

        Ok(tree)
    }
}

/// The fully expanded form of a [`Selection`].
#[derive(Debug, Clone, Default)]
pub struct ResolutionPlan {
    /// The augmented projection: requested paths with their dependencies placed before them.
    pub fields: Projection,
    /// The caller's original projection, used for trimming.
    pub requested: Projection,
    /// The projection sent to storage: `fields` without virtual or relationship roots.
    pub storage: Projection,
    /// Virtuals to materialize, in dependency order.
    pub virtuals: Vec<String>,
    /// Hook calls per phase. Explicit requests first, implied hooks after them.
    pub hooks: IndexMap<Phase, Vec<HookCall>>,
    /// Relationships that will be populated.
    pub relationships: Vec<String>,
    /// Selections forwarded to each relationship.
    pub children: IndexMap<String, Selection>,
    /// No inclusions were requested: every stored field is fetched and every enumerable
    /// virtual is materialized.
    pub select_all: bool,
}

impl ResolutionPlan {
    /// The hook chain planned for `phase`.
    pub fn hooks_for(&self, phase: Phase) -> &[HookCall] {
        self.hooks.get(&phase).map(Vec::as_slice).unwrap_or_default()
    }

    /// Whether the augmented or storage projection includes anything the caller did not
    /// ask for.
    pub fn is_expanded(&self) -> bool {
        !self.select_all
            && self
                .fields
                .included()
                .chain(self.storage.included())
                .any(|path| self.requested.get(path) != Some(true))
    }
}

/// Expands a selection against a schema.
///
/// Fails with a configuration error when a dependency chain loops back on itself or a
/// required hook does not name a lifecycle phase.
pub fn resolve_projection(schema: &Schema, selection: &Selection) -> ModelResult<ResolutionPlan> {
    let tree = RequestTree::build(schema, selection)?;
    let select_all = !tree.fields.has_inclusions();

    let mut resolver = Resolver {
        schema,
        plan: ResolutionPlan {
            requested: selection.fields.clone(),
            children: tree.children,
            select_all,
            ..ResolutionPlan::default()
        },
        visiting: Vec::new(),
    };

    for (hook, args) in tree.hooks {
        resolver
            .plan
            .hooks
            .entry(hook.phase)
            .or_default()
            .push(HookCall { name: hook.name, args });
    }

    if select_all {
        for (path, _) in tree.fields.iter() {
            resolver.plan.fields.set(path, false);
        }

        for definition in schema.virtuals() {
            if definition.enumerable && resolver.plan.fields.get(&definition.name) != Some(false) {
                resolver.require_virtual(definition)?;
            }
        }
    } else {
        for (path, include) in tree.fields.iter() {
            if include {
                resolver.require(path)?;
            } else {
                resolver.plan.fields.insert_if_absent(path, false);
            }
        }
    }

    let mut plan = resolver.plan;
    plan.storage = plan.fields.clone();
    plan.storage.retain(|path, _| !schema.is_computed(split_root(path).0));

    if !select_all {
        if plan.storage.has_inclusions() {
            plan.fields.insert_if_absent(PRIMARY_KEY, false);
            plan.storage.insert_if_absent(PRIMARY_KEY, false);
        } else {
            // Only computed keys were asked for. An exclusion-only projection would fetch
            // every stored field, so fetch the bare primary key instead.
            plan.storage = Projection::new().include(PRIMARY_KEY);
        }
    }

    trace!(
        model = schema.name(),
        fields = ?plan.fields,
        virtuals = ?plan.virtuals,
        relationships = ?plan.relationships,
        "resolved projection"
    );

    Ok(plan)
}

struct Resolver<'a> {
    schema: &'a Schema,
    plan: ResolutionPlan,
    /// Virtuals currently being expanded, outermost first.
    visiting: Vec<String>,
}

impl Resolver<'_> {
    fn require(&mut self, path: &str) -> ModelResult<()> {
        let schema = self.schema;
        let (root, rest) = split_root(path);

        if let Some(definition) = schema.virtual_field(root) {
            self.require_virtual(definition)?;
        } else if let Some(relationship) = schema.relationship(root) {
            if let Some(rest) = rest {
                self.plan
                    .children
                    .entry(root.to_string())
                    .or_default()
                    .fields
                    .insert_if_absent(rest, true);
            }
            self.require_relationship(relationship);
            return Ok(());
        }

        self.emit(path);
        Ok(())
    }

    fn require_virtual(&mut self, definition: &VirtualDef) -> ModelResult<()> {
        if self.plan.virtuals.contains(&definition.name) {
            self.emit(&definition.name);
            return Ok(());
        }

        if let Some(start) = self.visiting.iter().position(|name| *name == definition.name) {
            let mut cycle = self.visiting[start..].to_vec();
            cycle.push(definition.name.clone());

            return Err(ModelError::configuration(format!(
                "circular dependency between virtuals of model `{}`: {}",
                self.schema.name(),
                cycle.join(" -> ")
            )));
        }

        self.visiting.push(definition.name.clone());

        for field in &definition.required_fields {
            self.require(field)?;
        }

        for hook in &definition.required_hooks {
            self.require_hook(hook)?;
        }

        self.visiting.pop();
        self.plan.virtuals.push(definition.name.clone());
        self.emit(&definition.name);
        Ok(())
    }

    fn require_relationship(&mut self, relationship: &RelationshipDef) {
        self.emit(&relationship.left_key());
        self.add_hook(Phase::AfterFind, &relationship.name);

        if !self.plan.relationships.contains(&relationship.name) {
            self.plan.relationships.push(relationship.name.clone());
        }

        self.emit(&relationship.name);
    }

    fn require_hook(&mut self, key: &str) -> ModelResult<()> {
        let schema = self.schema;

        match split_root(key) {
            (root, Some(rest)) => {
                let Some(relationship) = schema.relationship(root) else {
                    trace!(model = schema.name(), hook = %key, "ignoring hook scoped to a non-relationship");
                    return Ok(());
                };

                let child = self.plan.children.entry(root.to_string()).or_default();
                if !child.hooks.iter().any(|request| request.key == rest) {
                    child.hooks.push(HookRequest::new(rest));
                }

                self.require_relationship(relationship);
            }
            (_, None) => {
                let hook = HookRef::parse(key)?;
                self.add_hook(hook.phase, &hook.name);
            }
        }

        Ok(())
    }

    fn add_hook(&mut self, phase: Phase, name: &str) {
        let calls = self.plan.hooks.entry(phase).or_default();

        if !calls.iter().any(|call| call.name == name) {
            calls.push(HookCall::new(name));
        }
    }

    fn emit(&mut self, path: &str) {
        if !self.plan.select_all {
            self.plan.fields.insert_if_absent(path, true);
        }
    }
}
