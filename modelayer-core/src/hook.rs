//! Lifecycle hooks and the hook pipeline executor.
//!
//! Hooks are named extension points scoped to a lifecycle [`Phase`]. Every model operation
//! runs one or more phases; for each phase the executor builds an ordered chain out of the
//! hooks the caller requested plus the hooks the schema marks as `required`, then threads a
//! [`HookState`] through the chain one handler at a time.
//!
//! On the wire a hook is addressed as `<phase>_<name>`, e.g. `afterFind_trackCount`. A key
//! prefixed with a relationship name (`author.afterFind_trackCount`) belongs to the
//! relationship's own resolution and never runs at the parent level.
//!
//! ```ignore
//! use modelayer::hook::{HookDef, Phase};
//!
//! let track = HookDef::new(Phase::AfterFind, "trackCount", |mut state: HookState, _args: Option<Bson>| {
//!     let seen = state.meta.get_i32("seen").unwrap_or(0);
//!     state.meta.insert("seen", seen + 1);
//!     Ok(state)
//! });
//! ```

use async_trait::async_trait;
use bson::{Bson, Document as BsonDocument, de::deserialize_from_bson};
use indexmap::IndexMap;
use serde::Deserialize;
use std::{fmt, str::FromStr, sync::Arc};
use tracing::{debug, trace};

use crate::{
    document::Document,
    error::{ModelError, ModelResult},
    model::Model,
    projection::{Projection, split_root},
    query::{Expr, FindOptions},
    relation::{self, PopulateJob},
    resolve::Selection,
    schema::Schema,
};

/// Separates the phase prefix from the hook name in a hook key.
pub const PHASE_SEPARATOR: char = '_';

/// Lifecycle phases a hook can be attached to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Phase {
    BeforeFind,
    AfterFind,
    BeforeFilter,
    BeforeInsert,
    AfterInsert,
    BeforeSave,
    AfterSave,
    BeforeUpdate,
    AfterUpdate,
    BeforeRemove,
    AfterRemove,
    BeforeCount,
    AfterCount,
    BeforePut,
    AfterPut,
    BeforeAggregate,
    AfterAggregate,
}

impl Phase {
    pub const ALL: [Phase; 17] = [
        Phase::BeforeFind,
        Phase::AfterFind,
        Phase::BeforeFilter,
        Phase::BeforeInsert,
        Phase::AfterInsert,
        Phase::BeforeSave,
        Phase::AfterSave,
        Phase::BeforeUpdate,
        Phase::AfterUpdate,
        Phase::BeforeRemove,
        Phase::AfterRemove,
        Phase::BeforeCount,
        Phase::AfterCount,
        Phase::BeforePut,
        Phase::AfterPut,
        Phase::BeforeAggregate,
        Phase::AfterAggregate,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::BeforeFind => "beforeFind",
            Phase::AfterFind => "afterFind",
            Phase::BeforeFilter => "beforeFilter",
            Phase::BeforeInsert => "beforeInsert",
            Phase::AfterInsert => "afterInsert",
            Phase::BeforeSave => "beforeSave",
            Phase::AfterSave => "afterSave",
            Phase::BeforeUpdate => "beforeUpdate",
            Phase::AfterUpdate => "afterUpdate",
            Phase::BeforeRemove => "beforeRemove",
            Phase::AfterRemove => "afterRemove",
            Phase::BeforeCount => "beforeCount",
            Phase::AfterCount => "afterCount",
            Phase::BeforePut => "beforePut",
            Phase::AfterPut => "afterPut",
            Phase::BeforeAggregate => "beforeAggregate",
            Phase::AfterAggregate => "afterAggregate",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Phase {
    type Err = ModelError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Phase::ALL
            .into_iter()
            .find(|phase| phase.as_str() == value)
            .ok_or_else(|| ModelError::configuration(format!("unknown lifecycle phase `{value}`")))
    }
}

/// A phase-qualified hook name, parsed from its `<phase>_<name>` wire form.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HookRef {
    pub phase: Phase,
    pub name: String,
}

impl HookRef {
    pub fn new(phase: Phase, name: impl Into<String>) -> Self {
        Self { phase, name: name.into() }
    }

    pub fn parse(key: &str) -> ModelResult<Self> {
        let (phase, name) = key.split_once(PHASE_SEPARATOR).ok_or_else(|| {
            ModelError::configuration(format!("hook `{key}` is not of the form <phase>_<name>"))
        })?;

        if name.is_empty() {
            return Err(ModelError::configuration(format!("hook `{key}` has an empty name")));
        }

        Ok(Self { phase: phase.parse()?, name: name.to_string() })
    }
}

impl fmt::Display for HookRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{}", self.phase, PHASE_SEPARATOR, self.name)
    }
}

/// A hook as requested by a caller: a possibly relationship-prefixed key plus optional arguments.
#[derive(Debug, Clone, PartialEq)]
pub struct HookRequest {
    pub key: String,
    pub args: Option<Bson>,
}

impl HookRequest {
    pub fn new(key: impl Into<String>) -> Self {
        Self { key: key.into(), args: None }
    }

    pub fn with_args(key: impl Into<String>, args: impl Into<Bson>) -> Self {
        Self { key: key.into(), args: Some(args.into()) }
    }
}

impl From<&str> for HookRequest {
    fn from(key: &str) -> Self {
        HookRequest::new(key)
    }
}

/// A resolved, phase-local hook invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct HookCall {
    pub name: String,
    pub args: Option<Bson>,
}

impl HookCall {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), args: None }
    }
}

/// Groups the local (non relationship-prefixed) hook requests by phase, preserving order and
/// duplicates.
pub fn local_hook_calls(requests: &[HookRequest]) -> ModelResult<IndexMap<Phase, Vec<HookCall>>> {
    let mut calls: IndexMap<Phase, Vec<HookCall>> = IndexMap::new();

    for request in requests {
        if let (_, Some(_)) = split_root(&request.key) {
            trace!(hook = %request.key, "skipping relationship-scoped hook");
            continue;
        }

        let hook = HookRef::parse(&request.key)?;
        calls
            .entry(hook.phase)
            .or_default()
            .push(HookCall { name: hook.name, args: request.args.clone() });
    }

    Ok(calls)
}

/// State threaded through a hook chain.
///
/// Which parts are meaningful depends on the phase: find phases use `filter`, `projection`,
/// `options` and `docs`; count, update and remove phases use `filter`, `update` and `count`;
/// insert, save and put phases use `docs`. `meta` is free-form scratch space for handlers.
#[derive(Debug, Clone, Default)]
pub struct HookState {
    pub filter: Option<Expr>,
    pub projection: Projection,
    pub options: FindOptions,
    pub docs: Vec<Document>,
    pub update: Option<BsonDocument>,
    pub count: Option<u64>,
    pub meta: BsonDocument,
}

impl HookState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_docs(docs: Vec<Document>) -> Self {
        Self { docs, ..Self::default() }
    }
}

/// A hook handler: takes the current state and a copy of its own arguments, returns the next state.
#[async_trait]
pub trait HookHandler: Send + Sync {
    async fn handle(&self, state: HookState, args: Option<Bson>) -> ModelResult<HookState>;
}

#[async_trait]
impl<F> HookHandler for F
where
    F: Fn(HookState, Option<Bson>) -> ModelResult<HookState> + Send + Sync,
{
    async fn handle(&self, state: HookState, args: Option<Bson>) -> ModelResult<HookState> {
        (self)(state, args)
    }
}

#[derive(Clone)]
pub(crate) enum HookAction {
    Handler(Arc<dyn HookHandler>),
    /// Populates the named relationship.
    Populate(String),
}

/// A hook registered on a schema.
#[derive(Clone)]
pub struct HookDef {
    pub phase: Phase,
    pub name: String,
    /// Required hooks run on every call of their phase, after the requested ones.
    pub required: bool,
    pub(crate) action: HookAction,
}

impl HookDef {
    pub fn new(phase: Phase, name: impl Into<String>, handler: impl HookHandler + 'static) -> Self {
        Self {
            phase,
            name: name.into(),
            required: false,
            action: HookAction::Handler(Arc::new(handler)),
        }
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub(crate) fn populate(relationship: &str) -> Self {
        Self {
            phase: Phase::AfterFind,
            name: relationship.to_string(),
            required: false,
            action: HookAction::Populate(relationship.to_string()),
        }
    }

    pub fn is_populate(&self) -> bool {
        matches!(self.action, HookAction::Populate(_))
    }

    pub fn hook_ref(&self) -> HookRef {
        HookRef::new(self.phase, self.name.clone())
    }
}

impl fmt::Debug for HookDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HookDef")
            .field("phase", &self.phase)
            .field("name", &self.name)
            .field("required", &self.required)
            .field("populate", &self.is_populate())
            .finish()
    }
}

/// One entry of an executable hook chain.
#[derive(Debug, Clone)]
pub struct ChainLink<'a> {
    pub hook: &'a HookDef,
    pub args: Option<Bson>,
}

/// Builds the ordered chain for a phase.
///
/// Requested hooks come first, in request order and with duplicates kept. Required hooks of
/// the phase that were not requested follow in registration order. Any unknown requested name
/// fails the whole chain before anything runs.
pub fn hook_chain<'a>(
    schema: &'a Schema,
    phase: Phase,
    calls: &[HookCall],
) -> ModelResult<Vec<ChainLink<'a>>> {
    let mut chain = Vec::with_capacity(calls.len());

    for call in calls {
        let hook = schema.hook(phase, &call.name).ok_or_else(|| {
            ModelError::configuration(format!(
                "unknown hook `{phase}{PHASE_SEPARATOR}{}` on model `{}`",
                call.name,
                schema.name()
            ))
        })?;

        chain.push(ChainLink { hook, args: call.args.clone() });
    }

    for hook in schema.hooks_for(phase) {
        if hook.required && !calls.iter().any(|call| call.name == hook.name) {
            chain.push(ChainLink { hook, args: None });
        }
    }

    Ok(chain)
}

/// Checks every requested hook of every phase against the schema, so that an unknown hook
/// fails the call before any phase runs.
pub(crate) fn check_hooks(schema: &Schema, calls: &IndexMap<Phase, Vec<HookCall>>) -> ModelResult<()> {
    for (phase, calls) in calls {
        hook_chain(schema, *phase, calls)?;
    }

    Ok(())
}

/// Arguments accepted by a relationship population hook, overriding the forwarded selection.
#[derive(Debug, Default, Deserialize)]
struct PopulateArgs {
    #[serde(default)]
    fields: Option<BsonDocument>,
    #[serde(default)]
    hooks: Vec<String>,
}

impl PopulateArgs {
    fn into_selection(self) -> Selection {
        Selection {
            fields: self
                .fields
                .as_ref()
                .map(Projection::from_document)
                .unwrap_or_default(),
            hooks: self.hooks.into_iter().map(HookRequest::new).collect(),
        }
    }
}

/// Executes hook chains for one model within one call.
pub(crate) struct HookRunner<'a> {
    pub(crate) model: &'a Model,
    /// Selections forwarded to relationships by the dependency resolver.
    pub(crate) children: Option<&'a IndexMap<String, Selection>>,
    /// Relationship nesting depth of the current call.
    pub(crate) depth: usize,
}

impl<'a> HookRunner<'a> {
    pub(crate) fn new(model: &'a Model) -> Self {
        Self { model, children: None, depth: 0 }
    }

    pub(crate) async fn run(
        &self,
        phase: Phase,
        calls: &[HookCall],
        mut state: HookState,
    ) -> ModelResult<HookState> {
        let schema = self.model.schema();
        let chain = hook_chain(schema, phase, calls)?;

        if chain.is_empty() {
            return Ok(state);
        }

        debug!(model = schema.name(), %phase, hooks = chain.len(), "running hook chain");

        let mut index = 0;
        while index < chain.len() {
            let link = &chain[index];

            match &link.hook.action {
                HookAction::Handler(handler) => {
                    trace!(model = schema.name(), %phase, hook = %link.hook.name, "running hook");
                    state = handler.handle(state, link.args.clone()).await?;
                    index += 1;
                }
                HookAction::Populate(_) => {
                    let end = chain[index..]
                        .iter()
                        .position(|link| !link.hook.is_populate())
                        .map_or(chain.len(), |offset| index + offset);

                    let jobs = chain[index..end]
                        .iter()
                        .map(|link| self.populate_job(link))
                        .collect::<ModelResult<Vec<_>>>()?;

                    relation::populate(self.model.connection(), jobs, &mut state.docs, self.depth)
                        .await?;
                    index = end;
                }
            }
        }

        Ok(state)
    }

    fn populate_job(&self, link: &ChainLink<'_>) -> ModelResult<PopulateJob<'a>> {
        let HookAction::Populate(name) = &link.hook.action else {
            return Err(ModelError::Unknown(format!("hook `{}` is not a populate hook", link.hook.name)));
        };

        let relationship = self.model.schema().relationship(name).ok_or_else(|| {
            ModelError::configuration(format!(
                "populate hook `{name}` has no relationship on model `{}`",
                self.model.name()
            ))
        })?;

        let selection = match &link.args {
            Some(args) => deserialize_from_bson::<PopulateArgs>(args.clone())
                .map_err(|err| {
                    ModelError::configuration(format!("malformed arguments for populate hook `{name}`: {err}"))
                })?
                .into_selection(),
            None => self
                .children
                .and_then(|children| children.get(name))
                .cloned()
                .unwrap_or_default(),
        };

        Ok(PopulateJob { relationship, selection })
    }
}
