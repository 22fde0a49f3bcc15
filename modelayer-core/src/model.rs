//! Model handles and the operation pipelines.
//!
//! A [`Model`] binds a [`Schema`] to a [`Connection`]. Each operation is a fixed sequence of
//! hook phases around one backend call. A find runs:
//!
//! 1. dependency resolution of the requested selection, and a check that every requested hook exists
//! 2. `beforeFilter`, then `beforeFind`
//! 3. the backend query with the storage projection
//! 4. `afterFind`, which includes relationship population
//! 5. virtual materialization in dependency order
//! 6. trimming back down to the requested projection, unless `raw` was asked for
//!
//! The first error raised by any step aborts the call.

use bson::{Bson, Document as BsonDocument};
use futures::{
    FutureExt,
    future::{BoxFuture, try_join_all},
};
use indexmap::IndexMap;
use std::sync::Arc;
use tracing::debug;

use crate::{
    connection::Connection,
    document::{Document, PRIMARY_KEY},
    error::{ModelError, ModelResult},
    hook::{HookCall, HookRequest, HookRunner, HookState, Phase, check_hooks, hook_chain, local_hook_calls},
    projection::{Projection, trim_to_requested},
    query::{Expr, Filter, FindOptions, Query},
    resolve::{ResolutionPlan, Selection, resolve_projection},
    schema::Schema,
    virtuals::materialize_virtuals,
};

/// A find call: filter, selection and options.
#[derive(Debug, Clone, Default)]
pub struct FindRequest {
    /// Matches every document when absent.
    pub filter: Option<Expr>,
    pub selection: Selection,
    pub options: FindOptions,
}

impl FindRequest {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the filter passed to `beforeFilter` hooks and then to storage.
    pub fn filter(mut self, filter: Expr) -> Self {
        self.filter = Some(filter);
        self
    }

    /// Replaces the whole selection.
    pub fn selection(mut self, selection: Selection) -> Self {
        self.selection = selection;
        self
    }

    pub fn fields(mut self, fields: Projection) -> Self {
        self.selection.fields = fields;
        self
    }

    /// See [`Selection::field`].
    pub fn field(mut self, path: impl Into<String>) -> Self {
        self.selection = self.selection.field(path);
        self
    }

    /// See [`Selection::hook`].
    pub fn hook(mut self, key: impl Into<String>) -> Self {
        self.selection = self.selection.hook(key);
        self
    }

    /// See [`Selection::hook_with`].
    pub fn hook_with(mut self, key: impl Into<String>, args: impl Into<Bson>) -> Self {
        self.selection = self.selection.hook_with(key, args);
        self
    }

    pub fn options(mut self, options: FindOptions) -> Self {
        self.options = options;
        self
    }

    /// Caps the number of documents returned by storage.
    pub fn limit(mut self, limit: usize) -> Self {
        self.options.limit = Some(limit);
        self
    }

    /// Skips the final trim so dependency fields stay on the returned documents.
    pub fn raw(mut self) -> Self {
        self.options.raw = true;
        self
    }
}

#[derive(Debug, Clone)]
pub struct Model {
    schema: Arc<Schema>,
    connection: Connection,
}

impl Model {
    pub(crate) fn new(schema: Arc<Schema>, connection: Connection) -> Self {
        Self { schema, connection }
    }

    pub fn name(&self) -> &str {
        self.schema.name()
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    /// Expands a selection into its resolution plan without touching storage.
    pub fn resolve_projection(&self, selection: &Selection) -> ModelResult<ResolutionPlan> {
        resolve_projection(&self.schema, selection)
    }

    /// Runs the hooks of one phase against a caller-provided state.
    pub async fn run_hooks(
        &self,
        phase: Phase,
        hooks: &[HookRequest],
        state: HookState,
    ) -> ModelResult<HookState> {
        let calls = local_hook_calls(hooks)?;
        check_hooks(&self.schema, &calls)?;
        HookRunner::new(self).run(phase, phase_calls(&calls, phase), state).await
    }

    /// Wraps raw data in a document of this model.
    pub fn hydrate(&self, data: BsonDocument) -> Document {
        Document::from_store(Arc::clone(&self.schema), data)
    }

    pub async fn find(&self, request: FindRequest) -> ModelResult<Vec<Document>> {
        Ok(self.find_state(request).await?.docs)
    }

    pub async fn find_one(&self, request: FindRequest) -> ModelResult<Option<Document>> {
        let docs = self.find(request.limit(1)).await?;
        Ok(docs.into_iter().next())
    }

    /// Runs a find and returns the final hook state, including whatever hooks left in `meta`.
    pub async fn find_state(&self, request: FindRequest) -> ModelResult<HookState> {
        self.find_at_depth(request, 0).await
    }

    pub(crate) fn find_at_depth(
        &self,
        request: FindRequest,
        depth: usize,
    ) -> BoxFuture<'_, ModelResult<HookState>> {
        async move {
            let schema = self.schema.as_ref();
            let plan = resolve_projection(schema, &request.selection)?;
            check_hooks(schema, &plan.hooks)?;

            let runner = HookRunner { model: self, children: Some(&plan.children), depth };
            let mut state = HookState {
                filter: request.filter,
                projection: plan.storage.clone(),
                options: request.options,
                ..HookState::default()
            };

            state = runner.run(Phase::BeforeFilter, plan.hooks_for(Phase::BeforeFilter), state).await?;
            state = runner.run(Phase::BeforeFind, plan.hooks_for(Phase::BeforeFind), state).await?;

            let query = Query::builder()
                .maybe_filter(state.filter.clone())
                .projection(state.projection.clone())
                .options(&state.options)
                .build();

            let records = self
                .connection
                .backend()
                .find_documents(query, schema.collection())
                .await?;

            debug!(model = schema.name(), depth, found = records.len(), "fetched documents");

            state.docs = records.into_iter().map(|data| self.hydrate(data)).collect();
            state = runner.run(Phase::AfterFind, plan.hooks_for(Phase::AfterFind), state).await?;

            materialize_virtuals(&mut state.docs, &plan.virtuals)?;

            if !state.options.raw && plan.is_expanded() {
                trim_to_requested(&mut state.docs, &plan.requested);
            }

            Ok(state)
        }
        .boxed()
    }

    pub async fn count(&self, filter: Option<Expr>, hooks: &[HookRequest]) -> ModelResult<u64> {
        let calls = local_hook_calls(hooks)?;
        check_hooks(&self.schema, &calls)?;
        let runner = HookRunner::new(self);

        let mut state = HookState { filter, ..HookState::default() };
        state = runner.run(Phase::BeforeFilter, phase_calls(&calls, Phase::BeforeFilter), state).await?;
        state = runner.run(Phase::BeforeCount, phase_calls(&calls, Phase::BeforeCount), state).await?;

        let count = self
            .connection
            .backend()
            .count_documents(state.filter.clone(), self.schema.collection())
            .await?;
        state.count = Some(count);

        state = runner.run(Phase::AfterCount, phase_calls(&calls, Phase::AfterCount), state).await?;
        Ok(state.count.unwrap_or(count))
    }

    /// Creates documents from payloads and persists them.
    ///
    /// `beforePut`/`afterPut` run once per document, concurrently; `beforeInsert`/`afterInsert`
    /// run once for the whole batch.
    pub async fn insert(
        &self,
        payloads: Vec<BsonDocument>,
        hooks: &[HookRequest],
    ) -> ModelResult<Vec<Document>> {
        let calls = local_hook_calls(hooks)?;
        check_hooks(&self.schema, &calls)?;
        let runner = HookRunner::new(self);

        let docs = payloads
            .into_iter()
            .map(|payload| Document::for_insert(Arc::clone(&self.schema), payload))
            .collect::<ModelResult<Vec<_>>>()?;

        let docs = self.run_put_phase(&runner, Phase::BeforePut, &calls, docs).await?;
        let mut state = runner
            .run(Phase::BeforeInsert, phase_calls(&calls, Phase::BeforeInsert), HookState::with_docs(docs))
            .await?;

        let records = state.docs.iter().map(Document::to_persisted).collect::<Vec<_>>();
        debug!(model = self.name(), documents = records.len(), "inserting documents");
        self.connection
            .backend()
            .insert_documents(records, self.schema.collection())
            .await?;

        state = runner.run(Phase::AfterInsert, phase_calls(&calls, Phase::AfterInsert), state).await?;
        self.run_put_phase(&runner, Phase::AfterPut, &calls, state.docs).await
    }

    pub async fn insert_one(&self, payload: BsonDocument, hooks: &[HookRequest]) -> ModelResult<Document> {
        self.insert(vec![payload], hooks)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| ModelError::Unknown("insert produced no document".into()))
    }

    /// Writes an existing document back to storage, matched by primary key.
    pub async fn save(&self, document: Document, hooks: &[HookRequest]) -> ModelResult<Document> {
        let calls = local_hook_calls(hooks)?;
        check_hooks(&self.schema, &calls)?;
        let runner = HookRunner::new(self);

        document.validate()?;
        let docs = self.run_put_phase(&runner, Phase::BeforePut, &calls, vec![document]).await?;
        let mut state = runner
            .run(Phase::BeforeSave, phase_calls(&calls, Phase::BeforeSave), HookState::with_docs(docs))
            .await?;

        for document in &state.docs {
            let id = document.id().cloned().ok_or_else(|| {
                ModelError::validation(format!("cannot save a `{}` document without `{PRIMARY_KEY}`", self.name()))
            })?;

            let matched = self
                .connection
                .backend()
                .update_documents(
                    Some(Filter::eq(PRIMARY_KEY, id.clone())),
                    document.to_persisted(),
                    self.schema.collection(),
                )
                .await?;

            if matched == 0 {
                return Err(ModelError::DocumentNotFound(
                    id.to_string(),
                    self.schema.collection().to_string(),
                ));
            }
        }

        state = runner.run(Phase::AfterSave, phase_calls(&calls, Phase::AfterSave), state).await?;
        self.run_put_phase(&runner, Phase::AfterPut, &calls, state.docs)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| ModelError::Unknown("save produced no document".into()))
    }

    /// Merges `update` into every document matching `filter`. Returns the number matched.
    pub async fn update(
        &self,
        filter: Option<Expr>,
        update: BsonDocument,
        hooks: &[HookRequest],
    ) -> ModelResult<u64> {
        let calls = local_hook_calls(hooks)?;
        check_hooks(&self.schema, &calls)?;
        let runner = HookRunner::new(self);

        if let Some(key) = update.keys().find(|key| self.schema.is_computed(key)) {
            return Err(ModelError::validation(format!(
                "`{key}` on model `{}` is not a stored field",
                self.name()
            )));
        }

        let mut state = HookState { filter, update: Some(update), ..HookState::default() };
        state = runner.run(Phase::BeforeFilter, phase_calls(&calls, Phase::BeforeFilter), state).await?;
        state = runner.run(Phase::BeforeUpdate, phase_calls(&calls, Phase::BeforeUpdate), state).await?;

        let matched = self
            .connection
            .backend()
            .update_documents(
                state.filter.clone(),
                state.update.clone().unwrap_or_default(),
                self.schema.collection(),
            )
            .await?;
        state.count = Some(matched);

        state = runner.run(Phase::AfterUpdate, phase_calls(&calls, Phase::AfterUpdate), state).await?;
        Ok(state.count.unwrap_or(matched))
    }

    /// Deletes every document matching `filter`. Returns the number deleted.
    pub async fn remove(&self, filter: Option<Expr>, hooks: &[HookRequest]) -> ModelResult<u64> {
        let calls = local_hook_calls(hooks)?;
        check_hooks(&self.schema, &calls)?;
        let runner = HookRunner::new(self);

        let mut state = HookState { filter, ..HookState::default() };
        state = runner.run(Phase::BeforeFilter, phase_calls(&calls, Phase::BeforeFilter), state).await?;
        state = runner.run(Phase::BeforeRemove, phase_calls(&calls, Phase::BeforeRemove), state).await?;

        let removed = self
            .connection
            .backend()
            .delete_documents(state.filter.clone(), self.schema.collection())
            .await?;
        state.count = Some(removed);

        state = runner.run(Phase::AfterRemove, phase_calls(&calls, Phase::AfterRemove), state).await?;
        Ok(state.count.unwrap_or(removed))
    }

    /// Runs a put phase once per document, concurrently, preserving document order.
    async fn run_put_phase(
        &self,
        runner: &HookRunner<'_>,
        phase: Phase,
        calls: &IndexMap<Phase, Vec<HookCall>>,
        docs: Vec<Document>,
    ) -> ModelResult<Vec<Document>> {
        let calls = phase_calls(calls, phase);

        if hook_chain(&self.schema, phase, calls)?.is_empty() {
            return Ok(docs);
        }

        let runs: Vec<BoxFuture<'_, ModelResult<HookState>>> = docs
            .into_iter()
            .map(|doc| runner.run(phase, calls, HookState::with_docs(vec![doc])).boxed())
            .collect();

        let states = try_join_all(runs).await?;
        Ok(states.into_iter().flat_map(|state| state.docs).collect())
    }
}

fn phase_calls(calls: &IndexMap<Phase, Vec<HookCall>>, phase: Phase) -> &[HookCall] {
    calls.get(&phase).map(Vec::as_slice).unwrap_or_default()
}
