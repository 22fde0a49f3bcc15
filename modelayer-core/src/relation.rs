//! Relationship population.
//!
//! Population runs in three steps:
//!
//! 1. collect the foreign keys of every parent, grouped by target model and deduplicated;
//! 2. fetch each target model's documents with one batched find on the right key, recursing
//!    with the child selection forwarded by the resolver;
//! 3. stitch the fetched documents back onto the parents by key.
//!
//! Several relationships populated by consecutive hooks are collected together and fetched
//! concurrently, bounded by [`ConnectionConfig::populate_concurrency`].
//!
//! [`ConnectionConfig::populate_concurrency`]: crate::connection::ConnectionConfig

use bson::{Bson, Document as BsonDocument};
use futures::{
    FutureExt, StreamExt, TryStreamExt,
    future::{BoxFuture, try_join_all},
    stream,
};
use indexmap::IndexMap;
use std::collections::HashMap;
use tracing::{debug, trace};

use crate::{
    connection::Connection,
    document::Document,
    error::{ModelError, ModelResult},
    model::FindRequest,
    query::Filter,
    resolve::Selection,
    schema::{Cardinality, POLYMORPHIC_ID_KEY, POLYMORPHIC_MODEL_KEY, RelationshipDef},
};

/// A relationship to populate together with the selection applied to its targets.
#[derive(Debug, Clone)]
pub struct PopulateJob<'a> {
    pub relationship: &'a RelationshipDef,
    pub selection: Selection,
}

/// A foreign key as read from a parent document.
#[derive(Debug, Clone, PartialEq)]
struct ForeignKey {
    model: String,
    id: Bson,
}

impl ForeignKey {
    fn lookup_key(&self) -> (String, String) {
        (self.model.clone(), id_key(&self.id))
    }
}

/// Identity used to match ids across documents.
fn id_key(id: &Bson) -> String {
    id.to_string()
}

type Matches = HashMap<(String, String), BsonDocument>;

/// Populates a single relationship on `parents`.
pub async fn resolve_relationship(
    connection: &Connection,
    relationship: &RelationshipDef,
    parents: &mut [Document],
    selection: Selection,
) -> ModelResult<()> {
    populate(connection, vec![PopulateJob { relationship, selection }], parents, 0).await
}

/// Populates several relationships on `parents`, fetching them concurrently.
pub(crate) async fn populate(
    connection: &Connection,
    jobs: Vec<PopulateJob<'_>>,
    parents: &mut [Document],
    depth: usize,
) -> ModelResult<()> {
    if jobs.is_empty() {
        return Ok(());
    }

    for job in &jobs {
        for target in &job.relationship.targets {
            connection.lookup_model(target).await?;
        }
    }

    if parents.is_empty() {
        return Ok(());
    }

    let max_depth = connection.config().max_populate_depth;
    if depth >= max_depth {
        return Err(ModelError::configuration(format!(
            "relationship population exceeded the maximum depth of {max_depth}"
        )));
    }

    let plans = jobs
        .into_iter()
        .map(|job| PopulatePlan::collect(job, parents))
        .collect::<ModelResult<Vec<_>>>()?;

    let fetches: Vec<BoxFuture<'_, ModelResult<Matches>>> = plans
        .iter()
        .map(|plan| plan.fetch(connection, depth).boxed())
        .collect();

    let fetched: Vec<Matches> = stream::iter(fetches)
        .buffered(connection.config().populate_concurrency.max(1))
        .try_collect()
        .await?;

    for (plan, matches) in plans.iter().zip(fetched) {
        plan.stitch(parents, &matches)?;
    }

    Ok(())
}

struct PopulatePlan<'a> {
    relationship: &'a RelationshipDef,
    selection: Selection,
    /// The right key was added to the selection and must be stripped after stitching.
    injected_right_key: bool,
    /// Deduplicated ids per target model, in first-seen order.
    ids: IndexMap<String, IndexMap<String, Bson>>,
}

impl<'a> PopulatePlan<'a> {
    fn collect(job: PopulateJob<'a>, parents: &[Document]) -> ModelResult<Self> {
        let PopulateJob { relationship, mut selection } = job;
        let right_key = relationship.right_key();

        let injected_right_key =
            selection.fields.has_inclusions() && selection.fields.get(right_key) != Some(true);
        if injected_right_key {
            selection.fields.set(right_key, true);
        }

        let mut ids: IndexMap<String, IndexMap<String, Bson>> = IndexMap::new();
        for parent in parents {
            for key in foreign_keys(relationship, parent)? {
                ids.entry(key.model)
                    .or_default()
                    .entry(id_key(&key.id))
                    .or_insert(key.id);
            }
        }

        trace!(
            relationship = %relationship.name,
            targets = ids.len(),
            keys = ids.values().map(IndexMap::len).sum::<usize>(),
            "collected foreign keys"
        );

        Ok(Self { relationship, selection, injected_right_key, ids })
    }

    async fn fetch(&self, connection: &Connection, depth: usize) -> ModelResult<Matches> {
        let right_key = self.relationship.right_key();

        let mut lookups: Vec<BoxFuture<'_, ModelResult<Vec<Document>>>> = Vec::with_capacity(self.ids.len());
        for (model_name, ids) in &self.ids {
            lookups.push(self.fetch_model(connection, model_name, ids, depth).boxed());
        }

        let mut matches = Matches::new();
        for ((model_name, _), docs) in self.ids.iter().zip(try_join_all(lookups).await?) {
            for doc in docs {
                let Some(id) = doc.data().get(right_key) else {
                    continue;
                };
                let key = (model_name.clone(), id_key(id));

                let mut output = doc.to_output();
                if self.injected_right_key {
                    output.remove(right_key);
                }
                matches.entry(key).or_insert(output);
            }
        }

        Ok(matches)
    }

    async fn fetch_model(
        &self,
        connection: &Connection,
        model_name: &str,
        ids: &IndexMap<String, Bson>,
        depth: usize,
    ) -> ModelResult<Vec<Document>> {
        let model = connection.lookup_model(model_name).await?;
        let request = FindRequest::new()
            .filter(Filter::one_of(self.relationship.right_key(), ids.values().cloned().collect()))
            .selection(self.selection.clone());

        debug!(
            relationship = %self.relationship.name,
            model = %model_name,
            ids = ids.len(),
            depth,
            "fetching related documents"
        );

        Ok(model.find_at_depth(request, depth + 1).await?.docs)
    }

    fn stitch(&self, parents: &mut [Document], matches: &Matches) -> ModelResult<()> {
        let name = self.relationship.name.as_str();

        for parent in parents.iter_mut() {
            let keys = foreign_keys(self.relationship, parent)?;

            match self.relationship.cardinality {
                Cardinality::Single => {
                    let related = keys.first().and_then(|key| matches.get(&key.lookup_key()));

                    match related {
                        Some(related) => {
                            parent.data_mut().insert(name, Bson::Document(related.clone()));
                        }
                        None => {
                            parent.data_mut().remove(name);
                        }
                    }
                }
                Cardinality::Multiple => {
                    let related = keys
                        .iter()
                        .filter_map(|key| matches.get(&key.lookup_key()))
                        .map(|related| Bson::Document(related.clone()))
                        .collect::<Vec<_>>();

                    parent.data_mut().insert(name, Bson::Array(related));
                }
            }
        }

        Ok(())
    }
}

/// Reads the foreign keys a parent holds for `relationship`. Unset keys yield nothing.
fn foreign_keys(relationship: &RelationshipDef, parent: &Document) -> ModelResult<Vec<ForeignKey>> {
    let values = match parent.data().get(&relationship.left_key()) {
        None | Some(Bson::Null) => return Ok(Vec::new()),
        Some(Bson::Array(items)) if relationship.is_multiple() => items.iter().collect::<Vec<_>>(),
        Some(value) => vec![value],
    };

    let mut keys = Vec::with_capacity(values.len());
    for value in values {
        if let Some(key) = foreign_key(relationship, value)? {
            keys.push(key);
        }
    }

    Ok(keys)
}

fn foreign_key(relationship: &RelationshipDef, value: &Bson) -> ModelResult<Option<ForeignKey>> {
    if matches!(value, Bson::Null) {
        return Ok(None);
    }

    if !relationship.polymorphic {
        return Ok(relationship
            .targets
            .first()
            .map(|model| ForeignKey { model: model.clone(), id: value.clone() }));
    }

    let Bson::Document(reference) = value else {
        trace!(relationship = %relationship.name, "skipping malformed polymorphic key");
        return Ok(None);
    };

    let (Some(id), Ok(model)) = (reference.get(POLYMORPHIC_ID_KEY), reference.get_str(POLYMORPHIC_MODEL_KEY))
    else {
        trace!(relationship = %relationship.name, "skipping incomplete polymorphic key");
        return Ok(None);
    };

    if !relationship.targets.iter().any(|target| target == model) {
        return Err(ModelError::Resolution(format!(
            "model `{model}` is not a target of relationship `{}`",
            relationship.name
        )));
    }

    Ok(Some(ForeignKey { model: model.to_string(), id: id.clone() }))
}
