//! In-memory storage implementation.
//!
//! Documents are kept as BSON documents in insertion order, keyed by their primary key,
//! behind async-aware read-write locks.

use std::{cmp::Ordering, collections::HashMap, sync::Arc};
use async_trait::async_trait;
use bson::Document as BsonDocument;
use indexmap::IndexMap;
use mea::rwlock::RwLock;
use tracing::trace;

use modelayer_core::{
    backend::{StoreBackend, StoreBackendBuilder},
    document::PRIMARY_KEY,
    error::{ModelError, ModelResult},
    projection::get_path,
    query::{Expr, Query, SortDirection},
};

use crate::evaluator::{Comparable, DocumentEvaluator};

type CollectionMap = IndexMap<String, BsonDocument>;
type StoreMap = HashMap<String, CollectionMap>;


/// Thread-safe in-memory document storage backend.
///
/// `InMemoryStore` is cloneable and uses an `Arc`-wrapped internal state; clones share the
/// same data. Every find is also counted per collection, which makes it easy to check how
/// many queries an operation issued.
///
/// Queries scan all documents in a collection (no indexing).
///
/// # Example
///
/// ```ignore
/// use modelayer_memory::InMemoryStore;
/// use modelayer::backend::StoreBackend;
/// use bson::doc;
///
/// let store = InMemoryStore::new();
/// store.insert_documents(vec![doc! { "_id": 1, "name": "Alice" }], "users").await?;
///
/// let docs = store.find_documents(Query::new(), "users").await?;
/// assert_eq!(docs.len(), 1);
/// assert_eq!(store.find_count("users").await, 1);
/// ```
#[derive(Default, Clone, Debug)]
pub struct InMemoryStore {
    /// collection name -> (primary key -> document)
    store: Arc<RwLock<StoreMap>>,
    /// Number of finds issued per collection.
    finds: Arc<RwLock<HashMap<String, usize>>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn builder() -> InMemoryStoreBuilder {
        InMemoryStoreBuilder::default()
    }

    /// Number of finds issued against `collection` so far.
    pub async fn find_count(&self, collection: &str) -> usize {
        self.finds
            .read()
            .await
            .get(collection)
            .copied()
            .unwrap_or(0)
    }

    pub async fn reset_find_counts(&self) {
        self.finds.write().await.clear();
    }
}

fn primary_key(document: &BsonDocument, collection: &str) -> ModelResult<String> {
    document
        .get(PRIMARY_KEY)
        .map(ToString::to_string)
        .ok_or_else(|| ModelError::Backend(format!("document without `{PRIMARY_KEY}` in collection {collection}")))
}

fn matching_keys(collection_map: &CollectionMap, filter: Option<&Expr>) -> ModelResult<Vec<String>> {
    let mut keys = Vec::new();

    for (key, document) in collection_map {
        let matched = match filter {
            Some(filter) => DocumentEvaluator::new(document).evaluate(filter)?,
            None => true,
        };

        if matched {
            keys.push(key.clone());
        }
    }

    Ok(keys)
}

#[async_trait]
impl StoreBackend for InMemoryStore {
    async fn insert_documents(&self, documents: Vec<BsonDocument>, collection: &str) -> ModelResult<()> {
        let mut store = self.store.write().await;
        let collection_map = store
            .entry(collection.to_string())
            .or_default();

        let mut keyed = Vec::with_capacity(documents.len());
        for document in documents {
            let key = primary_key(&document, collection)?;

            if collection_map.contains_key(&key) || keyed.iter().any(|(existing, _)| *existing == key) {
                return Err(ModelError::DocumentAlreadyExists(key, collection.to_string()));
            }

            keyed.push((key, document));
        }

        collection_map.extend(keyed);
        Ok(())
    }

    async fn update_documents(&self, filter: Option<Expr>, update: BsonDocument, collection: &str) -> ModelResult<u64> {
        let mut store = self.store.write().await;
        let Some(collection_map) = store.get_mut(collection) else {
            return Ok(0);
        };

        let keys = matching_keys(collection_map, filter.as_ref())?;
        for key in &keys {
            if let Some(document) = collection_map.get_mut(key) {
                for (field, value) in &update {
                    if field != PRIMARY_KEY {
                        document.insert(field.clone(), value.clone());
                    }
                }
            }
        }

        Ok(keys.len() as u64)
    }

    async fn delete_documents(&self, filter: Option<Expr>, collection: &str) -> ModelResult<u64> {
        let mut store = self.store.write().await;
        let Some(collection_map) = store.get_mut(collection) else {
            return Ok(0);
        };

        let keys = matching_keys(collection_map, filter.as_ref())?;
        for key in &keys {
            collection_map.shift_remove(key);
        }

        Ok(keys.len() as u64)
    }

    async fn find_documents(&self, query: Query, collection: &str) -> ModelResult<Vec<BsonDocument>> {
        *self.finds
            .write()
            .await
            .entry(collection.to_string())
            .or_default() += 1;

        let store = self.store.read().await;
        let Some(collection_map) = store.get(collection) else {
            return Ok(vec![]);
        };

        let mut documents = match &query.filter {
            Some(filter) => DocumentEvaluator::filter_documents(collection_map.values(), filter)?,
            None => collection_map.values().collect::<Vec<_>>(),
        };

        if let Some(sort) = &query.sort {
            documents.sort_by(|a, b| {
                let left = get_path(a, &sort.field)
                    .map(Comparable::from)
                    .unwrap_or(Comparable::Null);
                let right = get_path(b, &sort.field)
                    .map(Comparable::from)
                    .unwrap_or(Comparable::Null);

                match sort.direction {
                    SortDirection::Asc => left.partial_cmp(&right).unwrap_or(Ordering::Equal),
                    SortDirection::Desc => right.partial_cmp(&left).unwrap_or(Ordering::Equal),
                }
            });
        }

        let found = documents
            .into_iter()
            .skip(query.offset.unwrap_or(0))
            .take(query.limit.unwrap_or(usize::MAX))
            .map(|document| query.projection.apply(document, PRIMARY_KEY))
            .collect::<Vec<_>>();

        trace!(collection, found = found.len(), "in-memory find");
        Ok(found)
    }

    async fn count_documents(&self, filter: Option<Expr>, collection: &str) -> ModelResult<u64> {
        let store = self.store.read().await;

        match store.get(collection) {
            Some(collection_map) => Ok(matching_keys(collection_map, filter.as_ref())?.len() as u64),
            None => Ok(0),
        }
    }

    async fn create_collection(&self, name: &str) -> ModelResult<()> {
        self.store
            .write()
            .await
            .entry(name.to_string())
            .or_default();

        Ok(())
    }

    async fn drop_collection(&self, name: &str) -> ModelResult<()> {
        let mut store = self.store.write().await;

        if store.remove(name).is_none() {
            return Err(ModelError::CollectionNotFound(name.to_string()));
        }

        Ok(())
    }

    async fn list_collections(&self) -> ModelResult<Vec<String>> {
        let mut names = self.store
            .read()
            .await
            .keys()
            .cloned()
            .collect::<Vec<_>>();
        names.sort();

        Ok(names)
    }
}


/// Builder for constructing [`InMemoryStore`] instances, optionally pre-seeded with documents.
///
/// # Example
///
/// ```ignore
/// use modelayer_memory::InMemoryStore;
/// use modelayer::backend::StoreBackendBuilder;
///
/// let store = InMemoryStore::builder()
///     .seed("users", vec![doc! { "_id": 1, "name": "Alice" }])
///     .build()
///     .await?;
/// ```
#[derive(Default)]
pub struct InMemoryStoreBuilder {
    seed: Vec<(String, Vec<BsonDocument>)>,
}

impl InMemoryStoreBuilder {
    pub fn seed(mut self, collection: impl Into<String>, documents: Vec<BsonDocument>) -> Self {
        self.seed.push((collection.into(), documents));
        self
    }
}

#[async_trait]
impl StoreBackendBuilder for InMemoryStoreBuilder {
    type Backend = InMemoryStore;

    async fn build(self) -> ModelResult<Self::Backend> {
        let store = InMemoryStore::new();

        for (collection, documents) in self.seed {
            store.insert_documents(documents, &collection).await?;
        }

        Ok(store)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;
    use modelayer_core::{projection::Projection, query::Filter};

    async fn seeded() -> InMemoryStore {
        InMemoryStore::builder()
            .seed(
                "posts",
                vec![
                    doc! { "_id": 1, "title": "b", "views": 5, "meta": { "lang": "en" } },
                    doc! { "_id": 2, "title": "a", "views": 50, "meta": { "lang": "fr" } },
                    doc! { "_id": 3, "title": "c", "views": 500, "meta": { "lang": "en" } },
                ],
            )
            .build()
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn rejects_duplicate_primary_keys() {
        let store = seeded().await;
        let err = store
            .insert_documents(vec![doc! { "_id": 1 }], "posts")
            .await
            .unwrap_err();

        assert!(matches!(err, ModelError::DocumentAlreadyExists(_, _)));
    }

    #[tokio::test]
    async fn finds_with_filter_sort_paging_and_projection() {
        let store = seeded().await;
        let query = Query::builder()
            .filter(Filter::gt("views", 1))
            .sort("title", SortDirection::Asc)
            .offset(1)
            .limit(1)
            .projection(Projection::new().include("title"))
            .build();

        let found = store.find_documents(query, "posts").await.unwrap();

        assert_eq!(found, vec![doc! { "title": "b", "_id": 1 }]);
        assert_eq!(store.find_count("posts").await, 1);
    }

    #[tokio::test]
    async fn updates_and_deletes_by_filter() {
        let store = seeded().await;

        let updated = store
            .update_documents(Some(Filter::eq("meta.lang", "en")), doc! { "flag": true }, "posts")
            .await
            .unwrap();
        assert_eq!(updated, 2);
        assert_eq!(store.count_documents(Some(Filter::exists("flag")), "posts").await.unwrap(), 2);

        let deleted = store.delete_documents(Some(Filter::exists("flag")), "posts").await.unwrap();
        assert_eq!(deleted, 2);
        assert_eq!(store.count_documents(None, "posts").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn missing_collection_finds_nothing() {
        let store = InMemoryStore::new();

        assert!(store.find_documents(Query::new(), "nope").await.unwrap().is_empty());
        assert_eq!(store.count_documents(None, "nope").await.unwrap(), 0);
        assert!(matches!(
            store.drop_collection("nope").await.unwrap_err(),
            ModelError::CollectionNotFound(_)
        ));
    }
}
