//! Storage backend abstraction.
//!
//! The model layer never talks to a database directly. Every storage interaction goes
//! through a [`StoreBackend`]: raw BSON documents in, raw BSON documents out, filters
//! expressed as [`Expr`](crate::query::Expr) trees and projections as computed by the
//! dependency resolver.
//!
//! # Traits
//!
//! - [`StoreBackend`]: The core trait for storage backends
//! - [`DynStoreBackend`]: Object-safe mirror of [`StoreBackend`], used by the connection
//! - [`StoreBackendBuilder`]: Factory trait for creating backend instances
//!
//! # Examples
//!
//! ```ignore
//! use modelayer::backend::StoreBackend;
//! use modelayer::query::{Filter, Query};
//! use bson::doc;
//!
//! let backend = MyBackendImpl::new();
//!
//! backend.insert_documents(vec![doc! { "_id": 1, "name": "Alice" }], "users").await?;
//!
//! let query = Query::builder().filter(Filter::eq("name", "Alice")).build();
//! let found = backend.find_documents(query, "users").await?;
//! ```

use async_trait::async_trait;
use bson::Document as BsonDocument;
use std::{any::Any, fmt::Debug};

use crate::{
    error::ModelResult,
    query::{Expr, Query},
};

/// Abstract interface for document storage backends.
///
/// # Thread Safety
///
/// Implementations must be thread-safe: relationship population issues several finds
/// concurrently against the same backend.
///
/// # Projection
///
/// [`find_documents`](StoreBackend::find_documents) receives the storage projection in
/// [`Query::projection`]. With at least one inclusion only the included paths (plus `_id`
/// unless excluded) must be returned; exclusions are removed. An empty projection means
/// every stored field.
#[async_trait]
pub trait StoreBackend: Send + Sync + Debug {
    /// Inserts new documents into a collection, creating the collection if needed.
    ///
    /// Every document carries its primary key in `_id`. Inserting a key that already exists
    /// fails with [`ModelError::DocumentAlreadyExists`](crate::error::ModelError).
    async fn insert_documents(
        &self,
        documents: Vec<BsonDocument>,
        collection: &str,
    ) -> ModelResult<()>;

    /// Merges `update` into every document matching `filter`. Returns the number of
    /// documents matched.
    async fn update_documents(
        &self,
        filter: Option<Expr>,
        update: BsonDocument,
        collection: &str,
    ) -> ModelResult<u64>;

    /// Deletes every document matching `filter`. Returns the number of documents deleted.
    async fn delete_documents(&self, filter: Option<Expr>, collection: &str) -> ModelResult<u64>;

    /// Finds documents matching a query, applying projection, sorting and paging.
    ///
    /// A collection that does not exist yields no documents.
    async fn find_documents(&self, query: Query, collection: &str) -> ModelResult<Vec<BsonDocument>>;

    /// Counts documents matching `filter`.
    async fn count_documents(&self, filter: Option<Expr>, collection: &str) -> ModelResult<u64>;

    /// Creates an empty collection. Creating an existing collection is a no-op.
    async fn create_collection(&self, name: &str) -> ModelResult<()>;

    /// Drops a collection and all its documents.
    async fn drop_collection(&self, name: &str) -> ModelResult<()>;

    /// Lists the names of all collections.
    async fn list_collections(&self) -> ModelResult<Vec<String>>;

    /// Cleanly shuts down the backend, releasing all resources.
    async fn shutdown(self) -> ModelResult<()>
    where
        Self: Sized,
    {
        Ok(())
    }
}

#[async_trait]
pub trait DynStoreBackend: Send + Sync + Debug {
    async fn insert_documents(
        &self,
        documents: Vec<BsonDocument>,
        collection: &str,
    ) -> ModelResult<()>;
    async fn update_documents(
        &self,
        filter: Option<Expr>,
        update: BsonDocument,
        collection: &str,
    ) -> ModelResult<u64>;
    async fn delete_documents(&self, filter: Option<Expr>, collection: &str) -> ModelResult<u64>;
    async fn find_documents(&self, query: Query, collection: &str) -> ModelResult<Vec<BsonDocument>>;
    async fn count_documents(&self, filter: Option<Expr>, collection: &str) -> ModelResult<u64>;
    async fn create_collection(&self, name: &str) -> ModelResult<()>;
    async fn drop_collection(&self, name: &str) -> ModelResult<()>;
    async fn list_collections(&self) -> ModelResult<Vec<String>>;
    async fn shutdown_boxed(self: Box<Self>) -> ModelResult<()>;

    fn as_any(&self) -> &dyn Any;
    fn into_any(self: Box<Self>) -> Box<dyn Any>;
}

#[async_trait]
impl<B: StoreBackend + 'static> DynStoreBackend for B {
    async fn insert_documents(
        &self,
        documents: Vec<BsonDocument>,
        collection: &str,
    ) -> ModelResult<()> {
        StoreBackend::insert_documents(self, documents, collection).await
    }

    async fn update_documents(
        &self,
        filter: Option<Expr>,
        update: BsonDocument,
        collection: &str,
    ) -> ModelResult<u64> {
        StoreBackend::update_documents(self, filter, update, collection).await
    }

    async fn delete_documents(&self, filter: Option<Expr>, collection: &str) -> ModelResult<u64> {
        StoreBackend::delete_documents(self, filter, collection).await
    }

    async fn find_documents(&self, query: Query, collection: &str) -> ModelResult<Vec<BsonDocument>> {
        StoreBackend::find_documents(self, query, collection).await
    }

    async fn count_documents(&self, filter: Option<Expr>, collection: &str) -> ModelResult<u64> {
        StoreBackend::count_documents(self, filter, collection).await
    }

    async fn create_collection(&self, name: &str) -> ModelResult<()> {
        StoreBackend::create_collection(self, name).await
    }

    async fn drop_collection(&self, name: &str) -> ModelResult<()> {
        StoreBackend::drop_collection(self, name).await
    }

    async fn list_collections(&self) -> ModelResult<Vec<String>> {
        StoreBackend::list_collections(self).await
    }

    async fn shutdown_boxed(self: Box<Self>) -> ModelResult<()> {
        StoreBackend::shutdown(*self).await
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any> {
        self
    }
}

impl<'a> dyn DynStoreBackend + 'a {
    /// Attempts to downcast to a concrete backend type.
    pub fn downcast_ref<B: StoreBackend + 'static>(&self) -> Option<&B> {
        self.as_any().downcast_ref::<B>()
    }
}

#[async_trait]
pub trait StoreBackendBuilder {
    type Backend: StoreBackend;

    async fn build(self) -> ModelResult<Self::Backend>;
}
