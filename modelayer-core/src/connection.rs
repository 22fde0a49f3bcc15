//! Connections and the model registry.
//!
//! A [`Connection`] owns a storage backend and the registry of models defined on it.
//! Relationship population looks up its target models here by name, so every model that
//! appears as a relationship target must be registered on the same connection.
//!
//! ```ignore
//! use modelayer::connection::Connection;
//! use modelayer_memory::InMemoryStore;
//!
//! let connection = Connection::builder()
//!     .populate_concurrency(8)
//!     .build(InMemoryStore::new());
//!
//! let users = connection.register(users_schema).await?;
//! let posts = connection.register(posts_schema).await?;
//! ```

use mea::rwlock::RwLock;
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, sync::Arc};
use tracing::debug;

use crate::{
    backend::{DynStoreBackend, StoreBackend, StoreBackendBuilder},
    error::{ModelError, ModelResult},
    model::Model,
    schema::Schema,
};

/// Tunables of a connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Maximum number of relationship fetches in flight per population step.
    pub populate_concurrency: usize,
    /// Maximum relationship nesting depth before population fails.
    pub max_populate_depth: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            populate_concurrency: 4,
            max_populate_depth: 8,
        }
    }
}

#[derive(Debug)]
struct ConnectionInner {
    backend: Box<dyn DynStoreBackend>,
    models: RwLock<HashMap<String, Arc<Schema>>>,
    config: ConnectionConfig,
}

/// A handle to a backend plus its model registry. Cloning is cheap and shares state.
#[derive(Debug, Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

impl Connection {
    pub fn new<B: StoreBackend + 'static>(backend: B) -> Self {
        ConnectionBuilder::new().build(backend)
    }

    pub fn builder() -> ConnectionBuilder {
        ConnectionBuilder::new()
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.inner.config
    }

    pub fn backend(&self) -> &dyn DynStoreBackend {
        &*self.inner.backend
    }

    /// Registers a schema and returns its model handle.
    ///
    /// Registering two models under the same name is a configuration error.
    pub async fn register(&self, schema: Schema) -> ModelResult<Model> {
        let schema = Arc::new(schema);
        let mut models = self.inner.models.write().await;

        if models.contains_key(schema.name()) {
            return Err(ModelError::configuration(format!(
                "model `{}` is already registered",
                schema.name()
            )));
        }

        debug!(model = schema.name(), collection = schema.collection(), "registering model");
        models.insert(schema.name().to_string(), Arc::clone(&schema));

        Ok(Model::new(schema, self.clone()))
    }

    /// Looks up a registered model by name.
    pub async fn lookup_model(&self, name: &str) -> ModelResult<Model> {
        let models = self.inner.models.read().await;

        models
            .get(name)
            .map(|schema| Model::new(Arc::clone(schema), self.clone()))
            .ok_or_else(|| ModelError::Resolution(format!("model `{name}` is not registered")))
    }

    pub async fn model_names(&self) -> Vec<String> {
        let mut names = self
            .inner
            .models
            .read()
            .await
            .keys()
            .cloned()
            .collect::<Vec<_>>();
        names.sort();
        names
    }

    /// Shuts the backend down.
    ///
    /// Fails with an initialization error while other clones of this connection (including
    /// model handles) are still alive.
    pub async fn close(self) -> ModelResult<()> {
        let inner = Arc::try_unwrap(self.inner).map_err(|_| {
            ModelError::Initialization("connection is still in use and cannot be closed".into())
        })?;

        inner.backend.shutdown_boxed().await
    }
}

#[derive(Debug, Clone, Default)]
pub struct ConnectionBuilder {
    config: ConnectionConfig,
}

impl ConnectionBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn config(mut self, config: ConnectionConfig) -> Self {
        self.config = config;
        self
    }

    pub fn populate_concurrency(mut self, limit: usize) -> Self {
        self.config.populate_concurrency = limit;
        self
    }

    pub fn max_populate_depth(mut self, depth: usize) -> Self {
        self.config.max_populate_depth = depth;
        self
    }

    pub fn build<B: StoreBackend + 'static>(self, backend: B) -> Connection {
        Connection {
            inner: Arc::new(ConnectionInner {
                backend: Box::new(backend),
                models: RwLock::new(HashMap::new()),
                config: self.config,
            }),
        }
    }

    /// Builds the backend through its builder, then the connection.
    pub async fn connect<BB>(self, builder: BB) -> ModelResult<Connection>
    where
        BB: StoreBackendBuilder,
        BB::Backend: 'static,
    {
        let backend = builder.build().await?;
        Ok(self.build(backend))
    }
}
