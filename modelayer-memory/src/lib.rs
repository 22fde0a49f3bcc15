//! In-memory storage backend for modelayer.
//!
//! This crate provides a thread-safe, in-memory implementation of the `StoreBackend` trait.
//! It uses async-aware read-write locks for concurrent access and is meant for development,
//! testing, and small-scale deployments.
//!
//! # Features
//!
//! - **Thread-safe access** - Concurrent reads and writes using async-aware RwLock
//! - **Full query support** - Filtering on dot-paths, sorting, paging and projection
//! - **Query accounting** - Per-collection find counters
//!
//! # Quick Start
//!
//! ```ignore
//! use modelayer::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let backend = InMemoryStore::builder().build().await?;
//!     let connection = Connection::new(backend);
//!
//!     let users = connection
//!         .register(Schema::builder("users").field(FieldDef::new("name", FieldType::String)).build()?)
//!         .await?;
//!
//!     users.insert_one(doc! { "name": "Alice" }, &[]).await?;
//!
//!     Ok(())
//! }
//! ```

#[allow(unused_extern_crates)]
extern crate self as modelayer_memory;

pub mod store;
pub mod evaluator;

pub use store::{InMemoryStore, InMemoryStoreBuilder};
