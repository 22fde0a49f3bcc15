//! Main modelayer crate: a dependency-driven object-document mapper.
//!
//! This crate is the primary entry point. It re-exports the core types from
//! `modelayer-core` and the storage backends shipped alongside it.
//!
//! # Features
//!
//! - **Sparse field selection** - Ask for exactly the fields you need, including virtual
//!   (computed) fields and fields of related documents
//! - **Dependency resolution** - Virtual fields declare what they read; the resolver fetches it
//! - **Lifecycle hooks** - Named, phase-scoped handlers that run around every operation
//! - **Batched relationships** - One query per related model, no matter how many parents
//!
//! # Quick Start
//!
//! ```ignore
//! use modelayer::{prelude::*, memory::InMemoryStore};
//!
//! #[tokio::main]
//! async fn main() -> ModelResult<()> {
//!     let connection = Connection::new(InMemoryStore::new());
//!
//!     let users = connection
//!         .register(
//!             Schema::builder("users")
//!                 .field(FieldDef::new("first", FieldType::String))
//!                 .field(FieldDef::new("last", FieldType::String))
//!                 .virtual_field(
//!                     VirtualDef::new("full_name")
//!                         .requires(["first", "last"])
//!                         .get(|doc| {
//!                             let first = doc.get("first")?;
//!                             let last = doc.get("last")?;
//!                             Some(format!("{} {}", first.as_str()?, last.as_str()?).into())
//!                         }),
//!                 )
//!                 .build()?,
//!         )
//!         .await?;
//!
//!     users.insert_one(doc! { "first": "Ada", "last": "Lovelace" }, &[]).await?;
//!
//!     // Only `full_name` comes back; `first` and `last` are fetched and trimmed off again.
//!     let found = users.find(FindRequest::new().field("full_name")).await?;
//!     println!("{:?}", found[0].data());
//!
//!     connection.close().await
//! }
//! ```
//!
//! # Backends
//!
//! - [`memory`] - In-memory storage for development and testing

pub mod prelude;

pub use modelayer_core::{
    backend, connection, document, error, hook, model, projection, query, relation, resolve, schema,
    virtuals,
};

// Re-export BSON types for convenience
pub use bson;

/// In-memory storage backend implementations.
pub mod memory {
    pub use modelayer_memory::{InMemoryStore, InMemoryStoreBuilder};
}
