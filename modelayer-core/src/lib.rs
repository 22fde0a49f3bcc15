//! Core of the modelayer object-document mapper.
//!
//! This crate turns a caller's field selection into exactly the storage work needed to
//! answer it, and shapes the results back to what was asked for:
//!
//! - **Schemas** ([`schema`]) - Fields, virtual fields, relationships and hooks of a model
//! - **Dependency resolution** ([`resolve`]) - Expanding a selection into a resolution plan
//! - **Hooks** ([`hook`]) - Lifecycle phases and the hook pipeline executor
//! - **Virtuals** ([`virtuals`]) - Materializing computed fields in dependency order
//! - **Relationships** ([`relation`]) - Batched population of related documents
//! - **Projections** ([`projection`]) - Field projections and output trimming
//! - **Models** ([`model`]) and **connections** ([`connection`]) - The operation pipelines
//! - **Store backend abstraction** ([`backend`]) - Traits for implementing storage backends
//! - **Query and filtering API** ([`query`]) - Filter expressions and storage queries
//! - **Error handling** ([`error`]) - Error types and result types
//!
//! # Example
//!
//! ```ignore
//! use modelayer::prelude::*;
//!
//! let connection = Connection::new(InMemoryStore::new());
//! let posts = connection
//!     .register(
//!         Schema::builder("posts")
//!             .field(FieldDef::new("title", FieldType::String))
//!             .relationship(RelationshipDef::single("author", "users"))
//!             .build()?,
//!     )
//!     .await?;
//!
//! let docs = posts
//!     .find(FindRequest::new().field("title").field("author.name"))
//!     .await?;
//! ```

#[allow(unused_extern_crates)]
extern crate self as modelayer_core;

pub mod backend;
pub mod connection;
pub mod document;
pub mod error;
pub mod hook;
pub mod model;
pub mod projection;
pub mod query;
pub mod relation;
pub mod resolve;
pub mod schema;
pub mod virtuals;
