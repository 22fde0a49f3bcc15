//! Convenient re-exports of commonly used types from modelayer.
//!
//! ```ignore
//! use modelayer::prelude::*;
//! ```

pub use bson::{Bson, doc};

pub use modelayer_core::{
    backend::{StoreBackend, StoreBackendBuilder},
    connection::{Connection, ConnectionBuilder, ConnectionConfig},
    document::{Document, PRIMARY_KEY},
    error::{ModelError, ModelResult},
    hook::{HookDef, HookHandler, HookRequest, HookState, Phase},
    model::{FindRequest, Model},
    projection::Projection,
    query::{Expr, FieldOp, Filter, FindOptions, Query, QueryBuilder, Sort, SortDirection},
    resolve::{ResolutionPlan, Selection},
    schema::{Cardinality, FieldDef, FieldType, RelationshipDef, Schema, SchemaBuilder, VirtualDef},
};
