//! Runtime for ferrogql.
//!
//! This crate provides the GraphQL execution runtime:
//! - `schema`: Schema definition and building
//! - `resolver`: Field and subscription resolvers
//! - `context`: Request-scoped data and cancellation
//! - `validation`: Document validation against a schema
//! - `executor`: Single-result and streaming execution
//! - `stream`: The result stream every run delivers through
//! - `extension`: Hooks around parsing and validation
//! - `pipeline`: The engine taking a request from text to results

pub mod context;
pub mod executor;
pub mod extension;
pub mod pipeline;
pub mod request;
pub mod resolver;
pub mod schema;
pub mod stream;
pub mod validation;

pub use context::Context;
pub use executor::{Executor, ExecutorConfig};
pub use extension::{Extension, Extensions, ParseFinish, ValidationFinish};
pub use pipeline::Engine;
pub use request::{Request, Response};
pub use resolver::{
    AsyncFnResolver, DefaultResolver, EventStream, FnResolver, Resolver, ResolverArgs,
    ResolverError, ResolverFuture, ResolverInfo, ResolverMap, ResolverResult, SharedResolver,
    StreamFnResolver, SubscribeFuture, SubscriptionResolver,
};
pub use schema::{
    EnumDef, FieldDef, InputValueDef, ObjectDef, ScalarDef, Schema, SchemaBuilder, TypeDef,
    TypeRef,
};
pub use stream::{FormatErrorFn, ResultSender, ResultStream, DEFAULT_BUFFER};
pub use validation::{validate, validate_with_max_depth, ValidationOutcome};
