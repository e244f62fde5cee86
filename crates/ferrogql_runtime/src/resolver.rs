//! Field and subscription resolvers.
//!
//! A [`Resolver`] produces one value per field. A [`SubscriptionResolver`]
//! produces the source event stream behind a subscription root field; the
//! executor then runs the selection set once per event.

use crate::context::Context;
use ferrogql_core::PathSegment;
use futures::stream::BoxStream;
use rustc_hash::FxHashMap;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

/// Coerced field arguments, in schema declaration order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResolverArgs(Map<String, Value>);

impl ResolverArgs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_pairs(pairs: impl IntoIterator<Item = (String, Value)>) -> Self {
        Self(Map::from_iter(pairs))
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.0.get(name)
    }

    /// Deserializes the argument `name`, or `None` when it is absent or
    /// has the wrong shape.
    pub fn get_as<T>(&self, name: &str) -> Option<T>
    where
        T: DeserializeOwned,
    {
        T::deserialize(self.0.get(name)?).ok()
    }

    /// Like [`get_as`](Self::get_as), but absence and shape mismatches are
    /// errors.
    pub fn require<T>(&self, name: &str) -> Result<T, ResolverError>
    where
        T: DeserializeOwned,
    {
        let value = self
            .0
            .get(name)
            .ok_or_else(|| ResolverError::MissingArgument(name.to_owned()))?;
        T::deserialize(value)
            .map_err(|err| ResolverError::ArgumentParse(name.to_owned(), err.to_string()))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn set(&mut self, name: impl Into<String>, value: Value) {
        self.0.insert(name.into(), value);
    }
}

/// Where in the response a resolver is running.
#[derive(Debug, Clone)]
pub struct ResolverInfo {
    pub field_name: String,
    /// Owning object type.
    pub parent_type: String,
    /// Declared type of the field, e.g. `[User!]!`.
    pub return_type: String,
    pub path: Vec<PathSegment>,
    /// Coerced operation variables.
    pub variables: Arc<Map<String, Value>>,
}

impl ResolverInfo {
    pub fn new(field_name: impl Into<String>, parent_type: impl Into<String>) -> Self {
        Self {
            field_name: field_name.into(),
            parent_type: parent_type.into(),
            return_type: String::new(),
            path: Vec::new(),
            variables: Arc::default(),
        }
    }

    #[must_use]
    pub fn with_return_type(mut self, return_type: impl Into<String>) -> Self {
        self.return_type = return_type.into();
        self
    }

    #[must_use]
    pub fn with_path(mut self, path: Vec<PathSegment>) -> Self {
        self.path = path;
        self
    }

    #[must_use]
    pub fn with_variables(mut self, variables: Arc<Map<String, Value>>) -> Self {
        self.variables = variables;
        self
    }
}

pub type ResolverResult = Result<Value, ResolverError>;

/// Boxed future returned by [`Resolver::resolve`].
pub type ResolverFuture<'a> = Pin<Box<dyn Future<Output = ResolverResult> + Send + 'a>>;

/// A subscription's source event stream.
///
/// An `Err` item is reported as a result carrying that error; the stream
/// keeps going.
pub type EventStream = BoxStream<'static, Result<Value, ResolverError>>;

/// Boxed future returned by [`SubscriptionResolver::subscribe`].
pub type SubscribeFuture<'a> =
    Pin<Box<dyn Future<Output = Result<EventStream, ResolverError>> + Send + 'a>>;

/// Failure raised by a resolver.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ResolverError {
    /// The parent value has no such property.
    #[error("Field not found: {0}")]
    FieldNotFound(String),

    #[error("Missing required argument: {0}")]
    MissingArgument(String),

    #[error("Failed to parse argument '{0}': {1}")]
    ArgumentParse(String, String),

    /// Message shown to the client as is.
    #[error("{0}")]
    Custom(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ResolverError {
    pub fn custom(message: impl Into<String>) -> Self {
        Self::Custom(message.into())
    }
}

/// Resolves one field of one object value.
pub trait Resolver: Send + Sync {
    fn resolve<'a>(
        &'a self,
        parent: &'a Value,
        args: &'a ResolverArgs,
        ctx: &'a Context,
        info: &'a ResolverInfo,
    ) -> ResolverFuture<'a>;
}

/// Opens the source stream of a subscription root field.
pub trait SubscriptionResolver: Send + Sync {
    fn subscribe<'a>(
        &'a self,
        root: &'a Value,
        args: &'a ResolverArgs,
        ctx: &'a Context,
        info: &'a ResolverInfo,
    ) -> SubscribeFuture<'a>;
}

pub type SharedResolver = Arc<dyn Resolver>;

/// Adapts a synchronous closure into a [`Resolver`].
pub struct FnResolver<F>(F);

impl<F> FnResolver<F>
where
    F: Fn(&Value, &ResolverArgs, &Context, &ResolverInfo) -> ResolverResult + Send + Sync,
{
    pub fn new(f: F) -> Self {
        Self(f)
    }
}

impl<F> Resolver for FnResolver<F>
where
    F: Fn(&Value, &ResolverArgs, &Context, &ResolverInfo) -> ResolverResult + Send + Sync,
{
    fn resolve<'a>(
        &'a self,
        parent: &'a Value,
        args: &'a ResolverArgs,
        ctx: &'a Context,
        info: &'a ResolverInfo,
    ) -> ResolverFuture<'a> {
        Box::pin(std::future::ready((self.0)(parent, args, ctx, info)))
    }
}

/// Adapts an async closure into a [`Resolver`].
///
/// The closure receives owned copies of its inputs so the returned future
/// can be `'static`.
pub struct AsyncFnResolver<F>(F);

impl<F, Fut> AsyncFnResolver<F>
where
    F: Fn(Value, ResolverArgs, Context, ResolverInfo) -> Fut + Send + Sync,
    Fut: Future<Output = ResolverResult> + Send + 'static,
{
    pub fn new(f: F) -> Self {
        Self(f)
    }
}

impl<F, Fut> Resolver for AsyncFnResolver<F>
where
    F: Fn(Value, ResolverArgs, Context, ResolverInfo) -> Fut + Send + Sync,
    Fut: Future<Output = ResolverResult> + Send + 'static,
{
    fn resolve<'a>(
        &'a self,
        parent: &'a Value,
        args: &'a ResolverArgs,
        ctx: &'a Context,
        info: &'a ResolverInfo,
    ) -> ResolverFuture<'a> {
        Box::pin((self.0)(
            parent.clone(),
            args.clone(),
            ctx.clone(),
            info.clone(),
        ))
    }
}

/// Adapts an async closure into a [`SubscriptionResolver`].
pub struct StreamFnResolver<F>(F);

impl<F, Fut> StreamFnResolver<F>
where
    F: Fn(Value, ResolverArgs, Context, ResolverInfo) -> Fut + Send + Sync,
    Fut: Future<Output = Result<EventStream, ResolverError>> + Send + 'static,
{
    pub fn new(f: F) -> Self {
        Self(f)
    }
}

impl<F, Fut> SubscriptionResolver for StreamFnResolver<F>
where
    F: Fn(Value, ResolverArgs, Context, ResolverInfo) -> Fut + Send + Sync,
    Fut: Future<Output = Result<EventStream, ResolverError>> + Send + 'static,
{
    fn subscribe<'a>(
        &'a self,
        root: &'a Value,
        args: &'a ResolverArgs,
        ctx: &'a Context,
        info: &'a ResolverInfo,
    ) -> SubscribeFuture<'a> {
        Box::pin((self.0)(
            root.clone(),
            args.clone(),
            ctx.clone(),
            info.clone(),
        ))
    }
}

/// Reads the field off the parent object.
///
/// A camelCase field name also matches its snake_case property, so
/// `createdAt` finds `created_at`. A missing property resolves to null.
pub struct DefaultResolver;

impl DefaultResolver {
    fn lookup(parent: &Value, field: &str) -> ResolverResult {
        match parent {
            Value::Null => Ok(Value::Null),
            Value::Object(object) => {
                let found = match object.get(field) {
                    Some(value) => Some(value),
                    None => object.get(&snake_case(field)),
                };
                Ok(found.cloned().unwrap_or(Value::Null))
            }
            _ => Err(ResolverError::FieldNotFound(field.to_owned())),
        }
    }
}

impl Resolver for DefaultResolver {
    fn resolve<'a>(
        &'a self,
        parent: &'a Value,
        _args: &'a ResolverArgs,
        _ctx: &'a Context,
        info: &'a ResolverInfo,
    ) -> ResolverFuture<'a> {
        Box::pin(std::future::ready(Self::lookup(parent, &info.field_name)))
    }
}

fn snake_case(name: &str) -> String {
    let mut out = String::with_capacity(name.len() + 2);
    for c in name.chars() {
        if c.is_uppercase() {
            if !out.is_empty() {
                out.push('_');
            }
            out.extend(c.to_lowercase());
        } else {
            out.push(c);
        }
    }
    out
}

type FieldTable<T> = FxHashMap<String, FxHashMap<String, T>>;

/// Resolvers keyed by object type, then field.
pub struct ResolverMap {
    fields: FieldTable<SharedResolver>,
    subscriptions: FieldTable<Arc<dyn SubscriptionResolver>>,
    fallback: SharedResolver,
}

impl Default for ResolverMap {
    fn default() -> Self {
        Self::new()
    }
}

impl ResolverMap {
    /// An empty map whose fallback is [`DefaultResolver`].
    pub fn new() -> Self {
        Self {
            fields: FieldTable::default(),
            subscriptions: FieldTable::default(),
            fallback: Arc::new(DefaultResolver),
        }
    }

    /// Sets the resolver for `type_name.field_name`, replacing any prior one.
    pub fn register<R>(
        &mut self,
        type_name: impl Into<String>,
        field_name: impl Into<String>,
        resolver: R,
    ) where
        R: Resolver + 'static,
    {
        self.fields
            .entry(type_name.into())
            .or_default()
            .insert(field_name.into(), Arc::new(resolver));
    }

    pub fn register_subscription<R>(
        &mut self,
        type_name: impl Into<String>,
        field_name: impl Into<String>,
        resolver: R,
    ) where
        R: SubscriptionResolver + 'static,
    {
        self.subscriptions
            .entry(type_name.into())
            .or_default()
            .insert(field_name.into(), Arc::new(resolver));
    }

    /// The resolver for `type_name.field_name`, or the fallback.
    pub fn get(&self, type_name: &str, field_name: &str) -> SharedResolver {
        match self.fields.get(type_name).and_then(|f| f.get(field_name)) {
            Some(resolver) => Arc::clone(resolver),
            None => Arc::clone(&self.fallback),
        }
    }

    pub fn get_subscription(
        &self,
        type_name: &str,
        field_name: &str,
    ) -> Option<Arc<dyn SubscriptionResolver>> {
        self.subscriptions
            .get(type_name)
            .and_then(|fields| fields.get(field_name))
            .map(Arc::clone)
    }

    /// Replaces the resolver used for unregistered fields.
    pub fn set_default<R: Resolver + 'static>(&mut self, resolver: R) {
        self.fallback = Arc::new(resolver);
    }

    fn count<T>(table: &FieldTable<T>) -> usize {
        table.values().map(FxHashMap::len).sum()
    }
}

impl fmt::Debug for ResolverMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResolverMap")
            .field("fields", &Self::count(&self.fields))
            .field("subscriptions", &Self::count(&self.subscriptions))
            .finish_non_exhaustive()
    }
}
