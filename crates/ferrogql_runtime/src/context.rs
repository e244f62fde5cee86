//! Request-scoped context handed to every resolver.

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

/// Request-scoped data plus the cancellation handle governing the request.
///
/// Cloning is cheap: the maps are shared until one of the clones writes.
///
/// ```
/// use ferrogql_runtime::Context;
///
/// #[derive(Clone)]
/// struct UserId(String);
///
/// let ctx = Context::new()
///     .with(UserId("42".into()))
///     .with_header("authorization", "Bearer token");
///
/// assert_eq!(ctx.data::<UserId>().unwrap().0, "42");
/// assert_eq!(ctx.header("authorization"), Some("Bearer token"));
/// ```
#[derive(Clone, Default)]
pub struct Context {
    values: Arc<HashMap<String, Value>>,
    typed: Arc<FxHashMap<TypeId, Arc<dyn Any + Send + Sync>>>,
    headers: Arc<HashMap<String, String>>,
    token: CancellationToken,
}

impl Context {
    /// Creates a new context with a fresh cancellation token.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets a JSON value in the context.
    pub fn set<T: Serialize>(&mut self, key: impl Into<String>, value: T) {
        if let Ok(v) = serde_json::to_value(value) {
            Arc::make_mut(&mut self.values).insert(key.into(), v);
        }
    }

    /// Gets a JSON value from the context, deserialized into `T`.
    pub fn get<T: for<'de> Deserialize<'de>>(&self, key: &str) -> Option<T> {
        self.values
            .get(key)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    /// Gets the raw JSON value stored under `key`.
    pub fn value(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    /// Inserts a typed value, replacing any previous value of the same type.
    pub fn insert<T: Send + Sync + 'static>(&mut self, value: T) {
        Arc::make_mut(&mut self.typed).insert(TypeId::of::<T>(), Arc::new(value));
    }

    /// Gets a typed value.
    pub fn data<T: 'static>(&self) -> Option<&T> {
        self.typed
            .get(&TypeId::of::<T>())
            .and_then(|boxed| boxed.downcast_ref())
    }

    /// Sets a header value.
    pub fn set_header(&mut self, key: impl Into<String>, value: impl Into<String>) {
        Arc::make_mut(&mut self.headers).insert(key.into(), value.into());
    }

    /// Gets a header value.
    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers.get(key).map(String::as_str)
    }

    /// Returns all headers.
    pub fn headers(&self) -> &HashMap<String, String> {
        &self.headers
    }

    /// Adds a typed value and returns self.
    #[must_use]
    pub fn with<T: Send + Sync + 'static>(mut self, value: T) -> Self {
        self.insert(value);
        self
    }

    /// Adds a header and returns self.
    #[must_use]
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.set_header(key, value);
        self
    }

    /// Adds a JSON value and returns self.
    #[must_use]
    pub fn with_value<T: Serialize>(mut self, key: impl Into<String>, value: T) -> Self {
        self.set(key, value);
        self
    }

    /// Derives a context sharing this one's data whose token is a child of
    /// this one's token.
    ///
    /// Cancelling the child leaves the parent untouched; cancelling the parent
    /// cancels every child.
    #[must_use]
    pub fn child(&self) -> Self {
        self.with_token(self.token.child_token())
    }

    /// Returns a copy of this context governed by `token`.
    #[must_use]
    pub fn with_token(&self, token: CancellationToken) -> Self {
        Self {
            values: Arc::clone(&self.values),
            typed: Arc::clone(&self.typed),
            headers: Arc::clone(&self.headers),
            token,
        }
    }

    /// The cancellation token governing this context.
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.token
    }

    /// Cancels this context and every context derived from it.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Waits until this context is cancelled.
    pub fn cancelled(&self) -> WaitForCancellationFuture<'_> {
        self.token.cancelled()
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("values", &self.values)
            .field("typed_count", &self.typed.len())
            .field("headers", &self.headers)
            .field("cancelled", &self.token.is_cancelled())
            .finish()
    }
}
