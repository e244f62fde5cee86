//! The transport-facing handle: an engine plus server settings and hooks.

use crate::config::ServerConfig;
use crate::error::ServerError;
use ferrogql_runtime::{Context, Engine, Request, Response};
use hyper::HeaderMap;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Derives a connection context from the headers a client sent in `connection_init`.
pub type HeadersFn = Arc<dyn Fn(Context, &BTreeMap<String, String>) -> Context + Send + Sync>;

/// Supplies the root value of a request from its HTTP headers.
pub type RootValueFn = Arc<dyn Fn(&HeaderMap) -> Map<String, Value> + Send + Sync>;

/// Observes an HTTP request's result along with the exact bytes sent back.
pub type ResultFn = Arc<dyn Fn(&Context, &Request, &Response, &[u8]) + Send + Sync>;

/// Shared by every connection a server accepts.
#[derive(Clone)]
pub struct Handler {
    engine: Engine,
    config: Arc<ServerConfig>,
    context: Context,
    on_headers: Option<HeadersFn>,
    root_value: Option<RootValueFn>,
    on_result: Option<ResultFn>,
}

impl Handler {
    /// Creates a handler, rejecting an invalid config.
    pub fn new(engine: Engine, config: ServerConfig) -> Result<Self, ServerError> {
        config.validate()?;
        Ok(Self {
            engine,
            config: Arc::new(config),
            context: Context::new(),
            on_headers: None,
            root_value: None,
            on_result: None,
        })
    }

    /// Sets the base context every connection and request derives from.
    ///
    /// Cancelling it cancels every connection.
    #[must_use]
    pub fn with_context(mut self, context: Context) -> Self {
        self.context = context;
        self
    }

    #[must_use]
    pub fn on_headers<F>(mut self, f: F) -> Self
    where
        F: Fn(Context, &BTreeMap<String, String>) -> Context + Send + Sync + 'static,
    {
        self.on_headers = Some(Arc::new(f));
        self
    }

    #[must_use]
    pub fn root_value<F>(mut self, f: F) -> Self
    where
        F: Fn(&HeaderMap) -> Map<String, Value> + Send + Sync + 'static,
    {
        self.root_value = Some(Arc::new(f));
        self
    }

    /// Called after every POST result is encoded, before it is sent.
    #[must_use]
    pub fn on_result<F>(mut self, f: F) -> Self
    where
        F: Fn(&Context, &Request, &Response, &[u8]) + Send + Sync + 'static,
    {
        self.on_result = Some(Arc::new(f));
        self
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn context(&self) -> &Context {
        &self.context
    }

    /// Folds `connection_init` headers into `context`.
    ///
    /// Headers are always visible through [`Context::header`]; the
    /// `on_headers` hook may derive more from them.
    pub fn apply_headers(&self, mut context: Context, headers: &BTreeMap<String, String>) -> Context {
        for (key, value) in headers {
            context.set_header(key.to_ascii_lowercase(), value.clone());
        }
        match &self.on_headers {
            Some(hook) => hook(context, headers),
            None => context,
        }
    }

    /// The root value for a request arriving with `headers`.
    pub fn root_value_for(&self, headers: &HeaderMap) -> Map<String, Value> {
        self.root_value
            .as_ref()
            .map(|f| f(headers))
            .unwrap_or_default()
    }

    pub fn result_hook(&self) -> Option<&ResultFn> {
        self.on_result.as_ref()
    }
}

impl std::fmt::Debug for Handler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handler")
            .field("engine", &self.engine)
            .field("config", &self.config)
            .field("on_headers", &self.on_headers.is_some())
            .field("root_value", &self.root_value.is_some())
            .field("on_result", &self.on_result.is_some())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::KeepaliveConfig;
    use ferrogql_runtime::SchemaBuilder;
    use serde_json::json;
    use std::time::Duration;

    struct User(String);

    fn engine() -> Engine {
        Engine::new(SchemaBuilder::new().build())
    }

    #[test]
    fn test_rejects_invalid_config() {
        let config = ServerConfig::new().keepalive(KeepaliveConfig::new(
            Duration::from_secs(10),
            Duration::from_secs(9),
        ));
        assert!(matches!(
            Handler::new(engine(), config),
            Err(ServerError::Config(_))
        ));
    }

    #[test]
    fn test_apply_headers() {
        let handler = Handler::new(engine(), ServerConfig::new())
            .unwrap()
            .on_headers(|ctx, headers| match headers.get("Authorization") {
                Some(token) => ctx.with(User(token.trim_start_matches("Bearer ").into())),
                None => ctx,
            });

        let mut headers = BTreeMap::new();
        headers.insert("Authorization".to_string(), "Bearer ada".to_string());
        let ctx = handler.apply_headers(Context::new(), &headers);

        assert_eq!(ctx.header("authorization"), Some("Bearer ada"));
        assert_eq!(ctx.data::<User>().unwrap().0, "ada");
    }

    #[test]
    fn test_root_value() {
        let handler = Handler::new(engine(), ServerConfig::new()).unwrap();
        assert!(handler.root_value_for(&HeaderMap::new()).is_empty());

        let handler = handler.root_value(|headers| {
            let mut root = Map::new();
            root.insert("agent".into(), json!(headers.contains_key("user-agent")));
            root
        });
        assert_eq!(handler.root_value_for(&HeaderMap::new())["agent"], json!(false));
    }
}
