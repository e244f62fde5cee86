//! Request pipeline.
//!
//! [`Engine::run`] takes one request through init, parse, validation and
//! execution. Every outcome, failures included, is delivered through the
//! returned [`ResultStream`].

use crate::executor::{Executor, ExecutorConfig};
use crate::extension::{Extension, Extensions};
use crate::request::{Request, Response};
use crate::schema::Schema;
use crate::stream::{FormatErrorFn, ResultStream};
use crate::validation::validate_with_max_depth;
use ferrogql_core::FormattedError;
use ferrogql_syntax::{Document, OperationType, Parser};
use std::sync::Arc;

/// The GraphQL engine: a schema plus the extensions run around each request.
#[derive(Clone)]
pub struct Engine {
    executor: Executor,
    extensions: Extensions,
    formatter: Option<FormatErrorFn>,
}

impl Engine {
    pub fn new(schema: Schema) -> Self {
        Self::from_arc(Arc::new(schema))
    }

    pub fn from_arc(schema: Arc<Schema>) -> Self {
        Self {
            executor: Executor::new(schema),
            extensions: Extensions::new(),
            formatter: None,
        }
    }

    /// Registers an extension. Hooks run in registration order.
    #[must_use]
    pub fn with_extension(mut self, extension: impl Extension + 'static) -> Self {
        self.extensions.push(Arc::new(extension));
        self
    }

    /// Rewrites every error of every result.
    #[must_use]
    pub fn with_error_formatter<F>(mut self, formatter: F) -> Self
    where
        F: Fn(FormattedError) -> FormattedError + Send + Sync + 'static,
    {
        self.formatter = Some(Arc::new(formatter));
        self
    }

    #[must_use]
    pub fn with_executor_config(mut self, config: ExecutorConfig) -> Self {
        self.executor = Executor::with_config(Arc::clone(self.executor.schema()), config);
        self
    }

    pub fn schema(&self) -> &Arc<Schema> {
        self.executor.schema()
    }

    pub fn extensions(&self) -> &Extensions {
        &self.extensions
    }

    /// Runs a request.
    ///
    /// Parsing and validation happen before this returns; execution runs on
    /// a spawned task, so this must be called within a tokio runtime.
    /// Subscriptions stream one result per event only when
    /// `allow_streaming` is true. Everything else yields exactly one result.
    pub fn run(&self, request: Request, allow_streaming: bool) -> ResultStream {
        let stream = self.run_stages(request, allow_streaming);
        match &self.formatter {
            Some(formatter) => stream.with_formatter(Arc::clone(formatter)),
            None => stream,
        }
    }

    /// Runs a request to its single result.
    pub async fn execute(&self, request: Request) -> Response {
        let mut stream = self.run(request, false);
        stream.next().await.unwrap_or_default()
    }

    /// Runs a request allowing subscriptions to stream.
    pub fn subscribe(&self, request: Request) -> ResultStream {
        self.run(request, true)
    }

    fn run_stages(&self, request: Request, allow_streaming: bool) -> ResultStream {
        let errors = self.extensions.run_init(&request);
        if !errors.is_empty() {
            tracing::debug!(count = errors.len(), "request rejected by init hooks");
            return ResultStream::failed(errors);
        }

        let document = match self.parse_stage(&request) {
            Ok(document) => Arc::new(document),
            Err(errors) => {
                tracing::debug!(count = errors.len(), "parse failed");
                return ResultStream::failed(errors);
            }
        };

        if let Err(errors) = self.validation_stage(&request, &document) {
            tracing::debug!(count = errors.len(), "validation failed");
            return ResultStream::failed(errors);
        }

        self.dispatch(document, request, allow_streaming)
    }

    fn parse_stage(&self, request: &Request) -> Result<Document, Vec<FormattedError>> {
        let (mut errors, finish) = self.extensions.run_parse_start(request);

        let stage = errors
            .is_empty()
            .then(|| {
                Parser::new(&request.query)
                    .with_max_depth(self.executor.config().max_depth)
                    .parse_document()
                    .map_err(FormattedError::from)
            });
        let outcome = match &stage {
            Some(Ok(_)) => Vec::new(),
            Some(Err(error)) => vec![error.clone()],
            None => errors.clone(),
        };
        errors.extend(finish.finish(request, &outcome));

        match stage {
            Some(Ok(document)) if errors.is_empty() => Ok(document),
            Some(Err(error)) => {
                errors.push(error);
                Err(errors)
            }
            _ => Err(errors),
        }
    }

    fn validation_stage(
        &self,
        request: &Request,
        document: &Document,
    ) -> Result<(), Vec<FormattedError>> {
        let (mut errors, finish) = self.extensions.run_validation_start(request);

        let stage = errors
            .is_empty()
            .then(|| {
                let max_depth = self.executor.config().max_depth;
                validate_with_max_depth(self.executor.schema(), document, max_depth).errors
            });
        let outcome = stage.clone().unwrap_or_else(|| errors.clone());
        errors.extend(finish.finish(request, &outcome));
        errors.extend(stage.unwrap_or_default());

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    fn dispatch(
        &self,
        document: Arc<Document>,
        request: Request,
        allow_streaming: bool,
    ) -> ResultStream {
        let kind = document
            .select_operation(request.operation_name.as_deref())
            .map(|op| op.operation)
            .or_else(|| document.first_operation_kind());
        let request = Request {
            context: request.context.child(),
            ..request
        };

        if allow_streaming && kind == Some(OperationType::Subscription) {
            tracing::debug!(operation = ?request.operation_name, "streaming execution");
            return self.executor.execute_streaming(document, request);
        }

        tracing::debug!(operation = ?request.operation_name, kind = ?kind, "single-result execution");
        let token = request.context.cancellation_token().clone();
        let (sender, stream) = ResultStream::channel(1, token);
        let executor = self.executor.clone();
        tokio::spawn(async move {
            tokio::select! {
                biased;
                () = sender.closed() => {}
                response = executor.execute_once(&document, &request) => {
                    sender.send(response).await;
                }
            }
        });
        stream
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("extensions", &self.extensions)
            .field("formatter", &self.formatter.is_some())
            .finish_non_exhaustive()
    }
}
