//! Lifecycle hooks around parsing and validation.
//!
//! Every stage has a start hook and a finish hook. The start call hands back
//! a finisher that must be consumed exactly once, so instrumentation always
//! sees balanced start/finish pairs, failures included.

use crate::request::Request;
use ferrogql_core::FormattedError;
use std::sync::Arc;

/// Instrumentation invoked around the stages of a request.
///
/// Every hook may return errors; any error fails the request at that stage.
pub trait Extension: Send + Sync {
    /// A short name used in logs.
    fn name(&self) -> &str;

    fn init(&self, _request: &Request) -> Vec<FormattedError> {
        Vec::new()
    }

    fn parse_did_start(&self, _request: &Request) -> Vec<FormattedError> {
        Vec::new()
    }

    /// Receives the errors the parse stage ended with, empty on success.
    fn parse_did_end(&self, _request: &Request, _errors: &[FormattedError]) -> Vec<FormattedError> {
        Vec::new()
    }

    fn validation_did_start(&self, _request: &Request) -> Vec<FormattedError> {
        Vec::new()
    }

    /// Receives the errors the validation stage ended with, empty on success.
    fn validation_did_end(
        &self,
        _request: &Request,
        _errors: &[FormattedError],
    ) -> Vec<FormattedError> {
        Vec::new()
    }
}

/// The ordered set of extensions registered on an engine.
#[derive(Clone, Default)]
pub struct Extensions {
    hooks: Vec<Arc<dyn Extension>>,
}

impl Extensions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends an extension; hooks run in registration order.
    pub fn push(&mut self, extension: Arc<dyn Extension>) {
        self.hooks.push(extension);
    }

    pub fn len(&self) -> usize {
        self.hooks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }

    /// Runs every `init` hook.
    pub fn run_init(&self, request: &Request) -> Vec<FormattedError> {
        collect(&self.hooks, |ext| ext.init(request))
    }

    /// Runs every parse start hook.
    pub fn run_parse_start(&self, request: &Request) -> (Vec<FormattedError>, ParseFinish) {
        let errors = collect(&self.hooks, |ext| ext.parse_did_start(request));
        (
            errors,
            ParseFinish {
                hooks: self.hooks.clone(),
            },
        )
    }

    /// Runs every validation start hook.
    pub fn run_validation_start(
        &self,
        request: &Request,
    ) -> (Vec<FormattedError>, ValidationFinish) {
        let errors = collect(&self.hooks, |ext| ext.validation_did_start(request));
        (
            errors,
            ValidationFinish {
                hooks: self.hooks.clone(),
            },
        )
    }
}

impl std::fmt::Debug for Extensions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.hooks.iter().map(|ext| ext.name()))
            .finish()
    }
}

/// Pending finish hooks of the parse stage.
#[must_use = "the parse finish hooks must be run"]
pub struct ParseFinish {
    hooks: Vec<Arc<dyn Extension>>,
}

impl ParseFinish {
    /// Runs every parse finish hook with the stage's errors.
    pub fn finish(self, request: &Request, errors: &[FormattedError]) -> Vec<FormattedError> {
        collect(&self.hooks, |ext| ext.parse_did_end(request, errors))
    }
}

/// Pending finish hooks of the validation stage.
#[must_use = "the validation finish hooks must be run"]
pub struct ValidationFinish {
    hooks: Vec<Arc<dyn Extension>>,
}

impl ValidationFinish {
    /// Runs every validation finish hook with the stage's errors.
    pub fn finish(self, request: &Request, errors: &[FormattedError]) -> Vec<FormattedError> {
        collect(&self.hooks, |ext| ext.validation_did_end(request, errors))
    }
}

fn collect(
    hooks: &[Arc<dyn Extension>],
    mut run: impl FnMut(&dyn Extension) -> Vec<FormattedError>,
) -> Vec<FormattedError> {
    let mut errors = Vec::new();
    for ext in hooks {
        let produced = run(ext.as_ref());
        if !produced.is_empty() {
            tracing::debug!(extension = ext.name(), count = produced.len(), "extension reported errors");
        }
        errors.extend(produced);
    }
    errors
}
