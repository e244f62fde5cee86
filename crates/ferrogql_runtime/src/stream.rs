//! The result stream every pipeline run delivers through.
//!
//! A [`ResultStream`] yields one result for queries and mutations and one
//! result per event for subscriptions. Closing the stream, or cancelling
//! the token that governs it, ends the sequence without an error item.

use crate::request::Response;
use ferrogql_core::FormattedError;
use futures::Stream;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context as TaskContext, Poll};
use tokio::sync::mpsc;
use tokio_util::sync::{CancellationToken, WaitForCancellationFutureOwned};

/// Rewrites every error of every result before it is handed out.
pub type FormatErrorFn = Arc<dyn Fn(FormattedError) -> FormattedError + Send + Sync>;

/// Default number of results buffered between producer and consumer.
pub const DEFAULT_BUFFER: usize = 16;

/// A lazy, cancellable sequence of results.
pub struct ResultStream {
    rx: mpsc::Receiver<Response>,
    token: CancellationToken,
    cancelled: Pin<Box<WaitForCancellationFutureOwned>>,
    formatter: Option<FormatErrorFn>,
    closed: bool,
}

/// The producing half of a [`ResultStream`].
#[derive(Clone)]
pub struct ResultSender {
    tx: mpsc::Sender<Response>,
    token: CancellationToken,
}

impl ResultStream {
    /// Creates a connected sender/stream pair governed by `token`.
    pub fn channel(capacity: usize, token: CancellationToken) -> (ResultSender, ResultStream) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let sender = ResultSender {
            tx,
            token: token.clone(),
        };
        let stream = ResultStream {
            rx,
            cancelled: Box::pin(token.clone().cancelled_owned()),
            token,
            formatter: None,
            closed: false,
        };
        (sender, stream)
    }

    /// A stream that yields `response` and then ends.
    pub fn once(response: Response) -> Self {
        let (sender, stream) = Self::channel(1, CancellationToken::new());
        // Capacity is one and nothing else holds the sender.
        let _ = sender.tx.try_send(response);
        stream
    }

    /// A stream that yields a single result carrying `errors` and no data.
    pub fn failed(errors: Vec<FormattedError>) -> Self {
        Self::once(Response::from_errors(errors))
    }

    /// Applies `formatter` to the errors of every result this stream yields.
    #[must_use]
    pub fn with_formatter(mut self, formatter: FormatErrorFn) -> Self {
        self.formatter = Some(formatter);
        self
    }

    /// Waits for the next result; `None` once the stream has ended.
    pub async fn next(&mut self) -> Option<Response> {
        std::future::poll_fn(|cx| self.poll_result(cx)).await
    }

    /// Closes the stream; the producer observes it and stops.
    pub fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.token.cancel();
            self.rx.close();
        }
    }

    /// Returns true once the stream will yield no more results.
    pub fn is_closed(&self) -> bool {
        self.closed || self.token.is_cancelled()
    }

    /// The token governing this stream.
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.token
    }

    fn poll_result(&mut self, cx: &mut TaskContext<'_>) -> Poll<Option<Response>> {
        if self.closed {
            return Poll::Ready(None);
        }
        // Cancellation wins over buffered results.
        if self.cancelled.as_mut().poll(cx).is_ready() {
            self.close();
            return Poll::Ready(None);
        }
        match self.rx.poll_recv(cx) {
            Poll::Ready(Some(response)) => Poll::Ready(Some(self.format(response))),
            Poll::Ready(None) => {
                self.closed = true;
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }

    fn format(&self, mut response: Response) -> Response {
        if let Some(formatter) = &self.formatter {
            response.errors = response.errors.into_iter().map(formatter.as_ref()).collect();
        }
        response
    }
}

impl Stream for ResultStream {
    type Item = Response;

    fn poll_next(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<Option<Response>> {
        self.get_mut().poll_result(cx)
    }
}

impl Drop for ResultStream {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

impl std::fmt::Debug for ResultStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResultStream")
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl ResultSender {
    /// Sends a result, waiting for buffer space.
    ///
    /// Returns false once the stream is closed or cancelled; the result is
    /// then dropped.
    pub async fn send(&self, response: Response) -> bool {
        tokio::select! {
            biased;
            _ = self.token.cancelled() => false,
            sent = self.tx.send(response) => sent.is_ok(),
        }
    }

    /// Returns true once the consumer can no longer receive results.
    pub fn is_closed(&self) -> bool {
        self.token.is_cancelled() || self.tx.is_closed()
    }

    /// Resolves once the consumer can no longer receive results.
    pub async fn closed(&self) {
        tokio::select! {
            _ = self.token.cancelled() => {}
            _ = self.tx.closed() => {}
        }
    }

    /// The token governing the stream.
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.token
    }
}
