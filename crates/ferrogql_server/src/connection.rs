//! The websocket connection runtime.
//!
//! Each connection runs one reader and one keepalive ticker. Every
//! execution runs on its own task and writes its frames through the
//! shared [`FrameWriter`], so a slow subscription never holds up the
//! reader. Sessions are registered and stopped by the reader itself,
//! which keeps a `stop` from overtaking the `subscribe` it refers to.
//! The reader writes `connection_ack` itself for the same reason.

use crate::error::{ProtocolError, TransportError};
use crate::handler::Handler;
use crate::protocol::{self, Frame, Inbound, ReplyKind, SubscribePayload};
use crate::session::SessionRegistry;
use ferrogql_runtime::Context;
use futures::sink::Sink;
use futures::stream::BoxStream;
use futures::{SinkExt, StreamExt};
use serde_json::{Map, Value};
use std::pin::Pin;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::WebSocketStream;
use tokio_util::sync::CancellationToken;

type MessageSink = Pin<Box<dyn Sink<Message, Error = tungstenite::Error> + Send>>;

/// The inbound half of a connection.
pub type MessageStream = BoxStream<'static, Result<Message, tungstenite::Error>>;

/// Lifecycle of a connection. Only ever moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    Open = 0,
    Closing = 1,
    Closed = 2,
}

impl ConnectionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Open,
            1 => Self::Closing,
            _ => Self::Closed,
        }
    }
}

/// Serializes every outbound write on a connection.
pub struct FrameWriter {
    sink: tokio::sync::Mutex<MessageSink>,
    timeout: Duration,
}

impl FrameWriter {
    fn new(sink: MessageSink, timeout: Duration) -> Self {
        Self {
            sink: tokio::sync::Mutex::new(sink),
            timeout,
        }
    }

    pub async fn send_frame(&self, frame: &Frame) -> Result<(), TransportError> {
        let text = serde_json::to_string(frame)?;
        self.send(Message::Text(text)).await
    }

    pub async fn send(&self, message: Message) -> Result<(), TransportError> {
        let mut sink = self.sink.lock().await;
        match tokio::time::timeout(self.timeout, sink.send(message)).await {
            Ok(result) => result.map_err(TransportError::Write),
            Err(_) => Err(TransportError::WriteTimeout(self.timeout)),
        }
    }

    async fn close(&self) {
        let mut sink = self.sink.lock().await;
        match tokio::time::timeout(self.timeout, sink.close()).await {
            Ok(Err(error)) => tracing::debug!(%error, "error closing socket"),
            Err(_) => tracing::debug!("timed out closing socket"),
            Ok(Ok(())) => {}
        }
    }
}

/// One websocket connection.
pub struct Connection {
    handler: Handler,
    writer: FrameWriter,
    sessions: SessionRegistry,
    token: CancellationToken,
    state: AtomicU8,
    root_value: Map<String, Value>,
}

impl Connection {
    /// Wraps an established websocket. Drive it with [`Connection::run`].
    pub fn new<S>(ws: WebSocketStream<S>, handler: Handler) -> (Arc<Self>, MessageStream)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        Self::with_root_value(ws, handler, Map::new())
    }

    /// Like [`Connection::new`]; every request on the connection gets `root_value`.
    pub fn with_root_value<S>(
        ws: WebSocketStream<S>,
        handler: Handler,
        root_value: Map<String, Value>,
    ) -> (Arc<Self>, MessageStream)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (sink, stream) = ws.split();
        let token = handler.context().cancellation_token().child_token();
        let writer = FrameWriter::new(Box::pin(sink), handler.config().write_timeout);
        let connection = Arc::new(Self {
            handler,
            writer,
            sessions: SessionRegistry::new(),
            token,
            state: AtomicU8::new(ConnectionState::Open as u8),
            root_value,
        });
        (connection, stream.boxed())
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn sessions(&self) -> &SessionRegistry {
        &self.sessions
    }

    /// Cancelled when the connection starts tearing down.
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.token
    }

    /// Runs the connection until the peer leaves, a transport error
    /// occurs, or the connection is terminated.
    pub async fn run(self: Arc<Self>, messages: MessageStream) {
        tracing::debug!("connection opened");
        let ticker = tokio::spawn(Arc::clone(&self).keepalive());

        match self.read_loop(messages).await {
            Ok(()) => {}
            Err(error) if error.is_benign() => tracing::debug!(%error, "peer went away"),
            Err(error) => tracing::warn!(%error, "connection failed"),
        }

        self.terminate().await;
        if let Err(error) = ticker.await {
            tracing::error!(%error, "keepalive task failed");
        }
    }

    /// Tears the connection down. Only the first call does anything.
    pub async fn terminate(&self) {
        if self
            .state
            .compare_exchange(
                ConnectionState::Open as u8,
                ConnectionState::Closing as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            return;
        }

        self.token.cancel();
        let cancelled = self.sessions.cancel_all();
        self.writer.close().await;
        self.state
            .store(ConnectionState::Closed as u8, Ordering::Release);
        tracing::debug!(cancelled, "connection closed");
    }

    async fn read_loop(self: &Arc<Self>, mut messages: MessageStream) -> Result<(), TransportError> {
        let read_timeout = self.handler.config().keepalive.read_timeout;
        let mut deadline = Instant::now() + read_timeout;
        let mut context = self.handler.context().with_token(self.token.clone());

        loop {
            let next = tokio::select! {
                biased;
                () = self.token.cancelled() => return Ok(()),
                next = tokio::time::timeout_at(deadline, messages.next()) => next,
            };

            let message = match next {
                Err(_) => return Err(TransportError::ReadTimeout(read_timeout)),
                Ok(None) => return Ok(()),
                Ok(Some(Err(error))) => return Err(TransportError::Read(error)),
                Ok(Some(Ok(message))) => message,
            };

            match message {
                Message::Text(text) => self.dispatch(&text, &mut context).await,
                Message::Binary(_) => self.spawn_write(Frame::protocol_error(&ProtocolError::Binary)),
                // Pings are answered by the codec.
                Message::Ping(_) | Message::Pong(_) => deadline = Instant::now() + read_timeout,
                Message::Close(frame) => {
                    log_close(frame.as_ref());
                    return Ok(());
                }
                Message::Frame(_) => {}
            }
        }
    }

    async fn dispatch(self: &Arc<Self>, text: &str, context: &mut Context) {
        match protocol::decode(text) {
            Ok(Inbound::ConnectionInit { headers }) => {
                *context = self.handler.apply_headers(context.clone(), &headers);
                // Written before the next frame is read, so nothing a later
                // subscribe produces can overtake it.
                if let Err(error) = self.writer.send_frame(&Frame::ack()).await {
                    self.fail(error).await;
                }
            }
            Ok(Inbound::Subscribe { id, reply, payload }) => {
                self.start_session(id, reply, payload, context);
            }
            Ok(Inbound::Stop { id }) => {
                let key = protocol::session_key(&id);
                if self.sessions.cancel(&key) {
                    tracing::debug!(id = %key, "session stopped");
                }
            }
            Err(error) => {
                tracing::debug!(%error, "rejecting frame");
                self.spawn_write(Frame::protocol_error(&error));
            }
        }
    }

    fn start_session(
        self: &Arc<Self>,
        id: Value,
        reply: ReplyKind,
        payload: SubscribePayload,
        context: &Context,
    ) {
        let session = context.child();
        let key = protocol::session_key(&id);
        let handle = self
            .sessions
            .register(key, session.cancellation_token().clone());
        tracing::debug!(id = %handle.id(), "session started");

        let request = payload
            .into_request()
            .root_value(self.root_value.clone())
            .context(session.clone());
        let connection = Arc::clone(self);

        tokio::spawn(async move {
            let mut results = connection.handler.engine().run(request, true);
            loop {
                let response = tokio::select! {
                    biased;
                    () = session.cancelled() => None,
                    response = results.next() => response,
                };
                let Some(response) = response else { break };

                let frame = Frame::result(id.clone(), reply, &response);
                if let Err(error) = connection.writer.send_frame(&frame).await {
                    connection.fail(error).await;
                    break;
                }
            }
            results.close();
            connection.sessions.complete(&handle);
            tracing::debug!(id = %handle.id(), "session finished");
        });
    }

    fn spawn_write(self: &Arc<Self>, frame: Frame) {
        let connection = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(error) = connection.writer.send_frame(&frame).await {
                connection.fail(error).await;
            }
        });
    }

    async fn keepalive(self: Arc<Self>) {
        let period = self.handler.config().keepalive.probe_interval;
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        loop {
            tokio::select! {
                biased;
                () = self.token.cancelled() => return,
                _ = ticker.tick() => {
                    if let Err(error) = self.writer.send(Message::Ping(Vec::new())).await {
                        self.fail(error).await;
                        return;
                    }
                }
            }
        }
    }

    async fn fail(&self, error: TransportError) {
        if self.state() == ConnectionState::Open {
            if error.is_benign() {
                tracing::debug!(%error, "write failed");
            } else {
                tracing::warn!(%error, "write failed");
            }
        }
        self.terminate().await;
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("state", &self.state())
            .field("sessions", &self.sessions)
            .finish_non_exhaustive()
    }
}

fn log_close(frame: Option<&CloseFrame<'_>>) {
    match frame {
        None => tracing::debug!("peer closed without a code"),
        Some(frame) if matches!(frame.code, CloseCode::Away | CloseCode::Abnormal) => {
            tracing::debug!(code = u16::from(frame.code), "peer closed");
        }
        Some(frame) => tracing::warn!(
            code = u16::from(frame.code),
            reason = %frame.reason,
            "unexpected close"
        ),
    }
}

/// Runs the connection protocol over an established websocket.
pub async fn serve_connection<S>(ws: WebSocketStream<S>, handler: Handler)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (connection, messages) = Connection::new(ws, handler);
    connection.run(messages).await;
}
