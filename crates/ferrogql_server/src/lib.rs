//! Transport for ferrogql.
//!
//! Serves an [`Engine`](ferrogql_runtime::Engine) over HTTP and over
//! websockets speaking the `graphql-ws` / `graphql-transport-ws` framing.
//!
//! ```no_run
//! use ferrogql_runtime::{Engine, SchemaBuilder};
//! use ferrogql_server::{http, Handler, ServerConfig};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn run() -> Result<(), ferrogql_server::ServerError> {
//! let engine = Engine::new(SchemaBuilder::new().build());
//! let config = ServerConfig::new().port(4000);
//! let listener = http::bind(&config).await?;
//! let handler = Handler::new(engine, config)?;
//! http::serve(listener, handler, CancellationToken::new()).await
//! # }
//! ```

pub mod config;
pub mod connection;
pub mod error;
pub mod handler;
pub mod http;
pub mod protocol;
pub mod pubsub;
pub mod session;

pub use config::{KeepaliveConfig, ServerConfig};
pub use connection::{serve_connection, Connection, ConnectionState, FrameWriter, MessageStream};
pub use error::{ProtocolError, ServerError, TransportError};
pub use handler::{Handler, HeadersFn, ResultFn, RootValueFn};
pub use protocol::{Frame, Inbound, ReplyKind, SubscribePayload};
pub use pubsub::PubSub;
pub use session::{SessionHandle, SessionRegistry};
