//! HTTP entry point.
//!
//! Serves one configurable path:
//! - `GET` with `Upgrade: websocket` - the websocket protocol
//! - `POST` with a JSON body - single-result execution
//!
//! plus `GET /health`. Everything else is a JSON 404.

use crate::config::ServerConfig;
use crate::connection::Connection;
use crate::error::ServerError;
use crate::handler::Handler;
use crate::protocol::SubscribePayload;
use bytes::Bytes;
use ferrogql_core::FormattedError;
use ferrogql_runtime::Response as GraphqlResponse;
use http_body_util::{BodyExt, Full, Limited};
use hyper::body::Incoming;
use hyper::header::{self, HeaderMap, HeaderValue};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::handshake::derive_accept_key;
use tokio_tungstenite::tungstenite::protocol::Role;
use tokio_tungstenite::WebSocketStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Websocket sub-protocols accepted, in preference order.
pub const SUBPROTOCOLS: [&str; 2] = ["graphql-transport-ws", "graphql-ws"];

type BoxBody = http_body_util::combinators::BoxBody<Bytes, hyper::Error>;

fn full<T: Into<Bytes>>(chunk: T) -> BoxBody {
    Full::new(chunk.into())
        .map_err(|never| match never {})
        .boxed()
}

fn json_response(status: StatusCode, body: impl Into<Bytes>) -> Response<BoxBody> {
    let mut response = Response::new(full(body));
    *response.status_mut() = status;
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/json"),
    );
    response
}

fn error_response(status: StatusCode, message: &str) -> Response<BoxBody> {
    let body = GraphqlResponse::from_errors(vec![FormattedError::new(message)]);
    json_response(status, body.to_json().to_string())
}

fn health_response() -> &'static str {
    r#"{"status":"healthy"}"#
}

/// Binds the listener the config describes.
pub async fn bind(config: &ServerConfig) -> Result<TcpListener, ServerError> {
    let addr = config.socket_addr()?;
    TcpListener::bind(addr)
        .await
        .map_err(|source| ServerError::Bind { addr, source })
}

/// Accepts connections until `shutdown` is cancelled.
///
/// Shutdown also cancels every open websocket connection.
pub async fn serve(
    listener: TcpListener,
    handler: Handler,
    shutdown: CancellationToken,
) -> Result<(), ServerError> {
    let base = handler.context().child();
    let handler = handler.with_context(base.clone());

    if let Ok(addr) = listener.local_addr() {
        info!("Listening on http://{}{}", addr, handler.config().path);
    }

    loop {
        let (stream, peer) = tokio::select! {
            biased;
            () = shutdown.cancelled() => {
                info!("shutting down");
                base.cancel();
                return Ok(());
            }
            accepted = listener.accept() => accepted.map_err(ServerError::Accept)?,
        };

        let handler = handler.clone();
        tokio::spawn(async move {
            let service = service_fn(move |req: Request<Incoming>| {
                let handler = handler.clone();
                async move { Ok::<_, Infallible>(route(req, handler).await) }
            });
            if let Err(error) = http1::Builder::new()
                .serve_connection(TokioIo::new(stream), service)
                .with_upgrades()
                .await
            {
                debug!(%peer, %error, "http connection ended with error");
            }
        });
    }
}

async fn route(req: Request<Incoming>, handler: Handler) -> Response<BoxBody> {
    let config = handler.config();
    let path = req.uri().path();

    if path == "/health" && req.method() == Method::GET {
        return json_response(StatusCode::OK, health_response());
    }
    if path != config.path {
        return json_response(StatusCode::NOT_FOUND, r#"{"error":"Not Found"}"#);
    }

    let method = req.method().clone();
    match method {
        Method::GET if is_websocket_upgrade(req.headers()) => {
            if config.websocket {
                upgrade(req, handler)
            } else {
                error_response(StatusCode::BAD_REQUEST, "websocket transport is disabled")
            }
        }
        Method::POST => execute_post(req, &handler).await,
        _ => error_response(
            StatusCode::METHOD_NOT_ALLOWED,
            "expected a POST request or a websocket upgrade",
        ),
    }
}

fn header_contains(headers: &HeaderMap, name: header::HeaderName, token: &str) -> bool {
    headers
        .get_all(name)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .any(|part| part.trim().eq_ignore_ascii_case(token))
}

fn is_websocket_upgrade(headers: &HeaderMap) -> bool {
    header_contains(headers, header::UPGRADE, "websocket")
        && headers.contains_key(header::SEC_WEBSOCKET_KEY)
}

/// Picks the sub-protocol to answer with.
///
/// `Ok(None)` when the client offered none; `Err` when it offered only
/// protocols this server does not speak.
fn negotiate_subprotocol(headers: &HeaderMap) -> Result<Option<&'static str>, ()> {
    let offered: Vec<&str> = headers
        .get_all(header::SEC_WEBSOCKET_PROTOCOL)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .collect();

    if offered.is_empty() {
        return Ok(None);
    }
    SUBPROTOCOLS
        .iter()
        .find(|supported| offered.contains(*supported))
        .map(|p| Some(*p))
        .ok_or(())
}

fn upgrade(mut req: Request<Incoming>, handler: Handler) -> Response<BoxBody> {
    let Some(key) = req.headers().get(header::SEC_WEBSOCKET_KEY) else {
        return error_response(StatusCode::BAD_REQUEST, "missing Sec-WebSocket-Key");
    };
    let Ok(accept) = HeaderValue::from_str(&derive_accept_key(key.as_bytes())) else {
        return error_response(StatusCode::BAD_REQUEST, "invalid Sec-WebSocket-Key");
    };
    let Ok(subprotocol) = negotiate_subprotocol(req.headers()) else {
        return error_response(StatusCode::BAD_REQUEST, "unsupported websocket sub-protocol");
    };

    let root_value = handler.root_value_for(req.headers());
    let ws_config = handler.config().websocket_config();
    let on_upgrade = hyper::upgrade::on(&mut req);

    tokio::spawn(async move {
        match on_upgrade.await {
            Ok(upgraded) => {
                let ws = WebSocketStream::from_raw_socket(
                    TokioIo::new(upgraded),
                    Role::Server,
                    Some(ws_config),
                )
                .await;
                let (connection, messages) = Connection::with_root_value(ws, handler, root_value);
                connection.run(messages).await;
            }
            Err(error) => warn!(%error, "websocket upgrade failed"),
        }
    });

    let mut response = Response::new(full(Bytes::new()));
    *response.status_mut() = StatusCode::SWITCHING_PROTOCOLS;
    let headers = response.headers_mut();
    headers.insert(header::CONNECTION, HeaderValue::from_static("Upgrade"));
    headers.insert(header::UPGRADE, HeaderValue::from_static("websocket"));
    headers.insert(header::SEC_WEBSOCKET_ACCEPT, accept);
    if let Some(protocol) = subprotocol {
        headers.insert(
            header::SEC_WEBSOCKET_PROTOCOL,
            HeaderValue::from_static(protocol),
        );
    }
    response
}

async fn execute_post(req: Request<Incoming>, handler: &Handler) -> Response<BoxBody> {
    let is_json = req
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.starts_with("application/json"));
    if !is_json {
        return error_response(
            StatusCode::UNSUPPORTED_MEDIA_TYPE,
            "expected an application/json body",
        );
    }

    let (parts, body) = req.into_parts();
    let body = match Limited::new(body, handler.config().max_frame_size).collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(error) => {
            debug!(%error, "failed to read request body");
            return error_response(StatusCode::PAYLOAD_TOO_LARGE, "request body too large");
        }
    };

    let payload: SubscribePayload = match serde_json::from_slice(&body) {
        Ok(payload) => payload,
        Err(error) => {
            return error_response(StatusCode::BAD_REQUEST, &format!("Invalid JSON: {error}"));
        }
    };

    let context = handler.context().child();
    let request = payload
        .into_request()
        .root_value(handler.root_value_for(&parts.headers))
        .context(context.clone());
    let hook = handler.result_hook();
    let observed = hook.map(|_| request.clone());
    let response = handler.engine().execute(request).await;

    let encoded = if handler.config().pretty {
        serde_json::to_vec_pretty(&response)
    } else {
        serde_json::to_vec(&response)
    };
    match encoded {
        Ok(bytes) => {
            if let (Some(hook), Some(request)) = (hook, &observed) {
                hook(&context, request, &response, &bytes);
            }
            json_response(StatusCode::OK, bytes)
        }
        Err(error) => error_response(StatusCode::INTERNAL_SERVER_ERROR, &error.to_string()),
    }
}
