//! Websocket protocol tests over an in-memory duplex stream

use ferrogql_runtime::{
    Engine, EventStream, FieldDef, InputValueDef, ObjectDef, ResolverError, SchemaBuilder, TypeRef,
};
use ferrogql_server::{Connection, ConnectionState, Handler, KeepaliveConfig, PubSub, ServerConfig};
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::DuplexStream;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::{Role, WebSocketConfig};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

type Client = WebSocketStream<DuplexStream>;

fn engine(pubsub: &PubSub) -> Engine {
    let pubsub = pubsub.clone();
    let schema = SchemaBuilder::new()
        .query_type("Query")
        .subscription_type("Subscription")
        .object(
            ObjectDef::new("Query")
                .field(FieldDef::new("hello", TypeRef::named("String")))
                .field(FieldDef::new("whoami", TypeRef::named("String"))),
        )
        .object(
            ObjectDef::new("Subscription")
                .field(FieldDef::new("counter", TypeRef::named_non_null("Int")))
                .field(
                    FieldDef::new("messages", TypeRef::named("String")).argument(
                        InputValueDef::new("topic", TypeRef::named("String"))
                            .default_value(json!("messages")),
                    ),
                ),
        )
        .resolver_fn("Query", "hello", |_, _, _, _| Ok(json!("world")))
        .resolver_fn("Query", "whoami", |_, _, ctx, _| {
            Ok(json!(ctx.header("authorization")))
        })
        .subscription_fn("Subscription", "counter", |_, _, _, _| async {
            let events = futures::stream::iter([1, 2, 3]).map(|n| Ok(json!(n)));
            Ok::<EventStream, ResolverError>(events.boxed())
        })
        .subscription_fn("Subscription", "messages", move |_, args, _, _| {
            let pubsub = pubsub.clone();
            async move {
                let topic: String = args.require("topic")?;
                Ok::<EventStream, ResolverError>(pubsub.subscribe_stream(topic).await)
            }
        })
        .build();
    Engine::new(schema)
}

fn handler(pubsub: &PubSub, config: ServerConfig) -> Handler {
    Handler::new(engine(pubsub), config).unwrap()
}

async fn connect(handler: Handler) -> (Client, Arc<Connection>, JoinHandle<()>) {
    connect_with(handler, None).await
}

async fn connect_with(
    handler: Handler,
    server_config: Option<WebSocketConfig>,
) -> (Client, Arc<Connection>, JoinHandle<()>) {
    let (client_io, server_io) = tokio::io::duplex(64 * 1024);
    let server = WebSocketStream::from_raw_socket(server_io, Role::Server, server_config).await;
    let client = WebSocketStream::from_raw_socket(client_io, Role::Client, None).await;

    let (connection, messages) = Connection::new(server, handler);
    let task = tokio::spawn(Arc::clone(&connection).run(messages));
    (client, connection, task)
}

async fn send(client: &mut Client, frame: Value) {
    client.send(Message::Text(frame.to_string())).await.unwrap();
}

async fn recv(client: &mut Client) -> Value {
    loop {
        let message = tokio::time::timeout(Duration::from_secs(2), client.next())
            .await
            .expect("timed out waiting for a frame")
            .expect("connection ended")
            .unwrap();
        match message {
            Message::Text(text) => return serde_json::from_str(&text).unwrap(),
            Message::Ping(_) | Message::Pong(_) => continue,
            other => panic!("unexpected message: {other:?}"),
        }
    }
}

async fn assert_silent(client: &mut Client, window: Duration) {
    if let Ok(Some(Ok(Message::Text(text)))) = tokio::time::timeout(window, client.next()).await {
        panic!("unexpected frame: {text}");
    }
}

async fn eventually<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    tokio::time::timeout(Duration::from_secs(2), async {
        while !check().await {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition never held");
}

#[tokio::test]
async fn test_connection_init_is_acked() {
    let pubsub = PubSub::new();
    let (mut client, _, _) = connect(handler(&pubsub, ServerConfig::new())).await;

    send(&mut client, json!({"type": "connection_init"})).await;
    assert_eq!(recv(&mut client).await, json!({"type": "connection_ack"}));
}

#[tokio::test]
async fn test_query_yields_single_data_frame() {
    let pubsub = PubSub::new();
    let (mut client, connection, _) = connect(handler(&pubsub, ServerConfig::new())).await;

    send(
        &mut client,
        json!({"id": "1", "type": "start", "payload": {"query": "{ hello }"}}),
    )
    .await;
    assert_eq!(
        recv(&mut client).await,
        json!({"id": "1", "type": "data", "payload": {"data": {"hello": "world"}}})
    );

    assert_silent(&mut client, Duration::from_millis(100)).await;
    eventually(|| {
        let connection = Arc::clone(&connection);
        async move { connection.sessions().is_empty() }
    })
    .await;
}

#[tokio::test]
async fn test_subscription_events_arrive_in_order() {
    let pubsub = PubSub::new();
    let (mut client, _, _) = connect(handler(&pubsub, ServerConfig::new())).await;

    send(
        &mut client,
        json!({"id": "c", "type": "subscribe", "payload": {"query": "subscription { counter }"}}),
    )
    .await;
    for n in 1..=3 {
        assert_eq!(
            recv(&mut client).await,
            json!({"id": "c", "type": "next", "payload": {"data": {"counter": n}}})
        );
    }
}

#[tokio::test]
async fn test_stop_ends_subscription() {
    let pubsub = PubSub::new();
    let (mut client, connection, _) = connect(handler(&pubsub, ServerConfig::new())).await;

    send(
        &mut client,
        json!({"id": "2", "type": "start", "payload": {"query": "subscription { messages }"}}),
    )
    .await;
    eventually(|| {
        let pubsub = pubsub.clone();
        async move { pubsub.has_subscribers("messages").await }
    })
    .await;

    pubsub.publish("messages", json!("first")).await;
    assert_eq!(
        recv(&mut client).await,
        json!({"id": "2", "type": "data", "payload": {"data": {"messages": "first"}}})
    );

    send(&mut client, json!({"id": "2", "type": "stop"})).await;
    eventually(|| {
        let pubsub = pubsub.clone();
        let connection = Arc::clone(&connection);
        async move { !connection.sessions().contains("2") && pubsub.topic_count().await == 0 }
    })
    .await;

    assert_eq!(pubsub.publish("messages", json!("second")).await, 0);
    assert_silent(&mut client, Duration::from_millis(100)).await;
}

#[tokio::test]
async fn test_malformed_frame_keeps_connection_open() {
    let pubsub = PubSub::new();
    let (mut client, connection, _) = connect(handler(&pubsub, ServerConfig::new())).await;

    client.send(Message::Text("{not json".into())).await.unwrap();
    let frame = recv(&mut client).await;
    assert_eq!(frame["type"], "error");
    assert!(frame["payload"].is_string());

    send(&mut client, json!({"type": "connection_init"})).await;
    assert_eq!(recv(&mut client).await, json!({"type": "connection_ack"}));
    assert_eq!(connection.state(), ConnectionState::Open);
}

#[tokio::test]
async fn test_protocol_errors_echo_id() {
    let pubsub = PubSub::new();
    let (mut client, _, _) = connect(handler(&pubsub, ServerConfig::new())).await;

    send(&mut client, json!({"id": "9", "type": "start", "payload": {}})).await;
    let frame = recv(&mut client).await;
    assert_eq!(frame["type"], "error");
    assert_eq!(frame["id"], "9");

    send(&mut client, json!({"id": "10", "type": "bogus"})).await;
    let frame = recv(&mut client).await;
    assert_eq!(frame["id"], "10");
    assert_eq!(frame["payload"], "unknown message type \"bogus\"");

    client.send(Message::Binary(vec![1, 2, 3])).await.unwrap();
    let frame = recv(&mut client).await;
    assert_eq!(frame["payload"], "binary messages are not supported");
}

#[tokio::test]
async fn test_stop_for_unknown_id_is_noop() {
    let pubsub = PubSub::new();
    let (mut client, connection, _) = connect(handler(&pubsub, ServerConfig::new())).await;

    send(&mut client, json!({"id": "nope", "type": "stop"})).await;
    send(&mut client, json!({"type": "connection_init"})).await;
    assert_eq!(recv(&mut client).await, json!({"type": "connection_ack"}));
    assert_eq!(connection.state(), ConnectionState::Open);
}

#[tokio::test]
async fn test_connection_init_headers_reach_resolvers() {
    let pubsub = PubSub::new();
    let (mut client, _, _) = connect(handler(&pubsub, ServerConfig::new())).await;

    send(
        &mut client,
        json!({"type": "connection_init", "payload": {"Authorization": "Bearer t"}}),
    )
    .await;
    send(
        &mut client,
        json!({"id": "w", "type": "subscribe", "payload": {"query": "{ whoami }"}}),
    )
    .await;

    assert_eq!(recv(&mut client).await, json!({"type": "connection_ack"}));
    assert_eq!(
        recv(&mut client).await,
        json!({"id": "w", "type": "next", "payload": {"data": {"whoami": "Bearer t"}}})
    );
}

#[tokio::test]
async fn test_ack_precedes_results_of_later_frames() {
    let pubsub = PubSub::new();
    let (mut client, _, _) = connect(handler(&pubsub, ServerConfig::new())).await;

    for round in 0..20 {
        send(&mut client, json!({"type": "connection_init"})).await;
        send(
            &mut client,
            json!({"id": round.to_string(), "type": "subscribe", "payload": {"query": "{ hello }"}}),
        )
        .await;
        assert_eq!(recv(&mut client).await, json!({"type": "connection_ack"}));
        assert_eq!(recv(&mut client).await["type"], "next");
    }
}

#[tokio::test]
async fn test_oversized_frame_ends_connection() {
    let pubsub = PubSub::new();
    let config = ServerConfig::new().max_frame_size(1024);
    let ws_config = config.websocket_config();
    let (mut client, connection, task) =
        connect_with(handler(&pubsub, config), Some(ws_config)).await;

    send(
        &mut client,
        json!({"id": "s", "type": "subscribe", "payload": {"query": "subscription { messages }"}}),
    )
    .await;
    eventually(|| {
        let pubsub = pubsub.clone();
        async move { pubsub.has_subscribers("messages").await }
    })
    .await;

    let padding = "x".repeat(2048);
    let frame = json!({"id": "big", "type": "subscribe", "payload": {"query": padding}});
    let _ = client.send(Message::Text(frame.to_string())).await;

    tokio::time::timeout(Duration::from_secs(2), task)
        .await
        .expect("oversized frame did not end the connection")
        .unwrap();
    assert_eq!(connection.state(), ConnectionState::Closed);
    assert!(connection.sessions().is_empty());
    eventually(|| {
        let pubsub = pubsub.clone();
        async move { !pubsub.has_subscribers("messages").await }
    })
    .await;
}

#[tokio::test]
async fn test_deeply_nested_query_is_rejected_without_closing() {
    let pubsub = PubSub::new();
    let (mut client, connection, _) = connect(handler(&pubsub, ServerConfig::new())).await;

    // Well under the frame limit, far past the nesting limit.
    let query = format!("{}{}", "{ a ".repeat(60_000), "}".repeat(60_000));
    send(
        &mut client,
        json!({"id": "deep", "type": "start", "payload": {"query": query}}),
    )
    .await;

    let frame = recv(&mut client).await;
    assert_eq!(frame["id"], "deep");
    assert_eq!(frame["type"], "data");
    assert!(frame["payload"].get("data").is_none());
    assert_eq!(
        frame["payload"]["errors"][0]["extensions"]["code"],
        "GRAPHQL_PARSE_FAILED"
    );
    assert_eq!(connection.state(), ConnectionState::Open);

    send(
        &mut client,
        json!({"id": "ok", "type": "start", "payload": {"query": "{ hello }"}}),
    )
    .await;
    assert_eq!(
        recv(&mut client).await,
        json!({"id": "ok", "type": "data", "payload": {"data": {"hello": "world"}}})
    );
}

#[tokio::test]
async fn test_duplicate_id_replaces_prior_session() {
    let pubsub = PubSub::new();
    let (mut client, connection, _) = connect(handler(&pubsub, ServerConfig::new())).await;

    let subscribe = |topic: &str| {
        json!({
            "id": "dup",
            "type": "subscribe",
            "payload": {
                "query": "subscription M($t: String) { messages(topic: $t) }",
                "variables": {"t": topic}
            }
        })
    };

    send(&mut client, subscribe("a")).await;
    eventually(|| {
        let pubsub = pubsub.clone();
        async move { pubsub.has_subscribers("a").await }
    })
    .await;

    send(&mut client, subscribe("b")).await;
    eventually(|| {
        let pubsub = pubsub.clone();
        async move { !pubsub.has_subscribers("a").await && pubsub.has_subscribers("b").await }
    })
    .await;
    assert_eq!(connection.sessions().len(), 1);

    assert_eq!(pubsub.publish("a", json!("stale")).await, 0);
    assert_eq!(pubsub.publish("b", json!("fresh")).await, 1);
    assert_eq!(
        recv(&mut client).await,
        json!({"id": "dup", "type": "next", "payload": {"data": {"messages": "fresh"}}})
    );
}

#[tokio::test]
async fn test_teardown_cancels_every_session() {
    let pubsub = PubSub::new();
    let (mut client, connection, task) = connect(handler(&pubsub, ServerConfig::new())).await;

    for (id, topic) in [("1", "x"), ("2", "y")] {
        send(
            &mut client,
            json!({
                "id": id,
                "type": "subscribe",
                "payload": {
                    "query": "subscription M($t: String) { messages(topic: $t) }",
                    "variables": {"t": topic}
                }
            }),
        )
        .await;
    }
    eventually(|| {
        let pubsub = pubsub.clone();
        async move { pubsub.has_subscribers("x").await && pubsub.has_subscribers("y").await }
    })
    .await;
    assert_eq!(connection.sessions().len(), 2);

    client.close(None).await.unwrap();
    tokio::time::timeout(Duration::from_secs(2), task)
        .await
        .expect("connection did not shut down")
        .unwrap();

    assert_eq!(connection.state(), ConnectionState::Closed);
    assert!(connection.sessions().is_empty());
    eventually(|| {
        let pubsub = pubsub.clone();
        async move { pubsub.topic_count().await == 0 }
    })
    .await;
}

#[tokio::test]
async fn test_terminate_is_idempotent() {
    let pubsub = PubSub::new();
    let (mut client, connection, task) = connect(handler(&pubsub, ServerConfig::new())).await;

    tokio::join!(connection.terminate(), connection.terminate());
    tokio::time::timeout(Duration::from_secs(2), task)
        .await
        .expect("connection did not shut down")
        .unwrap();
    assert_eq!(connection.state(), ConnectionState::Closed);
    assert!(connection.cancellation_token().is_cancelled());

    // The peer sees the socket close.
    let next = tokio::time::timeout(Duration::from_secs(2), client.next())
        .await
        .expect("peer never saw the close");
    assert!(matches!(next, None | Some(Ok(Message::Close(_)) | Err(_))));
}

#[tokio::test(start_paused = true)]
async fn test_silent_peer_times_out() {
    let pubsub = PubSub::new();
    let config = ServerConfig::new().keepalive(KeepaliveConfig::new(
        Duration::from_secs(2),
        Duration::from_secs(1),
    ));
    let (_client, connection, task) = connect(handler(&pubsub, config)).await;

    // The client never reads, so server pings go unanswered.
    tokio::time::timeout(Duration::from_secs(10), task)
        .await
        .expect("silent peer was not dropped")
        .unwrap();
    assert_eq!(connection.state(), ConnectionState::Closed);
}

#[tokio::test(start_paused = true)]
async fn test_responsive_peer_stays_connected() {
    let pubsub = PubSub::new();
    let config = ServerConfig::new().keepalive(KeepaliveConfig::new(
        Duration::from_secs(2),
        Duration::from_secs(1),
    ));
    let (mut client, connection, _) = connect(handler(&pubsub, config)).await;

    // Reading lets the client codec answer every ping with a pong.
    let mut pings = 0;
    let _ = tokio::time::timeout(Duration::from_secs(10), async {
        while let Some(Ok(message)) = client.next().await {
            if message.is_ping() {
                pings += 1;
            }
        }
    })
    .await;

    assert!(pings >= 5);
    assert_eq!(connection.state(), ConnectionState::Open);
}
