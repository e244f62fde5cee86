//! Command-line interface for ferrogql.
//!
//! # Usage
//!
//! ```bash
//! # Serve the demo schema over HTTP and websockets
//! ferrogql serve --port 4000
//!
//! # Run one request against the demo schema
//! ferrogql exec '{ hello }'
//! ```

use clap::{Args, Parser, Subcommand};
use ferrogql_runtime::{
    Engine, EventStream, FieldDef, InputValueDef, ObjectDef, Request, ResolverError,
    SchemaBuilder, TypeRef,
};
use ferrogql_server::{http, Handler, KeepaliveConfig, PubSub, ServerConfig, ServerError};
use futures::StreamExt;
use serde_json::json;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Topic the demo `send` mutation publishes to.
pub const MESSAGES_TOPIC: &str = "messages";

#[derive(Parser, Debug)]
#[command(name = "ferrogql")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[arg(short, long, global = true)]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Commands,
}

impl Cli {
    /// The log filter used when `RUST_LOG` is unset.
    pub fn default_filter(&self) -> &'static str {
        if self.quiet {
            "ferrogql=warn"
        } else if self.verbose {
            "ferrogql=debug"
        } else {
            "ferrogql=info"
        }
    }
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Serve the demo schema
    Serve(ServeArgs),

    /// Execute one request against the demo schema and print the result
    Exec {
        /// Query text
        query: String,

        /// Variables as a JSON object
        #[arg(long)]
        variables: Option<String>,

        /// Operation to run when the document holds several
        #[arg(long)]
        operation: Option<String>,
    },
}

#[derive(Args, Debug, Clone)]
pub struct ServeArgs {
    /// Host to bind to
    #[arg(long, default_value = "127.0.0.1")]
    pub host: String,

    /// Port to listen on
    #[arg(short, long, default_value = "4000")]
    pub port: u16,

    /// Seconds without a ping or pong before a websocket is dropped
    #[arg(long, default_value = "60")]
    pub read_timeout_secs: u64,

    /// Seconds between websocket pings
    #[arg(long, default_value = "30")]
    pub probe_interval_secs: u64,

    /// Largest inbound message in bytes
    #[arg(long, default_value = "512000")]
    pub max_frame_size: usize,

    /// Disable the websocket transport
    #[arg(long)]
    pub no_websocket: bool,

    /// Pretty-print HTTP responses
    #[arg(long)]
    pub pretty: bool,
}

impl ServeArgs {
    pub fn server_config(&self) -> ServerConfig {
        ServerConfig::new()
            .host(self.host.clone())
            .port(self.port)
            .keepalive(KeepaliveConfig::new(
                Duration::from_secs(self.read_timeout_secs),
                Duration::from_secs(self.probe_interval_secs),
            ))
            .max_frame_size(self.max_frame_size)
            .websocket(!self.no_websocket)
            .pretty(self.pretty)
    }
}

/// CLI failures.
#[derive(Debug, thiserror::Error)]
pub enum CliError {
    #[error(transparent)]
    Server(#[from] ServerError),

    #[error("invalid variables: {0}")]
    Variables(#[source] serde_json::Error),

    #[error("failed to encode response: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("failed to listen for shutdown signal: {0}")]
    Signal(#[source] std::io::Error),

    #[error("server task failed: {0}")]
    Task(#[source] tokio::task::JoinError),
}

/// Builds the demo schema.
///
/// `hello` answers a greeting, `send` publishes to the `messages`
/// subscription, and `counter` ticks once per `intervalMs` up to `limit`.
pub fn demo_engine(pubsub: &PubSub) -> Engine {
    let publisher = pubsub.clone();
    let subscriber = pubsub.clone();

    let schema = SchemaBuilder::new()
        .query_type("Query")
        .mutation_type("Mutation")
        .subscription_type("Subscription")
        .object(
            ObjectDef::new("Query").field(
                FieldDef::new("hello", TypeRef::named_non_null("String")).argument(
                    InputValueDef::new("name", TypeRef::named("String"))
                        .default_value(json!("world")),
                ),
            ),
        )
        .object(
            ObjectDef::new("Mutation").field(
                FieldDef::new("send", TypeRef::named_non_null("Int"))
                    .description("Publishes a message; returns how many subscribers got it")
                    .argument(InputValueDef::new("text", TypeRef::named_non_null("String"))),
            ),
        )
        .object(
            ObjectDef::new("Subscription")
                .field(
                    FieldDef::new("counter", TypeRef::named_non_null("Int"))
                        .argument(
                            InputValueDef::new("limit", TypeRef::named("Int"))
                                .default_value(json!(10)),
                        )
                        .argument(
                            InputValueDef::new("intervalMs", TypeRef::named("Int"))
                                .default_value(json!(1000)),
                        ),
                )
                .field(FieldDef::new("messages", TypeRef::named_non_null("String"))),
        )
        .resolver_fn("Query", "hello", |_, args, _, _| {
            let name: String = args.require("name")?;
            Ok(json!(format!("hello, {name}")))
        })
        .resolver_async("Mutation", "send", move |_, args, _, _| {
            let pubsub = publisher.clone();
            async move {
                let text: String = args.require("text")?;
                let delivered = pubsub.publish(MESSAGES_TOPIC, json!(text)).await;
                Ok(json!(delivered))
            }
        })
        .subscription_fn("Subscription", "counter", |_, args, _, _| async move {
            let limit: u64 = args.require("limit")?;
            let interval: u64 = args.require("intervalMs")?;
            let period = Duration::from_millis(interval.max(1));
            let ticks = futures::stream::iter(1..=limit).then(move |n| async move {
                tokio::time::sleep(period).await;
                Ok::<_, ResolverError>(json!(n))
            });
            Ok::<EventStream, ResolverError>(ticks.boxed())
        })
        .subscription_fn("Subscription", "messages", move |_, _, _, _| {
            let pubsub = subscriber.clone();
            async move {
                Ok::<EventStream, ResolverError>(pubsub.subscribe_stream(MESSAGES_TOPIC).await)
            }
        })
        .build();
    Engine::new(schema)
}

/// Runs a parsed command line.
pub async fn run(cli: Cli) -> Result<(), CliError> {
    match cli.command {
        Commands::Serve(args) => serve(&args).await,
        Commands::Exec {
            query,
            variables,
            operation,
        } => {
            let response = exec(&query, variables.as_deref(), operation).await?;
            println!("{}", serde_json::to_string_pretty(&response).map_err(CliError::Encode)?);
            Ok(())
        }
    }
}

async fn serve(args: &ServeArgs) -> Result<(), CliError> {
    let config = args.server_config();
    config.validate()?;

    let pubsub = PubSub::new();
    let listener = http::bind(&config).await?;
    let handler = Handler::new(demo_engine(&pubsub), config)?;

    let shutdown = CancellationToken::new();
    let mut server = tokio::spawn(http::serve(listener, handler, shutdown.clone()));

    tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal.map_err(CliError::Signal)?;
            tracing::info!("received ctrl-c");
            shutdown.cancel();
        }
        joined = &mut server => return flatten(joined),
    }
    flatten(server.await)
}

fn flatten(joined: Result<Result<(), ServerError>, tokio::task::JoinError>) -> Result<(), CliError> {
    match joined {
        Ok(result) => result.map_err(CliError::from),
        Err(error) => Err(CliError::Task(error)),
    }
}

/// Executes one request against a fresh demo engine.
pub async fn exec(
    query: &str,
    variables: Option<&str>,
    operation: Option<String>,
) -> Result<ferrogql_runtime::Response, CliError> {
    let mut request = Request::new(query);
    if let Some(variables) = variables {
        request = request.variables(serde_json::from_str(variables).map_err(CliError::Variables)?);
    }
    if let Some(operation) = operation {
        request = request.operation_name(operation);
    }
    Ok(demo_engine(&PubSub::new()).execute(request).await)
}
