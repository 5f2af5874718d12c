//! CLI for broke
//!
//! Subcommands:
//! - `server` (default): run the broker
//! - `publish`: publish one payload and wait for its ACK
//! - `subscribe`: print payloads delivered on a topic

use std::path::PathBuf;
use std::sync::Arc;

use broke::broker::Broker;
use broke::config::{Settings, load_config, load_config_from};
use broke::transport::{BrokeCodec, Message, MessageKind, start_server};
use broke::utils::logging;
use clap::{Parser, Subcommand};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

type BoxError = Box<dyn std::error::Error>;

#[derive(Parser)]
#[command(name = "broke", version, about = "Minimal publish/subscribe broker")]
struct Cli {
    /// Configuration file (defaults to config/default.*)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Start the broker
    Server,
    /// Publish one payload
    Publish {
        #[arg(long, default_value = "127.0.0.1:1883")]
        addr: String,
        topic: String,
        payload: String,
    },
    /// Subscribe to a topic and print what arrives
    Subscribe {
        #[arg(long, default_value = "127.0.0.1:1883")]
        addr: String,
        topic: String,
        /// Exit after this many deliveries
        #[arg(long)]
        count: Option<usize>,
    },
}

fn main() -> Result<(), BoxError> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let settings = match &cli.config {
        Some(path) => load_config_from(path)?,
        None => load_config()?,
    };
    logging::init(&settings.server.log_level);

    let mut runtime = tokio::runtime::Builder::new_multi_thread();
    runtime.enable_all();
    if settings.server.worker_threads > 0 {
        runtime.worker_threads(settings.server.worker_threads);
    }
    let runtime = runtime.build()?;

    runtime.block_on(async move {
        match cli.command.unwrap_or(Command::Server) {
            Command::Server => run_server(settings).await,
            Command::Publish {
                addr,
                topic,
                payload,
            } => run_publish(&addr, topic, payload).await,
            Command::Subscribe { addr, topic, count } => run_subscribe(&addr, topic, count).await,
        }
    })
}

async fn run_server(settings: Settings) -> Result<(), BoxError> {
    let broker = Arc::new(Broker::new());
    let shutdown = CancellationToken::new();

    let server = start_server(settings, broker, shutdown.clone());
    tokio::pin!(server);

    tokio::select! {
        res = &mut server => {
            res?;
            error!("Server exited unexpectedly.");
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received. Exiting gracefully.");
            shutdown.cancel();
            server.await?;
        }
    }

    Ok(())
}

async fn run_publish(addr: &str, topic: String, payload: String) -> Result<(), BoxError> {
    let stream = TcpStream::connect(addr).await?;
    let mut framed = Framed::new(stream, BrokeCodec::new());

    framed.send(Message::publish(topic, payload)).await?;
    match framed.next().await {
        Some(Ok(Message::Ack {
            kind: MessageKind::Publish,
            topic,
        })) => println!("published to {topic}"),
        other => return Err(format!("unexpected reply: {other:?}").into()),
    }

    framed.send(Message::Disconnect).await?;
    Ok(())
}

async fn run_subscribe(addr: &str, topic: String, count: Option<usize>) -> Result<(), BoxError> {
    let stream = TcpStream::connect(addr).await?;
    let mut framed = Framed::new(stream, BrokeCodec::new());

    framed.send(Message::Subscribe { topic }).await?;

    let mut received = 0;
    while let Some(frame) = framed.next().await {
        match frame? {
            Message::Ack {
                kind: MessageKind::Subscribe,
                topic,
            } => println!("subscribed to {topic}"),
            Message::Publish { topic, payload } => {
                println!("{topic}: {}", String::from_utf8_lossy(&payload));
                received += 1;
                if count.is_some_and(|limit| received >= limit) {
                    break;
                }
            }
            other => println!("unexpected frame: {other:?}"),
        }
    }

    // The broker may already have closed the connection.
    let _ = framed.send(Message::Disconnect).await;
    Ok(())
}
