//! CLI for tidemq
//!
//! Subcommands:
//! - `server`: run the broker and its WebSocket listener until Ctrl-C
//! - `client`: run a short smoke-test session against a running server

use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tidemq::broker::Broker;
use tidemq::config::{Settings, load_config};
use tidemq::transport::websocket::start_websocket_server;
use tidemq::utils::logging;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "tidemq", version)]
enum Command {
    /// Start the broker
    Server,
    /// Run the smoke-test client (hello, subscribe, publish, acknowledge)
    Client {
        /// WebSocket URL of the JSON endpoint
        #[arg(long, default_value = "ws://127.0.0.1:8080/ws/json")]
        url: String,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let _ = dotenvy::dotenv();
    let cmd = Command::parse();

    match cmd {
        Command::Server => {
            let config = match load_config() {
                Ok(config) => config,
                Err(e) => {
                    logging::init("info");
                    error!("Failed to load configuration: {}", e);
                    return ExitCode::FAILURE;
                }
            };
            logging::init(&config.log.level);
            if let Err(e) = run_server(config).await {
                error!("Server failed: {}", e);
                return ExitCode::FAILURE;
            }
        }
        Command::Client { url } => {
            logging::init("info");
            if let Err(e) = run_client(&url).await {
                error!("Client failed: {}", e);
                return ExitCode::FAILURE;
            }
        }
    }
    ExitCode::SUCCESS
}

async fn run_server(config: Settings) -> Result<(), Box<dyn std::error::Error>> {
    let addr = format!("{}:{}", config.server.host, config.server.port);
    let broker = Arc::new(Broker::new(config.broker.clone()));
    let shutdown = CancellationToken::new();

    let expiry = broker.clone().start_expiry_loop(shutdown.clone());
    let mut server = tokio::spawn(start_websocket_server(
        addr,
        broker,
        config.transport.clone(),
        shutdown.clone(),
    ));

    tokio::select! {
        result = &mut server => {
            error!("WebSocket server exited unexpectedly.");
            shutdown.cancel();
            expiry.await?;
            result??;
            return Ok(());
        }
        signal = tokio::signal::ctrl_c() => {
            signal?;
            info!("Shutdown signal received. Closing connections.");
        }
    }
    shutdown.cancel();

    server.await??;
    expiry.await?;
    info!("Server stopped");
    Ok(())
}

async fn run_client(url: &str) -> Result<(), Box<dyn std::error::Error>> {
    use futures_util::{SinkExt, StreamExt};
    use serde_json::json;
    use tidemq::protocol::{
        AcknowledgeMessage, ClientEnvelope, Envelope, HelloMessage, Message, PublishMessage,
        SubscribeMessage, codec,
    };
    use tokio_tungstenite::connect_async;
    use tokio_tungstenite::tungstenite::Message as WsMessage;
    use uuid::Uuid;

    let (mut ws_stream, _response) = connect_async(url).await?;

    let to_frame = |message: Message| -> Result<WsMessage, serde_json::Error> {
        let envelope: Envelope = ClientEnvelope::for_message(message).into();
        Ok(WsMessage::text(serde_json::to_string(&envelope)?))
    };

    let topic = "smoke";
    let outgoing = [
        Message::Hello(HelloMessage {
            id: Uuid::new_v4(),
            capabilities: vec![],
        }),
        Message::Subscribe(SubscribeMessage {
            topic: topic.to_string(),
        }),
        Message::Publish(PublishMessage {
            id: Uuid::new_v4(),
            topic: topic.to_string(),
            headers: Default::default(),
            payload: json!({ "text": "Hello from tidemq" }),
        }),
    ];
    for message in outgoing {
        ws_stream.send(to_frame(message)?).await?;
    }

    while let Some(frame) = ws_stream.next().await {
        let text = match frame? {
            WsMessage::Text(text) => text,
            WsMessage::Close(frame) => {
                info!("Server closed the connection: {frame:?}");
                return Ok(());
            }
            _ => continue,
        };
        let Envelope::Server(envelope) = codec::decode(text.as_bytes())? else {
            continue;
        };
        match envelope.message {
            Message::Greeting(greeting) => {
                info!(
                    "Greeting: version {} ({})",
                    greeting.version,
                    greeting.informational_version.unwrap_or_default()
                );
            }
            Message::Deliver(deliver) => {
                info!("Delivered {} on {}: {}", deliver.id, deliver.topic, deliver.payload);
                let ack = Message::Acknowledge(AcknowledgeMessage {
                    id: deliver.id,
                    topic: deliver.topic,
                });
                ws_stream.send(to_frame(ack)?).await?;
                ws_stream.close(None).await?;
                return Ok(());
            }
            other => info!("Received {}", other.tag()),
        }
    }

    Ok(())
}
