use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tokio_tungstenite::accept_hdr_async;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tungstenite::http::StatusCode;
use tungstenite::protocol::frame::coding::CloseCode;

use crate::broker::Broker;
use crate::client::MessageClient;
use crate::config::TransportSettings;
use crate::transport::connection::Connection;
use crate::transport::pipe::PipeOptions;
use crate::transport::socket::{TungsteniteSocket, WebSocket};
use crate::utils::error::CloseReason;

/// The upgrade endpoints the listener serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endpoint {
    /// JSON envelope protocol.
    Json,
    /// Raw message-framed protocol; reserved, closes immediately.
    Raw,
}

impl Endpoint {
    pub fn from_path(path: &str) -> Option<Self> {
        match path {
            "/" | "/json" | "/ws/json" => Some(Endpoint::Json),
            "/ws" | "/ws/raw" => Some(Endpoint::Raw),
            _ => None,
        }
    }
}

/// Binds `addr` and serves WebSocket clients until `shutdown` fires.
pub async fn start_websocket_server(
    addr: String,
    broker: Arc<Broker>,
    settings: TransportSettings,
    shutdown: CancellationToken,
) -> io::Result<()> {
    let listener = TcpListener::bind(addr.as_str()).await?;
    info!("WebSocket server listening on ws://{}", listener.local_addr()?);
    serve(listener, broker, settings, shutdown).await
}

/// Accepts connections on `listener`, one handler task each. On shutdown
/// every connection is closed normally and joined before returning.
pub async fn serve(
    listener: TcpListener,
    broker: Arc<Broker>,
    settings: TransportSettings,
    shutdown: CancellationToken,
) -> io::Result<()> {
    let options = PipeOptions::from(&settings);
    let mut connections = JoinSet::new();

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!("Failed to accept connection: {e}");
                        continue;
                    }
                };
                connections.spawn(handle_stream(
                    stream,
                    peer,
                    broker.clone(),
                    options,
                    shutdown.clone(),
                ));
            }
            Some(joined) = connections.join_next(), if !connections.is_empty() => {
                if let Err(e) = joined {
                    error!("Connection task failed: {e}");
                }
            }
        }
    }

    info!("Shutting down, closing {} connections", connections.len());
    while let Some(joined) = connections.join_next().await {
        if let Err(e) = joined {
            error!("Connection task failed: {e}");
        }
    }
    Ok(())
}

async fn handle_stream(
    stream: TcpStream,
    peer: SocketAddr,
    broker: Arc<Broker>,
    options: PipeOptions,
    shutdown: CancellationToken,
) {
    let mut endpoint = None;
    let callback = |request: &Request, response: Response| {
        route(request, response, &mut endpoint)
    };
    let ws_stream = match accept_hdr_async(stream, callback).await {
        Ok(ws) => ws,
        Err(e) => {
            debug!("WebSocket handshake with {peer} failed: {e}");
            return;
        }
    };

    let socket: Arc<dyn WebSocket> = Arc::new(TungsteniteSocket::new(ws_stream));
    match endpoint {
        Some(Endpoint::Json) => {
            let connection = Connection::new(broker, options, &shutdown);
            debug!("Accepted {peer} as client {}", connection.id());
            // the handler has already closed the socket and logged the error
            let _ = connection.handle(socket).await;
        }
        Some(Endpoint::Raw) => {
            let reason = CloseReason::new(CloseCode::Unsupported, "raw endpoint is not supported");
            if let Err(e) = socket.close(&reason).await {
                debug!("Closing raw connection from {peer} failed: {e}");
                socket.abort();
            }
        }
        None => {}
    }
}

fn route(
    request: &Request,
    response: Response,
    endpoint: &mut Option<Endpoint>,
) -> Result<Response, ErrorResponse> {
    let path = request.uri().path();
    match Endpoint::from_path(path) {
        Some(found) => {
            *endpoint = Some(found);
            Ok(response)
        }
        None => {
            debug!("Rejecting upgrade on unknown path {path}");
            let mut rejection = ErrorResponse::new(Some(format!("no endpoint at {path}")));
            *rejection.status_mut() = StatusCode::NOT_FOUND;
            Err(rejection)
        }
    }
}
