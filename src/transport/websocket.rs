//! WebSocket server
//!
//! Accepts TCP connections, validates the upgrade (path, origin, capacity)
//! and hands every accepted socket to its own `ConnectionHandler` task.
//! Shutdown is driven by a `CancellationToken`: the accept loop stops, every
//! handler drains and closes, and connections still alive after the deadline
//! are aborted and swept from the registry.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tokio::time::timeout;
use tokio_tungstenite::accept_hdr_async;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tungstenite::http::header;

use super::handler::ConnectionHandler;
use super::handshake::{HandshakePolicy, negotiate_subprotocol};
use crate::broker::Broker;
use crate::config::{HubSettings, Settings};
use crate::utils::HubError;

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

pub async fn bind(addr: &str) -> Result<TcpListener, HubError> {
    Ok(TcpListener::bind(addr).await?)
}

/// Binds the configured address and serves until `shutdown` is cancelled.
pub async fn start_websocket_server(
    broker: Arc<Broker>,
    settings: Settings,
    shutdown: CancellationToken,
) -> Result<(), HubError> {
    let addr = settings.listen_addr();
    let listener = bind(&addr).await?;
    info!(%addr, path = %settings.server.path, "WebSocket server listening");
    serve(listener, broker, settings, shutdown).await;
    Ok(())
}

/// Runs the accept loop on an already bound listener.
pub async fn serve(
    listener: TcpListener,
    broker: Arc<Broker>,
    settings: Settings,
    shutdown: CancellationToken,
) {
    let policy = Arc::new(HandshakePolicy::from_settings(&settings.server));
    let mut tasks = JoinSet::new();

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    tasks.spawn(handle_stream(
                        stream,
                        peer,
                        broker.clone(),
                        policy.clone(),
                        settings.hub.clone(),
                        shutdown.clone(),
                    ));
                }
                Err(e) => warn!(error = %e, "accept failed"),
            },
            Some(_) = tasks.join_next(), if !tasks.is_empty() => {}
        }
    }
    drop(listener);

    info!(live = broker.registry().len(), "shutting down, draining connections");
    let deadline = settings.hub.grace_timeout() * 3 + Duration::from_secs(1);
    let drained = timeout(deadline, async {
        while tasks.join_next().await.is_some() {}
    })
    .await;
    if drained.is_err() {
        warn!(remaining = tasks.len(), "shutdown deadline elapsed, aborting connections");
        tasks.shutdown().await;
    }

    // aborted handlers never reached their own cleanup
    for id in broker.registry().ids() {
        broker.cleanup_client(id);
    }
    info!("WebSocket server stopped");
}

async fn handle_stream(
    stream: TcpStream,
    peer: SocketAddr,
    broker: Arc<Broker>,
    policy: Arc<HandshakePolicy>,
    settings: HubSettings,
    shutdown: CancellationToken,
) {
    let callback = |request: &Request, mut response: Response| -> Result<Response, ErrorResponse> {
        if let Err(rejection) = policy.check(request, broker.registry().has_capacity()) {
            warn!(
                %peer,
                status = %rejection.status,
                reason = %rejection.reason,
                "upgrade rejected"
            );
            return Err(rejection.into_response());
        }
        if let Some(protocol) = negotiate_subprotocol(request) {
            response
                .headers_mut()
                .insert(header::SEC_WEBSOCKET_PROTOCOL, protocol);
        }
        Ok(response)
    };

    let ws = match timeout(HANDSHAKE_TIMEOUT, accept_hdr_async(stream, callback)).await {
        Ok(Ok(ws)) => ws,
        Ok(Err(e)) => {
            debug!(%peer, error = %e, "handshake failed");
            return;
        }
        Err(_) => {
            debug!(%peer, "handshake timed out");
            return;
        }
    };

    let reason = ConnectionHandler::new(ws, broker, settings, Some(peer), shutdown)
        .run()
        .await;
    debug!(%peer, %reason, "handler finished");
}
