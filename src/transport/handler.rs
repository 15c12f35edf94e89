//! Per-connection handler.
//!
//! One handler task owns one WebSocket stream for its whole life and walks
//! the connection through `Connecting -> Open -> Closing -> Closed`:
//!
//! - `Connecting`: upgrade accepted, waiting for `CONNECT`. Nothing is
//!   registered yet.
//! - `Open`: registered with the broker; inbound frames are decoded and
//!   applied, outbound topic messages are encoded onto the socket.
//! - `Closing`: the connection leaves every topic first, then already queued
//!   messages are flushed (client DISCONNECT and server shutdown only) within
//!   the grace timeout, then the socket is closed.
//! - `Closed`: unregistered.
//!
//! Everything that goes wrong on one connection ends in a `CloseReason` for
//! that connection only.

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::{Instant, sleep_until, timeout};
use tokio_tungstenite::WebSocketStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use tungstenite::Message as WsMessage;
use tungstenite::protocol::CloseFrame;
use tungstenite::protocol::frame::coding::CloseCode;

use super::frame::DecodeError;
use super::message::{ClientCommand, ServerFrame, negotiate_version};
use crate::broker::{Broker, Message};
use crate::config::HubSettings;
use crate::connection::{Connection, ConnectionState, OutboundReceiver, outbound_queue};
use crate::utils::HubError;

/// Why a connection left the `Open` state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// DISCONNECT frame, optionally asking for a receipt.
    ClientDisconnect { receipt: Option<String> },
    /// WebSocket close frame or end of stream.
    ClientClosed,
    TransportError(String),
    /// Malformed frame or protocol violation.
    Protocol(String),
    /// Outbound queue overflowed or a socket write outlasted the grace
    /// timeout.
    SlowConsumer,
    Shutdown,
    /// CONNECT refused by the registry.
    Rejected(String),
}

impl CloseReason {
    fn drains(&self) -> bool {
        matches!(
            self,
            CloseReason::ClientDisconnect { .. } | CloseReason::Shutdown
        )
    }

    fn final_frame(&self) -> Option<ServerFrame> {
        match self {
            CloseReason::ClientDisconnect {
                receipt: Some(receipt_id),
            } => Some(ServerFrame::Receipt {
                receipt_id: receipt_id.clone(),
            }),
            CloseReason::Protocol(message) | CloseReason::Rejected(message) => {
                Some(ServerFrame::error(message.as_str()))
            }
            _ => None,
        }
    }

    fn close_frame(&self) -> Option<CloseFrame> {
        let (code, reason) = match self {
            CloseReason::ClientDisconnect { .. } => (CloseCode::Normal, "bye"),
            CloseReason::Protocol(_) => (CloseCode::Protocol, "protocol error"),
            CloseReason::SlowConsumer => (CloseCode::Policy, "slow consumer"),
            CloseReason::Shutdown => (CloseCode::Away, "server shutdown"),
            CloseReason::Rejected(_) => (CloseCode::Again, "connection refused"),
            CloseReason::ClientClosed | CloseReason::TransportError(_) => return None,
        };
        Some(CloseFrame {
            code,
            reason: reason.into(),
        })
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::ClientDisconnect { .. } => f.write_str("client disconnect"),
            CloseReason::ClientClosed => f.write_str("client closed"),
            CloseReason::TransportError(e) => write!(f, "transport error: {e}"),
            CloseReason::Protocol(e) => write!(f, "protocol error: {e}"),
            CloseReason::SlowConsumer => f.write_str("slow consumer"),
            CloseReason::Shutdown => f.write_str("server shutdown"),
            CloseReason::Rejected(e) => write!(f, "rejected: {e}"),
        }
    }
}

enum Event {
    Inbound(Option<Result<WsMessage, tungstenite::Error>>),
    Outbound(Arc<Message>),
    Evicted,
    Shutdown,
    ConnectTimeout,
}

pub struct ConnectionHandler<S> {
    ws: WebSocketStream<S>,
    broker: Arc<Broker>,
    settings: HubSettings,
    peer: Option<SocketAddr>,
    state: ConnectionState,
    connection: Option<Arc<Connection>>,
    outbound: Option<OutboundReceiver>,
    /// subscription id -> topic
    subscriptions: HashMap<String, String>,
    shutdown: CancellationToken,
}

impl<S> ConnectionHandler<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(
        ws: WebSocketStream<S>,
        broker: Arc<Broker>,
        settings: HubSettings,
        peer: Option<SocketAddr>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            ws,
            broker,
            settings,
            peer,
            state: ConnectionState::Connecting,
            connection: None,
            outbound: None,
            subscriptions: HashMap::new(),
            shutdown,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Serves the connection until it closes, then tears it down.
    pub async fn run(mut self) -> CloseReason {
        let reason = self.serve().await;
        self.close(&reason).await;
        reason
    }

    async fn serve(&mut self) -> CloseReason {
        let connect_deadline = Instant::now() + self.settings.connect_timeout();
        loop {
            let event = tokio::select! {
                _ = self.shutdown.cancelled() => Event::Shutdown,
                _ = sleep_until(connect_deadline), if self.connection.is_none() => {
                    Event::ConnectTimeout
                }
                _ = wait_evicted(self.connection.as_deref()) => Event::Evicted,
                Some(message) = next_outbound(&mut self.outbound) => Event::Outbound(message),
                inbound = self.ws.next() => Event::Inbound(inbound),
            };

            let outcome = match event {
                Event::Shutdown => Some(CloseReason::Shutdown),
                Event::Evicted => Some(CloseReason::SlowConsumer),
                Event::ConnectTimeout => {
                    warn!(conn = %self.label(), "no CONNECT frame before the deadline");
                    Some(CloseReason::Protocol("CONNECT timed out".to_string()))
                }
                Event::Outbound(message) => self.forward(&message).await,
                Event::Inbound(None) => Some(CloseReason::ClientClosed),
                Event::Inbound(Some(Err(e))) => Some(CloseReason::TransportError(e.to_string())),
                Event::Inbound(Some(Ok(message))) => self.on_ws_message(message).await,
            };
            if let Some(reason) = outcome {
                return reason;
            }
        }
    }

    fn label(&self) -> String {
        match (&self.connection, self.peer) {
            (Some(connection), _) => connection.id().to_string(),
            (None, Some(peer)) => peer.to_string(),
            (None, None) => "unregistered".to_string(),
        }
    }

    async fn on_ws_message(&mut self, message: WsMessage) -> Option<CloseReason> {
        match message {
            WsMessage::Text(text) => self.on_text(text.as_str()).await,
            WsMessage::Binary(data) => match std::str::from_utf8(&data) {
                Ok(text) => self.on_text(text).await,
                Err(_) => Some(CloseReason::Protocol(DecodeError::NotUtf8.to_string())),
            },
            WsMessage::Close(_) => Some(CloseReason::ClientClosed),
            WsMessage::Ping(_) | WsMessage::Pong(_) | WsMessage::Frame(_) => None,
        }
    }

    async fn on_text(&mut self, text: &str) -> Option<CloseReason> {
        let commands = match ClientCommand::decode(text) {
            Ok(commands) => commands,
            Err(e) => {
                let error = HubError::from(e);
                warn!(conn = %self.label(), error = %error, "malformed frame");
                return Some(CloseReason::Protocol(error.to_string()));
            }
        };

        for command in commands {
            if let Some(reason) = self.on_command(command).await {
                return Some(reason);
            }
        }
        None
    }

    async fn on_connect(&mut self, command: ClientCommand) -> Option<CloseReason> {
        let name = command.name();
        let ClientCommand::Connect { accept_version, .. } = command else {
            return Some(CloseReason::Protocol(format!(
                "expected CONNECT, got {name}"
            )));
        };

        let version = match negotiate_version(accept_version.as_deref()) {
            Ok(version) => version,
            Err(e) => return Some(CloseReason::Protocol(e.to_string())),
        };

        let (sender, receiver) = outbound_queue(self.settings.outbound_queue_capacity);
        let connection = match self.broker.register_client(sender, self.peer) {
            Ok(connection) => connection,
            Err(e) => {
                warn!(peer = ?self.peer, error = %e, "connection refused");
                return Some(CloseReason::Rejected(e.to_string()));
            }
        };

        self.state = ConnectionState::Open;
        self.outbound = Some(receiver);
        let frame = ServerFrame::Connected {
            version,
            session: connection.session().to_string(),
        };
        info!(conn = %connection.id(), peer = ?self.peer, version, "connection open");
        self.connection = Some(connection);

        self.deliver(&frame).await
    }

    async fn on_command(&mut self, command: ClientCommand) -> Option<CloseReason> {
        let Some(id) = self.connection.as_ref().map(|c| c.id()) else {
            return self.on_connect(command).await;
        };
        let receipt = command.receipt().map(str::to_string);

        match command {
            ClientCommand::Connect { .. } => {
                return Some(CloseReason::Protocol("already connected".to_string()));
            }
            ClientCommand::Subscribe {
                id: subscription,
                destination,
                ..
            } => {
                if let Err(e) = self.broker.subscribe(&destination, id) {
                    warn!(conn = %id, topic = %destination, error = %e, "subscribe refused");
                    let refusal = ServerFrame::Error {
                        message: e.to_string(),
                        receipt_id: receipt,
                    };
                    return self.deliver(&refusal).await;
                }
                if let Some(previous) = self.subscriptions.insert(subscription, destination) {
                    self.release_topic(&previous);
                }
            }
            ClientCommand::Unsubscribe {
                id: subscription, ..
            } => match self.subscriptions.remove(&subscription) {
                Some(topic) => self.release_topic(&topic),
                None => debug!(conn = %id, %subscription, "unknown subscription ignored"),
            },
            ClientCommand::Send {
                destination,
                body,
                content_type,
                ..
            } => match self
                .broker
                .handle_inbound(id, &destination, body, content_type)
            {
                Ok(report) => debug!(
                    conn = %id,
                    %destination,
                    delivered = report.delivered,
                    skipped = report.skipped,
                    "message accepted"
                ),
                Err(e) => warn!(conn = %id, error = %e, "message dropped"),
            },
            ClientCommand::Disconnect { receipt } => {
                return Some(CloseReason::ClientDisconnect { receipt });
            }
        }

        let receipt_id = receipt?;
        self.deliver(&ServerFrame::Receipt { receipt_id }).await
    }

    /// Leaves `topic` unless another subscription id still points at it.
    fn release_topic(&self, topic: &str) {
        if self.subscriptions.values().any(|t| t == topic) {
            return;
        }
        if let Some(connection) = &self.connection {
            self.broker.unsubscribe(topic, connection.id());
        }
    }

    async fn forward(&mut self, message: &Message) -> Option<CloseReason> {
        let Some(subscription) = subscription_for(&self.subscriptions, &message.topic) else {
            debug!(conn = %self.label(), topic = %message.topic, "no subscription for queued message");
            return None;
        };
        let frame = ServerFrame::message(message, subscription);
        self.deliver(&frame).await
    }

    /// Writes one frame while the connection is open. The write is bounded
    /// by the grace timeout and gives way to eviction and shutdown, so a
    /// client that stops reading cannot pin the handler.
    async fn deliver(&mut self, frame: &ServerFrame) -> Option<CloseReason> {
        let grace = self.settings.grace_timeout();
        let label = self.label();
        let write = timeout(grace, self.ws.send(WsMessage::text(frame.encode())));
        tokio::select! {
            _ = self.shutdown.cancelled() => Some(CloseReason::Shutdown),
            _ = wait_evicted(self.connection.as_deref()) => Some(CloseReason::SlowConsumer),
            written = write => match written {
                Ok(Ok(())) => None,
                Ok(Err(e)) => Some(CloseReason::TransportError(e.to_string())),
                Err(_) => {
                    warn!(conn = %label, "socket write timed out");
                    Some(CloseReason::SlowConsumer)
                }
            },
        }
    }

    async fn send_frame(&mut self, frame: &ServerFrame) -> Result<(), tungstenite::Error> {
        self.ws.send(WsMessage::text(frame.encode())).await
    }

    async fn close(&mut self, reason: &CloseReason) {
        let grace = self.settings.grace_timeout();
        let label = self.label();
        self.state = ConnectionState::Closing;

        // nothing new may be queued past this point
        if let Some(connection) = &self.connection {
            connection.advance(ConnectionState::Closing);
            self.broker.detach(connection.id());
        }

        if let Some(mut outbound) = self.outbound.take() {
            outbound.close();
            if reason.drains() {
                match timeout(grace, drain(&mut self.ws, &mut outbound, &self.subscriptions)).await
                {
                    Ok(Ok(count)) => debug!(conn = %label, count, "drained outbound queue"),
                    Ok(Err(e)) => debug!(conn = %label, error = %e, "drain interrupted"),
                    Err(_) => warn!(conn = %label, "grace timeout elapsed while draining"),
                }
            }
        }

        if let Some(frame) = reason.final_frame() {
            let _ = timeout(grace, self.send_frame(&frame)).await;
        }
        if !matches!(reason, CloseReason::TransportError(_)) {
            let _ = timeout(grace, self.ws.close(reason.close_frame())).await;
        }

        if let Some(connection) = self.connection.take() {
            self.broker.cleanup_client(connection.id());
        }
        self.state = ConnectionState::Closed;
        info!(conn = %label, %reason, "connection closed");
    }
}

fn subscription_for<'a>(subscriptions: &'a HashMap<String, String>, topic: &str) -> Option<&'a str> {
    subscriptions
        .iter()
        .filter(|(_, t)| t.as_str() == topic)
        .map(|(id, _)| id.as_str())
        .min()
}

async fn wait_evicted(connection: Option<&Connection>) {
    match connection {
        Some(connection) => connection.evicted().await,
        None => std::future::pending().await,
    }
}

async fn next_outbound(outbound: &mut Option<OutboundReceiver>) -> Option<Arc<Message>> {
    match outbound {
        Some(receiver) => receiver.recv().await,
        None => std::future::pending().await,
    }
}

async fn drain<S>(
    ws: &mut WebSocketStream<S>,
    outbound: &mut OutboundReceiver,
    subscriptions: &HashMap<String, String>,
) -> Result<usize, tungstenite::Error>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut sent = 0;
    while let Some(message) = outbound.recv().await {
        if let Some(subscription) = subscription_for(subscriptions, &message.topic) {
            let frame = ServerFrame::message(&message, subscription);
            ws.feed(WsMessage::text(frame.encode())).await?;
            sent += 1;
        }
    }
    ws.flush().await?;
    Ok(sent)
}
