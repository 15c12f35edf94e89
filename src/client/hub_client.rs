//! A small STOMP-over-WebSocket client.
//!
//! Used by the `client` subcommand for smoke tests against a running hub and
//! by the end-to-end tests. It speaks just enough of the protocol to connect,
//! subscribe, send chat messages and disconnect cleanly.

use std::collections::VecDeque;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tungstenite::Message as WsMessage;
use tungstenite::client::IntoClientRequest;
use tungstenite::http::{HeaderValue, header};

use crate::broker::ChatPayload;
use crate::transport::frame::Frame;
use crate::utils::HubError;

pub struct HubClient {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
    pending: VecDeque<Frame>,
    session: Option<String>,
    version: Option<String>,
    next_receipt: u64,
    next_subscription: u64,
}

impl HubClient {
    /// Opens the WebSocket with the given `Origin` and performs the STOMP
    /// CONNECT exchange.
    pub async fn connect(url: &str, origin: &str) -> Result<Self, HubError> {
        let mut client = Self::open(url, origin).await?;
        client
            .send_frame(
                &Frame::new("CONNECT")
                    .header("accept-version", "1.2,1.1,1.0")
                    .header("host", "chathub"),
            )
            .await?;

        match client.next_frame().await? {
            Some(frame) if frame.command == "CONNECTED" => {
                client.session = frame.get("session").map(str::to_string);
                client.version = frame.get("version").map(str::to_string);
                Ok(client)
            }
            Some(frame) => Err(unexpected(&frame)),
            None => Err(HubError::Closed),
        }
    }

    /// Opens the WebSocket only; no STOMP frame is sent.
    pub async fn open(url: &str, origin: &str) -> Result<Self, HubError> {
        let mut request = url.into_client_request()?;
        let origin = HeaderValue::from_str(origin)
            .map_err(|e| HubError::HandshakeRejected(format!("invalid origin: {e}")))?;
        request.headers_mut().insert(header::ORIGIN, origin);
        request.headers_mut().insert(
            header::SEC_WEBSOCKET_PROTOCOL,
            HeaderValue::from_static("v12.stomp"),
        );

        let (ws, _response) = connect_async(request).await?;
        Ok(Self {
            ws,
            pending: VecDeque::new(),
            session: None,
            version: None,
            next_receipt: 1,
            next_subscription: 1,
        })
    }

    pub fn session(&self) -> Option<&str> {
        self.session.as_deref()
    }

    pub fn version(&self) -> Option<&str> {
        self.version.as_deref()
    }

    /// Subscribes to `destination` and waits until the hub confirms it.
    /// Returns the subscription id.
    pub async fn subscribe(&mut self, destination: &str) -> Result<String, HubError> {
        let id = format!("sub-{}", self.next_subscription);
        self.next_subscription += 1;
        let receipt = self.receipt_id();
        self.send_frame(
            &Frame::new("SUBSCRIBE")
                .header("id", id.as_str())
                .header("destination", destination)
                .header("receipt", receipt.as_str()),
        )
        .await?;
        self.await_receipt(&receipt).await?;
        Ok(id)
    }

    pub async fn unsubscribe(&mut self, subscription: &str) -> Result<(), HubError> {
        let receipt = self.receipt_id();
        self.send_frame(
            &Frame::new("UNSUBSCRIBE")
                .header("id", subscription)
                .header("receipt", receipt.as_str()),
        )
        .await?;
        self.await_receipt(&receipt).await
    }

    /// Sends a chat record to `destination`.
    pub async fn send_chat(
        &mut self,
        destination: &str,
        sender: &str,
        content: &str,
    ) -> Result<(), HubError> {
        let payload = ChatPayload {
            sender: sender.to_string(),
            content: content.to_string(),
            id: None,
        };
        let body = serde_json::to_string(&payload)?;
        self.send_frame(
            &Frame::new("SEND")
                .header("destination", destination)
                .header("content-type", "application/json")
                .with_body(body),
        )
        .await
    }

    /// Sends `text` as a single WebSocket text message, unchecked.
    pub async fn send_raw(&mut self, text: &str) -> Result<(), HubError> {
        self.ws.send(WsMessage::text(text)).await?;
        Ok(())
    }

    pub async fn send_frame(&mut self, frame: &Frame) -> Result<(), HubError> {
        self.ws.send(WsMessage::text(frame.encode())).await?;
        Ok(())
    }

    /// Next frame from the hub; `None` once the connection is closed.
    pub async fn next_frame(&mut self) -> Result<Option<Frame>, HubError> {
        loop {
            if let Some(frame) = self.pending.pop_front() {
                return Ok(Some(frame));
            }
            match self.ws.next().await {
                None | Some(Ok(WsMessage::Close(_))) => return Ok(None),
                Some(Err(tungstenite::Error::ConnectionClosed)) => return Ok(None),
                Some(Err(e)) => return Err(e.into()),
                Some(Ok(WsMessage::Text(text))) => {
                    self.pending.extend(Frame::decode_all(text.as_str())?);
                }
                Some(Ok(_)) => {}
            }
        }
    }

    /// Next MESSAGE frame, skipping anything else.
    pub async fn next_message(&mut self) -> Result<Option<Frame>, HubError> {
        while let Some(frame) = self.next_frame().await? {
            if frame.command == "MESSAGE" {
                return Ok(Some(frame));
            }
        }
        Ok(None)
    }

    /// Sends DISCONNECT, waits for its receipt and for the hub to close.
    /// Frames that arrive in between are returned in order.
    pub async fn disconnect(mut self) -> Result<Vec<Frame>, HubError> {
        let receipt = self.receipt_id();
        self.send_frame(&Frame::new("DISCONNECT").header("receipt", receipt.as_str()))
            .await?;

        let mut received = Vec::new();
        let mut confirmed = false;
        while let Some(frame) = self.next_frame().await? {
            if frame.command == "RECEIPT" && frame.get("receipt-id") == Some(receipt.as_str()) {
                confirmed = true;
            } else {
                received.push(frame);
            }
        }

        if confirmed {
            Ok(received)
        } else {
            Err(HubError::Closed)
        }
    }

    fn receipt_id(&mut self) -> String {
        let id = format!("rcpt-{}", self.next_receipt);
        self.next_receipt += 1;
        id
    }

    async fn await_receipt(&mut self, receipt: &str) -> Result<(), HubError> {
        let mut held = Vec::new();
        let outcome = loop {
            match self.next_frame().await {
                Ok(Some(frame))
                    if frame.command == "RECEIPT" && frame.get("receipt-id") == Some(receipt) =>
                {
                    break Ok(());
                }
                Ok(Some(frame)) if frame.command == "ERROR" => break Err(unexpected(&frame)),
                Ok(Some(frame)) => held.push(frame),
                Ok(None) => break Err(HubError::Closed),
                Err(e) => break Err(e),
            }
        };

        // keep anything that arrived ahead of the receipt for the caller
        for frame in held.into_iter().rev() {
            self.pending.push_front(frame);
        }
        outcome
    }
}

fn unexpected(frame: &Frame) -> HubError {
    let detail = frame.get("message").unwrap_or(frame.body.as_str());
    HubError::UnexpectedFrame(format!("{} {}", frame.command, detail))
}
