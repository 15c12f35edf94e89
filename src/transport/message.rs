//! Client and server commands carried in STOMP frames.
//!
//! `ClientCommand` is what the connection handler acts on; `ServerFrame` is
//! everything the hub ever writes back. SEND bodies are validated as a
//! `ChatPayload` here, so a malformed payload is a decode error of the
//! sending connection and never reaches the dispatcher.

use super::frame::{DecodeError, Frame};
use crate::broker::message::{ChatPayload, Message};

/// Protocol versions this hub speaks, best first.
pub const SUPPORTED_VERSIONS: [&str; 3] = ["1.2", "1.1", "1.0"];

pub const SERVER_NAME: &str = concat!("chathub/", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientCommand {
    Connect {
        accept_version: Option<String>,
        host: Option<String>,
    },
    Subscribe {
        id: String,
        destination: String,
        receipt: Option<String>,
    },
    Unsubscribe {
        id: String,
        receipt: Option<String>,
    },
    Send {
        destination: String,
        body: String,
        content_type: Option<String>,
        receipt: Option<String>,
    },
    Disconnect {
        receipt: Option<String>,
    },
}

impl ClientCommand {
    /// Decodes every command in one transport message.
    pub fn decode(text: &str) -> Result<Vec<ClientCommand>, DecodeError> {
        Frame::decode_all(text)?
            .into_iter()
            .map(ClientCommand::from_frame)
            .collect()
    }

    pub fn from_frame(frame: Frame) -> Result<Self, DecodeError> {
        let owned = |name: &str| frame.get(name).map(str::to_string);
        let receipt = owned("receipt");

        match frame.command.as_str() {
            "CONNECT" | "STOMP" => Ok(ClientCommand::Connect {
                accept_version: owned("accept-version"),
                host: owned("host"),
            }),
            "SUBSCRIBE" => {
                let destination = required(&frame, "SUBSCRIBE", "destination")?;
                // 1.0 clients may omit the id; the destination stands in for it
                let id = owned("id").unwrap_or_else(|| destination.clone());
                Ok(ClientCommand::Subscribe {
                    id,
                    destination,
                    receipt,
                })
            }
            "UNSUBSCRIBE" => {
                let id = owned("id").or_else(|| owned("destination")).ok_or(
                    DecodeError::MissingHeader {
                        command: "UNSUBSCRIBE",
                        header: "id",
                    },
                )?;
                Ok(ClientCommand::Unsubscribe { id, receipt })
            }
            "SEND" => {
                let destination = required(&frame, "SEND", "destination")?;
                ChatPayload::parse(&frame.body)
                    .map_err(|e| DecodeError::InvalidPayload(e.to_string()))?;
                Ok(ClientCommand::Send {
                    destination,
                    content_type: owned("content-type"),
                    receipt,
                    body: frame.body,
                })
            }
            "DISCONNECT" => Ok(ClientCommand::Disconnect { receipt }),
            other => Err(DecodeError::UnknownCommand(other.to_string())),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ClientCommand::Connect { .. } => "CONNECT",
            ClientCommand::Subscribe { .. } => "SUBSCRIBE",
            ClientCommand::Unsubscribe { .. } => "UNSUBSCRIBE",
            ClientCommand::Send { .. } => "SEND",
            ClientCommand::Disconnect { .. } => "DISCONNECT",
        }
    }

    pub fn receipt(&self) -> Option<&str> {
        match self {
            ClientCommand::Subscribe { receipt, .. }
            | ClientCommand::Unsubscribe { receipt, .. }
            | ClientCommand::Send { receipt, .. }
            | ClientCommand::Disconnect { receipt } => receipt.as_deref(),
            ClientCommand::Connect { .. } => None,
        }
    }
}

fn required(frame: &Frame, command: &'static str, header: &'static str) -> Result<String, DecodeError> {
    match frame.get(header) {
        Some(value) if !value.is_empty() => Ok(value.to_string()),
        _ => Err(DecodeError::MissingHeader { command, header }),
    }
}

/// Picks the best version from a client's `accept-version` header. A missing
/// header means 1.0.
pub fn negotiate_version(accept_version: Option<&str>) -> Result<&'static str, DecodeError> {
    let offered: Vec<&str> = match accept_version {
        Some(raw) => raw.split(',').map(str::trim).collect(),
        None => vec!["1.0"],
    };
    SUPPORTED_VERSIONS
        .iter()
        .find(|v| offered.contains(*v))
        .copied()
        .ok_or_else(|| DecodeError::UnsupportedVersion(accept_version.unwrap_or_default().to_string()))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerFrame {
    Connected {
        version: &'static str,
        session: String,
    },
    Message {
        destination: String,
        subscription: String,
        message_id: String,
        content_type: Option<String>,
        body: String,
    },
    Receipt {
        receipt_id: String,
    },
    Error {
        message: String,
        receipt_id: Option<String>,
    },
}

impl ServerFrame {
    /// The MESSAGE frame for `message` as seen by the subscription `subscription`.
    pub fn message(message: &Message, subscription: &str) -> Self {
        ServerFrame::Message {
            destination: message.topic.clone(),
            subscription: subscription.to_string(),
            message_id: message.sequence.to_string(),
            content_type: message.content_type.clone(),
            body: message.body.clone(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        ServerFrame::Error {
            message: message.into(),
            receipt_id: None,
        }
    }

    pub fn to_frame(&self) -> Frame {
        match self {
            ServerFrame::Connected { version, session } => Frame::new("CONNECTED")
                .header("version", *version)
                .header("session", session.as_str())
                .header("server", SERVER_NAME)
                .header("heart-beat", "0,0"),
            ServerFrame::Message {
                destination,
                subscription,
                message_id,
                content_type,
                body,
            } => {
                let mut frame = Frame::new("MESSAGE")
                    .header("destination", destination.as_str())
                    .header("subscription", subscription.as_str())
                    .header("message-id", message_id.as_str());
                if let Some(content_type) = content_type {
                    frame = frame.header("content-type", content_type.as_str());
                }
                frame.with_body(body.as_str())
            }
            ServerFrame::Receipt { receipt_id } => {
                Frame::new("RECEIPT").header("receipt-id", receipt_id.as_str())
            }
            ServerFrame::Error {
                message,
                receipt_id,
            } => {
                let mut frame = Frame::new("ERROR").header("message", message.as_str());
                if let Some(receipt_id) = receipt_id {
                    frame = frame.header("receipt-id", receipt_id.as_str());
                }
                frame
                    .header("content-type", "text/plain")
                    .with_body(message.as_str())
            }
        }
    }

    pub fn encode(&self) -> String {
        self.to_frame().encode()
    }
}
