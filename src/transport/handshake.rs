//! Upgrade validation.
//!
//! Runs inside the WebSocket accept callback, before any frame is read and
//! before the connection exists anywhere in the broker. A refused upgrade is
//! answered with a plain HTTP status.

use tungstenite::handshake::server::{ErrorResponse, Request};
use tungstenite::http::{HeaderValue, StatusCode, header};

use crate::config::ServerSettings;
use crate::utils::HubError;

/// Sub-protocols offered by STOMP-over-WebSocket clients, best first.
pub const STOMP_SUBPROTOCOLS: [&str; 3] = ["v12.stomp", "v11.stomp", "v10.stomp"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeRejection {
    pub status: StatusCode,
    pub reason: String,
}

impl HandshakeRejection {
    fn new(status: StatusCode, reason: impl Into<String>) -> Self {
        Self {
            status,
            reason: reason.into(),
        }
    }

    pub fn into_response(self) -> ErrorResponse {
        let mut response = ErrorResponse::new(Some(self.reason));
        *response.status_mut() = self.status;
        response
    }
}

impl From<HandshakeRejection> for HubError {
    fn from(rejection: HandshakeRejection) -> Self {
        HubError::HandshakeRejected(format!("{} ({})", rejection.reason, rejection.status))
    }
}

#[derive(Debug, Clone)]
pub struct HandshakePolicy {
    path: String,
    allowed_origins: Vec<String>,
}

impl HandshakePolicy {
    pub fn new(path: impl Into<String>, allowed_origins: Vec<String>) -> Self {
        Self {
            path: path.into(),
            allowed_origins,
        }
    }

    pub fn from_settings(settings: &ServerSettings) -> Self {
        Self::new(settings.path.clone(), settings.allowed_origins.clone())
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// `*` allows any origin; otherwise scheme, host and port must match an
    /// entry (case-insensitive, trailing `/` ignored).
    pub fn origin_allowed(&self, origin: &str) -> bool {
        let origin = origin.trim_end_matches('/');
        self.allowed_origins.iter().any(|allowed| {
            allowed == "*" || allowed.trim_end_matches('/').eq_ignore_ascii_case(origin)
        })
    }

    /// Validates an upgrade request. `has_capacity` is whether the registry
    /// can take one more connection.
    pub fn check(&self, request: &Request, has_capacity: bool) -> Result<(), HandshakeRejection> {
        if request.uri().path() != self.path {
            return Err(HandshakeRejection::new(
                StatusCode::NOT_FOUND,
                format!("no endpoint at '{}'", request.uri().path()),
            ));
        }

        let origin = request
            .headers()
            .get(header::ORIGIN)
            .and_then(|value| value.to_str().ok());
        match origin {
            Some(origin) if self.origin_allowed(origin) => {}
            Some(origin) => {
                return Err(HandshakeRejection::new(
                    StatusCode::FORBIDDEN,
                    format!("origin '{origin}' is not allowed"),
                ));
            }
            None => {
                return Err(HandshakeRejection::new(
                    StatusCode::FORBIDDEN,
                    "missing Origin header",
                ));
            }
        }

        if !has_capacity {
            return Err(HandshakeRejection::new(
                StatusCode::SERVICE_UNAVAILABLE,
                "connection limit reached",
            ));
        }
        Ok(())
    }
}

/// The STOMP sub-protocol to echo back, taking the client's order.
pub fn negotiate_subprotocol(request: &Request) -> Option<HeaderValue> {
    request
        .headers()
        .get_all(header::SEC_WEBSOCKET_PROTOCOL)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .map(str::trim)
        .find_map(|offered| {
            STOMP_SUBPROTOCOLS
                .iter()
                .find(|supported| supported.eq_ignore_ascii_case(offered))
                .map(|supported| HeaderValue::from_static(*supported))
        })
}
