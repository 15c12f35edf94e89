//! Destination routing
//!
//! Maps the application destination of a SEND to the topic it is broadcast
//! on. Routes are plain data (usually from configuration):
//!
//! ```text
//! /app/sendMessage               -> /topic/messages
//! /app/room/{roomId}/sendMessage -> /topic/room/{roomId}
//! ```
//!
//! A `{name}` segment in the destination matches exactly one non-empty path
//! segment and can be reused in the topic template. Routes are tried in
//! order; the first match wins. When no route matches and a broker prefix is
//! configured, a destination under that prefix is taken as the topic itself.

use std::collections::HashMap;

use crate::config::{HubSettings, RouteSettings};
use crate::utils::HubError;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Var(String),
}

#[derive(Debug, Clone)]
pub struct Route {
    destination: String,
    topic: String,
    pattern: Vec<Segment>,
    template: Vec<Segment>,
}

impl Route {
    pub fn new(destination: &str, topic: &str) -> Result<Self, HubError> {
        let pattern = parse_path(destination)?;
        let template = parse_path(topic)?;

        let mut bound = Vec::new();
        for segment in &pattern {
            if let Segment::Var(name) = segment {
                if bound.contains(name) {
                    return Err(invalid(destination, format!("variable '{name}' used twice")));
                }
                bound.push(name.clone());
            }
        }
        for segment in &template {
            if let Segment::Var(name) = segment {
                if !bound.contains(name) {
                    return Err(invalid(
                        topic,
                        format!("variable '{name}' is not bound by '{destination}'"),
                    ));
                }
            }
        }

        Ok(Self {
            destination: destination.to_string(),
            topic: topic.to_string(),
            pattern,
            template,
        })
    }

    pub fn destination(&self) -> &str {
        &self.destination
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// The topic for `destination`, or `None` if this route does not match.
    pub fn resolve(&self, destination: &str) -> Option<String> {
        let parts: Vec<&str> = destination.strip_prefix('/')?.split('/').collect();
        if parts.len() != self.pattern.len() {
            return None;
        }

        let mut vars = HashMap::new();
        for (segment, part) in self.pattern.iter().zip(parts) {
            match segment {
                Segment::Literal(literal) if literal == part => {}
                Segment::Var(name) if !part.is_empty() => {
                    vars.insert(name.as_str(), part);
                }
                _ => return None,
            }
        }

        let mut topic = String::new();
        for segment in &self.template {
            topic.push('/');
            match segment {
                Segment::Literal(literal) => topic.push_str(literal),
                Segment::Var(name) => topic.push_str(vars.get(name.as_str())?),
            }
        }
        Some(topic)
    }
}

fn invalid(pattern: &str, reason: impl Into<String>) -> HubError {
    HubError::InvalidRoute {
        pattern: pattern.to_string(),
        reason: reason.into(),
    }
}

fn parse_path(path: &str) -> Result<Vec<Segment>, HubError> {
    let rest = path
        .strip_prefix('/')
        .ok_or_else(|| invalid(path, "must start with '/'"))?;

    rest.split('/')
        .map(|part| {
            if part.is_empty() {
                return Err(invalid(path, "empty path segment"));
            }
            match part.strip_prefix('{').and_then(|p| p.strip_suffix('}')) {
                Some(name) if !name.is_empty() && !name.contains(['{', '}']) => {
                    Ok(Segment::Var(name.to_string()))
                }
                Some(_) => Err(invalid(path, format!("bad variable segment '{part}'"))),
                None if part.contains(['{', '}']) => {
                    Err(invalid(path, format!("bad variable segment '{part}'")))
                }
                None => Ok(Segment::Literal(part.to_string())),
            }
        })
        .collect()
}

#[derive(Debug, Clone)]
pub struct Router {
    routes: Vec<Route>,
    broker_prefix: Option<String>,
}

impl Router {
    pub fn new(routes: &[RouteSettings], broker_prefix: Option<String>) -> Result<Self, HubError> {
        let routes = routes
            .iter()
            .map(|r| Route::new(&r.destination, &r.topic))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            routes,
            broker_prefix,
        })
    }

    pub fn from_settings(settings: &HubSettings) -> Result<Self, HubError> {
        Self::new(&settings.routes, settings.broker_prefix.clone())
    }

    pub fn routes(&self) -> &[Route] {
        &self.routes
    }

    pub fn resolve(&self, destination: &str) -> Option<String> {
        if let Some(topic) = self.routes.iter().find_map(|r| r.resolve(destination)) {
            return Some(topic);
        }

        match &self.broker_prefix {
            Some(prefix) if destination.len() > prefix.len() && destination.starts_with(prefix) => {
                Some(destination.to_string())
            }
            _ => None,
        }
    }
}

impl Default for Router {
    /// `/app/sendMessage -> /topic/messages`, broker prefix `/topic/`.
    fn default() -> Self {
        let literal = |s: &str| Segment::Literal(s.to_string());
        Self {
            routes: vec![Route {
                destination: "/app/sendMessage".to_string(),
                topic: "/topic/messages".to_string(),
                pattern: vec![literal("app"), literal("sendMessage")],
                template: vec![literal("topic"), literal("messages")],
            }],
            broker_prefix: Some("/topic/".to_string()),
        }
    }
}
