//! STOMP frame codec
//!
//! A frame on the wire is
//!
//! ```text
//! COMMAND
//! header1:value1
//! header2:value2
//!
//! body^@
//! ```
//!
//! where `^@` is a NUL byte. Lines may end in `\n` or `\r\n`. Bare EOLs
//! between frames are heart-beats and are skipped. When a `content-length`
//! header is present it decides where the body ends; otherwise the body runs
//! to the first NUL. Header names and values are escaped (`\n`, `\r`, `\c`,
//! `\\`) except in `CONNECT` and `CONNECTED` frames.

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("frame is not valid UTF-8")]
    NotUtf8,

    #[error("frame is not terminated")]
    Unterminated,

    #[error("malformed header line '{0}'")]
    MalformedHeader(String),

    #[error("invalid escape sequence in header '{0}'")]
    InvalidEscape(String),

    #[error("invalid content-length '{0}'")]
    InvalidContentLength(String),

    #[error("unsupported command '{0}'")]
    UnknownCommand(String),

    #[error("{command} frame is missing the '{header}' header")]
    MissingHeader {
        command: &'static str,
        header: &'static str,
    },

    #[error("invalid message payload: {0}")]
    InvalidPayload(String),

    #[error("unsupported protocol version(s) '{0}'")]
    UnsupportedVersion(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub command: String,
    pub headers: Vec<(String, String)>,
    pub body: String,
}

impl Frame {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            headers: Vec::new(),
            body: String::new(),
        }
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = body.into();
        self
    }

    /// Value of the first header called `name`; repeated headers keep the
    /// first occurrence.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    fn escapes_headers(&self) -> bool {
        !matches!(self.command.as_str(), "CONNECT" | "CONNECTED")
    }

    /// Serializes the frame, adding `content-length` for non-empty bodies.
    pub fn encode(&self) -> String {
        let escape = self.escapes_headers();
        let mut out = String::with_capacity(self.command.len() + self.body.len() + 64);
        out.push_str(&self.command);
        out.push('\n');

        let mut has_length = false;
        for (name, value) in &self.headers {
            has_length |= name == "content-length";
            if escape {
                out.push_str(&escape_header(name));
                out.push(':');
                out.push_str(&escape_header(value));
            } else {
                out.push_str(name);
                out.push(':');
                out.push_str(value);
            }
            out.push('\n');
        }
        if !has_length && !self.body.is_empty() {
            out.push_str(&format!("content-length:{}\n", self.body.len()));
        }

        out.push('\n');
        out.push_str(&self.body);
        out.push('\0');
        out
    }

    /// Parses every frame contained in `input`.
    pub fn decode_all(input: &str) -> Result<Vec<Frame>, DecodeError> {
        let mut frames = Vec::new();
        let mut rest = input;

        loop {
            rest = rest.trim_start_matches(['\r', '\n']);
            if rest.is_empty() {
                return Ok(frames);
            }
            let (frame, remainder) = decode_one(rest)?;
            frames.push(frame);
            rest = remainder;
        }
    }
}

fn decode_one(input: &str) -> Result<(Frame, &str), DecodeError> {
    let (command, mut cursor) = split_line(input).ok_or(DecodeError::Unterminated)?;
    let escape = !matches!(command, "CONNECT" | "CONNECTED");

    let mut headers = Vec::new();
    loop {
        let (line, next) = split_line(cursor).ok_or(DecodeError::Unterminated)?;
        cursor = next;
        if line.is_empty() {
            break;
        }
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| DecodeError::MalformedHeader(line.to_string()))?;
        if escape {
            headers.push((unescape_header(name)?, unescape_header(value)?));
        } else {
            headers.push((name.to_string(), value.to_string()));
        }
    }

    let content_length = headers
        .iter()
        .find(|(k, _)| k == "content-length")
        .map(|(_, v)| v.as_str());

    let (body, remainder) = match content_length {
        Some(raw) => {
            let len: usize = raw
                .trim()
                .parse()
                .map_err(|_| DecodeError::InvalidContentLength(raw.to_string()))?;
            if cursor.len() <= len {
                return Err(DecodeError::Unterminated);
            }
            if !cursor.is_char_boundary(len) {
                return Err(DecodeError::InvalidContentLength(raw.to_string()));
            }
            if cursor.as_bytes()[len] != 0 {
                return Err(DecodeError::Unterminated);
            }
            (&cursor[..len], &cursor[len + 1..])
        }
        None => {
            let end = cursor.find('\0').ok_or(DecodeError::Unterminated)?;
            (&cursor[..end], &cursor[end + 1..])
        }
    };

    let frame = Frame {
        command: command.to_string(),
        headers,
        body: body.to_string(),
    };
    Ok((frame, remainder))
}

/// Splits off one line, accepting `\n` and `\r\n` endings.
fn split_line(input: &str) -> Option<(&str, &str)> {
    let end = input.find('\n')?;
    let line = &input[..end];
    Some((line.strip_suffix('\r').unwrap_or(line), &input[end + 1..]))
}

fn escape_header(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            ':' => out.push_str("\\c"),
            other => out.push(other),
        }
    }
    out
}

fn unescape_header(raw: &str) -> Result<String, DecodeError> {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some('c') => out.push(':'),
            Some('\\') => out.push('\\'),
            _ => return Err(DecodeError::InvalidEscape(raw.to_string())),
        }
    }
    Ok(out)
}
