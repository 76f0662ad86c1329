//! STOMP frame representation.

use std::fmt;

use bytes::Bytes;

use crate::error::{ProtocolError, ProtocolResult};

/// Frame commands.
pub mod command {
    pub const CONNECT: &str = "CONNECT";
    pub const STOMP: &str = "STOMP";
    pub const CONNECTED: &str = "CONNECTED";
    pub const SEND: &str = "SEND";
    pub const SUBSCRIBE: &str = "SUBSCRIBE";
    pub const UNSUBSCRIBE: &str = "UNSUBSCRIBE";
    pub const ACK: &str = "ACK";
    pub const NACK: &str = "NACK";
    pub const BEGIN: &str = "BEGIN";
    pub const COMMIT: &str = "COMMIT";
    pub const ABORT: &str = "ABORT";
    pub const DISCONNECT: &str = "DISCONNECT";
    pub const MESSAGE: &str = "MESSAGE";
    pub const RECEIPT: &str = "RECEIPT";
    pub const ERROR: &str = "ERROR";
}

/// Header names.
pub mod header {
    pub const ACCEPT_VERSION: &str = "accept-version";
    pub const VERSION: &str = "version";
    pub const HEART_BEAT: &str = "heart-beat";
    pub const HOST: &str = "host";
    pub const LOGIN: &str = "login";
    pub const PASSCODE: &str = "passcode";
    pub const DESTINATION: &str = "destination";
    pub const CONTENT_TYPE: &str = "content-type";
    pub const CONTENT_LENGTH: &str = "content-length";
    pub const RECEIPT: &str = "receipt";
    pub const RECEIPT_ID: &str = "receipt-id";
    pub const ID: &str = "id";
    pub const ACK: &str = "ack";
    pub const SUBSCRIPTION: &str = "subscription";
    pub const MESSAGE_ID: &str = "message-id";
    pub const SESSION: &str = "session";
    pub const SERVER: &str = "server";
    pub const MESSAGE: &str = "message";
}

/// A STOMP frame: command, ordered headers and body.
///
/// Headers keep their wire order and duplicates. Lookups return the first
/// occurrence of a key; encoding writes every occurrence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StompFrame {
    command: String,
    headers: Vec<(String, String)>,
    body: Bytes,
}

impl StompFrame {
    /// Creates a frame with no headers and an empty body.
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            headers: Vec::new(),
            body: Bytes::new(),
        }
    }

    /// Builder: append a header.
    #[must_use]
    pub fn header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.push_header(key, value);
        self
    }

    /// Builder: set the body.
    #[must_use]
    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    /// Returns the command.
    pub fn command(&self) -> &str {
        &self.command
    }

    /// Returns true if the command equals `command`.
    pub fn is(&self, command: &str) -> bool {
        self.command == command
    }

    /// Appends a header, keeping any earlier occurrence of the same key.
    pub fn push_header(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.headers.push((key.into(), value.into()));
    }

    /// Returns the first value recorded for `key`.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Returns all headers in wire order.
    pub fn headers(&self) -> &[(String, String)] {
        &self.headers
    }

    /// Returns the body bytes.
    pub fn payload(&self) -> &Bytes {
        &self.body
    }

    /// Returns the body as UTF-8 text, lossily.
    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    /// Parses the `content-length` header, if present.
    pub fn content_length(&self) -> ProtocolResult<Option<usize>> {
        match self.get(header::CONTENT_LENGTH) {
            None => Ok(None),
            Some(value) => value.trim().parse().map(Some).map_err(|_| {
                ProtocolError::malformed(format!("invalid content-length {value:?}"))
            }),
        }
    }
}

impl fmt::Display for StompFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.command)?;
        for (key, value) in &self.headers {
            // never print credentials
            if key == header::PASSCODE {
                write!(f, " {key}:***")?;
            } else {
                write!(f, " {key}:{value}")?;
            }
        }
        write!(f, " Body ({} bytes)", self.body.len())
    }
}
