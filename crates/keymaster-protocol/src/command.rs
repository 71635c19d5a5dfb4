//! Structured command layer carried over the opaque line transport
//!
//! Requests and responses are single lines:
//!
//! ```text
//! CMD:<name>[:<json-payload>]     request
//! RSP:<name>:<json-payload>       response with data
//! ACK:<name>:<id>                 acknowledgement
//! ERR:<name>:<message>            failure reported by the peer
//! ```
//!
//! Nothing below this layer interprets these prefixes; the bridge and the
//! correlator only move lines.

use serde_json::Value;
use std::fmt;

use crate::error::{ProtocolError, Result};

/// Request prefix
pub const CMD_PREFIX: &str = "CMD:";
/// Data response prefix
pub const RSP_PREFIX: &str = "RSP:";
/// Acknowledgement prefix
pub const ACK_PREFIX: &str = "ACK:";
/// Error response prefix
pub const ERR_PREFIX: &str = "ERR:";

/// A request line
#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    name: String,
    payload: Option<Value>,
}

impl Command {
    /// Create a command without payload
    pub fn new(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        if name.is_empty() || name.contains([':', '\n', '\r']) {
            return Err(ProtocolError::InvalidCommandName(name));
        }
        Ok(Self {
            name,
            payload: None,
        })
    }

    /// Attach a payload
    ///
    /// String payloads are sent verbatim, anything else as compact JSON.
    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = Some(payload);
        self
    }

    /// Command name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Payload, if any
    pub fn payload(&self) -> Option<&Value> {
        self.payload.as_ref()
    }

    /// Encode as a request line, without terminator
    pub fn encode(&self) -> String {
        match &self.payload {
            None => format!("{}{}", CMD_PREFIX, self.name),
            Some(Value::String(text)) => format!("{}{}:{}", CMD_PREFIX, self.name, text),
            Some(value) => format!("{}{}:{}", CMD_PREFIX, self.name, value),
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}

/// A parsed response
#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    /// `ACK:<name>:<id>`
    Ack {
        /// Acknowledged command
        command: String,
        /// Identifier assigned by the peer
        id: String,
    },
    /// `RSP:<name>:<payload>`; non-JSON payloads become a JSON string
    Rsp {
        /// Answered command
        command: String,
        /// Payload
        data: Value,
    },
    /// `ERR:<name>:<message>`
    Err {
        /// Failed command
        command: String,
        /// Error text from the peer
        message: String,
    },
    /// No recognized prefix; all lines joined with newlines
    Raw(String),
}

impl Response {
    /// Interpret the lines collected for one request
    ///
    /// The first line with a recognized prefix decides the response.
    /// Returns `None` for an empty collection (no response).
    pub fn parse<S: AsRef<str>>(lines: &[S]) -> Option<Self> {
        if lines.is_empty() {
            return None;
        }

        for line in lines {
            let line = line.as_ref();
            if let Some(rest) = line.strip_prefix(ACK_PREFIX) {
                let (command, id) = split_field(rest);
                return Some(Response::Ack { command, id });
            }
            if let Some(rest) = line.strip_prefix(RSP_PREFIX) {
                let (command, text) = split_field(rest);
                let data = serde_json::from_str(&text).unwrap_or(Value::String(text));
                return Some(Response::Rsp { command, data });
            }
            if let Some(rest) = line.strip_prefix(ERR_PREFIX) {
                let (command, message) = split_field(rest);
                return Some(Response::Err { command, message });
            }
        }

        let raw: Vec<&str> = lines.iter().map(AsRef::as_ref).collect();
        Some(Response::Raw(raw.join("\n")))
    }

    /// Whether the peer reported a failure
    pub fn is_error(&self) -> bool {
        matches!(self, Response::Err { .. })
    }
}

impl fmt::Display for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Response::Ack { id, .. } => write!(f, "ACK (id: {})", id),
            Response::Rsp { data, .. } => match data {
                Value::String(text) => f.write_str(text),
                Value::Object(_) | Value::Array(_) => {
                    let pretty = serde_json::to_string_pretty(data).map_err(|_| fmt::Error)?;
                    f.write_str(&pretty)
                }
                other => write!(f, "{}", other),
            },
            Response::Err { message, .. } => write!(f, "Error from Core: {}", message),
            Response::Raw(text) => f.write_str(text),
        }
    }
}

fn split_field(rest: &str) -> (String, String) {
    match rest.split_once(':') {
        Some((head, tail)) => (head.to_string(), tail.to_string()),
        None => (rest.to_string(), String::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_encode_without_payload() {
        assert_eq!(Command::new("ping").unwrap().encode(), "CMD:ping");
    }

    #[test]
    fn test_encode_json_payload() {
        let cmd = Command::new("note")
            .unwrap()
            .with_payload(json!({"content": "hi"}));
        assert_eq!(cmd.encode(), r#"CMD:note:{"content":"hi"}"#);
    }

    #[test]
    fn test_encode_string_payload_verbatim() {
        let cmd = Command::new("echo").unwrap().with_payload(json!("a b"));
        assert_eq!(cmd.to_string(), "CMD:echo:a b");
    }

    #[test]
    fn test_invalid_names() {
        assert!(Command::new("").is_err());
        assert!(Command::new("a:b").is_err());
        assert!(Command::new("a\nb").is_err());
    }

    #[test]
    fn test_parse_empty() {
        let lines: Vec<String> = Vec::new();
        assert_eq!(Response::parse(&lines), None);
    }

    #[test]
    fn test_parse_rsp_json() {
        let resp = Response::parse(&[r#"RSP:status:{"uptime":12}"#]).unwrap();
        assert_eq!(
            resp,
            Response::Rsp {
                command: "status".into(),
                data: json!({"uptime": 12})
            }
        );
    }

    #[test]
    fn test_parse_rsp_text() {
        let resp = Response::parse(&["RSP:ping:pong"]).unwrap();
        assert_eq!(resp.to_string(), "pong");
    }

    #[test]
    fn test_parse_first_recognized_wins() {
        let resp = Response::parse(&["noise", "ACK:note:42", "ERR:note:late"]).unwrap();
        assert_eq!(
            resp,
            Response::Ack {
                command: "note".into(),
                id: "42".into()
            }
        );
        assert_eq!(resp.to_string(), "ACK (id: 42)");
    }

    #[test]
    fn test_parse_err() {
        let resp = Response::parse(&["ERR:query:no such table: x"]).unwrap();
        assert!(resp.is_error());
        assert_eq!(resp.to_string(), "Error from Core: no such table: x");
    }

    #[test]
    fn test_parse_raw() {
        let resp = Response::parse(&["Echo: hi", "second"]).unwrap();
        assert_eq!(resp, Response::Raw("Echo: hi\nsecond".into()));
    }
}
