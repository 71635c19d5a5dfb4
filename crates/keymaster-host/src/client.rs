//! Structured commands over the correlator
//!
//! Each method encodes a `CMD:` line, waits for the answer and parses it
//! into a [`Response`]. `Ok(None)` means the device stayed silent until the
//! timeout.

use keymaster_protocol::{Command, Response};
use serde::Serialize;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::debug;

use crate::correlator::Correlator;
use crate::error::Result;

/// Default note type; omitted from the payload
pub const DEFAULT_NOTE_TYPE: &str = "note";

/// A note to store on the companion
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Note {
    /// Note text
    pub content: String,
    /// Comma-separated tags
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tags: Option<String>,
    /// Project tag
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project: Option<String>,
    /// Note type (decision, bug, reminder, idea, todo, context)
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
}

impl Note {
    /// A plain note
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            tags: None,
            project: None,
            kind: None,
        }
    }

    /// Set tags; empty means none
    pub fn tags(mut self, tags: impl Into<String>) -> Self {
        self.tags = non_empty(tags.into());
        self
    }

    /// Set the project; empty means none
    pub fn project(mut self, project: impl Into<String>) -> Self {
        self.project = non_empty(project.into());
        self
    }

    /// Set the type; the default type is left out
    pub fn kind(mut self, kind: impl Into<String>) -> Self {
        self.kind = non_empty(kind.into()).filter(|k| k != DEFAULT_NOTE_TYPE);
        self
    }
}

/// What the user is working on
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Activity {
    /// Program name
    pub program: String,
    /// Free-form description
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
    /// File being worked on
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_path: Option<String>,
    /// Project tag
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project: Option<String>,
}

impl Activity {
    /// Activity in `program`
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            details: None,
            file_path: None,
            project: None,
        }
    }

    /// Set details
    pub fn details(mut self, details: impl Into<String>) -> Self {
        self.details = non_empty(details.into());
        self
    }

    /// Set the file path
    pub fn file_path(mut self, path: impl Into<String>) -> Self {
        self.file_path = non_empty(path.into());
        self
    }

    /// Set the project
    pub fn project(mut self, project: impl Into<String>) -> Self {
        self.project = non_empty(project.into());
        self
    }
}

/// A search or research query
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Search {
    /// Query text
    pub query: String,
    /// Search engine or source
    pub source: String,
    /// Result or search page
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// Project tag
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project: Option<String>,
}

impl Search {
    /// A web search
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            source: "web".into(),
            url: None,
            project: None,
        }
    }

    /// Set the source
    pub fn source(mut self, source: impl Into<String>) -> Self {
        self.source = source.into();
        self
    }

    /// Set the URL
    pub fn url(mut self, url: impl Into<String>) -> Self {
        self.url = non_empty(url.into());
        self
    }

    /// Set the project
    pub fn project(mut self, project: impl Into<String>) -> Self {
        self.project = non_empty(project.into());
        self
    }
}

/// Opens a session on the companion
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Session {
    /// Assistant platform name
    pub ai_platform: String,
    /// Machine the session runs on
    pub hostname: String,
    /// `<os> <arch>`
    pub os_info: String,
}

impl Session {
    /// Session for `ai_platform` on this machine
    pub fn new(ai_platform: impl Into<String>) -> Self {
        let machine = ComputerInfo::detect();
        Self {
            ai_platform: ai_platform.into(),
            hostname: machine.hostname,
            os_info: machine.os_info,
        }
    }
}

/// Closes a session with a summary
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionEnd {
    /// Id returned when the session started
    pub session_id: String,
    /// What was accomplished
    pub summary: String,
    /// Comma-separated project tags touched
    #[serde(skip_serializing_if = "Option::is_none")]
    pub projects: Option<String>,
}

impl SessionEnd {
    /// End `session_id`
    pub fn new(session_id: impl Into<String>, summary: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            summary: summary.into(),
            projects: None,
        }
    }

    /// Set the projects; empty means none
    pub fn projects(mut self, projects: impl Into<String>) -> Self {
        self.projects = non_empty(projects.into());
        self
    }
}

/// Machine registration payload
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ComputerInfo {
    /// Host name, `unknown` when it cannot be determined
    pub hostname: String,
    /// `<os> <arch>`
    pub os_info: String,
    /// CPU architecture
    pub platform: String,
}

impl ComputerInfo {
    /// Describe the local machine
    pub fn detect() -> Self {
        Self {
            hostname: local_hostname(),
            os_info: format!("{} {}", std::env::consts::OS, std::env::consts::ARCH),
            platform: std::env::consts::ARCH.to_string(),
        }
    }
}

fn local_hostname() -> String {
    ["HOSTNAME", "COMPUTERNAME"]
        .iter()
        .filter_map(|key| std::env::var(key).ok())
        .chain(std::fs::read_to_string("/etc/hostname").ok())
        .map(|name| name.trim().to_string())
        .find(|name| !name.is_empty())
        .unwrap_or_else(|| "unknown".into())
}

fn non_empty(value: String) -> Option<String> {
    if value.is_empty() {
        None
    } else {
        Some(value)
    }
}

/// Command client for the companion behind the bridge
#[derive(Debug, Clone)]
pub struct CommandClient {
    correlator: Correlator,
}

impl CommandClient {
    /// Client over `correlator`
    pub fn new(correlator: Correlator) -> Self {
        Self { correlator }
    }

    /// Underlying correlator
    pub fn correlator(&self) -> &Correlator {
        &self.correlator
    }

    /// Send a command and parse the answer
    pub fn request(&self, command: &Command, timeout: Option<Duration>) -> Result<Option<Response>> {
        let line = command.encode();
        debug!(command = command.name(), "Request");
        let lines = self.correlator.send_and_wait(&line, timeout, None)?;
        Ok(Response::parse(&lines))
    }

    /// Round-trip check; returns the raw reply lines
    pub fn ping(&self) -> Result<Vec<String>> {
        let command = Command::new("ping")?;
        self.correlator.send_and_wait(&command.encode(), None, None)
    }

    /// Companion status
    pub fn status(&self) -> Result<Option<Response>> {
        self.request(&Command::new("status")?, None)
    }

    /// Store a note
    pub fn note(&self, note: &Note) -> Result<Option<Response>> {
        self.send_json("note", note, None)
    }

    /// Log an activity
    pub fn activity(&self, activity: &Activity) -> Result<Option<Response>> {
        self.send_json("activity", activity, None)
    }

    /// Log a search
    pub fn search(&self, search: &Search) -> Result<Option<Response>> {
        self.send_json("search", search, None)
    }

    /// Start a session; the answer carries the session id
    pub fn session_start(&self, session: &Session) -> Result<Option<Response>> {
        self.send_json("session_start", session, None)
    }

    /// End a session
    pub fn session_end(&self, end: &SessionEnd) -> Result<Option<Response>> {
        self.send_json("session_end", end, None)
    }

    /// Register this machine
    pub fn register_computer(&self, computer: &ComputerInfo) -> Result<Option<Response>> {
        self.send_json("computer_reg", computer, None)
    }

    /// Session context; uses the long timeout
    pub fn get_context(&self) -> Result<Option<Response>> {
        let timeout = self.long_timeout();
        self.request(&Command::new("get_context")?, Some(timeout))
    }

    /// Query a table on the companion; uses the long timeout
    pub fn query(
        &self,
        table: &str,
        filters: Option<Value>,
        limit: u32,
        order_by: &str,
    ) -> Result<Option<Response>> {
        let mut payload = json!({ "table": table, "limit": limit, "order_by": order_by });
        if let (Some(filters), Some(map)) = (filters, payload.as_object_mut()) {
            map.insert("filters".into(), filters);
        }
        let command = Command::new("query")?.with_payload(payload);
        self.request(&command, Some(self.long_timeout()))
    }

    /// Send an arbitrary line and return the raw reply lines
    pub fn send_raw(&self, message: &str, timeout: Option<Duration>) -> Result<Vec<String>> {
        self.correlator.send_and_wait(message, timeout, None)
    }

    /// Lines received outside any request
    pub fn read_pending(&self) -> Vec<String> {
        self.correlator.transport().read_pending()
    }

    fn send_json<T: Serialize>(
        &self,
        name: &str,
        payload: &T,
        timeout: Option<Duration>,
    ) -> Result<Option<Response>> {
        let command = Command::new(name)?.with_payload(serde_json::to_value(payload)?);
        self.request(&command, timeout)
    }

    fn long_timeout(&self) -> Duration {
        self.correlator.transport().config().long_timeout
    }
}
