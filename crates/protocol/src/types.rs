//! Core types shared across the protocol

use serde::{Deserialize, Serialize};

/// How a session's backend is invoked
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// A long-lived subprocess kept alive across turns
    Persistent,
    /// A single spawn-collect-terminate invocation
    OneShot,
}

/// Session status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Active,
    Ended,
}

/// Role resolved from request identity. Higher tiers are strict
/// supersets of lower ones: Default ⊆ Viewer ⊆ Developer ⊆ Admin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Admin,
    Developer,
    Viewer,
    Default,
}

/// Structured outcome carried by every terminal event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminalOutcome {
    Success,
    Error,
}

/// Final run statistics reported with a terminal event
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunStats {
    pub duration_ms: u64,
    pub num_turns: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_tokens: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_tokens: Option<u64>,
}

/// Type-specific payload of a streamed event
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventPayload {
    /// First event of a backend run: model and tool inventory
    SystemInit {
        #[serde(skip_serializing_if = "Option::is_none")]
        model: Option<String>,
        #[serde(default)]
        tools: Vec<String>,
    },
    AssistantText {
        text: String,
    },
    ToolCall {
        tool_name: String,
        input: serde_json::Value,
    },
    ToolResult {
        output: String,
        is_error: bool,
    },
    /// Terminal event. Exactly one per run; carries a structured
    /// success/error subtype so clients never have to infer outcome
    /// from the HTTP status of an already-flowing stream.
    Result {
        outcome: TerminalOutcome,
        #[serde(skip_serializing_if = "Option::is_none")]
        exit_code: Option<i32>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        stats: Option<RunStats>,
    },
    /// Backend output that was not parseable as a protocol line
    Log {
        line: String,
    },
    KeepAlive,
}

/// One immutable unit of streamed output within a session.
///
/// `seq` is monotonically increasing within the session and never
/// reused; ordering is preserved end-to-end.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub session_id: String,
    pub seq: u64,
    pub timestamp: String,
    pub payload: EventPayload,
}

impl Event {
    pub fn new(
        session_id: impl Into<String>,
        seq: u64,
        timestamp: String,
        payload: EventPayload,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            seq,
            timestamp,
            payload,
        }
    }

    /// True for the end-of-stream marker
    pub fn is_terminal(&self) -> bool {
        matches!(self.payload, EventPayload::Result { .. })
    }

    /// Synthesize a terminal error event
    pub fn terminal_error(
        session_id: impl Into<String>,
        seq: u64,
        timestamp: String,
        message: impl Into<String>,
        exit_code: Option<i32>,
    ) -> Self {
        Self::new(
            session_id,
            seq,
            timestamp,
            EventPayload::Result {
                outcome: TerminalOutcome::Error,
                exit_code,
                error: Some(message.into()),
                stats: None,
            },
        )
    }
}

/// Summary of a session for list and fetch views
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSummary {
    pub id: String,
    pub mode: ExecutionMode,
    pub status: SessionStatus,
    pub role: Role,
    pub created_at: String,
    pub last_activity_at: String,
    /// Next unassigned sequence number (== number of events recorded)
    pub next_seq: u64,
}
