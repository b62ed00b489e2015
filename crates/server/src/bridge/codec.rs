//! Wire codec for the agent CLI's NDJSON stdout protocol.
//!
//! The subprocess writes one JSON object per line, but pipe reads
//! arrive in arbitrary chunks. `LineDecoder` buffers partial lines
//! across reads; `decode_line` maps a complete line to event payloads,
//! degrading anything unparseable to a plain-text `Log` payload
//! instead of dropping it.

use serde_json::Value;
use tracing::debug;

use relay_protocol::{EventPayload, RunStats, TerminalOutcome};

/// Accumulates raw pipe chunks and yields complete lines.
#[derive(Debug, Default)]
pub struct LineDecoder {
    buf: Vec<u8>,
}

impl LineDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk; returns every complete line it closed off. The
    /// trailing partial line stays buffered for the next read.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buf.extend_from_slice(chunk);

        let mut lines = Vec::new();
        while let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
            let raw: Vec<u8> = self.buf.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&raw[..raw.len() - 1]);
            let line = line.trim();
            if !line.is_empty() {
                lines.push(line.to_string());
            }
        }
        lines
    }

    /// Flush whatever is left at EOF (a final line with no newline).
    pub fn finish(&mut self) -> Option<String> {
        if self.buf.is_empty() {
            return None;
        }
        let raw = std::mem::take(&mut self.buf);
        let line = String::from_utf8_lossy(&raw).trim().to_string();
        if line.is_empty() {
            None
        } else {
            Some(line)
        }
    }
}

/// Decode one protocol line into zero or more event payloads.
pub fn decode_line(line: &str) -> Vec<EventPayload> {
    let raw: Value = match serde_json::from_str(line) {
        Ok(v) => v,
        Err(_) => {
            // Not protocol output; surface it rather than lose it
            return vec![EventPayload::Log {
                line: line.to_string(),
            }];
        }
    };

    let msg_type = raw.get("type").and_then(|v| v.as_str()).unwrap_or("");
    match msg_type {
        "system" => decode_system(&raw),
        "assistant" => decode_assistant(&raw),
        "user" => decode_tool_results(&raw),
        "result" => vec![decode_result(&raw)],
        "keep_alive" => vec![EventPayload::KeepAlive],
        other => {
            debug!(
                component = "bridge",
                event = "codec.unknown_type",
                msg_type = %other,
                "Ignoring unknown protocol line type"
            );
            vec![]
        }
    }
}

fn decode_system(raw: &Value) -> Vec<EventPayload> {
    let subtype = raw.get("subtype").and_then(|v| v.as_str()).unwrap_or("");
    if subtype != "init" {
        return vec![];
    }

    let model = raw
        .get("model")
        .and_then(|v| v.as_str())
        .map(String::from);
    let tools = raw
        .get("tools")
        .and_then(|v| v.as_array())
        .map(|arr| {
            arr.iter()
                .filter_map(|v| v.as_str().map(String::from))
                .collect()
        })
        .unwrap_or_default();

    vec![EventPayload::SystemInit { model, tools }]
}

fn decode_assistant(raw: &Value) -> Vec<EventPayload> {
    let Some(blocks) = raw
        .get("message")
        .and_then(|m| m.get("content"))
        .and_then(|c| c.as_array())
    else {
        return vec![];
    };

    let mut payloads = Vec::new();
    for block in blocks {
        match block.get("type").and_then(|v| v.as_str()).unwrap_or("") {
            "text" => {
                let text = block.get("text").and_then(|v| v.as_str()).unwrap_or("");
                if !text.is_empty() {
                    payloads.push(EventPayload::AssistantText {
                        text: text.to_string(),
                    });
                }
            }
            "tool_use" => {
                let tool_name = block
                    .get("name")
                    .and_then(|v| v.as_str())
                    .unwrap_or("unknown")
                    .to_string();
                let input = block.get("input").cloned().unwrap_or(Value::Null);
                payloads.push(EventPayload::ToolCall { tool_name, input });
            }
            _ => {}
        }
    }
    payloads
}

fn decode_tool_results(raw: &Value) -> Vec<EventPayload> {
    let Some(blocks) = raw
        .get("message")
        .and_then(|m| m.get("content"))
        .and_then(|c| c.as_array())
    else {
        return vec![];
    };

    blocks
        .iter()
        .filter(|b| b.get("type").and_then(|v| v.as_str()) == Some("tool_result"))
        .map(|block| {
            let output = match block.get("content") {
                Some(Value::String(s)) => s.clone(),
                Some(v) => v.to_string(),
                None => String::new(),
            };
            let is_error = block
                .get("is_error")
                .and_then(|v| v.as_bool())
                .unwrap_or(false);
            EventPayload::ToolResult { output, is_error }
        })
        .collect()
}

fn decode_result(raw: &Value) -> EventPayload {
    let subtype = raw.get("subtype").and_then(|v| v.as_str()).unwrap_or("");
    let is_error = raw
        .get("is_error")
        .and_then(|v| v.as_bool())
        .unwrap_or(false)
        || subtype.starts_with("error");

    let stats = Some(RunStats {
        duration_ms: raw.get("duration_ms").and_then(|v| v.as_u64()).unwrap_or(0),
        num_turns: raw.get("num_turns").and_then(|v| v.as_u64()).unwrap_or(0) as u32,
        input_tokens: raw
            .get("usage")
            .and_then(|u| u.get("input_tokens"))
            .and_then(|v| v.as_u64()),
        output_tokens: raw
            .get("usage")
            .and_then(|u| u.get("output_tokens"))
            .and_then(|v| v.as_u64()),
    });

    EventPayload::Result {
        outcome: if is_error {
            TerminalOutcome::Error
        } else {
            TerminalOutcome::Success
        },
        exit_code: None,
        error: if is_error {
            Some(
                raw.get("result")
                    .and_then(|v| v.as_str())
                    .unwrap_or(subtype)
                    .to_string(),
            )
        } else {
            None
        },
        stats,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_lines_buffer_across_reads() {
        let mut dec = LineDecoder::new();
        assert!(dec.push(b"{\"type\":\"keep").is_empty());
        let lines = dec.push(b"_alive\"}\n{\"type\":");
        assert_eq!(lines, vec!["{\"type\":\"keep_alive\"}"]);
        let lines = dec.push(b"\"x\"}\n");
        assert_eq!(lines, vec!["{\"type\":\"x\"}"]);
        assert!(dec.finish().is_none());
    }

    #[test]
    fn finish_flushes_unterminated_line() {
        let mut dec = LineDecoder::new();
        assert!(dec.push(b"tail without newline").is_empty());
        assert_eq!(dec.finish().as_deref(), Some("tail without newline"));
    }

    #[test]
    fn malformed_json_degrades_to_log() {
        let payloads = decode_line("panic: something went wrong");
        assert_eq!(payloads.len(), 1);
        match &payloads[0] {
            EventPayload::Log { line } => assert_eq!(line, "panic: something went wrong"),
            other => panic!("expected log, got {:?}", other),
        }
    }

    #[test]
    fn assistant_blocks_decode_in_order() {
        let line = r#"{"type":"assistant","message":{"content":[
            {"type":"text","text":"running it"},
            {"type":"tool_use","name":"Bash","input":{"command":"ls"}}
        ]}}"#;
        let payloads = decode_line(line);
        assert_eq!(payloads.len(), 2);
        assert!(matches!(payloads[0], EventPayload::AssistantText { .. }));
        match &payloads[1] {
            EventPayload::ToolCall { tool_name, input } => {
                assert_eq!(tool_name, "Bash");
                assert_eq!(input["command"], "ls");
            }
            other => panic!("expected tool call, got {:?}", other),
        }
    }

    #[test]
    fn result_line_carries_outcome_and_stats() {
        let line = r#"{"type":"result","subtype":"success","duration_ms":1500,
            "num_turns":2,"usage":{"input_tokens":10,"output_tokens":42}}"#;
        let payloads = decode_line(line);
        match &payloads[0] {
            EventPayload::Result { outcome, stats, .. } => {
                assert_eq!(*outcome, TerminalOutcome::Success);
                let stats = stats.as_ref().expect("stats");
                assert_eq!(stats.duration_ms, 1500);
                assert_eq!(stats.output_tokens, Some(42));
            }
            other => panic!("expected result, got {:?}", other),
        }
    }

    #[test]
    fn error_result_is_terminal_error() {
        let line = r#"{"type":"result","subtype":"error_max_turns","is_error":true}"#;
        match &decode_line(line)[0] {
            EventPayload::Result { outcome, error, .. } => {
                assert_eq!(*outcome, TerminalOutcome::Error);
                assert!(error.is_some());
            }
            other => panic!("expected result, got {:?}", other),
        }
    }

    #[test]
    fn unknown_valid_type_produces_nothing() {
        assert!(decode_line(r#"{"type":"tool_progress"}"#).is_empty());
    }
}
