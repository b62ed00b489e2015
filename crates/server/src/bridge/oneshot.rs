//! One-shot execution: spawn, collect, terminate.
//!
//! The subprocess gets the prompt as an argument, streams its finite
//! event sequence, and is reaped as soon as stdout closes. If the
//! stream never carried a terminal event, one is synthesized from the
//! exit status; if the request timeout fires first, the child is
//! killed and the turn ends with a terminal error.

use std::process::Stdio;
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use relay_protocol::Event;

use super::codec::{decode_line, LineDecoder};
use super::process::{terminal_from_exit, SpawnSpec};
use super::BridgeError;
use crate::clock;

/// Spawn a one-shot run and stream its events.
pub fn run_one_shot(
    session_id: String,
    seq_start: u64,
    spec: &SpawnSpec,
    prompt: &str,
    timeout: Duration,
) -> Result<mpsc::Receiver<Event>, BridgeError> {
    let mut cmd = tokio::process::Command::new(&spec.bin);
    cmd.args(spec.args(false))
        .arg("--print")
        .arg(prompt)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true);
    if let Some(dir) = &spec.working_dir {
        cmd.current_dir(dir);
    }

    let mut child = cmd
        .spawn()
        .map_err(|e| BridgeError::Spawn(format!("{}: {}", spec.bin, e)))?;

    info!(
        component = "bridge",
        event = "bridge.one_shot_spawned",
        session_id = %session_id,
        bin = %spec.bin,
        "Spawned one-shot agent run"
    );

    let mut stdout = child
        .stdout
        .take()
        .ok_or_else(|| BridgeError::Spawn("no stdout on child".into()))?;

    let (tx, rx) = mpsc::channel(256);

    tokio::spawn(async move {
        let mut seq = seq_start;
        let mut decoder = LineDecoder::new();
        let mut chunk = [0u8; 8192];
        let mut saw_terminal = false;
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            let read = tokio::time::timeout_at(deadline, stdout.read(&mut chunk)).await;
            match read {
                Ok(Ok(0)) => break,
                Ok(Ok(n)) => {
                    for line in decoder.push(&chunk[..n]) {
                        emit(&session_id, &line, &mut seq, &mut saw_terminal, &tx).await;
                    }
                }
                Ok(Err(e)) => {
                    warn!(
                        component = "bridge",
                        event = "bridge.one_shot_read_error",
                        session_id = %session_id,
                        error = %e,
                        "One-shot stdout read failed"
                    );
                    break;
                }
                Err(_) => {
                    warn!(
                        component = "bridge",
                        event = "bridge.one_shot_timeout",
                        session_id = %session_id,
                        timeout_secs = timeout.as_secs(),
                        "One-shot run exceeded request timeout, killing"
                    );
                    let _ = child.kill().await;
                    let event = Event::terminal_error(
                        session_id.clone(),
                        seq,
                        clock::now_iso(),
                        "request timeout exceeded",
                        None,
                    );
                    let _ = tx.send(event).await;
                    return;
                }
            }
        }

        if let Some(line) = decoder.finish() {
            emit(&session_id, &line, &mut seq, &mut saw_terminal, &tx).await;
        }

        let exit_code = child.wait().await.ok().and_then(|s| s.code());
        debug!(
            component = "bridge",
            event = "bridge.one_shot_exited",
            session_id = %session_id,
            exit_code = ?exit_code,
            saw_terminal = saw_terminal,
            "One-shot run finished"
        );

        if !saw_terminal {
            let event = terminal_from_exit(&session_id, seq, exit_code);
            let _ = tx.send(event).await;
        }
    });

    Ok(rx)
}

async fn emit(
    session_id: &str,
    line: &str,
    seq: &mut u64,
    saw_terminal: &mut bool,
    tx: &mpsc::Sender<Event>,
) {
    for payload in decode_line(line) {
        let event = Event::new(session_id, *seq, clock::now_iso(), payload);
        *seq += 1;
        if event.is_terminal() {
            *saw_terminal = true;
        }
        if tx.send(event).await.is_err() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_protocol::{EventPayload, TerminalOutcome};
    use std::io::Write;
    use std::os::unix::fs::PermissionsExt;

    fn spec(bin: &str) -> SpawnSpec {
        SpawnSpec {
            bin: bin.to_string(),
            working_dir: None,
            allowed_tools: vec![],
            denied_patterns: vec![],
            permission_mode: None,
            system_prompt: None,
            max_turns: None,
        }
    }

    fn stub_agent(dir: &std::path::Path, body: &str) -> String {
        let path = dir.join("agent.sh");
        let mut f = std::fs::File::create(&path).expect("create");
        writeln!(f, "#!/bin/sh").expect("write");
        f.write_all(body.as_bytes()).expect("write");
        drop(f);
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).expect("chmod");
        path.to_string_lossy().to_string()
    }

    #[tokio::test]
    async fn collects_events_then_terminal() {
        let dir = tempfile::tempdir().expect("tempdir");
        let bin = stub_agent(
            dir.path(),
            r#"echo '{"type":"assistant","message":{"content":[{"type":"text","text":"hi"}]}}'
echo '{"type":"result","subtype":"success","duration_ms":1,"num_turns":1}'
"#,
        );

        let mut rx = run_one_shot(
            "os1".to_string(),
            0,
            &spec(&bin),
            "prompt",
            Duration::from_secs(10),
        )
        .expect("spawn");

        let first = rx.recv().await.expect("event");
        assert!(matches!(first.payload, EventPayload::AssistantText { .. }));
        let terminal = rx.recv().await.expect("terminal");
        assert!(terminal.is_terminal());
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn missing_terminal_is_synthesized_from_exit_status() {
        let dir = tempfile::tempdir().expect("tempdir");
        let bin = stub_agent(dir.path(), "exit 0\n");

        let mut rx = run_one_shot(
            "os2".to_string(),
            4,
            &spec(&bin),
            "prompt",
            Duration::from_secs(10),
        )
        .expect("spawn");

        let terminal = rx.recv().await.expect("synthesized terminal");
        assert_eq!(terminal.seq, 4);
        match terminal.payload {
            EventPayload::Result { outcome, .. } => {
                assert_eq!(outcome, TerminalOutcome::Success)
            }
            other => panic!("unexpected payload {:?}", other),
        }
    }

    #[tokio::test]
    async fn timeout_kills_and_reports_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let bin = stub_agent(dir.path(), "sleep 30\n");

        let mut rx = run_one_shot(
            "os3".to_string(),
            0,
            &spec(&bin),
            "prompt",
            Duration::from_millis(200),
        )
        .expect("spawn");

        let terminal = rx.recv().await.expect("terminal");
        match terminal.payload {
            EventPayload::Result { outcome, error, .. } => {
                assert_eq!(outcome, TerminalOutcome::Error);
                assert!(error.unwrap_or_default().contains("timeout"));
            }
            other => panic!("unexpected payload {:?}", other),
        }
    }
}
