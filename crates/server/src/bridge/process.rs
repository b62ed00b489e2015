//! Persistent agent subprocess.
//!
//! One `AgentProcess` wraps one spawned CLI for the life of a session.
//! User turns are written as single JSON lines to stdin through a
//! dedicated writer task; stdout runs through the line decoder and
//! every decoded payload becomes an `Event` tagged with the session id
//! and a process-relative sequence number. Subprocess exit, for any
//! reason, synthesizes a terminal event so no turn ever ends silently.

use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use serde_json::json;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::Child;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error, info, warn};

use relay_protocol::{Event, EventPayload, TerminalOutcome};

use super::codec::{decode_line, LineDecoder};
use super::BridgeError;
use crate::clock;

/// Everything needed to spawn a backend subprocess for one session
#[derive(Debug, Clone)]
pub struct SpawnSpec {
    pub bin: String,
    pub working_dir: Option<String>,
    pub allowed_tools: Vec<String>,
    pub denied_patterns: Vec<String>,
    pub permission_mode: Option<String>,
    pub system_prompt: Option<String>,
    pub max_turns: Option<u32>,
}

impl SpawnSpec {
    pub(super) fn args(&self, persistent: bool) -> Vec<String> {
        let mut args = vec![
            "--output-format".to_string(),
            "stream-json".to_string(),
        ];
        if persistent {
            args.push("--input-format".to_string());
            args.push("stream-json".to_string());
        }
        if !self.allowed_tools.is_empty() {
            args.push("--allowed-tools".to_string());
            args.push(self.allowed_tools.join(","));
        }
        if !self.denied_patterns.is_empty() {
            args.push("--disallowed-tools".to_string());
            args.push(self.denied_patterns.join(","));
        }
        if let Some(mode) = &self.permission_mode {
            args.push("--permission-mode".to_string());
            args.push(mode.clone());
        }
        if let Some(prompt) = &self.system_prompt {
            args.push("--system-prompt".to_string());
            args.push(prompt.clone());
        }
        if let Some(turns) = self.max_turns {
            args.push("--max-turns".to_string());
            args.push(turns.to_string());
        }
        args
    }
}

pub struct AgentProcess {
    pub session_id: String,
    pid: i32,
    stdin_tx: mpsc::Sender<String>,
    child: Arc<Mutex<Child>>,
    alive: Arc<AtomicBool>,
    seq: Arc<AtomicU64>,
    last_activity: Arc<AtomicU64>,
    turn_tx: Arc<Mutex<Option<mpsc::Sender<Event>>>>,
}

impl AgentProcess {
    /// Spawn the subprocess and wire up its pipes. `seq_start` seeds
    /// the event counter so sequence numbers continue where the
    /// session's transcript left off.
    pub fn spawn(
        session_id: String,
        seq_start: u64,
        spec: &SpawnSpec,
    ) -> Result<Arc<Self>, BridgeError> {
        let mut cmd = tokio::process::Command::new(&spec.bin);
        cmd.args(spec.args(true))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &spec.working_dir {
            cmd.current_dir(dir);
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| BridgeError::Spawn(format!("{}: {}", spec.bin, e)))?;
        let pid = child.id().map(|p| p as i32).unwrap_or(-1);

        info!(
            component = "bridge",
            event = "bridge.spawned",
            session_id = %session_id,
            bin = %spec.bin,
            pid = pid,
            seq_start = seq_start,
            "Spawned agent subprocess"
        );

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| BridgeError::Spawn("no stdin on child".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| BridgeError::Spawn("no stdout on child".into()))?;
        let stderr = child.stderr.take();

        let (stdin_tx, stdin_rx) = mpsc::channel::<String>(256);
        let alive = Arc::new(AtomicBool::new(true));
        let seq = Arc::new(AtomicU64::new(seq_start));
        let last_activity = Arc::new(AtomicU64::new(clock::now_epoch_secs()));
        let turn_tx: Arc<Mutex<Option<mpsc::Sender<Event>>>> = Arc::new(Mutex::new(None));
        let child = Arc::new(Mutex::new(child));

        if let Some(stderr) = stderr {
            let sid = session_id.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(
                        component = "bridge",
                        event = "bridge.stderr",
                        session_id = %sid,
                        line = %line,
                        "Agent stderr"
                    );
                }
            });
        }

        tokio::spawn(stdin_writer(session_id.clone(), stdin, stdin_rx));

        tokio::spawn(stdout_loop(
            session_id.clone(),
            stdout,
            child.clone(),
            alive.clone(),
            seq.clone(),
            last_activity.clone(),
            turn_tx.clone(),
        ));

        Ok(Arc::new(Self {
            session_id,
            pid,
            stdin_tx,
            child,
            alive,
            seq,
            last_activity,
            turn_tx,
        }))
    }

    /// Start a turn: route subsequent decoded events to the returned
    /// receiver and write the prompt to the subprocess. `seq_start`
    /// re-seeds the event counter; an interleaved one-shot turn on the
    /// same session may have advanced it past this process.
    pub async fn send_prompt(
        &self,
        prompt: &str,
        seq_start: u64,
    ) -> Result<mpsc::Receiver<Event>, BridgeError> {
        if !self.is_alive() {
            return Err(BridgeError::Evicted(self.session_id.clone()));
        }

        self.seq.store(seq_start, Ordering::SeqCst);

        let (tx, rx) = mpsc::channel(256);
        *self.turn_tx.lock().await = Some(tx);

        let line = json!({
            "type": "user",
            "message": {
                "role": "user",
                "content": [{ "type": "text", "text": prompt }],
            },
        })
        .to_string();

        if self.stdin_tx.send(line).await.is_err() {
            *self.turn_tx.lock().await = None;
            return Err(BridgeError::Evicted(self.session_id.clone()));
        }

        self.touch();
        Ok(rx)
    }

    /// Best-effort SIGTERM to this session's subprocess only.
    pub fn interrupt(&self) {
        if self.pid > 0 && self.is_alive() {
            info!(
                component = "bridge",
                event = "bridge.interrupt",
                session_id = %self.session_id,
                pid = self.pid,
                "Interrupting agent subprocess"
            );
            unsafe {
                libc::kill(self.pid, libc::SIGTERM);
            }
        }
    }

    /// SIGTERM, short grace period, then SIGKILL.
    pub async fn terminate(&self) {
        if self.pid > 0 {
            unsafe {
                libc::kill(self.pid, libc::SIGTERM);
            }
        }
        tokio::time::sleep(std::time::Duration::from_secs(2)).await;

        let mut child = self.child.lock().await;
        match child.try_wait() {
            Ok(Some(_)) => {}
            _ => {
                warn!(
                    component = "bridge",
                    event = "bridge.force_kill",
                    session_id = %self.session_id,
                    "Subprocess ignored SIGTERM, killing"
                );
                let _ = child.kill().await;
            }
        }
        self.alive.store(false, Ordering::SeqCst);
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    pub fn idle_secs(&self) -> u64 {
        clock::now_epoch_secs().saturating_sub(self.last_activity.load(Ordering::SeqCst))
    }

    fn touch(&self) {
        self.last_activity
            .store(clock::now_epoch_secs(), Ordering::SeqCst);
    }
}

async fn stdin_writer(
    session_id: String,
    mut stdin: tokio::process::ChildStdin,
    mut rx: mpsc::Receiver<String>,
) {
    while let Some(mut line) = rx.recv().await {
        line.push('\n');
        if let Err(e) = stdin.write_all(line.as_bytes()).await {
            error!(
                component = "bridge",
                event = "bridge.stdin_write_error",
                session_id = %session_id,
                error = %e,
                "Failed to write to agent stdin"
            );
            break;
        }
        if stdin.flush().await.is_err() {
            break;
        }
    }
    debug!(
        component = "bridge",
        event = "bridge.stdin_closed",
        session_id = %session_id,
        "Stdin writer ended"
    );
}

/// Read stdout chunks through the line decoder and route decoded
/// events to the current turn. Runs until EOF or read error, then
/// synthesizes the terminal event from the exit status.
async fn stdout_loop(
    session_id: String,
    mut stdout: tokio::process::ChildStdout,
    child: Arc<Mutex<Child>>,
    alive: Arc<AtomicBool>,
    seq: Arc<AtomicU64>,
    last_activity: Arc<AtomicU64>,
    turn_tx: Arc<Mutex<Option<mpsc::Sender<Event>>>>,
) {
    let mut decoder = LineDecoder::new();
    let mut chunk = [0u8; 8192];

    loop {
        match stdout.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => {
                last_activity.store(clock::now_epoch_secs(), Ordering::SeqCst);
                for line in decoder.push(&chunk[..n]) {
                    route_line(&session_id, &line, &seq, &turn_tx).await;
                }
            }
            Err(e) => {
                error!(
                    component = "bridge",
                    event = "bridge.stdout_read_error",
                    session_id = %session_id,
                    error = %e,
                    "Error reading agent stdout"
                );
                break;
            }
        }
    }

    if let Some(line) = decoder.finish() {
        route_line(&session_id, &line, &seq, &turn_tx).await;
    }

    alive.store(false, Ordering::SeqCst);

    let exit_code = child.lock().await.wait().await.ok().and_then(|s| s.code());
    info!(
        component = "bridge",
        event = "bridge.exited",
        session_id = %session_id,
        exit_code = ?exit_code,
        "Agent subprocess exited"
    );

    // A turn that was still open gets its terminal event here rather
    // than a silently dropped receiver.
    let mut slot = turn_tx.lock().await;
    if let Some(tx) = slot.take() {
        let event = Event::terminal_error(
            session_id.clone(),
            seq.fetch_add(1, Ordering::SeqCst),
            clock::now_iso(),
            format!("agent subprocess exited (code {:?})", exit_code),
            exit_code,
        );
        let _ = tx.send(event).await;
    }
}

async fn route_line(
    session_id: &str,
    line: &str,
    seq: &Arc<AtomicU64>,
    turn_tx: &Arc<Mutex<Option<mpsc::Sender<Event>>>>,
) {
    for payload in decode_line(line) {
        let terminal = matches!(payload, EventPayload::Result { .. });
        let event = Event::new(
            session_id,
            seq.fetch_add(1, Ordering::SeqCst),
            clock::now_iso(),
            payload,
        );

        let mut slot = turn_tx.lock().await;
        match slot.as_ref() {
            Some(tx) => {
                if tx.send(event).await.is_err() {
                    debug!(
                        component = "bridge",
                        session_id = %session_id,
                        "Turn receiver dropped, closing turn"
                    );
                    *slot = None;
                } else if terminal {
                    *slot = None;
                }
            }
            None => {
                debug!(
                    component = "bridge",
                    session_id = %session_id,
                    "Decoded event outside a turn, dropped"
                );
            }
        }
    }
}

/// Synthesize a success terminal when a finished stream never carried
/// one, or an error terminal for a non-zero exit.
pub(super) fn terminal_from_exit(
    session_id: &str,
    seq: u64,
    exit_code: Option<i32>,
) -> Event {
    match exit_code {
        Some(0) => Event::new(
            session_id,
            seq,
            clock::now_iso(),
            EventPayload::Result {
                outcome: TerminalOutcome::Success,
                exit_code: Some(0),
                error: None,
                stats: None,
            },
        ),
        code => Event::terminal_error(
            session_id,
            seq,
            clock::now_iso(),
            format!("agent exited without a result (code {:?})", code),
            code,
        ),
    }
}
