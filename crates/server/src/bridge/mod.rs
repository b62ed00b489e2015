//! Execution backend bridge.
//!
//! Decides how a turn runs (persistent subprocess vs one-shot), owns
//! the pool of live persistent subprocesses, and enforces the process
//! cap and idle eviction. The pool map is the only shared state here
//! and is mutated only by the bridge.

pub mod codec;
pub mod oneshot;
pub mod process;

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{info, warn};

use relay_protocol::{Event, ExecutionMode};

use crate::persistence::PersistCommand;
use crate::sanitize::pattern_matches;
pub use process::{AgentProcess, SpawnSpec};

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("failed to spawn agent: {0}")]
    Spawn(String),

    #[error("process pool at capacity ({0} live)")]
    Capacity(usize),

    #[error("session {0} was evicted")]
    Evicted(String),
}

#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub agent_bin: String,
    pub one_shot_commands: Vec<String>,
    pub max_processes: usize,
    pub session_timeout: Duration,
    pub sweep_interval: Duration,
    pub request_timeout: Duration,
}

pub struct ExecutionBridge {
    config: BridgeConfig,
    pool: DashMap<String, Arc<AgentProcess>>,
    persist_tx: Option<mpsc::Sender<PersistCommand>>,
}

impl ExecutionBridge {
    pub fn new(config: BridgeConfig, persist_tx: Option<mpsc::Sender<PersistCommand>>) -> Self {
        Self {
            config,
            pool: DashMap::new(),
            persist_tx,
        }
    }

    pub fn agent_bin(&self) -> &str {
        &self.config.agent_bin
    }

    pub fn request_timeout(&self) -> Duration {
        self.config.request_timeout
    }

    /// Decide the execution mode for a turn.
    ///
    /// Commands on the configured one-shot list always run one-shot,
    /// continuations of an existing session stay persistent, and
    /// everything else defaults to one-shot unless the client asked
    /// for a persistent session.
    pub fn decide_mode(&self, prompt: &str, continuation: bool, persist: bool) -> ExecutionMode {
        if prompt.starts_with('/') {
            let command = prompt.split_whitespace().next().unwrap_or(prompt);
            if self
                .config
                .one_shot_commands
                .iter()
                .any(|p| pattern_matches(p, command))
            {
                return ExecutionMode::OneShot;
            }
        }
        if continuation || persist {
            ExecutionMode::Persistent
        } else {
            ExecutionMode::OneShot
        }
    }

    /// Run one turn and stream its events. `seq_start` seeds the
    /// turn's sequence numbers; a reused subprocess re-seeds from it
    /// so interleaved one-shot turns never make it fall behind.
    pub async fn run_turn(
        &self,
        session_id: &str,
        mode: ExecutionMode,
        prompt: &str,
        spec: &SpawnSpec,
        seq_start: u64,
    ) -> Result<mpsc::Receiver<Event>, BridgeError> {
        match mode {
            ExecutionMode::OneShot => oneshot::run_one_shot(
                session_id.to_string(),
                seq_start,
                spec,
                prompt,
                self.config.request_timeout,
            ),
            ExecutionMode::Persistent => {
                let process = self.get_or_spawn(session_id, seq_start, spec)?;
                match process.send_prompt(prompt, seq_start).await {
                    Ok(rx) => Ok(rx),
                    Err(e) => {
                        // Dead entry; surface the eviction, do not retry
                        self.pool.remove(session_id);
                        Err(e)
                    }
                }
            }
        }
    }

    fn get_or_spawn(
        &self,
        session_id: &str,
        seq_start: u64,
        spec: &SpawnSpec,
    ) -> Result<Arc<AgentProcess>, BridgeError> {
        if let Some(existing) = self.pool.get(session_id) {
            if existing.is_alive() {
                return Ok(existing.clone());
            }
            drop(existing);
            self.pool.remove(session_id);
        }

        let live = self.live_processes();
        if live >= self.config.max_processes {
            return Err(BridgeError::Capacity(live));
        }

        let process = AgentProcess::spawn(session_id.to_string(), seq_start, spec)?;
        self.pool.insert(session_id.to_string(), process.clone());
        Ok(process)
    }

    pub fn live_processes(&self) -> usize {
        self.pool.iter().filter(|e| e.value().is_alive()).count()
    }

    /// Best-effort interrupt of one session's subprocess.
    pub fn interrupt(&self, session_id: &str) -> bool {
        match self.pool.get(session_id) {
            Some(process) if process.is_alive() => {
                process.interrupt();
                true
            }
            _ => false,
        }
    }

    /// Terminate and forget one session's subprocess, marking the
    /// session ended in the durable store.
    pub async fn evict(&self, session_id: &str, reason: &str) {
        if let Some((_, process)) = self.pool.remove(session_id) {
            process.terminate().await;
            if let Some(persist_tx) = &self.persist_tx {
                let _ = persist_tx.try_send(PersistCommand::SessionEnd {
                    id: session_id.to_string(),
                    reason: reason.to_string(),
                });
            }
        }
    }

    /// Terminate everything (shutdown path).
    pub async fn shutdown(&self) {
        let sessions: Vec<String> = self.pool.iter().map(|e| e.key().clone()).collect();
        for session_id in sessions {
            self.evict(&session_id, "server_shutdown").await;
        }
    }

    /// Periodic sweep that evicts idle or dead subprocesses. The idle
    /// timeout is minutes-scale and independent of request timeouts.
    pub fn spawn_reaper(self: &Arc<Self>) {
        let bridge = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(bridge.config.sweep_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                bridge.sweep().await;
            }
        });
    }

    async fn sweep(&self) {
        let timeout = self.config.session_timeout.as_secs();
        let mut stale: Vec<String> = Vec::new();
        for entry in self.pool.iter() {
            let process = entry.value();
            if !process.is_alive() || process.idle_secs() > timeout {
                stale.push(entry.key().clone());
            }
        }

        for session_id in stale {
            warn!(
                component = "bridge",
                event = "bridge.reaped",
                session_id = %session_id,
                timeout_secs = timeout,
                "Evicting idle or dead subprocess"
            );
            self.evict(&session_id, "idle_timeout").await;
        }

        let live = self.live_processes();
        if live > 0 {
            info!(
                component = "bridge",
                event = "bridge.sweep",
                live = live,
                "Reaper sweep complete"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::os::unix::fs::PermissionsExt;

    fn config(bin: &str, max: usize) -> BridgeConfig {
        BridgeConfig {
            agent_bin: bin.to_string(),
            one_shot_commands: vec![
                "/help".to_string(),
                "/status".to_string(),
                "/debug*".to_string(),
            ],
            max_processes: max,
            session_timeout: Duration::from_secs(300),
            sweep_interval: Duration::from_secs(60),
            request_timeout: Duration::from_secs(30),
        }
    }

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

    fn long_running_stub(dir: &std::path::Path) -> String {
        let path = dir.join("agent.sh");
        let mut f = std::fs::File::create(&path).expect("create");
        // Stays alive reading stdin, like a real persistent agent
        write!(f, "#!/bin/sh\nwhile read line; do :; done\n").expect("write");
        drop(f);
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).expect("chmod");
        path.to_string_lossy().to_string()
    }

    #[test]
    fn one_shot_commands_always_run_one_shot() {
        let bridge = ExecutionBridge::new(config("agent", 4), None);
        assert_eq!(
            bridge.decide_mode("/help", true, true),
            ExecutionMode::OneShot
        );
        assert_eq!(
            bridge.decide_mode("/debug-verbose on", false, false),
            ExecutionMode::OneShot
        );
    }

    #[test]
    fn continuation_is_persistent_default_is_one_shot() {
        let bridge = ExecutionBridge::new(config("agent", 4), None);
        assert_eq!(
            bridge.decide_mode("fix the bug", true, false),
            ExecutionMode::Persistent
        );
        assert_eq!(
            bridge.decide_mode("fix the bug", false, true),
            ExecutionMode::Persistent
        );
        assert_eq!(
            bridge.decide_mode("fix the bug", false, false),
            ExecutionMode::OneShot
        );
        // Unlisted commands follow the normal rules
        assert_eq!(
            bridge.decide_mode("/model opus", true, false),
            ExecutionMode::Persistent
        );
    }

    #[tokio::test]
    async fn capacity_cap_fails_fast() {
        let dir = tempfile::tempdir().expect("tempdir");
        let bin = long_running_stub(dir.path());
        let bridge = ExecutionBridge::new(config(&bin, 1), None);

        let first = bridge.get_or_spawn("s1", 0, &spec(&bin));
        assert!(first.is_ok());

        let second = bridge.get_or_spawn("s2", 0, &spec(&bin));
        assert!(matches!(second, Err(BridgeError::Capacity(1))));

        // Same session reuses its process instead of counting again
        assert!(bridge.get_or_spawn("s1", 0, &spec(&bin)).is_ok());

        bridge.shutdown().await;
    }

    #[tokio::test]
    async fn evict_removes_from_pool() {
        let dir = tempfile::tempdir().expect("tempdir");
        let bin = long_running_stub(dir.path());
        let bridge = ExecutionBridge::new(config(&bin, 4), None);

        bridge.get_or_spawn("s1", 0, &spec(&bin)).expect("spawn");
        assert_eq!(bridge.live_processes(), 1);

        bridge.evict("s1", "test").await;
        assert_eq!(bridge.live_processes(), 0);
        assert!(!bridge.interrupt("s1"));
    }
}
