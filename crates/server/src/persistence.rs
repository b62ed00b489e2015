//! Persistence layer: batched SQLite writes.
//!
//! Uses `spawn_blocking` for async-safe SQLite access and batches
//! writes for better performance under high event volume. Every batch
//! runs inside one explicit transaction: all-or-nothing, never a
//! sequence of unguarded writes. After a batch containing transcript
//! rows commits, an indexing job is enqueued; enqueue failure is
//! logged and never rolls back the committed write.

use std::path::PathBuf;
use std::time::Duration;

use rusqlite::{params, Connection, OptionalExtension};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use relay_protocol::{Event, EventPayload, ExecutionMode, Role, SessionStatus, SessionSummary};

use crate::jobs::Job;

/// Commands that can be persisted
#[derive(Debug, Clone)]
pub enum PersistCommand {
    /// Create a new session row
    SessionCreate {
        id: String,
        mode: ExecutionMode,
        role: Role,
        created_at: String,
    },

    /// Bump last-activity
    SessionTouch {
        id: String,
        last_activity_at: String,
    },

    /// End a session
    SessionEnd { id: String, reason: String },

    /// Append one transcript event (idempotent on (session_id, seq))
    EventAppend { event: Event },

    /// Wipe a session's transcript
    SessionClear { id: String },

    /// Delete a session and its transcript
    SessionDelete { id: String },

    /// Record an uploaded artifact
    ArtifactCreate {
        key: String,
        session_id: String,
        file_name: String,
        size_bytes: u64,
        uploaded_at: String,
    },
}

/// Persistence writer that batches SQLite writes
pub struct PersistenceWriter {
    rx: mpsc::Receiver<PersistCommand>,
    db_path: PathBuf,
    job_tx: Option<mpsc::Sender<Job>>,
    batch: Vec<PersistCommand>,
    batch_size: usize,
    flush_interval: Duration,
}

impl PersistenceWriter {
    pub fn new(
        rx: mpsc::Receiver<PersistCommand>,
        db_path: PathBuf,
        job_tx: Option<mpsc::Sender<Job>>,
    ) -> Self {
        Self {
            rx,
            db_path,
            job_tx,
            batch: Vec::with_capacity(100),
            batch_size: 50,
            flush_interval: Duration::from_millis(100),
        }
    }

    /// Run the persistence writer (call from tokio::spawn)
    pub async fn run(mut self) {
        info!(
            component = "persistence",
            event = "persistence.started",
            db_path = %self.db_path.display(),
            "PersistenceWriter started"
        );

        let mut interval = tokio::time::interval(self.flush_interval);

        loop {
            tokio::select! {
                cmd = self.rx.recv() => {
                    match cmd {
                        Some(cmd) => {
                            self.batch.push(cmd);
                            if self.batch.len() >= self.batch_size {
                                self.flush().await;
                            }
                        }
                        None => {
                            // Channel closed; final flush, then exit
                            self.flush().await;
                            return;
                        }
                    }
                }

                _ = interval.tick() => {
                    if !self.batch.is_empty() {
                        self.flush().await;
                    }
                }
            }
        }
    }

    /// Flush the batch to SQLite inside one transaction
    async fn flush(&mut self) {
        if self.batch.is_empty() {
            return;
        }

        let batch = std::mem::take(&mut self.batch);

        // Sessions whose transcript grew in this batch get follow-up
        // indexing work once the transaction commits.
        let mut touched_sessions: Vec<String> = Vec::new();
        for cmd in &batch {
            if let PersistCommand::EventAppend { event } = cmd {
                if !touched_sessions.contains(&event.session_id) {
                    touched_sessions.push(event.session_id.clone());
                }
            }
        }

        let db_path = self.db_path.clone();
        let result = tokio::task::spawn_blocking(move || flush_batch(&db_path, batch)).await;

        match result {
            Ok(Ok(count)) => {
                debug!(
                    component = "persistence",
                    event = "persistence.flushed",
                    commands = count,
                    "Persisted batch"
                );

                // Best-effort: the write already committed, a failed
                // enqueue only degrades indexing freshness.
                if let Some(job_tx) = &self.job_tx {
                    for session_id in touched_sessions {
                        let job = Job::index_transcript(session_id.clone());
                        if job_tx.try_send(job).is_err() {
                            warn!(
                                component = "persistence",
                                event = "persistence.job_enqueue_failed",
                                session_id = %session_id,
                                "Job queue full or closed, indexing job dropped"
                            );
                        }
                    }
                }
            }
            Ok(Err(e)) => {
                error!(
                    component = "persistence",
                    event = "persistence.flush_failed",
                    error = %e,
                    "Persistence flush failed"
                );
            }
            Err(e) => {
                error!(
                    component = "persistence",
                    event = "persistence.flush_panicked",
                    error = %e,
                    "spawn_blocking panicked"
                );
            }
        }
    }
}

/// Flush a batch of commands to SQLite (runs in a blocking thread)
pub(crate) fn flush_batch(db_path: &PathBuf, batch: Vec<PersistCommand>) -> Result<usize, rusqlite::Error> {
    let conn = Connection::open(db_path)?;

    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA busy_timeout = 5000;
         PRAGMA synchronous = NORMAL;",
    )?;

    let count = batch.len();

    let tx = conn.unchecked_transaction()?;

    for cmd in batch {
        if let Err(e) = execute_command(&tx, cmd) {
            warn!(
                component = "persistence",
                event = "persistence.command_failed",
                error = %e,
                "Failed to execute persist command"
            );
            // Continue with the rest of the batch
        }
    }

    tx.commit()?;

    Ok(count)
}

fn mode_str(mode: ExecutionMode) -> &'static str {
    match mode {
        ExecutionMode::Persistent => "persistent",
        ExecutionMode::OneShot => "one_shot",
    }
}

fn parse_mode(s: &str) -> ExecutionMode {
    match s {
        "persistent" => ExecutionMode::Persistent,
        _ => ExecutionMode::OneShot,
    }
}

fn role_str(role: Role) -> &'static str {
    match role {
        Role::Admin => "admin",
        Role::Developer => "developer",
        Role::Viewer => "viewer",
        Role::Default => "default",
    }
}

fn parse_role(s: &str) -> Role {
    match s {
        "admin" => Role::Admin,
        "developer" => Role::Developer,
        "viewer" => Role::Viewer,
        _ => Role::Default,
    }
}

fn parse_status(s: &str) -> SessionStatus {
    match s {
        "ended" => SessionStatus::Ended,
        _ => SessionStatus::Active,
    }
}

fn payload_kind(payload: &EventPayload) -> &'static str {
    match payload {
        EventPayload::SystemInit { .. } => "system_init",
        EventPayload::AssistantText { .. } => "assistant_text",
        EventPayload::ToolCall { .. } => "tool_call",
        EventPayload::ToolResult { .. } => "tool_result",
        EventPayload::Result { .. } => "result",
        EventPayload::Log { .. } => "log",
        EventPayload::KeepAlive => "keep_alive",
    }
}

/// Execute a single persist command
fn execute_command(conn: &Connection, cmd: PersistCommand) -> Result<(), rusqlite::Error> {
    match cmd {
        PersistCommand::SessionCreate {
            id,
            mode,
            role,
            created_at,
        } => {
            conn.execute(
                "INSERT INTO sessions (id, mode, status, role, created_at, last_activity_at)
                 VALUES (?1, ?2, 'active', ?3, ?4, ?4)
                 ON CONFLICT(id) DO UPDATE SET last_activity_at = ?4",
                params![id, mode_str(mode), role_str(role), created_at],
            )?;
        }

        PersistCommand::SessionTouch {
            id,
            last_activity_at,
        } => {
            conn.execute(
                "UPDATE sessions SET last_activity_at = ?1 WHERE id = ?2",
                params![last_activity_at, id],
            )?;
        }

        PersistCommand::SessionEnd { id, reason } => {
            conn.execute(
                "UPDATE sessions SET status = 'ended', ended_at = last_activity_at, end_reason = ?1 WHERE id = ?2",
                params![reason, id],
            )?;
        }

        PersistCommand::EventAppend { event } => {
            let payload_json = serde_json::to_string(&event.payload)
                .unwrap_or_else(|_| "{\"type\":\"keep_alive\"}".to_string());

            // At-least-once delivery: the PK makes redelivery a no-op
            conn.execute(
                "INSERT OR IGNORE INTO events (session_id, seq, kind, payload, timestamp)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    event.session_id,
                    event.seq as i64,
                    payload_kind(&event.payload),
                    payload_json,
                    event.timestamp,
                ],
            )?;
        }

        PersistCommand::SessionClear { id } => {
            conn.execute("DELETE FROM events WHERE session_id = ?1", params![id])?;
        }

        PersistCommand::SessionDelete { id } => {
            conn.execute("DELETE FROM events WHERE session_id = ?1", params![id])?;
            conn.execute("DELETE FROM artifacts WHERE session_id = ?1", params![id])?;
            conn.execute("DELETE FROM sessions WHERE id = ?1", params![id])?;
        }

        PersistCommand::ArtifactCreate {
            key,
            session_id,
            file_name,
            size_bytes,
            uploaded_at,
        } => {
            conn.execute(
                "INSERT OR IGNORE INTO artifacts (key, session_id, file_name, size_bytes, uploaded_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![key, session_id, file_name, size_bytes as i64, uploaded_at],
            )?;
        }
    }

    Ok(())
}

/// Create a session row immediately, outside the batched writer.
/// A freshly issued session id is often read back on the very next
/// request, which must not wait out a flush interval.
pub async fn create_session_now(
    db_path: PathBuf,
    id: String,
    mode: ExecutionMode,
    role: Role,
    created_at: String,
) -> Result<(), anyhow::Error> {
    tokio::task::spawn_blocking(move || -> Result<(), anyhow::Error> {
        let conn = Connection::open(&db_path)?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA busy_timeout = 5000;
             PRAGMA synchronous = NORMAL;",
        )?;
        execute_command(
            &conn,
            PersistCommand::SessionCreate {
                id,
                mode,
                role,
                created_at,
            },
        )?;
        Ok(())
    })
    .await??;

    Ok(())
}

// ---------------------------------------------------------------------------
// Read side
// ---------------------------------------------------------------------------

fn open_reader(db_path: &PathBuf) -> Result<Connection, rusqlite::Error> {
    let conn = Connection::open(db_path)?;
    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA busy_timeout = 5000;",
    )?;
    Ok(conn)
}

fn summary_from_row(row: &rusqlite::Row<'_>) -> Result<SessionSummary, rusqlite::Error> {
    let mode: String = row.get(1)?;
    let status: String = row.get(2)?;
    let role: String = row.get(3)?;
    let next_seq: i64 = row.get(6)?;
    Ok(SessionSummary {
        id: row.get(0)?,
        mode: parse_mode(&mode),
        status: parse_status(&status),
        role: parse_role(&role),
        created_at: row.get(4)?,
        last_activity_at: row.get(5)?,
        next_seq: next_seq as u64,
    })
}

const SUMMARY_SELECT: &str = "SELECT s.id, s.mode, s.status, s.role, s.created_at, s.last_activity_at,
        COALESCE((SELECT MAX(seq) + 1 FROM events e WHERE e.session_id = s.id), 0)
 FROM sessions s";

/// Load one session's summary
pub async fn load_session(
    db_path: PathBuf,
    id: String,
) -> Result<Option<SessionSummary>, anyhow::Error> {
    let result = tokio::task::spawn_blocking(move || -> Result<_, anyhow::Error> {
        if !db_path.exists() {
            return Ok(None);
        }
        let conn = open_reader(&db_path)?;
        let sql = format!("{} WHERE s.id = ?1", SUMMARY_SELECT);
        let row = conn
            .prepare(&sql)?
            .query_row(params![id], summary_from_row)
            .optional()?;
        Ok(row)
    })
    .await??;

    Ok(result)
}

/// List sessions, most recent activity first
pub async fn list_sessions(
    db_path: PathBuf,
    limit: u32,
    offset: u32,
) -> Result<Vec<SessionSummary>, anyhow::Error> {
    let rows = tokio::task::spawn_blocking(move || -> Result<_, anyhow::Error> {
        if !db_path.exists() {
            return Ok(Vec::new());
        }
        let conn = open_reader(&db_path)?;
        let sql = format!(
            "{} ORDER BY s.last_activity_at DESC LIMIT ?1 OFFSET ?2",
            SUMMARY_SELECT
        );
        let rows = conn
            .prepare(&sql)?
            .query_map(params![limit, offset], summary_from_row)?
            .filter_map(|r| r.ok())
            .collect();
        Ok(rows)
    })
    .await??;

    Ok(rows)
}

/// Load a session's transcript, ordered by sequence number. The
/// primary key already de-duplicated at-least-once writes; ordering by
/// seq restores the end-to-end event order.
pub async fn load_events(
    db_path: PathBuf,
    session_id: String,
    limit: usize,
) -> Result<Vec<Event>, anyhow::Error> {
    let events = tokio::task::spawn_blocking(move || -> Result<_, anyhow::Error> {
        if !db_path.exists() {
            return Ok(Vec::new());
        }
        let conn = open_reader(&db_path)?;

        // Newest `limit` rows, returned in ascending order
        let mut stmt = conn.prepare(
            "SELECT session_id, seq, payload, timestamp FROM (
                 SELECT session_id, seq, payload, timestamp
                 FROM events WHERE session_id = ?1
                 ORDER BY seq DESC LIMIT ?2
             ) ORDER BY seq ASC",
        )?;

        let events: Vec<Event> = stmt
            .query_map(params![session_id, limit as i64], |row| {
                let session_id: String = row.get(0)?;
                let seq: i64 = row.get(1)?;
                let payload_json: String = row.get(2)?;
                let timestamp: String = row.get(3)?;
                Ok((session_id, seq, payload_json, timestamp))
            })?
            .filter_map(|r| r.ok())
            .filter_map(|(session_id, seq, payload_json, timestamp)| {
                let payload: EventPayload = serde_json::from_str(&payload_json).ok()?;
                Some(Event::new(session_id, seq as u64, timestamp, payload))
            })
            .collect();

        Ok(events)
    })
    .await??;

    Ok(events)
}

/// Create a sender/receiver pair for the persistence writer
pub fn create_persistence_channel() -> (mpsc::Sender<PersistCommand>, mpsc::Receiver<PersistCommand>)
{
    mpsc::channel(1000)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migration_runner::run_migrations;
    use relay_protocol::TerminalOutcome;

    fn test_db() -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("test.db");
        let mut conn = Connection::open(&path).expect("open");
        run_migrations(&mut conn).expect("migrate");
        (dir, path)
    }

    fn event(session: &str, seq: u64) -> Event {
        Event::new(
            session,
            seq,
            "2026-01-01T00:00:00Z".to_string(),
            EventPayload::AssistantText {
                text: format!("msg-{}", seq),
            },
        )
    }

    #[test]
    fn event_append_dedupes_by_seq() {
        let (_dir, path) = test_db();
        let conn = Connection::open(&path).expect("open");

        let batch = vec![
            PersistCommand::EventAppend {
                event: event("s1", 0),
            },
            PersistCommand::EventAppend {
                event: event("s1", 0),
            },
            PersistCommand::EventAppend {
                event: event("s1", 1),
            },
        ];
        flush_batch(&path, batch).expect("flush");

        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM events WHERE session_id = 's1'",
                [],
                |r| r.get(0),
            )
            .expect("count");
        assert_eq!(count, 2);
    }

    #[tokio::test]
    async fn load_events_orders_by_seq() {
        let (_dir, path) = test_db();

        // Write out of order; read side must restore ordering
        let batch = vec![
            PersistCommand::EventAppend {
                event: event("s2", 2),
            },
            PersistCommand::EventAppend {
                event: event("s2", 0),
            },
            PersistCommand::EventAppend {
                event: event("s2", 1),
            },
        ];
        flush_batch(&path, batch).expect("flush");

        let events = load_events(path, "s2".to_string(), 100)
            .await
            .expect("load");
        let seqs: Vec<u64> = events.iter().map(|e| e.seq).collect();
        assert_eq!(seqs, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn session_lifecycle_roundtrip() {
        let (_dir, path) = test_db();

        let batch = vec![
            PersistCommand::SessionCreate {
                id: "s3".to_string(),
                mode: ExecutionMode::Persistent,
                role: Role::Developer,
                created_at: "2026-01-01T00:00:00Z".to_string(),
            },
            PersistCommand::EventAppend {
                event: event("s3", 0),
            },
        ];
        flush_batch(&path, batch).expect("flush");

        let summary = load_session(path.clone(), "s3".to_string())
            .await
            .expect("load")
            .expect("present");
        assert_eq!(summary.mode, ExecutionMode::Persistent);
        assert_eq!(summary.role, Role::Developer);
        assert_eq!(summary.next_seq, 1);

        flush_batch(
            &path,
            vec![PersistCommand::SessionDelete {
                id: "s3".to_string(),
            }],
        )
        .expect("flush");
        let gone = load_session(path, "s3".to_string()).await.expect("load");
        assert!(gone.is_none());
    }

    #[tokio::test]
    async fn created_session_is_immediately_readable() {
        let (_dir, path) = test_db();

        create_session_now(
            path.clone(),
            "s5".to_string(),
            ExecutionMode::Persistent,
            Role::Admin,
            "2026-01-01T00:00:00Z".to_string(),
        )
        .await
        .expect("create");

        // No flush interval to wait out; the row is already durable
        let summary = load_session(path, "s5".to_string())
            .await
            .expect("load")
            .expect("present right after create");
        assert_eq!(summary.role, Role::Admin);
        assert_eq!(summary.next_seq, 0);
    }

    #[tokio::test]
    async fn terminal_event_payload_survives_roundtrip() {
        let (_dir, path) = test_db();

        let terminal = Event::new(
            "s4",
            5,
            "2026-01-01T00:00:00Z".to_string(),
            EventPayload::Result {
                outcome: TerminalOutcome::Error,
                exit_code: Some(1),
                error: Some("subprocess exited".to_string()),
                stats: None,
            },
        );
        flush_batch(
            &path,
            vec![PersistCommand::EventAppend { event: terminal }],
        )
        .expect("flush");

        let events = load_events(path, "s4".to_string(), 10).await.expect("load");
        assert_eq!(events.len(), 1);
        match &events[0].payload {
            EventPayload::Result {
                outcome, exit_code, ..
            } => {
                assert_eq!(*outcome, TerminalOutcome::Error);
                assert_eq!(*exit_code, Some(1));
            }
            other => panic!("unexpected payload: {:?}", other),
        }
    }
}
