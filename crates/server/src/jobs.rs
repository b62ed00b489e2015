//! Background job queue.
//!
//! Jobs run off the request path on a dedicated worker task. Delivery
//! is at-least-once (the persistence writer fires an indexing job per
//! flushed batch), so the worker keeps a ledger of processed job ids
//! and skips duplicates. Failures retry inline with exponential
//! backoff up to a bounded attempt count.

use std::collections::{HashSet, VecDeque};
use std::path::PathBuf;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use relay_protocol::{new_id, EventPayload};

use crate::persistence;

const MAX_ATTEMPTS: u32 = 3;
const BACKOFF_BASE_MS: u64 = 100;

/// Processed-id entries kept before the oldest age out
const PROCESSED_CAP: usize = 4096;

/// How many transcript rows an indexing pass reads at most
const INDEX_EVENT_LIMIT: usize = 10_000;

#[derive(Debug, Clone)]
pub enum JobKind {
    /// Rebuild the derived index for a session's transcript
    IndexTranscript { session_id: String },

    /// Post-process a freshly stored upload
    ProcessUpload { key: String, session_id: String },
}

#[derive(Debug, Clone)]
pub struct Job {
    pub id: String,
    pub attempt: u32,
    pub kind: JobKind,
}

impl Job {
    pub fn index_transcript(session_id: String) -> Self {
        Self {
            id: new_id(),
            attempt: 0,
            kind: JobKind::IndexTranscript { session_id },
        }
    }

    pub fn process_upload(key: String, session_id: String) -> Self {
        Self {
            id: new_id(),
            attempt: 0,
            kind: JobKind::ProcessUpload { key, session_id },
        }
    }
}

/// Summary derived from a transcript, written as a sidecar JSON file
#[derive(Debug, Serialize)]
struct TranscriptIndex {
    session_id: String,
    event_count: usize,
    tool_calls: usize,
    assistant_chars: usize,
    last_seq: Option<u64>,
    indexed_at: String,
}

/// Bounded set of recently processed job ids. Insertion order ages
/// out, so a long-lived worker never holds more than `PROCESSED_CAP`
/// entries. Redelivery happens within moments of the original, well
/// inside the window.
struct ProcessedLedger {
    ids: HashSet<String>,
    order: VecDeque<String>,
}

impl ProcessedLedger {
    fn new() -> Self {
        Self {
            ids: HashSet::new(),
            order: VecDeque::new(),
        }
    }

    fn contains(&self, id: &str) -> bool {
        self.ids.contains(id)
    }

    fn insert(&mut self, id: String) {
        if !self.ids.insert(id.clone()) {
            return;
        }
        self.order.push_back(id);
        while self.order.len() > PROCESSED_CAP {
            if let Some(oldest) = self.order.pop_front() {
                self.ids.remove(&oldest);
            }
        }
    }
}

pub struct JobWorker {
    rx: mpsc::Receiver<Job>,
    db_path: PathBuf,
    index_dir: PathBuf,
    uploads_dir: PathBuf,
    processed: ProcessedLedger,
}

impl JobWorker {
    pub fn new(
        rx: mpsc::Receiver<Job>,
        db_path: PathBuf,
        index_dir: PathBuf,
        uploads_dir: PathBuf,
    ) -> Self {
        Self {
            rx,
            db_path,
            index_dir,
            uploads_dir,
            processed: ProcessedLedger::new(),
        }
    }

    /// Run the worker (call from tokio::spawn)
    pub async fn run(mut self) {
        info!(
            component = "jobs",
            event = "jobs.started",
            "Job worker started"
        );

        while let Some(mut job) = self.rx.recv().await {
            if self.processed.contains(&job.id) {
                debug!(
                    component = "jobs",
                    event = "jobs.duplicate_skipped",
                    job_id = %job.id,
                    "Skipping already-processed job"
                );
                continue;
            }

            loop {
                match self.handle(&job).await {
                    Ok(()) => {
                        self.processed.insert(job.id.clone());
                        debug!(
                            component = "jobs",
                            event = "jobs.completed",
                            job_id = %job.id,
                            attempt = job.attempt,
                            "Job completed"
                        );
                        break;
                    }
                    Err(e) if job.attempt + 1 < MAX_ATTEMPTS => {
                        job.attempt += 1;
                        let backoff =
                            Duration::from_millis(BACKOFF_BASE_MS << job.attempt);
                        warn!(
                            component = "jobs",
                            event = "jobs.retrying",
                            job_id = %job.id,
                            attempt = job.attempt,
                            error = %e,
                            "Job failed, retrying"
                        );
                        tokio::time::sleep(backoff).await;
                    }
                    Err(e) => {
                        // Exhausted. Mark processed so a redelivered
                        // duplicate does not re-fail forever.
                        self.processed.insert(job.id.clone());
                        warn!(
                            component = "jobs",
                            event = "jobs.gave_up",
                            job_id = %job.id,
                            attempts = MAX_ATTEMPTS,
                            error = %e,
                            "Job failed permanently"
                        );
                        break;
                    }
                }
            }
        }

        info!(
            component = "jobs",
            event = "jobs.stopped",
            "Job worker stopped"
        );
    }

    async fn handle(&self, job: &Job) -> anyhow::Result<()> {
        match &job.kind {
            JobKind::IndexTranscript { session_id } => {
                self.index_transcript(session_id).await
            }
            JobKind::ProcessUpload { key, session_id } => {
                self.process_upload(key, session_id).await
            }
        }
    }

    async fn index_transcript(&self, session_id: &str) -> anyhow::Result<()> {
        let events = persistence::load_events(
            self.db_path.clone(),
            session_id.to_string(),
            INDEX_EVENT_LIMIT,
        )
        .await?;

        let mut tool_calls = 0;
        let mut assistant_chars = 0;
        for event in &events {
            match &event.payload {
                EventPayload::ToolCall { .. } => tool_calls += 1,
                EventPayload::AssistantText { text } => assistant_chars += text.len(),
                _ => {}
            }
        }

        let index = TranscriptIndex {
            session_id: session_id.to_string(),
            event_count: events.len(),
            tool_calls,
            assistant_chars,
            last_seq: events.last().map(|e| e.seq),
            indexed_at: crate::clock::now_iso(),
        };

        tokio::fs::create_dir_all(&self.index_dir).await?;
        let path = self.index_dir.join(format!("{}.json", session_id));
        let json = serde_json::to_vec_pretty(&index)?;
        tokio::fs::write(&path, json).await?;

        Ok(())
    }

    async fn process_upload(&self, key: &str, session_id: &str) -> anyhow::Result<()> {
        // Keys are relative to the uploads root ("uploads/<sid>/...")
        let relative = key.strip_prefix("uploads/").unwrap_or(key);
        let path = self.uploads_dir.join(relative);

        let meta = tokio::fs::metadata(&path).await?;
        info!(
            component = "jobs",
            event = "jobs.upload_processed",
            session_id = %session_id,
            key = %key,
            size_bytes = meta.len(),
            "Upload post-processed"
        );

        Ok(())
    }
}

/// Create a sender/receiver pair for the job queue
pub fn create_job_channel() -> (mpsc::Sender<Job>, mpsc::Receiver<Job>) {
    mpsc::channel(500)
}
