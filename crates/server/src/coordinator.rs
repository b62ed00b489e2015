//! Session coordinator: per-session actor owning history and fan-out.
//!
//! Each session runs as an independent tokio task that serializes all
//! of its own transitions through an mpsc command channel. External
//! callers hold a cheap-to-clone `CoordinatorHandle`; lock-free reads
//! go through `ArcSwap`. Subscribers are plain bounded senders: a full
//! or closed subscriber channel removes that subscriber only, and the
//! producer never sees an error.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use relay_protocol::{Event, SubscriberMessage};

use crate::clock;
use crate::persistence::{self, PersistCommand};

/// In-memory replay window per session
const RING_CAPACITY: usize = 1000;

/// An actor with no subscribers and no appends for this long exits;
/// its durable transcript stays and the session goes cold.
const IDLE_GC_SECS: u64 = 900;

/// Commands processed sequentially by a coordinator actor
pub enum CoordinatorCommand {
    Attach {
        subscriber_id: String,
        tx: mpsc::Sender<SubscriberMessage>,
        reply: oneshot::Sender<usize>,
    },
    Append {
        event: Event,
    },
    Detach {
        subscriber_id: String,
    },
    Clear {
        reply: oneshot::Sender<()>,
    },
    NextSeq {
        reply: oneshot::Sender<u64>,
    },
}

/// Lock-free view of a coordinator's state
#[derive(Debug, Clone)]
pub struct SessionSnapshot {
    pub session_id: String,
    pub next_seq: u64,
    pub subscriber_count: usize,
    pub last_activity_epoch: u64,
}

/// Handle to a running coordinator actor (cheap to Clone)
#[derive(Clone)]
pub struct CoordinatorHandle {
    pub session_id: String,
    command_tx: mpsc::Sender<CoordinatorCommand>,
    snapshot: Arc<ArcSwap<SessionSnapshot>>,
}

impl CoordinatorHandle {
    /// Register a subscriber. The actor pushes the history frame into
    /// `tx` before any live event, so catch-up ordering is
    /// deterministic. Returns the post-attach subscriber count.
    pub async fn attach(
        &self,
        subscriber_id: String,
        tx: mpsc::Sender<SubscriberMessage>,
    ) -> Option<usize> {
        let (reply, rx) = oneshot::channel();
        self.send(CoordinatorCommand::Attach {
            subscriber_id,
            tx,
            reply,
        })
        .await;
        rx.await.ok()
    }

    /// Append one event. Fire-and-forget: a closed actor drops the
    /// event with a warning and never errors back to the producer.
    pub async fn append(&self, event: Event) {
        self.send(CoordinatorCommand::Append { event }).await;
    }

    pub async fn detach(&self, subscriber_id: String) {
        self.send(CoordinatorCommand::Detach { subscriber_id }).await;
    }

    /// Wipe in-memory history and durable rows, broadcast a reset.
    pub async fn clear(&self) {
        let (reply, rx) = oneshot::channel();
        self.send(CoordinatorCommand::Clear { reply }).await;
        let _ = rx.await;
    }

    /// Next expected sequence number (seeds a fresh subprocess).
    pub async fn next_seq(&self) -> u64 {
        let (reply, rx) = oneshot::channel();
        self.send(CoordinatorCommand::NextSeq { reply }).await;
        rx.await.unwrap_or_else(|_| self.snapshot().next_seq)
    }

    /// Lock-free snapshot read.
    pub fn snapshot(&self) -> Arc<SessionSnapshot> {
        self.snapshot.load_full()
    }

    pub fn is_closed(&self) -> bool {
        self.command_tx.is_closed()
    }

    async fn send(&self, cmd: CoordinatorCommand) {
        if self.command_tx.send(cmd).await.is_err() {
            warn!(
                component = "coordinator",
                session_id = %self.session_id,
                "Coordinator channel closed, command dropped"
            );
        }
    }
}

struct Subscriber {
    id: String,
    tx: mpsc::Sender<SubscriberMessage>,
}

struct Coordinator {
    session_id: String,
    ring: VecDeque<Event>,
    next_seq: u64,
    subscribers: Vec<Subscriber>,
    persist_tx: mpsc::Sender<PersistCommand>,
    snapshot: Arc<ArcSwap<SessionSnapshot>>,
    last_activity_epoch: u64,
}

impl Coordinator {
    fn spawn(
        session_id: String,
        history: Vec<Event>,
        persist_tx: mpsc::Sender<PersistCommand>,
        heartbeat: Duration,
    ) -> CoordinatorHandle {
        let next_seq = history.last().map(|e| e.seq + 1).unwrap_or(0);
        let mut ring = VecDeque::with_capacity(RING_CAPACITY.min(history.len() + 16));
        for event in history {
            ring.push_back(event);
        }
        while ring.len() > RING_CAPACITY {
            ring.pop_front();
        }

        let now = clock::now_epoch_secs();
        let snapshot = Arc::new(ArcSwap::from_pointee(SessionSnapshot {
            session_id: session_id.clone(),
            next_seq,
            subscriber_count: 0,
            last_activity_epoch: now,
        }));

        let (command_tx, command_rx) = mpsc::channel(256);
        let actor = Coordinator {
            session_id: session_id.clone(),
            ring,
            next_seq,
            subscribers: Vec::new(),
            persist_tx,
            snapshot: snapshot.clone(),
            last_activity_epoch: now,
        };
        tokio::spawn(actor.run(command_rx, heartbeat));

        CoordinatorHandle {
            session_id,
            command_tx,
            snapshot,
        }
    }

    async fn run(mut self, mut command_rx: mpsc::Receiver<CoordinatorCommand>, heartbeat: Duration) {
        info!(
            component = "coordinator",
            event = "coordinator.started",
            session_id = %self.session_id,
            next_seq = self.next_seq,
            "Coordinator started"
        );

        let mut ticker = tokio::time::interval(heartbeat);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                cmd = command_rx.recv() => {
                    match cmd {
                        Some(cmd) => self.handle(cmd).await,
                        None => break,
                    }
                }

                _ = ticker.tick() => {
                    self.broadcast(SubscriberMessage::Heartbeat);
                    self.publish_subscriber_count_if_changed();

                    let idle = clock::now_epoch_secs().saturating_sub(self.last_activity_epoch);
                    if self.subscribers.is_empty() && idle > IDLE_GC_SECS {
                        debug!(
                            component = "coordinator",
                            event = "coordinator.gc",
                            session_id = %self.session_id,
                            idle_secs = idle,
                            "Idle coordinator going cold"
                        );
                        break;
                    }
                }
            }
        }

        info!(
            component = "coordinator",
            event = "coordinator.stopped",
            session_id = %self.session_id,
            "Coordinator stopped"
        );
    }

    async fn handle(&mut self, cmd: CoordinatorCommand) {
        match cmd {
            CoordinatorCommand::Attach {
                subscriber_id,
                tx,
                reply,
            } => {
                self.touch();
                // History lands in the subscriber's own channel before
                // it joins the broadcast list, so no live event can
                // overtake the replay.
                let history = SubscriberMessage::History {
                    events: self.ring.iter().cloned().collect(),
                    subscriber_count: self.subscribers.len() + 1,
                };
                if tx.try_send(history).is_err() {
                    warn!(
                        component = "coordinator",
                        session_id = %self.session_id,
                        subscriber_id = %subscriber_id,
                        "Subscriber rejected history frame, not attaching"
                    );
                    let _ = reply.send(self.subscribers.len());
                    return;
                }

                self.subscribers.retain(|s| s.id != subscriber_id);
                self.subscribers.push(Subscriber {
                    id: subscriber_id,
                    tx,
                });
                let count = self.subscribers.len();
                let _ = reply.send(count);
                self.broadcast(SubscriberMessage::SubscriberCount { count });
                self.refresh_snapshot();
            }

            CoordinatorCommand::Append { event } => {
                self.touch();
                if event.seq < self.next_seq {
                    debug!(
                        component = "coordinator",
                        session_id = %self.session_id,
                        seq = event.seq,
                        next_seq = self.next_seq,
                        "Dropping duplicate event"
                    );
                    return;
                }
                if event.seq > self.next_seq {
                    warn!(
                        component = "coordinator",
                        event = "coordinator.seq_gap",
                        session_id = %self.session_id,
                        seq = event.seq,
                        next_seq = self.next_seq,
                        "Sequence gap, accepting"
                    );
                }
                self.next_seq = event.seq + 1;

                if self.ring.len() == RING_CAPACITY {
                    self.ring.pop_front();
                }
                self.ring.push_back(event.clone());

                // Durable store is unbounded; memory is the capped window
                if self
                    .persist_tx
                    .try_send(PersistCommand::EventAppend {
                        event: event.clone(),
                    })
                    .is_err()
                {
                    warn!(
                        component = "coordinator",
                        session_id = %self.session_id,
                        "Persistence channel full, event not persisted"
                    );
                }
                let _ = self.persist_tx.try_send(PersistCommand::SessionTouch {
                    id: self.session_id.clone(),
                    last_activity_at: clock::now_iso(),
                });

                self.broadcast(SubscriberMessage::Event { event });
                self.publish_subscriber_count_if_changed();
                self.refresh_snapshot();
            }

            CoordinatorCommand::Detach { subscriber_id } => {
                let before = self.subscribers.len();
                self.subscribers.retain(|s| s.id != subscriber_id);
                if self.subscribers.len() != before {
                    let count = self.subscribers.len();
                    self.broadcast(SubscriberMessage::SubscriberCount { count });
                }
                self.refresh_snapshot();
            }

            CoordinatorCommand::Clear { reply } => {
                self.touch();
                self.ring.clear();
                self.next_seq = 0;
                if self
                    .persist_tx
                    .try_send(PersistCommand::SessionClear {
                        id: self.session_id.clone(),
                    })
                    .is_err()
                {
                    warn!(
                        component = "coordinator",
                        session_id = %self.session_id,
                        "Persistence channel full, clear not persisted"
                    );
                }
                self.broadcast(SubscriberMessage::Reset);
                self.refresh_snapshot();
                let _ = reply.send(());
            }

            CoordinatorCommand::NextSeq { reply } => {
                let _ = reply.send(self.next_seq);
            }
        }
    }

    /// Send to every subscriber in attachment order. A failed send
    /// removes that subscriber and nobody else.
    fn broadcast(&mut self, msg: SubscriberMessage) {
        self.subscribers
            .retain(|s| s.tx.try_send(msg.clone()).is_ok());
    }

    fn publish_subscriber_count_if_changed(&mut self) {
        let published = self.snapshot.load().subscriber_count;
        let count = self.subscribers.len();
        if count != published {
            self.broadcast(SubscriberMessage::SubscriberCount { count });
            self.refresh_snapshot();
        }
    }

    fn touch(&mut self) {
        self.last_activity_epoch = clock::now_epoch_secs();
    }

    fn refresh_snapshot(&self) {
        self.snapshot.store(Arc::new(SessionSnapshot {
            session_id: self.session_id.clone(),
            next_seq: self.next_seq,
            subscriber_count: self.subscribers.len(),
            last_activity_epoch: self.last_activity_epoch,
        }));
    }
}

/// Registry of live coordinators. Cold sessions are loaded lazily from
/// the transcript store on first access.
pub struct CoordinatorRegistry {
    sessions: DashMap<String, CoordinatorHandle>,
    persist_tx: mpsc::Sender<PersistCommand>,
    db_path: PathBuf,
    heartbeat: Duration,
}

impl CoordinatorRegistry {
    pub fn new(
        persist_tx: mpsc::Sender<PersistCommand>,
        db_path: PathBuf,
        heartbeat: Duration,
    ) -> Self {
        Self {
            sessions: DashMap::new(),
            persist_tx,
            db_path,
            heartbeat,
        }
    }

    /// Get a live handle, warming the session from the durable
    /// transcript when it is cold.
    pub async fn get_or_load(&self, session_id: &str) -> CoordinatorHandle {
        if let Some(handle) = self.get(session_id) {
            return handle;
        }

        let history = persistence::load_events(
            self.db_path.clone(),
            session_id.to_string(),
            RING_CAPACITY,
        )
        .await
        .unwrap_or_else(|e| {
            warn!(
                component = "coordinator",
                session_id = %session_id,
                error = %e,
                "History load failed, warming empty"
            );
            Vec::new()
        });

        let handle = Coordinator::spawn(
            session_id.to_string(),
            history,
            self.persist_tx.clone(),
            self.heartbeat,
        );

        // A racing warm-up may have won; keep whichever is live
        match self.sessions.entry(session_id.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(mut occupied) => {
                if occupied.get().is_closed() {
                    occupied.insert(handle.clone());
                    handle
                } else {
                    occupied.get().clone()
                }
            }
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                vacant.insert(handle.clone());
                handle
            }
        }
    }

    /// Get a live handle without warming a cold session.
    pub fn get(&self, session_id: &str) -> Option<CoordinatorHandle> {
        let handle = self.sessions.get(session_id)?;
        if handle.is_closed() {
            drop(handle);
            self.sessions.remove(session_id);
            return None;
        }
        Some(handle.clone())
    }

    pub fn remove(&self, session_id: &str) {
        self.sessions.remove(session_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_protocol::EventPayload;

    fn event(session: &str, seq: u64, text: &str) -> Event {
        Event::new(
            session,
            seq,
            clock::now_iso(),
            EventPayload::AssistantText {
                text: text.to_string(),
            },
        )
    }

    fn spawn_bare(session: &str, history: Vec<Event>) -> (CoordinatorHandle, mpsc::Receiver<PersistCommand>) {
        let (persist_tx, persist_rx) = mpsc::channel(64);
        let handle = Coordinator::spawn(
            session.to_string(),
            history,
            persist_tx,
            Duration::from_secs(60),
        );
        (handle, persist_rx)
    }

    #[tokio::test]
    async fn attach_replays_history_before_live_events() {
        let (handle, _persist_rx) =
            spawn_bare("s1", vec![event("s1", 0, "old-0"), event("s1", 1, "old-1")]);

        let (tx, mut rx) = mpsc::channel(64);
        handle.attach("sub-1".to_string(), tx).await;
        handle.append(event("s1", 2, "live")).await;

        match rx.recv().await.expect("history frame") {
            SubscriberMessage::History {
                events,
                subscriber_count,
            } => {
                assert_eq!(events.len(), 2);
                assert_eq!(events[1].seq, 1);
                assert_eq!(subscriber_count, 1);
            }
            other => panic!("expected history first, got {:?}", other),
        }

        // Count broadcast from the attach, then the live event
        let mut saw_live = false;
        for _ in 0..2 {
            match rx.recv().await.expect("frame") {
                SubscriberMessage::Event { event } => {
                    assert_eq!(event.seq, 2);
                    saw_live = true;
                }
                SubscriberMessage::SubscriberCount { count } => assert_eq!(count, 1),
                other => panic!("unexpected frame {:?}", other),
            }
        }
        assert!(saw_live);
    }

    #[tokio::test]
    async fn duplicate_seq_is_dropped() {
        let (handle, _persist_rx) = spawn_bare("s2", vec![]);

        handle.append(event("s2", 0, "first")).await;
        handle.append(event("s2", 0, "dup")).await;
        assert_eq!(handle.next_seq().await, 1);
    }

    #[tokio::test]
    async fn failed_subscriber_is_removed_others_keep_receiving() {
        let (handle, _persist_rx) = spawn_bare("s3", vec![]);

        // Capacity 1: the history frame fills it, the next broadcast fails
        let (dead_tx, dead_rx) = mpsc::channel(1);
        handle.attach("dead".to_string(), dead_tx).await;
        drop(dead_rx);

        let (live_tx, mut live_rx) = mpsc::channel(64);
        handle.attach("live".to_string(), live_tx).await;

        handle.append(event("s3", 0, "payload")).await;

        // Drain until the live event arrives; the dead subscriber must
        // not have wedged the actor
        loop {
            match live_rx.recv().await.expect("frame") {
                SubscriberMessage::Event { event } => {
                    assert_eq!(event.seq, 0);
                    break;
                }
                _ => continue,
            }
        }
        assert_eq!(handle.snapshot().subscriber_count, 1);
    }

    #[tokio::test]
    async fn clear_resets_seq_and_broadcasts_reset() {
        let (handle, mut persist_rx) = spawn_bare("s4", vec![event("s4", 0, "a")]);

        let (tx, mut rx) = mpsc::channel(64);
        handle.attach("sub".to_string(), tx).await;
        handle.clear().await;
        assert_eq!(handle.next_seq().await, 0);

        loop {
            match rx.recv().await.expect("frame") {
                SubscriberMessage::Reset => break,
                _ => continue,
            }
        }

        let mut saw_clear = false;
        while let Ok(cmd) = persist_rx.try_recv() {
            if matches!(cmd, PersistCommand::SessionClear { .. }) {
                saw_clear = true;
            }
        }
        assert!(saw_clear);
    }

    #[tokio::test]
    async fn next_seq_seeds_from_history() {
        let (handle, _persist_rx) =
            spawn_bare("s5", vec![event("s5", 7, "x")]);
        assert_eq!(handle.next_seq().await, 8);
    }
}
