//! Server → Subscriber messages

use serde::{Deserialize, Serialize};

use crate::types::Event;

/// Messages sent to a subscriber connection over WebSocket.
///
/// On attach the subscriber receives exactly one `History` message
/// before any `Event`: catch-up replay is always delivered before
/// live traffic.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SubscriberMessage {
    /// Catch-up replay sent once, immediately after attach
    History {
        events: Vec<Event>,
        subscriber_count: usize,
    },

    /// One live event
    Event { event: Event },

    /// A subscriber attached or detached
    SubscriberCount { count: usize },

    /// History was cleared for this session
    Reset,

    /// Periodic liveness probe; reaps dead sockets that never
    /// signalled closure
    Heartbeat,

    /// Terminal failure on this connection
    Error { code: String, message: String },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::EventPayload;

    #[test]
    fn history_frame_roundtrip() {
        let msg = SubscriberMessage::History {
            events: vec![Event::new(
                "s",
                0,
                "2026-01-01T00:00:00Z".to_string(),
                EventPayload::KeepAlive,
            )],
            subscriber_count: 2,
        };
        let json = serde_json::to_string(&msg).expect("serialize");
        assert!(json.contains(r#""type":"history""#));
        let reparsed: SubscriberMessage = serde_json::from_str(&json).expect("deserialize");
        match reparsed {
            SubscriberMessage::History {
                events,
                subscriber_count,
            } => {
                assert_eq!(events.len(), 1);
                assert_eq!(subscriber_count, 2);
            }
            other => panic!("unexpected variant: {:?}", other),
        }
    }
}
