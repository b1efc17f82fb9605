//! Fan-out dispatcher.
//!
//! Serializes each outbound message exactly once and offers the shared
//! buffer to every matching session's outbox. Enqueue never blocks, so one
//! saturated session cannot slow the consumer workers or its peers; a
//! session that is gone or no longer Open is skipped.

use std::sync::Arc;

use serde_json::Value;
use uuid::Uuid;

use crate::metrics;
use crate::models::Channel;
use crate::websocket::messages::ServerMessage;
use crate::websocket::session::{EnqueueResult, SessionManager};
use crate::websocket::subscription::SubscriptionRegistry;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchOutcome {
    pub matched: usize,
    pub enqueued: u64,
    pub dropped: u64,
}

pub struct FanoutDispatcher {
    registry: Arc<SubscriptionRegistry>,
    sessions: Arc<SessionManager>,
}

impl FanoutDispatcher {
    pub fn new(registry: Arc<SubscriptionRegistry>, sessions: Arc<SessionManager>) -> Self {
        Self { registry, sessions }
    }

    pub fn dispatch(
        &self,
        channel: Channel,
        routing_keys: &[String],
        message_type: &str,
        event_id: Uuid,
        correlation_id: Option<Uuid>,
        payload: Value,
    ) -> DispatchOutcome {
        let mut outcome = DispatchOutcome::default();

        let candidates = self.registry.matches(channel, routing_keys);
        if candidates.is_empty() {
            return outcome;
        }
        outcome.matched = candidates.len();

        let message = ServerMessage::event(event_id, message_type, correlation_id, payload);
        let frame = match message.to_json() {
            Ok(json) => Arc::new(json),
            Err(e) => {
                tracing::error!(message_type, error = %e, "failed to serialize outbound message");
                return DispatchOutcome::default();
            }
        };

        for session_id in candidates {
            let Some(session) = self.sessions.resolve(session_id) else {
                continue;
            };
            match session.enqueue(frame.clone()) {
                EnqueueResult::Enqueued | EnqueueResult::EnqueuedSlow => outcome.enqueued += 1,
                EnqueueResult::Dropped => outcome.dropped += 1,
                EnqueueResult::Rejected => {}
            }
        }

        metrics::record_messages_dispatched(channel.as_str(), outcome.enqueued);
        if outcome.dropped > 0 {
            metrics::record_messages_dropped(channel.as_str(), outcome.dropped);
        }
        outcome
    }
}
