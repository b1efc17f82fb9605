//! Event routing from log records to the fan-out dispatcher.
//!
//! A static table keyed by `(topic, event family)` decides whether a record
//! belongs on its topic at all. Handlers validate the payload, enforce
//! per-entity timestamp monotonicity, compute the routing-key set, and hand
//! the event to the dispatcher. Families without routing-key rules
//! (reference data, market data, limits, workflow transitions) validate and
//! count only; they are the hook point for domain modules.

use std::sync::Arc;

use dashmap::DashMap;

use crate::error::{AppError, AppResult};
use crate::models::routing::{
    alert_event_keys, inventory_event_keys, locate_event_keys, position_event_keys,
};
use crate::models::{
    CalculationType, Channel, EventEnvelope, EventPayload, LocateStatus,
};
use crate::services::dispatcher::FanoutDispatcher;

pub const TOPIC_WORKFLOW_EVENTS: &str = "workflow-events";
pub const TOPIC_LOCATE_EVENTS: &str = "locate-events";
pub const TOPIC_INVENTORY_EVENTS: &str = "inventory-events";
pub const TOPIC_LIMIT_EVENTS: &str = "limit-events";
pub const TOPIC_ALERT_EVENTS: &str = "alert-events";

pub const MSG_POSITION_UPDATE: &str = "POSITION_UPDATE";
pub const MSG_SETTLEMENT_LADDER_UPDATE: &str = "SETTLEMENT_LADDER_UPDATE";
pub const MSG_ALERT: &str = "ALERT";

pub fn inventory_message_type(calculation_type: CalculationType) -> &'static str {
    match calculation_type {
        CalculationType::ForLoan => "INVENTORY_FOR_LOAN",
        CalculationType::ForPledge => "INVENTORY_FOR_PLEDGE",
        CalculationType::ShortSell => "INVENTORY_SHORT_SELL",
        CalculationType::Locate => "INVENTORY_LOCATE",
        CalculationType::Overborrow => "INVENTORY_OVERBORROW",
    }
}

pub fn locate_message_type(status: LocateStatus) -> &'static str {
    match status {
        LocateStatus::Requested => "LOCATE_REQUEST",
        LocateStatus::Approved => "LOCATE_APPROVAL",
        LocateStatus::Rejected => "LOCATE_REJECTION",
        LocateStatus::Cancelled => "LOCATE_CANCELLATION",
        LocateStatus::Expired => "LOCATE_EXPIRY",
    }
}

pub struct EventRouter {
    dispatcher: Arc<FanoutDispatcher>,
    /// Last accepted event time per entity key, for monotonicity checks.
    clocks: DashMap<String, i64>,
}

impl EventRouter {
    pub fn new(dispatcher: Arc<FanoutDispatcher>) -> Self {
        Self {
            dispatcher,
            clocks: DashMap::new(),
        }
    }

    /// True when the family is legal cargo for the topic.
    fn accepts(topic: &str, payload: &EventPayload) -> bool {
        matches!(
            (topic, payload),
            (
                TOPIC_WORKFLOW_EVENTS,
                EventPayload::Position(_) | EventPayload::Workflow(_)
            ) | (TOPIC_LOCATE_EVENTS, EventPayload::Locate(_))
                | (
                    TOPIC_INVENTORY_EVENTS,
                    EventPayload::Inventory(_)
                        | EventPayload::ReferenceData(_)
                        | EventPayload::MarketData(_)
                )
                | (TOPIC_LIMIT_EVENTS, EventPayload::Limit(_))
                | (TOPIC_ALERT_EVENTS, EventPayload::Alert(_))
        )
    }

    /// Rejects events whose time runs strictly backwards for their entity.
    /// Equal timestamps pass: at-least-once delivery replays records.
    fn check_monotonic(&self, envelope: &EventEnvelope) -> AppResult<()> {
        let key = envelope.payload.entity_key();
        let ts = envelope.event_time.timestamp_millis();

        match self.clocks.entry(key) {
            dashmap::mapref::entry::Entry::Occupied(mut entry) => {
                if *entry.get() > ts {
                    return Err(AppError::Validation(format!(
                        "event time regressed for {} ({} < {})",
                        entry.key(),
                        ts,
                        entry.get()
                    )));
                }
                entry.insert(ts);
            }
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                entry.insert(ts);
            }
        }
        Ok(())
    }

    /// Validates the record and fans it out. Handlers hold no registry or
    /// session state; the dispatcher is the only side effect.
    pub fn route(&self, topic: &str, envelope: &EventEnvelope) -> AppResult<()> {
        if !Self::accepts(topic, &envelope.payload) {
            return Err(AppError::Handler(format!(
                "{} event is not legal cargo for topic {topic}",
                envelope.payload.family()
            )));
        }

        envelope.payload.validate()?;
        self.check_monotonic(envelope)?;

        match &envelope.payload {
            EventPayload::Position(snapshot) => {
                let message_type = if snapshot.settlement_ladder.is_some() {
                    MSG_SETTLEMENT_LADDER_UPDATE
                } else {
                    MSG_POSITION_UPDATE
                };
                self.dispatcher.dispatch(
                    Channel::Positions,
                    &position_event_keys(snapshot),
                    message_type,
                    envelope.event_id,
                    envelope.correlation_id,
                    serde_json::to_value(snapshot)?,
                );
            }
            EventPayload::Inventory(snapshot) => {
                self.dispatcher.dispatch(
                    Channel::Inventory,
                    &inventory_event_keys(snapshot),
                    inventory_message_type(snapshot.calculation_type),
                    envelope.event_id,
                    envelope.correlation_id,
                    serde_json::to_value(snapshot)?,
                );
            }
            EventPayload::Locate(decision) => {
                self.dispatcher.dispatch(
                    Channel::Locates,
                    &locate_event_keys(decision),
                    locate_message_type(decision.status),
                    envelope.event_id,
                    envelope.correlation_id,
                    serde_json::to_value(decision)?,
                );
            }
            EventPayload::Alert(alert) => {
                self.dispatcher.dispatch(
                    Channel::Alerts,
                    &alert_event_keys(alert),
                    MSG_ALERT,
                    envelope.event_id,
                    envelope.correlation_id,
                    serde_json::to_value(alert)?,
                );
            }
            EventPayload::ReferenceData(_)
            | EventPayload::MarketData(_)
            | EventPayload::Limit(_)
            | EventPayload::Workflow(_) => {
                tracing::debug!(
                    topic,
                    family = envelope.payload.family(),
                    event_id = %envelope.event_id,
                    "validated non-distributed event"
                );
            }
        }

        Ok(())
    }
}
