//! Client/server wire messages.
//!
//! Inbound frames follow the `SUBSCRIBE_<CHANNEL>` / `UNSUBSCRIBE_<CHANNEL>`
//! / `PING` grammar. Outbound frames share one JSON envelope regardless of
//! message type. Parsing distinguishes malformed JSON (the session stays
//! open, `MESSAGE_PARSING_ERROR`) from a well-formed frame of an unknown
//! type (`UNSUPPORTED_MESSAGE_TYPE`).

use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

use super::subscription::{
    AlertFilter, FilterPredicate, InventoryFilter, LocateFilter, PositionFilter,
};
use crate::models::Channel;

pub const CLOSE_NORMAL: u16 = 1000;
pub const CLOSE_POLICY_VIOLATION: u16 = 1008;
pub const CLOSE_SERVER_ERROR: u16 = 1011;
pub const CLOSE_SLOW_CONSUMER: u16 = 4001;

pub const ERR_MESSAGE_PARSING: &str = "MESSAGE_PARSING_ERROR";
pub const ERR_UNSUPPORTED_TYPE: &str = "UNSUPPORTED_MESSAGE_TYPE";
pub const ERR_CHANNEL_FORBIDDEN: &str = "CHANNEL_FORBIDDEN";

pub const MSG_CONNECTION_ACK: &str = "CONNECTION_ACK";
pub const MSG_SUBSCRIPTION_CONFIRMED: &str = "SUBSCRIPTION_CONFIRMED";
pub const MSG_PONG: &str = "PONG";
pub const MSG_ERROR: &str = "ERROR";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionAction {
    Subscribe,
    Unsubscribe,
}

impl SubscriptionAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionAction::Subscribe => "SUBSCRIBED",
            SubscriptionAction::Unsubscribe => "UNSUBSCRIBED",
        }
    }
}

/// Inbound message grammar.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "messageType")]
pub enum ClientMessage {
    #[serde(rename = "SUBSCRIBE_POSITIONS")]
    SubscribePositions {
        #[serde(default)]
        payload: PositionFilter,
    },
    #[serde(rename = "UNSUBSCRIBE_POSITIONS")]
    UnsubscribePositions {
        #[serde(default)]
        payload: PositionFilter,
    },
    #[serde(rename = "SUBSCRIBE_INVENTORY")]
    SubscribeInventory {
        #[serde(default)]
        payload: InventoryFilter,
    },
    #[serde(rename = "UNSUBSCRIBE_INVENTORY")]
    UnsubscribeInventory {
        #[serde(default)]
        payload: InventoryFilter,
    },
    #[serde(rename = "SUBSCRIBE_LOCATES")]
    SubscribeLocates {
        #[serde(default)]
        payload: LocateFilter,
    },
    #[serde(rename = "UNSUBSCRIBE_LOCATES")]
    UnsubscribeLocates {
        #[serde(default)]
        payload: LocateFilter,
    },
    #[serde(rename = "SUBSCRIBE_ALERTS")]
    SubscribeAlerts {
        #[serde(default)]
        payload: AlertFilter,
    },
    #[serde(rename = "UNSUBSCRIBE_ALERTS")]
    UnsubscribeAlerts {
        #[serde(default)]
        payload: AlertFilter,
    },
    #[serde(rename = "PING")]
    Ping,
}

const KNOWN_MESSAGE_TYPES: &[&str] = &[
    "SUBSCRIBE_POSITIONS",
    "UNSUBSCRIBE_POSITIONS",
    "SUBSCRIBE_INVENTORY",
    "UNSUBSCRIBE_INVENTORY",
    "SUBSCRIBE_LOCATES",
    "UNSUBSCRIBE_LOCATES",
    "SUBSCRIBE_ALERTS",
    "UNSUBSCRIBE_ALERTS",
    "PING",
];

impl ClientMessage {
    /// Splits a subscription management frame into its action and
    /// predicate; `None` for `PING`.
    pub fn subscription(self) -> Option<(SubscriptionAction, FilterPredicate)> {
        use ClientMessage::*;
        use SubscriptionAction::*;
        match self {
            SubscribePositions { payload } => Some((Subscribe, FilterPredicate::Position(payload))),
            UnsubscribePositions { payload } => {
                Some((Unsubscribe, FilterPredicate::Position(payload)))
            }
            SubscribeInventory { payload } => {
                Some((Subscribe, FilterPredicate::Inventory(payload)))
            }
            UnsubscribeInventory { payload } => {
                Some((Unsubscribe, FilterPredicate::Inventory(payload)))
            }
            SubscribeLocates { payload } => Some((Subscribe, FilterPredicate::Locate(payload))),
            UnsubscribeLocates { payload } => Some((Unsubscribe, FilterPredicate::Locate(payload))),
            SubscribeAlerts { payload } => Some((Subscribe, FilterPredicate::Alert(payload))),
            UnsubscribeAlerts { payload } => Some((Unsubscribe, FilterPredicate::Alert(payload))),
            Ping => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ClientMessageError {
    /// Body is not JSON, or a known type carried a malformed payload.
    Malformed(String),
    /// Well-formed JSON with an unrecognized `messageType`.
    Unsupported(String),
}

pub fn parse_client_message(text: &str) -> Result<ClientMessage, ClientMessageError> {
    let value: Value = serde_json::from_str(text)
        .map_err(|e| ClientMessageError::Malformed(e.to_string()))?;

    let message_type = value
        .get("messageType")
        .and_then(Value::as_str)
        .ok_or_else(|| ClientMessageError::Malformed("missing messageType".into()))?;

    if !KNOWN_MESSAGE_TYPES.contains(&message_type) {
        return Err(ClientMessageError::Unsupported(message_type.to_string()));
    }

    serde_json::from_value(value).map_err(|e| ClientMessageError::Malformed(e.to_string()))
}

/// Envelope shared by every server-initiated frame.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerMessage {
    pub message_id: Uuid,
    pub message_type: String,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<Uuid>,
    pub payload: Value,
}

impl ServerMessage {
    pub fn new(message_type: &str, correlation_id: Option<Uuid>, payload: Value) -> Self {
        Self {
            message_id: Uuid::new_v4(),
            message_type: message_type.to_string(),
            timestamp: Utc::now(),
            correlation_id,
            payload,
        }
    }

    /// Distribution frame for a log event. The event id doubles as the
    /// message id so a redelivered event reaches clients with the same
    /// identity and they can deduplicate.
    pub fn event(
        event_id: Uuid,
        message_type: &str,
        correlation_id: Option<Uuid>,
        payload: Value,
    ) -> Self {
        Self {
            message_id: event_id,
            message_type: message_type.to_string(),
            timestamp: Utc::now(),
            correlation_id,
            payload,
        }
    }

    pub fn connection_ack(session_id: Uuid) -> Self {
        Self::new(
            MSG_CONNECTION_ACK,
            None,
            serde_json::json!({ "sessionId": session_id }),
        )
    }

    pub fn subscription_confirmed(
        channel: Channel,
        action: SubscriptionAction,
        filter: Value,
    ) -> Self {
        Self::new(
            MSG_SUBSCRIPTION_CONFIRMED,
            None,
            serde_json::json!({
                "channel": channel.as_str(),
                "action": action.as_str(),
                "filter": filter,
            }),
        )
    }

    pub fn pong() -> Self {
        Self::new(MSG_PONG, None, Value::Null)
    }

    pub fn error(code: &str, detail: &str) -> Self {
        Self::new(
            MSG_ERROR,
            None,
            serde_json::json!({ "code": code, "detail": detail }),
        )
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subscribe_locates_parses_filter_fields() {
        let msg = parse_client_message(
            r#"{"messageType":"SUBSCRIBE_LOCATES","payload":{"securityId":"SEC-EQ-001"}}"#,
        )
        .unwrap();

        let (action, predicate) = msg.subscription().unwrap();
        assert_eq!(action, SubscriptionAction::Subscribe);
        assert_eq!(
            predicate,
            FilterPredicate::Locate(LocateFilter {
                security_id: Some("SEC-EQ-001".into()),
                ..Default::default()
            })
        );
    }

    #[test]
    fn subscribe_without_payload_is_the_wildcard() {
        let msg = parse_client_message(r#"{"messageType":"SUBSCRIBE_INVENTORY"}"#).unwrap();
        let (_, predicate) = msg.subscription().unwrap();
        assert_eq!(predicate.canonical_keys(), vec!["all".to_string()]);
    }

    #[test]
    fn unsubscribe_carries_the_same_payload_shape() {
        let msg = parse_client_message(
            r#"{"messageType":"UNSUBSCRIBE_POSITIONS","payload":{"bookId":"EQ-01","securityId":"SEC-EQ-001"}}"#,
        )
        .unwrap();
        let (action, predicate) = msg.subscription().unwrap();
        assert_eq!(action, SubscriptionAction::Unsubscribe);
        assert_eq!(predicate.channel(), Channel::Positions);
    }

    #[test]
    fn ping_parses_without_payload() {
        let msg = parse_client_message(r#"{"messageType":"PING"}"#).unwrap();
        assert_eq!(msg, ClientMessage::Ping);
        assert!(msg.subscription().is_none());
    }

    #[test]
    fn unknown_message_type_is_unsupported() {
        let err = parse_client_message(r#"{"messageType":"SUBSCRIBE_TRADES"}"#).unwrap_err();
        assert_eq!(err, ClientMessageError::Unsupported("SUBSCRIBE_TRADES".into()));
    }

    #[test]
    fn malformed_json_is_a_parsing_error() {
        assert!(matches!(
            parse_client_message("{not json"),
            Err(ClientMessageError::Malformed(_))
        ));
        assert!(matches!(
            parse_client_message(r#"{"payload":{}}"#),
            Err(ClientMessageError::Malformed(_))
        ));
    }

    #[test]
    fn server_envelope_uses_camel_case_fields() {
        let msg = ServerMessage::new(
            "LOCATE_APPROVAL",
            Some(Uuid::new_v4()),
            serde_json::json!({ "locateId": "LOC-1" }),
        );
        let json: Value = serde_json::from_str(&msg.to_json().unwrap()).unwrap();

        assert!(json.get("messageId").is_some());
        assert_eq!(json["messageType"], "LOCATE_APPROVAL");
        assert!(json.get("timestamp").is_some());
        assert!(json.get("correlationId").is_some());
        assert_eq!(json["payload"]["locateId"], "LOC-1");
    }

    #[test]
    fn connection_ack_carries_session_id() {
        let session_id = Uuid::new_v4();
        let ack = ServerMessage::connection_ack(session_id);
        assert_eq!(ack.message_type, MSG_CONNECTION_ACK);
        assert_eq!(ack.payload["sessionId"], serde_json::json!(session_id));
    }

    #[test]
    fn subscription_confirmed_echoes_action_and_filter() {
        let msg = ServerMessage::subscription_confirmed(
            Channel::Locates,
            SubscriptionAction::Unsubscribe,
            serde_json::json!({ "securityId": "SEC-EQ-001" }),
        );
        assert_eq!(msg.payload["channel"], "locates");
        assert_eq!(msg.payload["action"], "UNSUBSCRIBED");
    }
}
