use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{AppError, AppResult};

pub mod routing;

/// Current schema version for all log-borne events.
pub const SCHEMA_VERSION: u32 = 1;

/// Logical event families exposed to clients, each on its own endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    Positions,
    Inventory,
    Locates,
    Alerts,
    Admin,
}

impl Channel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::Positions => "positions",
            Channel::Inventory => "inventory",
            Channel::Locates => "locates",
            Channel::Alerts => "alerts",
            Channel::Admin => "admin",
        }
    }

    pub fn all() -> [Channel; 5] {
        [
            Channel::Positions,
            Channel::Inventory,
            Channel::Locates,
            Channel::Alerts,
            Channel::Admin,
        ]
    }
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Envelope shared by every event on the log.
///
/// The payload union is flattened so the encoded form is self-describing:
/// `eventType` discriminates, `payload` carries the family record.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventEnvelope {
    pub event_id: Uuid,
    pub event_time: DateTime<Utc>,
    pub schema_version: u32,
    pub source: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<Uuid>,
    #[serde(flatten)]
    pub payload: EventPayload,
}

impl EventEnvelope {
    pub fn new(source: impl Into<String>, payload: EventPayload) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            event_time: Utc::now(),
            schema_version: SCHEMA_VERSION,
            source: source.into(),
            correlation_id: None,
            payload,
        }
    }

    pub fn with_correlation_id(mut self, correlation_id: Uuid) -> Self {
        self.correlation_id = Some(correlation_id);
        self
    }
}

/// Closed union over the event families carried on the log.
///
/// The set is closed by protocol contract; handlers dispatch on the tag.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "eventType", content = "payload")]
pub enum EventPayload {
    #[serde(rename = "REFERENCE_DATA_UPDATE")]
    ReferenceData(ReferenceDataUpdate),
    #[serde(rename = "MARKET_DATA_TICK")]
    MarketData(MarketDataTick),
    #[serde(rename = "POSITION_SNAPSHOT")]
    Position(PositionSnapshot),
    #[serde(rename = "INVENTORY_SNAPSHOT")]
    Inventory(InventorySnapshot),
    #[serde(rename = "LOCATE_DECISION")]
    Locate(LocateDecision),
    #[serde(rename = "LIMIT_UPDATE")]
    Limit(LimitUpdate),
    #[serde(rename = "ALERT_NOTICE")]
    Alert(AlertNotice),
    #[serde(rename = "WORKFLOW_TRANSITION")]
    Workflow(WorkflowTransition),
}

impl EventPayload {
    pub fn family(&self) -> &'static str {
        match self {
            EventPayload::ReferenceData(_) => "reference_data",
            EventPayload::MarketData(_) => "market_data",
            EventPayload::Position(_) => "position",
            EventPayload::Inventory(_) => "inventory",
            EventPayload::Locate(_) => "locate",
            EventPayload::Limit(_) => "limit",
            EventPayload::Alert(_) => "alert",
            EventPayload::Workflow(_) => "workflow",
        }
    }

    /// Identity of the entity this event describes, used for per-key
    /// timestamp monotonicity checks.
    pub fn entity_key(&self) -> String {
        match self {
            EventPayload::ReferenceData(p) => format!("refdata:{}", p.security_id),
            EventPayload::MarketData(p) => format!("marketdata:{}", p.security_id),
            EventPayload::Position(p) => {
                format!("position:{}:{}:{}", p.book_id, p.security_id, p.business_date)
            }
            EventPayload::Inventory(p) => format!(
                "inventory:{}:{}:{}",
                p.security_id, p.calculation_type, p.business_date
            ),
            EventPayload::Locate(p) => format!("locate:{}", p.locate_id),
            EventPayload::Limit(p) => format!("limit:{}:{}", p.client_id, p.limit_type),
            EventPayload::Alert(p) => format!("alert:{}", p.alert_id),
            EventPayload::Workflow(p) => format!("workflow:{}", p.workflow_id),
        }
    }

    pub fn validate(&self) -> AppResult<()> {
        match self {
            EventPayload::ReferenceData(p) => p.validate(),
            EventPayload::MarketData(p) => p.validate(),
            EventPayload::Position(p) => p.validate(),
            EventPayload::Inventory(p) => p.validate(),
            EventPayload::Locate(p) => p.validate(),
            EventPayload::Limit(p) => p.validate(),
            EventPayload::Alert(p) => p.validate(),
            EventPayload::Workflow(p) => p.validate(),
        }
    }
}

fn require(field: &str, value: &str) -> AppResult<()> {
    if value.trim().is_empty() {
        return Err(AppError::Validation(format!("{field} is empty")));
    }
    Ok(())
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReferenceDataUpdate {
    pub security_id: String,
    #[serde(default)]
    pub attributes: serde_json::Value,
}

impl ReferenceDataUpdate {
    pub fn validate(&self) -> AppResult<()> {
        require("securityId", &self.security_id)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MarketDataTick {
    pub security_id: String,
    pub price: f64,
    pub currency: String,
    pub tick_time: DateTime<Utc>,
}

impl MarketDataTick {
    pub fn validate(&self) -> AppResult<()> {
        require("securityId", &self.security_id)?;
        require("currency", &self.currency)?;
        if !self.price.is_finite() {
            return Err(AppError::Validation("price is not finite".into()));
        }
        Ok(())
    }
}

/// One day of the projected settlement ladder.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SettlementDay {
    pub date: NaiveDate,
    pub net_qty: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PositionSnapshot {
    pub book_id: String,
    pub security_id: String,
    pub business_date: NaiveDate,
    pub contractual_qty: f64,
    pub settled_qty: f64,
    pub projected_qty: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub settlement_ladder: Option<Vec<SettlementDay>>,
}

impl PositionSnapshot {
    pub fn validate(&self) -> AppResult<()> {
        require("bookId", &self.book_id)?;
        require("securityId", &self.security_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CalculationType {
    ForLoan,
    ForPledge,
    ShortSell,
    Locate,
    Overborrow,
}

impl CalculationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            CalculationType::ForLoan => "FOR_LOAN",
            CalculationType::ForPledge => "FOR_PLEDGE",
            CalculationType::ShortSell => "SHORT_SELL",
            CalculationType::Locate => "LOCATE",
            CalculationType::Overborrow => "OVERBORROW",
        }
    }
}

impl std::fmt::Display for CalculationType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InventorySnapshot {
    pub security_id: String,
    pub calculation_type: CalculationType,
    pub business_date: NaiveDate,
    pub gross_qty: f64,
    pub available_qty: f64,
    pub decrement_qty: f64,
}

impl InventorySnapshot {
    pub fn validate(&self) -> AppResult<()> {
        require("securityId", &self.security_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LocateStatus {
    Requested,
    Approved,
    Rejected,
    Cancelled,
    Expired,
}

impl LocateStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            LocateStatus::Requested => "REQUESTED",
            LocateStatus::Approved => "APPROVED",
            LocateStatus::Rejected => "REJECTED",
            LocateStatus::Cancelled => "CANCELLED",
            LocateStatus::Expired => "EXPIRED",
        }
    }
}

impl std::fmt::Display for LocateStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocateDecision {
    pub locate_id: String,
    pub security_id: String,
    pub client_id: String,
    pub requestor_id: String,
    pub status: LocateStatus,
    pub requested_qty: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approved_qty: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decision_time: Option<DateTime<Utc>>,
}

impl LocateDecision {
    pub fn validate(&self) -> AppResult<()> {
        require("locateId", &self.locate_id)?;
        require("securityId", &self.security_id)?;
        require("clientId", &self.client_id)?;
        if self.status == LocateStatus::Approved && self.approved_qty.is_none() {
            return Err(AppError::Validation(
                "approved locate carries no approvedQty".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LimitUpdate {
    pub client_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub security_id: Option<String>,
    pub limit_type: String,
    pub limit_amount: f64,
    pub used_amount: f64,
}

impl LimitUpdate {
    pub fn validate(&self) -> AppResult<()> {
        require("clientId", &self.client_id)?;
        require("limitType", &self.limit_type)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AlertSeverity {
    Info,
    Warning,
    Critical,
}

impl AlertSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertSeverity::Info => "INFO",
            AlertSeverity::Warning => "WARNING",
            AlertSeverity::Critical => "CRITICAL",
        }
    }
}

impl std::fmt::Display for AlertSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlertNotice {
    pub alert_id: String,
    pub severity: AlertSeverity,
    pub category: String,
    pub message: String,
}

impl AlertNotice {
    pub fn validate(&self) -> AppResult<()> {
        require("alertId", &self.alert_id)?;
        require("category", &self.category)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowTransition {
    pub workflow_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity_id: Option<String>,
    pub from_state: String,
    pub to_state: String,
    pub actor: String,
}

impl WorkflowTransition {
    pub fn validate(&self) -> AppResult<()> {
        require("workflowId", &self.workflow_id)?;
        require("toState", &self.to_state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn locate_payload() -> EventPayload {
        EventPayload::Locate(LocateDecision {
            locate_id: "LOC-20250115-00001".into(),
            security_id: "SEC-EQ-001".into(),
            client_id: "CP-00001".into(),
            requestor_id: "USR-007".into(),
            status: LocateStatus::Approved,
            requested_qty: 10_000.0,
            approved_qty: Some(10_000.0),
            decision_time: None,
        })
    }

    #[test]
    fn envelope_round_trips_with_flattened_tag() {
        let envelope = EventEnvelope::new("locate-service", locate_payload());
        let json = serde_json::to_value(&envelope).unwrap();

        assert_eq!(json["eventType"], "LOCATE_DECISION");
        assert_eq!(json["schemaVersion"], 1);
        assert_eq!(json["payload"]["locateId"], "LOC-20250115-00001");

        let back: EventEnvelope = serde_json::from_value(json).unwrap();
        assert!(matches!(back.payload, EventPayload::Locate(_)));
        assert_eq!(back.event_id, envelope.event_id);
    }

    #[test]
    fn inventory_calculation_type_uses_wire_tokens() {
        let payload = EventPayload::Inventory(InventorySnapshot {
            security_id: "SEC-EQ-002".into(),
            calculation_type: CalculationType::ShortSell,
            business_date: NaiveDate::from_ymd_opt(2025, 1, 15).unwrap(),
            gross_qty: 500.0,
            available_qty: 400.0,
            decrement_qty: 100.0,
        });
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["payload"]["calculationType"], "SHORT_SELL");
    }

    #[test]
    fn decode_rejects_unknown_event_type() {
        let raw = json!({
            "eventId": Uuid::new_v4(),
            "eventTime": Utc::now(),
            "schemaVersion": 1,
            "source": "unknown",
            "eventType": "SOMETHING_ELSE",
            "payload": {}
        });
        assert!(serde_json::from_value::<EventEnvelope>(raw).is_err());
    }

    #[test]
    fn validation_requires_identity_fields() {
        let mut decision = LocateDecision {
            locate_id: "".into(),
            security_id: "SEC-EQ-001".into(),
            client_id: "CP-00001".into(),
            requestor_id: "USR-007".into(),
            status: LocateStatus::Requested,
            requested_qty: 1.0,
            approved_qty: None,
            decision_time: None,
        };
        assert!(decision.validate().is_err());

        decision.locate_id = "LOC-1".into();
        assert!(decision.validate().is_ok());

        decision.status = LocateStatus::Approved;
        assert!(decision.validate().is_err());
    }

    #[test]
    fn entity_key_distinguishes_dimensions() {
        let a = EventPayload::Position(PositionSnapshot {
            book_id: "EQ-01".into(),
            security_id: "SEC-EQ-001".into(),
            business_date: NaiveDate::from_ymd_opt(2025, 1, 15).unwrap(),
            contractual_qty: 0.0,
            settled_qty: 0.0,
            projected_qty: 0.0,
            settlement_ladder: None,
        });
        let b = EventPayload::Position(PositionSnapshot {
            book_id: "EQ-02".into(),
            security_id: "SEC-EQ-001".into(),
            business_date: NaiveDate::from_ymd_opt(2025, 1, 15).unwrap(),
            contractual_qty: 0.0,
            settled_qty: 0.0,
            projected_qty: 0.0,
            settlement_ladder: None,
        });
        assert_ne!(a.entity_key(), b.entity_key());
    }
}
