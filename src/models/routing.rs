//! Routing-key construction.
//!
//! A routing key is a compact string naming one slice of the event universe:
//! `all`, or `dim:value` segments joined by `|` in a fixed per-family
//! dimension order. Events expose every slice they belong to; subscriptions
//! are stored under the exact keys their predicate matches, which makes
//! event-to-subscription matching a set of hash lookups.

use super::{AlertNotice, InventorySnapshot, LocateDecision, PositionSnapshot};

/// Key matched by wildcard subscriptions and carried by every event.
pub const WILDCARD_KEY: &str = "all";

fn segment(dimension: &str, value: &str) -> String {
    format!("{dimension}:{value}")
}

/// Every subset of the given dimensions, in fixed order; the empty subset is
/// the wildcard key.
fn subset_keys(dims: &[(&str, String)]) -> Vec<String> {
    let n = dims.len() as u32;
    (0..(1u32 << n))
        .map(|mask| {
            let picked: Vec<String> = dims
                .iter()
                .enumerate()
                .filter(|(i, _)| mask & (1 << i) != 0)
                .map(|(_, (dim, value))| segment(dim, value))
                .collect();
            if picked.is_empty() {
                WILDCARD_KEY.to_string()
            } else {
                picked.join("|")
            }
        })
        .collect()
}

/// One key per populated field, plus the wildcard key.
fn per_field_keys(dims: &[(&str, String)]) -> Vec<String> {
    let mut keys = vec![WILDCARD_KEY.to_string()];
    keys.extend(dims.iter().map(|(dim, value)| segment(dim, value)));
    keys
}

/// Position events carry every book/security/date combination.
pub fn position_event_keys(snapshot: &PositionSnapshot) -> Vec<String> {
    subset_keys(&[
        ("book", snapshot.book_id.clone()),
        ("security", snapshot.security_id.clone()),
        ("date", snapshot.business_date.to_string()),
    ])
}

/// Inventory events carry every security/type/date combination.
pub fn inventory_event_keys(snapshot: &InventorySnapshot) -> Vec<String> {
    subset_keys(&[
        ("security", snapshot.security_id.clone()),
        ("type", snapshot.calculation_type.as_str().to_string()),
        ("date", snapshot.business_date.to_string()),
    ])
}

/// Locate events match per field; there are no combination keys.
pub fn locate_event_keys(decision: &LocateDecision) -> Vec<String> {
    per_field_keys(&[
        ("security", decision.security_id.clone()),
        ("client", decision.client_id.clone()),
        ("status", decision.status.as_str().to_string()),
    ])
}

/// Alerts broadcast on `all` plus severity and category slices.
pub fn alert_event_keys(alert: &AlertNotice) -> Vec<String> {
    per_field_keys(&[
        ("severity", alert.severity.as_str().to_string()),
        ("category", alert.category.clone()),
    ])
}

/// Canonical key for a combination-style predicate: the single combo key
/// over its bound dimensions, or the wildcard when nothing is bound.
pub fn bound_combo_key(dims: &[(&str, Option<&str>)]) -> String {
    let picked: Vec<String> = dims
        .iter()
        .filter_map(|(dim, value)| value.map(|v| segment(dim, v)))
        .collect();
    if picked.is_empty() {
        WILDCARD_KEY.to_string()
    } else {
        picked.join("|")
    }
}

/// Canonical keys for a per-field predicate: one key per bound field, or the
/// wildcard when nothing is bound.
pub fn bound_field_keys(dims: &[(&str, Option<&str>)]) -> Vec<String> {
    let picked: Vec<String> = dims
        .iter()
        .filter_map(|(dim, value)| value.map(|v| segment(dim, v)))
        .collect();
    if picked.is_empty() {
        vec![WILDCARD_KEY.to_string()]
    } else {
        picked
    }
}
