//! Subscription registry.
//!
//! The registry stores, per channel, both representations of every
//! subscription: the canonical routing keys (for event-to-session lookup)
//! and the original predicate (for removal by value equality). Matching an
//! event is a union of hash lookups over its routing keys.
//!
//! Reads vastly outnumber writes, so each channel sits behind its own
//! `std::sync::RwLock`; neither path ever awaits while holding a lock. The
//! registry stores session ids only and never extends a session's lifetime.

use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::routing::{bound_combo_key, bound_field_keys};
use crate::models::Channel;

fn bound(field: &Option<String>) -> Option<&str> {
    field.as_deref().map(str::trim).filter(|s| !s.is_empty())
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PositionFilter {
    pub book_id: Option<String>,
    pub security_id: Option<String>,
    pub business_date: Option<String>,
}

impl PositionFilter {
    pub fn canonical_keys(&self) -> Vec<String> {
        vec![bound_combo_key(&[
            ("book", bound(&self.book_id)),
            ("security", bound(&self.security_id)),
            ("date", bound(&self.business_date)),
        ])]
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct InventoryFilter {
    pub security_id: Option<String>,
    pub calculation_type: Option<String>,
    pub business_date: Option<String>,
}

impl InventoryFilter {
    pub fn canonical_keys(&self) -> Vec<String> {
        vec![bound_combo_key(&[
            ("security", bound(&self.security_id)),
            ("type", bound(&self.calculation_type)),
            ("date", bound(&self.business_date)),
        ])]
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LocateFilter {
    pub security_id: Option<String>,
    pub client_id: Option<String>,
    pub status: Option<String>,
}

impl LocateFilter {
    pub fn canonical_keys(&self) -> Vec<String> {
        bound_field_keys(&[
            ("security", bound(&self.security_id)),
            ("client", bound(&self.client_id)),
            ("status", bound(&self.status)),
        ])
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AlertFilter {
    pub severity: Option<String>,
    pub category: Option<String>,
}

impl AlertFilter {
    pub fn canonical_keys(&self) -> Vec<String> {
        bound_field_keys(&[
            ("severity", bound(&self.severity)),
            ("category", bound(&self.category)),
        ])
    }
}

/// A client-supplied filter, tagged with its channel.
///
/// Null or empty fields are wildcards for their dimension; a predicate with
/// nothing bound is the channel-wide wildcard.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FilterPredicate {
    Position(PositionFilter),
    Inventory(InventoryFilter),
    Locate(LocateFilter),
    Alert(AlertFilter),
}

impl FilterPredicate {
    pub fn channel(&self) -> Channel {
        match self {
            FilterPredicate::Position(_) => Channel::Positions,
            FilterPredicate::Inventory(_) => Channel::Inventory,
            FilterPredicate::Locate(_) => Channel::Locates,
            FilterPredicate::Alert(_) => Channel::Alerts,
        }
    }

    pub fn canonical_keys(&self) -> Vec<String> {
        match self {
            FilterPredicate::Position(f) => f.canonical_keys(),
            FilterPredicate::Inventory(f) => f.canonical_keys(),
            FilterPredicate::Locate(f) => f.canonical_keys(),
            FilterPredicate::Alert(f) => f.canonical_keys(),
        }
    }

    /// Echo of the original filter fields, used in confirmations.
    pub fn describe(&self) -> serde_json::Value {
        match self {
            FilterPredicate::Position(f) => serde_json::to_value(f),
            FilterPredicate::Inventory(f) => serde_json::to_value(f),
            FilterPredicate::Locate(f) => serde_json::to_value(f),
            FilterPredicate::Alert(f) => serde_json::to_value(f),
        }
        .unwrap_or(serde_json::Value::Null)
    }
}

struct StoredSubscription {
    predicate: FilterPredicate,
    keys: Vec<String>,
}

#[derive(Default)]
struct ChannelIndex {
    key_index: HashMap<String, HashSet<Uuid>>,
    per_session: HashMap<Uuid, Vec<StoredSubscription>>,
}

impl ChannelIndex {
    fn subscribe(&mut self, session_id: Uuid, predicate: FilterPredicate) -> bool {
        let existing = self.per_session.entry(session_id).or_default();
        if existing.iter().any(|s| s.predicate == predicate) {
            return false;
        }

        let keys = predicate.canonical_keys();
        for key in &keys {
            self.key_index
                .entry(key.clone())
                .or_default()
                .insert(session_id);
        }
        existing.push(StoredSubscription { predicate, keys });
        true
    }

    fn unsubscribe(&mut self, session_id: Uuid, predicate: &FilterPredicate) -> bool {
        let Some(subs) = self.per_session.get_mut(&session_id) else {
            return false;
        };
        let Some(idx) = subs.iter().position(|s| &s.predicate == predicate) else {
            return false;
        };
        let removed = subs.remove(idx);

        // A key stays indexed while any other subscription of this session
        // still maps to it.
        let still_used: HashSet<&String> =
            subs.iter().flat_map(|s| s.keys.iter()).collect();
        for key in removed.keys.iter().filter(|k| !still_used.contains(k)) {
            if let Some(sessions) = self.key_index.get_mut(key) {
                sessions.remove(&session_id);
                if sessions.is_empty() {
                    self.key_index.remove(key);
                }
            }
        }

        if subs.is_empty() {
            self.per_session.remove(&session_id);
        }
        true
    }

    fn remove_session(&mut self, session_id: Uuid) {
        let Some(subs) = self.per_session.remove(&session_id) else {
            return;
        };
        for key in subs.iter().flat_map(|s| s.keys.iter()) {
            if let Some(sessions) = self.key_index.get_mut(key) {
                sessions.remove(&session_id);
                if sessions.is_empty() {
                    self.key_index.remove(key);
                }
            }
        }
    }

    fn matches(&self, routing_keys: &[String]) -> HashSet<Uuid> {
        let mut out = HashSet::new();
        for key in routing_keys {
            if let Some(sessions) = self.key_index.get(key) {
                out.extend(sessions.iter().copied());
            }
        }
        out
    }

    fn is_empty(&self) -> bool {
        self.key_index.is_empty() && self.per_session.is_empty()
    }
}

#[derive(Default)]
pub struct SubscriptionRegistry {
    positions: RwLock<ChannelIndex>,
    inventory: RwLock<ChannelIndex>,
    locates: RwLock<ChannelIndex>,
    alerts: RwLock<ChannelIndex>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn index(&self, channel: Channel) -> Option<&RwLock<ChannelIndex>> {
        match channel {
            Channel::Positions => Some(&self.positions),
            Channel::Inventory => Some(&self.inventory),
            Channel::Locates => Some(&self.locates),
            Channel::Alerts => Some(&self.alerts),
            Channel::Admin => None,
        }
    }

    fn write(index: &RwLock<ChannelIndex>) -> std::sync::RwLockWriteGuard<'_, ChannelIndex> {
        index.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn read(index: &RwLock<ChannelIndex>) -> std::sync::RwLockReadGuard<'_, ChannelIndex> {
        index.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Idempotent in `(session, predicate)`: re-subscribing the same filter
    /// leaves a single effective subscription. Returns whether the
    /// subscription was newly added.
    pub fn subscribe(&self, session_id: Uuid, predicate: FilterPredicate) -> bool {
        match self.index(predicate.channel()) {
            Some(index) => Self::write(index).subscribe(session_id, predicate),
            None => false,
        }
    }

    /// Removes by structural equality of the original predicate. Returns
    /// whether a subscription was removed.
    pub fn unsubscribe(&self, session_id: Uuid, predicate: &FilterPredicate) -> bool {
        match self.index(predicate.channel()) {
            Some(index) => Self::write(index).unsubscribe(session_id, predicate),
            None => false,
        }
    }

    /// Candidate delivery set for an event: the union of the sessions
    /// indexed under each routing key.
    pub fn matches(&self, channel: Channel, routing_keys: &[String]) -> HashSet<Uuid> {
        match self.index(channel) {
            Some(index) => Self::read(index).matches(routing_keys),
            None => HashSet::new(),
        }
    }

    /// Drops every subscription of the session across all channels.
    pub fn remove_session(&self, session_id: Uuid) {
        for channel in Channel::all() {
            if let Some(index) = self.index(channel) {
                Self::write(index).remove_session(session_id);
            }
        }
    }

    pub fn subscription_count(&self, channel: Channel, session_id: Uuid) -> usize {
        match self.index(channel) {
            Some(index) => Self::read(index)
                .per_session
                .get(&session_id)
                .map(|subs| subs.len())
                .unwrap_or(0),
            None => 0,
        }
    }

    /// True when the channel holds no state at all, used by tests to assert
    /// clean teardown.
    pub fn channel_is_empty(&self, channel: Channel) -> bool {
        match self.index(channel) {
            Some(index) => Self::read(index).is_empty(),
            None => true,
        }
    }
}
