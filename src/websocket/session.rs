//! Session lifecycle and per-session outboxes.
//!
//! A session exclusively owns its outbox: the fan-out dispatcher is the
//! producer, the session's egress actor the single consumer. Enqueue is
//! non-blocking; when the outbox is full the entry is dropped, the sequence
//! number still advances, and sustained dropping closes the session as a
//! slow consumer. The session table holds the only strong references that
//! the distribution path follows; the subscription registry knows sessions
//! by id alone.

use std::collections::HashSet;
use std::sync::atomic::{AtomicI64, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{mpsc, watch};
use uuid::Uuid;

use super::messages::{CLOSE_NORMAL, CLOSE_SLOW_CONSUMER};
use super::subscription::SubscriptionRegistry;
use crate::auth::{AuthContext, Role};
use crate::config::{SessionConfig, WireConfig};
use crate::metrics;
use crate::models::Channel;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SessionState {
    Handshaking = 0,
    Open = 1,
    Draining = 2,
    Closed = 3,
}

impl SessionState {
    fn from_u8(value: u8) -> SessionState {
        match value {
            0 => SessionState::Handshaking,
            1 => SessionState::Open,
            2 => SessionState::Draining,
            _ => SessionState::Closed,
        }
    }
}

/// A serialized frame awaiting the wire, in per-session sequence order.
#[derive(Debug, Clone)]
pub struct OutboxEntry {
    pub sequence: u64,
    pub payload: Arc<String>,
}

/// Out-of-band instructions for the egress actor.
#[derive(Debug, Clone)]
pub enum SessionControl {
    Close { code: u16, reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueResult {
    Enqueued,
    /// Admitted above the high-water mark.
    EnqueuedSlow,
    /// Outbox full; the entry was discarded and the sequence advanced.
    Dropped,
    /// Session not in Open state; enqueue is a no-op.
    Rejected,
}

pub const REASON_CLIENT_CLOSE: &str = "client_close";
pub const REASON_WRITE_FAILURE: &str = "write_failure";
pub const REASON_POLICY_VIOLATION: &str = "policy_violation";
pub const REASON_LIVENESS_TIMEOUT: &str = "liveness_timeout";
pub const REASON_SLOW_CONSUMER: &str = "slow_consumer";
pub const REASON_SHUTDOWN: &str = "shutdown";
pub const REASON_STALE: &str = "stale";

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

pub struct Session {
    pub session_id: Uuid,
    pub user_id: String,
    pub roles: Vec<Role>,
    /// Channel of the endpoint the client connected to.
    pub endpoint: Channel,
    permitted: HashSet<Channel>,
    outbox_tx: mpsc::Sender<OutboxEntry>,
    control_tx: mpsc::UnboundedSender<SessionControl>,
    outbox_capacity: usize,
    /// Byte budget for queued frames, from `wire.send_buffer_bytes`.
    egress_buffer_bytes: u64,
    queued_bytes: AtomicU64,
    /// When the outbox first refused a frame; 0 while the writer keeps up.
    stalled_since_ms: AtomicI64,
    sequence: AtomicU64,
    sent: AtomicU64,
    dropped: AtomicU64,
    delivered_in_window: AtomicU64,
    dropped_in_window: AtomicU64,
    slow_marks: AtomicU64,
    last_activity_ms: AtomicI64,
    state: AtomicU8,
}

impl Session {
    pub fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_open(&self) -> bool {
        self.state() == SessionState::Open
    }

    pub fn may_access(&self, channel: Channel) -> bool {
        self.permitted.contains(&channel)
    }

    /// Handshaking → Open, once the egress actor is live.
    pub fn mark_open(&self) {
        let _ = self.state.compare_exchange(
            SessionState::Handshaking as u8,
            SessionState::Open as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    /// Open → Draining. Returns true on the transition that won; later
    /// callers see false and must not double-close.
    pub fn begin_drain(&self) -> bool {
        self.state
            .compare_exchange(
                SessionState::Open as u8,
                SessionState::Draining as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    pub fn mark_closed(&self) {
        self.state.store(SessionState::Closed as u8, Ordering::Release);
    }

    /// Records client activity for the liveness clock.
    pub fn touch(&self) {
        self.last_activity_ms.store(now_millis(), Ordering::Relaxed);
    }

    pub fn idle_for(&self) -> Duration {
        let idle_ms = now_millis() - self.last_activity_ms.load(Ordering::Relaxed);
        Duration::from_millis(idle_ms.max(0) as u64)
    }

    /// Non-blocking outbox admission with backpressure accounting. A frame
    /// is refused when either the entry capacity or the byte budget is
    /// exhausted; both count as drops.
    pub fn enqueue(&self, payload: Arc<String>) -> EnqueueResult {
        if !self.is_open() {
            return EnqueueResult::Rejected;
        }

        // Drops consume a sequence number too; the gap is the client's cue
        // to reconcile via snapshot.
        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed) + 1;

        let frame_bytes = payload.len() as u64;
        if self
            .queued_bytes
            .load(Ordering::Relaxed)
            .saturating_add(frame_bytes)
            > self.egress_buffer_bytes
        {
            return self.record_drop();
        }

        match self.outbox_tx.try_send(OutboxEntry { sequence, payload }) {
            Ok(()) => {
                self.queued_bytes.fetch_add(frame_bytes, Ordering::Relaxed);
                self.delivered_in_window.fetch_add(1, Ordering::Relaxed);
                let remaining = self.outbox_tx.capacity();
                if remaining * 5 <= self.outbox_capacity {
                    self.slow_marks.fetch_add(1, Ordering::Relaxed);
                    EnqueueResult::EnqueuedSlow
                } else {
                    EnqueueResult::Enqueued
                }
            }
            Err(mpsc::error::TrySendError::Full(_)) => self.record_drop(),
            Err(mpsc::error::TrySendError::Closed(_)) => EnqueueResult::Rejected,
        }
    }

    fn record_drop(&self) -> EnqueueResult {
        self.dropped.fetch_add(1, Ordering::Relaxed);
        let _ = self.stalled_since_ms.compare_exchange(
            0,
            now_millis(),
            Ordering::Relaxed,
            Ordering::Relaxed,
        );
        let dropped = self.dropped_in_window.fetch_add(1, Ordering::Relaxed) + 1;
        let delivered = self.delivered_in_window.load(Ordering::Relaxed);
        if dropped * 100 > delivered {
            self.force_close(CLOSE_SLOW_CONSUMER, REASON_SLOW_CONSUMER);
        }
        EnqueueResult::Dropped
    }

    /// Server-initiated close: transition to Draining and tell the egress
    /// actor to finish up. Safe to call repeatedly; only the first call
    /// emits the control message.
    pub fn force_close(&self, code: u16, reason: &str) {
        if self.begin_drain() {
            let _ = self.control_tx.send(SessionControl::Close {
                code,
                reason: reason.to_string(),
            });
        }
    }

    /// Called by the egress writer for every frame that reached the wire.
    pub fn record_sent(&self, entry: &OutboxEntry) {
        self.sent.fetch_add(1, Ordering::Relaxed);
        self.queued_bytes
            .fetch_sub(entry.payload.len() as u64, Ordering::Relaxed);
        self.stalled_since_ms.store(0, Ordering::Relaxed);
    }

    pub fn sent_count(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }

    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn slow_mark_count(&self) -> u64 {
        self.slow_marks.load(Ordering::Relaxed)
    }

    pub fn current_sequence(&self) -> u64 {
        self.sequence.load(Ordering::Relaxed)
    }

    /// How long the outbox has been refusing frames with nothing written
    /// since; zero while the writer keeps up.
    pub fn stalled_for(&self) -> Duration {
        let since = self.stalled_since_ms.load(Ordering::Relaxed);
        if since == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis((now_millis() - since).max(0) as u64)
    }

    fn reset_window(&self) {
        self.delivered_in_window.store(0, Ordering::Relaxed);
        self.dropped_in_window.store(0, Ordering::Relaxed);
    }

    fn outbox_gone(&self) -> bool {
        self.outbox_tx.is_closed()
    }

    #[cfg(test)]
    pub fn backdate_activity(&self, age: Duration) {
        self.last_activity_ms
            .store(now_millis() - age.as_millis() as i64, Ordering::Relaxed);
    }

    #[cfg(test)]
    pub fn backdate_stall(&self, age: Duration) {
        self.stalled_since_ms
            .store(now_millis() - age.as_millis() as i64, Ordering::Relaxed);
    }
}

/// Everything the egress side needs for one session.
pub struct SessionHandle {
    pub session: Arc<Session>,
    pub outbox_rx: mpsc::Receiver<OutboxEntry>,
    pub control_rx: mpsc::UnboundedReceiver<SessionControl>,
}

/// Owns the session table and the liveness sweep.
pub struct SessionManager {
    sessions: DashMap<Uuid, Arc<Session>>,
    registry: Arc<SubscriptionRegistry>,
    config: SessionConfig,
    /// Per-session egress byte budget, from `wire.send_buffer_bytes`.
    egress_buffer_bytes: u64,
    /// Per-message send budget; a session stalled longer than this closes.
    send_timeout: Duration,
}

impl SessionManager {
    pub fn new(
        registry: Arc<SubscriptionRegistry>,
        config: SessionConfig,
        wire: &WireConfig,
    ) -> Self {
        Self {
            sessions: DashMap::new(),
            registry,
            config,
            egress_buffer_bytes: wire.send_buffer_bytes as u64,
            send_timeout: Duration::from_millis(wire.send_timeout_ms),
        }
    }

    /// Allocates a session for an authenticated principal and registers it
    /// in the table. The caller owns the returned receivers.
    pub fn register(&self, auth: &AuthContext, endpoint: Channel) -> SessionHandle {
        let (outbox_tx, outbox_rx) = mpsc::channel(self.config.outbox_capacity);
        let (control_tx, control_rx) = mpsc::unbounded_channel();

        let session = Arc::new(Session {
            session_id: Uuid::new_v4(),
            user_id: auth.user_id.clone(),
            roles: auth.roles.clone(),
            endpoint,
            permitted: auth.permitted_channels(),
            outbox_tx,
            control_tx,
            outbox_capacity: self.config.outbox_capacity,
            egress_buffer_bytes: self.egress_buffer_bytes,
            queued_bytes: AtomicU64::new(0),
            stalled_since_ms: AtomicI64::new(0),
            sequence: AtomicU64::new(0),
            sent: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            delivered_in_window: AtomicU64::new(0),
            dropped_in_window: AtomicU64::new(0),
            slow_marks: AtomicU64::new(0),
            last_activity_ms: AtomicI64::new(now_millis()),
            state: AtomicU8::new(SessionState::Handshaking as u8),
        });

        self.sessions.insert(session.session_id, session.clone());
        metrics::session_opened();

        SessionHandle {
            session,
            outbox_rx,
            control_rx,
        }
    }

    /// Resolves a session id to a live session; absent means the session is
    /// gone and the caller should treat its work as a no-op.
    pub fn resolve(&self, session_id: Uuid) -> Option<Arc<Session>> {
        self.sessions.get(&session_id).map(|s| s.clone())
    }

    /// Final teardown: mark closed, purge subscriptions, drop from the
    /// table. Idempotent.
    pub fn remove(&self, session_id: Uuid, reason: &str) {
        if let Some((_, session)) = self.sessions.remove(&session_id) {
            session.mark_closed();
            self.registry.remove_session(session_id);
            metrics::session_closed(reason);
            tracing::info!(
                session_id = %session_id,
                user_id = %session.user_id,
                reason,
                sent = session.sent_count(),
                dropped = session.dropped_count(),
                "session closed"
            );
        }
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// One liveness pass: close idle sessions, reap sessions whose egress
    /// died without teardown, reset backpressure windows.
    pub fn scan_once(&self) {
        let timeout = Duration::from_secs(self.config.liveness_timeout_secs);
        let mut stale = Vec::new();

        for entry in self.sessions.iter() {
            let session = entry.value();
            match session.state() {
                SessionState::Closed => {
                    stale.push(session.session_id);
                }
                _ if session.outbox_gone() => {
                    stale.push(session.session_id);
                }
                SessionState::Open => {
                    if session.idle_for() > timeout {
                        tracing::warn!(
                            session_id = %session.session_id,
                            idle_secs = session.idle_for().as_secs(),
                            "closing idle session"
                        );
                        session.force_close(CLOSE_NORMAL, REASON_LIVENESS_TIMEOUT);
                    } else if session.stalled_for() > self.send_timeout {
                        tracing::warn!(
                            session_id = %session.session_id,
                            stalled_ms = session.stalled_for().as_millis() as u64,
                            "closing session stalled past the send budget"
                        );
                        session.force_close(CLOSE_SLOW_CONSUMER, REASON_SLOW_CONSUMER);
                    }
                }
                _ => {}
            }
            session.reset_window();
        }

        for session_id in stale {
            self.remove(session_id, REASON_STALE);
        }
    }

    pub fn spawn_liveness_scan(
        self: &Arc<Self>,
        mut shutdown: watch::Receiver<bool>,
    ) -> tokio::task::JoinHandle<()> {
        let manager = self.clone();
        let scan_interval = Duration::from_secs(manager.config.liveness_scan_secs);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(scan_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => manager.scan_once(),
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
        })
    }

    /// Shutdown path: ask every session to drain and close.
    pub fn close_all(&self, code: u16, reason: &str) {
        for entry in self.sessions.iter() {
            entry.value().force_close(code, reason);
        }
    }

    /// Drops the table entry without touching the registry, simulating the
    /// window where a session is gone but its subscriptions are not yet
    /// swept.
    #[cfg(test)]
    pub fn sessions_remove_for_test(&self, session_id: Uuid) {
        self.sessions.remove(&session_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::websocket::subscription::{FilterPredicate, LocateFilter};

    fn test_config(outbox_capacity: usize) -> SessionConfig {
        SessionConfig {
            outbox_capacity,
            liveness_timeout_secs: 90,
            liveness_scan_secs: 30,
            drain_grace_ms: 2_000,
        }
    }

    fn test_wire() -> WireConfig {
        WireConfig {
            allowed_origins: vec!["*".into()],
            send_timeout_ms: 10_000,
            send_buffer_bytes: 524_288,
            message_size_limit: 131_072,
        }
    }

    fn auth() -> AuthContext {
        AuthContext {
            user_id: "user-42".into(),
            roles: vec![Role::Trader],
        }
    }

    fn manager(outbox_capacity: usize) -> Arc<SessionManager> {
        Arc::new(SessionManager::new(
            Arc::new(SubscriptionRegistry::new()),
            test_config(outbox_capacity),
            &test_wire(),
        ))
    }

    fn frame(body: &str) -> Arc<String> {
        Arc::new(body.to_string())
    }

    #[tokio::test]
    async fn sequence_is_strictly_increasing_and_drops_advance_it() {
        let manager = manager(2);
        let mut handle = manager.register(&auth(), Channel::Locates);
        handle.session.mark_open();

        assert_eq!(handle.session.enqueue(frame("a")), EnqueueResult::Enqueued);
        assert_eq!(
            handle.session.enqueue(frame("b")),
            EnqueueResult::EnqueuedSlow
        );
        assert_eq!(handle.session.enqueue(frame("c")), EnqueueResult::Dropped);

        assert_eq!(handle.outbox_rx.recv().await.unwrap().sequence, 1);
        assert_eq!(handle.outbox_rx.recv().await.unwrap().sequence, 2);
        assert_eq!(handle.session.dropped_count(), 1);
        assert_eq!(handle.session.slow_mark_count(), 1);
        // The dropped entry consumed sequence 3.
        assert_eq!(handle.session.current_sequence(), 3);
    }

    #[tokio::test]
    async fn byte_budget_drops_frames_before_entry_capacity() {
        let registry = Arc::new(SubscriptionRegistry::new());
        let mut wire = test_wire();
        wire.send_buffer_bytes = 10;
        let manager = Arc::new(SessionManager::new(registry, test_config(64), &wire));

        let mut handle = manager.register(&auth(), Channel::Locates);
        handle.session.mark_open();

        assert_eq!(
            handle.session.enqueue(frame("12345678")),
            EnqueueResult::Enqueued
        );
        // 8 bytes queued; another 8 would blow the 10-byte budget even
        // though 63 entry slots remain.
        assert_eq!(
            handle.session.enqueue(frame("12345678")),
            EnqueueResult::Dropped
        );
        assert_eq!(handle.session.dropped_count(), 1);

        // Writing the queued frame releases its bytes and clears the stall
        // clock.
        let entry = handle.outbox_rx.recv().await.unwrap();
        handle.session.record_sent(&entry);
        assert_eq!(handle.session.stalled_for(), Duration::ZERO);
        assert_eq!(handle.session.sent_count(), 1);
    }

    #[tokio::test]
    async fn stalled_session_is_closed_after_the_send_budget() {
        let manager = manager(8);
        let mut handle = manager.register(&auth(), Channel::Locates);
        handle.session.mark_open();
        handle.session.backdate_stall(Duration::from_secs(60));

        manager.scan_once();

        match handle.control_rx.recv().await.unwrap() {
            SessionControl::Close { code, reason } => {
                assert_eq!(code, CLOSE_SLOW_CONSUMER);
                assert_eq!(reason, REASON_SLOW_CONSUMER);
            }
        }
    }

    #[tokio::test]
    async fn enqueue_rejected_until_open_and_after_drain() {
        let manager = manager(4);
        let handle = manager.register(&auth(), Channel::Locates);

        assert_eq!(handle.session.enqueue(frame("early")), EnqueueResult::Rejected);

        handle.session.mark_open();
        assert_eq!(handle.session.enqueue(frame("ok")), EnqueueResult::Enqueued);

        assert!(handle.session.begin_drain());
        assert_eq!(handle.session.enqueue(frame("late")), EnqueueResult::Rejected);
    }

    #[tokio::test]
    async fn sustained_drops_close_the_session_as_slow_consumer() {
        let manager = manager(2);
        let mut handle = manager.register(&auth(), Channel::Locates);
        handle.session.mark_open();

        // Fill the outbox, then force enough drops to cross 1% of the
        // window's delivered count.
        handle.session.enqueue(frame("a"));
        handle.session.enqueue(frame("b"));
        assert_eq!(handle.session.enqueue(frame("c")), EnqueueResult::Dropped);

        match handle.control_rx.recv().await.unwrap() {
            SessionControl::Close { code, reason } => {
                assert_eq!(code, CLOSE_SLOW_CONSUMER);
                assert_eq!(reason, REASON_SLOW_CONSUMER);
            }
        }
        assert_eq!(handle.session.state(), SessionState::Draining);
        assert_eq!(handle.session.enqueue(frame("d")), EnqueueResult::Rejected);
    }

    #[tokio::test]
    async fn remove_purges_registry_and_table() {
        let registry = Arc::new(SubscriptionRegistry::new());
        let manager = Arc::new(SessionManager::new(
            registry.clone(),
            test_config(8),
            &test_wire(),
        ));
        let handle = manager.register(&auth(), Channel::Locates);
        let id = handle.session.session_id;

        registry.subscribe(
            id,
            FilterPredicate::Locate(LocateFilter {
                security_id: Some("SEC-EQ-001".into()),
                ..Default::default()
            }),
        );

        manager.remove(id, REASON_CLIENT_CLOSE);

        assert!(manager.resolve(id).is_none());
        assert!(registry.channel_is_empty(Channel::Locates));
        assert_eq!(manager.session_count(), 0);
    }

    #[tokio::test]
    async fn liveness_scan_closes_idle_sessions() {
        let manager = manager(8);
        let mut handle = manager.register(&auth(), Channel::Alerts);
        handle.session.mark_open();
        handle
            .session
            .backdate_activity(Duration::from_secs(3600));

        manager.scan_once();

        match handle.control_rx.recv().await.unwrap() {
            SessionControl::Close { code, reason } => {
                assert_eq!(code, CLOSE_NORMAL);
                assert_eq!(reason, REASON_LIVENESS_TIMEOUT);
            }
        }
    }

    #[tokio::test]
    async fn liveness_scan_spares_active_sessions() {
        let manager = manager(8);
        let mut handle = manager.register(&auth(), Channel::Alerts);
        handle.session.mark_open();
        handle.session.touch();

        manager.scan_once();

        assert!(handle.control_rx.try_recv().is_err());
        assert_eq!(handle.session.state(), SessionState::Open);
    }

    #[tokio::test]
    async fn scan_reaps_sessions_whose_egress_died() {
        let manager = manager(8);
        let handle = manager.register(&auth(), Channel::Alerts);
        let id = handle.session.session_id;
        handle.session.mark_open();

        // Receiver dropped without a teardown call.
        drop(handle.outbox_rx);
        manager.scan_once();

        assert!(manager.resolve(id).is_none());
    }

    #[tokio::test]
    async fn close_all_drains_every_session() {
        let manager = manager(8);
        let mut a = manager.register(&auth(), Channel::Alerts);
        let mut b = manager.register(&auth(), Channel::Locates);
        a.session.mark_open();
        b.session.mark_open();

        manager.close_all(CLOSE_NORMAL, REASON_SHUTDOWN);

        assert!(a.control_rx.recv().await.is_some());
        assert!(b.control_rx.recv().await.is_some());
    }
}
