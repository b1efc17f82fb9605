//! Error and retry supervision for the consume path.
//!
//! Wraps decode + handler invocation for every record. Transient failures
//! retry in place with a fixed backoff, which keeps the record's offset
//! uncommitted; permanent failures divert the raw bytes to the quarantine
//! side channel and let the offset advance; fatal failures propagate and
//! halt the owning worker without committing.

use std::sync::Arc;
use std::time::Duration;

use crate::error::{AppError, AppResult, ErrorClass};
use crate::metrics;
use crate::models::EventEnvelope;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}

/// Side channel for records the pipeline refuses to process.
///
/// The production sink is expected to persist raw bytes elsewhere; the
/// default implementation records the fact and moves on.
pub trait QuarantineSink: Send + Sync {
    fn quarantine(&self, topic: &str, partition: i32, offset: i64, raw: &[u8], reason: &str);
}

pub struct LogQuarantine;

impl QuarantineSink for LogQuarantine {
    fn quarantine(&self, topic: &str, partition: i32, offset: i64, raw: &[u8], reason: &str) {
        metrics::record_event_quarantined(topic, reason);
        tracing::error!(
            topic,
            partition,
            offset,
            reason,
            raw_len = raw.len(),
            "record quarantined"
        );
    }
}

pub struct RetrySupervisor {
    policy: RetryPolicy,
    sink: Arc<dyn QuarantineSink>,
}

impl RetrySupervisor {
    pub fn new(policy: RetryPolicy, sink: Arc<dyn QuarantineSink>) -> Self {
        Self { policy, sink }
    }

    /// Decode one record and run it through `route` under the retry policy.
    ///
    /// Returns `Ok(())` whenever the record is finished with (handled or
    /// quarantined) and its offset may commit; `Err` only for fatal
    /// failures.
    pub async fn process<F>(
        &self,
        topic: &str,
        partition: i32,
        offset: i64,
        payload: Option<&[u8]>,
        route: F,
    ) -> AppResult<()>
    where
        F: Fn(&EventEnvelope) -> AppResult<()>,
    {
        let Some(raw) = payload else {
            self.sink.quarantine(topic, partition, offset, &[], "empty");
            return Ok(());
        };

        let envelope: EventEnvelope = match serde_json::from_slice(raw) {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::warn!(topic, partition, offset, error = %e, "record failed to decode");
                self.sink.quarantine(topic, partition, offset, raw, "decode");
                return Ok(());
            }
        };

        let mut attempt: u32 = 0;
        loop {
            let err = match route(&envelope) {
                Ok(()) => return Ok(()),
                Err(err) => err,
            };

            match err.class() {
                ErrorClass::Permanent => {
                    tracing::error!(
                        topic,
                        partition,
                        offset,
                        event_id = %envelope.event_id,
                        error = %err,
                        "record rejected"
                    );
                    self.sink.quarantine(topic, partition, offset, raw, "invariant");
                    return Ok(());
                }
                ErrorClass::Transient => {
                    attempt += 1;
                    if self.policy.should_retry(attempt) {
                        metrics::record_event_retried(topic);
                        tracing::warn!(
                            topic,
                            partition,
                            offset,
                            attempt,
                            error = %err,
                            "transient failure, retrying"
                        );
                        tokio::time::sleep(self.policy.backoff).await;
                        continue;
                    }
                    tracing::error!(
                        topic,
                        partition,
                        offset,
                        attempts = attempt,
                        error = %err,
                        "retries exhausted, escalating to quarantine"
                    );
                    self.sink.quarantine(topic, partition, offset, raw, "escalated");
                    return Ok(());
                }
                ErrorClass::Fatal => {
                    tracing::error!(
                        topic,
                        partition,
                        offset,
                        error = %err,
                        "fatal failure, halting worker"
                    );
                    return Err(err);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{AlertNotice, AlertSeverity, EventPayload};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingSink {
        reasons: Mutex<Vec<String>>,
    }

    impl QuarantineSink for RecordingSink {
        fn quarantine(&self, _topic: &str, _partition: i32, _offset: i64, _raw: &[u8], reason: &str) {
            self.reasons
                .lock()
                .unwrap_or_else(|p| p.into_inner())
                .push(reason.to_string());
        }
    }

    fn supervisor(sink: Arc<RecordingSink>) -> RetrySupervisor {
        RetrySupervisor::new(
            RetryPolicy {
                max_attempts: 3,
                backoff: Duration::from_millis(1),
            },
            sink,
        )
    }

    fn alert_record() -> Vec<u8> {
        let envelope = EventEnvelope::new(
            "alert-service",
            EventPayload::Alert(AlertNotice {
                alert_id: "AL-1".into(),
                severity: AlertSeverity::Info,
                category: "system".into(),
                message: "hello".into(),
            }),
        );
        serde_json::to_vec(&envelope).unwrap()
    }

    #[tokio::test]
    async fn decode_failure_quarantines_without_retry() {
        let sink = Arc::new(RecordingSink::default());
        let supervisor = supervisor(sink.clone());

        let calls = AtomicU32::new(0);
        let result = supervisor
            .process("alert-events", 0, 7, Some(b"{not json"), |_| {
                calls.fetch_add(1, Ordering::Relaxed);
                Ok(())
            })
            .await;

        assert!(result.is_ok());
        assert_eq!(calls.load(Ordering::Relaxed), 0);
        assert_eq!(
            *sink.reasons.lock().unwrap(),
            vec!["decode".to_string()]
        );
    }

    #[tokio::test]
    async fn missing_payload_quarantines() {
        let sink = Arc::new(RecordingSink::default());
        let supervisor = supervisor(sink.clone());

        supervisor
            .process("alert-events", 0, 7, None, |_| Ok(()))
            .await
            .unwrap();

        assert_eq!(*sink.reasons.lock().unwrap(), vec!["empty".to_string()]);
    }

    #[tokio::test]
    async fn transient_failure_retries_then_succeeds() {
        let sink = Arc::new(RecordingSink::default());
        let supervisor = supervisor(sink.clone());
        let record = alert_record();

        let calls = AtomicU32::new(0);
        let result = supervisor
            .process("alert-events", 0, 7, Some(&record), |_| {
                if calls.fetch_add(1, Ordering::Relaxed) == 0 {
                    Err(AppError::Kafka("leader changed".into()))
                } else {
                    Ok(())
                }
            })
            .await;

        assert!(result.is_ok());
        assert_eq!(calls.load(Ordering::Relaxed), 2);
        assert!(sink.reasons.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn exhausted_transient_retries_escalate_to_quarantine() {
        let sink = Arc::new(RecordingSink::default());
        let supervisor = supervisor(sink.clone());
        let record = alert_record();

        let calls = AtomicU32::new(0);
        let result = supervisor
            .process("alert-events", 0, 7, Some(&record), |_| {
                calls.fetch_add(1, Ordering::Relaxed);
                Err(AppError::Kafka("still down".into()))
            })
            .await;

        assert!(result.is_ok());
        // Initial attempt plus two retries under max_attempts = 3.
        assert_eq!(calls.load(Ordering::Relaxed), 3);
        assert_eq!(
            *sink.reasons.lock().unwrap(),
            vec!["escalated".to_string()]
        );
    }

    #[tokio::test]
    async fn permanent_failure_quarantines_once() {
        let sink = Arc::new(RecordingSink::default());
        let supervisor = supervisor(sink.clone());
        let record = alert_record();

        let calls = AtomicU32::new(0);
        supervisor
            .process("alert-events", 0, 7, Some(&record), |_| {
                calls.fetch_add(1, Ordering::Relaxed);
                Err(AppError::Validation("securityId is empty".into()))
            })
            .await
            .unwrap();

        assert_eq!(calls.load(Ordering::Relaxed), 1);
        assert_eq!(
            *sink.reasons.lock().unwrap(),
            vec!["invariant".to_string()]
        );
    }

    #[tokio::test]
    async fn fatal_failure_propagates_without_quarantine() {
        let sink = Arc::new(RecordingSink::default());
        let supervisor = supervisor(sink.clone());
        let record = alert_record();

        let result = supervisor
            .process("alert-events", 0, 7, Some(&record), |_| {
                Err(AppError::Fatal("corrupt local state".into()))
            })
            .await;

        assert!(matches!(result, Err(AppError::Fatal(_))));
        assert!(sink.reasons.lock().unwrap().is_empty());
    }
}
