//! Outbound event publisher.
//!
//! Used by domain modules to re-publish workflow, locate, and inventory
//! events onto the log. The producer is idempotent with one in-flight
//! request per connection, so retries cannot duplicate or reorder records
//! under the same key. Failures surface to the caller, which decides
//! whether to retry or escalate.

use std::time::Duration;

use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::ClientConfig;
use tracing::debug;

use crate::error::{AppError, AppResult};
use crate::models::{EventEnvelope, EventPayload};
use crate::services::router::{
    TOPIC_INVENTORY_EVENTS, TOPIC_LOCATE_EVENTS, TOPIC_WORKFLOW_EVENTS,
};

/// Partition key for the workflow topic: per-workflow order for
/// transitions, per-position order for snapshots.
pub fn workflow_partition_key(envelope: &EventEnvelope) -> AppResult<String> {
    match &envelope.payload {
        EventPayload::Workflow(w) => Ok(w.workflow_id.clone()),
        EventPayload::Position(p) => Ok(format!("{}:{}", p.book_id, p.security_id)),
        other => Err(AppError::Publish(format!(
            "{} event does not belong on {TOPIC_WORKFLOW_EVENTS}",
            other.family()
        ))),
    }
}

pub fn locate_partition_key(envelope: &EventEnvelope) -> AppResult<String> {
    match &envelope.payload {
        EventPayload::Locate(l) => Ok(l.locate_id.clone()),
        other => Err(AppError::Publish(format!(
            "{} event does not belong on {TOPIC_LOCATE_EVENTS}",
            other.family()
        ))),
    }
}

pub fn inventory_partition_key(envelope: &EventEnvelope) -> AppResult<String> {
    match &envelope.payload {
        EventPayload::Inventory(i) => Ok(format!("{}:{}", i.security_id, i.calculation_type)),
        other => Err(AppError::Publish(format!(
            "{} event does not belong on {TOPIC_INVENTORY_EVENTS}",
            other.family()
        ))),
    }
}

pub struct EventPublisher {
    producer: FutureProducer,
    send_timeout: Duration,
}

impl EventPublisher {
    pub fn new(brokers: &str) -> AppResult<Self> {
        let producer = ClientConfig::new()
            .set("bootstrap.servers", brokers)
            .set("acks", "all")
            .set("enable.idempotence", "true")
            .set("max.in.flight.requests.per.connection", "1")
            .set("compression.type", "snappy")
            .set("batch.size", "16384")
            .set("linger.ms", "5")
            .set("queue.buffering.max.kbytes", "32768")
            .set("message.timeout.ms", "30000")
            .create::<FutureProducer>()?;

        Ok(Self {
            producer,
            send_timeout: Duration::from_secs(30),
        })
    }

    async fn publish(&self, topic: &str, key: &str, envelope: &EventEnvelope) -> AppResult<()> {
        let payload =
            serde_json::to_vec(envelope).map_err(|e| AppError::Publish(e.to_string()))?;

        let record = FutureRecord::to(topic).payload(&payload).key(key);

        self.producer
            .send(record, self.send_timeout)
            .await
            .map_err(|(e, _)| AppError::Publish(e.to_string()))?;

        debug!(topic, key, event_id = %envelope.event_id, "event published");
        Ok(())
    }

    pub async fn publish_workflow(&self, envelope: &EventEnvelope) -> AppResult<()> {
        let key = workflow_partition_key(envelope)?;
        self.publish(TOPIC_WORKFLOW_EVENTS, &key, envelope).await
    }

    pub async fn publish_locate(&self, envelope: &EventEnvelope) -> AppResult<()> {
        let key = locate_partition_key(envelope)?;
        self.publish(TOPIC_LOCATE_EVENTS, &key, envelope).await
    }

    pub async fn publish_inventory(&self, envelope: &EventEnvelope) -> AppResult<()> {
        let key = inventory_partition_key(envelope)?;
        self.publish(TOPIC_INVENTORY_EVENTS, &key, envelope).await
    }
}
