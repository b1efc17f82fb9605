//! Log consumer pool.
//!
//! One worker task per `(topic, slot)`; every worker owns a `StreamConsumer`
//! in the shared consumer group and the broker spreads partition leases
//! across them. Workers accumulate a bounded batch, run each record through
//! the retry supervisor, and only then commit the high-water offset per
//! partition, which gives at-least-once delivery across crashes.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::{BorrowedMessage, Message};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::BrokerConfig;
use crate::error::{AppResult, ErrorClass};
use crate::metrics;
use crate::services::retry::RetrySupervisor;
use crate::services::router::{
    EventRouter, TOPIC_ALERT_EVENTS, TOPIC_INVENTORY_EVENTS, TOPIC_LIMIT_EVENTS,
    TOPIC_LOCATE_EVENTS, TOPIC_WORKFLOW_EVENTS,
};

pub struct ConsumerPool {
    broker: BrokerConfig,
    router: Arc<EventRouter>,
    supervisor: Arc<RetrySupervisor>,
}

impl ConsumerPool {
    pub fn new(
        broker: BrokerConfig,
        router: Arc<EventRouter>,
        supervisor: Arc<RetrySupervisor>,
    ) -> Self {
        Self {
            broker,
            router,
            supervisor,
        }
    }

    /// Worker slots per topic. Inventory volume dominates, so its topic gets
    /// the configured multiplier.
    pub fn topic_plan(broker: &BrokerConfig) -> Vec<(&'static str, usize)> {
        vec![
            (TOPIC_WORKFLOW_EVENTS, broker.concurrency),
            (TOPIC_LOCATE_EVENTS, broker.concurrency),
            (
                TOPIC_INVENTORY_EVENTS,
                broker.concurrency * broker.inventory_concurrency_multiplier,
            ),
            (TOPIC_LIMIT_EVENTS, broker.concurrency),
            (TOPIC_ALERT_EVENTS, broker.concurrency),
        ]
    }

    pub fn spawn(&self, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();
        for (topic, workers) in Self::topic_plan(&self.broker) {
            for slot in 0..workers {
                handles.push(tokio::spawn(run_worker(
                    self.broker.clone(),
                    topic,
                    slot,
                    self.router.clone(),
                    self.supervisor.clone(),
                    shutdown.clone(),
                )));
            }
        }
        info!(workers = handles.len(), "consumer pool started");
        handles
    }
}

fn create_consumer(broker: &BrokerConfig, topic: &str) -> AppResult<StreamConsumer> {
    let consumer: StreamConsumer = ClientConfig::new()
        .set("group.id", &broker.group_id)
        .set("bootstrap.servers", &broker.bootstrap_servers)
        .set("enable.auto.commit", "false")
        .set("auto.offset.reset", "latest")
        .set("fetch.min.bytes", broker.min_fetch_bytes.to_string())
        .set("fetch.wait.max.ms", broker.max_batch_wait_ms.to_string())
        .set("session.timeout.ms", "30000")
        .set("heartbeat.interval.ms", "3000")
        .set("max.poll.interval.ms", "300000")
        .set("enable.partition.eof", "false")
        .create()?;

    consumer.subscribe(&[topic])?;
    Ok(consumer)
}

async fn run_worker(
    broker: BrokerConfig,
    topic: &'static str,
    slot: usize,
    router: Arc<EventRouter>,
    supervisor: Arc<RetrySupervisor>,
    shutdown: watch::Receiver<bool>,
) {
    info!(topic, slot, "consumer worker starting");

    loop {
        if *shutdown.borrow() {
            break;
        }

        let consumer = match create_consumer(&broker, topic) {
            Ok(consumer) => consumer,
            Err(e) => {
                error!(topic, slot, error = %e, "failed to create consumer, retrying");
                tokio::time::sleep(Duration::from_secs(1)).await;
                continue;
            }
        };

        match consume_loop(&consumer, topic, &broker, &router, &supervisor, &shutdown).await {
            Ok(()) => break,
            Err(e) if e.class() == ErrorClass::Fatal => {
                error!(topic, slot, error = %e, "consumer worker halted on fatal error");
                break;
            }
            Err(e) => {
                warn!(topic, slot, error = %e, "consumer loop failed, recreating consumer");
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    }

    info!(topic, slot, "consumer worker stopped");
}

async fn consume_loop(
    consumer: &StreamConsumer,
    topic: &'static str,
    broker: &BrokerConfig,
    router: &EventRouter,
    supervisor: &RetrySupervisor,
    shutdown: &watch::Receiver<bool>,
) -> AppResult<()> {
    let batch_window = Duration::from_millis(broker.max_batch_wait_ms);

    loop {
        if *shutdown.borrow() {
            return Ok(());
        }

        let batch = next_batch(consumer, broker.max_batch, batch_window).await?;
        if batch.is_empty() {
            continue;
        }

        for msg in &batch {
            supervisor
                .process(topic, msg.partition(), msg.offset(), msg.payload(), |env| {
                    router.route(topic, env)
                })
                .await?;
            metrics::record_event_consumed(topic);
        }

        // The whole batch is handled; commit one offset per partition.
        let offsets: Vec<(i32, i64)> = batch.iter().map(|m| (m.partition(), m.offset())).collect();
        for idx in high_water_indexes(&offsets) {
            consumer.commit_message(&batch[idx], CommitMode::Async)?;
        }
        debug!(topic, records = batch.len(), "batch committed");
    }
}

/// Collects up to `max_batch` records, returning early once the batch
/// window elapses. A poll error with a partial batch in hand defers the
/// error so the batch is not thrown away.
async fn next_batch<'a>(
    consumer: &'a StreamConsumer,
    max_batch: usize,
    window: Duration,
) -> AppResult<Vec<BorrowedMessage<'a>>> {
    let mut batch = Vec::with_capacity(max_batch);
    let deadline = tokio::time::Instant::now() + window;

    while batch.len() < max_batch {
        match tokio::time::timeout_at(deadline, consumer.recv()).await {
            Ok(Ok(msg)) => batch.push(msg),
            Ok(Err(e)) => {
                if batch.is_empty() {
                    return Err(e.into());
                }
                warn!(error = %e, "poll error with partial batch in hand, deferring");
                break;
            }
            Err(_elapsed) => break,
        }
    }

    Ok(batch)
}

/// Index of the highest-offset record per partition.
fn high_water_indexes(records: &[(i32, i64)]) -> Vec<usize> {
    let mut best: HashMap<i32, usize> = HashMap::new();
    for (idx, (partition, offset)) in records.iter().enumerate() {
        match best.get(partition) {
            Some(&prev) if records[prev].1 >= *offset => {}
            _ => {
                best.insert(*partition, idx);
            }
        }
    }
    let mut indexes: Vec<usize> = best.into_values().collect();
    indexes.sort_unstable();
    indexes
}
