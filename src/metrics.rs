use actix_web::HttpResponse;
use once_cell::sync::Lazy;
use prometheus::{Encoder, IntCounterVec, IntGauge, Opts, TextEncoder};

static EVENTS_CONSUMED_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let counter = IntCounterVec::new(
        Opts::new(
            "distribution_events_consumed_total",
            "Records pulled from the log and run through the pipeline",
        ),
        &["topic"],
    )
    .expect("failed to create distribution_events_consumed_total");
    prometheus::default_registry()
        .register(Box::new(counter.clone()))
        .expect("failed to register distribution_events_consumed_total");
    counter
});

static EVENTS_QUARANTINED_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let counter = IntCounterVec::new(
        Opts::new(
            "distribution_events_quarantined_total",
            "Records diverted to the quarantine side channel",
        ),
        &["topic", "reason"],
    )
    .expect("failed to create distribution_events_quarantined_total");
    prometheus::default_registry()
        .register(Box::new(counter.clone()))
        .expect("failed to register distribution_events_quarantined_total");
    counter
});

static EVENTS_RETRIED_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let counter = IntCounterVec::new(
        Opts::new(
            "distribution_events_retried_total",
            "Transient handler failures retried with backoff",
        ),
        &["topic"],
    )
    .expect("failed to create distribution_events_retried_total");
    prometheus::default_registry()
        .register(Box::new(counter.clone()))
        .expect("failed to register distribution_events_retried_total");
    counter
});

static MESSAGES_DISPATCHED_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let counter = IntCounterVec::new(
        Opts::new(
            "distribution_messages_dispatched_total",
            "Messages enqueued onto session outboxes",
        ),
        &["channel"],
    )
    .expect("failed to create distribution_messages_dispatched_total");
    prometheus::default_registry()
        .register(Box::new(counter.clone()))
        .expect("failed to register distribution_messages_dispatched_total");
    counter
});

static MESSAGES_DROPPED_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let counter = IntCounterVec::new(
        Opts::new(
            "distribution_messages_dropped_total",
            "Messages dropped by outbox backpressure",
        ),
        &["channel"],
    )
    .expect("failed to create distribution_messages_dropped_total");
    prometheus::default_registry()
        .register(Box::new(counter.clone()))
        .expect("failed to register distribution_messages_dropped_total");
    counter
});

static ACTIVE_SESSIONS: Lazy<IntGauge> = Lazy::new(|| {
    let gauge = IntGauge::new(
        "distribution_active_sessions",
        "Sessions currently registered in the session table",
    )
    .expect("failed to create distribution_active_sessions");
    prometheus::default_registry()
        .register(Box::new(gauge.clone()))
        .expect("failed to register distribution_active_sessions");
    gauge
});

static SESSIONS_CLOSED_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let counter = IntCounterVec::new(
        Opts::new(
            "distribution_sessions_closed_total",
            "Sessions torn down, by close reason",
        ),
        &["reason"],
    )
    .expect("failed to create distribution_sessions_closed_total");
    prometheus::default_registry()
        .register(Box::new(counter.clone()))
        .expect("failed to register distribution_sessions_closed_total");
    counter
});

pub fn record_event_consumed(topic: &str) {
    EVENTS_CONSUMED_TOTAL.with_label_values(&[topic]).inc();
}

pub fn record_event_quarantined(topic: &str, reason: &str) {
    EVENTS_QUARANTINED_TOTAL
        .with_label_values(&[topic, reason])
        .inc();
}

pub fn record_event_retried(topic: &str) {
    EVENTS_RETRIED_TOTAL.with_label_values(&[topic]).inc();
}

pub fn record_messages_dispatched(channel: &str, count: u64) {
    MESSAGES_DISPATCHED_TOTAL
        .with_label_values(&[channel])
        .inc_by(count);
}

pub fn record_messages_dropped(channel: &str, count: u64) {
    MESSAGES_DROPPED_TOTAL
        .with_label_values(&[channel])
        .inc_by(count);
}

pub fn session_opened() {
    ACTIVE_SESSIONS.inc();
}

pub fn session_closed(reason: &str) {
    ACTIVE_SESSIONS.dec();
    SESSIONS_CLOSED_TOTAL.with_label_values(&[reason]).inc();
}

pub async fn serve_metrics() -> HttpResponse {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();

    let mut buffer = Vec::new();
    if let Err(err) = encoder.encode(&metric_families, &mut buffer) {
        return HttpResponse::InternalServerError().body(err.to_string());
    }

    HttpResponse::Ok()
        .content_type(encoder.format_type())
        .body(buffer)
}
