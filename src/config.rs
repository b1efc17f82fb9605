use dotenvy::dotenv;
use std::env;

use crate::error::AppError;

#[derive(Debug, Clone)]
pub struct BrokerConfig {
    pub bootstrap_servers: String,
    pub group_id: String,
    /// Consumer workers per topic.
    pub concurrency: usize,
    /// Extra worker multiplier for the inventory topic, whose volume
    /// dominates the others.
    pub inventory_concurrency_multiplier: usize,
    pub max_batch: usize,
    pub max_batch_wait_ms: u64,
    pub min_fetch_bytes: u32,
}

#[derive(Debug, Clone)]
pub struct WireConfig {
    /// `*` means any origin.
    pub allowed_origins: Vec<String>,
    pub send_timeout_ms: u64,
    pub send_buffer_bytes: usize,
    /// Max inbound frame size; larger frames are a policy violation.
    pub message_size_limit: usize,
}

#[derive(Debug, Clone)]
pub struct AuthConfig {
    pub issuer_uri: String,
    pub audience: String,
    pub public_key_pem: String,
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub outbox_capacity: usize,
    pub liveness_timeout_secs: u64,
    pub liveness_scan_secs: u64,
    pub drain_grace_ms: u64,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub broker: BrokerConfig,
    pub wire: WireConfig,
    pub auth: AuthConfig,
    pub session: SessionConfig,
    pub publisher_enabled: bool,
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

fn required(key: &str) -> Result<String, AppError> {
    env::var(key).map_err(|_| AppError::Config(format!("{key} missing")))
}

impl Config {
    pub fn parse_origins(value: &str) -> Vec<String> {
        value
            .split(',')
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .map(|s| s.to_string())
            .collect()
    }

    pub fn from_env() -> Result<Self, AppError> {
        dotenv().ok();

        let port = env_or("PORT", 8085);

        let broker = BrokerConfig {
            bootstrap_servers: env::var("KAFKA_BOOTSTRAP_SERVERS")
                .unwrap_or_else(|_| "localhost:9092".into()),
            group_id: env::var("KAFKA_GROUP_ID")
                .unwrap_or_else(|_| "distribution-hub-v1".into()),
            concurrency: env_or("KAFKA_CONSUMER_CONCURRENCY", 10),
            inventory_concurrency_multiplier: env_or(
                "KAFKA_INVENTORY_CONCURRENCY_MULTIPLIER",
                2,
            ),
            max_batch: env_or("KAFKA_MAX_BATCH", 500),
            max_batch_wait_ms: env_or("KAFKA_MAX_BATCH_WAIT_MS", 500),
            min_fetch_bytes: env_or("KAFKA_MIN_FETCH_BYTES", 1024),
        };

        let wire = WireConfig {
            allowed_origins: Self::parse_origins(
                &env::var("WS_ALLOWED_ORIGINS").unwrap_or_else(|_| "*".into()),
            ),
            send_timeout_ms: env_or("WS_SEND_TIMEOUT_MS", 10_000),
            send_buffer_bytes: env_or("WS_SEND_BUFFER_BYTES", 524_288),
            message_size_limit: env_or("WS_MESSAGE_SIZE_LIMIT", 131_072),
        };

        let auth = AuthConfig {
            issuer_uri: required("AUTH_ISSUER_URI")?,
            audience: required("AUTH_AUDIENCE")?,
            public_key_pem: required("JWT_PUBLIC_KEY_PEM")?,
        };

        let session = SessionConfig {
            outbox_capacity: env_or("SESSION_OUTBOX_CAPACITY", 1024),
            liveness_timeout_secs: env_or("SESSION_LIVENESS_TIMEOUT_SECS", 90),
            liveness_scan_secs: env_or("SESSION_LIVENESS_SCAN_SECS", 30),
            drain_grace_ms: env_or("SESSION_DRAIN_GRACE_MS", 2_000),
        };

        let publisher_enabled = env::var("PUBLISHER_ENABLED")
            .map(|v| v.to_lowercase() == "true" || v == "1")
            .unwrap_or(true);

        let config = Self {
            port,
            broker,
            wire,
            auth,
            session,
            publisher_enabled,
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), AppError> {
        if self.broker.bootstrap_servers.trim().is_empty() {
            return Err(AppError::Config("KAFKA_BOOTSTRAP_SERVERS is empty".into()));
        }
        if self.broker.concurrency == 0 {
            return Err(AppError::Config(
                "KAFKA_CONSUMER_CONCURRENCY must be at least 1".into(),
            ));
        }
        if self.broker.max_batch == 0 {
            return Err(AppError::Config("KAFKA_MAX_BATCH must be at least 1".into()));
        }
        if self.session.outbox_capacity == 0 {
            return Err(AppError::Config(
                "SESSION_OUTBOX_CAPACITY must be at least 1".into(),
            ));
        }
        if self.session.liveness_scan_secs == 0
            || self.session.liveness_timeout_secs < self.session.liveness_scan_secs
        {
            return Err(AppError::Config(
                "liveness timeout must be at least one scan interval".into(),
            ));
        }
        if self.wire.message_size_limit == 0 {
            return Err(AppError::Config("WS_MESSAGE_SIZE_LIMIT must be nonzero".into()));
        }
        if !self.auth.public_key_pem.contains("BEGIN") {
            return Err(AppError::Config(
                "JWT_PUBLIC_KEY_PEM does not look like a PEM block".into(),
            ));
        }
        Ok(())
    }

    pub fn allows_any_origin(&self) -> bool {
        self.wire.allowed_origins.iter().any(|o| o == "*")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Config {
        Config {
            port: 8085,
            broker: BrokerConfig {
                bootstrap_servers: "localhost:9092".into(),
                group_id: "distribution-hub-v1".into(),
                concurrency: 10,
                inventory_concurrency_multiplier: 2,
                max_batch: 500,
                max_batch_wait_ms: 500,
                min_fetch_bytes: 1024,
            },
            wire: WireConfig {
                allowed_origins: vec!["*".into()],
                send_timeout_ms: 10_000,
                send_buffer_bytes: 524_288,
                message_size_limit: 131_072,
            },
            auth: AuthConfig {
                issuer_uri: "https://idp.example.com".into(),
                audience: "distribution-hub".into(),
                public_key_pem: "-----BEGIN PUBLIC KEY-----\n-----END PUBLIC KEY-----".into(),
            },
            session: SessionConfig {
                outbox_capacity: 1024,
                liveness_timeout_secs: 90,
                liveness_scan_secs: 30,
                drain_grace_ms: 2_000,
            },
            publisher_enabled: true,
        }
    }

    #[test]
    fn validate_accepts_defaults() {
        assert!(sample().validate().is_ok());
    }

    #[test]
    fn validate_rejects_zero_capacity() {
        let mut cfg = sample();
        cfg.session.outbox_capacity = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_rejects_timeout_below_scan_interval() {
        let mut cfg = sample();
        cfg.session.liveness_timeout_secs = 10;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn parse_origins_splits_and_trims() {
        let origins = Config::parse_origins("https://a.example, https://b.example ,");
        assert_eq!(origins, vec!["https://a.example", "https://b.example"]);
    }

    #[test]
    fn wildcard_origin_detected() {
        let mut cfg = sample();
        assert!(cfg.allows_any_origin());
        cfg.wire.allowed_origins = vec!["https://ui.example".into()];
        assert!(!cfg.allows_any_origin());
    }
}
