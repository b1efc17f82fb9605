use thiserror::Error;

pub type AppResult<T> = Result<T, AppError>;

/// Failure classification driving the consumer retry policy.
///
/// Transient failures are retried with backoff and never skip the record on
/// their own; permanent failures quarantine the record and advance the
/// offset; fatal failures halt the owning worker without committing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Transient,
    Permanent,
    Fatal,
}

#[derive(Debug, Error, Clone)]
pub enum AppError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("server start failure: {0}")]
    StartServer(String),

    #[error("kafka error: {0}")]
    Kafka(String),

    #[error("decode error: {0}")]
    Decode(String),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("handler error: {0}")]
    Handler(String),

    #[error("publish failure: {0}")]
    Publish(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("fatal: {0}")]
    Fatal(String),
}

impl AppError {
    pub fn class(&self) -> ErrorClass {
        match self {
            AppError::Kafka(_) | AppError::Publish(_) => ErrorClass::Transient,
            AppError::Fatal(_) => ErrorClass::Fatal,
            AppError::Config(_) | AppError::StartServer(_) => ErrorClass::Fatal,
            AppError::Decode(_)
            | AppError::Validation(_)
            | AppError::Handler(_)
            | AppError::Unauthorized(_)
            | AppError::Forbidden(_) => ErrorClass::Permanent,
        }
    }
}

impl From<rdkafka::error::KafkaError> for AppError {
    fn from(e: rdkafka::error::KafkaError) -> Self {
        AppError::Kafka(e.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(e: serde_json::Error) -> Self {
        AppError::Decode(e.to_string())
    }
}
