pub mod consumer;
pub mod dispatcher;
pub mod publisher;
pub mod retry;
pub mod router;

pub use consumer::ConsumerPool;
pub use dispatcher::FanoutDispatcher;
pub use publisher::EventPublisher;
pub use retry::{LogQuarantine, QuarantineSink, RetryPolicy, RetrySupervisor};
pub use router::EventRouter;
