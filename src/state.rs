use std::sync::Arc;

use crate::auth::TokenValidator;
use crate::config::Config;
use crate::services::{EventPublisher, FanoutDispatcher};
use crate::websocket::{SessionManager, SubscriptionRegistry};

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub validator: Arc<TokenValidator>,
    pub registry: Arc<SubscriptionRegistry>,
    pub sessions: Arc<SessionManager>,
    pub dispatcher: Arc<FanoutDispatcher>,
    /// Outbound publisher used by domain modules; absent when disabled.
    pub publisher: Option<Arc<EventPublisher>>,
}
