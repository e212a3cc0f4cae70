use std::sync::Arc;

use tokio::sync::{watch, Mutex};

use tankalarm_core::config::ContactList;
use tankalarm_core::server::ServerCore;
use tankalarm_events::EventBus;

use crate::config::ServerConfig;

/// The decision engine, shared between handlers and background tasks.
pub type SharedCore = Arc<Mutex<ServerCore>>;

/// Shared application state available to all Axum handlers via `State<AppState>`.
///
/// This is cheaply cloneable (inner data is behind `Arc`).
#[derive(Clone)]
pub struct AppState {
    pub core: SharedCore,
    pub config: Arc<ServerConfig>,
    /// Centralized event bus for alarm, power and liveness events.
    pub event_bus: Arc<EventBus>,
    /// Current contact list, observed by the notification dispatcher.
    pub contacts: Arc<watch::Sender<ContactList>>,
}
