//! Server state management

use maestro_core::{Notification, OrchestrationService, RunReport};
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};

/// Notifications buffered per WebSocket subscriber before it starts lagging
const EVENT_BUFFER: usize = 1000;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub service: Arc<OrchestrationService>,

    /// Report of the most recent finished run
    pub last_report: Arc<RwLock<Option<RunReport>>>,

    /// Fan-out of service notifications to WebSocket clients
    pub events: broadcast::Sender<Notification>,
}

impl AppState {
    pub fn new(service: OrchestrationService) -> Self {
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        Self {
            service: Arc::new(service),
            last_report: Arc::new(RwLock::new(None)),
            events,
        }
    }

    /// Forward service notifications to the broadcast channel.
    ///
    /// The service channel is blocking, so the pump runs on the blocking pool
    /// and ends when the service is dropped.
    pub fn spawn_notification_pump(&self) {
        let notifications = self.service.notifications().clone();
        let events = self.events.clone();
        tokio::task::spawn_blocking(move || {
            while let Ok(notification) = notifications.recv() {
                if let Notification::Log { source, text, .. } = &notification {
                    tracing::debug!(%source, "{}", text);
                }
                // No subscribers is fine
                let _ = events.send(notification);
            }
            tracing::debug!("notification pump stopped");
        });
    }
}
