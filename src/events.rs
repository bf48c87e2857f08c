use std::sync::Arc;
use std::time::SystemTime;

use serde_json::Value;

/// An event as delivered to registered event handlers.
#[derive(Debug, Clone)]
pub struct GatewayEvent {
    /// Originating plugin package, when plugin-originated.
    pub plugin: Option<String>,
    pub handle_id: Option<u64>,
    pub when: SystemTime,
    pub event: Value,
}

/// External event handlers (monitoring, accounting) subscribe through
/// this trait; delivery is fire-and-forget.
pub trait EventHandler: Send + Sync {
    fn handle_event(&self, event: GatewayEvent);
}

/// The set of registered event sinks.
#[derive(Default)]
pub struct EventSinks {
    handlers: Vec<Arc<dyn EventHandler>>,
}

impl EventSinks {
    pub fn new() -> Self {
        EventSinks::default()
    }

    pub fn register(&mut self, handler: Arc<dyn EventHandler>) {
        self.handlers.push(handler);
    }

    pub fn is_enabled(&self) -> bool {
        !self.handlers.is_empty()
    }

    pub fn notify(&self, plugin: Option<String>, handle_id: Option<u64>, event: Value) {
        if self.handlers.is_empty() {
            return;
        }
        let event = GatewayEvent {
            plugin,
            handle_id,
            when: SystemTime::now(),
            event,
        };
        for handler in &self.handlers {
            handler.handle_event(event.clone());
        }
    }
}
