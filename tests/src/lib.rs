//! Shared helpers for the integration suite.

use std::sync::Arc;

use parking_lot::Mutex;
use zerolink_core::{Event, EventMessage};
use zerolink_service::EventHandler;

/// Event handler that records every delivered event code.
#[derive(Default)]
pub struct EventLog(pub Mutex<Vec<Event>>);

impl EventHandler for EventLog {
    fn on_event(&self, msg: &EventMessage) {
        self.0.lock().push(msg.event);
    }
}

impl EventLog {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn contains(&self, event: Event) -> bool {
        self.0.lock().contains(&event)
    }
}

/// Poll a condition for up to `seconds`, sleeping briefly between tries.
pub fn wait_for(seconds: u64, what: impl Fn() -> bool) -> bool {
    let deadline = std::time::Instant::now() + std::time::Duration::from_secs(seconds);
    while std::time::Instant::now() < deadline {
        if what() {
            return true;
        }
        std::thread::sleep(std::time::Duration::from_millis(50));
    }
    false
}

/// Install a test subscriber once; later calls are no-ops.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .try_init();
}
