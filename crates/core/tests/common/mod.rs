//! Shared test support

#![allow(dead_code)]

use async_trait::async_trait;
use navvy_core::manager::{BuildTaskRegistry, CancellationToken, Manager};
use navvy_core::messages::BuildEvent;
use navvy_core::Result;
use std::sync::Mutex;
use uuid::Uuid;

/// Manager that records every message it receives
pub struct RecordingManager {
    events: Mutex<Vec<BuildEvent>>,
    pub registry: BuildTaskRegistry,
}

impl RecordingManager {
    pub fn new() -> Self {
        Self {
            events: Mutex::new(Vec::new()),
            registry: BuildTaskRegistry::new(),
        }
    }

    pub fn events(&self) -> Vec<BuildEvent> {
        self.events.lock().unwrap().clone()
    }
}

impl Default for RecordingManager {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Manager for RecordingManager {
    fn repo_id(&self) -> String {
        "i".to_string()
    }

    async fn send_info(&self, event: BuildEvent) -> Result<()> {
        self.events.lock().unwrap().push(event);
        Ok(())
    }

    fn add_build_task(&self, build_uuid: Uuid, canceller: CancellationToken) {
        self.registry.register(build_uuid, canceller);
    }

    fn rm_build_task(&self, build_uuid: Uuid) {
        self.registry.unregister(build_uuid);
    }
}
