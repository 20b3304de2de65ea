//! Manager interface
//!
//! The manager is the out-of-scope host that delivers build requests,
//! receives progress messages, and drives external cancellation. The core
//! only sees it through the [`Manager`] trait; the cancellation side is a
//! process-wide registry of build uuid → cancellation token that managers
//! embed.

use crate::errors::Result;
use crate::messages::BuildEvent;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

pub use tokio_util::sync::CancellationToken;

/// The builder's view of its manager
#[async_trait]
pub trait Manager: Send + Sync {
    /// Identity of the repository this build belongs to; used for
    /// container volume naming
    fn repo_id(&self) -> String;

    /// Deliver a progress message. Messages of one build must not be
    /// reordered. A failure here is fatal for the build: the worker has no
    /// one left to report to.
    async fn send_info(&self, event: BuildEvent) -> Result<()>;

    /// Register the canceller of the build's currently-executing step
    fn add_build_task(&self, build_uuid: Uuid, canceller: CancellationToken);

    /// Remove the build's canceller; must be idempotent
    fn rm_build_task(&self, build_uuid: Uuid);
}

/// Process-wide registry of in-flight build cancellers
///
/// Managers hold one registry for all builds they drive. Writes for a given
/// build only ever come from that build's own task, so a plain mutex-guarded
/// map is sufficient.
#[derive(Debug, Default)]
pub struct BuildTaskRegistry {
    tasks: Mutex<HashMap<Uuid, CancellationToken>>,
}

impl BuildTaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the canceller for a build's currently-executing step,
    /// replacing any previous registration
    pub fn register(&self, build_uuid: Uuid, canceller: CancellationToken) {
        let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        tasks.insert(build_uuid, canceller);
    }

    /// Drop the registration for a build; no-op when absent
    pub fn unregister(&self, build_uuid: Uuid) {
        let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        tasks.remove(&build_uuid);
    }

    /// Cancel the build's currently-executing step, if one is registered.
    /// Returns whether a canceller was found.
    pub fn cancel(&self, build_uuid: Uuid) -> bool {
        let tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        match tasks.get(&build_uuid) {
            Some(token) => {
                debug!("Cancelling build {}", build_uuid);
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Number of builds with a registered canceller
    pub fn len(&self) -> usize {
        self.tasks.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_and_cancel() {
        let registry = BuildTaskRegistry::new();
        let build = Uuid::new_v4();
        let token = CancellationToken::new();

        registry.register(build, token.clone());
        assert_eq!(registry.len(), 1);
        assert!(registry.cancel(build));
        assert!(token.is_cancelled());
    }

    #[test]
    fn test_unregister_is_idempotent() {
        let registry = BuildTaskRegistry::new();
        let build = Uuid::new_v4();
        registry.register(build, CancellationToken::new());

        registry.unregister(build);
        registry.unregister(build);
        assert!(registry.is_empty());
        assert!(!registry.cancel(build));
    }

    #[test]
    fn test_reregistration_replaces_token() {
        let registry = BuildTaskRegistry::new();
        let build = Uuid::new_v4();
        let first = CancellationToken::new();
        let second = CancellationToken::new();

        registry.register(build, first.clone());
        registry.register(build, second.clone());
        assert!(registry.cancel(build));
        assert!(!first.is_cancelled());
        assert!(second.is_cancelled());
    }
}
