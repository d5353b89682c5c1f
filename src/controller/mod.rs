//! Controllers for the CloudStack infrastructure kinds
//!
//! Every kind runs through the same staged engine in [`engine`]; the
//! kind-specific create and delete paths live in their own modules.

mod cluster;
mod engine;
mod failure_domain;
mod isolated_network;
mod machine;
mod runner;

use std::sync::Arc;

use dashmap::DashMap;
use kube::Client;

pub use engine::{error_policy, reconcile, Outcome, Reconcilable, Scope};
pub use runner::run;

use crate::cloud::CloudSessionFactory;
use crate::config::ControllerConfig;
use crate::propagator::ReconcileRequest;
use crate::store::{KubeStore, ResourceStore};

/// Controller context shared by every reconcile
///
/// Use [`ContextBuilder`] to construct instances:
///
/// ```ignore
/// let ctx = Context::builder(client, sessions)
///     .config(ControllerConfig::from_env())
///     .build();
/// ```
pub struct Context {
    /// Resource store (trait object for testability)
    pub store: Arc<dyn ResourceStore>,
    /// Opens CloudStack sessions from failure-domain credentials
    pub sessions: Arc<dyn CloudSessionFactory>,
    /// Controller tunables
    pub config: ControllerConfig,
    /// Consecutive failures per identity, reset on success
    failures: DashMap<ReconcileRequest, u32>,
}

impl Context {
    /// Create a builder for constructing a Context
    pub fn builder(client: Client, sessions: Arc<dyn CloudSessionFactory>) -> ContextBuilder {
        ContextBuilder::new(client, sessions)
    }

    /// Create a context for testing with mock store and sessions
    #[cfg(test)]
    pub fn for_testing(
        store: Arc<dyn ResourceStore>,
        sessions: Arc<dyn CloudSessionFactory>,
    ) -> Self {
        Self {
            store,
            sessions,
            config: ControllerConfig::default(),
            failures: DashMap::new(),
        }
    }

    /// Count another failure for an identity and return the new count
    pub fn record_failure(&self, request: &ReconcileRequest) -> u32 {
        let mut count = self.failures.entry(request.clone()).or_insert(0);
        *count = count.saturating_add(1);
        *count
    }

    /// Forget the failures of an identity
    pub fn reset_failures(&self, request: &ReconcileRequest) {
        self.failures.remove(request);
    }

    /// Current failure count of an identity
    pub fn failures(&self, request: &ReconcileRequest) -> u32 {
        self.failures.get(request).map(|c| *c).unwrap_or(0)
    }
}

/// Builder for constructing [`Context`] instances
pub struct ContextBuilder {
    client: Client,
    sessions: Arc<dyn CloudSessionFactory>,
    store: Option<Arc<dyn ResourceStore>>,
    config: ControllerConfig,
}

impl ContextBuilder {
    fn new(client: Client, sessions: Arc<dyn CloudSessionFactory>) -> Self {
        Self {
            client,
            sessions,
            store: None,
            config: ControllerConfig::default(),
        }
    }

    /// Override the resource store (primarily for testing)
    pub fn store(mut self, store: Arc<dyn ResourceStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Set the controller configuration
    pub fn config(mut self, config: ControllerConfig) -> Self {
        self.config = config;
        self
    }

    /// Build the Context
    pub fn build(self) -> Context {
        Context {
            store: self
                .store
                .unwrap_or_else(|| Arc::new(KubeStore::new(self.client.clone()))),
            sessions: self.sessions,
            config: self.config,
            failures: DashMap::new(),
        }
    }
}
