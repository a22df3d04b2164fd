//! Shared core state and the small interfaces passed down at wiring time.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::cluster::Cluster;
use crate::config::Config;
use crate::container::store::ContainerStore;
use crate::container::Unit;
use crate::healer::HealingHistory;
use crate::image::{ImageCatalog, RegistryClient};
use crate::router::{Router, RouterError, RouterRegistry};

/// Error emitted by the external binding collaborator.
#[derive(Debug, Error)]
#[error("binding service error: {0}")]
pub struct BindingError(pub String);

/// Events the core emits toward the service-binding subsystem.
///
/// Binding state lives elsewhere; the core only reports units coming and
/// going. The implementation is passed in at construction.
#[async_trait]
pub trait BindingEvents: Send + Sync {
    async fn bind_unit(&self, unit: &Unit) -> Result<(), BindingError>;
    async fn unbind_unit(&self, unit: &Unit) -> Result<(), BindingError>;
}

/// Binding sink for deployments without a binding subsystem.
pub struct NullBinding;

#[async_trait]
impl BindingEvents for NullBinding {
    async fn bind_unit(&self, _unit: &Unit) -> Result<(), BindingError> {
        Ok(())
    }

    async fn unbind_unit(&self, _unit: &Unit) -> Result<(), BindingError> {
        Ok(())
    }
}

/// Caller-supplied sink for operation progress.
///
/// Long-running operations stream human-readable lines here. When the
/// sink reports closed, the running operation finishes its current
/// pipeline stage and then aborts with rollback; mid-stage cancellation
/// is not supported.
pub trait ProgressSink: Send + Sync {
    fn write_line(&self, line: &str);

    fn is_closed(&self) -> bool {
        false
    }
}

/// Sink that discards progress output.
pub struct NullProgress;

impl ProgressSink for NullProgress {
    fn write_line(&self, _line: &str) {}
}

/// Everything the engine, the healer and the facade share.
pub struct CoreState {
    pub config: Config,
    pub store: ContainerStore,
    pub catalog: ImageCatalog,
    pub healing: HealingHistory,
    pub cluster: Arc<Cluster>,
    pub routers: Arc<RouterRegistry>,
    pub binding: Arc<dyn BindingEvents>,
    pub registry: Option<Arc<RegistryClient>>,
}

impl CoreState {
    /// The router configured for application backends.
    pub fn router(&self) -> Result<Arc<dyn Router>, RouterError> {
        self.routers.get(&self.config.default_router)
    }
}
