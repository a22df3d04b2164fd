//! Record-vs-reality reconciliation.
//!
//! Records drift when a container restarts behind our back or a host
//! renumbers its port mappings. This pass re-inspects every container
//! that should be running and rewrites the stored ip and host port from
//! what the host actually reports.

use std::sync::Arc;

use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::cluster::ClusterError;
use crate::container::store::StoreError;
use crate::container::Status;
use crate::state::CoreState;

/// Restore cluster bindings from the record store.
///
/// The binding map is process-local; after a restart it is rebuilt from
/// the host address each record carries.
pub async fn recover_bindings(state: &Arc<CoreState>) -> Result<usize, StoreError> {
    let containers = state.store.list_all()?;
    let nodes = state.cluster.nodes().await;
    let mut recovered = 0;
    for container in &containers {
        if container.host_addr.is_empty() {
            continue;
        }
        if state.cluster.host_for(&container.id).await.is_ok() {
            continue;
        }
        // Records carry the bare host; bindings need the node API address.
        let address = nodes
            .iter()
            .find(|node| crate::cluster::url_to_host(&node.address) == container.host_addr)
            .map(|node| node.address.clone())
            .unwrap_or_else(|| container.host_addr.clone());
        state.cluster.bind(&container.id, &address).await;
        recovered += 1;
    }
    if recovered > 0 {
        info!(recovered, "recovered container bindings from records");
    }
    Ok(recovered)
}

/// One reconciliation pass over all running containers.
///
/// Containers whose inspection reports an empty ip or port are left
/// unchanged: a container stopped behind our back legitimately exposes
/// nothing, and rewriting the record would erase the last known identity.
pub async fn fix_containers(state: &Arc<CoreState>) -> Result<(), StoreError> {
    let running = [Status::Started, Status::Starting];
    let containers = state
        .store
        .list_all()?
        .into_iter()
        .filter(|c| running.contains(&c.status))
        .collect::<Vec<_>>();

    for container in containers {
        let inspect = match state.cluster.inspect_container(&container.id).await {
            Ok(inspect) => inspect,
            Err(ClusterError::NotBound(_)) => {
                debug!(container_id = %container.id, "container not bound, skipping fix");
                continue;
            }
            Err(err) => {
                warn!(container_id = %container.id, error = %err, "inspection failed during fix");
                continue;
            }
        };
        if inspect.ip.is_empty() || inspect.host_port.is_empty() {
            debug!(
                container_id = %container.id,
                "inspection reported empty network identity, record left unchanged"
            );
            continue;
        }
        if inspect.ip != container.ip || inspect.host_port != container.host_port {
            info!(
                container_id = %container.id,
                old_ip = %container.ip,
                new_ip = %inspect.ip,
                old_port = %container.host_port,
                new_port = %inspect.host_port,
                "fixing drifted container record"
            );
            state
                .store
                .set_network(&container.id, &inspect.ip, &inspect.host_port)?;
        }
    }
    Ok(())
}

/// Periodic reconciliation worker.
pub struct FixWorker {
    state: Arc<CoreState>,
}

impl FixWorker {
    pub fn new(state: Arc<CoreState>) -> Self {
        Self { state }
    }

    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let interval = self.state.config.fix_interval;
        info!(interval_secs = interval.as_secs(), "starting fix worker");
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(err) = fix_containers(&self.state).await {
                        warn!(error = %err, "fix pass failed");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("fix worker shutting down");
                        break;
                    }
                }
            }
        }
    }
}
