//! Cluster membership and container-to-host binding.
//!
//! The cluster owns two pieces of state that deliberately live outside the
//! container record store: the set of registered nodes and the mapping
//! from container id to host address. The healer's job is to reconcile
//! this mapping with the record store when hosts misbehave.
//!
//! Every remote operation is routed through here so that failures can be
//! reported to a `FailureSink` observer with the right scope: container
//! creation failures always count, general operations only when the
//! failure is network-class.

pub mod host;

use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock as StdRwLock;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use host::{
    ContainerInspect, CreateContainerOptions, Duplex, ExecResult, HostClient, HostError,
    TtyGeometry,
};

/// Bare host name of a node API address.
///
/// Node addresses are URLs (`http://node0:2375`); container records and
/// route addresses carry only the host part.
pub fn url_to_host(address: &str) -> String {
    let trimmed = address
        .trim_start_matches("https://")
        .trim_start_matches("http://");
    trimmed
        .split([':', '/'])
        .next()
        .unwrap_or(trimmed)
        .to_string()
}

/// A registered container host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    /// API address, e.g. `http://10.0.0.1:2375`.
    pub address: String,
    /// Free-form metadata; `pool` carries the segregation key.
    pub metadata: BTreeMap<String, String>,
}

impl Node {
    pub fn new(address: &str) -> Self {
        Self {
            address: address.to_string(),
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_pool(mut self, pool: &str) -> Self {
        self.metadata.insert("pool".to_string(), pool.to_string());
        self
    }

    pub fn pool(&self) -> Option<&str> {
        self.metadata.get("pool").map(String::as_str)
    }
}

/// Scope of a failed host operation, for suspicion accounting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostOp {
    /// Container creation: any failure counts toward suspicion.
    Creation,
    /// Everything else: only network-class failures count.
    General,
}

/// Observer for host operation outcomes.
///
/// Passed down at construction to break the dependency cycle between the
/// provisioner and the healer: the cluster only knows this interface.
pub trait FailureSink: Send + Sync {
    fn on_failure(&self, host: &str, op: HostOp, err: &HostError);
    fn on_success(&self, host: &str);
}

/// Errors from cluster operations.
#[derive(Debug, Error)]
pub enum ClusterError {
    #[error(transparent)]
    Host(#[from] HostError),

    #[error("no host bound for container {0}")]
    NotBound(String),

    #[error("node already registered: {0}")]
    NodeExists(String),

    #[error("node not found: {0}")]
    NodeNotFound(String),

    #[error("node {0} still has containers bound, drain it first")]
    NodeInUse(String),
}

impl ClusterError {
    pub fn is_network(&self) -> bool {
        matches!(self, Self::Host(err) if err.is_network())
    }
}

/// The cluster binding.
pub struct Cluster {
    nodes: RwLock<BTreeMap<String, Node>>,
    bindings: RwLock<HashMap<String, String>>,
    client: Arc<dyn HostClient>,
    sink: StdRwLock<Option<Arc<dyn FailureSink>>>,
}

impl Cluster {
    pub fn new(client: Arc<dyn HostClient>) -> Self {
        Self {
            nodes: RwLock::new(BTreeMap::new()),
            bindings: RwLock::new(HashMap::new()),
            client,
            sink: StdRwLock::new(None),
        }
    }

    /// Install the failure observer. Done once at wiring time.
    pub fn set_failure_sink(&self, sink: Arc<dyn FailureSink>) {
        if let Ok(mut slot) = self.sink.write() {
            *slot = Some(sink);
        }
    }

    // Node membership -------------------------------------------------------

    pub async fn register_node(&self, node: Node) -> Result<(), ClusterError> {
        let mut nodes = self.nodes.write().await;
        if nodes.contains_key(&node.address) {
            return Err(ClusterError::NodeExists(node.address));
        }
        debug!(address = %node.address, pool = node.pool().unwrap_or(""), "registered node");
        nodes.insert(node.address.clone(), node);
        Ok(())
    }

    /// Remove a node from the cluster. Containers must have been drained
    /// (or healed away) first.
    pub async fn unregister_node(&self, address: &str) -> Result<(), ClusterError> {
        let bound = {
            let bindings = self.bindings.read().await;
            bindings.values().any(|host| host == address)
        };
        if bound {
            return Err(ClusterError::NodeInUse(address.to_string()));
        }
        let mut nodes = self.nodes.write().await;
        if nodes.remove(address).is_none() {
            return Err(ClusterError::NodeNotFound(address.to_string()));
        }
        debug!(address, "unregistered node");
        Ok(())
    }

    pub async fn nodes(&self) -> Vec<Node> {
        self.nodes.read().await.values().cloned().collect()
    }

    pub async fn node(&self, address: &str) -> Option<Node> {
        self.nodes.read().await.get(address).cloned()
    }

    /// Nodes whose pool metadata matches. An empty pool matches all nodes.
    pub async fn nodes_for_pool(&self, pool: &str) -> Vec<Node> {
        self.nodes
            .read()
            .await
            .values()
            .filter(|node| pool.is_empty() || node.pool() == Some(pool))
            .cloned()
            .collect()
    }

    // Container binding -----------------------------------------------------

    pub async fn host_for(&self, container_id: &str) -> Result<String, ClusterError> {
        self.bindings
            .read()
            .await
            .get(container_id)
            .cloned()
            .ok_or_else(|| ClusterError::NotBound(container_id.to_string()))
    }

    pub async fn bind(&self, container_id: &str, host: &str) {
        self.bindings
            .write()
            .await
            .insert(container_id.to_string(), host.to_string());
    }

    pub async fn unbind(&self, container_id: &str) {
        self.bindings.write().await.remove(container_id);
    }

    pub async fn bound_containers(&self, host: &str) -> Vec<String> {
        self.bindings
            .read()
            .await
            .iter()
            .filter(|(_, bound)| bound.as_str() == host)
            .map(|(id, _)| id.clone())
            .collect()
    }

    // Remote operations -----------------------------------------------------

    /// Create a container on a specific host and bind the returned id.
    pub async fn create_container(
        &self,
        host: &str,
        opts: &CreateContainerOptions,
    ) -> Result<String, ClusterError> {
        match self.client.create_container(host, opts).await {
            Ok(id) => {
                self.report_success(host);
                self.bind(&id, host).await;
                Ok(id)
            }
            Err(err) => {
                self.report_failure(host, HostOp::Creation, &err);
                Err(err.into())
            }
        }
    }

    pub async fn start_container(&self, container_id: &str) -> Result<(), ClusterError> {
        let host = self.host_for(container_id).await?;
        self.general(&host, self.client.start_container(&host, container_id).await)
    }

    pub async fn stop_container(&self, container_id: &str) -> Result<(), ClusterError> {
        let host = self.host_for(container_id).await?;
        self.general(&host, self.client.stop_container(&host, container_id).await)
    }

    /// Remove the container on the host and drop its binding.
    pub async fn remove_container(&self, container_id: &str) -> Result<(), ClusterError> {
        let host = self.host_for(container_id).await?;
        let result = self.client.remove_container(&host, container_id).await;
        if result.is_ok() {
            self.unbind(container_id).await;
        }
        self.general(&host, result)
    }

    pub async fn inspect_container(
        &self,
        container_id: &str,
    ) -> Result<ContainerInspect, ClusterError> {
        let host = self.host_for(container_id).await?;
        self.general(
            &host,
            self.client.inspect_container(&host, container_id).await,
        )
    }

    pub async fn pull_image(&self, host: &str, image: &str) -> Result<(), ClusterError> {
        self.general(host, self.client.pull_image(host, image).await)
    }

    /// Remove an image from every registered node, tolerating failures.
    pub async fn remove_image_from_nodes(&self, image: &str) {
        for node in self.nodes().await {
            if let Err(err) = self.client.remove_image(&node.address, image).await {
                warn!(host = %node.address, image, error = %err, "failed to remove image from node");
            }
        }
    }

    pub async fn exec(
        &self,
        container_id: &str,
        cmd: &[String],
    ) -> Result<ExecResult, ClusterError> {
        let host = self.host_for(container_id).await?;
        self.general(&host, self.client.exec(&host, container_id, cmd).await)
    }

    pub async fn attach_shell(
        &self,
        container_id: &str,
        tty: &TtyGeometry,
        conn: &mut dyn Duplex,
    ) -> Result<(), ClusterError> {
        let host = self.host_for(container_id).await?;
        self.general(
            &host,
            self.client.attach_shell(&host, container_id, tty, conn).await,
        )
    }

    // Failure reporting -----------------------------------------------------

    fn general<T>(&self, host: &str, result: Result<T, HostError>) -> Result<T, ClusterError> {
        match result {
            Ok(value) => {
                self.report_success(host);
                Ok(value)
            }
            Err(err) => {
                self.report_failure(host, HostOp::General, &err);
                Err(err.into())
            }
        }
    }

    fn report_failure(&self, host: &str, op: HostOp, err: &HostError) {
        if let Ok(slot) = self.sink.read() {
            if let Some(sink) = slot.as_ref() {
                sink.on_failure(host, op, err);
            }
        }
    }

    fn report_success(&self, host: &str) {
        if let Ok(slot) = self.sink.read() {
            if let Some(sink) = slot.as_ref() {
                sink.on_success(host);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeHostClient;

    #[test]
    fn test_url_to_host() {
        assert_eq!(url_to_host("http://node0:2375"), "node0");
        assert_eq!(url_to_host("https://10.0.0.4:2376/"), "10.0.0.4");
        assert_eq!(url_to_host("node0:2375"), "node0");
        assert_eq!(url_to_host("node0"), "node0");
    }

    #[tokio::test]
    async fn test_node_registration() {
        let cluster = Cluster::new(Arc::new(FakeHostClient::new()));
        cluster
            .register_node(Node::new("http://url0:1234").with_pool("pool1"))
            .await
            .unwrap();
        assert!(matches!(
            cluster.register_node(Node::new("http://url0:1234")).await,
            Err(ClusterError::NodeExists(_))
        ));

        let pool_nodes = cluster.nodes_for_pool("pool1").await;
        assert_eq!(pool_nodes.len(), 1);
        assert!(cluster.nodes_for_pool("other").await.is_empty());
        // Empty pool matches everything.
        assert_eq!(cluster.nodes_for_pool("").await.len(), 1);
    }

    #[tokio::test]
    async fn test_unregister_requires_drained_node() {
        let cluster = Cluster::new(Arc::new(FakeHostClient::new()));
        cluster
            .register_node(Node::new("http://url0:1234"))
            .await
            .unwrap();
        cluster.bind("c1", "http://url0:1234").await;
        assert!(matches!(
            cluster.unregister_node("http://url0:1234").await,
            Err(ClusterError::NodeInUse(_))
        ));
        cluster.unbind("c1").await;
        cluster.unregister_node("http://url0:1234").await.unwrap();
        assert!(matches!(
            cluster.unregister_node("http://url0:1234").await,
            Err(ClusterError::NodeNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_create_binds_and_remove_unbinds() {
        let client = Arc::new(FakeHostClient::new());
        let cluster = Cluster::new(client.clone());
        cluster
            .register_node(Node::new("http://url0:1234"))
            .await
            .unwrap();

        let opts = CreateContainerOptions {
            image: "slipway/app-myapp:v1".to_string(),
            ..Default::default()
        };
        let id = cluster
            .create_container("http://url0:1234", &opts)
            .await
            .unwrap();
        assert_eq!(cluster.host_for(&id).await.unwrap(), "http://url0:1234");

        cluster.remove_container(&id).await.unwrap();
        assert!(matches!(
            cluster.host_for(&id).await,
            Err(ClusterError::NotBound(_))
        ));
    }

    #[tokio::test]
    async fn test_operations_on_unbound_container() {
        let cluster = Cluster::new(Arc::new(FakeHostClient::new()));
        assert!(matches!(
            cluster.start_container("ghost").await,
            Err(ClusterError::NotBound(_))
        ));
    }
}
