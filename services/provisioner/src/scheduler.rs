//! Host selection for new containers.
//!
//! Scheduling is segregated by pool: only nodes whose pool metadata
//! matches the application's pool are eligible. Among eligible nodes the
//! least-loaded wins: fewest containers for this app+process, tie-broken
//! by fewest total containers, then by address for determinism.
//!
//! Each unit-change operation builds its own scheduler so the ignored-
//! container set (the about-to-die containers of a rolling replacement)
//! is scoped to that operation.

use std::collections::HashSet;

use thiserror::Error;
use tracing::debug;

use crate::cluster::Node;
use crate::container::store::{ContainerStore, StoreError};
use crate::container::AppRef;

/// Errors from scheduling.
#[derive(Debug, Error)]
pub enum ScheduleError {
    /// No node passed pool filtering.
    #[error("no eligible nodes available")]
    NoEligibleNodes,

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Picks a host for a new container.
pub trait Scheduler: Send + Sync {
    fn schedule(
        &self,
        candidates: &[Node],
        app: &AppRef,
        process: &str,
    ) -> Result<String, ScheduleError>;
}

/// Pool-segregated, least-loaded scheduler.
pub struct SegregatedScheduler {
    store: ContainerStore,
    ignored: HashSet<String>,
}

impl SegregatedScheduler {
    pub fn new(store: ContainerStore) -> Self {
        Self {
            store,
            ignored: HashSet::new(),
        }
    }

    /// Exclude containers from load counting, so a rolling replacement
    /// counts the new containers without counting the old ones.
    pub fn ignore_containers<I: IntoIterator<Item = String>>(&mut self, ids: I) {
        self.ignored.extend(ids);
    }
}

impl Scheduler for SegregatedScheduler {
    fn schedule(
        &self,
        candidates: &[Node],
        app: &AppRef,
        process: &str,
    ) -> Result<String, ScheduleError> {
        let eligible: Vec<&Node> = candidates
            .iter()
            .filter(|node| app.pool.is_empty() || node.pool() == Some(app.pool.as_str()))
            .collect();
        if eligible.is_empty() {
            return Err(ScheduleError::NoEligibleNodes);
        }

        let mut best: Option<(usize, usize, &str)> = None;
        for node in &eligible {
            let containers = self
                .store
                .list_by_host(&crate::cluster::url_to_host(&node.address))?;
            let counted: Vec<_> = containers
                .iter()
                .filter(|c| !self.ignored.contains(&c.id))
                .collect();
            let process_load = counted
                .iter()
                .filter(|c| c.app_name == app.name && c.process_name == process)
                .count();
            let total_load = counted.len();
            let key = (process_load, total_load, node.address.as_str());
            if best.map(|b| key < b).unwrap_or(true) {
                best = Some(key);
            }
        }

        let Some((process_load, total_load, address)) = best else {
            return Err(ScheduleError::NoEligibleNodes);
        };
        debug!(
            app = %app.name,
            process,
            host = address,
            process_load,
            total_load,
            "scheduled container"
        );
        Ok(address.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::{Container, Status};
    use crate::storage::Storage;
    use chrono::Utc;

    fn seed(store: &ContainerStore, id: &str, app: &str, process: &str, host: &str) {
        store
            .insert(&Container {
                id: id.to_string(),
                app_name: app.to_string(),
                process_name: process.to_string(),
                platform: "python".to_string(),
                image: format!("slipway/app-{app}:v1"),
                build_image: None,
                host_addr: host.to_string(),
                host_port: String::new(),
                ip: String::new(),
                status: Status::Started,
                status_updated_at: Utc::now(),
            })
            .unwrap();
    }

    fn two_pool_nodes() -> Vec<Node> {
        vec![
            Node::new("http://url0:1234").with_pool("pool1"),
            Node::new("http://url1:1234").with_pool("pool1"),
        ]
    }

    #[test]
    fn test_alternates_between_equal_nodes() {
        let storage = Storage::open_in_memory().unwrap();
        let store = storage.containers();
        let scheduler = SegregatedScheduler::new(store.clone());
        let app = AppRef::new("myapp", "python").with_pool("pool1");
        let nodes = two_pool_nodes();

        let first = scheduler.schedule(&nodes, &app, "web").unwrap();
        assert_eq!(first, "http://url0:1234");
        seed(&store, "c1", "myapp", "web", &crate::cluster::url_to_host(&first));

        let second = scheduler.schedule(&nodes, &app, "web").unwrap();
        assert_eq!(second, "http://url1:1234");
        seed(&store, "c2", "myapp", "web", &crate::cluster::url_to_host(&second));

        let third = scheduler.schedule(&nodes, &app, "web").unwrap();
        assert_eq!(third, "http://url0:1234");
    }

    #[test]
    fn test_pool_segregation() {
        let storage = Storage::open_in_memory().unwrap();
        let scheduler = SegregatedScheduler::new(storage.containers());
        let app = AppRef::new("myapp", "python").with_pool("pool2");
        let err = scheduler.schedule(&two_pool_nodes(), &app, "web").unwrap_err();
        assert!(matches!(err, ScheduleError::NoEligibleNodes));
        assert_eq!(err.to_string(), "no eligible nodes available");
    }

    #[test]
    fn test_process_load_beats_total_load() {
        let storage = Storage::open_in_memory().unwrap();
        let store = storage.containers();
        // url0 has one web container of this app; url1 has two containers
        // of another app. The web process count decides: url1 wins.
        seed(&store, "c1", "myapp", "web", "url0");
        seed(&store, "c2", "other", "web", "url1");
        seed(&store, "c3", "other", "worker", "url1");

        let scheduler = SegregatedScheduler::new(store);
        let app = AppRef::new("myapp", "python").with_pool("pool1");
        let host = scheduler.schedule(&two_pool_nodes(), &app, "web").unwrap();
        assert_eq!(host, "http://url1:1234");
    }

    #[test]
    fn test_ignored_containers_do_not_count() {
        let storage = Storage::open_in_memory().unwrap();
        let store = storage.containers();
        seed(&store, "old1", "myapp", "web", "url0");
        seed(&store, "old2", "myapp", "web", "url0");
        seed(&store, "c1", "myapp", "web", "url1");

        let mut scheduler = SegregatedScheduler::new(store);
        scheduler.ignore_containers(["old1".to_string(), "old2".to_string()]);
        let app = AppRef::new("myapp", "python").with_pool("pool1");
        // With the old containers ignored, url0 is empty and wins.
        let host = scheduler.schedule(&two_pool_nodes(), &app, "web").unwrap();
        assert_eq!(host, "http://url0:1234");
    }
}
