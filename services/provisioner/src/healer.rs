//! Host failure detection and container healing.
//!
//! Every host walks a small state machine: Healthy -> Suspected (enough
//! counted failures) -> Healing (containers being re-created elsewhere)
//! -> Retired (removed from the cluster) or back to Healthy on recovery.
//!
//! What counts toward suspicion is scoped deliberately:
//! - general operations (pull, inspect, exec, start, stop) count only
//!   network-class failures; an application-level error says nothing
//!   about the host,
//! - container creation counts any failure, because creation failures
//!   suggest node resource or configuration problems.
//!
//! Healing itself runs through the unit-change engine, so it is pipeline
//! executed and reversible. Node healing is single-flight per host, and a
//! per-container fencing set coalesces concurrent attempts against the
//! same container. Healing errors never surface to user requests; they
//! are written to the durable healing history.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, Connection};
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::cluster::host::HostError;
use crate::cluster::{FailureSink, HostOp};
use crate::container::{AppRef, Container};
use crate::engine::{self, ChangeUnitsArgs};
use crate::state::{CoreState, NullProgress};

/// Health of a host as seen by the healer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeHealth {
    Healthy,
    /// Failures crossed the threshold; healing is pending.
    Suspected,
    /// Containers are being re-created on other hosts.
    Healing,
    /// Healed and removed from the cluster.
    Retired,
}

struct HostRecord {
    failures: Vec<Instant>,
    health: NodeHealth,
}

impl Default for HostRecord {
    fn default() -> Self {
        Self {
            failures: Vec::new(),
            health: NodeHealth::Healthy,
        }
    }
}

/// Windowed failure accounting per host.
///
/// This is the event interface the cluster reports into; it is shared by
/// the cluster (writer) and the healer (reader), which breaks the cycle
/// between provisioner and healer.
pub struct SuspicionTracker {
    threshold: u32,
    window: Duration,
    hosts: StdMutex<HashMap<String, HostRecord>>,
}

impl SuspicionTracker {
    pub fn new(threshold: u32, window: Duration) -> Self {
        Self {
            threshold: threshold.max(1),
            window,
            hosts: StdMutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, HostRecord>> {
        self.hosts.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn health(&self, host: &str) -> NodeHealth {
        self.lock()
            .get(host)
            .map(|r| r.health)
            .unwrap_or(NodeHealth::Healthy)
    }

    pub fn set_health(&self, host: &str, health: NodeHealth) {
        let mut hosts = self.lock();
        let record = hosts.entry(host.to_string()).or_default();
        record.health = health;
        if health == NodeHealth::Healthy {
            record.failures.clear();
        }
    }

    /// Hosts currently waiting to be healed.
    pub fn suspects(&self) -> Vec<String> {
        self.lock()
            .iter()
            .filter(|(_, record)| record.health == NodeHealth::Suspected)
            .map(|(host, _)| host.clone())
            .collect()
    }
}

impl FailureSink for SuspicionTracker {
    fn on_failure(&self, host: &str, op: HostOp, err: &HostError) {
        let counted = match op {
            HostOp::Creation => true,
            HostOp::General => err.is_network(),
        };
        if !counted {
            return;
        }
        let now = Instant::now();
        let mut hosts = self.lock();
        let record = hosts.entry(host.to_string()).or_default();
        if matches!(record.health, NodeHealth::Healing | NodeHealth::Retired) {
            return;
        }
        record.failures.push(now);
        record
            .failures
            .retain(|t| now.duration_since(*t) <= self.window);
        if record.failures.len() as u32 >= self.threshold {
            if record.health != NodeHealth::Suspected {
                warn!(host, failures = record.failures.len(), "host is now suspected");
            }
            record.health = NodeHealth::Suspected;
        }
    }

    fn on_success(&self, host: &str) {
        let mut hosts = self.lock();
        if let Some(record) = hosts.get_mut(host) {
            if record.health == NodeHealth::Suspected {
                info!(host, "host recovered before healing started");
                record.health = NodeHealth::Healthy;
            }
            record.failures.clear();
        }
    }
}

/// One durable healing record.
#[derive(Debug, Clone)]
pub struct HealingEvent {
    pub id: i64,
    pub created_at: DateTime<Utc>,
    pub node: String,
    pub containers: Vec<String>,
    pub outcome: String,
}

/// Errors from the healing history store.
#[derive(Debug, Error)]
pub enum HistoryError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

/// Bounded, durable history of healing events.
#[derive(Clone)]
pub struct HealingHistory {
    conn: Arc<StdMutex<Connection>>,
}

impl HealingHistory {
    pub(crate) fn new(conn: Arc<StdMutex<Connection>>) -> Self {
        Self { conn }
    }

    pub fn record(
        &self,
        node: &str,
        containers: &[String],
        outcome: &str,
        limit: usize,
    ) -> Result<(), HistoryError> {
        let payload = serde_json::to_string(containers).unwrap_or_else(|_| "[]".to_string());
        let conn = crate::storage::lock(&self.conn);
        conn.execute(
            "INSERT INTO healing_events (created_at, node, containers, outcome) VALUES (?1, ?2, ?3, ?4)",
            params![Utc::now().timestamp(), node, payload, outcome],
        )?;
        conn.execute(
            r#"
            DELETE FROM healing_events WHERE id NOT IN (
                SELECT id FROM healing_events ORDER BY id DESC LIMIT ?1
            )
            "#,
            params![limit as i64],
        )?;
        Ok(())
    }

    /// Most recent events first.
    pub fn list(&self, limit: usize) -> Result<Vec<HealingEvent>, HistoryError> {
        let conn = crate::storage::lock(&self.conn);
        let mut stmt = conn.prepare(
            "SELECT id, created_at, node, containers, outcome FROM healing_events ORDER BY id DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit as i64], |row| {
            let ts: i64 = row.get(1)?;
            let containers: String = row.get(3)?;
            Ok(HealingEvent {
                id: row.get(0)?,
                created_at: Utc.timestamp_opt(ts, 0).single().unwrap_or_default(),
                node: row.get(2)?,
                containers: serde_json::from_str(&containers).unwrap_or_default(),
                outcome: row.get(4)?,
            })
        })?;
        let mut events = Vec::new();
        for event in rows {
            events.push(event?);
        }
        Ok(events)
    }
}

/// Re-creates containers away from failing hosts.
pub struct NodeHealer {
    state: Arc<CoreState>,
    tracker: Arc<SuspicionTracker>,
    /// Container ids with a healing attempt in flight.
    fencing: StdMutex<HashSet<String>>,
    /// Hosts with a healing run in flight (single-flight per host).
    inflight: StdMutex<HashSet<String>>,
}

impl NodeHealer {
    pub fn new(state: Arc<CoreState>, tracker: Arc<SuspicionTracker>) -> Self {
        Self {
            state,
            tracker,
            fencing: StdMutex::new(HashSet::new()),
            inflight: StdMutex::new(HashSet::new()),
        }
    }

    /// Run the healing loop until shutdown.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let interval = self.state.config.healing.scan_interval;
        info!(scan_interval_secs = interval.as_secs(), "starting healer");
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.scan().await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("healer shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// Heal every host currently suspected.
    pub async fn scan(&self) {
        for host in self.tracker.suspects() {
            self.heal_node(&host).await;
        }
    }

    /// Heal one host: re-create each of its containers elsewhere, then
    /// retire it. A second request for a host already being healed (or
    /// already retired) is dropped as a duplicate.
    pub async fn heal_node(&self, host: &str) {
        if matches!(
            self.tracker.health(host),
            NodeHealth::Healing | NodeHealth::Retired
        ) {
            debug!(host, "host already handled, dropping healing request");
            return;
        }
        {
            let mut inflight = self
                .inflight
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if !inflight.insert(host.to_string()) {
                debug!(host, "healing already in flight, dropping duplicate");
                return;
            }
        }
        self.tracker.set_health(host, NodeHealth::Healing);
        let outcome = self.heal_node_containers(host).await;
        match &outcome {
            HealOutcome::Healed { containers } => {
                info!(host, healed = containers.len(), "node healed");
                match self.state.cluster.unregister_node(host).await {
                    Ok(()) => self.tracker.set_health(host, NodeHealth::Retired),
                    Err(err) => {
                        warn!(host, error = %err, "healed node could not be retired");
                        self.tracker.set_health(host, NodeHealth::Suspected);
                    }
                }
            }
            HealOutcome::Failed { reason, .. } => {
                error!(host, reason, "node healing failed");
                self.tracker.set_health(host, NodeHealth::Suspected);
            }
        }
        self.record_outcome(host, &outcome);
        let mut inflight = self
            .inflight
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        inflight.remove(host);
    }

    async fn heal_node_containers(&self, host: &str) -> HealOutcome {
        let bare_host = crate::cluster::url_to_host(host);
        let containers = match self.state.store.list_by_host(&bare_host) {
            Ok(containers) => containers,
            Err(err) => {
                return HealOutcome::Failed {
                    containers: Vec::new(),
                    reason: err.to_string(),
                }
            }
        };
        let pool = self
            .state
            .cluster
            .node(host)
            .await
            .and_then(|node| node.pool().map(str::to_string))
            .unwrap_or_default();

        let mut healed = Vec::new();
        for container in containers {
            if !self.fence(&container.id) {
                debug!(container_id = %container.id, "healing already in flight for container");
                continue;
            }
            let result = self.heal_container(&container, host, &pool).await;
            self.unfence(&container.id);
            match result {
                Ok(()) => healed.push(container.id),
                Err(err) => {
                    return HealOutcome::Failed {
                        containers: healed,
                        reason: format!("container {}: {err}", container.id),
                    }
                }
            }
        }
        HealOutcome::Healed { containers: healed }
    }

    /// Replace one container on an alternate host: create the new unit,
    /// swap routes (the new route is added before the old is removed) and
    /// delete the old container.
    async fn heal_container(
        &self,
        container: &Container,
        failing_host: &str,
        pool: &str,
    ) -> Result<(), engine::EngineError> {
        info!(
            container_id = %container.id,
            host = failing_host,
            "re-creating container on another host"
        );
        let app = AppRef {
            name: container.app_name.clone(),
            platform: container.platform.clone(),
            pool: pool.to_string(),
            deploys: 1,
        };
        let mut to_add = std::collections::BTreeMap::new();
        to_add.insert(container.process_name.clone(), 1);
        let args = ChangeUnitsArgs {
            app,
            to_add,
            to_remove: vec![container.clone()],
            image: container.image.clone(),
            build_image: container.build_image.clone(),
            to_host: None,
            avoid_hosts: vec![failing_host.to_string()],
            writer: Arc::new(NullProgress),
        };
        engine::change_units(&self.state, args).await?;
        Ok(())
    }

    fn fence(&self, container_id: &str) -> bool {
        self.fencing
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(container_id.to_string())
    }

    fn unfence(&self, container_id: &str) {
        self.fencing
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(container_id);
    }

    fn record_outcome(&self, host: &str, outcome: &HealOutcome) {
        let limit = self.state.config.healing.history_limit;
        let (containers, text) = match outcome {
            HealOutcome::Healed { containers } => (containers.clone(), "healed".to_string()),
            HealOutcome::Failed { containers, reason } => {
                (containers.clone(), format!("failed: {reason}"))
            }
        };
        if let Err(err) = self.state.healing.record(host, &containers, &text, limit) {
            error!(host, error = %err, "failed to record healing event");
        }
    }
}

enum HealOutcome {
    Healed { containers: Vec<String> },
    Failed { containers: Vec<String>, reason: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn network_err() -> HostError {
        HostError::Network {
            host: "http://url0:1234".to_string(),
            reason: "connection refused".to_string(),
        }
    }

    fn api_err() -> HostError {
        HostError::Api {
            host: "http://url0:1234".to_string(),
            status: 404,
            body: "no such image".to_string(),
        }
    }

    #[test]
    fn test_network_errors_count_for_general_ops() {
        let tracker = SuspicionTracker::new(2, Duration::from_secs(60));
        tracker.on_failure("h1", HostOp::General, &network_err());
        assert_eq!(tracker.health("h1"), NodeHealth::Healthy);
        tracker.on_failure("h1", HostOp::General, &network_err());
        assert_eq!(tracker.health("h1"), NodeHealth::Suspected);
    }

    #[test]
    fn test_application_errors_do_not_count_for_general_ops() {
        let tracker = SuspicionTracker::new(1, Duration::from_secs(60));
        tracker.on_failure("h1", HostOp::General, &api_err());
        tracker.on_failure("h1", HostOp::General, &api_err());
        assert_eq!(tracker.health("h1"), NodeHealth::Healthy);
    }

    #[test]
    fn test_any_error_counts_for_creation() {
        let tracker = SuspicionTracker::new(1, Duration::from_secs(60));
        tracker.on_failure("h1", HostOp::Creation, &api_err());
        assert_eq!(tracker.health("h1"), NodeHealth::Suspected);
    }

    #[test]
    fn test_success_recovers_suspected_host() {
        let tracker = SuspicionTracker::new(1, Duration::from_secs(60));
        tracker.on_failure("h1", HostOp::General, &network_err());
        assert_eq!(tracker.health("h1"), NodeHealth::Suspected);
        tracker.on_success("h1");
        assert_eq!(tracker.health("h1"), NodeHealth::Healthy);
        assert!(tracker.suspects().is_empty());
    }

    #[test]
    fn test_healing_host_ignores_further_failures() {
        let tracker = SuspicionTracker::new(1, Duration::from_secs(60));
        tracker.set_health("h1", NodeHealth::Healing);
        tracker.on_failure("h1", HostOp::Creation, &api_err());
        assert_eq!(tracker.health("h1"), NodeHealth::Healing);
    }

    #[test]
    fn test_healing_history_is_bounded() {
        let storage = crate::storage::Storage::open_in_memory().unwrap();
        let history = storage.healing();
        for i in 0..5 {
            history
                .record(&format!("h{i}"), &[format!("c{i}")], "healed", 3)
                .unwrap();
        }
        let events = history.list(10).unwrap();
        assert_eq!(events.len(), 3);
        assert_eq!(events[0].node, "h4");
        assert_eq!(events[2].node, "h2");
        assert_eq!(events[0].containers, vec!["c4"]);
        assert_eq!(events[0].outcome, "healed");
    }
}
