//! Container records and lifecycle status.
//!
//! A container is one running unit of an application. Records live in the
//! container store; the cluster binding separately tracks which host each
//! container runs on, and the healer reconciles the two.

pub mod store;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle status of a container.
///
/// Wire representation is the lowercase name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    /// Created during a deploy, not yet promoted by registration.
    Building,
    /// Created on the host but never started.
    Created,
    /// Start issued, unit not yet registered as up.
    Starting,
    /// Unit is up and serving.
    Started,
    /// Explicitly stopped.
    Stopped,
    /// Put to sleep by the platform.
    Asleep,
    /// Launch or runtime failure.
    Error,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Building => "building",
            Self::Created => "created",
            Self::Starting => "starting",
            Self::Started => "started",
            Self::Stopped => "stopped",
            Self::Asleep => "asleep",
            Self::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "building" => Some(Self::Building),
            "created" => Some(Self::Created),
            "starting" => Some(Self::Starting),
            "started" => Some(Self::Started),
            "stopped" => Some(Self::Stopped),
            "asleep" => Some(Self::Asleep),
            "error" => Some(Self::Error),
            _ => None,
        }
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A container record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Container {
    /// Short opaque id assigned by the container host.
    pub id: String,
    /// Owning application.
    pub app_name: String,
    /// Named entry point this container runs.
    pub process_name: String,
    /// Platform of the owning application (informational, shown on units).
    pub platform: String,
    /// Image tag the container was created from.
    pub image: String,
    /// Image tag being produced when this container is part of a deploy.
    pub build_image: Option<String>,
    /// Address of the host the container was scheduled onto.
    pub host_addr: String,
    /// Host port mapped to the unit's exposed port, assigned post-start.
    pub host_port: String,
    /// Internal ip, assigned post-start.
    pub ip: String,
    pub status: Status,
    pub status_updated_at: DateTime<Utc>,
}

impl Container {
    /// Routable address of the unit.
    pub fn address(&self) -> String {
        format!("http://{}:{}", self.host_addr, self.host_port)
    }

    /// Whether the unit is (or is about to be) serving traffic.
    pub fn available(&self) -> bool {
        matches!(self.status, Status::Started | Status::Starting)
    }

    /// External unit descriptor for this container.
    pub fn as_unit(&self) -> Unit {
        Unit {
            name: self.id.clone(),
            app_name: self.app_name.clone(),
            unit_type: self.platform.clone(),
            ip: self.ip.clone(),
            status: self.status,
            address: self.address(),
        }
    }
}

/// Unit descriptor exposed through the provisioner contract.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Unit {
    /// Unit name: the container id.
    pub name: String,
    pub app_name: String,
    /// Platform of the owning application.
    #[serde(rename = "type")]
    pub unit_type: String,
    pub ip: String,
    pub status: Status,
    /// `http://host:port`.
    pub address: String,
}

/// Read-only view of the application an operation acts on.
///
/// The core never mutates application state; it only consumes the fields
/// that drive scheduling and image naming.
#[derive(Debug, Clone, Default)]
pub struct AppRef {
    pub name: String,
    pub platform: String,
    /// Pool segregation key; empty means no segregation.
    pub pool: String,
    /// Number of deploys this application has had.
    pub deploys: u64,
}

impl AppRef {
    pub fn new(name: &str, platform: &str) -> Self {
        Self {
            name: name.to_string(),
            platform: platform.to_string(),
            ..Self::default()
        }
    }

    pub fn with_pool(mut self, pool: &str) -> Self {
        self.pool = pool.to_string();
        self
    }

    pub fn with_deploys(mut self, deploys: u64) -> Self {
        self.deploys = deploys;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_roundtrip() {
        for status in [
            Status::Building,
            Status::Created,
            Status::Starting,
            Status::Started,
            Status::Stopped,
            Status::Asleep,
            Status::Error,
        ] {
            assert_eq!(Status::parse(status.as_str()), Some(status));
        }
        assert_eq!(Status::parse("bogus"), None);
    }

    #[test]
    fn test_status_wire_format_is_lowercase() {
        let json = serde_json::to_string(&Status::Started).unwrap();
        assert_eq!(json, "\"started\"");
        let parsed: Status = serde_json::from_str("\"asleep\"").unwrap();
        assert_eq!(parsed, Status::Asleep);
    }

    #[test]
    fn test_container_address() {
        let cont = Container {
            id: "9930c24f1c4x".to_string(),
            app_name: "makea".to_string(),
            process_name: "web".to_string(),
            platform: "python".to_string(),
            image: "slipway/app-makea:v1".to_string(),
            build_image: None,
            host_addr: "10.0.0.4".to_string(),
            host_port: "49153".to_string(),
            ip: "172.17.0.8".to_string(),
            status: Status::Started,
            status_updated_at: Utc::now(),
        };
        assert_eq!(cont.address(), "http://10.0.0.4:49153");
        let unit = cont.as_unit();
        assert_eq!(unit.name, "9930c24f1c4x");
        assert_eq!(unit.unit_type, "python");
        assert_eq!(unit.address, "http://10.0.0.4:49153");
    }
}
