//! slipway provisioner
//!
//! The container provisioning and scheduling core of the platform: it
//! places application units onto container hosts, drives container and
//! image lifecycles, keeps router state consistent through deploys and
//! scale operations, and heals containers away from failing hosts.
//!
//! The public surface is the [`provisioner::Provisioner`] facade; the API
//! layer consumes nothing else. Background maintenance (healing, record
//! reconciliation) runs as workers driven by the `slipwayd` binary.

pub mod cluster;
pub mod config;
pub mod container;
pub mod engine;
pub mod fix;
pub mod healer;
pub mod image;
pub mod provisioner;
pub mod router;
pub mod scheduler;
pub mod state;
pub mod storage;
pub mod testing;

pub use config::Config;
pub use container::{AppRef, Container, Status, Unit};
pub use provisioner::{DeployOptions, Provisioner, ProvisionError, ShellOptions};
pub use state::{BindingEvents, CoreState, ProgressSink};
