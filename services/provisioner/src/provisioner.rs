//! The provisioner facade.
//!
//! This is the external contract the API layer consumes. Every operation
//! here composes the record store, the image catalog, the cluster, the
//! scheduler, the router facade and the unit-change engine; none of them
//! are reachable from outside except through this surface.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::cluster::host::{Duplex, TtyGeometry};
use crate::cluster::ClusterError;
use crate::container::store::StoreError;
use crate::container::{AppRef, Container, Status, Unit};
use crate::engine::{self, ChangeUnitsArgs, EngineError};
use crate::image::{app_image_name, CatalogError};
use crate::router::RouterError;
use crate::state::{BindingError, CoreState, ProgressSink};

/// Errors surfaced by the provisioner contract.
#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error("unit not found")]
    UnitNotFound,

    #[error("wrong app name")]
    WrongApp,

    #[error("invalid image for app {app}: {image}")]
    InvalidImage { app: String, image: String },

    #[error("app must have at least 1 unit")]
    NoUnits,

    #[error("command failed in unit {unit} with exit code {exit_code}")]
    CommandFailed { unit: String, exit_code: i32 },

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Catalog(#[from] CatalogError),

    #[error(transparent)]
    Router(#[from] RouterError),

    #[error(transparent)]
    Cluster(#[from] ClusterError),

    #[error(transparent)]
    Binding(#[from] BindingError),

    #[error(transparent)]
    Build(#[from] BuildError),
}

/// Error from the external image builder.
#[derive(Debug, Error)]
#[error("build failed: {0}")]
pub struct BuildError(pub String);

/// A deploy request.
pub struct DeployOptions {
    pub app: AppRef,
    /// Source version to build (git deploys).
    pub version: Option<String>,
    pub commit: Option<String>,
    /// Pre-built image to roll out instead of building.
    pub image: Option<String>,
    pub writer: Arc<dyn ProgressSink>,
}

/// External collaborator that builds and pushes application images.
///
/// The builder must leave the tag pullable by the nodes and record the
/// image's custom data (process table, hooks) in the catalog before
/// returning.
#[async_trait]
pub trait ImageBuilder: Send + Sync {
    async fn build(
        &self,
        app: &AppRef,
        opts: &DeployOptions,
        tag: &str,
    ) -> Result<(), BuildError>;
}

/// Shell attachment request.
pub struct ShellOptions {
    pub app: String,
    /// Attach to this specific unit; otherwise the first available one.
    pub unit: Option<String>,
    pub width: u16,
    pub height: u16,
    pub term: String,
}

/// The container provisioner.
pub struct Provisioner {
    state: Arc<CoreState>,
    builder: Arc<dyn ImageBuilder>,
}

impl Provisioner {
    pub fn new(state: Arc<CoreState>, builder: Arc<dyn ImageBuilder>) -> Self {
        Self { state, builder }
    }

    pub fn state(&self) -> &Arc<CoreState> {
        &self.state
    }

    /// Create the router backend for a new application.
    pub async fn provision(&self, app: &AppRef) -> Result<(), ProvisionError> {
        self.state.router()?.add_backend(&app.name).await?;
        info!(app = %app.name, "provisioned application");
        Ok(())
    }

    /// Remove every trace of an application: containers, routes, images.
    pub async fn destroy(&self, app: &AppRef) -> Result<(), ProvisionError> {
        let containers = self.state.store.list_by_app(&app.name, None, None)?;
        for container in &containers {
            if let Err(err) = self.state.cluster.stop_container(&container.id).await {
                debug!(container_id = %container.id, error = %err, "stop during destroy failed");
            }
            if let Err(err) = self.state.cluster.remove_container(&container.id).await {
                warn!(container_id = %container.id, error = %err, "container removal during destroy failed");
            }
            self.state.cluster.unbind(&container.id).await;
            self.state.store.remove(&container.id)?;
            if let Err(err) = self.state.binding.unbind_unit(&container.as_unit()).await {
                warn!(container_id = %container.id, error = %err, "unbind during destroy failed");
            }
        }

        let tags = self.state.catalog.delete_app(&app.name)?;
        for tag in &tags {
            self.state.cluster.remove_image_from_nodes(tag).await;
            if let Some(registry) = &self.state.registry {
                if let Err(err) = registry.remove_image(tag).await {
                    warn!(tag, error = %err, "registry cleanup failed during destroy");
                }
            }
        }

        match self.state.router()?.remove_backend(&app.name).await {
            Ok(()) | Err(RouterError::BackendNotFound) => {}
            Err(err) => return Err(err.into()),
        }
        info!(app = %app.name, containers = containers.len(), "destroyed application");
        Ok(())
    }

    /// Roll the application onto a new image.
    ///
    /// The tag enters the catalog only after the rollout succeeds, so a
    /// failed deploy leaves both the current image and the registry
    /// contents untouched.
    pub async fn deploy(&self, opts: DeployOptions) -> Result<String, ProvisionError> {
        let app = opts.app.clone();
        let image = match &opts.image {
            Some(image) => {
                if !self.state.catalog.contains(&app.name, image)? {
                    return Err(ProvisionError::InvalidImage {
                        app: app.name.clone(),
                        image: image.clone(),
                    });
                }
                image.clone()
            }
            None => {
                let version = self.state.catalog.next_version(&app.name)?;
                let tag = app_image_name(
                    self.state.config.registry.as_deref(),
                    &self.state.config.image_owner,
                    &app.name,
                    version,
                );
                opts.writer
                    .write_line(&format!("---- Building image {tag} ----"));
                self.builder.build(&app, &opts, &tag).await?;
                tag
            }
        };

        let current = self.state.store.list_by_app(&app.name, None, None)?;
        let data = self.state.catalog.load_custom_data(&image)?;
        let table = data.process_table();
        let processes: Vec<String> = if table.is_empty() {
            vec!["web".to_string()]
        } else {
            table.names().map(str::to_string).collect()
        };
        let mut to_add = BTreeMap::new();
        for process in processes {
            let existing = current
                .iter()
                .filter(|c| c.process_name == process)
                .count() as u32;
            to_add.insert(process, existing.max(1));
        }

        let args = ChangeUnitsArgs {
            app: app.clone(),
            to_add,
            to_remove: current,
            image: image.clone(),
            build_image: Some(image.clone()),
            to_host: None,
            avoid_hosts: Vec::new(),
            writer: opts.writer.clone(),
        };
        engine::change_units(&self.state, args).await?;

        self.state.catalog.append_tag(&app.name, &image)?;
        self.prune_old_images(&app.name).await;
        info!(app = %app.name, image = %image, "deploy finished");
        Ok(image)
    }

    /// Evict catalog entries beyond the configured history size and clean
    /// the evicted tags off nodes and the registry. The catalog only
    /// evicts tags no container runs anymore.
    async fn prune_old_images(&self, app: &str) {
        let keep = self.state.config.image_history_size.max(1);
        let evicted = match self.state.catalog.prune_history(app, keep) {
            Ok(evicted) => evicted,
            Err(err) => {
                warn!(app, error = %err, "could not prune image history");
                return;
            }
        };
        for tag in &evicted {
            self.state.cluster.remove_image_from_nodes(tag).await;
            if let Some(registry) = &self.state.registry {
                if let Err(err) = registry.remove_image(tag).await {
                    warn!(tag, error = %err, "registry cleanup failed during pruning");
                }
            }
            debug!(app, tag, "evicted old image");
        }
    }

    /// Add `quantity` units of a process.
    pub async fn add_units(
        &self,
        app: &AppRef,
        quantity: u32,
        process: &str,
        writer: Arc<dyn ProgressSink>,
    ) -> Result<Vec<Unit>, ProvisionError> {
        if quantity == 0 {
            return Err(EngineError::NoUnitsToAdd.into());
        }
        if app.deploys == 0 {
            return Err(EngineError::NoDeploysYet.into());
        }
        let image = self.state.catalog.current_tag(&app.name)?;
        let process = self.resolve_process(&image, process)?;

        let mut to_add = BTreeMap::new();
        to_add.insert(process, quantity);
        let args = ChangeUnitsArgs {
            app: app.clone(),
            to_add,
            to_remove: Vec::new(),
            image,
            build_image: None,
            to_host: None,
            avoid_hosts: Vec::new(),
            writer,
        };
        let created = engine::add_containers(&self.state, args).await?;
        Ok(created.iter().map(Container::as_unit).collect())
    }

    /// Remove `quantity` units of a process.
    ///
    /// Failure to take a route away aborts the whole operation with every
    /// container, route and bind intact.
    pub async fn remove_units(
        &self,
        app: &AppRef,
        quantity: u32,
        process: &str,
        writer: Arc<dyn ProgressSink>,
    ) -> Result<(), ProvisionError> {
        if quantity == 0 {
            return Err(EngineError::NoUnitsToRemove.into());
        }
        let process = if process.is_empty() {
            None
        } else {
            let image = self.state.catalog.current_tag(&app.name)?;
            Some(self.resolve_process(&image, process)?)
        };
        let candidates =
            self.state
                .store
                .list_by_app(&app.name, process.as_deref(), None)?;
        if quantity as usize > candidates.len() {
            return Err(EngineError::TooManyToRemove {
                requested: quantity,
                process: process.unwrap_or_default(),
                available: candidates.len(),
            }
            .into());
        }
        let victims = select_for_removal(candidates, quantity as usize);

        let args = ChangeUnitsArgs {
            app: app.clone(),
            to_add: BTreeMap::new(),
            to_remove: victims,
            image: String::new(),
            build_image: None,
            to_host: None,
            avoid_hosts: Vec::new(),
            writer,
        };
        engine::remove_containers(&self.state, args).await?;
        Ok(())
    }

    /// Rolling replacement of the selected containers. An empty process
    /// selects all of them.
    pub async fn restart(
        &self,
        app: &AppRef,
        process: &str,
        writer: Arc<dyn ProgressSink>,
    ) -> Result<(), ProvisionError> {
        let image = self.state.catalog.current_tag(&app.name)?;
        let process_filter = if process.is_empty() {
            None
        } else {
            Some(self.resolve_process(&image, process)?)
        };
        let current =
            self.state
                .store
                .list_by_app(&app.name, process_filter.as_deref(), None)?;
        if current.is_empty() {
            return Ok(());
        }
        let mut to_add: BTreeMap<String, u32> = BTreeMap::new();
        for container in &current {
            *to_add.entry(container.process_name.clone()).or_insert(0) += 1;
        }
        let args = ChangeUnitsArgs {
            app: app.clone(),
            to_add,
            to_remove: current,
            image,
            build_image: None,
            to_host: None,
            avoid_hosts: Vec::new(),
            writer,
        };
        engine::change_units(&self.state, args).await?;
        Ok(())
    }

    /// Start the application's containers (optionally one process).
    pub async fn start(&self, app: &AppRef, process: &str) -> Result<(), ProvisionError> {
        let process_filter = non_empty(process);
        let containers = self
            .state
            .store
            .list_by_app(&app.name, process_filter, None)?;
        for container in containers {
            if container.status == Status::Started {
                continue;
            }
            self.state.cluster.start_container(&container.id).await?;
            self.refresh_network(&container.id).await;
            self.state.store.set_status(&container.id, Status::Starting)?;
        }
        Ok(())
    }

    /// Stop the application's containers (optionally one process).
    /// Containers already stopped are skipped.
    pub async fn stop(&self, app: &AppRef, process: &str) -> Result<(), ProvisionError> {
        let process_filter = non_empty(process);
        let containers = self
            .state
            .store
            .list_by_app(&app.name, process_filter, None)?;
        for container in containers {
            if container.status == Status::Stopped {
                debug!(container_id = %container.id, "container already stopped, skipping");
                continue;
            }
            self.state.cluster.stop_container(&container.id).await?;
            self.state.store.set_status(&container.id, Status::Stopped)?;
        }
        Ok(())
    }

    /// Report a unit's status, as observed by an external caller.
    ///
    /// When an app name is supplied it must match the unit's owner. A
    /// transition to Started refreshes the unit's network identity from
    /// inspection.
    pub async fn set_unit_status(
        &self,
        unit_name: &str,
        app_name: &str,
        status: Status,
    ) -> Result<(), ProvisionError> {
        let container = match self.state.store.get(unit_name) {
            Ok(container) => container,
            Err(StoreError::NotFound(_)) => return Err(ProvisionError::UnitNotFound),
            Err(err) => return Err(err.into()),
        };
        if !app_name.is_empty() && container.app_name != app_name {
            return Err(ProvisionError::WrongApp);
        }
        if status == Status::Started {
            self.refresh_network(&container.id).await;
        }
        self.state.store.set_status(&container.id, status)?;
        Ok(())
    }

    /// Called by the running container at boot.
    ///
    /// A Building container deposits its payload into the image being
    /// built and stays Building; the deploy path promotes it later. Any
    /// other container is promoted to Started with a fresh ip.
    pub async fn register_unit(
        &self,
        unit_name: &str,
        payload: serde_json::Value,
    ) -> Result<(), ProvisionError> {
        let container = match self.state.store.get(unit_name) {
            Ok(container) => container,
            Err(StoreError::NotFound(_)) => return Err(ProvisionError::UnitNotFound),
            Err(err) => return Err(err.into()),
        };
        if container.status == Status::Building {
            if let Some(build_image) = &container.build_image {
                self.state
                    .catalog
                    .register_runtime_data(build_image, &payload)?;
            }
            return Ok(());
        }
        self.refresh_network(&container.id).await;
        self.state.store.set_status(&container.id, Status::Started)?;
        Ok(())
    }

    /// Unit descriptors for an application.
    pub fn units(&self, app: &AppRef) -> Result<Vec<Unit>, ProvisionError> {
        let containers = self.state.store.list_by_app(&app.name, None, None)?;
        Ok(containers.iter().map(Container::as_unit).collect())
    }

    /// Public address of the application.
    pub async fn addr(&self, app: &AppRef) -> Result<String, ProvisionError> {
        Ok(self.state.router()?.addr(&app.name).await?)
    }

    /// Attach an interactive shell to one container of the application.
    pub async fn shell(
        &self,
        opts: &ShellOptions,
        conn: &mut dyn Duplex,
    ) -> Result<(), ProvisionError> {
        let container = match &opts.unit {
            Some(unit) => {
                let container = match self.state.store.get(unit) {
                    Ok(container) => container,
                    Err(StoreError::NotFound(_)) => return Err(ProvisionError::UnitNotFound),
                    Err(err) => return Err(err.into()),
                };
                if container.app_name != opts.app {
                    return Err(ProvisionError::UnitNotFound);
                }
                container
            }
            None => self
                .first_available(&opts.app)?
                .ok_or(ProvisionError::NoUnits)?,
        };
        let tty = TtyGeometry {
            width: opts.width,
            height: opts.height,
            term: opts.term.clone(),
        };
        self.state
            .cluster
            .attach_shell(&container.id, &tty, conn)
            .await?;
        Ok(())
    }

    /// Run a command in every non-building container of the application.
    pub async fn execute_command<O, E>(
        &self,
        stdout: &mut O,
        stderr: &mut E,
        app: &AppRef,
        cmd: &[String],
    ) -> Result<(), ProvisionError>
    where
        O: std::io::Write + Send,
        E: std::io::Write + Send,
    {
        let containers = self.runnable_containers(&app.name)?;
        if containers.is_empty() {
            return Err(ProvisionError::NoUnits);
        }
        for container in containers {
            self.execute_in(&container, cmd, stdout, stderr).await?;
        }
        Ok(())
    }

    /// Run a command in the first eligible container only.
    pub async fn execute_command_once<O, E>(
        &self,
        stdout: &mut O,
        stderr: &mut E,
        app: &AppRef,
        cmd: &[String],
    ) -> Result<(), ProvisionError>
    where
        O: std::io::Write + Send,
        E: std::io::Write + Send,
    {
        let containers = self.runnable_containers(&app.name)?;
        let Some(container) = containers
            .iter()
            .find(|c| c.status == Status::Started)
            .or_else(|| containers.first())
        else {
            return Err(ProvisionError::NoUnits);
        };
        self.execute_in(container, cmd, stdout, stderr).await
    }

    /// Exchange two applications behind the router.
    pub async fn swap(&self, app1: &AppRef, app2: &AppRef) -> Result<(), ProvisionError> {
        self.state.router()?.swap(&app1.name, &app2.name).await?;
        Ok(())
    }

    pub async fn set_cname(&self, cname: &str, app: &AppRef) -> Result<(), ProvisionError> {
        self.state.router()?.set_cname(cname, &app.name).await?;
        Ok(())
    }

    pub async fn unset_cname(&self, cname: &str, app: &AppRef) -> Result<(), ProvisionError> {
        self.state.router()?.unset_cname(cname, &app.name).await?;
        Ok(())
    }

    // Helpers ---------------------------------------------------------------

    fn resolve_process(&self, image: &str, process: &str) -> Result<String, ProvisionError> {
        let data = self.state.catalog.load_custom_data(image)?;
        let table = data.process_table();
        if table.is_empty() {
            // Images without a process table run a single web process.
            return Ok(if process.is_empty() {
                "web".to_string()
            } else if process == "web" {
                process.to_string()
            } else {
                return Err(EngineError::InvalidProcess(
                    slipway_procfile::ProcfileError::NotDeclared(process.to_string()),
                )
                .into());
            });
        }
        let resolved = table
            .resolve(process)
            .map_err(EngineError::InvalidProcess)?;
        Ok(resolved.to_string())
    }

    fn runnable_containers(&self, app: &str) -> Result<Vec<Container>, ProvisionError> {
        let containers = self.state.store.list_by_app(app, None, None)?;
        Ok(containers
            .into_iter()
            .filter(|c| c.status != Status::Building)
            .collect())
    }

    fn first_available(&self, app: &str) -> Result<Option<Container>, ProvisionError> {
        let containers = self.runnable_containers(app)?;
        Ok(containers
            .iter()
            .find(|c| c.available())
            .or_else(|| containers.first())
            .cloned())
    }

    async fn execute_in<O, E>(
        &self,
        container: &Container,
        cmd: &[String],
        stdout: &mut O,
        stderr: &mut E,
    ) -> Result<(), ProvisionError>
    where
        O: std::io::Write + Send,
        E: std::io::Write + Send,
    {
        let result = self.state.cluster.exec(&container.id, cmd).await?;
        let _ = stdout.write_all(&result.stdout);
        let _ = stderr.write_all(&result.stderr);
        if result.exit_code != 0 {
            return Err(ProvisionError::CommandFailed {
                unit: container.id.clone(),
                exit_code: result.exit_code,
            });
        }
        Ok(())
    }

    /// Refresh a container's recorded ip and host port from inspection.
    /// Inspection failures, and reports missing either field, leave the
    /// record unchanged: a Started record must never carry a half-empty
    /// network identity.
    async fn refresh_network(&self, container_id: &str) {
        match self.state.cluster.inspect_container(container_id).await {
            Ok(inspect) => {
                if inspect.ip.is_empty() || inspect.host_port.is_empty() {
                    debug!(container_id, "inspection reported incomplete network identity");
                    return;
                }
                if let Err(err) =
                    self.state
                        .store
                        .set_network(container_id, &inspect.ip, &inspect.host_port)
                {
                    warn!(container_id, error = %err, "could not refresh network identity");
                }
            }
            Err(err) => {
                warn!(container_id, error = %err, "inspection failed while refreshing network");
            }
        }
    }
}

/// Order containers for removal: most-loaded host first, then oldest.
fn select_for_removal(candidates: Vec<Container>, quantity: usize) -> Vec<Container> {
    let mut host_load: BTreeMap<String, usize> = BTreeMap::new();
    for container in &candidates {
        *host_load.entry(container.host_addr.clone()).or_insert(0) += 1;
    }
    let mut indexed: Vec<(usize, Container)> = candidates.into_iter().enumerate().collect();
    indexed.sort_by(|(ia, a), (ib, b)| {
        let la = host_load.get(&a.host_addr).copied().unwrap_or(0);
        let lb = host_load.get(&b.host_addr).copied().unwrap_or(0);
        lb.cmp(&la).then(ia.cmp(ib))
    });
    indexed
        .into_iter()
        .take(quantity)
        .map(|(_, container)| container)
        .collect()
}

fn non_empty(process: &str) -> Option<&str> {
    if process.is_empty() {
        None
    } else {
        Some(process)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn container(id: &str, host: &str) -> Container {
        Container {
            id: id.to_string(),
            app_name: "impius".to_string(),
            process_name: "web".to_string(),
            platform: "python".to_string(),
            image: "slipway/app-impius:v1".to_string(),
            build_image: None,
            host_addr: host.to_string(),
            host_port: String::new(),
            ip: String::new(),
            status: Status::Started,
            status_updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_select_for_removal_prefers_loaded_hosts() {
        let candidates = vec![
            container("c1", "url0"),
            container("c2", "url1"),
            container("c3", "url0"),
        ];
        let victims = select_for_removal(candidates, 2);
        let ids: Vec<&str> = victims.iter().map(|c| c.id.as_str()).collect();
        // url0 carries two of the three candidates, so its containers go
        // first, oldest first.
        assert_eq!(ids, vec!["c1", "c3"]);
    }

    #[test]
    fn test_select_for_removal_is_stable_on_equal_load() {
        let candidates = vec![container("c1", "url0"), container("c2", "url1")];
        let victims = select_for_removal(candidates, 1);
        assert_eq!(victims[0].id, "c1");
    }
}
