//! The unit-change engine.
//!
//! Every operation that alters the set of running containers for an
//! application funnels through here: deploys, scale up/down, restarts and
//! healing all describe their intent as a `ChangeUnitsArgs` delta and the
//! engine drives it through reversible pipelines.
//!
//! The add path provisions images, creates and starts containers, adds
//! routes, runs lifecycle hooks and binds units. The remove path takes
//! routes and binds away before touching containers; if that first stage
//! fails mid-way the routes and binds are restored, because a failed
//! scale-down must never reduce reachability.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use slipway_pipeline::{Action, ActionError, Pipeline, PipelineError};
use slipway_procfile::{ProcessTable, ProcfileError};
use thiserror::Error;
use tracing::{debug, warn};

use crate::cluster::host::CreateContainerOptions;
use crate::cluster::ClusterError;
use crate::container::store::StoreError;
use crate::container::{AppRef, Container, Status};
use crate::image::{CatalogError, RestartHooks};
use crate::router::RouterError;
use crate::scheduler::{ScheduleError, Scheduler, SegregatedScheduler};
use crate::state::{CoreState, ProgressSink};

/// Errors from unit-change operations.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Cannot add 0 units")]
    NoUnitsToAdd,

    #[error("cannot remove zero units")]
    NoUnitsToRemove,

    #[error("cannot remove {requested} units from process {process:?}, only {available} available")]
    TooManyToRemove {
        requested: u32,
        process: String,
        available: usize,
    },

    #[error("process error: {0}")]
    InvalidProcess(#[from] ProcfileError),

    #[error("New units can only be added after the first deployment")]
    NoDeploysYet,

    #[error(transparent)]
    Catalog(#[from] CatalogError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Schedule(#[from] ScheduleError),

    #[error(transparent)]
    Cluster(#[from] ClusterError),

    #[error(transparent)]
    Router(#[from] RouterError),

    #[error(transparent)]
    Pipeline(#[from] PipelineError),
}

/// Desired delta for one unit-change operation.
pub struct ChangeUnitsArgs {
    pub app: AppRef,
    /// Process name -> how many new containers to create.
    pub to_add: BTreeMap<String, u32>,
    /// Containers to tear down once the new ones are live.
    pub to_remove: Vec<Container>,
    /// Image the new containers run.
    pub image: String,
    /// Image tag being produced, when the change is part of a deploy.
    pub build_image: Option<String>,
    /// Pin every new container to this host instead of scheduling.
    pub to_host: Option<String>,
    /// Hosts scheduling must not pick (used by healing).
    pub avoid_hosts: Vec<String>,
    pub writer: Arc<dyn ProgressSink>,
}

impl ChangeUnitsArgs {
    pub fn added_quantity(&self) -> u32 {
        self.to_add.values().sum()
    }
}

/// Create and wire the new containers described by `args`.
///
/// Returns the created containers in Starting state, routed and bound.
/// On any failure everything created so far is removed again.
pub async fn add_containers(
    state: &Arc<CoreState>,
    args: ChangeUnitsArgs,
) -> Result<Vec<Container>, EngineError> {
    if args.added_quantity() == 0 {
        return Err(EngineError::NoUnitsToAdd);
    }
    let data = state.catalog.load_custom_data(&args.image)?;
    let table = effective_process_table(&data.process_table());
    for process in args.to_add.keys() {
        table.command(process)?;
    }
    let hooks = data.restart_hooks();

    let mut ctx = ChangeCtx::new(state.clone(), args, table, hooks);
    let pipeline: Pipeline<ChangeCtx> = Pipeline::new(vec![
        Box::new(ProvisionImages),
        Box::new(CreateContainers),
        Box::new(AddRoutes),
        Box::new(RunAfterHooks),
        Box::new(BindUnits),
    ]);
    pipeline.execute(&mut ctx).await?;
    Ok(ctx.created)
}

/// Tear down the containers listed in `args.to_remove`.
///
/// Routes and binds go first; a mid-way failure there restores what was
/// taken and leaves every container untouched.
pub async fn remove_containers(
    state: &Arc<CoreState>,
    args: ChangeUnitsArgs,
) -> Result<(), EngineError> {
    if args.to_remove.is_empty() {
        return Err(EngineError::NoUnitsToRemove);
    }
    let mut ctx = ChangeCtx::new(
        state.clone(),
        args,
        ProcessTable::default(),
        RestartHooks::default(),
    );
    let pipeline: Pipeline<ChangeCtx> = Pipeline::new(vec![
        Box::new(RemoveRoutesAndUnbind),
        Box::new(RemoveOldContainers),
    ]);
    pipeline.execute(&mut ctx).await?;
    Ok(())
}

/// Replace units: bring the new set up, then take the old set down.
///
/// The scheduler ignores the old containers while placing the new ones,
/// so a rolling replacement does not double-count load.
pub async fn change_units(
    state: &Arc<CoreState>,
    mut args: ChangeUnitsArgs,
) -> Result<Vec<Container>, EngineError> {
    let to_remove = std::mem::take(&mut args.to_remove);
    let add_args = ChangeUnitsArgs {
        to_remove: to_remove.clone(),
        ..args_clone_for_add(&args)
    };
    let created = add_containers(state, add_args).await?;
    if !to_remove.is_empty() {
        let remove_args = ChangeUnitsArgs {
            to_add: BTreeMap::new(),
            to_remove,
            ..args_clone_for_add(&args)
        };
        remove_containers(state, remove_args).await?;
    }
    Ok(created)
}

fn args_clone_for_add(args: &ChangeUnitsArgs) -> ChangeUnitsArgs {
    ChangeUnitsArgs {
        app: args.app.clone(),
        to_add: args.to_add.clone(),
        to_remove: Vec::new(),
        image: args.image.clone(),
        build_image: args.build_image.clone(),
        to_host: args.to_host.clone(),
        avoid_hosts: args.avoid_hosts.clone(),
        writer: args.writer.clone(),
    }
}

/// An empty process table means the image carries its own entry point;
/// such images run a single web process with the image default command.
fn effective_process_table(table: &ProcessTable) -> ProcessTable {
    if table.is_empty() {
        let mut map = BTreeMap::new();
        map.insert("web".to_string(), String::new());
        ProcessTable::from_map(map)
    } else {
        table.clone()
    }
}

// =============================================================================
// Pipeline context and actions
// =============================================================================

struct ChangeCtx {
    state: Arc<CoreState>,
    app: AppRef,
    to_add: BTreeMap<String, u32>,
    to_remove: Vec<Container>,
    image: String,
    build_image: Option<String>,
    to_host: Option<String>,
    avoid_hosts: Vec<String>,
    writer: Arc<dyn ProgressSink>,
    table: ProcessTable,
    hooks: RestartHooks,

    created: Vec<Container>,
    routes_added: Vec<String>,
    bound: Vec<Container>,
    routes_removed: Vec<Container>,
    unbound: Vec<Container>,
}

impl ChangeCtx {
    fn new(
        state: Arc<CoreState>,
        args: ChangeUnitsArgs,
        table: ProcessTable,
        hooks: RestartHooks,
    ) -> Self {
        Self {
            state,
            app: args.app,
            to_add: args.to_add,
            to_remove: args.to_remove,
            image: args.image,
            build_image: args.build_image,
            to_host: args.to_host,
            avoid_hosts: args.avoid_hosts,
            writer: args.writer,
            table,
            hooks,
            created: Vec::new(),
            routes_added: Vec::new(),
            bound: Vec::new(),
            routes_removed: Vec::new(),
            unbound: Vec::new(),
        }
    }

    /// Stage boundary cancellation check: a closed sink aborts the
    /// operation at the start of the next stage.
    fn check_canceled(&self) -> Result<(), ActionError> {
        if self.writer.is_closed() {
            return Err("operation canceled by client".into());
        }
        Ok(())
    }

    /// Nodes the scheduler may consider for this operation.
    async fn candidate_nodes(&self) -> Vec<crate::cluster::Node> {
        self.state
            .cluster
            .nodes_for_pool(&self.app.pool)
            .await
            .into_iter()
            .filter(|node| !self.avoid_hosts.contains(&node.address))
            .collect()
    }

    fn container_env(&self) -> Vec<String> {
        let port = self
            .state
            .config
            .exposed_port
            .split('/')
            .next()
            .unwrap_or("8888");
        vec![format!("PORT={port}")]
    }

    /// Remove one created container from the host, the binding map and
    /// the record store. Used by rollback, so it must tolerate repeats.
    async fn destroy_created(&self, container: &Container) {
        if let Err(err) = self.state.cluster.remove_container(&container.id).await {
            warn!(container_id = %container.id, error = %err, "failed to remove container during rollback");
        }
        self.state.cluster.unbind(&container.id).await;
        if let Err(err) = self.state.store.remove(&container.id) {
            warn!(container_id = %container.id, error = %err, "failed to remove container record during rollback");
        }
    }

    async fn destroy_all_created(&mut self) {
        let created = std::mem::take(&mut self.created);
        for container in &created {
            self.destroy_created(container).await;
        }
    }

    async fn remove_added_routes(&mut self) {
        let router = match self.state.router() {
            Ok(router) => router,
            Err(err) => {
                warn!(error = %err, "router unavailable during rollback");
                return;
            }
        };
        let routes = std::mem::take(&mut self.routes_added);
        for address in &routes {
            match router.remove_route(&self.app.name, address).await {
                Ok(()) | Err(RouterError::RouteNotFound) => {}
                Err(err) => {
                    warn!(address, error = %err, "failed to remove route during rollback")
                }
            }
        }
    }

    async fn unbind_bound(&mut self) {
        let bound = std::mem::take(&mut self.bound);
        for container in &bound {
            if let Err(err) = self.state.binding.unbind_unit(&container.as_unit()).await {
                warn!(container_id = %container.id, error = %err, "failed to unbind unit during rollback");
            }
        }
    }
}

/// Ensure the image is present on every node the operation may use.
struct ProvisionImages;

#[async_trait]
impl Action<ChangeCtx> for ProvisionImages {
    fn name(&self) -> &str {
        "provision-images"
    }

    async fn forward(&self, ctx: &mut ChangeCtx) -> Result<(), ActionError> {
        ctx.check_canceled()?;
        let hosts: Vec<String> = match &ctx.to_host {
            Some(host) => vec![host.clone()],
            None => ctx
                .candidate_nodes()
                .await
                .into_iter()
                .map(|node| node.address)
                .collect(),
        };
        ctx.writer
            .write_line(&format!("---- Pulling image {} to nodes ----", ctx.image));
        for host in hosts {
            ctx.state.cluster.pull_image(&host, &ctx.image).await?;
        }
        Ok(())
    }

    async fn backward(&self, _ctx: &mut ChangeCtx) -> Result<(), ActionError> {
        // Pulled images are inert; nothing to undo.
        Ok(())
    }
}

/// Create, start and register the new containers.
struct CreateContainers;

impl CreateContainers {
    async fn create_one(
        ctx: &mut ChangeCtx,
        process: &str,
        scheduler: &SegregatedScheduler,
        nodes: &[crate::cluster::Node],
    ) -> Result<(), ActionError> {
        let host = match &ctx.to_host {
            Some(host) => host.clone(),
            None => scheduler.schedule(nodes, &ctx.app, process)?,
        };
        let command = ctx.table.command(process)?.to_string();
        let cmd = if command.is_empty() {
            Vec::new()
        } else {
            vec!["/bin/sh".to_string(), "-lc".to_string(), command]
        };
        let opts = CreateContainerOptions {
            image: ctx.image.clone(),
            cmd,
            env: ctx.container_env(),
            exposed_port: ctx.state.config.exposed_port.clone(),
        };
        let id = ctx.state.cluster.create_container(&host, &opts).await?;

        let mut container = Container {
            id: id.clone(),
            app_name: ctx.app.name.clone(),
            process_name: process.to_string(),
            platform: ctx.app.platform.clone(),
            image: ctx.image.clone(),
            build_image: ctx.build_image.clone(),
            host_addr: crate::cluster::url_to_host(&host),
            host_port: String::new(),
            ip: String::new(),
            status: Status::Building,
            status_updated_at: Utc::now(),
        };
        ctx.state.store.insert(&container)?;
        // Track it from the moment the record exists so rollback can see it.
        ctx.created.push(container.clone());

        ctx.state.cluster.start_container(&id).await?;
        let inspect = ctx.state.cluster.inspect_container(&id).await?;
        container.ip = inspect.ip;
        container.host_port = inspect.host_port;
        container.status = Status::Starting;
        container.status_updated_at = Utc::now();
        ctx.state.store.update(&container)?;

        for hook in &ctx.hooks.before {
            run_hook(ctx, &container, hook).await?;
        }

        ctx.writer
            .write_line(&format!(" ---> Started unit {id} [{process}]"));
        if let Some(last) = ctx.created.last_mut() {
            *last = container;
        }
        Ok(())
    }
}

#[async_trait]
impl Action<ChangeCtx> for CreateContainers {
    fn name(&self) -> &str {
        "create-containers"
    }

    async fn forward(&self, ctx: &mut ChangeCtx) -> Result<(), ActionError> {
        ctx.check_canceled()?;
        let total = ctx.to_add.values().sum::<u32>();
        ctx.writer
            .write_line(&format!("---- Starting {total} new units ----"));

        let mut scheduler = SegregatedScheduler::new(ctx.state.store.clone());
        scheduler.ignore_containers(ctx.to_remove.iter().map(|c| c.id.clone()));
        let nodes = ctx.candidate_nodes().await;

        let plan: Vec<(String, u32)> = ctx
            .to_add
            .iter()
            .map(|(process, quantity)| (process.clone(), *quantity))
            .collect();
        for (process, quantity) in plan {
            for _ in 0..quantity {
                Self::create_one(ctx, &process, &scheduler, &nodes).await?;
            }
        }
        Ok(())
    }

    async fn backward(&self, ctx: &mut ChangeCtx) -> Result<(), ActionError> {
        ctx.destroy_all_created().await;
        Ok(())
    }

    async fn on_error(&self, ctx: &mut ChangeCtx, _err: &ActionError) {
        // Partial progress of this very action: remove whatever got made.
        ctx.destroy_all_created().await;
    }
}

/// Add one route per freshly started container.
struct AddRoutes;

#[async_trait]
impl Action<ChangeCtx> for AddRoutes {
    fn name(&self) -> &str {
        "add-routes"
    }

    async fn forward(&self, ctx: &mut ChangeCtx) -> Result<(), ActionError> {
        ctx.check_canceled()?;
        let router = ctx.state.router()?;
        let addresses: Vec<String> = ctx.created.iter().map(Container::address).collect();
        for address in addresses {
            match router.add_route(&ctx.app.name, &address).await {
                Ok(()) => ctx.routes_added.push(address),
                // Duplicate routes are fine; a retried operation may have
                // added them already.
                Err(RouterError::RouteExists) => {}
                Err(err) => return Err(err.into()),
            }
        }
        Ok(())
    }

    async fn backward(&self, ctx: &mut ChangeCtx) -> Result<(), ActionError> {
        ctx.remove_added_routes().await;
        Ok(())
    }

    async fn on_error(&self, ctx: &mut ChangeCtx, _err: &ActionError) {
        ctx.remove_added_routes().await;
    }
}

/// Run `restart.after` hooks inside every new container.
struct RunAfterHooks;

#[async_trait]
impl Action<ChangeCtx> for RunAfterHooks {
    fn name(&self) -> &str {
        "run-after-hooks"
    }

    async fn forward(&self, ctx: &mut ChangeCtx) -> Result<(), ActionError> {
        ctx.check_canceled()?;
        if ctx.hooks.after.is_empty() {
            return Ok(());
        }
        let hooks = ctx.hooks.after.clone();
        let created = ctx.created.clone();
        for hook in &hooks {
            for container in &created {
                run_hook(ctx, container, hook).await?;
            }
        }
        Ok(())
    }

    async fn backward(&self, _ctx: &mut ChangeCtx) -> Result<(), ActionError> {
        Ok(())
    }
}

/// Emit bind events for the new units.
struct BindUnits;

#[async_trait]
impl Action<ChangeCtx> for BindUnits {
    fn name(&self) -> &str {
        "bind-units"
    }

    async fn forward(&self, ctx: &mut ChangeCtx) -> Result<(), ActionError> {
        ctx.check_canceled()?;
        let created = ctx.created.clone();
        for container in created {
            ctx.state.binding.bind_unit(&container.as_unit()).await?;
            ctx.bound.push(container);
        }
        Ok(())
    }

    async fn backward(&self, ctx: &mut ChangeCtx) -> Result<(), ActionError> {
        ctx.unbind_bound().await;
        Ok(())
    }

    async fn on_error(&self, ctx: &mut ChangeCtx, _err: &ActionError) {
        ctx.unbind_bound().await;
    }
}

/// Take routes and binds away from the containers being removed.
///
/// A failure mid-way restores every route and bind taken so far and the
/// operation reports that nothing was removed.
struct RemoveRoutesAndUnbind;

impl RemoveRoutesAndUnbind {
    async fn restore(ctx: &mut ChangeCtx) {
        let router = match ctx.state.router() {
            Ok(router) => router,
            Err(err) => {
                warn!(error = %err, "router unavailable while restoring routes");
                return;
            }
        };
        let removed = std::mem::take(&mut ctx.routes_removed);
        for container in &removed {
            match router.add_route(&ctx.app.name, &container.address()).await {
                Ok(()) | Err(RouterError::RouteExists) => {}
                Err(err) => {
                    warn!(container_id = %container.id, error = %err, "failed to restore route")
                }
            }
        }
        let unbound = std::mem::take(&mut ctx.unbound);
        for container in &unbound {
            if let Err(err) = ctx.state.binding.bind_unit(&container.as_unit()).await {
                warn!(container_id = %container.id, error = %err, "failed to restore bind");
            }
        }
    }

    async fn take_down(ctx: &mut ChangeCtx) -> Result<(), ActionError> {
        let router = ctx.state.router()?;
        let targets = ctx.to_remove.clone();
        for container in targets {
            match router
                .remove_route(&ctx.app.name, &container.address())
                .await
            {
                Ok(()) => ctx.routes_removed.push(container.clone()),
                Err(RouterError::RouteNotFound) => {}
                Err(err) => return Err(err.into()),
            }
            ctx.state
                .binding
                .unbind_unit(&container.as_unit())
                .await?;
            ctx.unbound.push(container);
        }
        Ok(())
    }
}

#[async_trait]
impl Action<ChangeCtx> for RemoveRoutesAndUnbind {
    fn name(&self) -> &str {
        "remove-routes"
    }

    async fn forward(&self, ctx: &mut ChangeCtx) -> Result<(), ActionError> {
        ctx.check_canceled()?;
        if let Err(err) = Self::take_down(ctx).await {
            return Err(format!("error removing routes, units weren't removed: {err}").into());
        }
        Ok(())
    }

    async fn backward(&self, ctx: &mut ChangeCtx) -> Result<(), ActionError> {
        Self::restore(ctx).await;
        Ok(())
    }

    async fn on_error(&self, ctx: &mut ChangeCtx, _err: &ActionError) {
        Self::restore(ctx).await;
    }
}

/// Stop and remove the old containers and their records.
///
/// By this point the containers are unrouted and unbound; removal
/// failures are logged, not rolled back.
struct RemoveOldContainers;

#[async_trait]
impl Action<ChangeCtx> for RemoveOldContainers {
    fn name(&self) -> &str {
        "remove-old-containers"
    }

    async fn forward(&self, ctx: &mut ChangeCtx) -> Result<(), ActionError> {
        let targets = ctx.to_remove.clone();
        for container in &targets {
            if let Err(err) = ctx.state.cluster.stop_container(&container.id).await {
                debug!(container_id = %container.id, error = %err, "stop before removal failed");
            }
            if let Err(err) = ctx.state.cluster.remove_container(&container.id).await {
                warn!(container_id = %container.id, error = %err, "failed to remove container");
            }
            ctx.state.cluster.unbind(&container.id).await;
            if let Err(err) = ctx.state.store.remove(&container.id) {
                warn!(container_id = %container.id, error = %err, "failed to remove container record");
            }
            ctx.writer
                .write_line(&format!(" ---> Removed old unit {}", container.id));
        }
        Ok(())
    }

    async fn backward(&self, _ctx: &mut ChangeCtx) -> Result<(), ActionError> {
        Ok(())
    }
}

async fn run_hook(
    ctx: &ChangeCtx,
    container: &Container,
    hook: &str,
) -> Result<(), ActionError> {
    ctx.writer
        .write_line(&format!(" ---- Running hook in unit {}: {hook}", container.id));
    let cmd = vec!["/bin/sh".to_string(), "-lc".to_string(), hook.to_string()];
    let result = ctx.state.cluster.exec(&container.id, &cmd).await?;
    if !result.stdout.is_empty() {
        ctx.writer
            .write_line(String::from_utf8_lossy(&result.stdout).trim_end());
    }
    if result.exit_code != 0 {
        return Err(format!(
            "hook {hook:?} failed in unit {} with exit code {}",
            container.id, result.exit_code
        )
        .into());
    }
    Ok(())
}
