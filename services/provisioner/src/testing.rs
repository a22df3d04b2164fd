//! Test doubles for the provisioning core.
//!
//! Exported from the crate so integration tests (and downstream crates)
//! can exercise the full provisioner without real hosts or routers:
//! a scriptable host client, an asserting router, a recording binding
//! sink and a canned image builder.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;

use crate::cluster::host::{
    ContainerInspect, CreateContainerOptions, Duplex, ExecResult, HostClient, HostError,
    TtyGeometry,
};
use crate::cluster::{Cluster, Node};
use crate::config::Config;
use crate::container::{AppRef, Unit};
use crate::image::ImageCustomData;
use crate::provisioner::{BuildError, DeployOptions, ImageBuilder, Provisioner};
use crate::router::{exchange_routes, Router, RouterError, RouterRegistry};
use crate::state::{BindingError, BindingEvents, CoreState, ProgressSink};
use crate::storage::Storage;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// =============================================================================
// Fake host client
// =============================================================================

#[derive(Debug, Clone)]
struct FakeContainer {
    host: String,
    image: String,
    running: bool,
    ip: String,
    host_port: String,
}

#[derive(Default)]
struct FakeHostInner {
    counter: u64,
    containers: HashMap<String, FakeContainer>,
    images: HashMap<String, HashSet<String>>,
    unreachable_hosts: HashSet<String>,
    pull_network_failures: HashSet<String>,
    pull_api_failures: HashSet<String>,
    fail_create_on_call: Option<u64>,
    create_calls: u64,
    fail_start_on_call: Option<u64>,
    start_calls: u64,
    exec_log: Vec<(String, Vec<String>)>,
    exec_exit_code: i32,
    inspect_overrides: HashMap<String, ContainerInspect>,
}

/// Scriptable in-memory host client.
pub struct FakeHostClient {
    inner: Mutex<FakeHostInner>,
}

impl Default for FakeHostClient {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeHostClient {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(FakeHostInner::default()),
        }
    }

    /// Every operation against this host fails with a network error.
    pub fn make_unreachable(&self, host: &str) {
        lock(&self.inner).unreachable_hosts.insert(host.to_string());
    }

    pub fn make_reachable(&self, host: &str) {
        lock(&self.inner).unreachable_hosts.remove(host);
    }

    /// Fail the n-th container creation (1-based) with an API error.
    pub fn fail_create_on_call(&self, n: u64) {
        lock(&self.inner).fail_create_on_call = Some(n);
    }

    /// Fail the n-th container start (1-based) with an API error.
    pub fn fail_start_on_call(&self, n: u64) {
        lock(&self.inner).fail_start_on_call = Some(n);
    }

    /// Image pulls on this host fail; `network` picks the error class.
    pub fn fail_pull(&self, host: &str, network: bool) {
        let mut inner = lock(&self.inner);
        if network {
            inner.pull_network_failures.insert(host.to_string());
        } else {
            inner.pull_api_failures.insert(host.to_string());
        }
    }

    /// Let pulls on this host succeed again.
    pub fn clear_pull_failures(&self, host: &str) {
        let mut inner = lock(&self.inner);
        inner.pull_network_failures.remove(host);
        inner.pull_api_failures.remove(host);
    }

    pub fn set_exec_exit_code(&self, code: i32) {
        lock(&self.inner).exec_exit_code = code;
    }

    /// Override what inspection reports for a container.
    pub fn set_inspect(&self, id: &str, inspect: ContainerInspect) {
        lock(&self.inner)
            .inspect_overrides
            .insert(id.to_string(), inspect);
    }

    /// Make an image present on a node without a pull (platform bases).
    pub fn seed_node_image(&self, host: &str, image: &str) {
        lock(&self.inner)
            .images
            .entry(host.to_string())
            .or_default()
            .insert(image.to_string());
    }

    /// Register a container that exists host-side without going through
    /// create (for drift scenarios).
    pub fn seed_container(&self, id: &str, host: &str, image: &str) {
        lock(&self.inner).containers.insert(
            id.to_string(),
            FakeContainer {
                host: host.to_string(),
                image: image.to_string(),
                running: true,
                ip: "172.17.0.1".to_string(),
                host_port: "49100".to_string(),
            },
        );
    }

    pub fn container_count(&self) -> usize {
        lock(&self.inner).containers.len()
    }

    pub fn containers_on(&self, host: &str) -> Vec<String> {
        lock(&self.inner)
            .containers
            .iter()
            .filter(|(_, c)| c.host == host)
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub fn has_container(&self, id: &str) -> bool {
        lock(&self.inner).containers.contains_key(id)
    }

    /// Image a host-side container was created from.
    pub fn image_of(&self, id: &str) -> Option<String> {
        lock(&self.inner)
            .containers
            .get(id)
            .map(|c| c.image.clone())
    }

    pub fn has_image(&self, host: &str, image: &str) -> bool {
        lock(&self.inner)
            .images
            .get(host)
            .map(|set| set.contains(image))
            .unwrap_or(false)
    }

    /// Images present somewhere on the cluster, sorted.
    pub fn all_images(&self) -> Vec<String> {
        let inner = lock(&self.inner);
        let mut images: Vec<String> = inner
            .images
            .values()
            .flat_map(|set| set.iter().cloned())
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        images.sort();
        images
    }

    pub fn exec_log(&self) -> Vec<(String, Vec<String>)> {
        lock(&self.inner).exec_log.clone()
    }

    fn reject_unreachable(&self, host: &str) -> Result<(), HostError> {
        if lock(&self.inner).unreachable_hosts.contains(host) {
            return Err(HostError::Network {
                host: host.to_string(),
                reason: "connection refused".to_string(),
            });
        }
        Ok(())
    }

    fn api_error(host: &str, body: &str) -> HostError {
        HostError::Api {
            host: host.to_string(),
            status: 500,
            body: body.to_string(),
        }
    }
}

#[async_trait]
impl HostClient for FakeHostClient {
    async fn create_container(
        &self,
        host: &str,
        opts: &CreateContainerOptions,
    ) -> Result<String, HostError> {
        self.reject_unreachable(host)?;
        let mut inner = lock(&self.inner);
        inner.create_calls += 1;
        if inner.fail_create_on_call == Some(inner.create_calls) {
            return Err(Self::api_error(host, "cannot create container"));
        }
        inner.counter += 1;
        let id = format!("{:012x}", inner.counter);
        inner.containers.insert(
            id.clone(),
            FakeContainer {
                host: host.to_string(),
                image: opts.image.clone(),
                running: false,
                ip: String::new(),
                host_port: String::new(),
            },
        );
        Ok(id)
    }

    async fn start_container(&self, host: &str, id: &str) -> Result<(), HostError> {
        self.reject_unreachable(host)?;
        let mut inner = lock(&self.inner);
        inner.start_calls += 1;
        if inner.fail_start_on_call == Some(inner.start_calls) {
            return Err(Self::api_error(host, "cannot start container"));
        }
        let counter = inner.counter;
        let Some(container) = inner.containers.get_mut(id) else {
            return Err(HostError::ContainerNotFound(id.to_string()));
        };
        container.running = true;
        if container.ip.is_empty() {
            container.ip = format!("172.17.0.{}", counter % 250 + 2);
            container.host_port = format!("{}", 49100 + counter % 500);
        }
        Ok(())
    }

    async fn stop_container(&self, host: &str, id: &str) -> Result<(), HostError> {
        self.reject_unreachable(host)?;
        let mut inner = lock(&self.inner);
        if let Some(container) = inner.containers.get_mut(id) {
            container.running = false;
        }
        Ok(())
    }

    async fn remove_container(&self, host: &str, id: &str) -> Result<(), HostError> {
        self.reject_unreachable(host)?;
        lock(&self.inner).containers.remove(id);
        Ok(())
    }

    async fn inspect_container(
        &self,
        host: &str,
        id: &str,
    ) -> Result<ContainerInspect, HostError> {
        self.reject_unreachable(host)?;
        let inner = lock(&self.inner);
        if let Some(inspect) = inner.inspect_overrides.get(id) {
            return Ok(inspect.clone());
        }
        let Some(container) = inner.containers.get(id) else {
            return Err(HostError::ContainerNotFound(id.to_string()));
        };
        Ok(ContainerInspect {
            id: id.to_string(),
            running: container.running,
            ip: container.ip.clone(),
            host_port: container.host_port.clone(),
        })
    }

    async fn pull_image(&self, host: &str, image: &str) -> Result<(), HostError> {
        self.reject_unreachable(host)?;
        let mut inner = lock(&self.inner);
        if inner.pull_network_failures.contains(host) {
            return Err(HostError::Network {
                host: host.to_string(),
                reason: "dial tcp: i/o timeout".to_string(),
            });
        }
        if inner.pull_api_failures.contains(host) {
            return Err(HostError::Api {
                host: host.to_string(),
                status: 404,
                body: "image not found upstream".to_string(),
            });
        }
        inner
            .images
            .entry(host.to_string())
            .or_default()
            .insert(image.to_string());
        Ok(())
    }

    async fn remove_image(&self, host: &str, image: &str) -> Result<(), HostError> {
        self.reject_unreachable(host)?;
        let mut inner = lock(&self.inner);
        if let Some(images) = inner.images.get_mut(host) {
            images.remove(image);
        }
        Ok(())
    }

    async fn exec(&self, host: &str, id: &str, cmd: &[String]) -> Result<ExecResult, HostError> {
        self.reject_unreachable(host)?;
        let mut inner = lock(&self.inner);
        if !inner.containers.contains_key(id) {
            return Err(HostError::ContainerNotFound(id.to_string()));
        }
        inner.exec_log.push((id.to_string(), cmd.to_vec()));
        Ok(ExecResult {
            exit_code: inner.exec_exit_code,
            stdout: format!("$ {}\n", cmd.join(" ")).into_bytes(),
            stderr: Vec::new(),
        })
    }

    async fn attach_shell(
        &self,
        host: &str,
        id: &str,
        _tty: &TtyGeometry,
        conn: &mut dyn Duplex,
    ) -> Result<(), HostError> {
        self.reject_unreachable(host)?;
        {
            let inner = lock(&self.inner);
            if !inner.containers.contains_key(id) {
                return Err(HostError::ContainerNotFound(id.to_string()));
            }
        }
        let banner = format!("shell attached to {id}\n");
        conn.write_all(banner.as_bytes())
            .await
            .map_err(|e| HostError::Protocol {
                host: host.to_string(),
                reason: e.to_string(),
            })?;
        Ok(())
    }
}

// =============================================================================
// Fake router
// =============================================================================

#[derive(Default)]
struct FakeRouterInner {
    backends: HashMap<String, Vec<String>>,
    cnames: HashMap<String, Vec<String>>,
    swapped: HashMap<String, String>,
    fail_for: HashSet<String>,
}

/// In-memory router with forced-failure switches.
pub struct FakeRouter {
    domain: String,
    inner: Mutex<FakeRouterInner>,
}

impl Default for FakeRouter {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeRouter {
    pub fn new() -> Self {
        Self {
            domain: "fakerouter.io".to_string(),
            inner: Mutex::new(FakeRouterInner::default()),
        }
    }

    /// Force add/remove operations on this exact address to fail.
    pub fn fail_for_address(&self, address: &str) {
        lock(&self.inner).fail_for.insert(address.to_string());
    }

    pub fn has_backend(&self, app: &str) -> bool {
        lock(&self.inner).backends.contains_key(app)
    }

    pub fn has_route(&self, app: &str, address: &str) -> bool {
        lock(&self.inner)
            .backends
            .get(app)
            .map(|routes| routes.iter().any(|r| r == address))
            .unwrap_or(false)
    }

    pub fn route_count(&self, app: &str) -> usize {
        lock(&self.inner)
            .backends
            .get(app)
            .map(Vec::len)
            .unwrap_or(0)
    }

    pub fn has_cname(&self, app: &str, cname: &str) -> bool {
        lock(&self.inner)
            .cnames
            .get(app)
            .map(|cnames| cnames.iter().any(|c| c == cname))
            .unwrap_or(false)
    }
}

#[async_trait]
impl Router for FakeRouter {
    fn name(&self) -> &str {
        "fake"
    }

    async fn add_backend(&self, app: &str) -> Result<(), RouterError> {
        let mut inner = lock(&self.inner);
        if inner.backends.contains_key(app) {
            return Err(RouterError::BackendExists);
        }
        inner.backends.insert(app.to_string(), Vec::new());
        Ok(())
    }

    async fn remove_backend(&self, app: &str) -> Result<(), RouterError> {
        let mut inner = lock(&self.inner);
        if inner.swapped.contains_key(app) {
            return Err(RouterError::BackendSwapped);
        }
        if inner.backends.remove(app).is_none() {
            return Err(RouterError::BackendNotFound);
        }
        inner.cnames.remove(app);
        Ok(())
    }

    async fn add_route(&self, app: &str, address: &str) -> Result<(), RouterError> {
        let mut inner = lock(&self.inner);
        if inner.fail_for.contains(address) {
            return Err(RouterError::Request("Forced failure".to_string()));
        }
        let routes = inner
            .backends
            .get_mut(app)
            .ok_or(RouterError::BackendNotFound)?;
        if routes.iter().any(|r| r == address) {
            return Err(RouterError::RouteExists);
        }
        routes.push(address.to_string());
        Ok(())
    }

    async fn remove_route(&self, app: &str, address: &str) -> Result<(), RouterError> {
        let mut inner = lock(&self.inner);
        if inner.fail_for.contains(address) {
            return Err(RouterError::Request("Forced failure".to_string()));
        }
        let routes = inner
            .backends
            .get_mut(app)
            .ok_or(RouterError::BackendNotFound)?;
        let before = routes.len();
        routes.retain(|r| r != address);
        if routes.len() == before {
            return Err(RouterError::RouteNotFound);
        }
        Ok(())
    }

    async fn set_cname(&self, cname: &str, app: &str) -> Result<(), RouterError> {
        if !crate::router::valid_cname(cname, &self.domain) {
            return Err(RouterError::CNameNotAllowed);
        }
        let mut inner = lock(&self.inner);
        if !inner.backends.contains_key(app) {
            return Err(RouterError::BackendNotFound);
        }
        let cnames = inner.cnames.entry(app.to_string()).or_default();
        if cnames.iter().any(|c| c == cname) {
            return Err(RouterError::CNameExists);
        }
        cnames.push(cname.to_string());
        Ok(())
    }

    async fn unset_cname(&self, cname: &str, app: &str) -> Result<(), RouterError> {
        let mut inner = lock(&self.inner);
        let cnames = inner
            .cnames
            .get_mut(app)
            .ok_or(RouterError::CNameNotFound)?;
        let before = cnames.len();
        cnames.retain(|c| c != cname);
        if cnames.len() == before {
            return Err(RouterError::CNameNotFound);
        }
        Ok(())
    }

    async fn addr(&self, app: &str) -> Result<String, RouterError> {
        let inner = lock(&self.inner);
        if !inner.backends.contains_key(app) {
            return Err(RouterError::BackendNotFound);
        }
        Ok(format!("{app}.{}", self.domain))
    }

    async fn routes(&self, app: &str) -> Result<Vec<String>, RouterError> {
        let inner = lock(&self.inner);
        inner
            .backends
            .get(app)
            .cloned()
            .ok_or(RouterError::BackendNotFound)
    }

    async fn swap(&self, app1: &str, app2: &str) -> Result<(), RouterError> {
        exchange_routes(self, app1, app2).await?;
        let mut inner = lock(&self.inner);
        let already = inner.swapped.get(app1).map(String::as_str) == Some(app2);
        if already {
            inner.swapped.remove(app1);
            inner.swapped.remove(app2);
        } else {
            inner.swapped.insert(app1.to_string(), app2.to_string());
            inner.swapped.insert(app2.to_string(), app1.to_string());
        }
        Ok(())
    }
}

// =============================================================================
// Recording binding sink
// =============================================================================

/// Binding sink that records bound unit names.
#[derive(Default)]
pub struct RecordingBinding {
    bound: Mutex<HashSet<String>>,
}

impl RecordingBinding {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn has_bind(&self, unit_name: &str) -> bool {
        lock(&self.bound).contains(unit_name)
    }

    pub fn bound_count(&self) -> usize {
        lock(&self.bound).len()
    }
}

#[async_trait]
impl BindingEvents for RecordingBinding {
    async fn bind_unit(&self, unit: &Unit) -> Result<(), BindingError> {
        lock(&self.bound).insert(unit.name.clone());
        Ok(())
    }

    async fn unbind_unit(&self, unit: &Unit) -> Result<(), BindingError> {
        lock(&self.bound).remove(&unit.name);
        Ok(())
    }
}

// =============================================================================
// Progress buffer
// =============================================================================

/// Progress sink collecting lines, with a close switch for cancellation
/// scenarios.
#[derive(Default)]
pub struct BufferProgress {
    lines: Mutex<Vec<String>>,
    closed: AtomicBool,
}

impl BufferProgress {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contents(&self) -> String {
        lock(&self.lines).join("\n")
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

impl ProgressSink for BufferProgress {
    fn write_line(&self, line: &str) {
        lock(&self.lines).push(line.to_string());
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

// =============================================================================
// Canned image builder
// =============================================================================

/// Builder that "builds" by saving canned custom data for the tag.
pub struct FakeBuilder {
    custom_data: ImageCustomData,
    storage: Storage,
}

impl FakeBuilder {
    pub fn with_procfile(storage: &Storage, procfile: &str) -> Self {
        Self {
            custom_data: ImageCustomData::from_procfile(procfile),
            storage: storage.clone(),
        }
    }
}

#[async_trait]
impl ImageBuilder for FakeBuilder {
    async fn build(
        &self,
        _app: &AppRef,
        _opts: &DeployOptions,
        tag: &str,
    ) -> Result<(), BuildError> {
        self.storage
            .images()
            .save_custom_data(tag, &self.custom_data)
            .map_err(|e| BuildError(e.to_string()))
    }
}

// =============================================================================
// Wired-up test environment
// =============================================================================

/// A fully wired core over fakes, mirroring production construction.
pub struct TestEnv {
    pub state: Arc<CoreState>,
    pub storage: Storage,
    pub host: Arc<FakeHostClient>,
    pub router: Arc<FakeRouter>,
    pub binding: Arc<RecordingBinding>,
}

impl TestEnv {
    pub fn new() -> Self {
        Self::with_config(Config {
            default_router: "fake".to_string(),
            ..Config::default()
        })
    }

    pub fn with_config(mut config: Config) -> Self {
        config.default_router = "fake".to_string();
        let storage = match Storage::open_in_memory() {
            Ok(storage) => storage,
            Err(err) => panic!("in-memory storage: {err}"),
        };
        let host = Arc::new(FakeHostClient::new());
        let router = Arc::new(FakeRouter::new());
        let binding = Arc::new(RecordingBinding::new());
        let routers = Arc::new(RouterRegistry::new());
        routers.register(router.clone());
        let cluster = Arc::new(Cluster::new(host.clone()));
        let state = Arc::new(CoreState {
            config,
            store: storage.containers(),
            catalog: storage.images(),
            healing: storage.healing(),
            cluster,
            routers,
            binding: binding.clone(),
            registry: None,
        });
        Self {
            state,
            storage,
            host,
            router,
            binding,
        }
    }

    pub async fn register_node(&self, address: &str, pool: &str) {
        let node = Node::new(address).with_pool(pool);
        if let Err(err) = self.state.cluster.register_node(node).await {
            panic!("register node: {err}");
        }
    }

    /// Provisioner over this environment with a canned Procfile builder.
    pub fn provisioner(&self, procfile: &str) -> Provisioner {
        let builder = Arc::new(FakeBuilder::with_procfile(&self.storage, procfile));
        Provisioner::new(self.state.clone(), builder)
    }

    /// Seed a deployed image so scale operations have history to work on.
    pub fn seed_image(&self, app: &str, tag: &str, procfile: &str) {
        let catalog = self.storage.images();
        if let Err(err) = catalog.append_tag(app, tag) {
            panic!("seed image: {err}");
        }
        let data = ImageCustomData::from_procfile(procfile);
        if let Err(err) = catalog.save_custom_data(tag, &data) {
            panic!("seed image data: {err}");
        }
    }
}

impl Default for TestEnv {
    fn default() -> Self {
        Self::new()
    }
}

/// Desired process counts helper for engine arguments.
pub fn to_add(pairs: &[(&str, u32)]) -> BTreeMap<String, u32> {
    pairs
        .iter()
        .map(|(process, quantity)| (process.to_string(), *quantity))
        .collect()
}
