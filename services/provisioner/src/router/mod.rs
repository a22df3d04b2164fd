//! Router facade.
//!
//! External L7 routers hide behind the `Router` trait; implementations are
//! looked up by name in a registry so deployments can mix router kinds.
//! The contract the core relies on:
//!
//! - `add_route` is idempotent: a duplicate url yields `RouteExists`,
//!   which callers treat as non-fatal.
//! - `swap` exchanges the route sets of two backends atomically from the
//!   caller's observable point of view, and a swapped backend refuses
//!   removal until re-swapped.
//! - cnames must live outside the router's own managed domain.

pub mod web;

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use thiserror::Error;

/// Errors from router operations.
#[derive(Debug, Error)]
pub enum RouterError {
    #[error("backend already exists")]
    BackendExists,

    #[error("backend not found")]
    BackendNotFound,

    #[error("route already exists")]
    RouteExists,

    #[error("route not found")]
    RouteNotFound,

    /// The backend is currently swapped with another; swap back first.
    #[error("backend is swapped with another, cannot remove")]
    BackendSwapped,

    #[error("cname already exists")]
    CNameExists,

    #[error("cname not found")]
    CNameNotFound,

    /// The cname lives inside the router's managed domain.
    #[error("cname is not allowed in the router managed domain")]
    CNameNotAllowed,

    #[error("unknown router: {0}")]
    UnknownRouter(String),

    #[error("router request failed: {0}")]
    Request(String),
}

/// One external router.
#[async_trait]
pub trait Router: Send + Sync {
    fn name(&self) -> &str;

    async fn add_backend(&self, app: &str) -> Result<(), RouterError>;

    async fn remove_backend(&self, app: &str) -> Result<(), RouterError>;

    async fn add_route(&self, app: &str, address: &str) -> Result<(), RouterError>;

    async fn remove_route(&self, app: &str, address: &str) -> Result<(), RouterError>;

    async fn set_cname(&self, cname: &str, app: &str) -> Result<(), RouterError>;

    async fn unset_cname(&self, cname: &str, app: &str) -> Result<(), RouterError>;

    /// Public address of the backend.
    async fn addr(&self, app: &str) -> Result<String, RouterError>;

    async fn routes(&self, app: &str) -> Result<Vec<String>, RouterError>;

    async fn swap(&self, app1: &str, app2: &str) -> Result<(), RouterError>;
}

/// Whether a cname may be attached by users: it must be a real name and
/// must not sit inside the router's managed domain.
pub fn valid_cname(cname: &str, domain: &str) -> bool {
    if cname.is_empty() {
        return false;
    }
    !(cname == domain || cname.ends_with(&format!(".{domain}")))
}

/// Exchange the route sets of two backends.
///
/// Adds each backend's routes to the other before removing them from the
/// original, so neither backend is ever empty while the swap runs.
pub async fn exchange_routes(
    router: &dyn Router,
    app1: &str,
    app2: &str,
) -> Result<(), RouterError> {
    let routes1 = router.routes(app1).await?;
    let routes2 = router.routes(app2).await?;
    for route in &routes1 {
        match router.add_route(app2, route).await {
            Ok(()) | Err(RouterError::RouteExists) => {}
            Err(err) => return Err(err),
        }
    }
    for route in &routes2 {
        match router.add_route(app1, route).await {
            Ok(()) | Err(RouterError::RouteExists) => {}
            Err(err) => return Err(err),
        }
    }
    for route in &routes1 {
        router.remove_route(app1, route).await?;
    }
    for route in &routes2 {
        router.remove_route(app2, route).await?;
    }
    Ok(())
}

/// Name-keyed registry of configured routers.
#[derive(Default)]
pub struct RouterRegistry {
    routers: RwLock<HashMap<String, Arc<dyn Router>>>,
}

impl RouterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, router: Arc<dyn Router>) {
        if let Ok(mut routers) = self.routers.write() {
            routers.insert(router.name().to_string(), router);
        }
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn Router>, RouterError> {
        self.routers
            .read()
            .ok()
            .and_then(|routers| routers.get(name).cloned())
            .ok_or_else(|| RouterError::UnknownRouter(name.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_cname_rejects_managed_domain() {
        assert!(valid_cname("shop.example.org", "slipway.io"));
        assert!(!valid_cname("myapp.slipway.io", "slipway.io"));
        assert!(!valid_cname("slipway.io", "slipway.io"));
        assert!(!valid_cname("", "slipway.io"));
        // Similar suffix without the dot boundary is fine.
        assert!(valid_cname("notslipway.io", "slipway.io"));
    }

    #[tokio::test]
    async fn test_registry_lookup() {
        use crate::testing::FakeRouter;

        let registry = RouterRegistry::new();
        registry.register(Arc::new(FakeRouter::new()));
        assert!(registry.get("fake").is_ok());
        assert!(matches!(
            registry.get("galeb"),
            Err(RouterError::UnknownRouter(_))
        ));
    }

    #[tokio::test]
    async fn test_exchange_routes_moves_both_sets() {
        use crate::testing::FakeRouter;

        let router = FakeRouter::new();
        router.add_backend("blue").await.unwrap();
        router.add_backend("green").await.unwrap();
        router.add_route("blue", "http://10.0.0.1:1").await.unwrap();
        router.add_route("blue", "http://10.0.0.2:2").await.unwrap();
        router.add_route("green", "http://10.0.0.9:9").await.unwrap();

        exchange_routes(&router, "blue", "green").await.unwrap();

        let mut blue = router.routes("blue").await.unwrap();
        blue.sort();
        assert_eq!(blue, vec!["http://10.0.0.9:9"]);
        let mut green = router.routes("green").await.unwrap();
        green.sort();
        assert_eq!(green, vec!["http://10.0.0.1:1", "http://10.0.0.2:2"]);
    }
}
