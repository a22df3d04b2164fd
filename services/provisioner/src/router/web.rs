//! HTTP router adapter.
//!
//! Drives an external L7 router through its management API: one backend
//! pool plus one virtual host and root rule per application, one pool
//! member per route, one extra virtual host per cname. Creation
//! parameters (environment, farm type, plan, project, balance policy,
//! rule type) come from configuration and are passed through verbatim.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, warn};
use url::Url;

use super::{exchange_routes, valid_cname, Router, RouterError};

/// Connection settings for the web router.
#[derive(Debug, Clone, Default)]
pub struct WebRouterConfig {
    pub api_url: String,
    pub username: String,
    pub password: String,
    /// Managed domain; backend addresses are `<app>.<domain>`.
    pub domain: String,
    pub environment: String,
    pub farm_type: String,
    pub plan: String,
    pub project: String,
    pub load_balance_policy: String,
    pub rule_type: String,
}

#[derive(Default)]
struct BackendData {
    /// Route url -> remote pool-member id.
    routes: HashMap<String, String>,
    cnames: Vec<String>,
    /// App this backend is currently swapped with, if any.
    swapped_with: Option<String>,
}

/// Router implementation backed by an HTTP management API.
pub struct WebRouter {
    config: WebRouterConfig,
    http: reqwest::Client,
    backends: Arc<RwLock<HashMap<String, BackendData>>>,
}

impl WebRouter {
    pub const NAME: &'static str = "web";

    pub fn new(config: WebRouterConfig) -> Self {
        Self {
            config,
            http: reqwest::Client::new(),
            backends: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    fn pool_name(&self, app: &str) -> String {
        format!("slipway_{app}")
    }

    fn rule_name(&self, app: &str) -> String {
        format!("rule_{app}")
    }

    fn virtual_host_name(&self, app: &str) -> String {
        format!("{}.{}", app, self.config.domain)
    }

    async fn post<T: Serialize>(&self, path: &str, body: &T) -> Result<CreatedEntity, RouterError> {
        let url = format!("{}/{}", self.config.api_url.trim_end_matches('/'), path);
        let response = self
            .http
            .post(&url)
            .basic_auth(&self.config.username, Some(&self.config.password))
            .json(body)
            .send()
            .await
            .map_err(|e| RouterError::Request(e.to_string()))?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(RouterError::Request(format!(
                "POST {path} returned {status}: {body}"
            )));
        }
        response
            .json()
            .await
            .map_err(|e| RouterError::Request(e.to_string()))
    }

    async fn delete(&self, path: &str) -> Result<(), RouterError> {
        let url = format!("{}/{}", self.config.api_url.trim_end_matches('/'), path);
        let response = self
            .http
            .delete(&url)
            .basic_auth(&self.config.username, Some(&self.config.password))
            .send()
            .await
            .map_err(|e| RouterError::Request(e.to_string()))?;
        if !response.status().is_success() && response.status().as_u16() != 404 {
            return Err(RouterError::Request(format!(
                "DELETE {path} returned {}",
                response.status()
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl Router for WebRouter {
    fn name(&self) -> &str {
        Self::NAME
    }

    async fn add_backend(&self, app: &str) -> Result<(), RouterError> {
        {
            let backends = self.backends.read().await;
            if backends.contains_key(app) {
                return Err(RouterError::BackendExists);
            }
        }
        let pool = BackendPoolParams {
            name: self.pool_name(app),
            environment: &self.config.environment,
            farm_type: &self.config.farm_type,
            plan: &self.config.plan,
            project: &self.config.project,
            load_balance_policy: &self.config.load_balance_policy,
        };
        self.post("backendpool", &pool).await?;
        let virtual_host = VirtualHostParams {
            name: self.virtual_host_name(app),
            environment: &self.config.environment,
            farm_type: &self.config.farm_type,
            plan: &self.config.plan,
            project: &self.config.project,
        };
        self.post("virtualhost", &virtual_host).await?;
        let rule = RuleParams {
            name: self.rule_name(app),
            rule_type: &self.config.rule_type,
            backend_pool: self.pool_name(app),
            virtual_host: self.virtual_host_name(app),
        };
        self.post("rule", &rule).await?;

        let mut backends = self.backends.write().await;
        backends.insert(app.to_string(), BackendData::default());
        debug!(app, "added router backend");
        Ok(())
    }

    async fn remove_backend(&self, app: &str) -> Result<(), RouterError> {
        {
            let backends = self.backends.read().await;
            let data = backends.get(app).ok_or(RouterError::BackendNotFound)?;
            if data.swapped_with.is_some() {
                return Err(RouterError::BackendSwapped);
            }
        }
        let cnames = {
            let backends = self.backends.read().await;
            backends
                .get(app)
                .map(|d| d.cnames.clone())
                .unwrap_or_default()
        };
        for cname in cnames {
            self.delete(&format!("virtualhost/{cname}")).await?;
        }
        self.delete(&format!("rule/{}", self.rule_name(app))).await?;
        self.delete(&format!("virtualhost/{}", self.virtual_host_name(app)))
            .await?;
        self.delete(&format!("backendpool/{}", self.pool_name(app)))
            .await?;

        let mut backends = self.backends.write().await;
        backends.remove(app);
        debug!(app, "removed router backend");
        Ok(())
    }

    async fn add_route(&self, app: &str, address: &str) -> Result<(), RouterError> {
        {
            let backends = self.backends.read().await;
            let data = backends.get(app).ok_or(RouterError::BackendNotFound)?;
            if data.routes.contains_key(address) {
                return Err(RouterError::RouteExists);
            }
        }
        let parsed = Url::parse(address)
            .map_err(|e| RouterError::Request(format!("invalid route url {address:?}: {e}")))?;
        let member = PoolMemberParams {
            ip: parsed.host_str().unwrap_or_default().to_string(),
            port: parsed.port().unwrap_or(80),
            backend_pool: self.pool_name(app),
        };
        let created = self.post("backend", &member).await?;

        let mut backends = self.backends.write().await;
        let data = backends.get_mut(app).ok_or(RouterError::BackendNotFound)?;
        data.routes.insert(address.to_string(), created.id);
        Ok(())
    }

    async fn remove_route(&self, app: &str, address: &str) -> Result<(), RouterError> {
        let member_id = {
            let backends = self.backends.read().await;
            let data = backends.get(app).ok_or(RouterError::BackendNotFound)?;
            data.routes
                .get(address)
                .cloned()
                .ok_or(RouterError::RouteNotFound)?
        };
        self.delete(&format!("backend/{member_id}")).await?;
        let mut backends = self.backends.write().await;
        if let Some(data) = backends.get_mut(app) {
            data.routes.remove(address);
        }
        Ok(())
    }

    async fn set_cname(&self, cname: &str, app: &str) -> Result<(), RouterError> {
        if !valid_cname(cname, &self.config.domain) {
            return Err(RouterError::CNameNotAllowed);
        }
        {
            let backends = self.backends.read().await;
            let data = backends.get(app).ok_or(RouterError::BackendNotFound)?;
            if data.cnames.iter().any(|c| c == cname) {
                return Err(RouterError::CNameExists);
            }
        }
        let virtual_host = VirtualHostParams {
            name: cname.to_string(),
            environment: &self.config.environment,
            farm_type: &self.config.farm_type,
            plan: &self.config.plan,
            project: &self.config.project,
        };
        self.post("virtualhost", &virtual_host).await?;
        let rule = RuleParams {
            name: format!("rule_{cname}"),
            rule_type: &self.config.rule_type,
            backend_pool: self.pool_name(app),
            virtual_host: cname.to_string(),
        };
        self.post("rule", &rule).await?;

        let mut backends = self.backends.write().await;
        if let Some(data) = backends.get_mut(app) {
            data.cnames.push(cname.to_string());
        }
        Ok(())
    }

    async fn unset_cname(&self, cname: &str, app: &str) -> Result<(), RouterError> {
        {
            let backends = self.backends.read().await;
            let data = backends.get(app).ok_or(RouterError::BackendNotFound)?;
            if !data.cnames.iter().any(|c| c == cname) {
                return Err(RouterError::CNameNotFound);
            }
        }
        self.delete(&format!("rule/rule_{cname}")).await?;
        self.delete(&format!("virtualhost/{cname}")).await?;
        let mut backends = self.backends.write().await;
        if let Some(data) = backends.get_mut(app) {
            data.cnames.retain(|c| c != cname);
        }
        Ok(())
    }

    async fn addr(&self, app: &str) -> Result<String, RouterError> {
        let backends = self.backends.read().await;
        if !backends.contains_key(app) {
            return Err(RouterError::BackendNotFound);
        }
        Ok(self.virtual_host_name(app))
    }

    async fn routes(&self, app: &str) -> Result<Vec<String>, RouterError> {
        let backends = self.backends.read().await;
        let data = backends.get(app).ok_or(RouterError::BackendNotFound)?;
        Ok(data.routes.keys().cloned().collect())
    }

    async fn swap(&self, app1: &str, app2: &str) -> Result<(), RouterError> {
        exchange_routes(self, app1, app2).await?;
        let mut backends = self.backends.write().await;
        let swapping_back =
            backends.get(app1).and_then(|d| d.swapped_with.as_deref()) == Some(app2);
        let (mark1, mark2) = if swapping_back {
            (None, None)
        } else {
            (Some(app2.to_string()), Some(app1.to_string()))
        };
        if let Some(data) = backends.get_mut(app1) {
            data.swapped_with = mark1;
        }
        if let Some(data) = backends.get_mut(app2) {
            data.swapped_with = mark2;
        }
        if swapping_back {
            warn!(app1, app2, "backends swapped back");
        }
        Ok(())
    }
}

#[derive(Serialize)]
struct BackendPoolParams<'a> {
    name: String,
    environment: &'a str,
    #[serde(rename = "farmtype")]
    farm_type: &'a str,
    plan: &'a str,
    project: &'a str,
    #[serde(rename = "loadbalancepolicy")]
    load_balance_policy: &'a str,
}

#[derive(Serialize)]
struct VirtualHostParams<'a> {
    name: String,
    environment: &'a str,
    #[serde(rename = "farmtype")]
    farm_type: &'a str,
    plan: &'a str,
    project: &'a str,
}

#[derive(Serialize)]
struct RuleParams<'a> {
    name: String,
    #[serde(rename = "ruletype")]
    rule_type: &'a str,
    #[serde(rename = "backendpool")]
    backend_pool: String,
    #[serde(rename = "virtualhost")]
    virtual_host: String,
}

#[derive(Serialize)]
struct PoolMemberParams {
    ip: String,
    port: u16,
    #[serde(rename = "backendpool")]
    backend_pool: String,
}

#[derive(Deserialize)]
struct CreatedEntity {
    #[serde(default)]
    id: String,
}
