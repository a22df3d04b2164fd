//! Image catalog and registry cleanup.
//!
//! The catalog tracks, per application, the ordered list of deployed image
//! tags plus per-image custom data: the process table, lifecycle hooks and
//! whatever payload the running unit deposited at registration time.
//!
//! Tag formats:
//! - application images: `<registry?>/<owner>/app-<appName>:v<N>`
//! - platform bases: `<registry?>/<owner>/<platform>:latest`
//!
//! `v<N>` increments monotonically per application, surviving history
//! pruning.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use slipway_procfile::ProcessTable;
use thiserror::Error;
use tracing::{debug, warn};

use crate::storage::lock;

/// Errors from catalog operations.
#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// The application has no deployed images.
    #[error("no images available for app {0}")]
    NoImages(String),

    #[error("corrupt custom data for image {image}: {reason}")]
    Corrupt { image: String, reason: String },
}

/// Lifecycle hooks attached to an image.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Hooks {
    #[serde(default)]
    pub restart: RestartHooks,
}

/// Commands run inside new containers around a restart or deploy.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RestartHooks {
    /// Run in each new container before its route is added.
    #[serde(default)]
    pub before: Vec<String>,
    /// Run after routes are live.
    #[serde(default)]
    pub after: Vec<String>,
}

/// Custom data carried by an image tag.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ImageCustomData {
    /// Raw Procfile body, as deposited by the builder.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub procfile: Option<String>,

    /// Explicit process table; takes precedence over `procfile`.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub processes: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hooks: Option<Hooks>,

    /// Arbitrary registration payload from the running unit.
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl ImageCustomData {
    pub fn from_procfile(body: &str) -> Self {
        Self {
            procfile: Some(body.to_string()),
            ..Self::default()
        }
    }

    /// The authoritative process table for this image.
    pub fn process_table(&self) -> ProcessTable {
        if !self.processes.is_empty() {
            return ProcessTable::from_map(self.processes.clone());
        }
        match &self.procfile {
            Some(body) => ProcessTable::parse(body),
            None => ProcessTable::default(),
        }
    }

    pub fn restart_hooks(&self) -> RestartHooks {
        self.hooks.clone().unwrap_or_default().restart
    }
}

/// Repository over the per-app image history and per-image custom data.
#[derive(Clone)]
pub struct ImageCatalog {
    conn: Arc<Mutex<Connection>>,
}

impl ImageCatalog {
    pub(crate) fn new(conn: Arc<Mutex<Connection>>) -> Self {
        Self { conn }
    }

    /// Append a tag to an application's deploy history.
    ///
    /// Re-deploying a tag that is already in the history moves it to the
    /// end instead of duplicating it.
    pub fn append_tag(&self, app: &str, tag: &str) -> Result<(), CatalogError> {
        let conn = lock(&self.conn);
        let next: i64 = conn.query_row(
            "SELECT COALESCE(MAX(position), 0) + 1 FROM app_images WHERE app_name = ?1",
            params![app],
            |row| row.get(0),
        )?;
        conn.execute(
            r#"
            INSERT INTO app_images (app_name, tag, position) VALUES (?1, ?2, ?3)
            ON CONFLICT(app_name, tag) DO UPDATE SET position = excluded.position
            "#,
            params![app, tag, next],
        )?;
        Ok(())
    }

    /// Newest deployed tag for an application.
    pub fn current_tag(&self, app: &str) -> Result<String, CatalogError> {
        lock(&self.conn)
            .query_row(
                "SELECT tag FROM app_images WHERE app_name = ?1 ORDER BY position DESC LIMIT 1",
                params![app],
                |row| row.get(0),
            )
            .optional()?
            .ok_or_else(|| CatalogError::NoImages(app.to_string()))
    }

    /// Deploy history, oldest first.
    pub fn list_tags(&self, app: &str) -> Result<Vec<String>, CatalogError> {
        let conn = lock(&self.conn);
        let mut stmt = conn
            .prepare("SELECT tag FROM app_images WHERE app_name = ?1 ORDER BY position ASC")?;
        let rows = stmt.query_map(params![app], |row| row.get(0))?;
        let mut tags = Vec::new();
        for tag in rows {
            tags.push(tag?);
        }
        Ok(tags)
    }

    pub fn contains(&self, app: &str, tag: &str) -> Result<bool, CatalogError> {
        let found: Option<i64> = lock(&self.conn)
            .query_row(
                "SELECT position FROM app_images WHERE app_name = ?1 AND tag = ?2",
                params![app, tag],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    /// Allocate the next image version for an application.
    ///
    /// Versions are monotonic per app and never reused, even after the
    /// history is pruned. This allocation is the linearization point for
    /// concurrent deploys of the same application.
    pub fn next_version(&self, app: &str) -> Result<u64, CatalogError> {
        let conn = lock(&self.conn);
        conn.execute(
            r#"
            INSERT INTO app_image_versions (app_name, next_version) VALUES (?1, 2)
            ON CONFLICT(app_name) DO UPDATE SET next_version = next_version + 1
            "#,
            params![app],
        )?;
        let version: i64 = conn.query_row(
            "SELECT next_version - 1 FROM app_image_versions WHERE app_name = ?1",
            params![app],
            |row| row.get(0),
        )?;
        Ok(version as u64)
    }

    pub fn save_custom_data(&self, image: &str, data: &ImageCustomData) -> Result<(), CatalogError> {
        let body = serde_json::to_string(data).map_err(|e| CatalogError::Corrupt {
            image: image.to_string(),
            reason: e.to_string(),
        })?;
        lock(&self.conn).execute(
            r#"
            INSERT INTO image_data (image, custom_data) VALUES (?1, ?2)
            ON CONFLICT(image) DO UPDATE SET custom_data = excluded.custom_data
            "#,
            params![image, body],
        )?;
        Ok(())
    }

    /// Custom data for an image; an image without any recorded data yields
    /// the empty default.
    pub fn load_custom_data(&self, image: &str) -> Result<ImageCustomData, CatalogError> {
        let body: Option<String> = lock(&self.conn)
            .query_row(
                "SELECT custom_data FROM image_data WHERE image = ?1",
                params![image],
                |row| row.get(0),
            )
            .optional()?;
        match body {
            Some(body) => serde_json::from_str(&body).map_err(|e| CatalogError::Corrupt {
                image: image.to_string(),
                reason: e.to_string(),
            }),
            None => Ok(ImageCustomData::default()),
        }
    }

    /// Merge a registration payload into a building image's custom data.
    pub fn register_runtime_data(
        &self,
        image: &str,
        payload: &serde_json::Value,
    ) -> Result<(), CatalogError> {
        let existing = self.load_custom_data(image)?;
        let mut value = serde_json::to_value(&existing).map_err(|e| CatalogError::Corrupt {
            image: image.to_string(),
            reason: e.to_string(),
        })?;
        if let (Some(obj), Some(patch)) = (value.as_object_mut(), payload.as_object()) {
            for (key, val) in patch {
                obj.insert(key.clone(), val.clone());
            }
        }
        let merged: ImageCustomData =
            serde_json::from_value(value).map_err(|e| CatalogError::Corrupt {
                image: image.to_string(),
                reason: e.to_string(),
            })?;
        self.save_custom_data(image, &merged)
    }

    /// Trim an application's history down to `keep` tags.
    ///
    /// The newest `keep` tags survive; in particular the currently
    /// deployed tag is never pruned. A tag that containers still run is
    /// kept regardless of age and retried on a later pass. Returns the
    /// evicted tags so the caller can clean nodes and the registry.
    pub fn prune_history(&self, app: &str, keep: usize) -> Result<Vec<String>, CatalogError> {
        let keep = keep.max(1);
        let tags = self.list_tags(app)?;
        if tags.len() <= keep {
            return Ok(Vec::new());
        }
        let candidates: Vec<String> = tags[..tags.len() - keep].to_vec();
        let conn = lock(&self.conn);
        let mut evicted = Vec::new();
        for tag in candidates {
            let references: i64 = conn.query_row(
                "SELECT COUNT(*) FROM containers WHERE image = ?1",
                params![tag],
                |row| row.get(0),
            )?;
            if references > 0 {
                debug!(app, tag, references, "image tag still referenced, keeping");
                continue;
            }
            conn.execute(
                "DELETE FROM app_images WHERE app_name = ?1 AND tag = ?2",
                params![app, &tag],
            )?;
            conn.execute("DELETE FROM image_data WHERE image = ?1", params![&tag])?;
            evicted.push(tag);
        }
        debug!(app, evicted = evicted.len(), "pruned image history");
        Ok(evicted)
    }

    /// Drop every image record of an application. Returns the tags that
    /// were known so the caller can clean nodes and the registry.
    pub fn delete_app(&self, app: &str) -> Result<Vec<String>, CatalogError> {
        let tags = self.list_tags(app)?;
        let conn = lock(&self.conn);
        for tag in &tags {
            conn.execute("DELETE FROM image_data WHERE image = ?1", params![tag])?;
        }
        conn.execute("DELETE FROM app_images WHERE app_name = ?1", params![app])?;
        conn.execute(
            "DELETE FROM app_image_versions WHERE app_name = ?1",
            params![app],
        )?;
        Ok(tags)
    }
}

/// Application image tag: `<registry?>/<owner>/app-<appName>:v<N>`.
pub fn app_image_name(registry: Option<&str>, owner: &str, app: &str, version: u64) -> String {
    match registry {
        Some(registry) => format!("{registry}/{owner}/app-{app}:v{version}"),
        None => format!("{owner}/app-{app}:v{version}"),
    }
}

/// Platform base tag: `<registry?>/<owner>/<platform>:latest`.
pub fn platform_image_name(registry: Option<&str>, owner: &str, platform: &str) -> String {
    match registry {
        Some(registry) => format!("{registry}/{owner}/{platform}:latest"),
        None => format!("{owner}/{platform}:latest"),
    }
}

/// Repository path of an image as the registry knows it, i.e. the tag
/// without the registry address prefix.
pub fn repository_name(image: &str) -> &str {
    let parts: Vec<&str> = image.splitn(3, '/').collect();
    if parts.len() == 3 {
        // registry/owner/name:tag
        &image[parts[0].len() + 1..]
    } else {
        image
    }
}

/// Errors from registry cleanup calls.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("registry request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("registry returned {status} removing {repository}")]
    Api { status: u16, repository: String },
}

/// Minimal client for removing repositories from the image registry.
pub struct RegistryClient {
    base_url: String,
    http: reqwest::Client,
}

impl RegistryClient {
    pub fn new(address: &str) -> Self {
        let base_url = if address.starts_with("http://") || address.starts_with("https://") {
            address.trim_end_matches('/').to_string()
        } else {
            format!("http://{}", address.trim_end_matches('/'))
        };
        Self {
            base_url,
            http: reqwest::Client::new(),
        }
    }

    /// Remove an image repository from the registry.
    ///
    /// Best-effort: callers treat failures as warnings, the registry is
    /// cleaned up out of band if this misses.
    pub async fn remove_image(&self, image: &str) -> Result<(), RegistryError> {
        let repository = repository_name(image);
        let url = format!("{}/v1/repositories/{}/", self.base_url, repository);
        debug!(url = %url, "removing image from registry");
        let response = self.http.delete(&url).send().await?;
        if !response.status().is_success() {
            warn!(
                repository,
                status = response.status().as_u16(),
                "registry refused image removal"
            );
            return Err(RegistryError::Api {
                status: response.status().as_u16(),
                repository: repository.to_string(),
            });
        }
        Ok(())
    }
}
