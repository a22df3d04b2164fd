//! Remote container-host operations.
//!
//! The core drives container hosts through the `HostClient` trait. The
//! production implementation talks to each host's HTTP API; tests use the
//! in-repo fake. Every operation can fail with a transient network error,
//! and the error type keeps that classification explicit because the
//! healer's suspicion rules depend on it.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tracing::debug;

/// Errors from remote host operations.
#[derive(Debug, Error)]
pub enum HostError {
    /// Transport-level failure: connection refused, timeout, TLS, DNS.
    #[error("host {host} unreachable: {reason}")]
    Network { host: String, reason: String },

    /// The host answered with an error status.
    #[error("host {host} returned status {status}: {body}")]
    Api {
        host: String,
        status: u16,
        body: String,
    },

    /// The host does not know the container.
    #[error("container {0} not found on host")]
    ContainerNotFound(String),

    /// The host answered with something we cannot decode.
    #[error("invalid response from host {host}: {reason}")]
    Protocol { host: String, reason: String },
}

impl HostError {
    /// Whether this is a network-class failure (the only kind that counts
    /// toward host suspicion during general operations).
    pub fn is_network(&self) -> bool {
        matches!(self, Self::Network { .. })
    }
}

/// Options for creating a container on a host.
#[derive(Debug, Clone, Default)]
pub struct CreateContainerOptions {
    pub image: String,
    pub cmd: Vec<String>,
    pub env: Vec<String>,
    /// Exposed container port, e.g. `8888/tcp`.
    pub exposed_port: String,
}

/// Inspection snapshot of a container.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerInspect {
    pub id: String,
    pub running: bool,
    /// Internal ip; empty when the host reports none.
    pub ip: String,
    /// Host port mapped to the first exposed port; empty when unmapped.
    pub host_port: String,
}

/// Captured output of a finished exec.
#[derive(Debug, Clone, Default)]
pub struct ExecResult {
    pub exit_code: i32,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

/// Terminal geometry for interactive shells.
#[derive(Debug, Clone)]
pub struct TtyGeometry {
    pub width: u16,
    pub height: u16,
    pub term: String,
}

impl Default for TtyGeometry {
    fn default() -> Self {
        Self {
            width: 80,
            height: 24,
            term: "xterm".to_string(),
        }
    }
}

/// Bidirectional byte stream carrying an interactive shell session.
pub trait Duplex: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> Duplex for T {}

/// Remote operations on a container host.
///
/// `host` is the host's API address as registered on the node.
#[async_trait]
pub trait HostClient: Send + Sync {
    /// Create a container; returns the id assigned by the host.
    async fn create_container(
        &self,
        host: &str,
        opts: &CreateContainerOptions,
    ) -> Result<String, HostError>;

    async fn start_container(&self, host: &str, id: &str) -> Result<(), HostError>;

    async fn stop_container(&self, host: &str, id: &str) -> Result<(), HostError>;

    async fn remove_container(&self, host: &str, id: &str) -> Result<(), HostError>;

    async fn inspect_container(&self, host: &str, id: &str)
        -> Result<ContainerInspect, HostError>;

    async fn pull_image(&self, host: &str, image: &str) -> Result<(), HostError>;

    async fn remove_image(&self, host: &str, image: &str) -> Result<(), HostError>;

    async fn exec(&self, host: &str, id: &str, cmd: &[String]) -> Result<ExecResult, HostError>;

    /// Attach an interactive login shell to the container, piping it over
    /// `conn` until the remote side closes.
    async fn attach_shell(
        &self,
        host: &str,
        id: &str,
        tty: &TtyGeometry,
        conn: &mut dyn Duplex,
    ) -> Result<(), HostError>;
}

/// HTTP implementation of `HostClient`.
pub struct HttpHostClient {
    http: reqwest::Client,
}

impl HttpHostClient {
    pub fn new(connect_timeout: Duration) -> Self {
        let http = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .timeout(Duration::from_secs(120))
            .build()
            .unwrap_or_default();
        Self { http }
    }

    fn network_error(host: &str, err: &reqwest::Error) -> HostError {
        HostError::Network {
            host: host.to_string(),
            reason: err.to_string(),
        }
    }

    async fn check(host: &str, response: reqwest::Response) -> Result<reqwest::Response, HostError> {
        let status = response.status();
        if status.is_success() || status.as_u16() == 304 {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(HostError::Api {
            host: host.to_string(),
            status: status.as_u16(),
            body,
        })
    }
}

#[async_trait]
impl HostClient for HttpHostClient {
    async fn create_container(
        &self,
        host: &str,
        opts: &CreateContainerOptions,
    ) -> Result<String, HostError> {
        let mut exposed = HashMap::new();
        if !opts.exposed_port.is_empty() {
            exposed.insert(opts.exposed_port.clone(), serde_json::json!({}));
        }
        let body = CreateContainerBody {
            image: &opts.image,
            cmd: &opts.cmd,
            env: &opts.env,
            exposed_ports: exposed,
        };
        debug!(host, image = %opts.image, "creating container");
        let response = self
            .http
            .post(format!("{host}/containers/create"))
            .json(&body)
            .send()
            .await
            .map_err(|e| Self::network_error(host, &e))?;
        let response = Self::check(host, response).await?;
        let created: CreatedContainer =
            response.json().await.map_err(|e| HostError::Protocol {
                host: host.to_string(),
                reason: e.to_string(),
            })?;
        Ok(created.id)
    }

    async fn start_container(&self, host: &str, id: &str) -> Result<(), HostError> {
        let body = serde_json::json!({"PublishAllPorts": true});
        let response = self
            .http
            .post(format!("{host}/containers/{id}/start"))
            .json(&body)
            .send()
            .await
            .map_err(|e| Self::network_error(host, &e))?;
        Self::check(host, response).await.map(|_| ())
    }

    async fn stop_container(&self, host: &str, id: &str) -> Result<(), HostError> {
        let response = self
            .http
            .post(format!("{host}/containers/{id}/stop?t=10"))
            .send()
            .await
            .map_err(|e| Self::network_error(host, &e))?;
        Self::check(host, response).await.map(|_| ())
    }

    async fn remove_container(&self, host: &str, id: &str) -> Result<(), HostError> {
        let response = self
            .http
            .delete(format!("{host}/containers/{id}?force=1"))
            .send()
            .await
            .map_err(|e| Self::network_error(host, &e))?;
        Self::check(host, response).await.map(|_| ())
    }

    async fn inspect_container(
        &self,
        host: &str,
        id: &str,
    ) -> Result<ContainerInspect, HostError> {
        let response = self
            .http
            .get(format!("{host}/containers/{id}/json"))
            .send()
            .await
            .map_err(|e| Self::network_error(host, &e))?;
        if response.status().as_u16() == 404 {
            return Err(HostError::ContainerNotFound(id.to_string()));
        }
        let response = Self::check(host, response).await?;
        let raw: InspectBody = response.json().await.map_err(|e| HostError::Protocol {
            host: host.to_string(),
            reason: e.to_string(),
        })?;
        Ok(raw.into_inspect(id))
    }

    async fn pull_image(&self, host: &str, image: &str) -> Result<(), HostError> {
        debug!(host, image, "pulling image");
        let response = self
            .http
            .post(format!("{host}/images/create?fromImage={image}"))
            .send()
            .await
            .map_err(|e| Self::network_error(host, &e))?;
        Self::check(host, response).await.map(|_| ())
    }

    async fn remove_image(&self, host: &str, image: &str) -> Result<(), HostError> {
        let response = self
            .http
            .delete(format!("{host}/images/{image}"))
            .send()
            .await
            .map_err(|e| Self::network_error(host, &e))?;
        Self::check(host, response).await.map(|_| ())
    }

    async fn exec(&self, host: &str, id: &str, cmd: &[String]) -> Result<ExecResult, HostError> {
        let body = serde_json::json!({
            "Cmd": cmd,
            "AttachStdout": true,
            "AttachStderr": true,
        });
        let response = self
            .http
            .post(format!("{host}/containers/{id}/exec"))
            .json(&body)
            .send()
            .await
            .map_err(|e| Self::network_error(host, &e))?;
        let response = Self::check(host, response).await?;
        let created: CreatedExec = response.json().await.map_err(|e| HostError::Protocol {
            host: host.to_string(),
            reason: e.to_string(),
        })?;

        let response = self
            .http
            .post(format!("{host}/exec/{}/start", created.id))
            .json(&serde_json::json!({"Detach": false, "Tty": false}))
            .send()
            .await
            .map_err(|e| Self::network_error(host, &e))?;
        let response = Self::check(host, response).await?;
        let stdout = response
            .bytes()
            .await
            .map_err(|e| Self::network_error(host, &e))?
            .to_vec();

        let response = self
            .http
            .get(format!("{host}/exec/{}/json", created.id))
            .send()
            .await
            .map_err(|e| Self::network_error(host, &e))?;
        let response = Self::check(host, response).await?;
        let state: ExecState = response.json().await.map_err(|e| HostError::Protocol {
            host: host.to_string(),
            reason: e.to_string(),
        })?;

        Ok(ExecResult {
            exit_code: state.exit_code.unwrap_or(0),
            stdout,
            stderr: Vec::new(),
        })
    }

    async fn attach_shell(
        &self,
        host: &str,
        id: &str,
        tty: &TtyGeometry,
        conn: &mut dyn Duplex,
    ) -> Result<(), HostError> {
        let body = serde_json::json!({
            "Cmd": ["/usr/bin/env", format!("TERM={}", tty.term), "bash", "-l"],
            "AttachStdin": true,
            "AttachStdout": true,
            "AttachStderr": true,
            "Tty": true,
        });
        let response = self
            .http
            .post(format!("{host}/containers/{id}/exec"))
            .json(&body)
            .send()
            .await
            .map_err(|e| Self::network_error(host, &e))?;
        let response = Self::check(host, response).await?;
        let created: CreatedExec = response.json().await.map_err(|e| HostError::Protocol {
            host: host.to_string(),
            reason: e.to_string(),
        })?;

        let mut response = self
            .http
            .post(format!("{host}/exec/{}/start", created.id))
            .json(&serde_json::json!({
                "Detach": false,
                "Tty": true,
                "ConsoleSize": [tty.height, tty.width],
            }))
            .send()
            .await
            .map_err(|e| Self::network_error(host, &e))?;
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|e| Self::network_error(host, &e))?
        {
            conn.write_all(&chunk)
                .await
                .map_err(|e| HostError::Protocol {
                    host: host.to_string(),
                    reason: e.to_string(),
                })?;
        }
        Ok(())
    }
}

// Wire types for the host API.

#[derive(Serialize)]
struct CreateContainerBody<'a> {
    #[serde(rename = "Image")]
    image: &'a str,
    #[serde(rename = "Cmd")]
    cmd: &'a [String],
    #[serde(rename = "Env")]
    env: &'a [String],
    #[serde(rename = "ExposedPorts")]
    exposed_ports: HashMap<String, serde_json::Value>,
}

#[derive(Deserialize)]
struct CreatedContainer {
    #[serde(rename = "Id")]
    id: String,
}

#[derive(Deserialize)]
struct CreatedExec {
    #[serde(rename = "Id")]
    id: String,
}

#[derive(Deserialize)]
struct ExecState {
    #[serde(rename = "ExitCode")]
    exit_code: Option<i32>,
}

#[derive(Deserialize, Default)]
struct InspectBody {
    #[serde(rename = "State", default)]
    state: InspectState,
    #[serde(rename = "NetworkSettings", default)]
    network: InspectNetwork,
}

#[derive(Deserialize, Default)]
struct InspectState {
    #[serde(rename = "Running", default)]
    running: bool,
}

#[derive(Deserialize, Default)]
struct InspectNetwork {
    #[serde(rename = "IpAddress", alias = "IPAddress", default)]
    ip_address: String,
    #[serde(rename = "Ports", default)]
    ports: HashMap<String, Option<Vec<PortBinding>>>,
}

#[derive(Deserialize)]
struct PortBinding {
    #[serde(rename = "HostPort", default)]
    host_port: String,
}

impl InspectBody {
    fn into_inspect(self, id: &str) -> ContainerInspect {
        let mut keys: Vec<&String> = self.network.ports.keys().collect();
        keys.sort();
        let host_port = keys
            .first()
            .and_then(|key| self.network.ports.get(*key))
            .and_then(|bindings| bindings.as_ref())
            .and_then(|bindings| bindings.first())
            .map(|binding| binding.host_port.clone())
            .unwrap_or_default();
        ContainerInspect {
            id: id.to_string(),
            running: self.state.running,
            ip: self.network.ip_address,
            host_port,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_network_classification() {
        let network = HostError::Network {
            host: "http://10.0.0.1:2375".to_string(),
            reason: "connection refused".to_string(),
        };
        let api = HostError::Api {
            host: "http://10.0.0.1:2375".to_string(),
            status: 500,
            body: "boom".to_string(),
        };
        assert!(network.is_network());
        assert!(!api.is_network());
        assert!(!HostError::ContainerNotFound("c1".to_string()).is_network());
    }

    #[test]
    fn test_inspect_body_extracts_first_exposed_port() {
        let raw = r#"{
            "State": {"Running": true},
            "NetworkSettings": {
                "IpAddress": "127.0.0.9",
                "Ports": {"8888/tcp": [{"HostIp": "0.0.0.0", "HostPort": "9999"}]}
            }
        }"#;
        let body: InspectBody = serde_json::from_str(raw).unwrap();
        let inspect = body.into_inspect("9930c24f1c4x");
        assert!(inspect.running);
        assert_eq!(inspect.ip, "127.0.0.9");
        assert_eq!(inspect.host_port, "9999");
    }

    #[test]
    fn test_inspect_body_tolerates_missing_ports() {
        let raw = r#"{"State": {"Running": false}, "NetworkSettings": {"IpAddress": ""}}"#;
        let body: InspectBody = serde_json::from_str(raw).unwrap();
        let inspect = body.into_inspect("c1");
        assert!(!inspect.running);
        assert!(inspect.ip.is_empty());
        assert!(inspect.host_port.is_empty());
    }
}
