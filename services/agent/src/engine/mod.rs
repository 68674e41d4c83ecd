//! Container engine client interface.
//!
//! The reconciliation engine drives an existing container engine through this
//! narrow trait. Every operation is keyed by engine-native ids or names; the
//! namespacing helpers in `skiff_id` bridge those to applications.
//!
//! An in-memory implementation is provided in [`mock`] for tests and
//! development.

pub mod mock;

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use mock::{EngineOp, MockEngine};

/// Errors reported by the engine client.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EngineError {
    #[error("no such object: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    /// The object is already in the requested state.
    #[error("not modified: {0}")]
    NotModified(String),

    #[error("delta for {0} is still being generated")]
    DeltaStillProcessing(String),

    #[error("request timed out: {0}")]
    Timeout(String),

    #[error("transport error: {0}")]
    Transport(String),
}

impl EngineError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, EngineError::NotFound(_))
    }

    pub fn is_not_modified(&self) -> bool {
        matches!(self, EngineError::NotModified(_))
    }

    /// Timeouts and connection failures; retried by the next pass.
    pub fn is_transient(&self) -> bool {
        matches!(self, EngineError::Timeout(_) | EngineError::Transport(_))
    }
}

// =============================================================================
// Containers
// =============================================================================

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct HealthConfig {
    pub test: Vec<String>,
    /// Nanoseconds.
    pub interval: u64,
    pub timeout: u64,
    pub start_period: u64,
    pub retries: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct ContainerConfig {
    pub hostname: String,
    pub image: String,
    pub env: Vec<String>,
    pub labels: BTreeMap<String, String>,
    pub cmd: Vec<String>,
    pub entrypoint: Vec<String>,
    pub user: String,
    pub working_dir: String,
    pub tty: bool,
    pub stop_signal: Option<String>,
    /// Seconds.
    pub stop_timeout: Option<u64>,
    pub healthcheck: Option<HealthConfig>,
    pub exposed_ports: BTreeSet<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct RestartPolicy {
    pub name: String,
    pub maximum_retry_count: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct PortBinding {
    pub host_ip: String,
    pub host_port: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct HostConfig {
    pub network_mode: String,
    pub binds: Vec<String>,
    pub port_bindings: BTreeMap<String, Vec<PortBinding>>,
    pub privileged: bool,
    pub cap_add: Vec<String>,
    pub cap_drop: Vec<String>,
    /// `host:container:permissions` triples.
    pub devices: Vec<String>,
    pub memory: i64,
    pub memory_reservation: i64,
    pub cpu_shares: i64,
    pub cpu_quota: i64,
    pub nano_cpus: i64,
    pub restart_policy: RestartPolicy,
    pub dns: Vec<String>,
    pub extra_hosts: Vec<String>,
    pub readonly_rootfs: bool,
    pub sysctls: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct EndpointSettings {
    pub aliases: Vec<String>,
    #[serde(rename = "IPv4Address")]
    pub ipv4_address: Option<String>,
    #[serde(rename = "IPv6Address")]
    pub ipv6_address: Option<String>,
    #[serde(rename = "LinkLocalIPs")]
    pub link_local_ips: Vec<String>,
}

/// Parameters for creating a container.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerCreate {
    pub name: String,
    pub config: ContainerConfig,
    pub host_config: HostConfig,
    /// Endpoint settings for the network named by `host_config.network_mode`.
    pub endpoints: BTreeMap<String, EndpointSettings>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct ContainerState {
    /// One of `created`, `running`, `paused`, `restarting`, `removing`,
    /// `exited` or `dead`.
    pub status: String,
    pub running: bool,
    pub exit_code: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ContainerInspect {
    pub id: String,
    /// Engine name, with a leading `/`.
    pub name: String,
    pub created: DateTime<Utc>,
    pub state: ContainerState,
    pub config: ContainerConfig,
    pub host_config: HostConfig,
    pub networks: BTreeMap<String, EndpointSettings>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerSummary {
    pub id: String,
    pub name: String,
    pub labels: BTreeMap<String, String>,
}

// =============================================================================
// Networks
// =============================================================================

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct IpamPool {
    pub subnet: Option<String>,
    pub gateway: Option<String>,
    #[serde(rename = "IPRange")]
    pub ip_range: Option<String>,
    pub aux_addresses: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct Ipam {
    pub driver: String,
    pub config: Vec<IpamPool>,
    pub options: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct NetworkInspect {
    pub id: String,
    pub name: String,
    pub driver: String,
    #[serde(rename = "IPAM")]
    pub ipam: Ipam,
    #[serde(rename = "EnableIPv6")]
    pub enable_ipv6: bool,
    pub internal: bool,
    pub attachable: bool,
    pub options: BTreeMap<String, String>,
    pub labels: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NetworkCreate {
    pub name: String,
    pub driver: String,
    pub ipam: Ipam,
    pub enable_ipv6: bool,
    pub internal: bool,
    pub attachable: bool,
    pub options: BTreeMap<String, String>,
    pub labels: BTreeMap<String, String>,
}

// =============================================================================
// Volumes
// =============================================================================

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct VolumeInspect {
    pub name: String,
    pub driver: String,
    pub labels: BTreeMap<String, String>,
    pub options: BTreeMap<String, String>,
    pub mountpoint: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VolumeCreate {
    pub name: String,
    pub driver: String,
    pub driver_opts: BTreeMap<String, String>,
    pub labels: BTreeMap<String, String>,
}

// =============================================================================
// Images
// =============================================================================

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImageSummary {
    pub id: String,
    pub repo_tags: Vec<String>,
    pub repo_digests: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct ImageInspect {
    pub id: String,
    pub repo_tags: Vec<String>,
    pub repo_digests: Vec<String>,
    pub config: ContainerConfig,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegistryAuth {
    pub username: String,
    pub password: String,
    pub server: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PullOptions {
    pub auth: Option<RegistryAuth>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeltaOptions {
    /// Name of the image to diff against.
    pub source: String,
    /// Engine id of that image.
    pub source_id: String,
    pub endpoint: String,
    pub version: u32,
    pub request_timeout: Duration,
    pub apply_timeout: Option<Duration>,
    pub retry_count: u32,
    pub retry_interval: Duration,
    pub auth: Option<RegistryAuth>,
}

/// Container engine client.
#[async_trait]
pub trait ContainerEngine: Send + Sync {
    /// Lists containers (running or not) carrying the given label.
    async fn list_containers(&self, label: &str) -> Result<Vec<ContainerSummary>, EngineError>;

    async fn inspect_container(&self, id: &str) -> Result<ContainerInspect, EngineError>;

    /// Creates a container and returns its id.
    async fn create_container(&self, spec: &ContainerCreate) -> Result<String, EngineError>;

    async fn start_container(&self, id: &str) -> Result<(), EngineError>;

    /// Stops gracefully, killing after `timeout`.
    async fn stop_container(&self, id: &str, timeout: Duration) -> Result<(), EngineError>;

    async fn kill_container(&self, id: &str) -> Result<(), EngineError>;

    async fn remove_container(&self, id: &str, force: bool) -> Result<(), EngineError>;

    async fn rename_container(&self, id: &str, name: &str) -> Result<(), EngineError>;

    /// Blocks until the container is no longer running; returns its exit code.
    async fn wait_container(&self, id: &str) -> Result<i64, EngineError>;

    async fn list_networks(&self) -> Result<Vec<NetworkInspect>, EngineError>;

    async fn inspect_network(&self, name: &str) -> Result<NetworkInspect, EngineError>;

    async fn create_network(&self, spec: &NetworkCreate) -> Result<String, EngineError>;

    async fn remove_network(&self, name: &str) -> Result<(), EngineError>;

    async fn connect_network(
        &self,
        network: &str,
        container_id: &str,
        endpoint: &EndpointSettings,
    ) -> Result<(), EngineError>;

    async fn list_volumes(&self) -> Result<Vec<VolumeInspect>, EngineError>;

    async fn inspect_volume(&self, name: &str) -> Result<VolumeInspect, EngineError>;

    async fn create_volume(&self, spec: &VolumeCreate) -> Result<VolumeInspect, EngineError>;

    async fn remove_volume(&self, name: &str) -> Result<(), EngineError>;

    /// Lists images; with `dangling_only`, just those without a tag.
    async fn list_images(&self, dangling_only: bool) -> Result<Vec<ImageSummary>, EngineError>;

    /// Inspects an image by id, `repo:tag` or `repo@digest`.
    async fn inspect_image(&self, name: &str) -> Result<ImageInspect, EngineError>;

    async fn tag_image(&self, image: &str, repo: &str, tag: &str) -> Result<(), EngineError>;

    async fn remove_image(&self, name: &str, force: bool) -> Result<(), EngineError>;

    /// Pulls a full image; returns the engine id.
    async fn pull_image(
        &self,
        name: &str,
        options: &PullOptions,
        progress: &(dyn Fn(u8) + Send + Sync),
    ) -> Result<String, EngineError>;

    /// Fetches and applies a delta against `options.source`; returns the
    /// engine id of the resulting image.
    async fn pull_delta(
        &self,
        name: &str,
        options: &DeltaOptions,
        progress: &(dyn Fn(u8) + Send + Sync),
    ) -> Result<String, EngineError>;
}
