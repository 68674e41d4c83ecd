//! In-memory container engine for tests and development.
//!
//! Behaves like a real engine where the reconciliation logic can observe it:
//! names must be unique, referenced networks/volumes/images must exist,
//! in-use resources refuse removal, hostnames and network aliases pick up the
//! container's short id, and empty bridge IPAM config is populated.

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use sha2::{Digest, Sha256};
use tracing::debug;

use super::{
    ContainerCreate, ContainerEngine, ContainerInspect, ContainerState, ContainerSummary,
    DeltaOptions, EndpointSettings, EngineError, ImageInspect, ImageSummary, IpamPool,
    NetworkCreate, NetworkInspect, PullOptions, VolumeCreate, VolumeInspect,
};
use crate::engine::ContainerConfig;

/// Kinds of mutating engine calls recorded by the mock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EngineOp {
    CreateContainer,
    StartContainer,
    StopContainer,
    KillContainer,
    RemoveContainer,
    RenameContainer,
    CreateNetwork,
    RemoveNetwork,
    ConnectNetwork,
    CreateVolume,
    RemoveVolume,
    PullImage,
    PullDelta,
    TagImage,
    RemoveImage,
}

/// One recorded call: the operation and the name or id it targeted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineCall {
    pub op: EngineOp,
    pub target: String,
}

#[derive(Debug, Clone)]
struct MockImage {
    id: String,
    repo_tags: Vec<String>,
    repo_digests: Vec<String>,
    config: ContainerConfig,
}

impl MockImage {
    fn matches(&self, name: &str) -> bool {
        self.id == name
            || self.repo_tags.iter().any(|t| t == name)
            || self.repo_digests.iter().any(|d| d == name)
    }

    fn summary(&self) -> ImageSummary {
        ImageSummary {
            id: self.id.clone(),
            repo_tags: self.repo_tags.clone(),
            repo_digests: self.repo_digests.clone(),
        }
    }
}

#[derive(Debug, Default)]
struct MockState {
    containers: BTreeMap<String, ContainerInspect>,
    networks: BTreeMap<String, NetworkInspect>,
    volumes: BTreeMap<String, VolumeInspect>,
    images: Vec<MockImage>,
    calls: Vec<EngineCall>,
    failing_pulls: HashSet<String>,
    delta_processing: HashSet<String>,
}

impl MockState {
    fn image_index(&self, name: &str) -> Option<usize> {
        self.images.iter().position(|i| i.matches(name)).or_else(|| {
            let has_tag = name.rsplit('/').next().is_some_and(|last| last.contains(':'));
            if has_tag || name.contains('@') {
                None
            } else {
                let latest = format!("{name}:latest");
                self.images.iter().position(|i| i.matches(&latest))
            }
        })
    }

    fn container_by_name(&self, name: &str) -> Option<&ContainerInspect> {
        let wanted = format!("/{}", name.trim_start_matches('/'));
        self.containers.values().find(|c| c.name == wanted)
    }

    fn record(&mut self, op: EngineOp, target: &str) {
        self.calls.push(EngineCall {
            op,
            target: target.to_string(),
        });
    }
}

fn content_id(seed: &str) -> String {
    hex::encode(Sha256::digest(seed.as_bytes()))
}

fn is_builtin_network(mode: &str) -> bool {
    matches!(mode, "" | "bridge" | "host" | "none" | "default") || mode.starts_with("container:")
}

/// Mock engine for testing and development.
pub struct MockEngine {
    state: Mutex<MockState>,

    /// Counter for generating ids.
    counter: AtomicU64,

    /// Artificial latency for container lifecycle and pull calls.
    op_delay: Duration,

    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

/// Counts a lifecycle call as in flight for its lifetime.
struct InFlight<'a>(&'a MockEngine);

impl<'a> InFlight<'a> {
    fn enter(engine: &'a MockEngine) -> Self {
        let now = engine.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        engine.max_in_flight.fetch_max(now, Ordering::SeqCst);
        Self(engine)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

impl MockEngine {
    /// Create a new, empty mock engine.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MockState::default()),
            counter: AtomicU64::new(0),
            op_delay: Duration::ZERO,
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    /// Create a mock engine whose lifecycle and pull calls take `delay`.
    pub fn with_op_delay(delay: Duration) -> Self {
        Self {
            op_delay: delay,
            ..Self::new()
        }
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn next_id(&self, seed: &str) -> String {
        let n = self.counter.fetch_add(1, Ordering::SeqCst);
        content_id(&format!("{seed}-{n}"))
    }

    async fn delay(&self) {
        if !self.op_delay.is_zero() {
            tokio::time::sleep(self.op_delay).await;
        }
    }

    // =========================================================================
    // Seeding and inspection helpers
    // =========================================================================

    /// Makes an image available without pulling it. Returns its id.
    pub fn add_image(&self, name: &str) -> String {
        let id = format!("sha256:{}", content_id(name));
        self.add_image_with_id(&id, &[name]);
        id
    }

    /// Makes an image with a fixed id available under several names.
    pub fn add_image_with_id(&self, id: &str, names: &[&str]) {
        let mut state = self.state();
        let (tags, digests): (Vec<&str>, Vec<&str>) = names.iter().copied().partition(|n| !n.contains('@'));
        if let Some(existing) = state.images.iter_mut().find(|i| i.id == id) {
            existing.repo_tags.extend(tags.into_iter().map(String::from));
            existing.repo_digests.extend(digests.into_iter().map(String::from));
            return;
        }
        state.images.push(MockImage {
            id: id.to_string(),
            repo_tags: tags.into_iter().map(String::from).collect(),
            repo_digests: digests.into_iter().map(String::from).collect(),
            config: ContainerConfig::default(),
        });
    }

    /// Adds a network the agent did not create.
    pub fn add_network(&self, network: NetworkInspect) {
        self.state().networks.insert(network.name.clone(), network);
    }

    /// Makes pulls of `name` fail with a transport error.
    pub fn fail_pulls(&self, name: &str) {
        self.state().failing_pulls.insert(name.to_string());
    }

    pub fn allow_pulls(&self, name: &str) {
        self.state().failing_pulls.remove(name);
    }

    /// Makes delta pulls of `name` report that the delta is still being generated.
    pub fn set_delta_processing(&self, name: &str, processing: bool) {
        let mut state = self.state();
        if processing {
            state.delta_processing.insert(name.to_string());
        } else {
            state.delta_processing.remove(name);
        }
    }

    /// Forces a container into an engine state such as `exited` or `dead`.
    pub fn set_container_status(&self, id: &str, status: &str) {
        if let Some(container) = self.state().containers.get_mut(id) {
            container.state.status = status.to_string();
            container.state.running = status == "running";
        }
    }

    pub fn calls(&self) -> Vec<EngineCall> {
        self.state().calls.clone()
    }

    /// Targets of every recorded call of one kind, in order.
    pub fn calls_of(&self, op: EngineOp) -> Vec<String> {
        self.state()
            .calls
            .iter()
            .filter(|c| c.op == op)
            .map(|c| c.target.clone())
            .collect()
    }

    pub fn clear_calls(&self) {
        self.state().calls.clear();
    }

    pub fn containers(&self) -> Vec<ContainerInspect> {
        self.state().containers.values().cloned().collect()
    }

    pub fn container_by_name(&self, name: &str) -> Option<ContainerInspect> {
        self.state().container_by_name(name).cloned()
    }

    pub fn networks(&self) -> Vec<NetworkInspect> {
        self.state().networks.values().cloned().collect()
    }

    pub fn volumes(&self) -> Vec<VolumeInspect> {
        self.state().volumes.values().cloned().collect()
    }

    pub fn images(&self) -> Vec<ImageSummary> {
        self.state().images.iter().map(MockImage::summary).collect()
    }

    /// Highest number of lifecycle calls observed in flight at once.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn store_pulled(&self, name: &str) -> String {
        let mut state = self.state();
        if let Some(index) = state.image_index(name) {
            return state.images[index].id.clone();
        }
        let id = format!("sha256:{}", content_id(name));
        let (repo_tags, repo_digests) = if name.contains('@') {
            (Vec::new(), vec![name.to_string()])
        } else {
            (vec![name.to_string()], Vec::new())
        };
        state.images.push(MockImage {
            id: id.clone(),
            repo_tags,
            repo_digests,
            config: ContainerConfig::default(),
        });
        id
    }
}

impl Default for MockEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ContainerEngine for MockEngine {
    async fn list_containers(&self, label: &str) -> Result<Vec<ContainerSummary>, EngineError> {
        Ok(self
            .state()
            .containers
            .values()
            .filter(|c| c.config.labels.contains_key(label))
            .map(|c| ContainerSummary {
                id: c.id.clone(),
                name: c.name.clone(),
                labels: c.config.labels.clone(),
            })
            .collect())
    }

    async fn inspect_container(&self, id: &str) -> Result<ContainerInspect, EngineError> {
        self.state()
            .containers
            .get(id)
            .cloned()
            .ok_or_else(|| EngineError::NotFound(id.to_string()))
    }

    async fn create_container(&self, spec: &ContainerCreate) -> Result<String, EngineError> {
        let _guard = InFlight::enter(self);
        self.delay().await;
        let id = self.next_id(&spec.name);
        let short_id = id[..12].to_string();

        let mut state = self.state();
        state.record(EngineOp::CreateContainer, &spec.name);
        if state.container_by_name(&spec.name).is_some() {
            return Err(EngineError::Conflict(format!(
                "container name {} already in use",
                spec.name
            )));
        }
        if state.image_index(&spec.config.image).is_none() {
            return Err(EngineError::NotFound(spec.config.image.clone()));
        }
        let mode = &spec.host_config.network_mode;
        let mut required_networks: Vec<&String> = spec.endpoints.keys().collect();
        if !is_builtin_network(mode) {
            required_networks.push(mode);
        }
        if let Some(missing) = required_networks
            .into_iter()
            .find(|n| !state.networks.contains_key(*n))
        {
            return Err(EngineError::NotFound(format!("network {missing}")));
        }
        for bind in &spec.host_config.binds {
            let source = bind.split(':').next().unwrap_or_default();
            if !source.starts_with('/') && !state.volumes.contains_key(source) {
                return Err(EngineError::NotFound(format!("volume {source}")));
            }
        }

        let mut networks = spec.endpoints.clone();
        if !is_builtin_network(mode) {
            networks.entry(mode.clone()).or_default();
        }
        for (name, endpoint) in networks.iter_mut() {
            if !is_builtin_network(name) {
                endpoint.aliases.push(short_id.clone());
            }
        }

        let mut config = spec.config.clone();
        if config.hostname.is_empty() {
            config.hostname = short_id;
        }

        state.containers.insert(
            id.clone(),
            ContainerInspect {
                id: id.clone(),
                name: format!("/{}", spec.name),
                created: Utc::now(),
                state: ContainerState {
                    status: "created".to_string(),
                    running: false,
                    exit_code: 0,
                },
                config,
                host_config: spec.host_config.clone(),
                networks,
            },
        );
        debug!(name = %spec.name, id = %id, "[MOCK] Container created");
        Ok(id)
    }

    async fn start_container(&self, id: &str) -> Result<(), EngineError> {
        let _guard = InFlight::enter(self);
        self.delay().await;
        let mut state = self.state();
        state.record(EngineOp::StartContainer, id);
        let container = state
            .containers
            .get_mut(id)
            .ok_or_else(|| EngineError::NotFound(id.to_string()))?;
        if container.state.running {
            return Err(EngineError::NotModified(id.to_string()));
        }
        container.state.running = true;
        container.state.status = "running".to_string();
        Ok(())
    }

    async fn stop_container(&self, id: &str, _timeout: Duration) -> Result<(), EngineError> {
        let _guard = InFlight::enter(self);
        self.delay().await;
        let mut state = self.state();
        state.record(EngineOp::StopContainer, id);
        let container = state
            .containers
            .get_mut(id)
            .ok_or_else(|| EngineError::NotFound(id.to_string()))?;
        if !container.state.running {
            return Err(EngineError::NotModified(id.to_string()));
        }
        container.state.running = false;
        container.state.status = "exited".to_string();
        Ok(())
    }

    async fn kill_container(&self, id: &str) -> Result<(), EngineError> {
        let _guard = InFlight::enter(self);
        self.delay().await;
        let mut state = self.state();
        state.record(EngineOp::KillContainer, id);
        let container = state
            .containers
            .get_mut(id)
            .ok_or_else(|| EngineError::NotFound(id.to_string()))?;
        if !container.state.running {
            return Err(EngineError::Conflict(format!("container {id} is not running")));
        }
        container.state.running = false;
        container.state.status = "exited".to_string();
        container.state.exit_code = 137;
        Ok(())
    }

    async fn remove_container(&self, id: &str, force: bool) -> Result<(), EngineError> {
        let _guard = InFlight::enter(self);
        self.delay().await;
        let mut state = self.state();
        state.record(EngineOp::RemoveContainer, id);
        let running = state
            .containers
            .get(id)
            .map(|c| c.state.running)
            .ok_or_else(|| EngineError::NotFound(id.to_string()))?;
        if running && !force {
            return Err(EngineError::Conflict(format!(
                "cannot remove running container {id}"
            )));
        }
        state.containers.remove(id);
        Ok(())
    }

    async fn rename_container(&self, id: &str, name: &str) -> Result<(), EngineError> {
        let _guard = InFlight::enter(self);
        self.delay().await;
        let mut state = self.state();
        state.record(EngineOp::RenameContainer, id);
        if state.container_by_name(name).is_some_and(|c| c.id != id) {
            return Err(EngineError::Conflict(format!("container name {name} already in use")));
        }
        let container = state
            .containers
            .get_mut(id)
            .ok_or_else(|| EngineError::NotFound(id.to_string()))?;
        container.name = format!("/{name}");
        Ok(())
    }

    async fn wait_container(&self, id: &str) -> Result<i64, EngineError> {
        match self.state().containers.get(id) {
            Some(container) => Ok(container.state.exit_code),
            None => Err(EngineError::NotFound(id.to_string())),
        }
    }

    async fn list_networks(&self) -> Result<Vec<NetworkInspect>, EngineError> {
        Ok(self.networks())
    }

    async fn inspect_network(&self, name: &str) -> Result<NetworkInspect, EngineError> {
        self.state()
            .networks
            .get(name)
            .cloned()
            .ok_or_else(|| EngineError::NotFound(format!("network {name}")))
    }

    async fn create_network(&self, spec: &NetworkCreate) -> Result<String, EngineError> {
        let id = self.next_id(&spec.name);
        let mut state = self.state();
        state.record(EngineOp::CreateNetwork, &spec.name);
        if state.networks.contains_key(&spec.name) {
            return Err(EngineError::Conflict(format!(
                "network with name {} already exists",
                spec.name
            )));
        }
        let mut ipam = spec.ipam.clone();
        if ipam.config.is_empty() && spec.driver == "bridge" {
            let octet = 18 + state.networks.len();
            ipam.config.push(IpamPool {
                subnet: Some(format!("172.{octet}.0.0/16")),
                gateway: Some(format!("172.{octet}.0.1")),
                ..IpamPool::default()
            });
        }
        state.networks.insert(
            spec.name.clone(),
            NetworkInspect {
                id: id.clone(),
                name: spec.name.clone(),
                driver: spec.driver.clone(),
                ipam,
                enable_ipv6: spec.enable_ipv6,
                internal: spec.internal,
                attachable: spec.attachable,
                options: spec.options.clone(),
                labels: spec.labels.clone(),
            },
        );
        Ok(id)
    }

    async fn remove_network(&self, name: &str) -> Result<(), EngineError> {
        let mut state = self.state();
        state.record(EngineOp::RemoveNetwork, name);
        if !state.networks.contains_key(name) {
            return Err(EngineError::NotFound(format!("network {name}")));
        }
        let in_use = state
            .containers
            .values()
            .any(|c| c.host_config.network_mode == name || c.networks.contains_key(name));
        if in_use {
            return Err(EngineError::Conflict(format!(
                "network {name} has active endpoints"
            )));
        }
        state.networks.remove(name);
        Ok(())
    }

    async fn connect_network(
        &self,
        network: &str,
        container_id: &str,
        endpoint: &EndpointSettings,
    ) -> Result<(), EngineError> {
        let mut state = self.state();
        state.record(EngineOp::ConnectNetwork, network);
        if !state.networks.contains_key(network) {
            return Err(EngineError::NotFound(format!("network {network}")));
        }
        let container = state
            .containers
            .get_mut(container_id)
            .ok_or_else(|| EngineError::NotFound(container_id.to_string()))?;
        let mut endpoint = endpoint.clone();
        endpoint.aliases.push(container.id[..12].to_string());
        container.networks.insert(network.to_string(), endpoint);
        Ok(())
    }

    async fn list_volumes(&self) -> Result<Vec<VolumeInspect>, EngineError> {
        Ok(self.volumes())
    }

    async fn inspect_volume(&self, name: &str) -> Result<VolumeInspect, EngineError> {
        self.state()
            .volumes
            .get(name)
            .cloned()
            .ok_or_else(|| EngineError::NotFound(format!("volume {name}")))
    }

    async fn create_volume(&self, spec: &VolumeCreate) -> Result<VolumeInspect, EngineError> {
        let mut state = self.state();
        state.record(EngineOp::CreateVolume, &spec.name);
        let volume = state
            .volumes
            .entry(spec.name.clone())
            .or_insert_with(|| VolumeInspect {
                name: spec.name.clone(),
                driver: spec.driver.clone(),
                labels: spec.labels.clone(),
                options: spec.driver_opts.clone(),
                mountpoint: format!("/var/lib/docker/volumes/{}/_data", spec.name),
            });
        Ok(volume.clone())
    }

    async fn remove_volume(&self, name: &str) -> Result<(), EngineError> {
        let mut state = self.state();
        state.record(EngineOp::RemoveVolume, name);
        if !state.volumes.contains_key(name) {
            return Err(EngineError::NotFound(format!("volume {name}")));
        }
        let in_use = state.containers.values().any(|c| {
            c.host_config
                .binds
                .iter()
                .any(|b| b.split(':').next() == Some(name))
        });
        if in_use {
            return Err(EngineError::Conflict(format!("volume {name} is in use")));
        }
        state.volumes.remove(name);
        Ok(())
    }

    async fn list_images(&self, dangling_only: bool) -> Result<Vec<ImageSummary>, EngineError> {
        Ok(self
            .state()
            .images
            .iter()
            .filter(|i| !dangling_only || (i.repo_tags.is_empty() && i.repo_digests.is_empty()))
            .map(MockImage::summary)
            .collect())
    }

    async fn inspect_image(&self, name: &str) -> Result<ImageInspect, EngineError> {
        let state = self.state();
        let index = state
            .image_index(name)
            .ok_or_else(|| EngineError::NotFound(name.to_string()))?;
        let image = &state.images[index];
        Ok(ImageInspect {
            id: image.id.clone(),
            repo_tags: image.repo_tags.clone(),
            repo_digests: image.repo_digests.clone(),
            config: image.config.clone(),
        })
    }

    async fn tag_image(&self, image: &str, repo: &str, tag: &str) -> Result<(), EngineError> {
        let full = format!("{repo}:{tag}");
        let mut state = self.state();
        state.record(EngineOp::TagImage, &full);
        let index = state
            .image_index(image)
            .ok_or_else(|| EngineError::NotFound(image.to_string()))?;
        for other in state.images.iter_mut() {
            other.repo_tags.retain(|t| *t != full);
        }
        state.images[index].repo_tags.push(full);
        Ok(())
    }

    async fn remove_image(&self, name: &str, force: bool) -> Result<(), EngineError> {
        let mut state = self.state();
        state.record(EngineOp::RemoveImage, name);
        let index = state
            .image_index(name)
            .ok_or_else(|| EngineError::NotFound(name.to_string()))?;
        let image = &mut state.images[index];
        let names = image.repo_tags.len() + image.repo_digests.len();
        if image.id != name && names > 1 {
            image.repo_tags.retain(|t| t != name);
            image.repo_digests.retain(|d| d != name);
            return Ok(());
        }
        let id = image.id.clone();
        let in_use = state.containers.values().any(|c| c.config.image == id);
        if in_use && !force {
            return Err(EngineError::Conflict(format!(
                "image {name} is being used by a container"
            )));
        }
        state.images.remove(index);
        Ok(())
    }

    async fn pull_image(
        &self,
        name: &str,
        _options: &PullOptions,
        progress: &(dyn Fn(u8) + Send + Sync),
    ) -> Result<String, EngineError> {
        let _guard = InFlight::enter(self);
        {
            let mut state = self.state();
            state.record(EngineOp::PullImage, name);
            if state.failing_pulls.contains(name) {
                return Err(EngineError::Transport(format!("failed to pull {name}")));
            }
        }
        progress(0);
        self.delay().await;
        progress(50);
        let id = self.store_pulled(name);
        progress(100);
        Ok(id)
    }

    async fn pull_delta(
        &self,
        name: &str,
        options: &DeltaOptions,
        progress: &(dyn Fn(u8) + Send + Sync),
    ) -> Result<String, EngineError> {
        let _guard = InFlight::enter(self);
        {
            let mut state = self.state();
            state.record(EngineOp::PullDelta, name);
            if state.delta_processing.contains(name) {
                return Err(EngineError::DeltaStillProcessing(name.to_string()));
            }
            if state.failing_pulls.contains(name) {
                return Err(EngineError::Transport(format!("failed to apply delta for {name}")));
            }
            if state.image_index(&options.source).is_none() {
                return Err(EngineError::NotFound(options.source.clone()));
            }
        }
        progress(0);
        self.delay().await;
        let id = self.store_pulled(name);
        progress(100);
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::HostConfig;

    fn container(name: &str, image: &str, network_mode: &str) -> ContainerCreate {
        ContainerCreate {
            name: name.to_string(),
            config: ContainerConfig {
                image: image.to_string(),
                ..ContainerConfig::default()
            },
            host_config: HostConfig {
                network_mode: network_mode.to_string(),
                ..HostConfig::default()
            },
            endpoints: BTreeMap::new(),
        }
    }

    #[tokio::test]
    async fn test_mock_engine_container_lifecycle() {
        let engine = MockEngine::new();
        let image = engine.add_image("registry/app:1");

        let id = engine
            .create_container(&container("web_1_1", &image, "bridge"))
            .await
            .unwrap();
        engine.start_container(&id).await.unwrap();
        assert!(engine
            .start_container(&id)
            .await
            .unwrap_err()
            .is_not_modified());

        let inspect = engine.inspect_container(&id).await.unwrap();
        assert_eq!(inspect.name, "/web_1_1");
        assert_eq!(inspect.config.hostname, id[..12]);
        assert!(inspect.state.running);

        assert!(engine.remove_container(&id, false).await.is_err());
        engine.stop_container(&id, Duration::from_secs(10)).await.unwrap();
        engine.remove_container(&id, false).await.unwrap();
        assert!(engine.inspect_container(&id).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_mock_engine_requires_dependencies() {
        let engine = MockEngine::new();
        let missing_image = engine
            .create_container(&container("web_1_1", "nope:1", "bridge"))
            .await;
        assert!(matches!(missing_image, Err(EngineError::NotFound(_))));

        let image = engine.add_image("registry/app:1");
        let missing_network = engine
            .create_container(&container("web_1_1", &image, "1_default"))
            .await;
        assert!(matches!(missing_network, Err(EngineError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_mock_engine_network_ipam_is_populated() {
        let engine = MockEngine::new();
        engine
            .create_network(&NetworkCreate {
                name: "1_default".to_string(),
                driver: "bridge".to_string(),
                ..NetworkCreate::default()
            })
            .await
            .unwrap();
        let network = engine.inspect_network("1_default").await.unwrap();
        assert_eq!(network.ipam.config.len(), 1);
        assert!(network.ipam.config[0].gateway.is_some());
    }

    #[tokio::test]
    async fn test_mock_engine_pull_failures() {
        let engine = MockEngine::new();
        engine.fail_pulls("registry/app:2");
        let result = engine
            .pull_image("registry/app:2", &PullOptions::default(), &|_: u8| {})
            .await;
        assert!(matches!(result, Err(EngineError::Transport(_))));

        engine.allow_pulls("registry/app:2");
        let id = engine
            .pull_image("registry/app:2", &PullOptions::default(), &|_: u8| {})
            .await
            .unwrap();
        assert_eq!(engine.inspect_image("registry/app:2").await.unwrap().id, id);
        assert_eq!(engine.calls_of(EngineOp::PullImage).len(), 2);
    }

    #[tokio::test]
    async fn test_mock_engine_reports_progress_to_borrowed_callback() {
        let engine = MockEngine::new();
        let seen = std::sync::Mutex::new(Vec::new());
        let record = |percent: u8| seen.lock().unwrap().push(percent);

        engine
            .pull_image("registry/app:3", &PullOptions::default(), &record)
            .await
            .unwrap();

        assert_eq!(seen.lock().unwrap().as_slice(), &[0, 50, 100]);
    }
}
