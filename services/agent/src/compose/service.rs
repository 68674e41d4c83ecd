//! Service descriptor.
//!
//! A [`Service`] is built either from a target record (plus the image's own
//! config, when the image is available) or by inspecting a container. Both
//! paths normalize to the same [`ServiceConfig`] shape so that
//! [`Service::config_diff`] can compare them field by field.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use skiff_id::{AppId, ContainerName, ImageId, ReleaseId, ServiceId};

use crate::compose::image::Image;
use crate::compose::labels;
use crate::compose::utils::{
    env_list_to_map, env_map_to_list, expose_key, parse_duration_nanos, parse_memory, PortMap,
    StringOrList, StringOrNumber,
};
use crate::config::DeviceMetadata;
use crate::contracts::Contract;
use crate::engine::{
    ContainerConfig, ContainerCreate, ContainerInspect, EndpointSettings, HealthConfig, HostConfig,
    ImageInspect, PortBinding, RestartPolicy,
};
use crate::error::{ComposeError, Result};
use crate::validation::check_int;

/// Name of the agent's own bridge network.
pub const SUPERVISOR_NETWORK: &str = "supervisor0";
pub const SUPERVISOR_NETWORK_SUBNET: &str = "10.114.104.0/25";
pub const SUPERVISOR_NETWORK_GATEWAY: &str = "10.114.104.1";

/// Mount point of the per-service lock directory inside containers.
const LOCK_MOUNT: &str = "/tmp/skiff";
const DEFAULT_STOP_GRACE_SECS: u64 = 10;
const DEFAULT_HANDOVER_TIMEOUT: Duration = Duration::from_secs(60);

// =============================================================================
// Target records
// =============================================================================

/// Per-network settings in a target service's `networks` map.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ComposeServiceNetwork {
    pub aliases: Vec<String>,
    pub ipv4_address: Option<String>,
    pub ipv6_address: Option<String>,
    pub link_local_ips: Vec<String>,
}

/// `networks` may be a plain list of names or a map of settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum ComposeServiceNetworks {
    List(Vec<String>),
    Map(BTreeMap<String, Option<ComposeServiceNetwork>>),
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct ComposeHealthcheck {
    pub test: Option<StringOrList>,
    pub interval: Option<StringOrNumber>,
    pub timeout: Option<StringOrNumber>,
    pub start_period: Option<StringOrNumber>,
    pub retries: Option<u32>,
    pub disable: bool,
}

/// One service in a target application.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct TargetService {
    #[serde(alias = "serviceName")]
    pub service_name: String,
    pub image: String,
    #[serde(alias = "imageId")]
    pub image_id: Option<ImageId>,
    pub running: Option<bool>,
    pub environment: BTreeMap<String, String>,
    pub labels: BTreeMap<String, String>,
    pub command: Option<StringOrList>,
    pub entrypoint: Option<StringOrList>,
    pub network_mode: Option<String>,
    pub networks: Option<ComposeServiceNetworks>,
    pub volumes: Vec<String>,
    pub ports: Vec<StringOrNumber>,
    pub expose: Vec<StringOrNumber>,
    pub mem_limit: Option<StringOrNumber>,
    pub mem_reservation: Option<StringOrNumber>,
    pub cpu_shares: Option<i64>,
    pub cpu_quota: Option<i64>,
    pub cpus: Option<f64>,
    pub privileged: bool,
    pub cap_add: Vec<String>,
    pub cap_drop: Vec<String>,
    pub devices: Vec<String>,
    pub dns: Option<StringOrList>,
    pub extra_hosts: Vec<String>,
    pub restart: Option<String>,
    pub healthcheck: Option<ComposeHealthcheck>,
    pub stop_signal: Option<String>,
    pub stop_grace_period: Option<StringOrNumber>,
    pub user: Option<String>,
    pub working_dir: Option<String>,
    pub hostname: Option<String>,
    pub tty: bool,
    pub read_only: bool,
    pub sysctls: BTreeMap<String, String>,
    pub depends_on: Vec<String>,
    pub contract: Option<Contract>,
}

// =============================================================================
// Normalized descriptor
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ServiceStatus {
    Installing,
    Installed,
    Running,
    Stopping,
    Stopped,
    Exited,
    Dead,
    #[serde(rename = "Handing over")]
    HandingOver,
}

impl fmt::Display for ServiceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ServiceStatus::Installing => "Installing",
            ServiceStatus::Installed => "Installed",
            ServiceStatus::Running => "Running",
            ServiceStatus::Stopping => "Stopping",
            ServiceStatus::Stopped => "Stopped",
            ServiceStatus::Exited => "Exited",
            ServiceStatus::Dead => "Dead",
            ServiceStatus::HandingOver => "Handing over",
        })
    }
}

/// How a service moves from one image/config to the next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateStrategy {
    DownloadThenKill,
    KillThenDownload,
    DeleteThenDownload,
    HandOver,
}

impl UpdateStrategy {
    /// Unknown values fall back to download-then-kill.
    pub fn from_label(value: Option<&str>) -> Self {
        match value {
            Some("kill-then-download") => UpdateStrategy::KillThenDownload,
            Some("delete-then-download") => UpdateStrategy::DeleteThenDownload,
            Some("hand-over") => UpdateStrategy::HandOver,
            _ => UpdateStrategy::DownloadThenKill,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ServiceNetwork {
    pub aliases: Vec<String>,
    pub ipv4_address: Option<String>,
    pub ipv6_address: Option<String>,
    pub link_local_ips: Vec<String>,
}

impl ServiceNetwork {
    fn to_endpoint(&self) -> EndpointSettings {
        EndpointSettings {
            aliases: self.aliases.clone(),
            ipv4_address: self.ipv4_address.clone(),
            ipv6_address: self.ipv6_address.clone(),
            link_local_ips: self.link_local_ips.clone(),
        }
    }

    /// Compares only what the target sets; the engine fills in the rest.
    fn matches_target(&self, target: &ServiceNetwork) -> bool {
        let current_aliases: BTreeSet<&String> = self.aliases.iter().collect();
        let target_aliases: BTreeSet<&String> = target.aliases.iter().collect();
        if current_aliases != target_aliases {
            return false;
        }
        if target.ipv4_address.is_some() && self.ipv4_address != target.ipv4_address {
            return false;
        }
        if target.ipv6_address.is_some() && self.ipv6_address != target.ipv6_address {
            return false;
        }
        if !target.link_local_ips.is_empty() && !same_set(&self.link_local_ips, &target.link_local_ips)
        {
            return false;
        }
        true
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Healthcheck {
    pub test: Vec<String>,
    /// Nanoseconds.
    pub interval: u64,
    pub timeout: u64,
    pub start_period: u64,
    pub retries: u32,
}

/// Normalized container configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ServiceConfig {
    /// Engine image id when known, otherwise the registry name.
    pub image: String,
    pub running: bool,
    pub environment: BTreeMap<String, String>,
    pub labels: BTreeMap<String, String>,
    pub network_mode: String,
    pub networks: BTreeMap<String, ServiceNetwork>,
    pub command: Vec<String>,
    pub entrypoint: Vec<String>,
    pub hostname: String,
    pub restart: String,
    pub volumes: Vec<String>,
    pub port_maps: Vec<PortMap>,
    pub expose: Vec<String>,
    pub mem_limit: i64,
    pub mem_reservation: i64,
    pub cpu_shares: i64,
    pub cpu_quota: i64,
    /// Nano-CPUs.
    pub cpus: i64,
    pub privileged: bool,
    pub cap_add: Vec<String>,
    pub cap_drop: Vec<String>,
    pub devices: Vec<String>,
    pub dns: Vec<String>,
    pub extra_hosts: Vec<String>,
    pub healthcheck: Option<Healthcheck>,
    pub stop_signal: Option<String>,
    /// Seconds.
    pub stop_grace_period: u64,
    pub user: String,
    pub working_dir: String,
    pub tty: bool,
    pub read_only: bool,
    pub sysctls: BTreeMap<String, String>,
}

/// A configuration field that differs between two services.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServiceField {
    Image,
    Environment,
    Labels,
    NetworkMode,
    Networks,
    Command,
    Entrypoint,
    Hostname,
    Restart,
    Volumes,
    Ports,
    Expose,
    MemLimit,
    MemReservation,
    CpuShares,
    CpuQuota,
    Privileged,
    CapAdd,
    CapDrop,
    Devices,
    Dns,
    ExtraHosts,
    Healthcheck,
    StopSignal,
    StopGracePeriod,
    User,
    WorkingDir,
    Tty,
    ReadOnly,
    Sysctls,
}

impl fmt::Display for ServiceField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// A managed service: identity, status and normalized config.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Service {
    pub app_id: AppId,
    pub service_id: ServiceId,
    pub service_name: String,
    pub image_id: ImageId,
    pub release_id: ReleaseId,
    /// Registry name of the image; for inspected containers this is filled
    /// from image metadata when known.
    pub image_name: Option<String>,
    pub container_id: Option<String>,
    pub status: ServiceStatus,
    pub created_at: Option<DateTime<Utc>>,
    /// Services that must be running before this one starts.
    pub depends_on: Vec<String>,
    pub config: ServiceConfig,
}

/// Inputs to [`Service::from_target`] that are not part of the record itself.
pub struct TargetContext<'a> {
    pub app_id: AppId,
    pub app_name: &'a str,
    pub commit: Option<&'a str>,
    pub release_id: ReleaseId,
    pub service_id: ServiceId,
    /// Engine view of the image, when it is already on the device.
    pub image_info: Option<&'a ImageInspect>,
    pub device: &'a DeviceMetadata,
}

impl Service {
    /// Builds the target descriptor for one service.
    pub fn from_target(record: &TargetService, ctx: &TargetContext<'_>) -> Result<Self> {
        let invalid = |message: String| ComposeError::InvalidServiceDefinition {
            service: record.service_name.clone(),
            message,
        };
        if record.service_name.is_empty() {
            return Err(invalid("missing service name".to_string()));
        }
        if record.image.is_empty() {
            return Err(invalid("missing image".to_string()));
        }
        let image_id = record
            .image_id
            .ok_or_else(|| invalid("missing image id".to_string()))?;
        let image_config = ctx.image_info.map(|i| &i.config);
        let app_id = ctx.app_id;
        let name = record.service_name.as_str();

        // Networks and network mode
        let mut networks: BTreeMap<String, ServiceNetwork> = BTreeMap::new();
        let declared: Vec<(String, ComposeServiceNetwork)> = match &record.networks {
            None => Vec::new(),
            Some(ComposeServiceNetworks::List(names)) => names
                .iter()
                .map(|n| (n.clone(), ComposeServiceNetwork::default()))
                .collect(),
            Some(ComposeServiceNetworks::Map(map)) => map
                .iter()
                .map(|(n, settings)| (n.clone(), settings.clone().unwrap_or_default()))
                .collect(),
        };
        for (network, settings) in &declared {
            let mut aliases = settings.aliases.clone();
            if !aliases.iter().any(|a| a == name) {
                aliases.insert(0, name.to_string());
            }
            networks.insert(
                format!("{app_id}_{network}"),
                ServiceNetwork {
                    aliases,
                    ipv4_address: settings.ipv4_address.clone(),
                    ipv6_address: settings.ipv6_address.clone(),
                    link_local_ips: settings.link_local_ips.clone(),
                },
            );
        }
        let network_mode = match record.network_mode.as_deref() {
            Some(mode @ ("host" | "bridge" | "none")) => mode.to_string(),
            Some(mode) if mode.starts_with("service:") || mode.starts_with("container:") => {
                mode.to_string()
            }
            Some(mode) => format!("{app_id}_{mode}"),
            None => match declared.first() {
                Some((network, _)) => format!("{app_id}_{network}"),
                None => format!("{app_id}_default"),
            },
        };
        if is_user_network(&network_mode) {
            networks.entry(network_mode.clone()).or_insert_with(|| ServiceNetwork {
                aliases: vec![name.to_string()],
                ..ServiceNetwork::default()
            });
        }

        // Labels: identity over user labels over image labels
        let mut labels = image_config.map(|c| c.labels.clone()).unwrap_or_default();
        labels.extend(record.labels.clone());
        labels.insert(labels::SUPERVISED.to_string(), "true".to_string());
        labels.insert(labels::APP_ID.to_string(), app_id.to_string());
        labels.insert(labels::SERVICE_ID.to_string(), ctx.service_id.to_string());
        labels.insert(labels::SERVICE_NAME.to_string(), name.to_string());
        if let Some(commit) = ctx.commit {
            labels.insert(labels::COMMIT.to_string(), commit.to_string());
        }

        // Environment: user env over device env over image env
        let mut environment = image_config
            .map(|c| env_list_to_map(&c.env))
            .unwrap_or_default();
        environment.extend(default_environment(ctx, name));
        environment.extend(record.environment.clone());

        let uses_api = labels::is_truthy(&labels, labels::FEATURE_SUPERVISOR_API);
        if uses_api {
            let port = ctx.device.listen_port;
            environment.insert(
                "SKIFF_SUPERVISOR_ADDRESS".to_string(),
                format!("http://{SUPERVISOR_NETWORK_GATEWAY}:{port}"),
            );
            environment.insert(
                "SKIFF_SUPERVISOR_HOST".to_string(),
                SUPERVISOR_NETWORK_GATEWAY.to_string(),
            );
            environment.insert("SKIFF_SUPERVISOR_PORT".to_string(), port.to_string());
            if let Some(key) = &ctx.device.api_key {
                environment.insert("SKIFF_SUPERVISOR_API_KEY".to_string(), key.clone());
            }
            if network_mode != "host" {
                networks.entry(SUPERVISOR_NETWORK.to_string()).or_default();
            }
        }

        // Volumes: the lock directory, feature binds, then declared volumes
        let mut volumes = vec![lock_bind(&ctx.device.lock_dir, app_id, name)];
        volumes.extend(labels::feature_binds(&labels));
        for volume in &record.volumes {
            let Some((source, rest)) = volume.split_once(':') else {
                return Err(invalid(format!(
                    "anonymous volume '{volume}' is not supported"
                )));
            };
            if source.starts_with('/') {
                volumes.push(volume.clone());
            } else {
                volumes.push(format!("{app_id}_{source}:{rest}"));
            }
        }

        // Ports and exposed ports
        let mut port_maps = Vec::new();
        for port in &record.ports {
            let spec = port.as_string();
            let maps =
                PortMap::parse(&spec).ok_or_else(|| invalid(format!("invalid port '{spec}'")))?;
            port_maps.extend(maps);
        }
        port_maps.sort();
        port_maps.dedup();
        let mapped: BTreeSet<String> = port_maps.iter().map(PortMap::exposed_key).collect();
        let mut expose: BTreeSet<String> = record.expose.iter().map(expose_key).collect();
        if let Some(config) = image_config {
            expose.extend(config.exposed_ports.iter().cloned());
        }
        let expose = expose.into_iter().filter(|p| !mapped.contains(p)).collect();

        let memory = |value: &Option<StringOrNumber>, field: &str| -> Result<i64> {
            match value {
                Some(v) => parse_memory(v)
                    .ok_or_else(|| invalid(format!("invalid {field} '{}'", v.as_string()))),
                None => Ok(0),
            }
        };
        let duration = |value: &Option<StringOrNumber>, field: &str| -> Result<Option<u64>> {
            match value {
                Some(v) => parse_duration_nanos(v)
                    .map(Some)
                    .ok_or_else(|| invalid(format!("invalid {field} '{}'", v.as_string()))),
                None => Ok(None),
            }
        };

        let healthcheck = match &record.healthcheck {
            Some(h) if h.disable => Some(Healthcheck {
                test: vec!["NONE".to_string()],
                ..Healthcheck::default()
            }),
            Some(h) => Some(Healthcheck {
                test: match h.test.clone() {
                    Some(StringOrList::String(cmd)) => vec!["CMD-SHELL".to_string(), cmd],
                    Some(StringOrList::List(list)) => list,
                    None => Vec::new(),
                },
                interval: duration(&h.interval, "healthcheck interval")?.unwrap_or(0),
                timeout: duration(&h.timeout, "healthcheck timeout")?.unwrap_or(0),
                start_period: duration(&h.start_period, "healthcheck start_period")?.unwrap_or(0),
                retries: h.retries.unwrap_or(0),
            }),
            None => image_config
                .and_then(|c| c.healthcheck.as_ref())
                .map(healthcheck_from_engine),
        };

        let stop_grace_period = duration(&record.stop_grace_period, "stop_grace_period")?
            .map_or(DEFAULT_STOP_GRACE_SECS, |nanos| nanos / 1_000_000_000);

        let hostname = match &record.hostname {
            Some(h) => h.clone(),
            None if network_mode == "host" => ctx.device.hostname_on_host.clone(),
            None => String::new(),
        };

        let config = ServiceConfig {
            image: ctx
                .image_info
                .map_or_else(|| record.image.clone(), |i| i.id.clone()),
            running: record.running.unwrap_or(true),
            environment,
            labels,
            network_mode,
            networks,
            command: record
                .command
                .clone()
                .map_or_else(
                    || image_config.map(|c| c.cmd.clone()).unwrap_or_default(),
                    StringOrList::into_args,
                ),
            entrypoint: record
                .entrypoint
                .clone()
                .map_or_else(
                    || image_config.map(|c| c.entrypoint.clone()).unwrap_or_default(),
                    StringOrList::into_args,
                ),
            hostname,
            restart: normalize_restart(record.restart.as_deref().unwrap_or("always")),
            volumes,
            port_maps,
            expose,
            mem_limit: memory(&record.mem_limit, "mem_limit")?,
            mem_reservation: memory(&record.mem_reservation, "mem_reservation")?,
            cpu_shares: record.cpu_shares.unwrap_or(0),
            cpu_quota: record.cpu_quota.unwrap_or(0),
            cpus: record.cpus.map_or(0, |c| (c * 1e9) as i64),
            privileged: record.privileged,
            cap_add: record.cap_add.clone(),
            cap_drop: record.cap_drop.clone(),
            devices: record.devices.iter().map(|d| normalize_device(d)).collect(),
            dns: record.dns.clone().map(StringOrList::into_list).unwrap_or_default(),
            extra_hosts: record.extra_hosts.clone(),
            healthcheck,
            stop_signal: record
                .stop_signal
                .clone()
                .or_else(|| image_config.and_then(|c| c.stop_signal.clone())),
            stop_grace_period,
            user: record
                .user
                .clone()
                .or_else(|| image_config.map(|c| c.user.clone()))
                .unwrap_or_default(),
            working_dir: record
                .working_dir
                .clone()
                .or_else(|| image_config.map(|c| c.working_dir.clone()))
                .unwrap_or_default(),
            tty: record.tty,
            read_only: record.read_only,
            sysctls: record.sysctls.clone(),
        };

        Ok(Self {
            app_id,
            service_id: ctx.service_id,
            service_name: name.to_string(),
            image_id,
            release_id: ctx.release_id,
            image_name: Some(record.image.clone()),
            container_id: None,
            status: ServiceStatus::Installing,
            created_at: None,
            depends_on: record.depends_on.clone(),
            config,
        })
    }

    /// Rebuilds a descriptor from an inspected container.
    pub fn from_container(inspect: &ContainerInspect) -> Result<Self> {
        let labels = &inspect.config.labels;
        let label_id = |key: &str| -> Result<&String> {
            labels.get(key).ok_or_else(|| {
                ComposeError::InternalInconsistency(format!(
                    "container {} has no {key} label",
                    inspect.name
                ))
            })
        };
        let app_id: AppId = label_id(labels::APP_ID)?.parse()?;
        let service_id: ServiceId = label_id(labels::SERVICE_ID)?.parse()?;
        let service_name = label_id(labels::SERVICE_NAME)?.clone();
        let name = ContainerName::parse(&inspect.name)?;

        let status = match inspect.state.status.as_str() {
            _ if inspect.state.running => ServiceStatus::Running,
            "created" => ServiceStatus::Installed,
            "dead" => ServiceStatus::Dead,
            "removing" => ServiceStatus::Stopping,
            _ => ServiceStatus::Exited,
        };

        let mut hostname = inspect.config.hostname.clone();
        if hostname.len() == 12 && inspect.id.starts_with(&hostname) {
            hostname.clear();
        }

        let networks = inspect
            .networks
            .iter()
            .map(|(network, endpoint)| {
                let aliases = endpoint
                    .aliases
                    .iter()
                    .filter(|alias| !inspect.id.starts_with(alias.as_str()))
                    .cloned()
                    .collect();
                (
                    network.clone(),
                    ServiceNetwork {
                        aliases,
                        ipv4_address: endpoint.ipv4_address.clone(),
                        ipv6_address: endpoint.ipv6_address.clone(),
                        link_local_ips: endpoint.link_local_ips.clone(),
                    },
                )
            })
            .collect();

        let host = &inspect.host_config;
        let mut port_maps = PortMap::from_bindings(&host.port_bindings);
        port_maps.sort();
        let mapped: BTreeSet<String> = port_maps.iter().map(PortMap::exposed_key).collect();
        let expose = inspect
            .config
            .exposed_ports
            .iter()
            .filter(|p| !mapped.contains(*p))
            .cloned()
            .collect();

        let restart = match (host.restart_policy.name.as_str(), host.restart_policy.maximum_retry_count) {
            ("" | "no", _) => "no".to_string(),
            ("on-failure", n) if n > 0 => format!("on-failure:{n}"),
            (name, _) => name.to_string(),
        };

        Ok(Self {
            app_id,
            service_id,
            service_name,
            image_id: name.image_id,
            release_id: name.release_id,
            image_name: None,
            container_id: Some(inspect.id.clone()),
            status,
            created_at: Some(inspect.created),
            depends_on: Vec::new(),
            config: ServiceConfig {
                image: inspect.config.image.clone(),
                running: inspect.state.running,
                environment: env_list_to_map(&inspect.config.env),
                labels: labels.clone(),
                network_mode: host.network_mode.clone(),
                networks,
                command: inspect.config.cmd.clone(),
                entrypoint: inspect.config.entrypoint.clone(),
                hostname,
                restart,
                volumes: host.binds.clone(),
                port_maps,
                expose,
                mem_limit: host.memory,
                mem_reservation: host.memory_reservation,
                cpu_shares: host.cpu_shares,
                cpu_quota: host.cpu_quota,
                cpus: host.nano_cpus,
                privileged: host.privileged,
                cap_add: host.cap_add.clone(),
                cap_drop: host.cap_drop.clone(),
                devices: host.devices.clone(),
                dns: host.dns.clone(),
                extra_hosts: host.extra_hosts.clone(),
                healthcheck: inspect.config.healthcheck.as_ref().map(healthcheck_from_engine),
                stop_signal: inspect.config.stop_signal.clone(),
                stop_grace_period: inspect.config.stop_timeout.unwrap_or(DEFAULT_STOP_GRACE_SECS),
                user: inspect.config.user.clone(),
                working_dir: inspect.config.working_dir.clone(),
                tty: inspect.config.tty,
                read_only: host.readonly_rootfs,
                sysctls: host.sysctls.clone(),
            },
        })
    }

    /// Engine name of this service's container.
    pub fn container_name(&self) -> String {
        ContainerName::new(self.service_name.clone(), self.image_id, self.release_id).engine_name()
    }

    /// Engine parameters for creating this service's container. Networks
    /// other than the network mode are joined afterwards; see
    /// [`Service::extra_networks`].
    pub fn to_container_create(&self) -> ContainerCreate {
        let c = &self.config;
        let mut port_bindings: BTreeMap<String, Vec<PortBinding>> = BTreeMap::new();
        for map in &c.port_maps {
            port_bindings.entry(map.exposed_key()).or_default().push(map.binding());
        }
        let mut exposed_ports: BTreeSet<String> = c.expose.iter().cloned().collect();
        exposed_ports.extend(port_bindings.keys().cloned());

        let (restart_name, retries) = match c.restart.split_once(':') {
            Some((name, n)) => (name.to_string(), n.parse().unwrap_or(0)),
            None => (c.restart.clone(), 0),
        };

        let mut endpoints = BTreeMap::new();
        if let Some(network) = c.networks.get(&c.network_mode) {
            endpoints.insert(c.network_mode.clone(), network.to_endpoint());
        }

        ContainerCreate {
            name: self.container_name(),
            config: ContainerConfig {
                hostname: c.hostname.clone(),
                image: c.image.clone(),
                env: env_map_to_list(&c.environment),
                labels: c.labels.clone(),
                cmd: c.command.clone(),
                entrypoint: c.entrypoint.clone(),
                user: c.user.clone(),
                working_dir: c.working_dir.clone(),
                tty: c.tty,
                stop_signal: c.stop_signal.clone(),
                stop_timeout: Some(c.stop_grace_period),
                healthcheck: c.healthcheck.as_ref().map(|h| HealthConfig {
                    test: h.test.clone(),
                    interval: h.interval,
                    timeout: h.timeout,
                    start_period: h.start_period,
                    retries: h.retries,
                }),
                exposed_ports,
            },
            host_config: HostConfig {
                network_mode: c.network_mode.clone(),
                binds: c.volumes.clone(),
                port_bindings,
                privileged: c.privileged,
                cap_add: c.cap_add.clone(),
                cap_drop: c.cap_drop.clone(),
                devices: c.devices.clone(),
                memory: c.mem_limit,
                memory_reservation: c.mem_reservation,
                cpu_shares: c.cpu_shares,
                cpu_quota: c.cpu_quota,
                nano_cpus: c.cpus,
                restart_policy: RestartPolicy {
                    name: restart_name,
                    maximum_retry_count: retries,
                },
                dns: c.dns.clone(),
                extra_hosts: c.extra_hosts.clone(),
                readonly_rootfs: c.read_only,
                sysctls: c.sysctls.clone(),
            },
            endpoints,
        }
    }

    /// Networks to connect after the container is created.
    pub fn extra_networks(&self) -> Vec<(String, EndpointSettings)> {
        self.config
            .networks
            .iter()
            .filter(|(name, _)| **name != self.config.network_mode)
            .map(|(name, network)| (name.clone(), network.to_endpoint()))
            .collect()
    }

    /// Fields in which this (current) service differs from `target`.
    ///
    /// `peer_containers` maps service names of the same application to their
    /// container ids, resolving `service:<name>` network modes. Running state,
    /// container id and cpus are not compared.
    pub fn config_diff(
        &self,
        target: &Service,
        peer_containers: &BTreeMap<String, String>,
    ) -> Vec<ServiceField> {
        let (a, b) = (&self.config, &target.config);
        let mut fields = Vec::new();
        let mut check = |different: bool, field: ServiceField| {
            if different {
                fields.push(field);
            }
        };

        let target_mode = match b.network_mode.strip_prefix("service:") {
            Some(peer) => peer_containers
                .get(peer)
                .map_or_else(|| b.network_mode.clone(), |id| format!("container:{id}")),
            None => b.network_mode.clone(),
        };

        check(a.image != b.image, ServiceField::Image);
        check(a.environment != b.environment, ServiceField::Environment);
        check(
            without_commit(&a.labels) != without_commit(&b.labels),
            ServiceField::Labels,
        );
        check(a.network_mode != target_mode, ServiceField::NetworkMode);
        check(!same_networks(&a.networks, &b.networks), ServiceField::Networks);
        check(a.command != b.command, ServiceField::Command);
        check(a.entrypoint != b.entrypoint, ServiceField::Entrypoint);
        check(a.hostname != b.hostname, ServiceField::Hostname);
        check(a.restart != b.restart, ServiceField::Restart);
        check(!same_set(&a.volumes, &b.volumes), ServiceField::Volumes);
        check(!same_set(&a.port_maps, &b.port_maps), ServiceField::Ports);
        check(!same_set(&a.expose, &b.expose), ServiceField::Expose);
        check(a.mem_limit != b.mem_limit, ServiceField::MemLimit);
        check(a.mem_reservation != b.mem_reservation, ServiceField::MemReservation);
        check(a.cpu_shares != b.cpu_shares, ServiceField::CpuShares);
        check(a.cpu_quota != b.cpu_quota, ServiceField::CpuQuota);
        check(a.privileged != b.privileged, ServiceField::Privileged);
        check(!same_set(&a.cap_add, &b.cap_add), ServiceField::CapAdd);
        check(!same_set(&a.cap_drop, &b.cap_drop), ServiceField::CapDrop);
        check(!same_set(&a.devices, &b.devices), ServiceField::Devices);
        check(!same_set(&a.dns, &b.dns), ServiceField::Dns);
        check(!same_set(&a.extra_hosts, &b.extra_hosts), ServiceField::ExtraHosts);
        check(a.healthcheck != b.healthcheck, ServiceField::Healthcheck);
        check(a.stop_signal != b.stop_signal, ServiceField::StopSignal);
        check(a.stop_grace_period != b.stop_grace_period, ServiceField::StopGracePeriod);
        check(a.user != b.user, ServiceField::User);
        check(a.working_dir != b.working_dir, ServiceField::WorkingDir);
        check(a.tty != b.tty, ServiceField::Tty);
        check(a.read_only != b.read_only, ServiceField::ReadOnly);
        check(a.sysctls != b.sysctls, ServiceField::Sysctls);
        fields
    }

    pub fn is_equal_config(&self, target: &Service, peers: &BTreeMap<String, String>) -> bool {
        self.config_diff(target, peers).is_empty()
    }

    pub fn is_equal_except_running(&self, target: &Service, peers: &BTreeMap<String, String>) -> bool {
        self.is_equal_config(target, peers)
            && self.release_id == target.release_id
            && self.image_id == target.image_id
    }

    pub fn is_equal(&self, target: &Service, peers: &BTreeMap<String, String>) -> bool {
        self.is_equal_except_running(target, peers) && self.config.running == target.config.running
    }

    pub fn update_strategy(&self) -> UpdateStrategy {
        UpdateStrategy::from_label(self.config.labels.get(labels::UPDATE_STRATEGY).map(String::as_str))
    }

    pub fn handover_timeout(&self) -> Duration {
        check_int(
            self.config.labels.get(labels::HANDOVER_TIMEOUT).map(String::as_str),
            false,
        )
        .map_or(DEFAULT_HANDOVER_TIMEOUT, Duration::from_millis)
    }

    /// Containers predating the lock convention skip the update lock.
    pub fn is_legacy(&self) -> bool {
        labels::is_truthy(&self.config.labels, labels::LEGACY_CONTAINER)
    }

    pub fn uses_supervisor_api(&self) -> bool {
        labels::is_truthy(&self.config.labels, labels::FEATURE_SUPERVISOR_API)
    }

    pub fn is_optional(&self) -> bool {
        labels::is_truthy(&self.config.labels, labels::OPTIONAL)
    }

    /// App-level names of the named volumes this service mounts.
    pub fn named_volumes(&self) -> Vec<String> {
        let prefix = format!("{}_", self.app_id);
        self.config
            .volumes
            .iter()
            .filter_map(|bind| {
                let (source, _) = bind.split_once(':')?;
                source.strip_prefix(&prefix).map(String::from)
            })
            .collect()
    }

    /// Engine names of the app networks this service joins.
    pub fn uses_network(&self, engine_name: &str) -> bool {
        self.config.networks.contains_key(engine_name) || self.config.network_mode == engine_name
    }

    /// Host directory shared with the container for lock and handover files.
    pub fn lock_dir(&self, root: &Path) -> PathBuf {
        root.join(self.app_id.to_string()).join(&self.service_name)
    }

    pub fn handover_complete_path(&self, root: &Path) -> PathBuf {
        self.lock_dir(root).join("handover-complete")
    }

    /// The image this service runs, with its application metadata.
    pub fn image(&self) -> Image {
        Image {
            name: self
                .image_name
                .clone()
                .unwrap_or_else(|| self.config.image.clone()),
            app_id: self.app_id,
            service_id: self.service_id,
            service_name: self.service_name.clone(),
            image_id: self.image_id,
            release_id: self.release_id,
            dependent: false,
            docker_image_id: self
                .config
                .image
                .starts_with("sha256:")
                .then(|| self.config.image.clone()),
        }
    }
}

fn default_environment(ctx: &TargetContext<'_>, service_name: &str) -> BTreeMap<String, String> {
    let device = ctx.device;
    let mut env = BTreeMap::new();
    let mut put = |k: &str, v: String| {
        env.insert(k.to_string(), v);
    };
    put("SKIFF", "1".to_string());
    put("SKIFF_APP_ID", ctx.app_id.to_string());
    put("SKIFF_APP_NAME", ctx.app_name.to_string());
    put("SKIFF_SERVICE_NAME", service_name.to_string());
    put("SKIFF_DEVICE_UUID", device.uuid.clone());
    put("SKIFF_DEVICE_TYPE", device.device_type.clone());
    put("SKIFF_DEVICE_ARCH", device.device_arch.clone());
    put("SKIFF_HOST_OS_VERSION", device.os_version.clone());
    put("SKIFF_SUPERVISOR_VERSION", device.agent_version.clone());
    put("SKIFF_APP_LOCK_PATH", format!("{LOCK_MOUNT}/updates.lock"));
    put(
        "SKIFF_SERVICE_HANDOVER_COMPLETE_PATH",
        format!("{LOCK_MOUNT}/handover-complete"),
    );
    put("USER", "root".to_string());
    env
}

fn lock_bind(root: &Path, app_id: AppId, service_name: &str) -> String {
    format!(
        "{}:{LOCK_MOUNT}",
        root.join(app_id.to_string()).join(service_name).display()
    )
}

fn is_user_network(mode: &str) -> bool {
    !matches!(mode, "host" | "bridge" | "none")
        && !mode.starts_with("service:")
        && !mode.starts_with("container:")
}

fn normalize_restart(policy: &str) -> String {
    match policy {
        "" | "no" => "no".to_string(),
        "on-failure:0" => "on-failure".to_string(),
        other => other.to_string(),
    }
}

/// `/dev/x` becomes `/dev/x:/dev/x:rwm`; `/dev/x:/dev/y` gains `rwm`.
fn normalize_device(device: &str) -> String {
    let parts: Vec<&str> = device.split(':').collect();
    match parts.as_slice() {
        [host] => format!("{host}:{host}:rwm"),
        [host, container] => format!("{host}:{container}:rwm"),
        _ => device.to_string(),
    }
}

fn healthcheck_from_engine(h: &HealthConfig) -> Healthcheck {
    Healthcheck {
        test: h.test.clone(),
        interval: h.interval,
        timeout: h.timeout,
        start_period: h.start_period,
        retries: h.retries,
    }
}

fn without_commit(labels: &BTreeMap<String, String>) -> BTreeMap<&String, &String> {
    labels.iter().filter(|(k, _)| *k != labels::COMMIT).collect()
}

fn same_set<T: Ord>(a: &[T], b: &[T]) -> bool {
    let a: BTreeSet<&T> = a.iter().collect();
    let b: BTreeSet<&T> = b.iter().collect();
    a == b
}

fn same_networks(
    current: &BTreeMap<String, ServiceNetwork>,
    target: &BTreeMap<String, ServiceNetwork>,
) -> bool {
    current.len() == target.len()
        && target.iter().all(|(name, target_network)| {
            current
                .get(name)
                .is_some_and(|network| network.matches_target(target_network))
        })
}
