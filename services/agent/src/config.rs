//! Configuration for the device agent.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use skiff_reconcile::DEFAULT_BACKOFF_INCREMENT;

use crate::validation::{check_int, check_truthy};

/// Device agent configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Device identifier reported to the fleet and injected into containers.
    pub uuid: String,

    /// Fleet API endpoint, also the registry credential server.
    pub api_endpoint: String,

    /// Key used for registry and delta server authentication.
    pub device_api_key: Option<String>,

    /// Delta server endpoint.
    pub delta_endpoint: String,

    /// Whether delta transfer is enabled.
    pub delta: bool,
    pub delta_request_timeout: Duration,
    pub delta_apply_timeout: Option<Duration>,
    pub delta_retry_count: u32,
    pub delta_retry_interval: Duration,
    pub delta_version: u32,

    /// Ceiling for fetch backoff and the target poll period.
    pub app_update_poll_interval: Duration,

    /// Base step of fetch backoff.
    pub backoff_increment: Duration,

    /// Maximum concurrent delta downloads.
    pub max_delta_downloads: usize,

    /// Local mode skips image bookkeeping and download limits.
    pub local_mode: bool,

    /// Treat every lock-requiring step as forced.
    pub lock_override: bool,

    /// Host directory holding per-service lock and handover files.
    pub lock_dir: PathBuf,

    /// How long to wait for a contended in-process update lock.
    pub lock_timeout: Duration,

    // Device metadata
    pub device_type: String,
    pub device_arch: String,
    pub os_version: String,
    pub device_name: String,
    pub hostname_on_host: String,
    pub listen_port: u16,

    /// Sleep between passes made only of noop steps.
    pub noop_interval: Duration,

    /// Target description to apply, when running as a standalone agent.
    pub target_file: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            uuid: "0000000000000000000000000000000".to_string(),
            api_endpoint: "https://api.balena-cloud.com".to_string(),
            device_api_key: None,
            delta_endpoint: "https://delta.balena-cloud.com".to_string(),
            delta: false,
            delta_request_timeout: Duration::from_secs(30),
            delta_apply_timeout: None,
            delta_retry_count: 30,
            delta_retry_interval: Duration::from_secs(10),
            delta_version: 3,
            app_update_poll_interval: Duration::from_secs(900),
            backoff_increment: DEFAULT_BACKOFF_INCREMENT,
            max_delta_downloads: 3,
            local_mode: false,
            lock_override: false,
            lock_dir: PathBuf::from("/tmp/skiff/services"),
            lock_timeout: Duration::from_secs(10),
            device_type: "raspberrypi3".to_string(),
            device_arch: "armv7".to_string(),
            os_version: "2.72.1".to_string(),
            device_name: "skiff".to_string(),
            hostname_on_host: "skiff".to_string(),
            listen_port: 48484,
            noop_interval: Duration::from_secs(1),
            target_file: None,
            log_level: "info".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from an arbitrary key lookup, falling back to
    /// defaults for anything unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = Self::default();
        let get = |key: &str| lookup(&format!("SKIFF_{key}"));
        let flag = |key: &str, default: bool| match get(key) {
            Some(value) => check_truthy(Some(&value)),
            None => default,
        };
        let millis = |key: &str, default: Duration| -> Result<Duration> {
            match get(key) {
                Some(value) => check_int(Some(&value), true)
                    .map(Duration::from_millis)
                    .with_context(|| format!("SKIFF_{key} must be a number of milliseconds")),
                None => Ok(default),
            }
        };
        let int = |key: &str, default: u64| -> Result<u64> {
            match get(key) {
                Some(value) => check_int(Some(&value), false)
                    .with_context(|| format!("SKIFF_{key} must be a positive integer")),
                None => Ok(default),
            }
        };

        let delta_apply_timeout = match get("DELTA_APPLY_TIMEOUT") {
            Some(value) => Some(Duration::from_millis(
                check_int(Some(&value), true)
                    .context("SKIFF_DELTA_APPLY_TIMEOUT must be a number of milliseconds")?,
            )),
            None => defaults.delta_apply_timeout,
        };

        let listen_port = u16::try_from(int("LISTEN_PORT", u64::from(defaults.listen_port))?)
            .context("SKIFF_LISTEN_PORT must fit in 16 bits")?;

        Ok(Self {
            uuid: get("UUID").unwrap_or(defaults.uuid),
            api_endpoint: get("API_ENDPOINT").unwrap_or(defaults.api_endpoint),
            device_api_key: get("DEVICE_API_KEY").or(defaults.device_api_key),
            delta_endpoint: get("DELTA_ENDPOINT").unwrap_or(defaults.delta_endpoint),
            delta: flag("DELTA", defaults.delta),
            delta_request_timeout: millis("DELTA_REQUEST_TIMEOUT", defaults.delta_request_timeout)?,
            delta_apply_timeout,
            delta_retry_count: u32::try_from(int(
                "DELTA_RETRY_COUNT",
                u64::from(defaults.delta_retry_count),
            )?)?,
            delta_retry_interval: millis("DELTA_RETRY_INTERVAL", defaults.delta_retry_interval)?,
            delta_version: u32::try_from(int("DELTA_VERSION", u64::from(defaults.delta_version))?)?,
            app_update_poll_interval: millis(
                "APP_UPDATE_POLL_INTERVAL",
                defaults.app_update_poll_interval,
            )?,
            backoff_increment: millis("BACKOFF_INCREMENT", defaults.backoff_increment)?,
            max_delta_downloads: usize::try_from(int(
                "MAX_DELTA_DOWNLOADS",
                defaults.max_delta_downloads as u64,
            )?)?,
            local_mode: flag("LOCAL_MODE", defaults.local_mode),
            lock_override: flag("LOCK_OVERRIDE", defaults.lock_override),
            lock_dir: get("LOCK_DIR").map(PathBuf::from).unwrap_or(defaults.lock_dir),
            lock_timeout: millis("LOCK_TIMEOUT", defaults.lock_timeout)?,
            device_type: get("DEVICE_TYPE").unwrap_or(defaults.device_type),
            device_arch: get("DEVICE_ARCH").unwrap_or(defaults.device_arch),
            os_version: get("OS_VERSION").unwrap_or(defaults.os_version),
            device_name: get("DEVICE_NAME").unwrap_or(defaults.device_name),
            hostname_on_host: get("HOSTNAME_ON_HOST").unwrap_or(defaults.hostname_on_host),
            listen_port,
            noop_interval: millis("NOOP_INTERVAL", defaults.noop_interval)?,
            target_file: get("TARGET_FILE").map(PathBuf::from),
            log_level: get("LOG_LEVEL").unwrap_or(defaults.log_level),
        })
    }

    /// Options handed to the image fetch subsystem.
    pub fn fetch_options(&self) -> FetchOptions {
        FetchOptions {
            delta: self.delta,
            delta_endpoint: self.delta_endpoint.clone(),
            delta_request_timeout: self.delta_request_timeout,
            delta_apply_timeout: self.delta_apply_timeout,
            delta_retry_count: self.delta_retry_count,
            delta_retry_interval: self.delta_retry_interval,
            delta_version: self.delta_version,
            registry_server: self.api_endpoint.clone(),
            uuid: self.uuid.clone(),
            api_key: self.device_api_key.clone(),
        }
    }

    /// Device facts injected into every service.
    pub fn device_metadata(&self) -> DeviceMetadata {
        DeviceMetadata {
            uuid: self.uuid.clone(),
            device_type: self.device_type.clone(),
            device_arch: self.device_arch.clone(),
            os_version: self.os_version.clone(),
            agent_version: env!("CARGO_PKG_VERSION").to_string(),
            hostname_on_host: self.hostname_on_host.clone(),
            listen_port: self.listen_port,
            api_key: self.device_api_key.clone(),
            lock_dir: self.lock_dir.clone(),
        }
    }
}

/// Fully resolved fetch options for one fetch step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchOptions {
    pub delta: bool,
    pub delta_endpoint: String,
    pub delta_request_timeout: Duration,
    pub delta_apply_timeout: Option<Duration>,
    pub delta_retry_count: u32,
    pub delta_retry_interval: Duration,
    pub delta_version: u32,
    pub registry_server: String,
    pub uuid: String,
    pub api_key: Option<String>,
}

/// Facts about this device used when building service descriptors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceMetadata {
    pub uuid: String,
    pub device_type: String,
    pub device_arch: String,
    pub os_version: String,
    pub agent_version: String,
    pub hostname_on_host: String,
    pub listen_port: u16,
    pub api_key: Option<String>,
    pub lock_dir: PathBuf,
}

impl Default for DeviceMetadata {
    fn default() -> Self {
        Config::default().device_metadata()
    }
}
