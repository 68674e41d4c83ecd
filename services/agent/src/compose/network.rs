//! Network descriptor.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use skiff_id::{AppId, IdError, ScopedName};

use crate::compose::labels;
use crate::engine::{Ipam, IpamPool, NetworkCreate, NetworkInspect};
use crate::error::{ComposeError, Result};

/// Network section of a target application.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ComposeNetwork {
    pub driver: Option<String>,
    pub driver_opts: BTreeMap<String, String>,
    pub ipam: Option<ComposeIpam>,
    pub enable_ipv6: bool,
    pub internal: bool,
    pub labels: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ComposeIpam {
    pub driver: Option<String>,
    pub config: Vec<ComposeIpamPool>,
    pub options: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ComposeIpamPool {
    pub subnet: Option<String>,
    pub gateway: Option<String>,
    pub ip_range: Option<String>,
    pub aux_addresses: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IpamEntry {
    pub subnet: String,
    pub gateway: String,
    pub ip_range: Option<String>,
    pub aux_addresses: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NetworkIpam {
    pub driver: String,
    pub config: Vec<IpamEntry>,
    pub options: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NetworkConfig {
    pub driver: String,
    pub ipam: NetworkIpam,
    pub enable_ipv6: bool,
    pub internal: bool,
    /// User labels; the supervision marker is not part of the config.
    pub labels: BTreeMap<String, String>,
    pub options: BTreeMap<String, String>,
}

/// A configuration field in which two networks differ.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkField {
    Driver,
    IpamDriver,
    IpamConfig,
    IpamOptions,
    EnableIpv6,
    Internal,
    Labels,
    Options,
}

impl fmt::Display for NetworkField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NetworkField::Driver => "driver",
            NetworkField::IpamDriver => "ipam.driver",
            NetworkField::IpamConfig => "ipam.config",
            NetworkField::IpamOptions => "ipam.options",
            NetworkField::EnableIpv6 => "enable_ipv6",
            NetworkField::Internal => "internal",
            NetworkField::Labels => "labels",
            NetworkField::Options => "options",
        };
        f.write_str(s)
    }
}

/// An application-scoped network.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Network {
    pub app_id: AppId,
    pub name: String,
    pub config: NetworkConfig,
}

impl Network {
    /// Builds a network from its target declaration.
    ///
    /// Every IPAM pool must declare both a subnet and a gateway.
    pub fn from_target(app_id: AppId, name: &str, compose: &ComposeNetwork) -> Result<Self> {
        let ipam = compose.ipam.clone().unwrap_or_default();
        let config = ipam
            .config
            .iter()
            .map(|pool| match (&pool.subnet, &pool.gateway) {
                (Some(subnet), Some(gateway)) => Ok(IpamEntry {
                    subnet: subnet.clone(),
                    gateway: gateway.clone(),
                    ip_range: pool.ip_range.clone(),
                    aux_addresses: pool.aux_addresses.clone(),
                }),
                _ => Err(ComposeError::InvalidNetworkConfiguration(format!(
                    "network {name}: every IPAM config entry must specify both a subnet and a gateway"
                ))),
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            app_id,
            name: name.to_string(),
            config: NetworkConfig {
                driver: compose.driver.clone().unwrap_or_else(|| "bridge".to_string()),
                ipam: NetworkIpam {
                    driver: ipam.driver.unwrap_or_else(|| "default".to_string()),
                    config,
                    options: ipam.options,
                },
                enable_ipv6: compose.enable_ipv6,
                internal: compose.internal,
                labels: labels::without_supervised(&compose.labels),
                options: compose.driver_opts.clone(),
            },
        })
    }

    /// Builds a network from an engine listing. The name must be app-scoped.
    pub fn from_engine(inspect: &NetworkInspect) -> Result<Self> {
        let scoped = ScopedName::parse(&inspect.name).map_err(|e| match e {
            IdError::Zero { .. } => ComposeError::InvalidAppId(inspect.name.clone()),
            _ => ComposeError::InvalidNetworkName(inspect.name.clone()),
        })?;

        let config = inspect
            .ipam
            .config
            .iter()
            .filter_map(|pool| {
                Some(IpamEntry {
                    subnet: pool.subnet.clone()?,
                    gateway: pool.gateway.clone()?,
                    ip_range: pool.ip_range.clone(),
                    aux_addresses: pool.aux_addresses.clone(),
                })
            })
            .collect();

        Ok(Self {
            app_id: scoped.app_id,
            name: scoped.name,
            config: NetworkConfig {
                driver: inspect.driver.clone(),
                ipam: NetworkIpam {
                    driver: if inspect.ipam.driver.is_empty() {
                        "default".to_string()
                    } else {
                        inspect.ipam.driver.clone()
                    },
                    config,
                    options: inspect.ipam.options.clone(),
                },
                enable_ipv6: inspect.enable_ipv6,
                internal: inspect.internal,
                labels: labels::without_supervised(&inspect.labels),
                options: inspect.options.clone(),
            },
        })
    }

    pub fn engine_name(&self) -> String {
        ScopedName::new(self.app_id, self.name.clone()).engine_name()
    }

    pub fn to_create(&self) -> NetworkCreate {
        let mut labels = self.config.labels.clone();
        labels.insert(labels::SUPERVISED.to_string(), "true".to_string());
        NetworkCreate {
            name: self.engine_name(),
            driver: self.config.driver.clone(),
            ipam: Ipam {
                driver: self.config.ipam.driver.clone(),
                config: self
                    .config
                    .ipam
                    .config
                    .iter()
                    .map(|entry| IpamPool {
                        subnet: Some(entry.subnet.clone()),
                        gateway: Some(entry.gateway.clone()),
                        ip_range: entry.ip_range.clone(),
                        aux_addresses: entry.aux_addresses.clone(),
                    })
                    .collect(),
                options: self.config.ipam.options.clone(),
            },
            enable_ipv6: self.config.enable_ipv6,
            internal: self.config.internal,
            attachable: false,
            options: self.config.options.clone(),
            labels,
        }
    }

    /// Fields in which `self` differs from `target`. IPAM pools populated by
    /// the engine are ignored when the target declares none.
    pub fn diff(&self, target: &Network) -> Vec<NetworkField> {
        let (a, b) = (&self.config, &target.config);
        let mut fields = Vec::new();
        if a.driver != b.driver {
            fields.push(NetworkField::Driver);
        }
        if a.ipam.driver != b.ipam.driver {
            fields.push(NetworkField::IpamDriver);
        }
        if !b.ipam.config.is_empty() && a.ipam.config != b.ipam.config {
            fields.push(NetworkField::IpamConfig);
        }
        if a.ipam.options != b.ipam.options {
            fields.push(NetworkField::IpamOptions);
        }
        if a.enable_ipv6 != b.enable_ipv6 {
            fields.push(NetworkField::EnableIpv6);
        }
        if a.internal != b.internal {
            fields.push(NetworkField::Internal);
        }
        if a.labels != b.labels {
            fields.push(NetworkField::Labels);
        }
        if a.options != b.options {
            fields.push(NetworkField::Options);
        }
        fields
    }

    pub fn is_equal_config(&self, target: &Network) -> bool {
        self.diff(target).is_empty()
    }
}
