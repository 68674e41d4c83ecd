//! Volume descriptor.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use skiff_id::{AppId, ScopedName};

use crate::compose::labels;
use crate::engine::{VolumeCreate, VolumeInspect};
use crate::error::{ComposeError, Result};

/// Volume section of a target application.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ComposeVolume {
    pub driver: Option<String>,
    pub driver_opts: BTreeMap<String, String>,
    pub labels: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VolumeConfig {
    pub driver: String,
    pub driver_opts: BTreeMap<String, String>,
    pub labels: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VolumeField {
    Driver,
    DriverOpts,
    Labels,
}

impl fmt::Display for VolumeField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            VolumeField::Driver => "driver",
            VolumeField::DriverOpts => "driver_opts",
            VolumeField::Labels => "labels",
        })
    }
}

/// An application-scoped named volume.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Volume {
    pub app_id: AppId,
    pub name: String,
    pub config: VolumeConfig,
}

impl Volume {
    pub fn from_target(app_id: AppId, name: &str, compose: &ComposeVolume) -> Self {
        Self {
            app_id,
            name: name.to_string(),
            config: VolumeConfig {
                driver: compose.driver.clone().unwrap_or_else(|| "local".to_string()),
                driver_opts: compose.driver_opts.clone(),
                labels: labels::without_supervised(&compose.labels),
            },
        }
    }

    pub fn from_engine(inspect: &VolumeInspect) -> Result<Self> {
        let scoped = ScopedName::parse(&inspect.name)
            .map_err(|_| ComposeError::InvalidVolumeName(inspect.name.clone()))?;
        Ok(Self {
            app_id: scoped.app_id,
            name: scoped.name,
            config: VolumeConfig {
                driver: inspect.driver.clone(),
                driver_opts: inspect.options.clone(),
                labels: labels::without_supervised(&inspect.labels),
            },
        })
    }

    pub fn engine_name(&self) -> String {
        ScopedName::new(self.app_id, self.name.clone()).engine_name()
    }

    pub fn to_create(&self) -> VolumeCreate {
        let mut labels = self.config.labels.clone();
        labels.insert(labels::SUPERVISED.to_string(), "true".to_string());
        VolumeCreate {
            name: self.engine_name(),
            driver: self.config.driver.clone(),
            driver_opts: self.config.driver_opts.clone(),
            labels,
        }
    }

    pub fn diff(&self, target: &Volume) -> Vec<VolumeField> {
        let mut fields = Vec::new();
        if self.config.driver != target.config.driver {
            fields.push(VolumeField::Driver);
        }
        if self.config.driver_opts != target.config.driver_opts {
            fields.push(VolumeField::DriverOpts);
        }
        if self.config.labels != target.config.labels {
            fields.push(VolumeField::Labels);
        }
        fields
    }

    pub fn is_equal_config(&self, target: &Volume) -> bool {
        self.diff(target).is_empty()
    }
}
