//! Service requirement contracts.
//!
//! A contract lists what a service needs from the device: version ranges for
//! the agent and host OS, and exact device-type or architecture slugs.
//! Applications with an unmet mandatory service are rejected before they
//! reach the diff; unmet optional services are dropped from the target.

use std::collections::BTreeMap;

use semver::{Version, VersionReq};
use serde::Deserialize;
use skiff_id::AppId;
use tracing::{info, warn};

use crate::compose::labels;
use crate::compose::target::{TargetApp, TargetState};
use crate::config::DeviceMetadata;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum RequirementKind {
    #[serde(rename = "sw.supervisor")]
    Agent,
    #[serde(rename = "sw.os")]
    Os,
    #[serde(rename = "hw.device-type")]
    DeviceType,
    #[serde(rename = "arch.sw")]
    Arch,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Requirement {
    #[serde(rename = "type")]
    pub kind: RequirementKind,
    #[serde(default)]
    pub slug: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Contract {
    pub requires: Vec<Requirement>,
}

impl Requirement {
    fn is_met(&self, device: &DeviceMetadata) -> bool {
        match self.kind {
            RequirementKind::Agent => version_matches(self.version.as_deref(), &device.agent_version),
            RequirementKind::Os => version_matches(self.version.as_deref(), &device.os_version),
            RequirementKind::DeviceType => self.slug.as_deref() == Some(device.device_type.as_str()),
            RequirementKind::Arch => self.slug.as_deref() == Some(device.device_arch.as_str()),
        }
    }
}

impl Contract {
    pub fn is_met(&self, device: &DeviceMetadata) -> bool {
        self.requires.iter().all(|r| r.is_met(device))
    }
}

fn version_matches(range: Option<&str>, actual: &str) -> bool {
    let Some(range) = range else {
        return true;
    };
    let (Ok(req), Ok(version)) = (VersionReq::parse(range), Version::parse(actual)) else {
        warn!(range, actual, "Unparsable version in contract");
        return false;
    };
    req.matches(&version)
}

/// Target state after contract evaluation.
#[derive(Debug, Default)]
pub struct ContractOutcome {
    /// Apps that may be diffed, with unmet optional services removed.
    pub accepted: TargetState,
    /// Rejected app ids mapped to `(app name, unmet service names)`.
    pub rejected: BTreeMap<AppId, (String, Vec<String>)>,
    /// Optional services dropped from accepted apps, as `(app id, service name)`.
    pub skipped: Vec<(AppId, String)>,
}

impl ContractOutcome {
    /// Violations keyed by app name, for error reporting.
    pub fn violations(&self) -> BTreeMap<String, Vec<String>> {
        self.rejected.values().cloned().collect()
    }
}

pub fn evaluate(target: &TargetState, device: &DeviceMetadata) -> ContractOutcome {
    let mut outcome = ContractOutcome::default();
    for (app_id, app) in target {
        let mut accepted = TargetApp {
            services: BTreeMap::new(),
            ..app.clone()
        };
        let mut unmet = Vec::new();
        for (service_id, service) in &app.services {
            let met = service.contract.as_ref().map_or(true, |c| c.is_met(device));
            if met {
                accepted.services.insert(*service_id, service.clone());
            } else if labels::is_truthy(&service.labels, labels::OPTIONAL) {
                info!(
                    app_id = %app_id,
                    service = %service.service_name,
                    "Skipping optional service with unmet contract"
                );
                outcome.skipped.push((*app_id, service.service_name.clone()));
            } else {
                unmet.push(service.service_name.clone());
            }
        }
        if unmet.is_empty() {
            outcome.accepted.insert(*app_id, accepted);
        } else {
            outcome.rejected.insert(*app_id, (app.name.clone(), unmet));
        }
    }
    outcome
}
