//! Declarative target records, as read from the target source.

use std::collections::BTreeMap;

use serde::Deserialize;
use skiff_id::{AppId, ReleaseId, ServiceId};

use crate::compose::network::ComposeNetwork;
pub use crate::compose::service::TargetService;
use crate::compose::volume::ComposeVolume;

/// Target state: every application the device should run.
pub type TargetState = BTreeMap<AppId, TargetApp>;

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct TargetApp {
    pub name: String,
    pub commit: Option<String>,
    #[serde(alias = "releaseId")]
    pub release_id: Option<ReleaseId>,
    pub services: BTreeMap<ServiceId, TargetService>,
    pub networks: BTreeMap<String, ComposeNetwork>,
    pub volumes: BTreeMap<String, ComposeVolume>,
}

/// Parses a target state document.
pub fn parse_target(json: &str) -> serde_json::Result<TargetState> {
    serde_json::from_str(json)
}
