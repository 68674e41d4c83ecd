//! Label keys understood by the agent.

use std::collections::BTreeMap;

use crate::validation::check_truthy;

pub const SUPERVISED: &str = "io.skiff.supervised";
pub const APP_ID: &str = "io.skiff.app-id";
pub const SERVICE_ID: &str = "io.skiff.service-id";
pub const SERVICE_NAME: &str = "io.skiff.service-name";
/// Release commit; informational, excluded from config comparison.
pub const COMMIT: &str = "io.skiff.commit";

pub const UPDATE_STRATEGY: &str = "io.skiff.update.strategy";
pub const HANDOVER_TIMEOUT: &str = "io.skiff.update.handover-timeout";
pub const LEGACY_CONTAINER: &str = "io.skiff.legacy-container";
pub const OPTIONAL: &str = "io.skiff.features.optional";

pub const FEATURE_SUPERVISOR_API: &str = "io.skiff.features.supervisor-api";
pub const FEATURE_ENGINE_SOCKET: &str = "io.skiff.features.engine-socket";
pub const FEATURE_DBUS: &str = "io.skiff.features.dbus";
pub const FEATURE_KERNEL_MODULES: &str = "io.skiff.features.kernel-modules";
pub const FEATURE_FIRMWARE: &str = "io.skiff.features.firmware";
pub const FEATURE_JOURNAL_LOGS: &str = "io.skiff.features.journal-logs";
pub const FEATURE_SYSFS: &str = "io.skiff.features.sysfs";
pub const FEATURE_PROCFS: &str = "io.skiff.features.procfs";

/// Host binds contributed by each feature label.
const FEATURE_BINDS: &[(&str, &[&str])] = &[
    (
        FEATURE_ENGINE_SOCKET,
        &["/var/run/balena-engine.sock:/var/run/balena-engine.sock"],
    ),
    (
        FEATURE_DBUS,
        &["/run/dbus:/host/run/dbus"],
    ),
    (FEATURE_KERNEL_MODULES, &["/lib/modules:/lib/modules"]),
    (FEATURE_FIRMWARE, &["/lib/firmware:/lib/firmware"]),
    (
        FEATURE_JOURNAL_LOGS,
        &["/var/log/journal:/var/log/journal:ro", "/run/log/journal:/run/log/journal:ro"],
    ),
    (FEATURE_SYSFS, &["/sys:/sys"]),
    (FEATURE_PROCFS, &["/proc:/proc"]),
];

pub fn is_truthy(labels: &BTreeMap<String, String>, key: &str) -> bool {
    check_truthy(labels.get(key).map(String::as_str))
}

/// Binds implied by the feature labels that are switched on.
pub fn feature_binds(labels: &BTreeMap<String, String>) -> Vec<String> {
    FEATURE_BINDS
        .iter()
        .filter(|(label, _)| is_truthy(labels, label))
        .flat_map(|(_, binds)| binds.iter().map(|b| (*b).to_string()))
        .collect()
}

/// Labels with the supervision markers removed, for config comparison.
pub fn without_supervised(labels: &BTreeMap<String, String>) -> BTreeMap<String, String> {
    labels
        .iter()
        .filter(|(k, _)| k.as_str() != SUPERVISED)
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}
