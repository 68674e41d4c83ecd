//! Error taxonomy for the reconciliation engine.

use std::collections::BTreeMap;
use std::time::Duration;

use skiff_id::{AppId, IdError};
use thiserror::Error;

use crate::engine::EngineError;

/// Errors raised while building descriptors, computing steps or executing them.
#[derive(Debug, Error)]
pub enum ComposeError {
    // =========================================================================
    // Invalid input
    // =========================================================================
    #[error("invalid network name: {0}")]
    InvalidNetworkName(String),

    #[error("invalid network configuration: {0}")]
    InvalidNetworkConfiguration(String),

    #[error("invalid volume name: {0}")]
    InvalidVolumeName(String),

    #[error("invalid app id: {0}")]
    InvalidAppId(String),

    #[error("invalid definition for service {service}: {message}")]
    InvalidServiceDefinition { service: String, message: String },

    #[error("unknown step action: {0}")]
    UnknownAction(String),

    #[error("internal inconsistency: {0}")]
    InternalInconsistency(String),

    // =========================================================================
    // Deferred work
    // =========================================================================
    #[error("backing off download of {image} for another {remaining:?}")]
    DownloadBackoff { image: String, remaining: Duration },

    #[error("delta for {0} is still being processed upstream")]
    DeltaStillProcessing(String),

    // =========================================================================
    // Target rejected
    // =========================================================================
    #[error("target contracts not met for {}", format_violations(.apps))]
    ContractViolation { apps: BTreeMap<String, Vec<String>> },

    // =========================================================================
    // Concurrency
    // =========================================================================
    #[error("updates are locked for app {app_id}")]
    UpdatesLocked { app_id: AppId },

    #[error("an update is already in progress")]
    UpdateInProgress,

    #[error("update cancelled")]
    Cancelled,

    // =========================================================================
    // Engine
    // =========================================================================
    #[error("refusing to recreate existing {kind} {name} with a different configuration")]
    ResourceRecreationAttempt { kind: &'static str, name: String },

    #[error("engine error: {0}")]
    Engine(#[from] EngineError),

    #[error(transparent)]
    Id(#[from] IdError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

fn format_violations(apps: &BTreeMap<String, Vec<String>>) -> String {
    apps.iter()
        .map(|(app, services)| format!("{app} ({})", services.join(", ")))
        .collect::<Vec<_>>()
        .join("; ")
}

impl ComposeError {
    /// Download deferred by backoff; not a new failure.
    pub fn is_backoff(&self) -> bool {
        matches!(self, ComposeError::DownloadBackoff { .. })
    }

    /// Errors the next convergence pass would naturally retry.
    pub fn is_transient(&self) -> bool {
        match self {
            ComposeError::Engine(e) => e.is_transient(),
            ComposeError::DownloadBackoff { .. }
            | ComposeError::DeltaStillProcessing(_)
            | ComposeError::UpdatesLocked { .. } => true,
            _ => false,
        }
    }

    /// Remaining backoff, for [`ComposeError::DownloadBackoff`].
    pub fn backoff_remaining(&self) -> Option<Duration> {
        match self {
            ComposeError::DownloadBackoff { remaining, .. } => Some(*remaining),
            _ => None,
        }
    }
}

pub type Result<T, E = ComposeError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_contract_violation_message() {
        let mut apps = BTreeMap::new();
        apps.insert("kiosk".to_string(), vec!["gpu".to_string(), "ui".to_string()]);
        let err = ComposeError::ContractViolation { apps };
        assert_eq!(
            err.to_string(),
            "target contracts not met for kiosk (gpu, ui)"
        );
    }

    #[test]
    fn test_classification() {
        let backoff = ComposeError::DownloadBackoff {
            image: "app:1".to_string(),
            remaining: Duration::from_secs(2),
        };
        assert!(backoff.is_backoff());
        assert!(backoff.is_transient());
        assert_eq!(backoff.backoff_remaining(), Some(Duration::from_secs(2)));

        let timeout = ComposeError::from(EngineError::Timeout("inspect".to_string()));
        assert!(timeout.is_transient());
        assert!(!timeout.is_backoff());

        let invalid = ComposeError::InvalidNetworkName("bridge".to_string());
        assert!(!invalid.is_transient());
    }
}
