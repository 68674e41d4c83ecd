//! Composition steps.
//!
//! A step is one typed unit of reconciliation work. Each variant carries only
//! the data its execution needs, with options fully populated when the step is
//! built. Steps are produced by the diff and consumed once by the executor.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde_json::Value;
use skiff_id::AppId;

use crate::compose::{Image, Network, Service, Volume};
use crate::error::ComposeError;

/// Locking flags for lock-requiring steps.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LockOptions {
    /// Override an existing lock rather than waiting for it.
    pub force: bool,
    /// Do not take the lock at all.
    pub skip_lock: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StopFlags {
    pub lock: LockOptions,
    pub wait: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KillFlags {
    pub lock: LockOptions,
    /// Remove the container after stopping it. Replacements remove; orphans
    /// are removed by a separate `remove` step once stopped.
    pub remove_container: bool,
    pub wait: bool,
}

impl Default for KillFlags {
    fn default() -> Self {
        Self {
            lock: LockOptions::default(),
            remove_container: true,
            wait: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandoverFlags {
    pub lock: LockOptions,
    pub timeout: Duration,
}

/// A step of the dependent-device protocol, opaque to the engine.
#[derive(Debug, Clone, PartialEq)]
pub struct DependentStep {
    pub action: String,
    pub payload: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CompositionStep {
    Stop { current: Service, options: StopFlags },
    Kill { current: Service, options: KillFlags },
    Remove { current: Service },
    UpdateMetadata { current: Service, target: Service, lock: LockOptions },
    Restart { current: Service, target: Service, lock: LockOptions },
    Start { target: Service },
    Handover { current: Service, target: Service, options: HandoverFlags },
    Fetch { image: Image, service_name: String },
    RemoveImage { image: Image },
    SaveImage { image: Image },
    Cleanup,
    CreateNetwork { target: Network },
    CreateVolume { target: Volume },
    RemoveNetwork { current: Network },
    RemoveVolume { current: Volume },
    EnsureSupervisorNetwork,
    StopAll { lock: LockOptions },
    UpdateCommit { app_id: AppId, commit: String },
    Noop,
    Dependent(DependentStep),
}

/// Names of the engine's step kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StepAction {
    Stop,
    Kill,
    Remove,
    UpdateMetadata,
    Restart,
    Start,
    Handover,
    Fetch,
    RemoveImage,
    SaveImage,
    Cleanup,
    CreateNetwork,
    CreateVolume,
    RemoveNetwork,
    RemoveVolume,
    EnsureSupervisorNetwork,
    StopAll,
    UpdateCommit,
    Noop,
}

impl StepAction {
    pub const ALL: [StepAction; 19] = [
        StepAction::Stop,
        StepAction::Kill,
        StepAction::Remove,
        StepAction::UpdateMetadata,
        StepAction::Restart,
        StepAction::Start,
        StepAction::Handover,
        StepAction::Fetch,
        StepAction::RemoveImage,
        StepAction::SaveImage,
        StepAction::Cleanup,
        StepAction::CreateNetwork,
        StepAction::CreateVolume,
        StepAction::RemoveNetwork,
        StepAction::RemoveVolume,
        StepAction::EnsureSupervisorNetwork,
        StepAction::StopAll,
        StepAction::UpdateCommit,
        StepAction::Noop,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StepAction::Stop => "stop",
            StepAction::Kill => "kill",
            StepAction::Remove => "remove",
            StepAction::UpdateMetadata => "updateMetadata",
            StepAction::Restart => "restart",
            StepAction::Start => "start",
            StepAction::Handover => "handover",
            StepAction::Fetch => "fetch",
            StepAction::RemoveImage => "removeImage",
            StepAction::SaveImage => "saveImage",
            StepAction::Cleanup => "cleanup",
            StepAction::CreateNetwork => "createNetwork",
            StepAction::CreateVolume => "createVolume",
            StepAction::RemoveNetwork => "removeNetwork",
            StepAction::RemoveVolume => "removeVolume",
            StepAction::EnsureSupervisorNetwork => "ensureSupervisorNetwork",
            StepAction::StopAll => "stopAll",
            StepAction::UpdateCommit => "updateCommit",
            StepAction::Noop => "noop",
        }
    }

    /// Kinds that take the application's update lock.
    pub fn requires_lock(&self) -> bool {
        matches!(
            self,
            StepAction::Stop
                | StepAction::Kill
                | StepAction::UpdateMetadata
                | StepAction::Restart
                | StepAction::Handover
        )
    }
}

impl fmt::Display for StepAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StepAction {
    type Err = ComposeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        StepAction::ALL
            .into_iter()
            .find(|a| a.as_str() == s)
            .ok_or_else(|| ComposeError::UnknownAction(s.to_string()))
    }
}

impl CompositionStep {
    pub fn stop(current: Service) -> Self {
        CompositionStep::Stop {
            current,
            options: StopFlags::default(),
        }
    }

    /// Kill for replacement: the container is removed as well.
    pub fn kill(current: Service) -> Self {
        CompositionStep::Kill {
            current,
            options: KillFlags::default(),
        }
    }

    /// Kill for removal: the container is left for a later `remove` step.
    pub fn kill_keep_container(current: Service) -> Self {
        CompositionStep::Kill {
            current,
            options: KillFlags {
                remove_container: false,
                ..KillFlags::default()
            },
        }
    }

    pub fn start(target: Service) -> Self {
        CompositionStep::Start { target }
    }

    pub fn fetch(target: &Service) -> Self {
        CompositionStep::Fetch {
            image: target.image(),
            service_name: target.service_name.clone(),
        }
    }

    pub fn handover(current: Service, target: Service) -> Self {
        let timeout = target.handover_timeout();
        CompositionStep::Handover {
            current,
            target,
            options: HandoverFlags {
                lock: LockOptions::default(),
                timeout,
            },
        }
    }

    pub fn update_metadata(current: Service, target: Service) -> Self {
        CompositionStep::UpdateMetadata {
            current,
            target,
            lock: LockOptions::default(),
        }
    }

    /// The engine's name for this step's kind, or the protocol's own name for
    /// dependent-device steps.
    pub fn action_name(&self) -> &str {
        match self {
            CompositionStep::Dependent(step) => &step.action,
            other => other.action().map_or("", |a| a.as_str()),
        }
    }

    pub fn action(&self) -> Option<StepAction> {
        Some(match self {
            CompositionStep::Stop { .. } => StepAction::Stop,
            CompositionStep::Kill { .. } => StepAction::Kill,
            CompositionStep::Remove { .. } => StepAction::Remove,
            CompositionStep::UpdateMetadata { .. } => StepAction::UpdateMetadata,
            CompositionStep::Restart { .. } => StepAction::Restart,
            CompositionStep::Start { .. } => StepAction::Start,
            CompositionStep::Handover { .. } => StepAction::Handover,
            CompositionStep::Fetch { .. } => StepAction::Fetch,
            CompositionStep::RemoveImage { .. } => StepAction::RemoveImage,
            CompositionStep::SaveImage { .. } => StepAction::SaveImage,
            CompositionStep::Cleanup => StepAction::Cleanup,
            CompositionStep::CreateNetwork { .. } => StepAction::CreateNetwork,
            CompositionStep::CreateVolume { .. } => StepAction::CreateVolume,
            CompositionStep::RemoveNetwork { .. } => StepAction::RemoveNetwork,
            CompositionStep::RemoveVolume { .. } => StepAction::RemoveVolume,
            CompositionStep::EnsureSupervisorNetwork => StepAction::EnsureSupervisorNetwork,
            CompositionStep::StopAll { .. } => StepAction::StopAll,
            CompositionStep::UpdateCommit { .. } => StepAction::UpdateCommit,
            CompositionStep::Noop => StepAction::Noop,
            CompositionStep::Dependent(_) => return None,
        })
    }

    /// The application whose resources the step touches.
    pub fn app_id(&self) -> Option<AppId> {
        match self {
            CompositionStep::Stop { current, .. }
            | CompositionStep::Kill { current, .. }
            | CompositionStep::Remove { current }
            | CompositionStep::UpdateMetadata { current, .. }
            | CompositionStep::Restart { current, .. }
            | CompositionStep::Handover { current, .. } => Some(current.app_id),
            CompositionStep::Start { target } => Some(target.app_id),
            CompositionStep::Fetch { image, .. }
            | CompositionStep::RemoveImage { image }
            | CompositionStep::SaveImage { image } => Some(image.app_id),
            CompositionStep::CreateNetwork { target } => Some(target.app_id),
            CompositionStep::RemoveNetwork { current } => Some(current.app_id),
            CompositionStep::CreateVolume { target } => Some(target.app_id),
            CompositionStep::RemoveVolume { current } => Some(current.app_id),
            CompositionStep::UpdateCommit { app_id, .. } => Some(*app_id),
            CompositionStep::Cleanup
            | CompositionStep::EnsureSupervisorNetwork
            | CompositionStep::StopAll { .. }
            | CompositionStep::Noop
            | CompositionStep::Dependent(_) => None,
        }
    }

    pub fn is_noop(&self) -> bool {
        matches!(self, CompositionStep::Noop)
    }

    pub fn is_fetch(&self) -> bool {
        matches!(self, CompositionStep::Fetch { .. })
    }
}

impl fmt::Display for CompositionStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let action = self.action_name();
        match self {
            CompositionStep::Stop { current, .. }
            | CompositionStep::Kill { current, .. }
            | CompositionStep::Remove { current } => {
                write!(f, "{action}({})", current.service_name)
            }
            CompositionStep::UpdateMetadata { target, .. }
            | CompositionStep::Restart { target, .. }
            | CompositionStep::Start { target }
            | CompositionStep::Handover { target, .. } => {
                write!(f, "{action}({})", target.service_name)
            }
            CompositionStep::Fetch { image, .. }
            | CompositionStep::RemoveImage { image }
            | CompositionStep::SaveImage { image } => write!(f, "{action}({})", image.name),
            CompositionStep::CreateNetwork { target: n } | CompositionStep::RemoveNetwork { current: n } => {
                write!(f, "{action}({})", n.name)
            }
            CompositionStep::CreateVolume { target: v } | CompositionStep::RemoveVolume { current: v } => {
                write!(f, "{action}({})", v.name)
            }
            CompositionStep::UpdateCommit { commit, .. } => write!(f, "{action}({commit})"),
            _ => f.write_str(action),
        }
    }
}
