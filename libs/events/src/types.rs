//! Event kinds.

use serde::{Deserialize, Serialize};

/// Severity used when rendering an event to logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventLevel {
    Info,
    Warn,
}

/// Every kind of system event the engine emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum EventKind {
    // =========================================================================
    // Services
    // =========================================================================
    InstallService,
    InstallServiceSuccess,
    InstallServiceError,
    StartService,
    StartServiceSuccess,
    StartServiceNoop,
    StartServiceError,
    StopService,
    StopServiceSuccess,
    StopServiceNoop,
    StopServiceError,
    RemoveDeadService,
    RemoveDeadServiceError,
    UpdateMetadata,
    UpdateMetadataError,
    HandoverService,
    HandoverServiceError,
    OptionalServiceSkipped,

    // =========================================================================
    // Images
    // =========================================================================
    DownloadImage,
    DownloadImageDelta,
    DownloadImageSuccess,
    DownloadImageError,
    DeltaStillProcessing,
    DeleteImage,
    DeleteImageSuccess,
    DeleteImageError,
    ImageAlreadyDeleted,

    // =========================================================================
    // Networks and Volumes
    // =========================================================================
    CreateNetwork,
    CreateNetworkError,
    RemoveNetwork,
    RemoveNetworkError,
    CreateVolume,
    CreateVolumeError,
    RemoveVolume,
    RemoveVolumeError,

    // =========================================================================
    // Locks
    // =========================================================================
    TakeLock,
    ReleaseLock,
    LockOverridden,
}

impl EventKind {
    pub const ALL: &'static [EventKind] = &[
        EventKind::InstallService,
        EventKind::InstallServiceSuccess,
        EventKind::InstallServiceError,
        EventKind::StartService,
        EventKind::StartServiceSuccess,
        EventKind::StartServiceNoop,
        EventKind::StartServiceError,
        EventKind::StopService,
        EventKind::StopServiceSuccess,
        EventKind::StopServiceNoop,
        EventKind::StopServiceError,
        EventKind::RemoveDeadService,
        EventKind::RemoveDeadServiceError,
        EventKind::UpdateMetadata,
        EventKind::UpdateMetadataError,
        EventKind::HandoverService,
        EventKind::HandoverServiceError,
        EventKind::OptionalServiceSkipped,
        EventKind::DownloadImage,
        EventKind::DownloadImageDelta,
        EventKind::DownloadImageSuccess,
        EventKind::DownloadImageError,
        EventKind::DeltaStillProcessing,
        EventKind::DeleteImage,
        EventKind::DeleteImageSuccess,
        EventKind::DeleteImageError,
        EventKind::ImageAlreadyDeleted,
        EventKind::CreateNetwork,
        EventKind::CreateNetworkError,
        EventKind::RemoveNetwork,
        EventKind::RemoveNetworkError,
        EventKind::CreateVolume,
        EventKind::CreateVolumeError,
        EventKind::RemoveVolume,
        EventKind::RemoveVolumeError,
        EventKind::TakeLock,
        EventKind::ReleaseLock,
        EventKind::LockOverridden,
    ];

    /// Returns the dotted event name, e.g. `image.download.success`.
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::InstallService => "service.install",
            EventKind::InstallServiceSuccess => "service.install.success",
            EventKind::InstallServiceError => "service.install.error",
            EventKind::StartService => "service.start",
            EventKind::StartServiceSuccess => "service.start.success",
            EventKind::StartServiceNoop => "service.start.noop",
            EventKind::StartServiceError => "service.start.error",
            EventKind::StopService => "service.stop",
            EventKind::StopServiceSuccess => "service.stop.success",
            EventKind::StopServiceNoop => "service.stop.noop",
            EventKind::StopServiceError => "service.stop.error",
            EventKind::RemoveDeadService => "service.remove_dead",
            EventKind::RemoveDeadServiceError => "service.remove_dead.error",
            EventKind::UpdateMetadata => "service.update_metadata",
            EventKind::UpdateMetadataError => "service.update_metadata.error",
            EventKind::HandoverService => "service.handover",
            EventKind::HandoverServiceError => "service.handover.error",
            EventKind::OptionalServiceSkipped => "service.optional_skipped",
            EventKind::DownloadImage => "image.download",
            EventKind::DownloadImageDelta => "image.download_delta",
            EventKind::DownloadImageSuccess => "image.download.success",
            EventKind::DownloadImageError => "image.download.error",
            EventKind::DeltaStillProcessing => "image.delta_still_processing",
            EventKind::DeleteImage => "image.delete",
            EventKind::DeleteImageSuccess => "image.delete.success",
            EventKind::DeleteImageError => "image.delete.error",
            EventKind::ImageAlreadyDeleted => "image.already_deleted",
            EventKind::CreateNetwork => "network.create",
            EventKind::CreateNetworkError => "network.create.error",
            EventKind::RemoveNetwork => "network.remove",
            EventKind::RemoveNetworkError => "network.remove.error",
            EventKind::CreateVolume => "volume.create",
            EventKind::CreateVolumeError => "volume.create.error",
            EventKind::RemoveVolume => "volume.remove",
            EventKind::RemoveVolumeError => "volume.remove.error",
            EventKind::TakeLock => "lock.take",
            EventKind::ReleaseLock => "lock.release",
            EventKind::LockOverridden => "lock.overridden",
        }
    }

    /// Error kinds render at warn level, everything else at info.
    pub fn level(&self) -> EventLevel {
        if self.as_str().ends_with(".error") {
            EventLevel::Warn
        } else {
            EventLevel::Info
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<EventKind> for String {
    fn from(kind: EventKind) -> Self {
        kind.as_str().to_string()
    }
}

impl TryFrom<String> for EventKind {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        EventKind::ALL
            .iter()
            .copied()
            .find(|kind| kind.as_str() == value)
            .ok_or_else(|| format!("unknown event kind: {value}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_names_are_unique_and_parse_back() {
        let mut seen = std::collections::HashSet::new();
        for kind in EventKind::ALL {
            assert!(seen.insert(kind.as_str()), "duplicate {}", kind);
            assert_eq!(EventKind::try_from(kind.to_string()).unwrap(), *kind);
        }
    }

    #[test]
    fn test_levels() {
        assert_eq!(EventKind::DownloadImageError.level(), EventLevel::Warn);
        assert_eq!(EventKind::DeltaStillProcessing.level(), EventLevel::Info);
        assert_eq!(EventKind::StartServiceSuccess.level(), EventLevel::Info);
    }
}
