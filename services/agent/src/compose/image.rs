//! Image descriptor.

use std::fmt;

use serde::Serialize;
use skiff_id::{AppId, ImageId, ReleaseId, ServiceId};

/// Lifecycle of an image as seen by the fetch subsystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ImageStatus {
    Downloading,
    Downloaded,
    Deleting,
}

impl fmt::Display for ImageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ImageStatus::Downloading => write!(f, "Downloading"),
            ImageStatus::Downloaded => write!(f, "Downloaded"),
            ImageStatus::Deleting => write!(f, "Deleting"),
        }
    }
}

/// An image together with the application metadata that put it on the device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Image {
    /// Registry reference, optionally with a digest.
    pub name: String,
    pub app_id: AppId,
    pub service_id: ServiceId,
    pub service_name: String,
    pub image_id: ImageId,
    pub release_id: ReleaseId,
    /// Used by the dependent-device protocol.
    pub dependent: bool,
    /// Engine id, known once fetched.
    pub docker_image_id: Option<String>,
}

impl Image {
    /// The `@sha256:...` part of the name, if present.
    pub fn digest(&self) -> Option<&str> {
        digest_of(&self.name)
    }

    /// Same name, or same content digest.
    pub fn is_same_image(&self, other: &Image) -> bool {
        is_same_image_name(&self.name, &other.name)
    }

    /// Same identity, ignoring the engine id.
    pub fn same_metadata(&self, other: &Image) -> bool {
        self.name == other.name
            && self.app_id == other.app_id
            && self.service_id == other.service_id
            && self.service_name == other.service_name
            && self.image_id == other.image_id
            && self.release_id == other.release_id
            && self.dependent == other.dependent
    }

    /// Splits the name into repository and tag, for tagging after a delta.
    /// Returns `None` for digest references.
    pub fn repo_and_tag(&self) -> Option<(&str, &str)> {
        if self.digest().is_some() {
            return None;
        }
        let slash = self.name.rfind('/').map_or(0, |i| i + 1);
        match self.name[slash..].rfind(':') {
            Some(colon) => Some((&self.name[..slash + colon], &self.name[slash + colon + 1..])),
            None => Some((self.name.as_str(), "latest")),
        }
    }
}

pub fn digest_of(name: &str) -> Option<&str> {
    name.split_once('@').map(|(_, digest)| digest)
}

pub fn is_same_image_name(a: &str, b: &str) -> bool {
    if a == b {
        return true;
    }
    matches!((digest_of(a), digest_of(b)), (Some(x), Some(y)) if x == y)
}
