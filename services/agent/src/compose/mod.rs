//! Resource descriptors and the target records they are built from.

pub mod image;
pub mod labels;
pub mod network;
pub mod service;
pub mod target;
pub mod utils;
pub mod volume;

pub use image::{Image, ImageStatus};
pub use network::{ComposeNetwork, Network, NetworkField};
pub use service::{Service, ServiceField, ServiceStatus, TargetContext, TargetService, UpdateStrategy};
pub use target::{parse_target, TargetApp, TargetState};
pub use volume::{ComposeVolume, Volume, VolumeField};
