//! Engine-facing managers, one per resource kind.
//!
//! Managers own the CRUD calls against the [`ContainerEngine`] and emit a
//! system event for every outcome. They never decide *what* to do; that is
//! the job of the application diff.
//!
//! [`ContainerEngine`]: crate::engine::ContainerEngine

mod network_manager;
mod service_manager;
mod volume_manager;

pub use network_manager::NetworkManager;
pub use service_manager::{KillOptions, ServiceManager};
pub use volume_manager::VolumeManager;

use std::sync::Arc;

use skiff_events::EventSink;

use crate::config::Config;
use crate::engine::ContainerEngine;
use crate::images::ImageManager;

/// The four resource managers over one engine, shared by the composer and
/// the step executor.
#[derive(Clone)]
pub struct Managers {
    pub services: Arc<ServiceManager>,
    pub networks: Arc<NetworkManager>,
    pub volumes: Arc<VolumeManager>,
    pub images: Arc<ImageManager>,
}

impl Managers {
    pub fn new(engine: Arc<dyn ContainerEngine>, events: Arc<dyn EventSink>, config: &Config) -> Self {
        Self {
            services: Arc::new(ServiceManager::new(
                Arc::clone(&engine),
                Arc::clone(&events),
                config.lock_dir.clone(),
            )),
            networks: Arc::new(NetworkManager::new(Arc::clone(&engine), Arc::clone(&events))),
            volumes: Arc::new(VolumeManager::new(Arc::clone(&engine), Arc::clone(&events))),
            images: Arc::new(ImageManager::new(
                engine,
                events,
                config.backoff_increment,
                config.app_update_poll_interval,
            )),
        }
    }
}
