use std::sync::Arc;

use skiff_events::{EventKind, EventSink, ResourceRef, SystemEvent};
use tracing::{debug, info, warn};

use crate::compose::labels;
use crate::compose::Volume;
use crate::engine::ContainerEngine;
use crate::error::{ComposeError, Result};

/// Creates and removes application volumes.
pub struct VolumeManager {
    engine: Arc<dyn ContainerEngine>,
    events: Arc<dyn EventSink>,
}

impl VolumeManager {
    pub fn new(engine: Arc<dyn ContainerEngine>, events: Arc<dyn EventSink>) -> Self {
        Self { engine, events }
    }

    pub async fn get_all(&self) -> Result<Vec<Volume>> {
        let mut volumes = Vec::new();
        for inspect in self.engine.list_volumes().await? {
            if !inspect.labels.contains_key(labels::SUPERVISED) {
                continue;
            }
            match Volume::from_engine(&inspect) {
                Ok(volume) => volumes.push(volume),
                Err(e) => warn!(name = %inspect.name, error = %e, "Ignoring unmanaged volume"),
            }
        }
        Ok(volumes)
    }

    pub async fn create(&self, volume: &Volume) -> Result<()> {
        let name = volume.engine_name();
        match self.engine.inspect_volume(&name).await {
            Ok(existing) => {
                let existing = Volume::from_engine(&existing)?;
                if existing.is_equal_config(volume) {
                    debug!(volume = %name, "Volume already exists");
                    return Ok(());
                }
                return Err(ComposeError::ResourceRecreationAttempt { kind: "volume", name });
            }
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e.into()),
        }

        self.emit(EventKind::CreateVolume, volume, None);
        info!(volume = %name, "Creating volume");
        if let Err(e) = self.engine.create_volume(&volume.to_create()).await {
            self.emit(EventKind::CreateVolumeError, volume, Some(e.to_string()));
            return Err(e.into());
        }
        Ok(())
    }

    pub async fn remove(&self, volume: &Volume) -> Result<()> {
        let name = volume.engine_name();
        self.emit(EventKind::RemoveVolume, volume, None);
        info!(volume = %name, "Removing volume");
        match self.engine.remove_volume(&name).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => {
                self.emit(EventKind::RemoveVolumeError, volume, Some(e.to_string()));
                Err(e.into())
            }
        }
    }

    fn emit(&self, kind: EventKind, volume: &Volume, error: Option<String>) {
        let mut event = SystemEvent::new(kind).with_resource(ResourceRef::Volume {
            app_id: volume.app_id,
            name: volume.name.clone(),
        });
        if let Some(error) = error {
            event = event.with_error(error);
        }
        self.events.emit(event);
    }
}
