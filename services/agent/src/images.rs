//! Image fetch subsystem.
//!
//! Owns everything the agent knows about images beyond what the engine
//! reports: application metadata for each image, the volatile download table
//! and per-image failure counters for fetch backoff. One instance is created
//! per composer and shared by handle.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use serde::Serialize;
use skiff_events::{EventKind, EventSink, ResourceRef, SystemEvent};
use skiff_id::ImageId;
use skiff_reconcile::FailureTracker;
use tracing::{debug, info, warn};

use crate::compose::image::is_same_image_name;
use crate::compose::labels;
use crate::compose::{Image, ImageStatus};
use crate::config::FetchOptions;
use crate::engine::{
    ContainerEngine, DeltaOptions, EngineError, ImageSummary, PullOptions, RegistryAuth,
};
use crate::error::{ComposeError, Result};

/// How long a failed cleanup removal is left alone before being retried.
const CLEANUP_SUPPRESSION: Duration = Duration::from_secs(60 * 60);

/// An image with its current download state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageState {
    #[serde(flatten)]
    pub image: Image,
    pub status: ImageStatus,
    pub download_progress: Option<u8>,
}

/// Picks the available image to diff against when fetching `image` by delta:
/// the same service of the same app if present, else any image of the app.
pub fn best_delta_source(image: &Image, available: &[Image]) -> Option<String> {
    let candidates: Vec<&Image> = available
        .iter()
        .filter(|a| !a.dependent && a.app_id == image.app_id)
        .collect();
    candidates
        .iter()
        .find(|a| a.service_name == image.service_name)
        .or_else(|| candidates.first())
        .map(|a| a.name.clone())
}

pub struct ImageManager {
    engine: Arc<dyn ContainerEngine>,
    events: Arc<dyn EventSink>,

    /// Application metadata of every image the agent put on the device.
    metadata: Mutex<Vec<Image>>,

    /// Downloads and deletions in progress, by image id.
    volatile: Mutex<BTreeMap<ImageId, ImageState>>,

    /// Fetch failures by image name.
    failures: Mutex<FailureTracker>,

    /// Engine image ids whose cleanup removal failed, with the failure time.
    cleanup_failures: Mutex<HashMap<String, Instant>>,
}

fn guard<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

fn matches_engine_image(image: &Image, engine_image: &ImageSummary) -> bool {
    image.docker_image_id.as_deref() == Some(engine_image.id.as_str())
        || engine_image.repo_tags.iter().any(|t| *t == image.name)
        || engine_image
            .repo_digests
            .iter()
            .any(|d| is_same_image_name(d, &image.name))
}

impl ImageManager {
    /// `backoff_increment` is the base step of fetch backoff and `backoff_cap`
    /// its ceiling, normally the target poll interval.
    pub fn new(
        engine: Arc<dyn ContainerEngine>,
        events: Arc<dyn EventSink>,
        backoff_increment: Duration,
        backoff_cap: Duration,
    ) -> Self {
        Self {
            engine,
            events,
            metadata: Mutex::new(Vec::new()),
            volatile: Mutex::new(BTreeMap::new()),
            failures: Mutex::new(FailureTracker::new(backoff_increment, backoff_cap)),
            cleanup_failures: Mutex::new(HashMap::new()),
        }
    }

    /// Images with metadata whose engine image is still present, with their
    /// engine ids filled in.
    pub async fn available(&self) -> Result<Vec<Image>> {
        let engine_images = self.engine.list_images(false).await?;
        let metadata = guard(&self.metadata).clone();
        Ok(metadata
            .into_iter()
            .filter_map(|mut image| {
                let found = engine_images.iter().find(|e| matches_engine_image(&image, e))?;
                image.docker_image_id = Some(found.id.clone());
                Some(image)
            })
            .collect())
    }

    /// Available images as `Downloaded`, overlaid with in-progress downloads
    /// and deletions.
    pub async fn status(&self) -> Result<Vec<ImageState>> {
        let mut states: BTreeMap<ImageId, ImageState> = self
            .available()
            .await?
            .into_iter()
            .map(|image| {
                (
                    image.image_id,
                    ImageState {
                        image,
                        status: ImageStatus::Downloaded,
                        download_progress: None,
                    },
                )
            })
            .collect();
        for (id, state) in guard(&self.volatile).iter() {
            states.insert(*id, state.clone());
        }
        Ok(states.into_values().collect())
    }

    pub fn downloading_image_ids(&self) -> Vec<ImageId> {
        guard(&self.volatile)
            .iter()
            .filter(|(_, s)| s.status == ImageStatus::Downloading)
            .map(|(id, _)| *id)
            .collect()
    }

    /// Time left before `name` may be fetched again, if it is backing off.
    pub fn backoff_remaining(&self, name: &str) -> Option<Duration> {
        guard(&self.failures).remaining(name)
    }

    pub fn failure_count(&self, name: &str) -> u32 {
        guard(&self.failures).failures(name)
    }

    fn set_volatile(&self, image: &Image, status: ImageStatus, progress: Option<u8>) {
        guard(&self.volatile).insert(
            image.image_id,
            ImageState {
                image: image.clone(),
                status,
                download_progress: progress,
            },
        );
    }

    fn clear_volatile(&self, image_id: ImageId) {
        guard(&self.volatile).remove(&image_id);
    }

    fn record_metadata(&self, mut image: Image, docker_image_id: Option<String>) {
        image.docker_image_id = docker_image_id;
        let mut metadata = guard(&self.metadata);
        metadata.retain(|m| !m.same_metadata(&image));
        metadata.push(image);
    }

    /// Fetches `image`, by delta from `delta_source` when deltas are enabled.
    ///
    /// Returns `Ok(true)` once the image is on the device and `Ok(false)` when
    /// the download failed; the failure is counted and reported as an event.
    /// Fails with [`ComposeError::DownloadBackoff`] while the image is backing
    /// off from an earlier failure.
    pub async fn trigger_fetch(
        &self,
        image: &Image,
        options: &FetchOptions,
        delta_source: Option<&str>,
    ) -> Result<bool> {
        if let Some(remaining) = self.backoff_remaining(&image.name) {
            return Err(ComposeError::DownloadBackoff {
                image: image.name.clone(),
                remaining,
            });
        }

        match self.engine.inspect_image(&image.name).await {
            Ok(existing) => {
                debug!(image = %image.name, "Image already present");
                self.record_metadata(image.clone(), Some(existing.id));
                return Ok(true);
            }
            Err(e) if e.is_not_found() => {}
            Err(e) => {
                guard(&self.failures).record_failure(&image.name);
                return Err(e.into());
            }
        }

        self.set_volatile(image, ImageStatus::Downloading, Some(0));
        let delta_source = delta_source.filter(|_| options.delta);
        let fetched = match delta_source {
            Some(source) => self.fetch_delta(image, options, source).await,
            None => self.fetch_image(image, options).await,
        };
        self.clear_volatile(image.image_id);

        match fetched {
            Ok(id) => {
                info!(image = %image.name, id = %id, "Image downloaded");
                self.emit(EventKind::DownloadImageSuccess, image, None);
                self.record_metadata(image.clone(), Some(id));
                guard(&self.failures).clear(&image.name);
                Ok(true)
            }
            Err(EngineError::DeltaStillProcessing(_)) => {
                info!(image = %image.name, "Delta still processing remotely");
                self.emit(EventKind::DeltaStillProcessing, image, None);
                Ok(false)
            }
            Err(e) => {
                let failures = guard(&self.failures).record_failure(&image.name);
                warn!(image = %image.name, failures, error = %e, "Image download failed");
                self.emit(EventKind::DownloadImageError, image, Some(e.to_string()));
                Ok(false)
            }
        }
    }

    fn progress_reporter(&self, image_id: ImageId) -> impl Fn(u8) + Send + Sync + '_ {
        move |percentage| {
            if let Some(state) = guard(&self.volatile).get_mut(&image_id) {
                state.download_progress = Some(percentage);
            }
        }
    }

    async fn fetch_image(&self, image: &Image, options: &FetchOptions) -> std::result::Result<String, EngineError> {
        self.emit(EventKind::DownloadImage, image, None);
        info!(image = %image.name, "Fetching image");
        let progress = self.progress_reporter(image.image_id);
        let pull = PullOptions {
            auth: registry_auth(options),
        };
        self.engine.pull_image(&image.name, &pull, &progress).await
    }

    async fn fetch_delta(
        &self,
        image: &Image,
        options: &FetchOptions,
        source: &str,
    ) -> std::result::Result<String, EngineError> {
        self.emit(EventKind::DownloadImageDelta, image, None);
        info!(image = %image.name, source = %source, "Fetching image by delta");
        let source_image = self.engine.inspect_image(source).await?;
        let delta = DeltaOptions {
            source: source.to_string(),
            source_id: source_image.id,
            endpoint: options.delta_endpoint.clone(),
            version: options.delta_version,
            request_timeout: options.delta_request_timeout,
            apply_timeout: options.delta_apply_timeout,
            retry_count: options.delta_retry_count,
            retry_interval: options.delta_retry_interval,
            auth: registry_auth(options),
        };
        let progress = self.progress_reporter(image.image_id);
        let id = self.engine.pull_delta(&image.name, &delta, &progress).await?;
        if let Some((repo, tag)) = image.repo_and_tag() {
            self.engine.tag_image(&id, repo, tag).await?;
        }
        Ok(id)
    }

    /// Records metadata for an image that is already on the engine.
    pub async fn save(&self, image: &Image) -> Result<()> {
        let docker_id = match self.engine.inspect_image(&image.name).await {
            Ok(inspect) => Some(inspect.id),
            Err(e) if e.is_not_found() => image.docker_image_id.clone(),
            Err(e) => return Err(e.into()),
        };
        debug!(image = %image.name, "Saving image metadata");
        self.record_metadata(image.clone(), docker_id);
        Ok(())
    }

    /// Removes `image`'s metadata, and the engine image itself unless
    /// another metadata entry still refers to it.
    pub async fn remove(&self, image: &Image) -> Result<()> {
        let engine_images = self.engine.list_images(false).await?;
        let engine_id = engine_images
            .iter()
            .find(|e| matches_engine_image(image, e))
            .map(|e| e.id.clone());

        let shared = {
            let metadata = guard(&self.metadata);
            metadata.iter().any(|m| {
                !m.same_metadata(image)
                    && engine_id.is_some()
                    && engine_images
                        .iter()
                        .find(|e| matches_engine_image(m, e))
                        .map(|e| &e.id)
                        == engine_id.as_ref()
            })
        };
        let forget = || guard(&self.metadata).retain(|m| !m.same_metadata(image));

        let Some(engine_id) = engine_id else {
            self.emit(EventKind::ImageAlreadyDeleted, image, None);
            forget();
            return Ok(());
        };
        if shared {
            debug!(image = %image.name, "Image shared with other metadata, keeping engine image");
            forget();
            return Ok(());
        }

        self.set_volatile(image, ImageStatus::Deleting, None);
        self.emit(EventKind::DeleteImage, image, None);
        info!(image = %image.name, id = %engine_id, "Deleting image");
        let removed = self.engine.remove_image(&engine_id, false).await;
        self.clear_volatile(image.image_id);
        match removed {
            Ok(()) => {
                self.emit(EventKind::DeleteImageSuccess, image, None);
                forget();
                Ok(())
            }
            Err(e) if e.is_not_found() => {
                self.emit(EventKind::ImageAlreadyDeleted, image, None);
                forget();
                Ok(())
            }
            Err(e) => {
                self.emit(EventKind::DeleteImageError, image, Some(e.to_string()));
                Err(e.into())
            }
        }
    }

    async fn images_used_by_containers(&self) -> Result<HashSet<String>> {
        let mut used = HashSet::new();
        for summary in self.engine.list_containers(labels::SUPERVISED).await? {
            match self.engine.inspect_container(&summary.id).await {
                Ok(inspect) => {
                    used.insert(inspect.config.image);
                }
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(used)
    }

    /// Dangling engine images no container uses, minus recently failed ones.
    async fn cleanup_candidates(&self) -> Result<Vec<String>> {
        let used = self.images_used_by_containers().await?;
        let dangling = self.engine.list_images(true).await?;
        let now = Instant::now();
        let suppressed = guard(&self.cleanup_failures);
        Ok(dangling
            .into_iter()
            .map(|i| i.id)
            .filter(|id| !used.contains(id))
            .filter(|id| {
                suppressed
                    .get(id)
                    .map_or(true, |at| now.duration_since(*at) >= CLEANUP_SUPPRESSION)
            })
            .collect())
    }

    async fn stale_metadata(&self) -> Result<Vec<Image>> {
        let engine_images = self.engine.list_images(false).await?;
        Ok(guard(&self.metadata)
            .iter()
            .filter(|m| !engine_images.iter().any(|e| matches_engine_image(m, e)))
            .cloned()
            .collect())
    }

    pub async fn is_cleanup_needed(&self) -> Result<bool> {
        Ok(!self.cleanup_candidates().await?.is_empty() || !self.stale_metadata().await?.is_empty())
    }

    /// Drops stale metadata and removes unused dangling images.
    pub async fn cleanup(&self) -> Result<()> {
        let stale = self.stale_metadata().await?;
        if !stale.is_empty() {
            let mut metadata = guard(&self.metadata);
            metadata.retain(|m| !stale.iter().any(|s| s.same_metadata(m)));
        }
        for id in self.cleanup_candidates().await? {
            info!(id = %id, "Cleaning up dangling image");
            if let Err(e) = self.engine.remove_image(&id, false).await {
                warn!(id = %id, error = %e, "Dangling image cleanup failed");
                guard(&self.cleanup_failures).insert(id, Instant::now());
            }
        }
        Ok(())
    }

    fn emit(&self, kind: EventKind, image: &Image, error: Option<String>) {
        let mut event = SystemEvent::new(kind).with_resource(ResourceRef::Image {
            name: image.name.clone(),
        });
        if let Some(error) = error {
            event = event.with_error(error);
        }
        self.events.emit(event);
    }
}

fn registry_auth(options: &FetchOptions) -> Option<RegistryAuth> {
    options.api_key.as_ref().map(|key| RegistryAuth {
        username: format!("d_{}", options.uuid),
        password: key.clone(),
        server: options.registry_server.clone(),
    })
}
