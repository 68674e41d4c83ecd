//! Top-level reconciliation loop.
//!
//! The [`Composer`] rebuilds current and target applications from scratch on
//! every pass, computes the steps that can run now and executes them
//! concurrently, until a pass yields nothing to do. Only one apply runs at a
//! time; cancellation is cooperative and never aborts a dispatched step.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use serde::Serialize;
use skiff_events::{EventKind, EventSink, ResourceRef, SystemEvent};
use skiff_id::{AppId, ImageId, ReleaseId, ServiceId};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::app::{Application, UpdateContext};
use crate::compose::image::is_same_image_name;
use crate::compose::{
    labels, Image, Network, Service, ServiceStatus, TargetState, UpdateStrategy, Volume,
};
use crate::config::{Config, DeviceMetadata};
use crate::contracts;
use crate::dependent::{DependentContext, DependentDevices, NoDependentDevices};
use crate::engine::ContainerEngine;
use crate::error::{ComposeError, Result};
use crate::executor::{ExecuteOptions, StateTracker, StepExecutor};
use crate::images::{best_delta_source, ImageState};
use crate::managers::Managers;
use crate::steps::CompositionStep;
use crate::update_lock::UpdateLocks;

/// Whether an apply is in progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ComposerStatus {
    Idle,
    Running,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceReport {
    pub service_name: String,
    pub image: String,
    pub image_id: ImageId,
    pub release_id: ReleaseId,
    pub status: ServiceStatus,
    pub container_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AppReport {
    pub name: String,
    pub status: ComposerStatus,
    pub commit: Option<String>,
    pub services: BTreeMap<ServiceId, ServiceReport>,
    pub networks: BTreeMap<String, Network>,
    pub volumes: BTreeMap<String, Volume>,
}

/// Device state as reported by [`Composer::state`] and [`Composer::update`].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ComposerState {
    pub status: ComposerStatus,
    pub apps: BTreeMap<AppId, AppReport>,
    pub images: Vec<ImageState>,
    pub update_downloaded: bool,
}

/// Resets the running flag however the apply ends.
struct RunningGuard<'a>(&'a AtomicBool);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

pub struct Composer {
    engine: Arc<dyn ContainerEngine>,
    events: Arc<dyn EventSink>,
    managers: Managers,
    executor: Arc<StepExecutor>,
    tracker: Arc<StateTracker>,
    dependents: Arc<dyn DependentDevices>,
    device: DeviceMetadata,
    local_mode: bool,
    delta: bool,
    max_delta_downloads: usize,
    noop_interval: Duration,

    running: AtomicBool,
    cancel: watch::Sender<bool>,
}

impl Composer {
    pub fn new(engine: Arc<dyn ContainerEngine>, events: Arc<dyn EventSink>, config: &Config) -> Self {
        Self::with_dependents(engine, events, Arc::new(NoDependentDevices), config)
    }

    pub fn with_dependents(
        engine: Arc<dyn ContainerEngine>,
        events: Arc<dyn EventSink>,
        dependents: Arc<dyn DependentDevices>,
        config: &Config,
    ) -> Self {
        let managers = Managers::new(Arc::clone(&engine), Arc::clone(&events), config);
        let locks = Arc::new(UpdateLocks::new(
            config.lock_dir.clone(),
            config.lock_timeout,
            Arc::clone(&events),
        ));
        let tracker = Arc::new(StateTracker::default());
        let executor = Arc::new(StepExecutor::new(
            managers.clone(),
            locks,
            Arc::clone(&dependents),
            tracker.clone(),
            config,
        ));
        let (cancel, _) = watch::channel(false);
        Self {
            engine,
            events,
            managers,
            executor,
            tracker,
            dependents,
            device: config.device_metadata(),
            local_mode: config.local_mode,
            delta: config.delta,
            max_delta_downloads: config.max_delta_downloads,
            noop_interval: config.noop_interval,
            running: AtomicBool::new(false),
            cancel,
        }
    }

    pub fn executor(&self) -> &StepExecutor {
        &self.executor
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Converges the device to `target` and returns the resulting state.
    ///
    /// Fails with [`ComposeError::UpdateInProgress`] if another apply is
    /// running, and with [`ComposeError::ContractViolation`] after converging
    /// every accepted app when some app was rejected.
    pub async fn update(&self, target: &TargetState) -> Result<ComposerState> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(ComposeError::UpdateInProgress);
        }
        let guard = RunningGuard(&self.running);
        self.cancel.send_replace(false);
        let mut cancelled = self.cancel.subscribe();

        let outcome = contracts::evaluate(target, &self.device);
        for (app_id, service_name) in &outcome.skipped {
            self.events.emit(
                SystemEvent::new(EventKind::OptionalServiceSkipped).with_resource(ResourceRef::Service {
                    app_id: *app_id,
                    service_name: service_name.clone(),
                    image: None,
                }),
            );
        }
        let frozen: BTreeSet<AppId> = outcome.rejected.keys().copied().collect();
        info!(apps = outcome.accepted.len(), rejected = frozen.len(), "Applying target state");

        tokio::select! {
            biased;
            _ = wait_cancelled(&mut cancelled) => {
                info!("Update cancelled");
                return Err(ComposeError::Cancelled);
            }
            result = self.converge(&outcome.accepted, &frozen) => result?,
        }

        if !outcome.rejected.is_empty() {
            return Err(ComposeError::ContractViolation {
                apps: outcome.violations(),
            });
        }
        drop(guard);
        self.state().await
    }

    /// Stops waiting for the in-flight apply. Steps already dispatched run to
    /// completion.
    pub fn cancel(&self) {
        if self.is_running() {
            info!("Cancelling update");
        }
        self.cancel.send_replace(true);
    }

    /// Steps the next pass would execute for `target`.
    pub async fn required_steps(&self, target: &TargetState) -> Result<Vec<CompositionStep>> {
        let outcome = contracts::evaluate(target, &self.device);
        let frozen: BTreeSet<AppId> = outcome.rejected.keys().copied().collect();
        self.get_required_steps(&outcome.accepted, &frozen).await
    }

    pub async fn state(&self) -> Result<ComposerState> {
        let status = if self.is_running() {
            ComposerStatus::Running
        } else {
            ComposerStatus::Idle
        };
        let available = self.managers.images.available().await?;
        let current = self.current_apps(&available).await?;
        let apps = current
            .into_values()
            .map(|app| (app.app_id, app_report(app, status)))
            .collect();
        Ok(ComposerState {
            status,
            apps,
            images: self.managers.images.status().await?,
            update_downloaded: self.tracker.update_downloaded(),
        })
    }

    async fn converge(&self, target: &TargetState, frozen: &BTreeSet<AppId>) -> Result<()> {
        loop {
            let steps = self.get_required_steps(target, frozen).await?;
            if steps.is_empty() {
                info!("Device state converged");
                return Ok(());
            }
            if steps.iter().all(CompositionStep::is_noop) {
                debug!(interval = ?self.noop_interval, "Waiting for in-flight work");
                tokio::time::sleep(self.noop_interval).await;
                continue;
            }

            let summary: Vec<String> = steps.iter().map(ToString::to_string).collect();
            info!(count = steps.len(), steps = %summary.join(", "), "Executing steps");
            let errors = self.execute_all(steps).await;
            if errors.is_empty() {
                continue;
            }
            let backoff = errors.iter().filter_map(ComposeError::backoff_remaining).min();
            match errors.into_iter().find(|e| !e.is_backoff()) {
                Some(error) => return Err(error),
                None => {
                    let wait = backoff.unwrap_or(self.noop_interval);
                    info!(wait = ?wait, "Downloads backing off");
                    tokio::time::sleep(wait).await;
                }
            }
        }
    }

    async fn execute_all(&self, steps: Vec<CompositionStep>) -> Vec<ComposeError> {
        let handles: Vec<_> = steps
            .into_iter()
            .map(|step| {
                let executor = Arc::clone(&self.executor);
                tokio::spawn(async move {
                    let result = executor.execute(&step, ExecuteOptions::default()).await;
                    (step, result)
                })
            })
            .collect();

        let mut errors = Vec::new();
        for joined in join_all(handles).await {
            match joined {
                Ok((_, Ok(()))) => {}
                Ok((step, Err(e))) => {
                    if e.is_backoff() {
                        debug!(step = %step, error = %e, "Step deferred");
                    } else {
                        warn!(step = %step, error = %e, "Step failed");
                    }
                    errors.push(e);
                }
                Err(e) => errors.push(ComposeError::InternalInconsistency(format!(
                    "step task failed: {e}"
                ))),
            }
        }
        errors
    }

    async fn get_required_steps(
        &self,
        target: &TargetState,
        frozen: &BTreeSet<AppId>,
    ) -> Result<Vec<CompositionStep>> {
        let available = self.managers.images.available().await?;
        let downloading = self.managers.images.downloading_image_ids();
        let current = self.current_apps(&available).await?;
        let target_apps = self.target_apps(target).await?;

        let mut steps = Vec::new();
        if !self.managers.networks.supervisor_network_ready().await? {
            steps = supervisor_network_steps(&current);
        } else {
            if !self.local_mode && downloading.is_empty() {
                if self.managers.images.is_cleanup_needed().await? {
                    steps.push(CompositionStep::Cleanup);
                }
                let pinned = self.dependents.images_in_use(&current, &target_apps);
                steps.extend(save_and_remove_images(
                    &current,
                    &target_apps,
                    &available,
                    &pinned,
                    self.local_mode,
                    self.delta,
                ));
            }
            if steps.is_empty() {
                steps = self.app_steps(&current, &target_apps, frozen, &available, &downloading)?;
            }
        }

        if !self.local_mode && self.delta {
            steps = limit_delta_downloads(steps, &available, downloading.len(), self.max_delta_downloads);
        }
        if !self.local_mode && steps.is_empty() && !downloading.is_empty() {
            steps.push(CompositionStep::Noop);
        }

        let ctx = DependentContext {
            available_images: &available,
            downloading: downloading.len(),
            current: &current,
            target: &target_apps,
            steps: &steps,
        };
        let dependent = self.dependents.required_steps(&ctx).await?;
        steps.extend(dependent);
        Ok(steps)
    }

    fn app_steps(
        &self,
        current: &BTreeMap<AppId, Application>,
        target: &BTreeMap<AppId, Application>,
        frozen: &BTreeSet<AppId>,
        available: &[Image],
        downloading: &[ImageId],
    ) -> Result<Vec<CompositionStep>> {
        let started = self.tracker.started_containers();
        let app_ids: BTreeSet<AppId> = current.keys().chain(target.keys()).copied().collect();

        let mut steps = Vec::new();
        for app_id in app_ids {
            if frozen.contains(&app_id) {
                debug!(app_id = %app_id, "Leaving app with unmet contracts untouched");
                continue;
            }
            let empty = Application::empty(app_id);
            let app_steps = match (current.get(&app_id), target.get(&app_id)) {
                (Some(current), None) => current.steps_to_remove_app(),
                (current, Some(target)) => {
                    let current = current.unwrap_or(&empty);
                    let container_ids = container_ids(current);
                    let ctx = UpdateContext {
                        local_mode: self.local_mode,
                        available_images: available,
                        container_ids: &container_ids,
                        downloading,
                        started_containers: &started,
                    };
                    current.next_steps_for_app_update(target, &ctx)?
                }
                (None, None) => Vec::new(),
            };
            steps.extend(app_steps);
        }
        Ok(steps)
    }

    /// Current applications, grouped from every managed resource on the engine.
    async fn current_apps(&self, available: &[Image]) -> Result<BTreeMap<AppId, Application>> {
        let services = self.managers.services.get_all().await?;
        let networks = self.managers.networks.get_all().await?;
        let volumes = self.managers.volumes.get_all().await?;

        let mut apps: BTreeMap<AppId, Application> = BTreeMap::new();
        for mut service in services {
            if service.image_name.is_none() {
                service.image_name = available
                    .iter()
                    .find(|image| image.docker_image_id.as_deref() == Some(service.config.image.as_str()))
                    .map(|image| image.name.clone());
            }
            let app = apps
                .entry(service.app_id)
                .or_insert_with(|| Application::empty(service.app_id));
            if app.name.is_empty() {
                if let Some(name) = service.config.environment.get("SKIFF_APP_NAME") {
                    app.name = name.clone();
                }
            }
            app.services.push(service);
        }
        for network in networks {
            apps.entry(network.app_id)
                .or_insert_with(|| Application::empty(network.app_id))
                .networks
                .insert(network.name.clone(), network);
        }
        for volume in volumes {
            apps.entry(volume.app_id)
                .or_insert_with(|| Application::empty(volume.app_id))
                .volumes
                .insert(volume.name.clone(), volume);
        }

        for app in apps.values_mut() {
            app.commit = self.executor.commit(app.app_id).or_else(|| {
                app.services
                    .iter()
                    .find_map(|s| s.config.labels.get(labels::COMMIT).cloned())
            });
        }
        Ok(apps)
    }

    async fn target_apps(&self, target: &TargetState) -> Result<BTreeMap<AppId, Application>> {
        let mut apps = BTreeMap::new();
        for (app_id, app) in target {
            let mut inspected = BTreeMap::new();
            for record in app.services.values() {
                if inspected.contains_key(&record.image) {
                    continue;
                }
                match self.engine.inspect_image(&record.image).await {
                    Ok(info) => {
                        inspected.insert(record.image.clone(), info);
                    }
                    Err(e) if e.is_not_found() => {}
                    Err(e) => return Err(e.into()),
                }
            }
            apps.insert(
                *app_id,
                Application::from_target(*app_id, app, &inspected, &self.device)?,
            );
        }
        Ok(apps)
    }
}

async fn wait_cancelled(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

fn container_ids(app: &Application) -> BTreeMap<ServiceId, String> {
    app.services
        .iter()
        .filter_map(|s| Some((s.service_id, s.container_id.clone()?)))
        .collect()
}

/// Steps that clear the way for the agent network: running services using
/// the management API are killed first, after which the network is ensured.
fn supervisor_network_steps(current: &BTreeMap<AppId, Application>) -> Vec<CompositionStep> {
    let mut steps = Vec::new();
    for service in current.values().flat_map(|app| &app.services) {
        let running = service.config.running || service.status == ServiceStatus::Running;
        if !service.uses_supervisor_api() || !running {
            continue;
        }
        let step = if service.status == ServiceStatus::Stopping {
            CompositionStep::Noop
        } else {
            CompositionStep::kill(service.clone())
        };
        if !steps.contains(&step) {
            steps.push(step);
        }
    }
    if steps.is_empty() {
        steps.push(CompositionStep::EnsureSupervisorNetwork);
    }
    steps
}

fn same_engine_image(a: &Image, b: &Image) -> bool {
    a.docker_image_id.is_some() && a.docker_image_id == b.docker_image_id
}

/// The recorded image a service's container runs from.
fn image_of<'a>(service: &Service, available: &'a [Image]) -> Option<&'a Image> {
    let same_engine = |image: &&Image| image.docker_image_id.as_deref() == Some(service.config.image.as_str());
    available
        .iter()
        .filter(same_engine)
        .find(|image| image.image_id == service.image_id)
        .or_else(|| available.iter().find(same_engine))
}

/// Image bookkeeping across every application: metadata to backfill for
/// target images already on the device, then images nothing needs anymore.
fn save_and_remove_images(
    current: &BTreeMap<AppId, Application>,
    target: &BTreeMap<AppId, Application>,
    available: &[Image],
    pinned: &[String],
    local_mode: bool,
    delta: bool,
) -> Vec<CompositionStep> {
    let current_services: Vec<&Service> = current.values().flat_map(|app| &app.services).collect();
    let current_images: Vec<&Image> = current_services.iter().filter_map(|s| image_of(s, available)).collect();
    let target_services: Vec<&Service> = target.values().flat_map(|app| &app.services).collect();
    let target_images: Vec<Image> = target_services.iter().map(|s| s.image()).collect();

    let in_use = |image: &Image| {
        current_images
            .iter()
            .any(|used| image.is_same_image(used) || same_engine_image(image, used))
            || target_images
                .iter()
                .any(|used| image.is_same_image(used) || same_engine_image(image, used))
    };
    let mut removal_candidates: Vec<&Image> = available.iter().filter(|image| !in_use(image)).collect();
    for service in &current_services {
        if service.update_strategy() == UpdateStrategy::DeleteThenDownload && !service.config.running {
            if let Some(image) = image_of(service, available) {
                if !removal_candidates.contains(&image) {
                    removal_candidates.push(image);
                }
            }
        }
    }

    let delta_sources: HashSet<String> = if delta {
        target_images
            .iter()
            .filter(|image| !available.iter().any(|a| a.is_same_image(image)))
            .filter_map(|image| best_delta_source(image, available))
            .collect()
    } else {
        HashSet::new()
    };

    let mut steps = Vec::new();
    if !local_mode {
        for (service, image) in target_services.iter().zip(&target_images) {
            let on_device = available.iter().any(|a| {
                a.is_same_image(image) || a.docker_image_id.as_deref() == Some(service.config.image.as_str())
            });
            let recorded = available.iter().any(|a| a.same_metadata(image));
            let step = CompositionStep::SaveImage { image: image.clone() };
            if on_device && !recorded && !steps.contains(&step) {
                steps.push(step);
            }
        }
    }
    for image in removal_candidates {
        if delta_sources.contains(&image.name) {
            continue;
        }
        if pinned.iter().any(|name| is_same_image_name(name, &image.name)) {
            continue;
        }
        steps.push(CompositionStep::RemoveImage { image: image.clone() });
    }
    steps
}

/// Drops `fetch` steps beyond the delta download bound. Only apps that
/// already have an image on the device are throttled, so a first pull always
/// proceeds.
fn limit_delta_downloads(
    steps: Vec<CompositionStep>,
    available: &[Image],
    in_flight: usize,
    max_downloads: usize,
) -> Vec<CompositionStep> {
    let new_downloads = steps.iter().filter(|s| s.is_fetch()).count();
    let mut to_block = (in_flight + new_downloads).saturating_sub(max_downloads);
    if new_downloads == 0 || to_block == 0 {
        return steps;
    }
    let apps_with_images: BTreeSet<AppId> = available.iter().map(|image| image.app_id).collect();
    steps
        .into_iter()
        .filter(|step| match step {
            CompositionStep::Fetch { image, .. }
                if to_block > 0 && apps_with_images.contains(&image.app_id) =>
            {
                to_block -= 1;
                false
            }
            _ => true,
        })
        .collect()
}

fn app_report(app: Application, status: ComposerStatus) -> AppReport {
    let handing_over: BTreeSet<ServiceId> = app
        .services_by_id()
        .into_iter()
        .filter(|(_, containers)| containers.len() > 1)
        .map(|(id, _)| id)
        .collect();
    let mut services = BTreeMap::new();
    for (service_id, containers) in app.services_by_id() {
        let Some(newest) = containers.first() else {
            continue;
        };
        let status = if handing_over.contains(&service_id) {
            ServiceStatus::HandingOver
        } else {
            newest.status
        };
        services.insert(
            service_id,
            ServiceReport {
                service_name: newest.service_name.clone(),
                image: newest.image().name,
                image_id: newest.image_id,
                release_id: newest.release_id,
                status,
                container_id: newest.container_id.clone(),
            },
        );
    }
    AppReport {
        name: app.name,
        status,
        commit: app.commit,
        services,
        networks: app.networks,
        volumes: app.volumes,
    }
}
