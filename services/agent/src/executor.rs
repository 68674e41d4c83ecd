//! Step executor.
//!
//! Maps every [`CompositionStep`] to its effect on the engine. Lock-requiring
//! steps run inside the owning application's update lock unless the step or
//! the caller asks to skip it; `force` overrides a held lock instead.

use std::collections::{BTreeMap, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use futures_util::future::join_all;
use serde::Serialize;
use skiff_id::AppId;
use tracing::{debug, info};

use crate::compose::{Image, Service};
use crate::config::{Config, FetchOptions};
use crate::dependent::DependentDevices;
use crate::error::Result;
use crate::images::best_delta_source;
use crate::managers::{KillOptions, Managers};
use crate::steps::{CompositionStep, LockOptions};
use crate::update_lock::UpdateLocks;

/// Caller-level overrides for one execution.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExecuteOptions {
    pub force: bool,
    pub skip_lock: bool,
}

/// Partial device state pushed to the state reporter.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DeviceReport {
    pub update_downloaded: Option<bool>,
}

/// Observer hooks invoked as steps take effect.
pub trait Callbacks: Send + Sync {
    fn container_started(&self, container_id: &str);
    fn container_killed(&self, container_id: &str);
    fn fetch_start(&self);
    fn fetch_end(&self);
    fn fetch_time(&self, elapsed: Duration);
    fn state_report(&self, report: DeviceReport);
    /// Name of the available image to fetch `image` as a delta against.
    fn best_delta_source(&self, image: &Image, available: &[Image]) -> Option<String>;
}

/// Callbacks that keep the bookkeeping the composer reports.
#[derive(Debug, Default)]
pub struct StateTracker {
    started: Mutex<HashSet<String>>,
    fetches_in_flight: AtomicUsize,
    time_spent_fetching_ms: AtomicU64,
    update_downloaded: AtomicBool,
}

impl StateTracker {
    pub fn started_containers(&self) -> HashSet<String> {
        self.started.lock().map(|s| s.clone()).unwrap_or_default()
    }

    pub fn fetches_in_flight(&self) -> usize {
        self.fetches_in_flight.load(Ordering::SeqCst)
    }

    pub fn time_spent_fetching(&self) -> Duration {
        Duration::from_millis(self.time_spent_fetching_ms.load(Ordering::SeqCst))
    }

    pub fn update_downloaded(&self) -> bool {
        self.update_downloaded.load(Ordering::SeqCst)
    }
}

impl Callbacks for StateTracker {
    fn container_started(&self, container_id: &str) {
        if let Ok(mut started) = self.started.lock() {
            started.insert(container_id.to_string());
        }
    }

    fn container_killed(&self, container_id: &str) {
        if let Ok(mut started) = self.started.lock() {
            started.remove(container_id);
        }
    }

    fn fetch_start(&self) {
        self.fetches_in_flight.fetch_add(1, Ordering::SeqCst);
    }

    fn fetch_end(&self) {
        self.fetches_in_flight.fetch_sub(1, Ordering::SeqCst);
    }

    fn fetch_time(&self, elapsed: Duration) {
        self.time_spent_fetching_ms
            .fetch_add(elapsed.as_millis() as u64, Ordering::SeqCst);
    }

    fn state_report(&self, report: DeviceReport) {
        if let Some(downloaded) = report.update_downloaded {
            self.update_downloaded.store(downloaded, Ordering::SeqCst);
        }
    }

    fn best_delta_source(&self, image: &Image, available: &[Image]) -> Option<String> {
        best_delta_source(image, available)
    }
}

pub struct StepExecutor {
    managers: Managers,
    locks: Arc<UpdateLocks>,
    dependents: Arc<dyn DependentDevices>,
    callbacks: Arc<dyn Callbacks>,
    fetch_options: FetchOptions,
    lock_override: bool,
    local_mode: bool,

    /// Release commit each application was last converged to.
    commits: Mutex<BTreeMap<AppId, String>>,
}

impl StepExecutor {
    pub fn new(
        managers: Managers,
        locks: Arc<UpdateLocks>,
        dependents: Arc<dyn DependentDevices>,
        callbacks: Arc<dyn Callbacks>,
        config: &Config,
    ) -> Self {
        Self {
            managers,
            locks,
            dependents,
            callbacks,
            fetch_options: config.fetch_options(),
            lock_override: config.lock_override,
            local_mode: config.local_mode,
            commits: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn commit(&self, app_id: AppId) -> Option<String> {
        self.commits.lock().ok()?.get(&app_id).cloned()
    }

    pub async fn execute(&self, step: &CompositionStep, options: ExecuteOptions) -> Result<()> {
        debug!(step = %step, "Executing step");
        match step {
            CompositionStep::Stop { current, options: flags } => {
                self.locking(current, flags.lock, options, || async {
                    self.managers.services.stop(current, flags.wait).await?;
                    self.killed(current);
                    Ok(())
                })
                .await
            }
            CompositionStep::Kill { current, options: flags } => {
                let kill = KillOptions {
                    remove_container: flags.remove_container,
                    wait: flags.wait,
                };
                self.locking(current, flags.lock, options, || async {
                    self.managers.services.kill(current, kill).await?;
                    self.killed(current);
                    Ok(())
                })
                .await
            }
            // Only emitted for containers that are no longer running
            CompositionStep::Remove { current } => self.managers.services.remove(current).await,
            CompositionStep::UpdateMetadata { current, target, lock } => {
                self.locking(current, *lock, options, || {
                    self.managers.services.update_metadata(current, target)
                })
                .await
            }
            CompositionStep::Restart { current, target, lock } => {
                self.locking(current, *lock, options, || async {
                    let kill = KillOptions {
                        remove_container: true,
                        wait: true,
                    };
                    self.managers.services.kill(current, kill).await?;
                    self.killed(current);
                    let id = self.managers.services.start(target).await?;
                    self.callbacks.container_started(&id);
                    Ok(())
                })
                .await
            }
            CompositionStep::Start { target } => {
                let id = self.managers.services.start(target).await?;
                self.callbacks.container_started(&id);
                Ok(())
            }
            // Only the final kill runs under the app lock
            CompositionStep::Handover { current, target, options: flags } => {
                let id = self.managers.services.start_handover(target).await?;
                self.callbacks.container_started(&id);
                self.managers.services.wait_for_handover(target, flags.timeout).await;
                self.locking(current, flags.lock, options, || async {
                    self.managers.services.kill(current, KillOptions::default()).await?;
                    self.killed(current);
                    Ok(())
                })
                .await
            }
            CompositionStep::Fetch { image, service_name } => self.fetch(image, service_name).await,
            CompositionStep::RemoveImage { image } => self.managers.images.remove(image).await,
            CompositionStep::SaveImage { image } => self.managers.images.save(image).await,
            CompositionStep::Cleanup => {
                if self.local_mode {
                    return Ok(());
                }
                self.managers.images.cleanup().await
            }
            CompositionStep::CreateNetwork { target } => self.managers.networks.create(target).await,
            CompositionStep::CreateVolume { target } => self.managers.volumes.create(target).await,
            CompositionStep::RemoveNetwork { current } => self.managers.networks.remove(current).await,
            CompositionStep::RemoveVolume { current } => self.managers.volumes.remove(current).await,
            CompositionStep::EnsureSupervisorNetwork => {
                self.managers.networks.ensure_supervisor_network().await
            }
            CompositionStep::StopAll { lock } => self.stop_all(*lock, options).await,
            CompositionStep::UpdateCommit { app_id, commit } => {
                info!(app_id = %app_id, commit = %commit, "Updating current commit");
                if let Ok(mut commits) = self.commits.lock() {
                    commits.insert(*app_id, commit.clone());
                }
                Ok(())
            }
            CompositionStep::Noop => Ok(()),
            CompositionStep::Dependent(step) => self.dependents.execute(step).await,
        }
    }

    /// Stops every managed container, leaving the containers in place.
    async fn stop_all(&self, lock: LockOptions, options: ExecuteOptions) -> Result<()> {
        let services = self.managers.services.get_all().await?;
        let results = join_all(services.iter().map(|service| {
            self.locking(service, lock, options, move || async move {
                let kill = KillOptions {
                    remove_container: false,
                    wait: true,
                };
                self.managers.services.kill(service, kill).await?;
                self.killed(service);
                Ok(())
            })
        }))
        .await;
        results.into_iter().collect()
    }

    async fn fetch(&self, image: &Image, service_name: &str) -> Result<()> {
        let started = Instant::now();
        self.callbacks.fetch_start();
        let outcome = async {
            let available = self.managers.images.available().await?;
            let source = self.callbacks.best_delta_source(image, &available);
            debug!(
                image = %image.name,
                service = %service_name,
                delta_source = source.as_deref().unwrap_or("none"),
                "Fetching image"
            );
            self.managers
                .images
                .trigger_fetch(image, &self.fetch_options, source.as_deref())
                .await
        }
        .await;
        self.callbacks.fetch_end();
        self.callbacks.fetch_time(started.elapsed());

        if outcome? {
            self.callbacks.state_report(DeviceReport {
                update_downloaded: Some(true),
            });
        }
        Ok(())
    }

    /// Runs `body` under the service's app lock, honouring the step's flags,
    /// the caller's overrides and the configured lock override.
    async fn locking<F, Fut>(
        &self,
        service: &Service,
        lock: LockOptions,
        options: ExecuteOptions,
        body: F,
    ) -> Result<()>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        if lock.skip_lock || options.skip_lock || service.is_legacy() {
            return body().await;
        }
        let force = lock.force || options.force || self.lock_override;
        self.locks.with_lock(service.app_id, force, body).await
    }

    fn killed(&self, service: &Service) {
        if let Some(id) = &service.container_id {
            self.callbacks.container_killed(id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::Application;
    use crate::compose::{TargetApp, TargetService};
    use crate::dependent::NoDependentDevices;
    use crate::engine::mock::{EngineOp, MockEngine};
    use crate::engine::ContainerEngine;
    use crate::error::ComposeError;
    use crate::steps::DependentStep;
    use skiff_events::{EventKind, MemorySink};
    use skiff_id::{ImageId, ReleaseId, ServiceId};
    use tempfile::TempDir;

    struct Fixture {
        engine: Arc<MockEngine>,
        events: Arc<MemorySink>,
        tracker: Arc<StateTracker>,
        executor: StepExecutor,
        config: Config,
        _dir: TempDir,
    }

    fn fixture(engine: MockEngine) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let config = Config {
            lock_dir: dir.path().to_path_buf(),
            lock_timeout: Duration::from_secs(5),
            ..Config::default()
        };
        let engine = Arc::new(engine);
        let events = Arc::new(MemorySink::new());
        let managers = Managers::new(engine.clone(), events.clone(), &config);
        let locks = Arc::new(UpdateLocks::new(
            config.lock_dir.clone(),
            config.lock_timeout,
            events.clone(),
        ));
        let tracker = Arc::new(StateTracker::default());
        let executor = StepExecutor::new(
            managers,
            locks,
            Arc::new(NoDependentDevices),
            tracker.clone(),
            &config,
        );
        Fixture {
            engine,
            events,
            tracker,
            executor,
            config,
            _dir: dir,
        }
    }

    /// Builds the target app with `services` and brings it up on the engine.
    async fn running_app(fx: &Fixture, app: u32, services: &[&str]) -> Vec<Service> {
        let app_id = AppId::new(app).unwrap();
        let mut images = BTreeMap::new();
        let mut target = TargetApp {
            name: format!("app{app}"),
            release_id: Some(ReleaseId::new(1).unwrap()),
            ..TargetApp::default()
        };
        for (i, name) in services.iter().enumerate() {
            let image = format!("registry/{name}:1");
            fx.engine.add_image(&image);
            images.insert(image.clone(), fx.engine.inspect_image(&image).await.unwrap());
            target.services.insert(
                ServiceId::new(app * 100 + i as u32 + 1).unwrap(),
                TargetService {
                    service_name: name.to_string(),
                    image,
                    image_id: Some(ImageId::new(app * 100 + i as u32 + 1).unwrap()),
                    ..TargetService::default()
                },
            );
        }
        let app = Application::from_target(app_id, &target, &images, &fx.config.device_metadata()).unwrap();
        for network in app.networks.values() {
            fx.executor
                .execute(&CompositionStep::CreateNetwork { target: network.clone() }, ExecuteOptions::default())
                .await
                .unwrap();
        }
        for service in &app.services {
            fx.executor
                .execute(&CompositionStep::start(service.clone()), ExecuteOptions::default())
                .await
                .unwrap();
        }
        fx.executor
            .managers
            .services
            .get_all()
            .await
            .unwrap()
            .into_iter()
            .filter(|s| s.app_id == app_id)
            .collect()
    }

    #[tokio::test]
    async fn test_noop_and_unknown_dependent_action() {
        let fx = fixture(MockEngine::new());
        fx.executor
            .execute(&CompositionStep::Noop, ExecuteOptions::default())
            .await
            .unwrap();

        let step = CompositionStep::Dependent(DependentStep {
            action: "sendDependentHooks".to_string(),
            payload: serde_json::Value::Null,
        });
        let result = fx.executor.execute(&step, ExecuteOptions::default()).await;
        assert!(matches!(result, Err(ComposeError::UnknownAction(name)) if name == "sendDependentHooks"));
    }

    #[tokio::test]
    async fn test_update_commit_is_recorded() {
        let fx = fixture(MockEngine::new());
        let app_id = AppId::new(7).unwrap();
        fx.executor
            .execute(
                &CompositionStep::UpdateCommit {
                    app_id,
                    commit: "abc123".to_string(),
                },
                ExecuteOptions::default(),
            )
            .await
            .unwrap();
        assert_eq!(fx.executor.commit(app_id).as_deref(), Some("abc123"));
    }

    #[tokio::test]
    async fn test_start_and_kill_track_containers() {
        let fx = fixture(MockEngine::new());
        let services = running_app(&fx, 1, &["web"]).await;
        let id = services[0].container_id.clone().unwrap();
        assert!(fx.tracker.started_containers().contains(&id));

        fx.executor
            .execute(&CompositionStep::kill(services[0].clone()), ExecuteOptions::default())
            .await
            .unwrap();
        assert!(!fx.tracker.started_containers().contains(&id));
        assert!(fx.engine.containers().is_empty());
        assert_eq!(fx.events.count(EventKind::TakeLock), 1);
        assert_eq!(fx.events.count(EventKind::ReleaseLock), 1);
    }

    #[tokio::test]
    async fn test_kill_keeping_container() {
        let fx = fixture(MockEngine::new());
        let services = running_app(&fx, 1, &["web"]).await;
        fx.executor
            .execute(
                &CompositionStep::kill_keep_container(services[0].clone()),
                ExecuteOptions::default(),
            )
            .await
            .unwrap();
        let containers = fx.engine.containers();
        assert_eq!(containers.len(), 1);
        assert!(!containers[0].state.running);
        assert!(fx.engine.calls_of(EngineOp::RemoveContainer).is_empty());
    }

    #[tokio::test]
    async fn test_same_app_lock_steps_never_overlap() {
        let fx = fixture(MockEngine::with_op_delay(Duration::from_millis(50)));
        let services = running_app(&fx, 1, &["web", "worker"]).await;
        assert_eq!(fx.engine.max_in_flight(), 1);

        let steps: Vec<CompositionStep> = services.iter().cloned().map(CompositionStep::stop).collect();
        let results = join_all(
            steps
                .iter()
                .map(|step| fx.executor.execute(step, ExecuteOptions::default())),
        )
        .await;
        assert!(results.iter().all(Result::is_ok));
        assert_eq!(fx.engine.max_in_flight(), 1);
    }

    #[tokio::test]
    async fn test_different_apps_run_concurrently() {
        let fx = fixture(MockEngine::with_op_delay(Duration::from_millis(50)));
        let mut services = running_app(&fx, 1, &["web"]).await;
        services.extend(running_app(&fx, 2, &["web"]).await);

        let steps: Vec<CompositionStep> = services.iter().cloned().map(CompositionStep::stop).collect();
        let results = join_all(
            steps
                .iter()
                .map(|step| fx.executor.execute(step, ExecuteOptions::default())),
        )
        .await;
        assert!(results.iter().all(Result::is_ok));
        assert_eq!(fx.engine.max_in_flight(), 2);
    }

    #[tokio::test]
    async fn test_skip_lock_and_legacy_containers_bypass_the_lock() {
        let fx = fixture(MockEngine::new());
        let services = running_app(&fx, 1, &["web"]).await;
        fx.executor
            .execute(
                &CompositionStep::stop(services[0].clone()),
                ExecuteOptions {
                    skip_lock: true,
                    ..ExecuteOptions::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(fx.events.count(EventKind::TakeLock), 0);

        let mut legacy = services[0].clone();
        legacy
            .config
            .labels
            .insert(crate::compose::labels::LEGACY_CONTAINER.to_string(), "true".to_string());
        fx.executor
            .execute(&CompositionStep::stop(legacy), ExecuteOptions::default())
            .await
            .unwrap();
        assert_eq!(fx.events.count(EventKind::TakeLock), 0);
    }

    #[tokio::test]
    async fn test_locked_app_refuses_unless_forced() {
        let fx = fixture(MockEngine::new());
        let services = running_app(&fx, 1, &["web"]).await;
        let lock_file = services[0].lock_dir(&fx.config.lock_dir).join("updates.lock");
        std::fs::create_dir_all(lock_file.parent().unwrap()).unwrap();
        std::fs::write(&lock_file, b"").unwrap();

        let step = CompositionStep::stop(services[0].clone());
        let result = fx.executor.execute(&step, ExecuteOptions::default()).await;
        assert!(matches!(result, Err(ComposeError::UpdatesLocked { .. })));
        assert!(fx.engine.calls_of(EngineOp::StopContainer).is_empty());

        fx.executor
            .execute(
                &step,
                ExecuteOptions {
                    force: true,
                    ..ExecuteOptions::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(fx.engine.calls_of(EngineOp::StopContainer).len(), 1);
        assert!(!lock_file.exists());
    }

    #[tokio::test]
    async fn test_fetch_reports_timing_and_download() {
        let fx = fixture(MockEngine::new());
        let image = Image {
            name: "registry/web:2".to_string(),
            app_id: AppId::new(1).unwrap(),
            service_id: ServiceId::new(1).unwrap(),
            service_name: "web".to_string(),
            image_id: ImageId::new(2).unwrap(),
            release_id: ReleaseId::new(2).unwrap(),
            dependent: false,
            docker_image_id: None,
        };
        let step = CompositionStep::Fetch {
            image: image.clone(),
            service_name: "web".to_string(),
        };
        fx.executor.execute(&step, ExecuteOptions::default()).await.unwrap();
        assert!(fx.tracker.update_downloaded());
        assert_eq!(fx.tracker.fetches_in_flight(), 0);
        assert_eq!(fx.engine.calls_of(EngineOp::PullImage), vec!["registry/web:2"]);
        let available = fx.executor.managers.images.available().await.unwrap();
        assert!(available.iter().any(|a| a.same_metadata(&image)));
    }

    #[tokio::test]
    async fn test_stop_all_leaves_containers() {
        let fx = fixture(MockEngine::new());
        running_app(&fx, 1, &["web"]).await;
        running_app(&fx, 2, &["api"]).await;
        fx.executor
            .execute(
                &CompositionStep::StopAll {
                    lock: LockOptions::default(),
                },
                ExecuteOptions::default(),
            )
            .await
            .unwrap();
        let containers = fx.engine.containers();
        assert_eq!(containers.len(), 2);
        assert!(containers.iter().all(|c| !c.state.running));
        assert!(fx.tracker.started_containers().is_empty());
    }
}
