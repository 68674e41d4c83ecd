use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use skiff_events::{EventKind, EventSink, ResourceRef, SystemEvent};
use tracing::{debug, info, warn};

use crate::compose::labels;
use crate::compose::{Service, ServiceStatus};
use crate::engine::{ContainerEngine, EngineError};
use crate::error::{ComposeError, Result};

const HANDOVER_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Flags for [`ServiceManager::kill`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KillOptions {
    /// Remove the container once it has stopped.
    pub remove_container: bool,
    /// Also wait for the engine to report the container's exit.
    pub wait: bool,
}

impl Default for KillOptions {
    fn default() -> Self {
        Self {
            remove_container: true,
            wait: false,
        }
    }
}

/// Container lifecycle for managed services.
pub struct ServiceManager {
    engine: Arc<dyn ContainerEngine>,
    events: Arc<dyn EventSink>,
    lock_dir: PathBuf,

    /// Containers with a stop in progress, reported as `Stopping`.
    stopping: Mutex<HashSet<String>>,
}

/// Removes a container id from the stopping set when dropped.
struct StoppingGuard<'a> {
    set: &'a Mutex<HashSet<String>>,
    id: String,
}

impl Drop for StoppingGuard<'_> {
    fn drop(&mut self) {
        if let Ok(mut set) = self.set.lock() {
            set.remove(&self.id);
        }
    }
}

impl ServiceManager {
    pub fn new(
        engine: Arc<dyn ContainerEngine>,
        events: Arc<dyn EventSink>,
        lock_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            engine,
            events,
            lock_dir: lock_dir.into(),
            stopping: Mutex::new(HashSet::new()),
        }
    }

    /// Every managed container, as services.
    pub async fn get_all(&self) -> Result<Vec<Service>> {
        let mut services = Vec::new();
        for summary in self.engine.list_containers(labels::SUPERVISED).await? {
            let inspect = match self.engine.inspect_container(&summary.id).await {
                Ok(inspect) => inspect,
                // Removed between list and inspect
                Err(e) if e.is_not_found() => continue,
                Err(e) => return Err(e.into()),
            };
            match Service::from_container(&inspect) {
                Ok(mut service) => {
                    if self.is_stopping(&inspect.id) {
                        service.status = ServiceStatus::Stopping;
                    }
                    services.push(service);
                }
                Err(e) => warn!(container = %summary.name, error = %e, "Ignoring unmanaged container"),
            }
        }
        Ok(services)
    }

    pub fn is_stopping(&self, container_id: &str) -> bool {
        self.stopping
            .lock()
            .map(|set| set.contains(container_id))
            .unwrap_or(false)
    }

    fn mark_stopping(&self, container_id: &str) -> StoppingGuard<'_> {
        if let Ok(mut set) = self.stopping.lock() {
            set.insert(container_id.to_string());
        }
        StoppingGuard {
            set: &self.stopping,
            id: container_id.to_string(),
        }
    }

    /// Creates the container if needed and starts it when the service should
    /// be running. Returns the container id.
    pub async fn start(&self, service: &Service) -> Result<String> {
        let container_id = match self.find_container(service).await? {
            Some(id) => id,
            None => self.create(service).await?,
        };
        if !service.config.running {
            return Ok(container_id);
        }

        self.emit(EventKind::StartService, service, None);
        info!(service = %service.service_name, app_id = %service.app_id, "Starting service");
        match self.engine.start_container(&container_id).await {
            Ok(()) => self.emit(EventKind::StartServiceSuccess, service, None),
            Err(e) if e.is_not_modified() => self.emit(EventKind::StartServiceNoop, service, None),
            Err(e) => {
                self.emit(EventKind::StartServiceError, service, Some(&e));
                return Err(e.into());
            }
        }
        Ok(container_id)
    }

    async fn find_container(&self, service: &Service) -> Result<Option<String>> {
        let wanted = format!("/{}", service.container_name());
        Ok(self
            .engine
            .list_containers(labels::SUPERVISED)
            .await?
            .into_iter()
            .find(|c| c.name == wanted)
            .map(|c| c.id))
    }

    async fn create(&self, service: &Service) -> Result<String> {
        let mut spec = service.to_container_create();
        if let Some(peer) = service.config.network_mode.strip_prefix("service:") {
            let peer_id = self
                .get_all()
                .await?
                .into_iter()
                .find(|s| s.app_id == service.app_id && s.service_name == peer)
                .and_then(|s| s.container_id)
                .ok_or_else(|| {
                    ComposeError::InternalInconsistency(format!(
                        "network mode of {} refers to missing service {peer}",
                        service.service_name
                    ))
                })?;
            spec.host_config.network_mode = format!("container:{peer_id}");
        }

        let dir = service.lock_dir(&self.lock_dir);
        if let Err(e) = tokio::fs::create_dir_all(&dir).await {
            warn!(path = %dir.display(), error = %e, "Could not create service lock directory");
        }

        self.emit(EventKind::InstallService, service, None);
        info!(container = %spec.name, "Creating container");
        let id = match self.engine.create_container(&spec).await {
            Ok(id) => id,
            Err(e) => {
                self.emit(EventKind::InstallServiceError, service, Some(&e));
                return Err(e.into());
            }
        };
        for (network, endpoint) in service.extra_networks() {
            if let Err(e) = self.engine.connect_network(&network, &id, &endpoint).await {
                self.emit(EventKind::InstallServiceError, service, Some(&e));
                return Err(e.into());
            }
        }
        self.emit(EventKind::InstallServiceSuccess, service, None);
        Ok(id)
    }

    /// Stops the service's container, leaving it in place.
    pub async fn stop(&self, service: &Service, wait: bool) -> Result<()> {
        self.kill(
            service,
            KillOptions {
                remove_container: false,
                wait,
            },
        )
        .await
    }

    /// Stops the container within its grace period, falling back to a kill,
    /// and removes it if asked to.
    pub async fn kill(&self, service: &Service, options: KillOptions) -> Result<()> {
        let container_id = require_container(service)?;
        let _stopping = self.mark_stopping(container_id);

        self.emit(EventKind::StopService, service, None);
        info!(service = %service.service_name, container = %container_id, "Stopping container");
        let grace = Duration::from_secs(service.config.stop_grace_period);
        let stopped = match self.engine.stop_container(container_id, grace).await {
            Err(EngineError::Timeout(_)) => self.engine.kill_container(container_id).await,
            other => other,
        };
        match stopped {
            Ok(()) => {}
            Err(e) if e.is_not_modified() => {
                debug!(container = %container_id, "Container was already stopped");
            }
            Err(e) if e.is_not_found() => {
                self.emit(EventKind::StopServiceNoop, service, None);
                return Ok(());
            }
            Err(e) => {
                self.emit(EventKind::StopServiceError, service, Some(&e));
                return Err(e.into());
            }
        }

        if options.wait {
            let exit_code = self.engine.wait_container(container_id).await?;
            debug!(container = %container_id, exit_code, "Container exited");
        }
        if options.remove_container {
            self.remove_container(service, container_id).await?;
        }
        self.emit(EventKind::StopServiceSuccess, service, None);
        Ok(())
    }

    /// Removes a container that is no longer running.
    pub async fn remove(&self, service: &Service) -> Result<()> {
        let container_id = require_container(service)?;
        if service.status == ServiceStatus::Dead {
            self.emit(EventKind::RemoveDeadService, service, None);
        }
        info!(service = %service.service_name, container = %container_id, "Removing container");
        self.remove_container(service, container_id).await
    }

    async fn remove_container(&self, service: &Service, container_id: &str) -> Result<()> {
        match self.engine.remove_container(container_id, true).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => {
                if service.status == ServiceStatus::Dead {
                    self.emit(EventKind::RemoveDeadServiceError, service, Some(&e));
                }
                Err(e.into())
            }
        }
    }

    /// Renames the container so its name carries the target's image and
    /// release ids.
    pub async fn update_metadata(&self, current: &Service, target: &Service) -> Result<()> {
        let container_id = require_container(current)?;
        self.emit(EventKind::UpdateMetadata, target, None);
        let name = target.container_name();
        info!(container = %container_id, name = %name, "Updating container metadata");
        if let Err(e) = self.engine.rename_container(container_id, &name).await {
            self.emit(EventKind::UpdateMetadataError, target, Some(&e));
            return Err(e.into());
        }
        Ok(())
    }

    /// Starts the container taking over from an older one of the same service.
    pub async fn start_handover(&self, target: &Service) -> Result<String> {
        self.emit(EventKind::HandoverService, target, None);
        self.start(target).await.inspect_err(|e| {
            self.emit(EventKind::HandoverServiceError, target, Some(e));
        })
    }

    /// Waits for `target` to signal handover completion, or for `timeout` to
    /// pass. The old container is left for the caller to kill.
    pub async fn wait_for_handover(&self, target: &Service, timeout: Duration) {
        let marker = target.handover_complete_path(&self.lock_dir);
        let waited = tokio::time::timeout(timeout, async {
            while !tokio::fs::try_exists(&marker).await.unwrap_or(false) {
                tokio::time::sleep(HANDOVER_POLL_INTERVAL).await;
            }
        })
        .await;
        match waited {
            Ok(()) => info!(service = %target.service_name, "Handover complete"),
            Err(_) => info!(
                service = %target.service_name,
                timeout_ms = timeout.as_millis() as u64,
                "Handover timed out, killing old container"
            ),
        }
        if let Err(e) = tokio::fs::remove_file(&marker).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %marker.display(), error = %e, "Could not remove handover marker");
            }
        }
    }

    fn emit(&self, kind: EventKind, service: &Service, error: Option<&dyn std::fmt::Display>) {
        let mut event = SystemEvent::new(kind).with_resource(ResourceRef::Service {
            app_id: service.app_id,
            service_name: service.service_name.clone(),
            image: service.image_name.clone(),
        });
        if let Some(error) = error {
            event = event.with_error(error);
        }
        self.events.emit(event);
    }
}

fn require_container(service: &Service) -> Result<&str> {
    service.container_id.as_deref().ok_or_else(|| {
        ComposeError::InternalInconsistency(format!(
            "service {} has no container",
            service.service_name
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compose::service::{TargetContext, TargetService};
    use crate::compose::ComposeNetwork;
    use crate::compose::Network;
    use crate::config::DeviceMetadata;
    use crate::engine::{EngineOp, MockEngine};
    use crate::managers::NetworkManager;
    use skiff_events::MemorySink;
    use skiff_id::{AppId, ImageId, ReleaseId, ServiceId};
    use std::collections::BTreeMap;

    struct Fixture {
        engine: Arc<MockEngine>,
        sink: Arc<MemorySink>,
        manager: ServiceManager,
        lock_dir: tempfile::TempDir,
    }

    async fn fixture() -> Fixture {
        let engine = Arc::new(MockEngine::new());
        let sink = Arc::new(MemorySink::new());
        let lock_dir = tempfile::tempdir().unwrap();
        NetworkManager::new(engine.clone(), sink.clone())
            .create(&Network::from_target(app(), "default", &ComposeNetwork::default()).unwrap())
            .await
            .unwrap();
        let manager = ServiceManager::new(engine.clone(), sink.clone(), lock_dir.path());
        Fixture {
            engine,
            sink,
            manager,
            lock_dir,
        }
    }

    fn app() -> AppId {
        AppId::new(1).unwrap()
    }

    async fn service(fx: &Fixture, name: &str, image: &str, image_id: u32) -> Service {
        let image_info = fx.engine.inspect_image(image).await.ok();
        let device = DeviceMetadata {
            lock_dir: fx.lock_dir.path().to_path_buf(),
            ..DeviceMetadata::default()
        };
        let record = TargetService {
            service_name: name.to_string(),
            image: image.to_string(),
            image_id: Some(ImageId::new(image_id).unwrap()),
            ..TargetService::default()
        };
        Service::from_target(
            &record,
            &TargetContext {
                app_id: app(),
                app_name: "app",
                commit: None,
                release_id: ReleaseId::new(1).unwrap(),
                service_id: ServiceId::new(10).unwrap(),
                image_info: image_info.as_ref(),
                device: &device,
            },
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_start_creates_and_runs() {
        let fx = fixture().await;
        fx.engine.add_image("web:1");
        let web = service(&fx, "web", "web:1", 100).await;

        let id = fx.manager.start(&web).await.unwrap();
        let again = fx.manager.start(&web).await.unwrap();
        assert_eq!(id, again);
        assert_eq!(fx.engine.calls_of(EngineOp::CreateContainer), vec!["web_100_1"]);
        assert_eq!(fx.sink.count(EventKind::StartServiceNoop), 1);

        let current = fx.manager.get_all().await.unwrap();
        assert_eq!(current.len(), 1);
        assert_eq!(current[0].status, ServiceStatus::Running);
        assert!(current[0].is_equal(&web, &BTreeMap::new()));
        assert!(web.lock_dir(fx.lock_dir.path()).is_dir());
    }

    #[tokio::test]
    async fn test_kill_removes_by_default() {
        let fx = fixture().await;
        fx.engine.add_image("web:1");
        let web = service(&fx, "web", "web:1", 100).await;
        fx.manager.start(&web).await.unwrap();
        let current = fx.manager.get_all().await.unwrap().remove(0);

        fx.manager.kill(&current, KillOptions::default()).await.unwrap();
        assert!(fx.engine.containers().is_empty());
        assert!(!fx.manager.is_stopping(current.container_id.as_deref().unwrap()));

        // Killing a container that is already gone is a no-op
        fx.manager.kill(&current, KillOptions::default()).await.unwrap();
        assert_eq!(fx.sink.count(EventKind::StopServiceNoop), 1);
    }

    #[tokio::test]
    async fn test_stop_keeps_container() {
        let fx = fixture().await;
        fx.engine.add_image("web:1");
        let web = service(&fx, "web", "web:1", 100).await;
        fx.manager.start(&web).await.unwrap();
        let current = fx.manager.get_all().await.unwrap().remove(0);

        fx.manager.stop(&current, true).await.unwrap();
        let after = fx.manager.get_all().await.unwrap();
        assert_eq!(after[0].status, ServiceStatus::Exited);

        fx.manager.remove(&after[0]).await.unwrap();
        assert!(fx.manager.get_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_update_metadata_renames() {
        let fx = fixture().await;
        fx.engine.add_image("web:1");
        let web = service(&fx, "web", "web:1", 100).await;
        fx.manager.start(&web).await.unwrap();
        let current = fx.manager.get_all().await.unwrap().remove(0);

        let mut target = web.clone();
        target.release_id = ReleaseId::new(2).unwrap();
        fx.manager.update_metadata(&current, &target).await.unwrap();

        let renamed = fx.manager.get_all().await.unwrap().remove(0);
        assert_eq!(renamed.release_id, target.release_id);
        assert!(renamed.is_equal(&target, &BTreeMap::new()));
    }

    #[tokio::test]
    async fn test_handover_waits_for_marker() {
        let fx = fixture().await;
        fx.engine.add_image("web:1");
        fx.engine.add_image("web:2");
        let old = service(&fx, "web", "web:1", 100).await;
        fx.manager.start(&old).await.unwrap();
        let current = fx.manager.get_all().await.unwrap().remove(0);

        let new = service(&fx, "web", "web:2", 101).await;
        let marker = new.handover_complete_path(fx.lock_dir.path());
        std::fs::create_dir_all(marker.parent().unwrap()).unwrap();
        std::fs::write(&marker, b"").unwrap();

        fx.manager.start_handover(&new).await.unwrap();
        assert_eq!(fx.manager.get_all().await.unwrap().len(), 2);
        fx.manager.wait_for_handover(&new, Duration::from_secs(30)).await;
        fx.manager.kill(&current, KillOptions::default()).await.unwrap();

        let after = fx.manager.get_all().await.unwrap();
        assert_eq!(after.len(), 1);
        assert_eq!(after[0].image_id, new.image_id);
        assert!(!marker.exists());
    }

    #[tokio::test]
    async fn test_handover_times_out() {
        let fx = fixture().await;
        fx.engine.add_image("web:1");
        fx.engine.add_image("web:2");
        let old = service(&fx, "web", "web:1", 100).await;
        fx.manager.start(&old).await.unwrap();
        let current = fx.manager.get_all().await.unwrap().remove(0);
        let new = service(&fx, "web", "web:2", 101).await;

        fx.manager.start_handover(&new).await.unwrap();
        let started = std::time::Instant::now();
        fx.manager.wait_for_handover(&new, Duration::from_millis(300)).await;
        assert!(started.elapsed() >= Duration::from_millis(300));
        fx.manager.kill(&current, KillOptions::default()).await.unwrap();
        assert_eq!(fx.manager.get_all().await.unwrap().len(), 1);
    }
}
