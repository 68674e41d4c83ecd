//! Application aggregate and the current-vs-target diff.
//!
//! An [`Application`] groups the services, networks and volumes of one app id.
//! Two instances are compared per pass: one rebuilt from the engine, one from
//! the target record. The diff only ever returns the steps that can safely run
//! *now*; follow-up steps appear in later passes once the engine reflects the
//! earlier ones.

use std::collections::{BTreeMap, BTreeSet, HashSet};

use serde::Serialize;
use skiff_id::{AppId, ImageId, ServiceId};

use crate::compose::{
    ComposeNetwork, Image, Network, Service, ServiceStatus, TargetApp, TargetContext, UpdateStrategy,
    Volume,
};
use crate::config::DeviceMetadata;
use crate::engine::ImageInspect;
use crate::error::{ComposeError, Result};
use crate::steps::CompositionStep;

/// Network every application gets, whether declared or not.
pub const DEFAULT_NETWORK: &str = "default";

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Application {
    pub app_id: AppId,
    pub name: String,
    pub commit: Option<String>,
    /// Current apps may hold several containers for one service id.
    pub services: Vec<Service>,
    pub networks: BTreeMap<String, Network>,
    pub volumes: BTreeMap<String, Volume>,
}

/// Device facts the diff needs beyond the two applications.
pub struct UpdateContext<'a> {
    pub local_mode: bool,
    pub available_images: &'a [Image],
    /// Container ids of the current app, by service id.
    pub container_ids: &'a BTreeMap<ServiceId, String>,
    pub downloading: &'a [ImageId],
    /// Containers this agent has started since boot.
    pub started_containers: &'a HashSet<String>,
}

impl UpdateContext<'_> {
    pub fn needs_download(&self, target: &Service) -> bool {
        if self.local_mode {
            return false;
        }
        let image = target.image();
        !self.available_images.iter().any(|available| {
            available.docker_image_id.as_deref() == Some(target.config.image.as_str())
                || available.is_same_image(&image)
        })
    }

    fn is_downloading(&self, target: &Service) -> bool {
        self.downloading.contains(&target.image_id)
    }
}

impl Application {
    pub fn empty(app_id: AppId) -> Self {
        Self {
            app_id,
            name: String::new(),
            commit: None,
            services: Vec::new(),
            networks: BTreeMap::new(),
            volumes: BTreeMap::new(),
        }
    }

    /// Builds the target aggregate. `images` holds the engine's view of every
    /// target image already on the device, by image name.
    pub fn from_target(
        app_id: AppId,
        app: &TargetApp,
        images: &BTreeMap<String, ImageInspect>,
        device: &DeviceMetadata,
    ) -> Result<Self> {
        let mut networks = BTreeMap::new();
        for (name, compose) in &app.networks {
            networks.insert(name.clone(), Network::from_target(app_id, name, compose)?);
        }
        if !networks.contains_key(DEFAULT_NETWORK) {
            networks.insert(
                DEFAULT_NETWORK.to_string(),
                Network::from_target(app_id, DEFAULT_NETWORK, &ComposeNetwork::default())?,
            );
        }
        let volumes: BTreeMap<String, Volume> = app
            .volumes
            .iter()
            .map(|(name, compose)| (name.clone(), Volume::from_target(app_id, name, compose)))
            .collect();

        let mut services = Vec::with_capacity(app.services.len());
        for (service_id, record) in &app.services {
            let invalid = |message: String| ComposeError::InvalidServiceDefinition {
                service: record.service_name.clone(),
                message,
            };
            let release_id = app
                .release_id
                .ok_or_else(|| invalid("application has no release id".to_string()))?;
            let ctx = TargetContext {
                app_id,
                app_name: &app.name,
                commit: app.commit.as_deref(),
                release_id,
                service_id: *service_id,
                image_info: images.get(&record.image),
                device,
            };
            let service = Service::from_target(record, &ctx)?;

            let prefix = format!("{app_id}_");
            for network in service.config.networks.keys() {
                if let Some(name) = network.strip_prefix(&prefix) {
                    if !networks.contains_key(name) {
                        return Err(invalid(format!("undeclared network {name}")));
                    }
                }
            }
            for volume in service.named_volumes() {
                if !volumes.contains_key(&volume) {
                    return Err(invalid(format!("undeclared volume {volume}")));
                }
            }
            services.push(service);
        }

        Ok(Self {
            app_id,
            name: app.name.clone(),
            commit: app.commit.clone(),
            services,
            networks,
            volumes,
        })
    }

    /// Steps that move this (current) application towards `target`.
    pub fn next_steps_for_app_update(
        &self,
        target: &Application,
        ctx: &UpdateContext<'_>,
    ) -> Result<Vec<CompositionStep>> {
        if self.app_id != target.app_id {
            return Err(ComposeError::InternalInconsistency(format!(
                "cannot diff app {} against app {}",
                self.app_id, target.app_id
            )));
        }
        let peers = self.peer_containers(target, ctx.container_ids);
        let mut steps = Vec::new();

        let network_pairs = component_pairs(&self.networks, &target.networks, Network::is_equal_config);
        let volume_pairs = component_pairs(&self.volumes, &target.volumes, Volume::is_equal_config);
        let changing = Changing {
            networks: network_pairs
                .iter()
                .filter_map(|pair| match pair {
                    (Some(current), Some(_)) => Some(current.engine_name()),
                    _ => None,
                })
                .collect(),
            volumes: volume_pairs
                .iter()
                .filter_map(|pair| match pair {
                    (Some(current), Some(_)) => Some(current.name.clone()),
                    _ => None,
                })
                .collect(),
        };

        // Services
        let mut current_by_id: BTreeMap<ServiceId, Vec<&Service>> = BTreeMap::new();
        let mut dead = BTreeSet::new();
        for service in &self.services {
            if service.status == ServiceStatus::Dead {
                dead.insert(service.service_id);
                push_unique(&mut steps, CompositionStep::Remove { current: service.clone() });
            } else {
                current_by_id.entry(service.service_id).or_default().push(service);
            }
        }
        let target_by_id: BTreeMap<ServiceId, &Service> =
            target.services.iter().map(|s| (s.service_id, s)).collect();

        for (service_id, containers) in current_by_id.iter_mut() {
            containers.sort_by(|a, b| b.created_at.cmp(&a.created_at));
            match target_by_id.get(service_id) {
                None => {
                    for current in containers.iter() {
                        push_unique(&mut steps, orphan_step(current));
                    }
                }
                Some(wanted) => {
                    let (newest, older) = containers.split_at(1);
                    for spurious in older {
                        push_unique(&mut steps, kill_step(spurious));
                    }
                    for step in self.service_steps(Some(newest[0]), wanted, target, ctx, &peers, &changing) {
                        push_unique(&mut steps, step);
                    }
                }
            }
        }
        for (service_id, wanted) in &target_by_id {
            if current_by_id.contains_key(service_id) || dead.contains(service_id) {
                continue;
            }
            for step in self.service_steps(None, wanted, target, ctx, &peers, &changing) {
                push_unique(&mut steps, step);
            }
        }

        // Networks and volumes
        let handled: HashSet<&str> = steps.iter().filter_map(touched_container).collect();
        let mut component_steps = Vec::new();
        for pair in &network_pairs {
            match pair {
                (Some(current), _) => {
                    let engine_name = current.engine_name();
                    let dependents: Vec<&Service> = self
                        .services
                        .iter()
                        .filter(|s| s.uses_network(&engine_name))
                        .collect();
                    component_removal(
                        &mut component_steps,
                        &handled,
                        &dependents,
                        CompositionStep::RemoveNetwork { current: (*current).clone() },
                    );
                }
                (None, Some(wanted)) => component_steps.push(CompositionStep::CreateNetwork {
                    target: (*wanted).clone(),
                }),
                (None, None) => {}
            }
        }
        for pair in &volume_pairs {
            match pair {
                (Some(current), _) => {
                    let dependents: Vec<&Service> = self
                        .services
                        .iter()
                        .filter(|s| s.named_volumes().contains(&current.name))
                        .collect();
                    component_removal(
                        &mut component_steps,
                        &handled,
                        &dependents,
                        CompositionStep::RemoveVolume { current: (*current).clone() },
                    );
                }
                (None, Some(wanted)) => component_steps.push(CompositionStep::CreateVolume {
                    target: (*wanted).clone(),
                }),
                (None, None) => {}
            }
        }
        for step in component_steps {
            push_unique(&mut steps, step);
        }

        if steps.is_empty() {
            if let Some(commit) = &target.commit {
                if self.commit.as_ref() != Some(commit) {
                    steps.push(CompositionStep::UpdateCommit {
                        app_id: self.app_id,
                        commit: commit.clone(),
                    });
                }
            }
        }
        Ok(steps)
    }

    /// Steps that tear the application down: containers first, then, once no
    /// container is left, its networks and volumes.
    pub fn steps_to_remove_app(&self) -> Vec<CompositionStep> {
        let mut steps = Vec::new();
        for service in &self.services {
            let step = match service.status {
                ServiceStatus::Dead => CompositionStep::Remove { current: service.clone() },
                _ => orphan_step(service),
            };
            push_unique(&mut steps, step);
        }
        if self.services.is_empty() {
            steps.extend(
                self.networks
                    .values()
                    .map(|n| CompositionStep::RemoveNetwork { current: n.clone() }),
            );
            steps.extend(
                self.volumes
                    .values()
                    .map(|v| CompositionStep::RemoveVolume { current: v.clone() }),
            );
        }
        steps
    }

    /// Service names mapped to container ids, for `service:` network modes.
    fn peer_containers(
        &self,
        target: &Application,
        container_ids: &BTreeMap<ServiceId, String>,
    ) -> BTreeMap<String, String> {
        container_ids
            .iter()
            .filter_map(|(service_id, container_id)| {
                self.services
                    .iter()
                    .chain(&target.services)
                    .find(|s| s.service_id == *service_id)
                    .map(|s| (s.service_name.clone(), container_id.clone()))
            })
            .collect()
    }

    fn service_steps(
        &self,
        current: Option<&Service>,
        target: &Service,
        target_app: &Application,
        ctx: &UpdateContext<'_>,
        peers: &BTreeMap<String, String>,
        changing: &Changing,
    ) -> Vec<CompositionStep> {
        if current.is_some_and(|c| c.status == ServiceStatus::Stopping) {
            return vec![CompositionStep::Noop];
        }
        let needs_download = ctx.needs_download(target);
        if needs_download && ctx.is_downloading(target) {
            return vec![CompositionStep::Noop];
        }

        let Some(current) = current else {
            return if needs_download {
                vec![CompositionStep::fetch(target)]
            } else if self.dependencies_met_for_start(target, target_app) {
                vec![CompositionStep::start(target.clone())]
            } else {
                vec![CompositionStep::Noop]
            };
        };

        if current.is_equal_config(target, peers) {
            return self.container_steps(current, target, ctx);
        }

        match target.update_strategy() {
            UpdateStrategy::DownloadThenKill => {
                if needs_download {
                    vec![CompositionStep::fetch(target)]
                } else if dependencies_met_for_kill(target_app, ctx) {
                    vec![CompositionStep::kill(current.clone())]
                } else {
                    vec![CompositionStep::Noop]
                }
            }
            UpdateStrategy::KillThenDownload | UpdateStrategy::DeleteThenDownload => {
                vec![CompositionStep::kill(current.clone())]
            }
            UpdateStrategy::HandOver => {
                if needs_download {
                    vec![CompositionStep::fetch(target)]
                } else if changing.touches(current) && dependencies_met_for_kill(target_app, ctx) {
                    vec![CompositionStep::kill(current.clone())]
                } else if self.dependencies_met_for_start(target, target_app) {
                    vec![CompositionStep::handover(current.clone(), target.clone())]
                } else {
                    vec![CompositionStep::Noop]
                }
            }
        }
    }

    /// Steps for a container whose config already matches its target.
    fn container_steps(
        &self,
        current: &Service,
        target: &Service,
        ctx: &UpdateContext<'_>,
    ) -> Vec<CompositionStep> {
        if current.release_id != target.release_id || current.image_id != target.image_id {
            return vec![CompositionStep::update_metadata(current.clone(), target.clone())];
        }
        match (current.config.running, target.config.running) {
            (false, true) => {
                // A run-once container that already ran stays exited.
                let ran_to_completion = current.config.restart == "no"
                    && current
                        .container_id
                        .as_ref()
                        .is_some_and(|id| ctx.started_containers.contains(id));
                if ran_to_completion {
                    Vec::new()
                } else {
                    vec![CompositionStep::start(target.clone())]
                }
            }
            (true, false) => vec![CompositionStep::stop(current.clone())],
            _ => Vec::new(),
        }
    }

    /// Dependencies are running and the networks and volumes the
    /// service uses exist with their target configuration.
    fn dependencies_met_for_start(&self, target: &Service, target_app: &Application) -> bool {
        let dependencies_running = target.depends_on.iter().all(|dependency| {
            let wants_running = target_app
                .services
                .iter()
                .find(|s| &s.service_name == dependency)
                .map_or(true, |s| s.config.running);
            self.services.iter().any(|s| {
                &s.service_name == dependency
                    && (s.status == ServiceStatus::Running || !wants_running)
            })
        });
        let networks_ready = target_app
            .networks
            .values()
            .filter(|n| target.uses_network(&n.engine_name()))
            .all(|n| self.networks.get(&n.name).is_some_and(|c| c.is_equal_config(n)));
        let volumes_ready = target.named_volumes().iter().all(|name| {
            match (self.volumes.get(name), target_app.volumes.get(name)) {
                (Some(current), Some(wanted)) => current.is_equal_config(wanted),
                _ => false,
            }
        });
        dependencies_running && networks_ready && volumes_ready
    }

    /// Services of the app grouped by service id, newest container first.
    pub fn services_by_id(&self) -> BTreeMap<ServiceId, Vec<&Service>> {
        let mut grouped: BTreeMap<ServiceId, Vec<&Service>> = BTreeMap::new();
        for service in &self.services {
            grouped.entry(service.service_id).or_default().push(service);
        }
        for containers in grouped.values_mut() {
            containers.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        }
        grouped
    }
}

/// Networks and volumes being recreated in this pass.
struct Changing {
    /// Engine names.
    networks: BTreeSet<String>,
    /// App-level names.
    volumes: BTreeSet<String>,
}

impl Changing {
    fn touches(&self, service: &Service) -> bool {
        self.networks.iter().any(|n| service.uses_network(n))
            || service.named_volumes().iter().any(|v| self.volumes.contains(v))
    }
}

/// Every image a replacement would need is on the device.
fn dependencies_met_for_kill(target_app: &Application, ctx: &UpdateContext<'_>) -> bool {
    target_app.services.iter().all(|s| !ctx.needs_download(s))
}

fn kill_step(service: &Service) -> CompositionStep {
    if service.status == ServiceStatus::Stopping {
        CompositionStep::Noop
    } else {
        CompositionStep::kill(service.clone())
    }
}

/// Stop a container that has no target, or remove it once stopped.
fn orphan_step(service: &Service) -> CompositionStep {
    match service.status {
        ServiceStatus::Stopping => CompositionStep::Noop,
        _ if service.config.running || service.status == ServiceStatus::Running => {
            CompositionStep::kill_keep_container(service.clone())
        }
        _ => CompositionStep::Remove {
            current: service.clone(),
        },
    }
}

/// Removes a network or volume, or first kills the containers still using it.
fn component_removal(
    steps: &mut Vec<CompositionStep>,
    handled: &HashSet<&str>,
    dependents: &[&Service],
    removal: CompositionStep,
) {
    if dependents.is_empty() {
        steps.push(removal);
        return;
    }
    for dependent in dependents {
        let already = dependent
            .container_id
            .as_deref()
            .is_some_and(|id| handled.contains(id));
        if !already {
            steps.push(kill_step(dependent));
        }
    }
}

/// Pairs of (current, target) that need a step: current-only, target-only,
/// and present in both with a different config.
fn component_pairs<'a, T>(
    current: &'a BTreeMap<String, T>,
    target: &'a BTreeMap<String, T>,
    is_equal: impl Fn(&T, &T) -> bool,
) -> Vec<(Option<&'a T>, Option<&'a T>)> {
    let mut pairs = Vec::new();
    for (name, c) in current {
        match target.get(name) {
            None => pairs.push((Some(c), None)),
            Some(t) if !is_equal(c, t) => pairs.push((Some(c), Some(t))),
            Some(_) => {}
        }
    }
    for (name, t) in target {
        if !current.contains_key(name) {
            pairs.push((None, Some(t)));
        }
    }
    pairs
}

/// Container a container-level step acts on.
fn touched_container(step: &CompositionStep) -> Option<&str> {
    match step {
        CompositionStep::Stop { current, .. }
        | CompositionStep::Kill { current, .. }
        | CompositionStep::Remove { current }
        | CompositionStep::UpdateMetadata { current, .. }
        | CompositionStep::Restart { current, .. }
        | CompositionStep::Handover { current, .. } => current.container_id.as_deref(),
        _ => None,
    }
}

fn push_unique(steps: &mut Vec<CompositionStep>, step: CompositionStep) {
    if !steps.contains(&step) {
        steps.push(step);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compose::labels;
    use crate::compose::{ComposeVolume, TargetService};
    use crate::steps::KillFlags;
    use chrono::{Duration as ChronoDuration, Utc};
    use skiff_id::ReleaseId;

    fn app_id() -> AppId {
        AppId::new(1).unwrap()
    }

    fn record(name: &str, image: &str, image_id: u32) -> TargetService {
        TargetService {
            service_name: name.to_string(),
            image: image.to_string(),
            image_id: Some(ImageId::new(image_id).unwrap()),
            ..TargetService::default()
        }
    }

    fn target_app(release: u32, services: Vec<(u32, TargetService)>) -> Application {
        let app = TargetApp {
            name: "demo".to_string(),
            commit: Some(format!("commit{release}")),
            release_id: Some(ReleaseId::new(release).unwrap()),
            services: services
                .into_iter()
                .map(|(id, s)| (ServiceId::new(id).unwrap(), s))
                .collect(),
            ..TargetApp::default()
        };
        Application::from_target(app_id(), &app, &BTreeMap::new(), &DeviceMetadata::default()).unwrap()
    }

    /// Current state as it would look once every target resource exists and
    /// every service is running.
    fn converged(target: &Application) -> Application {
        let services = target
            .services
            .iter()
            .map(|s| running(s, &format!("c-{}", s.service_name)))
            .collect();
        Application {
            services,
            ..target.clone()
        }
    }

    fn running(service: &Service, container_id: &str) -> Service {
        let mut current = service.clone();
        current.container_id = Some(container_id.to_string());
        current.status = ServiceStatus::Running;
        current.config.running = true;
        current.created_at = Some(Utc::now());
        current
    }

    fn available(target: &Application) -> Vec<Image> {
        target.services.iter().map(Service::image).collect()
    }

    struct Fixture {
        available: Vec<Image>,
        container_ids: BTreeMap<ServiceId, String>,
        downloading: Vec<ImageId>,
        started: HashSet<String>,
    }

    impl Fixture {
        fn new(available: Vec<Image>) -> Self {
            Self {
                available,
                container_ids: BTreeMap::new(),
                downloading: Vec::new(),
                started: HashSet::new(),
            }
        }

        fn ctx(&self) -> UpdateContext<'_> {
            UpdateContext {
                local_mode: false,
                available_images: &self.available,
                container_ids: &self.container_ids,
                downloading: &self.downloading,
                started_containers: &self.started,
            }
        }
    }

    fn names(steps: &[CompositionStep]) -> Vec<String> {
        steps.iter().map(ToString::to_string).collect()
    }

    #[test]
    fn test_new_app_fetches_then_starts() {
        let target = target_app(1, vec![(10, record("web", "img:1", 100))]);
        let empty = Application::empty(app_id());

        let fx = Fixture::new(Vec::new());
        let steps = empty.next_steps_for_app_update(&target, &fx.ctx()).unwrap();
        assert_eq!(names(&steps), vec!["fetch(img:1)", "createNetwork(default)"]);

        // Image fetched, network created
        let fx = Fixture::new(available(&target));
        let current = Application {
            networks: target.networks.clone(),
            ..Application::empty(app_id())
        };
        let steps = current.next_steps_for_app_update(&target, &fx.ctx()).unwrap();
        assert_eq!(names(&steps), vec!["start(web)"]);
    }

    #[test]
    fn test_start_waits_for_network() {
        let target = target_app(1, vec![(10, record("web", "img:1", 100))]);
        let fx = Fixture::new(available(&target));
        let steps = Application::empty(app_id())
            .next_steps_for_app_update(&target, &fx.ctx())
            .unwrap();
        assert_eq!(names(&steps), vec!["noop", "createNetwork(default)"]);
    }

    #[test]
    fn test_converged_app_is_stable() {
        let target = target_app(1, vec![(10, record("web", "img:1", 100))]);
        let mut current = converged(&target);
        current.commit = target.commit.clone();
        let fx = Fixture::new(available(&target));

        let steps = current.next_steps_for_app_update(&target, &fx.ctx()).unwrap();
        assert!(steps.is_empty(), "unexpected steps: {:?}", names(&steps));
    }

    #[test]
    fn test_commit_update_when_nothing_else_to_do() {
        let target = target_app(1, vec![(10, record("web", "img:1", 100))]);
        let mut current = converged(&target);
        current.commit = Some("commit0".to_string());
        let fx = Fixture::new(available(&target));

        let steps = current.next_steps_for_app_update(&target, &fx.ctx()).unwrap();
        assert_eq!(
            steps,
            vec![CompositionStep::UpdateCommit {
                app_id: app_id(),
                commit: "commit1".to_string()
            }]
        );
    }

    #[test]
    fn test_running_state_only() {
        let mut stopped = record("web", "img:1", 100);
        stopped.running = Some(false);
        let target = target_app(1, vec![(10, stopped)]);
        let mut current = converged(&target);
        current.commit = target.commit.clone();
        let fx = Fixture::new(available(&target));

        let steps = current.next_steps_for_app_update(&target, &fx.ctx()).unwrap();
        assert_eq!(names(&steps), vec!["stop(web)"]);

        // And back
        let running_target = target_app(1, vec![(10, record("web", "img:1", 100))]);
        let mut exited = current.clone();
        exited.services[0].status = ServiceStatus::Exited;
        exited.services[0].config.running = false;
        let steps = exited.next_steps_for_app_update(&running_target, &fx.ctx()).unwrap();
        assert_eq!(names(&steps), vec!["start(web)"]);
    }

    #[test]
    fn test_run_once_container_is_not_restarted() {
        let mut once = record("migrate", "img:1", 100);
        once.restart = Some("no".to_string());
        let target = target_app(1, vec![(10, once)]);
        let mut current = converged(&target);
        current.commit = target.commit.clone();
        current.services[0].status = ServiceStatus::Exited;
        current.services[0].config.running = false;

        let mut fx = Fixture::new(available(&target));
        fx.started.insert("c-migrate".to_string());
        let steps = current.next_steps_for_app_update(&target, &fx.ctx()).unwrap();
        assert!(steps.is_empty());
    }

    #[test]
    fn test_download_then_kill() {
        let old = target_app(1, vec![(10, record("web", "img:1", 100))]);
        let mut current = converged(&old);
        current.commit = old.commit.clone();
        let target = target_app(2, vec![(10, record("web", "img:2", 200))]);

        let fx = Fixture::new(available(&old));
        let steps = current.next_steps_for_app_update(&target, &fx.ctx()).unwrap();
        assert_eq!(names(&steps), vec!["fetch(img:2)"]);

        let mut images = available(&old);
        images.extend(available(&target));
        let fx = Fixture::new(images);
        let steps = current.next_steps_for_app_update(&target, &fx.ctx()).unwrap();
        assert_eq!(steps, vec![CompositionStep::kill(current.services[0].clone())]);
    }

    #[test]
    fn test_download_in_progress_is_noop() {
        let old = target_app(1, vec![(10, record("web", "img:1", 100))]);
        let current = converged(&old);
        let target = target_app(2, vec![(10, record("web", "img:2", 200))]);

        let mut fx = Fixture::new(available(&old));
        fx.downloading.push(ImageId::new(200).unwrap());
        let steps = current.next_steps_for_app_update(&target, &fx.ctx()).unwrap();
        assert_eq!(steps, vec![CompositionStep::Noop]);
    }

    #[test]
    fn test_kill_then_download() {
        let old = target_app(1, vec![(10, record("web", "img:1", 100))]);
        let current = converged(&old);
        let mut next = record("web", "img:2", 200);
        next.labels
            .insert(labels::UPDATE_STRATEGY.to_string(), "kill-then-download".to_string());
        let target = target_app(2, vec![(10, next)]);

        let fx = Fixture::new(available(&old));
        let steps = current.next_steps_for_app_update(&target, &fx.ctx()).unwrap();
        assert_eq!(names(&steps), vec!["kill(web)"]);
    }

    #[test]
    fn test_hand_over() {
        let mut base = record("web", "img:1", 100);
        base.labels
            .insert(labels::UPDATE_STRATEGY.to_string(), "hand-over".to_string());
        let old = target_app(1, vec![(10, base.clone())]);
        let current = converged(&old);

        let mut next = base;
        next.image = "img:2".to_string();
        next.image_id = Some(ImageId::new(200).unwrap());
        let target = target_app(2, vec![(10, next)]);

        let fx = Fixture::new(available(&old));
        let steps = current.next_steps_for_app_update(&target, &fx.ctx()).unwrap();
        assert_eq!(names(&steps), vec!["fetch(img:2)"]);

        let mut images = available(&old);
        images.extend(available(&target));
        let fx = Fixture::new(images);
        let steps = current.next_steps_for_app_update(&target, &fx.ctx()).unwrap();
        assert!(matches!(
            &steps[..],
            [CompositionStep::Handover { current: c, target: t, .. }]
                if c.image_id.get() == 100 && t.image_id.get() == 200
        ));
    }

    #[test]
    fn test_same_config_new_release_renames() {
        let old = target_app(1, vec![(10, record("web", "img:1", 100))]);
        let current = converged(&old);
        let target = target_app(2, vec![(10, record("web", "img:1", 100))]);

        let fx = Fixture::new(available(&old));
        let steps = current.next_steps_for_app_update(&target, &fx.ctx()).unwrap();
        assert_eq!(names(&steps), vec!["updateMetadata(web)"]);
    }

    #[test]
    fn test_removed_service_is_killed_then_removed() {
        let old = target_app(
            1,
            vec![(10, record("web", "img:1", 100)), (11, record("db", "img:db", 101))],
        );
        let current = converged(&old);
        let target = target_app(2, vec![(11, record("db", "img:db", 101))]);
        let fx = Fixture::new(available(&old));

        let steps = current.next_steps_for_app_update(&target, &fx.ctx()).unwrap();
        assert_eq!(
            steps,
            vec![
                CompositionStep::Kill {
                    current: current.services[0].clone(),
                    options: KillFlags {
                        remove_container: false,
                        ..KillFlags::default()
                    },
                },
                CompositionStep::update_metadata(current.services[1].clone(), target.services[0].clone()),
            ]
        );

        // Once stopped, the container is removed
        let mut stopped = current.clone();
        stopped.services[0].status = ServiceStatus::Exited;
        stopped.services[0].config.running = false;
        let steps = stopped.next_steps_for_app_update(&target, &fx.ctx()).unwrap();
        assert_eq!(names(&steps), vec!["remove(web)", "updateMetadata(db)"]);
    }

    #[test]
    fn test_remove_app_containers_before_resources() {
        let mut web = record("web", "img:1", 100);
        web.volumes = vec!["data:/data".to_string()];
        let app = TargetApp {
            name: "demo".to_string(),
            release_id: Some(ReleaseId::new(1).unwrap()),
            services: BTreeMap::from([(ServiceId::new(10).unwrap(), web)]),
            volumes: BTreeMap::from([("data".to_string(), ComposeVolume::default())]),
            ..TargetApp::default()
        };
        let target =
            Application::from_target(app_id(), &app, &BTreeMap::new(), &DeviceMetadata::default()).unwrap();
        let current = converged(&target);

        assert_eq!(names(&current.steps_to_remove_app()), vec!["kill(web)"]);

        let emptied = Application {
            services: Vec::new(),
            ..current
        };
        assert_eq!(
            names(&emptied.steps_to_remove_app()),
            vec!["removeNetwork(default)", "removeVolume(data)"]
        );
    }

    #[test]
    fn test_resources_wait_for_their_users() {
        let mut web = record("web", "img:1", 100);
        web.volumes = vec!["data:/data".to_string()];
        let with_volume = TargetApp {
            name: "demo".to_string(),
            release_id: Some(ReleaseId::new(1).unwrap()),
            services: BTreeMap::from([(ServiceId::new(10).unwrap(), web)]),
            volumes: BTreeMap::from([("data".to_string(), ComposeVolume::default())]),
            ..TargetApp::default()
        };
        let old =
            Application::from_target(app_id(), &with_volume, &BTreeMap::new(), &DeviceMetadata::default())
                .unwrap();
        let current = converged(&old);
        let target = target_app(2, vec![(11, record("api", "img:2", 200))]);
        let mut images = available(&old);
        images.extend(available(&target));
        let fx = Fixture::new(images);

        // The volume stays while web still mounts it
        let steps = current.next_steps_for_app_update(&target, &fx.ctx()).unwrap();
        assert_eq!(names(&steps), vec!["kill(web)", "start(api)"]);
        assert!(!steps.iter().any(|s| matches!(s, CompositionStep::RemoveVolume { .. })));

        let emptied = Application {
            services: Vec::new(),
            ..current
        };
        let steps = emptied.next_steps_for_app_update(&target, &fx.ctx()).unwrap();
        assert_eq!(names(&steps), vec!["start(api)", "removeVolume(data)"]);
    }

    #[test]
    fn test_changed_network_kills_dependents_first() {
        let target = target_app(1, vec![(10, record("web", "img:1", 100))]);
        let mut current = converged(&target);
        let internal = ComposeNetwork {
            internal: true,
            ..ComposeNetwork::default()
        };
        current.networks.insert(
            DEFAULT_NETWORK.to_string(),
            Network::from_target(app_id(), DEFAULT_NETWORK, &internal).unwrap(),
        );
        let fx = Fixture::new(available(&target));

        let steps = current.next_steps_for_app_update(&target, &fx.ctx()).unwrap();
        assert_eq!(steps, vec![CompositionStep::kill(current.services[0].clone())]);

        let emptied = Application {
            services: Vec::new(),
            ..current
        };
        let steps = emptied.next_steps_for_app_update(&target, &fx.ctx()).unwrap();
        assert_eq!(names(&steps), vec!["noop", "removeNetwork(default)"]);
    }

    #[test]
    fn test_hand_over_kills_when_its_network_changes() {
        let mut base = record("web", "img:1", 100);
        base.labels
            .insert(labels::UPDATE_STRATEGY.to_string(), "hand-over".to_string());
        let old = target_app(1, vec![(10, base.clone())]);
        let mut current = converged(&old);
        let internal = ComposeNetwork {
            internal: true,
            ..ComposeNetwork::default()
        };
        current.networks.insert(
            DEFAULT_NETWORK.to_string(),
            Network::from_target(app_id(), DEFAULT_NETWORK, &internal).unwrap(),
        );

        let mut next = base;
        next.image = "img:2".to_string();
        next.image_id = Some(ImageId::new(200).unwrap());
        let target = target_app(2, vec![(10, next)]);

        let mut images = available(&old);
        images.extend(available(&target));
        let fx = Fixture::new(images);
        let steps = current.next_steps_for_app_update(&target, &fx.ctx()).unwrap();
        assert_eq!(steps, vec![CompositionStep::kill(current.services[0].clone())]);
    }

    #[test]
    fn test_dead_and_duplicate_containers() {
        let target = target_app(
            1,
            vec![(10, record("web", "img:1", 100)), (11, record("db", "img:db", 101))],
        );
        let mut current = converged(&target);
        current.commit = target.commit.clone();
        current.services[1].status = ServiceStatus::Dead;
        current.services[1].config.running = false;
        let mut older = running(&target.services[0], "c-web-old");
        older.created_at = Some(Utc::now() - ChronoDuration::minutes(5));
        current.services.push(older.clone());
        let fx = Fixture::new(available(&target));

        let steps = current.next_steps_for_app_update(&target, &fx.ctx()).unwrap();
        assert_eq!(
            steps,
            vec![
                CompositionStep::Remove {
                    current: current.services[1].clone()
                },
                CompositionStep::kill(older),
            ]
        );
    }

    #[test]
    fn test_stopping_container_waits() {
        let old = target_app(1, vec![(10, record("web", "img:1", 100))]);
        let mut current = converged(&old);
        current.services[0].status = ServiceStatus::Stopping;
        let target = target_app(2, vec![(10, record("web", "img:2", 200))]);
        let fx = Fixture::new(available(&old));

        let steps = current.next_steps_for_app_update(&target, &fx.ctx()).unwrap();
        assert_eq!(steps, vec![CompositionStep::Noop]);
        assert_eq!(current.steps_to_remove_app(), vec![CompositionStep::Noop]);
    }

    #[test]
    fn test_dependencies_start_in_order() {
        let mut api = record("api", "img:api", 101);
        api.depends_on = vec!["db".to_string()];
        let target = target_app(1, vec![(10, record("db", "img:db", 100)), (11, api)]);
        let current = Application {
            networks: target.networks.clone(),
            ..Application::empty(app_id())
        };
        let fx = Fixture::new(available(&target));

        let steps = current.next_steps_for_app_update(&target, &fx.ctx()).unwrap();
        assert_eq!(names(&steps), vec!["start(db)", "noop"]);

        let with_db = Application {
            services: vec![running(&target.services[0], "c-db")],
            ..current
        };
        let steps = with_db.next_steps_for_app_update(&target, &fx.ctx()).unwrap();
        assert_eq!(names(&steps), vec!["start(api)"]);
    }

    #[test]
    fn test_local_mode_never_fetches() {
        let target = target_app(1, vec![(10, record("web", "img:1", 100))]);
        let current = Application {
            networks: target.networks.clone(),
            ..Application::empty(app_id())
        };
        let fx = Fixture::new(Vec::new());
        let ctx = UpdateContext {
            local_mode: true,
            ..fx.ctx()
        };
        let steps = current.next_steps_for_app_update(&target, &ctx).unwrap();
        assert_eq!(names(&steps), vec!["start(web)"]);
    }

    #[test]
    fn test_ipam_without_gateway_is_rejected() {
        let network: ComposeNetwork = serde_json::from_value(serde_json::json!({
            "ipam": { "config": [{ "subnet": "172.20.0.0/16" }] }
        }))
        .unwrap();
        let app = TargetApp {
            name: "demo".to_string(),
            networks: BTreeMap::from([("back".to_string(), network)]),
            ..TargetApp::default()
        };
        let result = Application::from_target(app_id(), &app, &BTreeMap::new(), &DeviceMetadata::default());
        assert!(matches!(result, Err(ComposeError::InvalidNetworkConfiguration(_))));
    }

    #[test]
    fn test_undeclared_volume_is_rejected() {
        let mut web = record("web", "img:1", 100);
        web.volumes = vec!["cache:/cache".to_string()];
        let app = TargetApp {
            name: "demo".to_string(),
            release_id: Some(ReleaseId::new(1).unwrap()),
            services: BTreeMap::from([(ServiceId::new(10).unwrap(), web)]),
            ..TargetApp::default()
        };
        let result = Application::from_target(app_id(), &app, &BTreeMap::new(), &DeviceMetadata::default());
        assert!(matches!(
            result,
            Err(ComposeError::InvalidServiceDefinition { service, .. }) if service == "web"
        ));
    }
}
