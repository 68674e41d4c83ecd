//! Shared fixtures for the convergence scenarios.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use skiff_agent::compose::{parse_target, TargetState};
use skiff_agent::{Composer, Config, MockEngine};
use skiff_events::MemorySink;
use skiff_id::{AppId, ServiceId};
use tempfile::TempDir;

pub struct Harness {
    pub engine: Arc<MockEngine>,
    pub events: Arc<MemorySink>,
    pub composer: Arc<Composer>,
    pub config: Config,
    _dir: TempDir,
}

pub fn harness() -> Harness {
    harness_with(MockEngine::new(), |_| {})
}

pub fn harness_with(engine: MockEngine, configure: impl FnOnce(&mut Config)) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let mut config = Config {
        lock_dir: dir.path().join("locks"),
        lock_timeout: Duration::from_secs(2),
        noop_interval: Duration::from_millis(10),
        backoff_increment: Duration::from_millis(20),
        ..Config::default()
    };
    configure(&mut config);
    let engine = Arc::new(engine);
    let events = Arc::new(MemorySink::new());
    let composer = Arc::new(Composer::new(engine.clone(), events.clone(), &config));
    Harness {
        engine,
        events,
        composer,
        config,
        _dir: dir,
    }
}

pub fn app_id(id: u32) -> AppId {
    AppId::new(id).unwrap()
}

pub fn service_id(id: u32) -> ServiceId {
    ServiceId::new(id).unwrap()
}

pub fn target(value: serde_json::Value) -> TargetState {
    parse_target(&value.to_string()).unwrap()
}

/// App 1 running one `web` service (service id 11) from `registry/web:{release}`.
pub fn web_release(release: u32) -> TargetState {
    web_release_with_labels(release, json!({}))
}

pub fn web_release_with_labels(release: u32, labels: serde_json::Value) -> TargetState {
    target(json!({
        "1": {
            "name": "demo",
            "commit": format!("release-{release}"),
            "releaseId": release,
            "services": {
                "11": {
                    "serviceName": "web",
                    "image": format!("registry/web:{release}"),
                    "imageId": 100 + release,
                    "labels": labels,
                }
            }
        }
    }))
}
