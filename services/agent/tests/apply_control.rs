//! Apply lifecycle: exclusivity, cancellation, contracts and update locks.

mod common;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use common::{app_id, harness, harness_with, target, web_release};
use serde_json::json;
use skiff_agent::engine::mock::EngineOp;
use skiff_agent::{ComposeError, MockEngine};
use skiff_events::EventKind;

#[tokio::test]
async fn test_second_update_while_running_is_rejected() {
    let h = harness_with(MockEngine::with_op_delay(Duration::from_millis(100)), |_| {});
    let composer = Arc::clone(&h.composer);
    let first = tokio::spawn(async move { composer.update(&web_release(1)).await });

    tokio::time::sleep(Duration::from_millis(30)).await;
    assert!(h.composer.is_running());
    let err = h.composer.update(&web_release(1)).await.unwrap_err();
    assert!(matches!(err, ComposeError::UpdateInProgress));

    first.await.unwrap().unwrap();
    assert!(!h.composer.is_running());
}

#[tokio::test]
async fn test_cancel_stops_waiting_without_aborting_steps() {
    let h = harness_with(MockEngine::with_op_delay(Duration::from_millis(300)), |_| {});
    let composer = Arc::clone(&h.composer);
    let apply = tokio::spawn(async move { composer.update(&web_release(1)).await });

    tokio::time::sleep(Duration::from_millis(50)).await;
    h.composer.cancel();

    let result = tokio::time::timeout(Duration::from_millis(200), apply)
        .await
        .expect("cancel did not resolve the apply")
        .unwrap();
    assert!(matches!(result, Err(ComposeError::Cancelled)));
    assert!(!h.composer.is_running());

    // The pull dispatched before cancelling still lands
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(h.engine.calls_of(EngineOp::PullImage), vec!["registry/web:1"]);
    assert!(h.engine.images().iter().any(|i| i.repo_tags.contains(&"registry/web:1".to_string())));
    assert!(h.engine.containers().is_empty());

    // A later apply picks up from there
    h.composer.update(&web_release(1)).await.unwrap();
    assert!(h.engine.container_by_name("web_101_1").is_some());
}

#[tokio::test]
async fn test_unmet_contract_freezes_only_that_app() {
    let h = harness();
    let target = target(json!({
        "1": {
            "name": "demo",
            "releaseId": 1,
            "services": {
                "11": { "serviceName": "web", "image": "registry/web:1", "imageId": 101 }
            }
        },
        "2": {
            "name": "vision",
            "releaseId": 4,
            "services": {
                "21": {
                    "serviceName": "gpu",
                    "image": "registry/gpu:1",
                    "imageId": 201,
                    "contract": { "requires": [{ "type": "hw.device-type", "slug": "jetson-nano" }] }
                }
            }
        }
    }));

    let err = h.composer.update(&target).await.unwrap_err();

    match err {
        ComposeError::ContractViolation { apps } => {
            assert_eq!(apps, BTreeMap::from([("vision".to_string(), vec!["gpu".to_string()])]));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(h.engine.container_by_name("web_101_1").is_some());
    assert!(!h.engine.calls_of(EngineOp::PullImage).contains(&"registry/gpu:1".to_string()));

    let state = h.composer.state().await.unwrap();
    assert!(state.apps.contains_key(&app_id(1)));
    assert!(!state.apps.contains_key(&app_id(2)));
}

#[tokio::test]
async fn test_unmet_optional_service_is_skipped() {
    let h = harness();
    let target = target(json!({
        "1": {
            "name": "demo",
            "releaseId": 1,
            "services": {
                "11": { "serviceName": "web", "image": "registry/web:1", "imageId": 101 },
                "12": {
                    "serviceName": "sensor",
                    "image": "registry/sensor:1",
                    "imageId": 102,
                    "labels": { "io.skiff.features.optional": "true" },
                    "contract": { "requires": [{ "type": "arch.sw", "slug": "aarch64" }] }
                }
            }
        }
    }));

    let state = h.composer.update(&target).await.unwrap();

    assert_eq!(state.apps[&app_id(1)].services.len(), 1);
    assert_eq!(h.events.count(EventKind::OptionalServiceSkipped), 1);
    assert!(h.engine.container_by_name("sensor_102_1").is_none());
}

#[tokio::test]
async fn test_service_lock_file_blocks_replacement() {
    let h = harness();
    h.composer.update(&web_release(1)).await.unwrap();
    let lock_dir = h.config.lock_dir.join("1").join("web");
    std::fs::create_dir_all(&lock_dir).unwrap();
    std::fs::write(lock_dir.join("updates.lock"), "").unwrap();

    let err = h.composer.update(&web_release(2)).await.unwrap_err();

    assert!(matches!(err, ComposeError::UpdatesLocked { app_id: id } if id == app_id(1)));
    let old = h.engine.container_by_name("web_101_1").unwrap();
    assert!(old.state.running);
    assert!(lock_dir.join("updates.lock").exists());
}

#[tokio::test]
async fn test_lock_override_replaces_locked_service() {
    let h = harness_with(MockEngine::new(), |config| config.lock_override = true);
    h.composer.update(&web_release(1)).await.unwrap();
    let lock_dir = h.config.lock_dir.join("1").join("web");
    std::fs::create_dir_all(&lock_dir).unwrap();
    std::fs::write(lock_dir.join("updates.lock"), "").unwrap();

    h.composer.update(&web_release(2)).await.unwrap();

    assert!(h.engine.container_by_name("web_102_2").is_some());
    assert!(!lock_dir.join("updates.lock").exists());
    assert!(h.events.count(EventKind::LockOverridden) >= 1);
}

fn handover_pair(release: u32) -> skiff_agent::compose::TargetState {
    target(json!({
        "1": {
            "name": "demo",
            "releaseId": release,
            "services": {
                "11": {
                    "serviceName": "web",
                    "image": format!("registry/web:{release}"),
                    "imageId": 100 + release,
                    "labels": {
                        "io.skiff.update.strategy": "hand-over",
                        "io.skiff.update.handover-timeout": "600"
                    }
                },
                "12": {
                    "serviceName": "worker",
                    "image": format!("registry/worker:{release}"),
                    "imageId": 200 + release
                }
            }
        }
    }))
}

#[tokio::test]
async fn test_handover_window_does_not_starve_sibling_kill() {
    let h = harness_with(MockEngine::new(), |config| {
        config.lock_timeout = Duration::from_millis(100);
    });
    h.composer.update(&handover_pair(1)).await.unwrap();

    let state = tokio::time::timeout(Duration::from_secs(10), h.composer.update(&handover_pair(2)))
        .await
        .expect("update did not finish")
        .unwrap();

    assert!(h.engine.container_by_name("web_102_2").is_some());
    assert!(h.engine.container_by_name("worker_202_2").is_some());
    assert!(h.engine.container_by_name("web_101_1").is_none());
    assert!(h.engine.container_by_name("worker_201_1").is_none());
    assert_eq!(state.apps[&app_id(1)].services.len(), 2);
}
