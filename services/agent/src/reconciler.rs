//! Periodic apply loop.
//!
//! Re-reads the target file and hands it to the [`Composer`] every poll
//! interval until shutdown.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::compose::{parse_target, TargetState};
use crate::composer::Composer;
use crate::error::ComposeError;

pub struct Reconciler {
    composer: Arc<Composer>,
    target_file: PathBuf,
    poll_interval: Duration,
}

impl Reconciler {
    pub fn new(composer: Arc<Composer>, target_file: impl Into<PathBuf>, poll_interval: Duration) -> Self {
        Self {
            composer,
            target_file: target_file.into(),
            poll_interval,
        }
    }

    /// Run the apply loop until shutdown. An apply in flight when shutdown
    /// arrives is cancelled.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            target_file = %self.target_file.display(),
            poll_interval_secs = self.poll_interval.as_secs(),
            "Starting apply loop"
        );

        let mut interval = tokio::time::interval(self.poll_interval);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    tokio::select! {
                        result = self.reconcile() => {
                            if let Err(e) = result {
                                error!(error = %format!("{e:#}"), "Apply failed");
                            }
                        }
                        _ = shutdown.changed() => {
                            self.composer.cancel();
                            info!("Apply loop shutting down");
                            break;
                        }
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Apply loop shutting down");
                        break;
                    }
                }
            }
        }
    }

    async fn reconcile(&self) -> Result<()> {
        debug!("Loading target state");
        let target = load_target(&self.target_file).await?;
        match self.composer.update(&target).await {
            Ok(state) => {
                info!(apps = state.apps.len(), "Target state applied");
                Ok(())
            }
            Err(e @ ComposeError::ContractViolation { .. }) => {
                warn!(error = %e, "Target partially applied");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}

pub async fn load_target(path: &Path) -> Result<TargetState> {
    let json = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("failed to read target file {}", path.display()))?;
    parse_target(&json).with_context(|| format!("invalid target file {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::engine::{ContainerEngine, MockEngine};
    use skiff_events::MemorySink;

    #[tokio::test]
    async fn test_load_target_reports_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("target.json");
        std::fs::write(&path, "not json").unwrap();

        let err = load_target(&path).await.unwrap_err();
        assert!(format!("{err:#}").contains("target.json"));

        std::fs::write(&path, r#"{"1": {"name": "demo", "releaseId": 3, "services": {}}}"#).unwrap();
        let target = load_target(&path).await.unwrap();
        assert_eq!(target.len(), 1);
    }

    #[tokio::test]
    async fn test_run_applies_then_stops_on_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("target.json");
        std::fs::write(&path, "{}").unwrap();
        let config = Config {
            lock_dir: dir.path().join("locks"),
            noop_interval: Duration::from_millis(10),
            ..Config::default()
        };
        let engine = Arc::new(MockEngine::new());
        let composer = Arc::new(Composer::new(engine.clone(), Arc::new(MemorySink::new()), &config));
        let reconciler = Reconciler::new(composer, &path, Duration::from_secs(3600));

        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(async move { reconciler.run(rx).await });
        tokio::time::sleep(Duration::from_millis(200)).await;
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();

        let networks = engine.list_networks().await.unwrap();
        assert!(networks.iter().any(|n| n.name == "supervisor0"));
    }
}
