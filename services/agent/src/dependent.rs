//! Seam for the dependent-device protocol.
//!
//! Dependent devices are managed by a separate protocol that contributes its
//! own steps to each pass and may pin images that must not be removed. The
//! engine only calls through this trait.

use std::collections::BTreeMap;

use async_trait::async_trait;
use skiff_id::AppId;

use crate::app::Application;
use crate::compose::Image;
use crate::error::{ComposeError, Result};
use crate::steps::{CompositionStep, DependentStep};

/// What a pass knows when asking the protocol for its steps.
pub struct DependentContext<'a> {
    pub available_images: &'a [Image],
    pub downloading: usize,
    pub current: &'a BTreeMap<AppId, Application>,
    pub target: &'a BTreeMap<AppId, Application>,
    /// Steps already computed for this pass.
    pub steps: &'a [CompositionStep],
}

#[async_trait]
pub trait DependentDevices: Send + Sync {
    async fn required_steps(&self, ctx: &DependentContext<'_>) -> Result<Vec<CompositionStep>>;

    /// Image names the protocol still needs on the device.
    fn images_in_use(
        &self,
        current: &BTreeMap<AppId, Application>,
        target: &BTreeMap<AppId, Application>,
    ) -> Vec<String>;

    async fn execute(&self, step: &DependentStep) -> Result<()>;
}

/// Protocol stand-in for devices without dependents.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoDependentDevices;

#[async_trait]
impl DependentDevices for NoDependentDevices {
    async fn required_steps(&self, _ctx: &DependentContext<'_>) -> Result<Vec<CompositionStep>> {
        Ok(Vec::new())
    }

    fn images_in_use(
        &self,
        _current: &BTreeMap<AppId, Application>,
        _target: &BTreeMap<AppId, Application>,
    ) -> Vec<String> {
        Vec::new()
    }

    async fn execute(&self, step: &DependentStep) -> Result<()> {
        Err(ComposeError::UnknownAction(step.action.clone()))
    }
}
