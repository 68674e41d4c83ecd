//! skiff Device Agent Library
//!
//! The device agent keeps a set of containerized applications on the device
//! converged to a declarative target. Each pass rebuilds the current state
//! from the container engine, diffs it against the target per application and
//! executes the steps that can safely run now.
//!
//! ## Architecture
//!
//! ```text
//! Composer                     (one apply at a time, convergence passes)
//! ├── Application              (current vs target diff -> CompositionStep)
//! ├── StepExecutor             (step -> engine effect, update locks)
//! │   ├── ServiceManager
//! │   ├── NetworkManager
//! │   ├── VolumeManager
//! │   └── ImageManager         (fetch, delta, backoff, cleanup)
//! └── DependentDevices         (external step source)
//! ```
//!
//! ## Modules
//!
//! - `compose`: Resource descriptors and target records
//! - `engine`: Container engine client trait and the in-memory engine
//! - `managers`: Per-resource CRUD against the engine
//! - `app`: Application aggregate and the diff algorithm
//! - `steps` / `executor`: Composition steps and their execution
//! - `composer`: The top-level reconciliation loop

pub mod app;
pub mod compose;
pub mod composer;
pub mod contracts;
pub mod dependent;
pub mod engine;
pub mod error;
pub mod executor;
pub mod images;
pub mod managers;
pub mod steps;
pub mod update_lock;
pub mod validation;

// Internal modules exposed for integration tests
pub mod config;
pub mod reconciler;

// Re-export commonly used types
pub use app::Application;
pub use composer::{Composer, ComposerState, ComposerStatus};
pub use config::Config;
pub use engine::{ContainerEngine, MockEngine};
pub use error::{ComposeError, Result};
pub use steps::CompositionStep;
