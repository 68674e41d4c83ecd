//! # skiff-id
//!
//! Resource identity for applications managed on a device.
//!
//! ## Design Principles
//!
//! - Fleet-assigned identifiers are positive integers, typed per resource kind
//! - The container engine knows nothing about applications; ownership is encoded
//!   in engine-level names and recovered by parsing them back
//! - Every generated engine name parses back to exactly the parts it was built from
//!
//! ## Engine Name Format
//!
//! - Networks and volumes: `{appId}_{name}`, e.g. `1011165_default`
//! - Containers: `{serviceName}_{imageId}_{releaseId}`, e.g. `main_2937323_1220313`

mod error;
mod macros;
mod names;
mod types;

pub use error::IdError;
pub use names::{ContainerName, ScopedName};
pub use types::*;
