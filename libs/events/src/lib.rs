//! # skiff-events
//!
//! System events emitted by the reconciliation engine.
//!
//! ## Design Principles
//!
//! - Events describe an outcome on one resource (install, start, fetch, ...)
//! - Delivery is fire-and-forget: emitting never fails and never blocks
//! - Events carry an optional resource reference and an optional error message
//!
//! ## Event Kinds
//!
//! Kinds are grouped by the resource they describe:
//! - Service events (`service.*`)
//! - Image events (`image.*`)
//! - Network and volume events (`network.*`, `volume.*`)
//! - Lock events (`lock.*`)

mod envelope;
mod sink;
mod types;

pub use envelope::*;
pub use sink::*;
pub use types::*;
