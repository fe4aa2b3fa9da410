//! Domain layer shared by the storage and HTTP crates.
//!
//! Everything here is free of I/O: the purchase check and the group placement
//! policy are pure functions over already loaded rows, so the transactional
//! plumbing lives in the callers.

pub mod placement;
pub mod points;
pub mod purchase;
pub mod types;
pub mod validation;

pub use points::{ParsePointsError, Points};
