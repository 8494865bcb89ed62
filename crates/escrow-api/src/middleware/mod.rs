//! # Middleware
//!
//! - `metrics`: per-route request, error and conflict counters.
//!
//! Authentication lives in [`crate::auth`].

pub mod metrics;
