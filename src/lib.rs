//! Pixflow - an image loading pipeline.
//!
//! Requests flow through an ordered chain of interceptors: a pin-aware
//! memory cache, single-flight coordination of identical requests,
//! journaled disk caches for downloaded bytes and transformed results,
//! fetching, decoding and transformations.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

/// Application layer containing request coordination.
pub mod application;
/// Domain layer containing entities, errors, and port definitions.
pub mod domain;
/// Infrastructure layer containing caches, the pipeline and adapters.
pub mod infrastructure;

/// Current version of the application.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name.
pub const NAME: &str = "pixflow";
