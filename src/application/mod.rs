//! Application layer with request coordination.

/// Application services.
pub mod services;

pub use services::RequestCoordinator;
