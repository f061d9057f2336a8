pub mod request_coordinator;

pub use request_coordinator::RequestCoordinator;
