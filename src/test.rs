#![cfg(any(test, feature = "test"))]
//! In-memory collaborators for tests and demos.

pub mod observer;
pub mod transport;

pub use observer::RecordingObserver;
pub use transport::MockTransport;
