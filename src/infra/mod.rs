//! Infrastructure adapters and runtime bootstrap.

pub mod error;
pub mod http;
pub mod lock;
pub mod queue;
pub mod store;
pub mod telemetry;
pub mod upstream;
