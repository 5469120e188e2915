//! Domain layer for the driver engine.
//!
//! All types here are plain Rust values with no I/O.

pub mod config;
pub mod events;
pub mod metadata;

pub use config::{DriverConfig, EngineSettings};
pub use events::{ConnectionId, DriverEvent, SetupAbortReason};
pub use metadata::{Developer, DriverMetadata};
