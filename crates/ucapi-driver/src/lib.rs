//! ucapi-driver library crate.
//!
//! The runtime engine of an integration driver: it owns the entity registry,
//! serves the controller's WebSocket protocol to any number of connections,
//! runs the driver setup dialogue, and hands voice audio to driver code.
//!
//! # Architecture (clean architecture)
//!
//! ```text
//! Controller (JSON + binary voice frames over WebSocket)
//!         ↕
//! [ucapi-driver]
//!   ├── domain/           Plain types: DriverConfig, DriverMetadata, DriverEvent
//!   ├── application/      Registry, connection hub, dispatcher, setup flow,
//!   │                     voice multiplexer, driver callback traits
//!   └── infrastructure/
//!         ├── ws_server/  Accept loop and per-connection tasks (tokio-tungstenite)
//!         ├── discovery/  Service announcement seam
//!         └── settings/   driver.json and TOML tuning loaders
//! ```
//!
//! # Layer rules
//!
//! - `domain` has no I/O and no async.
//! - `application` depends on `domain` and `ucapi-core`; it uses tokio
//!   channels and locks but never touches a socket.
//! - `infrastructure` depends on all other layers plus `tokio-tungstenite`.
//!
//! # Writing a driver (for beginners)
//!
//! 1. Load a [`domain::DriverMetadata`] and create an
//!    [`application::EngineBuilder`].
//! 2. Take the [`application::EntityRegistry`] from the builder and register
//!    entities; keep a clone of it in your command handlers so they can push
//!    attribute updates.
//! 3. Install a [`application::CommandHandler`] per entity type (or id), and
//!    optionally a [`application::SetupHandler`] and
//!    [`application::VoiceHandler`].
//! 4. `build()` the engine, drain the returned [`domain::DriverEvent`]
//!    receiver, and hand the engine to [`infrastructure::run_server`].

/// Domain layer: configuration, metadata and driver events (no I/O).
pub mod domain;

/// Application layer: the protocol engine.
pub mod application;

/// Infrastructure layer: WebSocket server, service publisher, file loaders.
pub mod infrastructure;
