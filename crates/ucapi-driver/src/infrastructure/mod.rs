//! Infrastructure layer: everything that touches sockets or files.

pub mod discovery;
pub mod settings;
pub mod ws_server;

pub use discovery::{LoggingPublisher, MdnsPublisher, ServiceAnnouncement, ServicePublisher};
pub use settings::{load_driver_metadata, load_engine_settings, SettingsError};
pub use ws_server::{run_server, serve};
