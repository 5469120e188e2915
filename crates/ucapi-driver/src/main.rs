//! Demo integration driver: entry point.
//!
//! Serves the controller protocol for a small demo driver (see `demo.rs`):
//! a setup dialogue that creates buttons and a voice assistant entity that
//! consumes streamed audio.
//!
//! # Usage
//!
//! ```text
//! ucapi-demo-driver [OPTIONS]
//!
//! Options:
//!   --interface <ADDR>     Interface to listen on [default: 0.0.0.0]
//!   --port <PORT>          WebSocket port [default: driver.json port, else 9090]
//!   --config-home <DIR>    Driver configuration directory [default: .]
//!   --disable-mdns-publish Skip the service announcement
//!   --driver-json <FILE>   driver.json to serve (built-in demo metadata if absent)
//!   --settings <FILE>      Engine tuning TOML
//!   --driver-url <URL>     Explicit ws:// or wss:// URL to announce
//! ```
//!
//! # Environment variable overrides
//!
//! | Variable                   | Flag                     |
//! |----------------------------|--------------------------|
//! | `UC_INTEGRATION_INTERFACE` | `--interface`            |
//! | `UC_INTEGRATION_HTTP_PORT` | `--port`                 |
//! | `UC_CONFIG_HOME`           | `--config-home`          |
//! | `UC_DISABLE_MDNS_PUBLISH`  | `--disable-mdns-publish` |
//!
//! Logging follows `RUST_LOG` (default `info`).

mod demo;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use anyhow::Context;
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use ucapi_core::{EntityType, LanguageText};
use ucapi_driver::application::IntegrationEngine;
use ucapi_driver::domain::{Developer, DriverConfig, DriverMetadata, EngineSettings};
use ucapi_driver::infrastructure::{
    load_driver_metadata, load_engine_settings, run_server, LoggingPublisher, MdnsPublisher,
    ServicePublisher,
};

const DEFAULT_PORT: u16 = 9090;

// ── CLI argument definitions ──────────────────────────────────────────────────

#[derive(Debug, Parser)]
#[command(
    name = "ucapi-demo-driver",
    about = "Demo integration driver for the UC remote protocol",
    version
)]
struct Cli {
    /// IP address to listen on.
    #[arg(long, default_value = "0.0.0.0", env = "UC_INTEGRATION_INTERFACE")]
    interface: String,

    /// WebSocket port.  Falls back to the `port` in driver.json, then 9090.
    #[arg(long, env = "UC_INTEGRATION_HTTP_PORT")]
    port: Option<u16>,

    /// Directory the driver keeps its own configuration in.
    #[arg(long, default_value = ".", env = "UC_CONFIG_HOME")]
    config_home: PathBuf,

    /// Do not announce the driver on the network.
    #[arg(long, env = "UC_DISABLE_MDNS_PUBLISH")]
    disable_mdns_publish: bool,

    /// driver.json to serve instead of the built-in demo metadata.
    #[arg(long)]
    driver_json: Option<PathBuf>,

    /// TOML file with engine tuning settings.
    #[arg(long)]
    settings: Option<PathBuf>,

    /// Explicit ws:// or wss:// URL to announce.
    #[arg(long)]
    driver_url: Option<String>,
}

impl Cli {
    /// Builds the process configuration.  `metadata_port` is the port from
    /// driver.json, used when `--port` is not given.
    ///
    /// # Errors
    ///
    /// Returns an error if `--interface` is not an IP address or the settings
    /// file cannot be loaded.
    fn into_driver_config(self, metadata_port: Option<u16>) -> anyhow::Result<DriverConfig> {
        let port = self.port.or(metadata_port).unwrap_or(DEFAULT_PORT);
        let bind_addr: SocketAddr = format!("{}:{port}", self.interface)
            .parse()
            .with_context(|| format!("invalid listen address: '{}:{port}'", self.interface))?;

        let engine = match &self.settings {
            Some(path) => load_engine_settings(path)
                .with_context(|| format!("failed to load settings from {}", path.display()))?,
            None => EngineSettings::default(),
        };

        Ok(DriverConfig {
            bind_addr,
            config_dir: self.config_home,
            driver_url: self.driver_url,
            disable_publish: self.disable_mdns_publish,
            engine,
        })
    }

    fn metadata(&self) -> anyhow::Result<DriverMetadata> {
        match &self.driver_json {
            Some(path) => load_driver_metadata(path)
                .with_context(|| format!("failed to load driver metadata from {}", path.display())),
            None => Ok(demo_metadata()),
        }
    }
}

fn demo_metadata() -> DriverMetadata {
    let mut metadata = DriverMetadata::new(
        "ucapi_demo",
        LanguageText::from("Demo driver").with("de", "Demo-Treiber"),
        env!("CARGO_PKG_VERSION"),
    );
    metadata.developer = Some(Developer {
        name: "UC Integration Contributors".into(),
        url: None,
        email: None,
    });
    metadata
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let metadata = cli.metadata()?;
    let config = cli.into_driver_config(metadata.port)?;

    info!(
        "{} {} starting: listen={}, config_dir={}",
        metadata.display_name(),
        metadata.version,
        config.bind_addr,
        config.config_dir.display()
    );

    // ── Engine ────────────────────────────────────────────────────────────────
    let builder = IntegrationEngine::builder(metadata).settings(config.engine.clone());
    let registry = builder.registry();
    let (engine, events) = builder
        .command_handler_for_type(
            EntityType::Button,
            Arc::new(demo::ButtonHandler::new(Arc::clone(&registry))),
        )
        .command_handler_for_entity(demo::VOICE_ENTITY_ID, Arc::new(demo::VoiceStartHandler))
        .setup_handler(Arc::new(demo::DemoSetup::new(Arc::clone(&registry))))
        .voice_handler(Arc::new(demo::VoiceCounter))
        .build();

    registry
        .register(demo::voice_entity()?)
        .await
        .context("failed to register the voice entity")?;

    tokio::spawn(demo::run_events(Arc::clone(&engine), events));

    // ── Graceful shutdown flag ────────────────────────────────────────────────
    let running = Arc::new(AtomicBool::new(true));
    let running_clone = Arc::clone(&running);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("received Ctrl+C, shutting down");
                running_clone.store(false, Ordering::Relaxed);
            }
            Err(e) => {
                tracing::error!("failed to listen for Ctrl+C signal: {e}");
            }
        }
    });

    // ── Service announcement ──────────────────────────────────────────────────
    let mdns = if config.disable_publish {
        None
    } else {
        match MdnsPublisher::new() {
            Ok(publisher) => Some(publisher),
            Err(e) => {
                warn!("mDNS unavailable, announcement is only logged: {e}");
                None
            }
        }
    };
    let publisher: &dyn ServicePublisher = match &mdns {
        Some(publisher) => publisher,
        None => &LoggingPublisher,
    };

    run_server(engine, &config, publisher, running).await?;

    info!("demo driver stopped");
    Ok(())
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_defaults() {
        // Arrange
        let cli = Cli::parse_from(["ucapi-demo-driver"]);

        // Act
        let config = cli.into_driver_config(None).unwrap();

        // Assert
        assert_eq!(config.bind_addr.to_string(), "0.0.0.0:9090");
        assert_eq!(config.config_dir, PathBuf::from("."));
        assert!(!config.disable_publish);
        assert_eq!(config.engine, EngineSettings::default());
    }

    #[test]
    fn test_metadata_port_used_without_port_flag() {
        let cli = Cli::parse_from(["ucapi-demo-driver"]);
        let config = cli.into_driver_config(Some(9191)).unwrap();
        assert_eq!(config.bind_addr.port(), 9191);
    }

    #[test]
    fn test_port_flag_wins_over_metadata_port() {
        let cli = Cli::parse_from(["ucapi-demo-driver", "--port", "8000"]);
        let config = cli.into_driver_config(Some(9191)).unwrap();
        assert_eq!(config.bind_addr.port(), 8000);
    }

    #[test]
    fn test_interface_and_publish_flags() {
        let cli = Cli::parse_from([
            "ucapi-demo-driver",
            "--interface",
            "127.0.0.1",
            "--disable-mdns-publish",
            "--driver-url",
            "ws://127.0.0.1:9090",
        ]);
        let config = cli.into_driver_config(None).unwrap();
        assert_eq!(config.bind_addr.to_string(), "127.0.0.1:9090");
        assert!(config.disable_publish);
        assert_eq!(config.driver_url.as_deref(), Some("ws://127.0.0.1:9090"));
    }

    #[test]
    fn test_invalid_interface_returns_error() {
        let cli = Cli::parse_from(["ucapi-demo-driver", "--interface", "not.an.ip"]);
        assert!(cli.into_driver_config(None).is_err());
    }

    #[test]
    fn test_missing_settings_file_returns_error() {
        let cli = Cli::parse_from(["ucapi-demo-driver", "--settings", "/nonexistent/engine.toml"]);
        assert!(cli.into_driver_config(None).is_err());
    }

    #[test]
    fn test_demo_metadata_without_driver_json() {
        let cli = Cli::parse_from(["ucapi-demo-driver"]);
        let metadata = cli.metadata().unwrap();
        assert_eq!(metadata.driver_id, "ucapi_demo");
        assert_eq!(metadata.display_name(), "Demo driver");
    }
}
