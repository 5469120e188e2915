//! Service announcement seam.
//!
//! The engine does not speak mDNS itself.  At startup the server builds a
//! [`ServiceAnnouncement`] from the driver metadata and hands it to whatever
//! [`ServicePublisher`] the process installed; on shutdown it withdraws it.
//! [`MdnsPublisher`] registers the service over multicast DNS.
//! [`LoggingPublisher`] only logs, which is enough for tests and when the
//! controller is pointed at the driver address by hand.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Mutex, PoisonError};

use mdns_sd::{ServiceDaemon, ServiceInfo};
use thiserror::Error;
use tracing::{info, warn};

use crate::domain::DriverMetadata;

/// DNS-SD service type integration drivers announce under.
pub const SERVICE_TYPE: &str = "_uc-integration._tcp";

#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("service announcement rejected: {0}")]
    Rejected(String),

    #[error(transparent)]
    Mdns(#[from] mdns_sd::Error),

    #[error("failed to read host name: {0}")]
    HostName(#[from] std::io::Error),
}

/// Everything a publisher needs to advertise the driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceAnnouncement {
    pub instance_name: String,
    pub service_type: &'static str,
    /// Listen address; unspecified means "every interface".
    pub address: IpAddr,
    pub port: u16,
    pub txt: Vec<(String, String)>,
}

impl ServiceAnnouncement {
    /// Builds the announcement for a driver listening on `bind_addr`.
    ///
    /// TXT records: `name` and `ver` always, `developer` when the metadata
    /// names one, and `ws_url` only for an explicit `ws://` or `wss://` URL.
    pub fn for_driver(
        metadata: &DriverMetadata,
        bind_addr: SocketAddr,
        driver_url: Option<&str>,
    ) -> Self {
        let mut txt = vec![
            ("name".to_string(), metadata.display_name().to_string()),
            ("ver".to_string(), metadata.version.clone()),
        ];
        if let Some(developer) = &metadata.developer {
            txt.push(("developer".to_string(), developer.name.clone()));
        }
        if let Some(url) =
            driver_url.filter(|url| url.starts_with("ws://") || url.starts_with("wss://"))
        {
            txt.push(("ws_url".to_string(), url.to_string()));
        }

        Self {
            instance_name: metadata.driver_id.clone(),
            service_type: SERVICE_TYPE,
            address: bind_addr.ip(),
            port: bind_addr.port(),
            txt,
        }
    }

    pub fn txt_value(&self, key: &str) -> Option<&str> {
        self.txt
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

/// Publishes the driver on the network.
#[cfg_attr(test, mockall::automock)]
pub trait ServicePublisher: Send + Sync {
    /// Goes live with `announcement`.
    ///
    /// # Errors
    ///
    /// Implementation specific; the server logs the error and keeps serving.
    fn publish(&self, announcement: &ServiceAnnouncement) -> Result<(), DiscoveryError>;

    fn withdraw(&self);
}

/// Publisher that only writes the announcement to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingPublisher;

impl ServicePublisher for LoggingPublisher {
    fn publish(&self, announcement: &ServiceAnnouncement) -> Result<(), DiscoveryError> {
        let txt: Vec<String> = announcement
            .txt
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect();
        info!(
            "announcing {}.{} on port {} [{}]",
            announcement.instance_name,
            announcement.service_type,
            announcement.port,
            txt.join(", ")
        );
        Ok(())
    }

    fn withdraw(&self) {
        info!("service announcement withdrawn");
    }
}

/// Publisher that registers the driver with an mDNS responder.
pub struct MdnsPublisher {
    daemon: ServiceDaemon,
    host_name: String,
    registered: Mutex<Option<String>>,
}

impl MdnsPublisher {
    /// Starts the mDNS daemon.
    ///
    /// # Errors
    ///
    /// Returns an error if the daemon cannot bind its multicast sockets or
    /// the host name cannot be read.
    pub fn new() -> Result<Self, DiscoveryError> {
        let host = hostname::get()?.to_string_lossy().into_owned();
        Ok(Self {
            daemon: ServiceDaemon::new()?,
            host_name: format!("{host}.local."),
            registered: Mutex::new(None),
        })
    }
}

/// Converts `announcement` into an mDNS service record for `host_name`.
///
/// An unspecified listen address leaves the record without addresses and
/// lets the daemon fill in those of every interface.
///
/// # Errors
///
/// Returns an error if mdns-sd rejects the service type or instance name.
pub fn service_info(
    announcement: &ServiceAnnouncement,
    host_name: &str,
) -> Result<ServiceInfo, DiscoveryError> {
    let service_type = format!("{}.local.", announcement.service_type);
    let properties: HashMap<String, String> = announcement.txt.iter().cloned().collect();
    let auto_addr = announcement.address.is_unspecified();
    let address = if auto_addr {
        String::new()
    } else {
        announcement.address.to_string()
    };

    let info = ServiceInfo::new(
        &service_type,
        &announcement.instance_name,
        host_name,
        address.as_str(),
        announcement.port,
        properties,
    )?;
    Ok(if auto_addr { info.enable_addr_auto() } else { info })
}

impl ServicePublisher for MdnsPublisher {
    fn publish(&self, announcement: &ServiceAnnouncement) -> Result<(), DiscoveryError> {
        let info = service_info(announcement, &self.host_name)?;
        let fullname = info.get_fullname().to_string();
        self.daemon.register(info)?;
        info!(
            "mDNS: registered {fullname} on port {} (host {})",
            announcement.port, self.host_name
        );
        *self
            .registered
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(fullname);
        Ok(())
    }

    fn withdraw(&self) {
        let fullname = self
            .registered
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(fullname) = fullname {
            match self.daemon.unregister(&fullname) {
                Ok(_) => info!("mDNS: unregistered {fullname}"),
                Err(e) => warn!("mDNS: failed to unregister {fullname}: {e}"),
            }
        }
        if let Err(e) = self.daemon.shutdown() {
            warn!("mDNS: daemon shutdown failed: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Developer;

    fn metadata() -> DriverMetadata {
        let mut metadata = DriverMetadata::new("demo_driver", "Demo", "1.0.0");
        metadata.developer = Some(Developer {
            name: "ACME".into(),
            url: None,
            email: None,
        });
        metadata
    }

    fn addr() -> SocketAddr {
        "0.0.0.0:9090".parse().unwrap()
    }

    #[test]
    fn test_announcement_carries_name_version_and_developer() {
        // Act
        let announcement = ServiceAnnouncement::for_driver(&metadata(), addr(), None);

        // Assert
        assert_eq!(announcement.instance_name, "demo_driver");
        assert_eq!(announcement.service_type, SERVICE_TYPE);
        assert_eq!(announcement.port, 9090);
        assert_eq!(announcement.txt_value("name"), Some("Demo"));
        assert_eq!(announcement.txt_value("ver"), Some("1.0.0"));
        assert_eq!(announcement.txt_value("developer"), Some("ACME"));
        assert_eq!(announcement.txt_value("ws_url"), None);
    }

    #[test]
    fn test_websocket_driver_url_is_announced() {
        let announcement =
            ServiceAnnouncement::for_driver(&metadata(), addr(), Some("wss://10.0.0.5:9443/ws"));
        assert_eq!(announcement.txt_value("ws_url"), Some("wss://10.0.0.5:9443/ws"));
    }

    #[test]
    fn test_non_websocket_driver_url_is_ignored() {
        let announcement =
            ServiceAnnouncement::for_driver(&metadata(), addr(), Some("http://10.0.0.5"));
        assert_eq!(announcement.txt_value("ws_url"), None);
    }

    #[test]
    fn test_announcement_keeps_listen_address() {
        let bind: SocketAddr = "192.168.1.20:9090".parse().unwrap();
        let announcement = ServiceAnnouncement::for_driver(&metadata(), bind, None);
        assert_eq!(announcement.address, bind.ip());
    }

    #[test]
    fn test_service_info_carries_type_port_and_txt() {
        // Arrange
        let announcement = ServiceAnnouncement::for_driver(
            &metadata(),
            addr(),
            Some("ws://10.0.0.5:9090"),
        );

        // Act
        let info = service_info(&announcement, "remote-host.local.").unwrap();

        // Assert
        assert_eq!(
            info.get_fullname(),
            "demo_driver._uc-integration._tcp.local."
        );
        assert_eq!(info.get_type(), "_uc-integration._tcp.local.");
        assert_eq!(info.get_hostname(), "remote-host.local.");
        assert_eq!(info.get_port(), 9090);
        assert_eq!(info.get_property_val_str("name"), Some("Demo"));
        assert_eq!(info.get_property_val_str("ver"), Some("1.0.0"));
        assert_eq!(info.get_property_val_str("developer"), Some("ACME"));
        assert_eq!(
            info.get_property_val_str("ws_url"),
            Some("ws://10.0.0.5:9090")
        );
    }

    #[test]
    fn test_service_info_with_explicit_address() {
        let bind: SocketAddr = "192.168.1.20:9191".parse().unwrap();
        let announcement = ServiceAnnouncement::for_driver(&metadata(), bind, None);

        let info = service_info(&announcement, "remote-host.local.").unwrap();

        assert_eq!(info.get_port(), 9191);
        assert_eq!(info.get_property_val_str("ws_url"), None);
    }

    #[test]
    fn test_logging_publisher_accepts_any_announcement() {
        let announcement = ServiceAnnouncement::for_driver(&metadata(), addr(), None);
        assert!(LoggingPublisher.publish(&announcement).is_ok());
    }
}
