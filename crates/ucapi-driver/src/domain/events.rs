//! Events the engine reports to driver code.
//!
//! The engine pushes these on the channel returned by
//! [`EngineBuilder::build`](crate::application::EngineBuilder::build).  They
//! are notifications only; nothing the driver does with them feeds back into
//! the protocol.

use std::fmt;
use std::net::SocketAddr;

use uuid::Uuid;

/// Identifies one accepted controller connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // The first group of the UUID is enough to tell connections apart in logs.
        let text = self.0.to_string();
        f.write_str(text.split('-').next().unwrap_or(&text))
    }
}

/// Why a setup flow ended without reaching `OK` or `ERROR`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetupAbortReason {
    /// The controller sent `abort_driver_setup`.
    Controller,
    /// The connection that owned the flow closed.
    ConnectionLost,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DriverEvent {
    /// A WebSocket connection was accepted and greeted.
    ClientConnected {
        connection: ConnectionId,
        peer: SocketAddr,
    },
    /// A WebSocket connection closed, for whatever reason.
    ClientDisconnected { connection: ConnectionId },
    /// The controller asked the driver to connect to its devices.
    Connect,
    /// The controller asked the driver to disconnect from its devices.
    Disconnect,
    EnterStandby,
    ExitStandby,
    SubscribeEntities {
        connection: ConnectionId,
        entity_ids: Vec<String>,
    },
    UnsubscribeEntities {
        connection: ConnectionId,
        entity_ids: Vec<String>,
    },
    SetupAborted { reason: SetupAbortReason },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_ids_are_unique() {
        assert_ne!(ConnectionId::new(), ConnectionId::new());
    }

    #[test]
    fn test_connection_id_display_is_short() {
        let id = ConnectionId::new();
        assert_eq!(id.to_string().len(), 8);
    }
}
