//! Connection hub: the set of live sessions and the broadcast fan-out.
//!
//! Broadcasting copies the session list under a short read lock and then
//! delivers outside of it, so connections can come and go while a broadcast
//! is running.  A session that is closed or cannot keep up is skipped (and,
//! if lagging, removed after the loop); it never stops delivery to the rest.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use tracing::{debug, warn};

use ucapi_core::protocol::messages::{names, EntityChange};
use ucapi_core::{EventCategory, OutboundMessage};

use super::registry::EntityChangeSink;
use super::session::{ConnectionSession, DeliveryError, Frame};
use crate::domain::ConnectionId;

/// Which sessions a broadcast goes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Audience {
    All,
    Subscribed,
}

#[derive(Default)]
pub struct ConnectionHub {
    sessions: RwLock<HashMap<ConnectionId, Arc<ConnectionSession>>>,
}

impl ConnectionHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, session: Arc<ConnectionSession>) {
        self.write().insert(session.id(), session);
    }

    pub fn remove(&self, id: ConnectionId) -> Option<Arc<ConnectionSession>> {
        self.write().remove(&id)
    }

    pub fn get(&self, id: ConnectionId) -> Option<Arc<ConnectionSession>> {
        self.read().get(&id).cloned()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy of the current session list.
    pub fn snapshot(&self) -> Vec<Arc<ConnectionSession>> {
        self.read().values().cloned().collect()
    }

    /// Serializes `message` once and queues it on every session in
    /// `audience`.  Returns the number of sessions it was queued on.
    pub fn broadcast(&self, message: &OutboundMessage, audience: Audience) -> usize {
        let frame: Frame = match message.to_json() {
            Ok(json) => Frame::from(json),
            Err(e) => {
                warn!("broadcast of '{}' skipped: {e}", message.msg());
                return 0;
            }
        };

        let mut delivered = 0;
        let mut lagging = Vec::new();
        for session in self.snapshot() {
            if audience == Audience::Subscribed && !session.is_subscribed() {
                continue;
            }
            match session.try_deliver(Arc::clone(&frame)) {
                Ok(()) => delivered += 1,
                Err(DeliveryError::Lagging) => lagging.push(session.id()),
                Err(DeliveryError::Closed) => {
                    debug!("broadcast: connection {} already closed", session.id());
                }
            }
        }

        if !lagging.is_empty() {
            let mut sessions = self.write();
            for id in lagging {
                sessions.remove(&id);
            }
        }

        debug!("broadcast '{}' to {delivered} connection(s)", message.msg());
        delivered
    }

    // Lock poisoning only happens if a thread panicked mid-insert/remove; the
    // map itself is still consistent, so keep using it.
    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<ConnectionId, Arc<ConnectionSession>>> {
        self.sessions.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(
        &self,
    ) -> std::sync::RwLockWriteGuard<'_, HashMap<ConnectionId, Arc<ConnectionSession>>> {
        self.sessions.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl EntityChangeSink for ConnectionHub {
    fn entity_changed(&self, change: EntityChange) {
        let msg_data = match serde_json::to_value(&change) {
            Ok(value) => value,
            Err(e) => {
                warn!("entity '{}': change not serializable: {e}", change.entity_id);
                return;
            }
        };
        let event = OutboundMessage::event(names::ENTITY_CHANGE, EventCategory::Entity, msg_data);
        self.broadcast(&event, Audience::Subscribed);
    }
}
