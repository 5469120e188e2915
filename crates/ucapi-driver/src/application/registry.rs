//! The entity registry: the authoritative store of every entity the driver
//! exposes.
//!
//! # Locking model
//!
//! The id → entity map sits behind one `RwLock` that is only held for map
//! operations (insert, remove, look up a slot).  Each entity lives in its own
//! `tokio::sync::Mutex`, so attribute updates to one id are serialized in
//! arrival order (tokio's mutex is FIFO-fair) while updates to different ids
//! run in parallel.
//!
//! The change notification for an update is handed to the
//! [`EntityChangeSink`] *while the entity's lock is still held*.  The sink
//! enqueues frames without awaiting, so every connection sees one entity's
//! changes in exactly the order they were applied.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::{Map, Value};
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info};

use ucapi_core::protocol::messages::{EntityChange, EntityState};
use ucapi_core::{Entity, EntityError};

#[derive(Debug, Error, Clone, PartialEq)]
pub enum RegistryError {
    #[error("an entity with id '{0}' is already registered")]
    DuplicateIdentity(String),

    #[error("no entity with id '{0}'")]
    NotFound(String),

    #[error(transparent)]
    InvalidAttribute(#[from] EntityError),
}

/// Receives one notification per successful attribute update.
///
/// Called with the entity's lock held, so implementations must not block or
/// call back into the registry.
pub trait EntityChangeSink: Send + Sync {
    fn entity_changed(&self, change: EntityChange);
}

#[derive(Default)]
struct Slots {
    order: Vec<String>,
    by_id: HashMap<String, Arc<Mutex<Entity>>>,
}

pub struct EntityRegistry {
    slots: RwLock<Slots>,
    sink: Arc<dyn EntityChangeSink>,
}

impl EntityRegistry {
    pub fn new(sink: Arc<dyn EntityChangeSink>) -> Self {
        Self {
            slots: RwLock::new(Slots::default()),
            sink,
        }
    }

    /// Adds an entity.
    ///
    /// # Errors
    ///
    /// [`RegistryError::DuplicateIdentity`] if the id is taken; the registry
    /// keeps the entity it already had.
    pub async fn register(&self, entity: Entity) -> Result<(), RegistryError> {
        let mut slots = self.slots.write().await;
        let id = entity.id().to_string();
        if slots.by_id.contains_key(&id) {
            return Err(RegistryError::DuplicateIdentity(id));
        }
        info!("registered {} entity '{id}'", entity.entity_type());
        slots.order.push(id.clone());
        slots.by_id.insert(id, Arc::new(Mutex::new(entity)));
        Ok(())
    }

    /// Removes an entity.  Returns whether it was present; removing an
    /// unknown id is not an error.
    pub async fn unregister(&self, id: &str) -> bool {
        let mut slots = self.slots.write().await;
        if slots.by_id.remove(id).is_none() {
            debug!("unregister of unknown entity '{id}' ignored");
            return false;
        }
        slots.order.retain(|existing| existing != id);
        info!("unregistered entity '{id}'");
        true
    }

    /// Removes every entity.
    pub async fn clear(&self) {
        let mut slots = self.slots.write().await;
        slots.order.clear();
        slots.by_id.clear();
    }

    pub async fn contains(&self, id: &str) -> bool {
        self.slots.read().await.by_id.contains_key(id)
    }

    pub async fn len(&self) -> usize {
        self.slots.read().await.order.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// A snapshot of one entity, or `None` for an unknown id.
    pub async fn get(&self, id: &str) -> Option<Entity> {
        let slot = self.slot(id).await?;
        let entity = slot.lock().await;
        Some(entity.clone())
    }

    /// Snapshots of all entities in registration order.
    pub async fn list(&self) -> Vec<Entity> {
        let mut entities = Vec::new();
        for slot in self.ordered_slots().await {
            entities.push(slot.lock().await.clone());
        }
        entities
    }

    /// Current attributes of all entities, for `get_entity_states`.
    pub async fn states(&self) -> Vec<EntityState> {
        let mut states = Vec::new();
        for slot in self.ordered_slots().await {
            states.push(slot.lock().await.to_state());
        }
        states
    }

    /// Validates and merges `partial` into an entity's attributes, then
    /// notifies the change sink.
    ///
    /// The sink is notified on every successful call, even when the merged
    /// values equal the old ones.
    ///
    /// # Errors
    ///
    /// - [`RegistryError::NotFound`] for an unknown id.
    /// - [`RegistryError::InvalidAttribute`] if any key or the `state` value
    ///   is not legal; nothing is merged in that case.
    pub async fn update_attributes(
        &self,
        id: &str,
        partial: Map<String, Value>,
    ) -> Result<(), RegistryError> {
        let slot = self
            .slot(id)
            .await
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))?;

        let mut entity = slot.lock().await;
        // Unregistered (or replaced) while this update waited for the lock.
        let current = self.slot(id).await;
        if !current.is_some_and(|current| Arc::ptr_eq(&current, &slot)) {
            return Err(RegistryError::NotFound(id.to_string()));
        }
        entity.apply_attributes(&partial)?;
        debug!("entity '{id}' updated: {} attribute(s)", partial.len());

        self.sink.entity_changed(EntityChange {
            entity_id: entity.id().to_string(),
            entity_type: entity.entity_type(),
            attributes: partial,
        });
        Ok(())
    }

    // ── Helpers ───────────────────────────────────────────────────────────────

    async fn slot(&self, id: &str) -> Option<Arc<Mutex<Entity>>> {
        self.slots.read().await.by_id.get(id).cloned()
    }

    /// Clones the slot handles so entity locks are taken after the map lock
    /// has been released.
    async fn ordered_slots(&self) -> Vec<Arc<Mutex<Entity>>> {
        let slots = self.slots.read().await;
        slots
            .order
            .iter()
            .filter_map(|id| slots.by_id.get(id).cloned())
            .collect()
    }
}
