//! The entity model: one controllable thing exposed to the controller.
//!
//! An [`Entity`] has a fixed identity (id, type, features, options) and a
//! mutable attribute map.  Identity is settled once by [`EntityBuilder::build`];
//! afterwards the only way to change an entity is
//! [`Entity::apply_attributes`], which validates the whole update before it
//! merges anything.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use super::capabilities::{capabilities, TypeCapabilities, STATE_ATTRIBUTE};
use super::text::LanguageText;
use crate::protocol::messages::{AvailableEntity, EntityState};

/// Errors raised while building an entity or validating an attribute update.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum EntityError {
    #[error("entity id must not be empty")]
    EmptyId,

    #[error("unknown entity type '{0}'")]
    UnknownType(String),

    #[error("{entity_type} entity does not support feature '{feature}'")]
    UnsupportedFeature {
        entity_type: EntityType,
        feature: String,
    },

    #[error("{entity_type} entity does not support device class '{device_class}'")]
    UnsupportedDeviceClass {
        entity_type: EntityType,
        device_class: String,
    },

    /// An attribute key, or a `state` value, that the entity may not carry.
    #[error("invalid attribute '{attribute}' for entity '{entity_id}': {reason}")]
    InvalidAttribute {
        entity_id: String,
        attribute: String,
        reason: String,
    },
}

// ── EntityType ────────────────────────────────────────────────────────────────

/// The fixed set of entity types a driver can expose.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Button,
    Switch,
    Climate,
    Cover,
    Light,
    MediaPlayer,
    Remote,
    Sensor,
    BinarySensor,
    IrEmitter,
    Select,
    VoiceAssistant,
}

impl EntityType {
    pub const ALL: [EntityType; 12] = [
        EntityType::Button,
        EntityType::Switch,
        EntityType::Climate,
        EntityType::Cover,
        EntityType::Light,
        EntityType::MediaPlayer,
        EntityType::Remote,
        EntityType::Sensor,
        EntityType::BinarySensor,
        EntityType::IrEmitter,
        EntityType::Select,
        EntityType::VoiceAssistant,
    ];

    /// The wire name, e.g. `"media_player"`.
    pub fn as_str(self) -> &'static str {
        match self {
            EntityType::Button => "button",
            EntityType::Switch => "switch",
            EntityType::Climate => "climate",
            EntityType::Cover => "cover",
            EntityType::Light => "light",
            EntityType::MediaPlayer => "media_player",
            EntityType::Remote => "remote",
            EntityType::Sensor => "sensor",
            EntityType::BinarySensor => "binary_sensor",
            EntityType::IrEmitter => "ir_emitter",
            EntityType::Select => "select",
            EntityType::VoiceAssistant => "voice_assistant",
        }
    }

    pub fn capabilities(self) -> &'static TypeCapabilities {
        capabilities(self)
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityType {
    type Err = EntityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EntityType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| EntityError::UnknownType(s.to_string()))
    }
}

// ── Entity ────────────────────────────────────────────────────────────────────

/// A controllable entity and its current attribute values.
#[derive(Debug, Clone, PartialEq)]
pub struct Entity {
    id: String,
    entity_type: EntityType,
    name: LanguageText,
    features: Vec<String>,
    options: Option<Map<String, Value>>,
    attributes: Map<String, Value>,
    device_class: Option<String>,
    device_id: Option<String>,
    area: Option<String>,
}

impl Entity {
    /// Starts building an entity of `entity_type`.
    ///
    /// ```rust
    /// use ucapi_core::{Entity, EntityType};
    /// use serde_json::json;
    ///
    /// let light = Entity::builder("light-1", EntityType::Light, "Desk lamp")
    ///     .features(["on_off", "dim"])
    ///     .attribute("state", json!("OFF"))
    ///     .build()
    ///     .unwrap();
    /// assert!(light.has_feature("dim"));
    /// ```
    pub fn builder(
        id: impl Into<String>,
        entity_type: EntityType,
        name: impl Into<LanguageText>,
    ) -> EntityBuilder {
        EntityBuilder {
            entity: Entity {
                id: id.into(),
                entity_type,
                name: name.into(),
                features: Vec::new(),
                options: None,
                attributes: Map::new(),
                device_class: None,
                device_id: None,
                area: None,
            },
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn entity_type(&self) -> EntityType {
        self.entity_type
    }

    pub fn name(&self) -> &LanguageText {
        &self.name
    }

    pub fn features(&self) -> &[String] {
        &self.features
    }

    pub fn has_feature(&self, feature: &str) -> bool {
        self.features.iter().any(|f| f == feature)
    }

    pub fn options(&self) -> Option<&Map<String, Value>> {
        self.options.as_ref()
    }

    pub fn attributes(&self) -> &Map<String, Value> {
        &self.attributes
    }

    pub fn attribute(&self, key: &str) -> Option<&Value> {
        self.attributes.get(key)
    }

    pub fn device_class(&self) -> Option<&str> {
        self.device_class.as_deref()
    }

    pub fn device_id(&self) -> Option<&str> {
        self.device_id.as_deref()
    }

    pub fn area(&self) -> Option<&str> {
        self.area.as_deref()
    }

    /// Checks every key (and the `state` value, if present) of `partial`
    /// without changing anything.
    ///
    /// # Errors
    ///
    /// Returns [`EntityError::InvalidAttribute`] for the first offending key.
    pub fn validate_attributes(&self, partial: &Map<String, Value>) -> Result<(), EntityError> {
        let caps = self.entity_type.capabilities();
        for (key, value) in partial {
            let rule = caps
                .attribute(key)
                .ok_or_else(|| self.invalid(key, format!("not an attribute of {}", self.entity_type)))?;

            if !rule.requires_any.is_empty()
                && !rule.requires_any.iter().any(|f| self.has_feature(f))
            {
                return Err(self.invalid(
                    key,
                    format!("requires one of the features {:?}", rule.requires_any),
                ));
            }

            if key == STATE_ATTRIBUTE {
                let state = value
                    .as_str()
                    .ok_or_else(|| self.invalid(key, "state must be a string".to_string()))?;
                if !caps.supports_state(state) {
                    return Err(self.invalid(key, format!("'{state}' is not a legal state")));
                }
            }
        }
        Ok(())
    }

    /// Validates `partial` as a whole and, only if every key passes, merges it
    /// into the current attributes.
    ///
    /// # Errors
    ///
    /// Returns [`EntityError::InvalidAttribute`]; the entity is unchanged.
    pub fn apply_attributes(&mut self, partial: &Map<String, Value>) -> Result<(), EntityError> {
        self.validate_attributes(partial)?;
        for (key, value) in partial {
            self.attributes.insert(key.clone(), value.clone());
        }
        Ok(())
    }

    /// The entry for an `available_entities` response.
    pub fn to_available(&self) -> AvailableEntity {
        AvailableEntity {
            entity_id: self.id.clone(),
            entity_type: self.entity_type,
            device_id: self.device_id.clone(),
            features: self.features.clone(),
            name: self.name.clone(),
            area: self.area.clone(),
            device_class: self.device_class.clone(),
            options: self.options.clone(),
        }
    }

    /// The entry for an `entity_states` response.
    pub fn to_state(&self) -> EntityState {
        EntityState {
            entity_id: self.id.clone(),
            entity_type: self.entity_type,
            device_id: self.device_id.clone(),
            attributes: self.attributes.clone(),
        }
    }

    fn invalid(&self, key: &str, reason: String) -> EntityError {
        EntityError::InvalidAttribute {
            entity_id: self.id.clone(),
            attribute: key.to_string(),
            reason,
        }
    }
}

// ── Builder ───────────────────────────────────────────────────────────────────

/// Collects the immutable parts of an [`Entity`] and validates them once.
#[derive(Debug, Clone)]
pub struct EntityBuilder {
    entity: Entity,
}

impl EntityBuilder {
    pub fn features<I, S>(mut self, features: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.entity.features = features.into_iter().map(Into::into).collect();
        self
    }

    pub fn options(mut self, options: Map<String, Value>) -> Self {
        self.entity.options = Some(options);
        self
    }

    pub fn attribute(mut self, key: impl Into<String>, value: Value) -> Self {
        self.entity.attributes.insert(key.into(), value);
        self
    }

    pub fn attributes(mut self, attributes: Map<String, Value>) -> Self {
        self.entity.attributes.extend(attributes);
        self
    }

    pub fn device_class(mut self, device_class: impl Into<String>) -> Self {
        self.entity.device_class = Some(device_class.into());
        self
    }

    pub fn device_id(mut self, device_id: impl Into<String>) -> Self {
        self.entity.device_id = Some(device_id.into());
        self
    }

    pub fn area(mut self, area: impl Into<String>) -> Self {
        self.entity.area = Some(area.into());
        self
    }

    /// Validates id, features, device class and initial attributes.
    ///
    /// # Errors
    ///
    /// Returns the first [`EntityError`] found.
    pub fn build(self) -> Result<Entity, EntityError> {
        let entity = self.entity;
        if entity.id.is_empty() {
            return Err(EntityError::EmptyId);
        }

        let caps = entity.entity_type.capabilities();
        if let Some(feature) = entity.features.iter().find(|f| !caps.supports_feature(f)) {
            return Err(EntityError::UnsupportedFeature {
                entity_type: entity.entity_type,
                feature: feature.clone(),
            });
        }

        if let Some(class) = entity.device_class.as_deref() {
            if !caps.supports_device_class(class) {
                return Err(EntityError::UnsupportedDeviceClass {
                    entity_type: entity.entity_type,
                    device_class: class.to_string(),
                });
            }
        }

        entity.validate_attributes(&entity.attributes)?;
        Ok(entity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn attrs(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    fn media_player() -> Entity {
        Entity::builder("mp-1", EntityType::MediaPlayer, "Receiver")
            .features(["on_off", "volume"])
            .attribute("state", json!("OFF"))
            .device_class("receiver")
            .build()
            .unwrap()
    }

    #[test]
    fn test_entity_type_parses_wire_name() {
        assert_eq!(
            "binary_sensor".parse::<EntityType>().unwrap(),
            EntityType::BinarySensor
        );
        assert!("toaster".parse::<EntityType>().is_err());
    }

    #[test]
    fn test_build_rejects_empty_id() {
        let result = Entity::builder("", EntityType::Button, "Push").build();
        assert_eq!(result, Err(EntityError::EmptyId));
    }

    #[test]
    fn test_build_rejects_feature_of_another_type() {
        // Arrange: "dim" belongs to lights, not switches
        let builder = Entity::builder("sw", EntityType::Switch, "Plug").features(["on_off", "dim"]);

        // Act
        let result = builder.build();

        // Assert
        assert!(matches!(
            result,
            Err(EntityError::UnsupportedFeature { ref feature, .. }) if feature == "dim"
        ));
    }

    #[test]
    fn test_build_rejects_unknown_device_class() {
        let result = Entity::builder("c", EntityType::Cover, "Blind")
            .device_class("toaster")
            .build();
        assert!(matches!(result, Err(EntityError::UnsupportedDeviceClass { .. })));
    }

    #[test]
    fn test_build_rejects_illegal_initial_state() {
        let result = Entity::builder("b", EntityType::Button, "Push")
            .attribute("state", json!("PLAYING"))
            .build();
        assert!(matches!(result, Err(EntityError::InvalidAttribute { .. })));
    }

    #[test]
    fn test_apply_attributes_merges_legal_keys() {
        // Arrange
        let mut entity = media_player();

        // Act
        entity
            .apply_attributes(&attrs(json!({"state": "ON", "volume": 40})))
            .unwrap();

        // Assert
        assert_eq!(entity.attribute("state"), Some(&json!("ON")));
        assert_eq!(entity.attribute("volume"), Some(&json!(40)));
    }

    #[test]
    fn test_apply_attributes_rejects_whole_update_on_one_bad_key() {
        // Arrange
        let mut entity = media_player();
        let before = entity.attributes().clone();

        // Act: "state" is fine, "brightness" is not a media player attribute
        let result = entity.apply_attributes(&attrs(json!({"state": "ON", "brightness": 10})));

        // Assert: nothing was merged
        assert!(matches!(
            result,
            Err(EntityError::InvalidAttribute { ref attribute, .. }) if attribute == "brightness"
        ));
        assert_eq!(entity.attributes(), &before);
    }

    #[test]
    fn test_apply_attributes_rejects_attribute_without_gating_feature() {
        // Arrange: media_title needs the media_title feature, which mp-1 lacks
        let mut entity = media_player();

        // Act
        let result = entity.apply_attributes(&attrs(json!({"media_title": "Song"})));

        // Assert
        assert!(result.is_err());
        assert!(entity.attribute("media_title").is_none());
    }

    #[test]
    fn test_apply_attributes_rejects_illegal_state_value() {
        let mut entity = media_player();
        let result = entity.apply_attributes(&attrs(json!({"state": "OPENING"})));
        assert!(result.is_err());
        assert_eq!(entity.attribute("state"), Some(&json!("OFF")));
    }

    #[test]
    fn test_apply_attributes_rejects_non_string_state() {
        let mut entity = media_player();
        assert!(entity.apply_attributes(&attrs(json!({"state": 1}))).is_err());
    }

    #[test]
    fn test_to_available_carries_identity() {
        let entity = Entity::builder("va", EntityType::VoiceAssistant, "Assistant")
            .features(["transcription"])
            .device_id("hub")
            .area("Kitchen")
            .build()
            .unwrap();

        let available = entity.to_available();

        assert_eq!(available.entity_id, "va");
        assert_eq!(available.entity_type, EntityType::VoiceAssistant);
        assert_eq!(available.device_id.as_deref(), Some("hub"));
        assert_eq!(available.area.as_deref(), Some("Kitchen"));
        assert_eq!(available.features, vec!["transcription".to_string()]);
    }
}
