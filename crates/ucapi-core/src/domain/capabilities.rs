//! Static capability tables: which features, attributes, states and device
//! classes each entity type accepts.
//!
//! These tables are the single place that decides whether an attribute key or
//! a `state` value is legal for an entity.  [`Entity`](super::entity::Entity)
//! consults them when it is built and on every attribute update.

use super::entity::EntityType;

/// One legal attribute of an entity type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttributeRule {
    pub name: &'static str,
    /// Features that unlock this attribute.  Empty means always allowed;
    /// otherwise the entity must declare at least one of them.
    pub requires_any: &'static [&'static str],
}

impl AttributeRule {
    const fn always(name: &'static str) -> Self {
        Self {
            name,
            requires_any: &[],
        }
    }

    const fn gated(name: &'static str, requires_any: &'static [&'static str]) -> Self {
        Self { name, requires_any }
    }
}

/// Everything the engine knows about one entity type.
#[derive(Debug, Clone, Copy)]
pub struct TypeCapabilities {
    pub features: &'static [&'static str],
    pub attributes: &'static [AttributeRule],
    pub states: &'static [&'static str],
    pub device_classes: &'static [&'static str],
}

impl TypeCapabilities {
    pub fn supports_feature(&self, feature: &str) -> bool {
        self.features.contains(&feature)
    }

    pub fn attribute(&self, name: &str) -> Option<&AttributeRule> {
        self.attributes.iter().find(|rule| rule.name == name)
    }

    pub fn supports_state(&self, state: &str) -> bool {
        self.states.contains(&state)
    }

    pub fn supports_device_class(&self, class: &str) -> bool {
        self.device_classes.contains(&class)
    }
}

/// Attribute key carrying the entity state on every type.
pub const STATE_ATTRIBUTE: &str = "state";

// ── Per-type tables ───────────────────────────────────────────────────────────

const BUTTON: TypeCapabilities = TypeCapabilities {
    features: &["press"],
    attributes: &[AttributeRule::always(STATE_ATTRIBUTE)],
    states: &["AVAILABLE", "UNAVAILABLE"],
    device_classes: &[],
};

const SWITCH: TypeCapabilities = TypeCapabilities {
    features: &["on_off", "toggle"],
    attributes: &[AttributeRule::always(STATE_ATTRIBUTE)],
    states: &["ON", "OFF", "UNAVAILABLE", "UNKNOWN"],
    device_classes: &["outlet", "switch"],
};

const CLIMATE: TypeCapabilities = TypeCapabilities {
    features: &[
        "on_off",
        "heat",
        "cool",
        "current_temperature",
        "target_temperature",
        "target_temperature_range",
        "fan",
    ],
    attributes: &[
        AttributeRule::always(STATE_ATTRIBUTE),
        AttributeRule::gated("current_temperature", &["current_temperature"]),
        AttributeRule::gated("target_temperature", &["target_temperature"]),
        AttributeRule::gated("target_temperature_high", &["target_temperature_range"]),
        AttributeRule::gated("target_temperature_low", &["target_temperature_range"]),
        AttributeRule::gated("fan_mode", &["fan"]),
    ],
    states: &[
        "OFF",
        "HEAT",
        "COOL",
        "HEAT_COOL",
        "FAN",
        "AUTO",
        "UNAVAILABLE",
        "UNKNOWN",
    ],
    device_classes: &[],
};

const COVER: TypeCapabilities = TypeCapabilities {
    features: &[
        "open",
        "close",
        "stop",
        "position",
        "tilt",
        "tilt_stop",
        "tilt_position",
    ],
    attributes: &[
        AttributeRule::always(STATE_ATTRIBUTE),
        AttributeRule::gated("position", &["position"]),
        AttributeRule::gated("tilt_position", &["tilt_position"]),
    ],
    states: &[
        "OPENING",
        "OPEN",
        "CLOSING",
        "CLOSED",
        "UNAVAILABLE",
        "UNKNOWN",
    ],
    device_classes: &["blind", "curtain", "garage", "shade", "door", "gate", "window"],
};

const LIGHT: TypeCapabilities = TypeCapabilities {
    features: &["on_off", "toggle", "dim", "color", "color_temperature"],
    attributes: &[
        AttributeRule::always(STATE_ATTRIBUTE),
        AttributeRule::gated("hue", &["color"]),
        AttributeRule::gated("saturation", &["color"]),
        AttributeRule::gated("brightness", &["dim"]),
        AttributeRule::gated("color_temperature", &["color_temperature"]),
    ],
    states: &["ON", "OFF", "UNAVAILABLE", "UNKNOWN"],
    device_classes: &[],
};

const MEDIA_PLAYER: TypeCapabilities = TypeCapabilities {
    features: &[
        "on_off",
        "toggle",
        "volume",
        "volume_up_down",
        "mute_toggle",
        "mute",
        "unmute",
        "play_pause",
        "stop",
        "next",
        "previous",
        "fast_forward",
        "rewind",
        "repeat",
        "shuffle",
        "seek",
        "media_duration",
        "media_position",
        "media_title",
        "media_artist",
        "media_album",
        "media_image_url",
        "media_type",
        "dpad",
        "numpad",
        "home",
        "menu",
        "context_menu",
        "guide",
        "info",
        "color_buttons",
        "channel_switcher",
        "select_source",
        "select_sound_mode",
        "eject",
        "open_close",
        "audio_track",
        "subtitle",
        "record",
        "settings",
    ],
    attributes: &[
        AttributeRule::always(STATE_ATTRIBUTE),
        AttributeRule::gated("volume", &["volume", "volume_up_down"]),
        AttributeRule::gated("muted", &["mute", "unmute", "mute_toggle"]),
        AttributeRule::gated("media_duration", &["media_duration"]),
        AttributeRule::gated("media_position", &["media_position", "seek"]),
        AttributeRule::gated("media_type", &["media_type"]),
        AttributeRule::gated("media_image_url", &["media_image_url"]),
        AttributeRule::gated("media_title", &["media_title"]),
        AttributeRule::gated("media_artist", &["media_artist"]),
        AttributeRule::gated("media_album", &["media_album"]),
        AttributeRule::gated("repeat", &["repeat"]),
        AttributeRule::gated("shuffle", &["shuffle"]),
        AttributeRule::gated("source", &["select_source"]),
        AttributeRule::gated("source_list", &["select_source"]),
        AttributeRule::gated("sound_mode", &["select_sound_mode"]),
        AttributeRule::gated("sound_mode_list", &["select_sound_mode"]),
    ],
    states: &[
        "ON",
        "OFF",
        "PLAYING",
        "PAUSED",
        "STANDBY",
        "BUFFERING",
        "UNAVAILABLE",
        "UNKNOWN",
    ],
    device_classes: &["receiver", "set_top_box", "speaker", "streaming_box", "tv"],
};

const REMOTE: TypeCapabilities = TypeCapabilities {
    features: &["on_off", "toggle", "send_cmd"],
    attributes: &[AttributeRule::always(STATE_ATTRIBUTE)],
    states: &["ON", "OFF", "UNAVAILABLE", "UNKNOWN"],
    device_classes: &[],
};

const SENSOR: TypeCapabilities = TypeCapabilities {
    features: &[],
    attributes: &[
        AttributeRule::always(STATE_ATTRIBUTE),
        AttributeRule::always("value"),
        AttributeRule::always("unit"),
    ],
    states: &["ON", "UNAVAILABLE", "UNKNOWN"],
    device_classes: &[
        "custom",
        "battery",
        "current",
        "energy",
        "humidity",
        "power",
        "temperature",
        "voltage",
    ],
};

const BINARY_SENSOR: TypeCapabilities = TypeCapabilities {
    features: &[],
    attributes: &[AttributeRule::always(STATE_ATTRIBUTE)],
    states: &["ON", "OFF", "UNAVAILABLE", "UNKNOWN"],
    device_classes: &[
        "battery",
        "connectivity",
        "door",
        "lock",
        "moisture",
        "motion",
        "occupancy",
        "problem",
        "smoke",
        "window",
    ],
};

const IR_EMITTER: TypeCapabilities = TypeCapabilities {
    features: &["send_ir"],
    attributes: &[AttributeRule::always(STATE_ATTRIBUTE)],
    states: &["ON", "UNAVAILABLE", "UNKNOWN"],
    device_classes: &[],
};

const SELECT: TypeCapabilities = TypeCapabilities {
    features: &[],
    attributes: &[
        AttributeRule::always(STATE_ATTRIBUTE),
        AttributeRule::always("current_option"),
        AttributeRule::always("options"),
    ],
    states: &["ON", "UNAVAILABLE", "UNKNOWN"],
    device_classes: &[],
};

const VOICE_ASSISTANT: TypeCapabilities = TypeCapabilities {
    features: &["transcription", "response_text", "response_speech"],
    attributes: &[AttributeRule::always(STATE_ATTRIBUTE)],
    states: &["ON", "OFF", "UNAVAILABLE", "UNKNOWN"],
    device_classes: &[],
};

/// Returns the capability table for `entity_type`.
pub fn capabilities(entity_type: EntityType) -> &'static TypeCapabilities {
    match entity_type {
        EntityType::Button => &BUTTON,
        EntityType::Switch => &SWITCH,
        EntityType::Climate => &CLIMATE,
        EntityType::Cover => &COVER,
        EntityType::Light => &LIGHT,
        EntityType::MediaPlayer => &MEDIA_PLAYER,
        EntityType::Remote => &REMOTE,
        EntityType::Sensor => &SENSOR,
        EntityType::BinarySensor => &BINARY_SENSOR,
        EntityType::IrEmitter => &IR_EMITTER,
        EntityType::Select => &SELECT,
        EntityType::VoiceAssistant => &VOICE_ASSISTANT,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_type_accepts_state_attribute() {
        for entity_type in EntityType::ALL {
            let caps = capabilities(entity_type);
            assert!(
                caps.attribute(STATE_ATTRIBUTE).is_some(),
                "{entity_type} must accept the state attribute"
            );
        }
    }

    #[test]
    fn test_gated_attribute_lists_its_features() {
        let rule = capabilities(EntityType::Light).attribute("brightness").unwrap();
        assert_eq!(rule.requires_any, &["dim"]);
    }

    #[test]
    fn test_gate_features_exist_in_feature_table() {
        // A gate naming a feature the type cannot declare would make the
        // attribute unreachable.
        for entity_type in EntityType::ALL {
            let caps = capabilities(entity_type);
            for rule in caps.attributes {
                for feature in rule.requires_any {
                    assert!(
                        caps.supports_feature(feature),
                        "{entity_type}.{} is gated on unknown feature {feature}",
                        rule.name
                    );
                }
            }
        }
    }
}
