//! Driver metadata: the contents of a driver's `driver.json`.
//!
//! The engine reads a few fields (id, name, version, developer, port) and
//! serves the whole document back verbatim for `get_driver_metadata`, so
//! unknown fields are preserved in [`DriverMetadata::extra`].

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use ucapi_core::protocol::messages::{DriverVersion, VersionInfo};
use ucapi_core::LanguageText;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DriverMetadata {
    pub driver_id: String,
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_core_api: Option<String>,
    pub name: LanguageText,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub developer: Option<Developer>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Developer {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
}

impl DriverMetadata {
    /// Minimal metadata for tests and embedded use.
    pub fn new(driver_id: impl Into<String>, name: impl Into<LanguageText>, version: &str) -> Self {
        Self {
            driver_id: driver_id.into(),
            version: version.to_string(),
            min_core_api: None,
            name: name.into(),
            developer: None,
            port: None,
            extra: Map::new(),
        }
    }

    /// Parses a `driver.json` document.
    ///
    /// # Errors
    ///
    /// Returns the `serde_json` error if required fields are missing.
    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    /// Display name in the default language.
    pub fn display_name(&self) -> &str {
        self.name.default_text_or(&self.driver_id)
    }

    /// `msg_data` of a `driver_version` response.
    pub fn driver_version(&self) -> DriverVersion {
        DriverVersion {
            name: self.display_name().to_string(),
            version: VersionInfo {
                api: self.min_core_api.clone(),
                driver: self.version.clone(),
            },
        }
    }

    /// The full document for `get_driver_metadata`.
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}
