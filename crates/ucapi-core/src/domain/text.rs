//! Localized text: a map from language code to display string.
//!
//! On the wire a localized label is a JSON object such as
//! `{"en": "Living room", "de": "Wohnzimmer"}`.  Driver code usually only has
//! an English string at hand, so `From<&str>` wraps it under the `en` key.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// A language-code → text map.
///
/// Keys are kept sorted, so "first entry" in [`LanguageText::default_text`]
/// means the alphabetically first language code.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LanguageText(BTreeMap<String, String>);

impl LanguageText {
    /// Creates an empty text map.
    pub fn new() -> Self {
        Self(BTreeMap::new())
    }

    /// Adds or replaces the text for `language`, builder style.
    pub fn with(mut self, language: impl Into<String>, text: impl Into<String>) -> Self {
        self.0.insert(language.into(), text.into());
        self
    }

    /// Returns the text for an exact language code.
    pub fn get(&self, language: &str) -> Option<&str> {
        self.0.get(language).map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Picks the text to show when the caller has no language preference.
    ///
    /// Lookup order: `en`, then the first `en-*` variant, then whatever entry
    /// comes first.  Returns `None` only for an empty map.
    pub fn default_text(&self) -> Option<&str> {
        if let Some(text) = self.get("en") {
            return Some(text);
        }
        if let Some((_, text)) = self.0.iter().find(|(lang, _)| lang.starts_with("en-")) {
            return Some(text);
        }
        self.0.values().next().map(String::as_str)
    }

    /// Like [`default_text`](Self::default_text) but never empty.
    pub fn default_text_or<'a>(&'a self, fallback: &'a str) -> &'a str {
        self.default_text().unwrap_or(fallback)
    }
}

impl From<&str> for LanguageText {
    fn from(text: &str) -> Self {
        Self::new().with("en", text)
    }
}

impl From<String> for LanguageText {
    fn from(text: String) -> Self {
        Self::new().with("en", text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_str_uses_english_key() {
        let text = LanguageText::from("Kitchen");
        assert_eq!(text.get("en"), Some("Kitchen"));
    }

    #[test]
    fn test_default_text_prefers_plain_english() {
        // Arrange
        let text = LanguageText::new()
            .with("de", "Küche")
            .with("en-US", "Kitchen (US)")
            .with("en", "Kitchen");

        // Act / Assert
        assert_eq!(text.default_text(), Some("Kitchen"));
    }

    #[test]
    fn test_default_text_falls_back_to_english_variant() {
        let text = LanguageText::new().with("de", "Küche").with("en-GB", "Kitchen");
        assert_eq!(text.default_text(), Some("Kitchen"));
    }

    #[test]
    fn test_default_text_falls_back_to_first_entry() {
        let text = LanguageText::new().with("fr", "Cuisine").with("de", "Küche");
        // "de" sorts before "fr".
        assert_eq!(text.default_text(), Some("Küche"));
    }

    #[test]
    fn test_default_text_or_on_empty_map_uses_fallback() {
        let text = LanguageText::new();
        assert_eq!(text.default_text_or("Unknown"), "Unknown");
    }

    #[test]
    fn test_serializes_as_plain_object() {
        let text = LanguageText::from("Lamp");
        let json = serde_json::to_value(&text).unwrap();
        assert_eq!(json, serde_json::json!({"en": "Lamp"}));
    }
}
