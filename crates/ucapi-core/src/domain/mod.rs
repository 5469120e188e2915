//! Domain types shared by the engine and by driver code.

pub mod capabilities;
pub mod entity;
pub mod setup;
pub mod text;

pub use entity::{Entity, EntityBuilder, EntityError, EntityType};
pub use setup::{SetupAction, SetupErrorCode, SetupRequest, SetupStep};
pub use text::LanguageText;
