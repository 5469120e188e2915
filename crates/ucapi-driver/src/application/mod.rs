//! Application layer: the integration engine and the pieces it is built from.

pub mod callbacks;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod hub;
pub mod registry;
pub mod session;
pub mod setup_flow;
pub mod voice;

pub use callbacks::{CommandHandler, CommandRouter, SetupHandler, VoiceHandler};
pub use engine::{EngineBuilder, IntegrationEngine};
pub use error::EngineError;
pub use hub::{Audience, ConnectionHub};
pub use registry::{EntityChangeSink, EntityRegistry, RegistryError};
pub use session::{ConnectionSession, DeliveryError, Frame};
pub use setup_flow::{SetupError, SetupFlow, SetupPhase};
pub use voice::{
    VoiceEndReason, VoiceError, VoiceMultiplexer, VoiceSession, VoiceStats, VoiceStream,
};
