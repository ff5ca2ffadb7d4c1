//! Core domain types shared by every stage of the pipeline.

pub mod event;
pub mod ids;

pub use event::{ConversionError, NormalizedEvent, ROUTING_KEYS, SPEC_VERSION};
pub use ids::{CursorToken, MessageId, RepoId};
