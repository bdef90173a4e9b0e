//! Request payloads and the typed request lifecycle.

pub mod payload;
pub mod transitions;
pub mod types;

pub use payload::{ChatMessage, GenerationRequest, SamplingParams};
pub use types::*;
