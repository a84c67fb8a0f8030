//! Format conversion between the public APIs and the upstream protocol.
//!
//! Requests from OpenAI and Anthropic clients are turned into one canonical
//! `generateContent` request; upstream replies and stream chunks are turned
//! back into each caller's format. All translation functions are pure (no I/O).

pub mod anthropic_types;
pub mod openai_types;
pub mod request;
pub mod response;
pub mod schema;
pub mod streaming;
pub mod thinking;

pub use request::{anthropic_to_internal, openai_to_internal, InternalRequest, ToolNames};
pub use response::ResponseAccumulator;
pub use streaming::{AnthropicStreamTranslator, OpenAiStreamTranslator};
