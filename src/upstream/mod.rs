//! The Cloud Code side of the gateway: wire types, HTTP client, SSE decoding
//! and rate-limit parsing.

pub mod client;
pub mod rate_limit;
pub mod sse;
pub mod types;

pub use client::UpstreamClient;
pub use rate_limit::parse_retry_delay;
