//! cairn-api: conversation types and the provider streaming contract
//!
//! This crate defines what flows between an LLM provider client and the cairn
//! execution core: conversation entries, stream chunks, usage accounting and
//! the `ApiHandler` trait providers implement.

pub mod error;
pub mod stream;
pub mod types;

pub use error::{Error, Result};
pub use stream::{ApiHandler, ApiStream, ApiStreamChunk, ToolCallDelta};
pub use types::*;
