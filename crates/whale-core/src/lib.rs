//! # whale-core
//!
//! Shared foundations for the Whale audio encoder workspace:
//!
//! - Unified error handling via [`WhaleError`] / [`WhaleResult`]
//! - Env-driven debug output switch ([`debug::enabled`])

pub mod debug;
pub mod error;

pub use error::{WhaleError, WhaleResult};
