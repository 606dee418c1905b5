//! Omnidesk messaging core contracts and value types.
//!
//! This crate exposes the canonical conversation/message model shared by the
//! dispatch coordinator, the provider adapters, and the widget gateway. It
//! also provides the store traits with in-memory implementations and the
//! error taxonomy used across the workspace.
pub mod channel;
pub mod error;
pub mod store;
pub mod types;

pub use channel::*;
pub use error::*;
pub use store::*;
pub use types::*;

/// Returns the semantic version advertised by this crate.
///
/// ```
/// assert_eq!(odm_core::version(), "0.1.0");
/// ```
pub fn version() -> &'static str {
    "0.1.0"
}
