//! Embeddable realtime widget client.
//!
//! Resumes or lazily creates a visitor conversation, keeps one subscription
//! to the gateway push stream with fixed-delay reconnection, and reconciles
//! optimistic sends against server-confirmed records through
//! [`odm_reconcile`].

pub mod api;
pub mod client;
pub mod sse;
pub mod storage;

pub use api::{ClientError, HttpWidgetApi, SendResponse, WidgetApi, WidgetConfig};
pub use client::{ClientNotice, ClientTuning, WidgetHandle, WidgetState};
pub use sse::{SseParser, StreamEvent};
pub use storage::{FileStorage, MemoryStorage, WidgetStorage};
