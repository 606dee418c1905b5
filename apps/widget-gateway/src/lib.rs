//! Widget gateway.
//!
//! Serves the widget public HTTP surface: welcome config, transcript reads,
//! sends (with lazy conversation creation), a lightweight existence probe for
//! resumption, and the per-conversation SSE push stream.

pub mod config;
pub mod routes;
pub mod stream;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use odm_core::Message;
use odm_dispatch::Dispatcher;

pub use config::GatewayConfig;
pub use routes::router;

/// Per-widget settings resolved by public token.
#[derive(Debug, Clone)]
pub struct WidgetEntry {
    pub token: String,
    pub inbox_name: String,
    pub welcome_title: String,
    pub welcome_tagline: String,
}

/// Token → widget lookup. Tokens are opaque public identifiers; an unknown
/// token is a 404, a missing one a 400.
#[derive(Debug, Clone, Default)]
pub struct WidgetRegistry {
    by_token: HashMap<String, WidgetEntry>,
}

impl WidgetRegistry {
    pub fn new(entries: impl IntoIterator<Item = WidgetEntry>) -> Self {
        Self {
            by_token: entries
                .into_iter()
                .map(|entry| (entry.token.clone(), entry))
                .collect(),
        }
    }

    pub fn get(&self, token: &str) -> Option<&WidgetEntry> {
        self.by_token.get(token)
    }
}

/// Optional automated first-line reply, echoed as `ai_response` on the send
/// response and appended to the transcript as an `automated` message.
#[async_trait]
pub trait AutoResponder: Send + Sync {
    async fn reply(&self, inbound: &Message, is_first_contact: bool) -> Option<String>;
}

/// Greets the visitor once, on the first message of a conversation.
pub struct GreetingResponder {
    pub greeting: String,
}

#[async_trait]
impl AutoResponder for GreetingResponder {
    async fn reply(&self, _inbound: &Message, is_first_contact: bool) -> Option<String> {
        is_first_contact.then(|| self.greeting.clone())
    }
}

/// Shared state behind every widget route.
pub struct GatewayState {
    pub widgets: WidgetRegistry,
    pub dispatcher: Dispatcher,
    pub auto_responder: Option<Arc<dyn AutoResponder>>,
}

pub type SharedGatewayState = Arc<GatewayState>;
