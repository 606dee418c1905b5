//! Provider adapters.
//!
//! Each adapter validates and normalizes a send request, performs exactly one
//! outbound API call, and returns the provider-assigned message id or a typed
//! failure. Adapters mutate no local state, so the dispatch coordinator can
//! retry them safely. Provider payloads are mutually incompatible wire
//! shapes; normalizing them is the adapter's job, never the caller's.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use metrics::counter;
use serde_json::Value;

use odm_core::{Channel, MediaDescriptor, MessageTemplate, MessageType, Provider, SendError};

pub mod instagram;
pub mod messenger;
pub mod tiktok;
pub mod whatsapp;

pub use instagram::InstagramAdapter;
pub use messenger::MessengerAdapter;
pub use tiktok::TikTokAdapter;
pub use whatsapp::WhatsAppAdapter;

/// Resolved template payload handed to an adapter: the registry record plus
/// the caller's positional parameters.
#[derive(Debug, Clone)]
pub struct TemplateSend {
    pub template: MessageTemplate,
    pub params: BTreeMap<String, String>,
}

/// Normalized request an adapter turns into one provider call.
#[derive(Debug, Clone)]
pub struct SendRequest {
    pub to: String,
    pub message_type: MessageType,
    pub content: Option<String>,
    pub media: Option<MediaDescriptor>,
    pub template: Option<TemplateSend>,
    pub channel: Channel,
}

/// Successful provider acknowledgement.
#[derive(Debug, Clone)]
pub struct SendOutcome {
    pub external_message_id: String,
    pub raw: Value,
}

#[async_trait]
pub trait SendAdapter: Send + Sync {
    fn provider(&self) -> Provider;

    async fn send(&self, request: &SendRequest) -> Result<SendOutcome, SendError>;
}

/// Shared preconditions checked before any payload is built or any network
/// call is made.
pub fn validate_request(request: &SendRequest) -> Result<(), SendError> {
    if request.to.trim().is_empty() {
        return Err(SendError::Validation("destination is required".into()));
    }
    if request.template.is_some() {
        return Ok(());
    }
    if request.message_type.is_media() {
        match &request.media {
            Some(media) if !media.url.trim().is_empty() => {}
            _ => {
                return Err(SendError::Validation(format!(
                    "a media URL is required for {} messages",
                    request.message_type.as_str()
                )));
            }
        }
        return Ok(());
    }
    match &request.content {
        Some(text) if !text.trim().is_empty() => Ok(()),
        _ => Err(SendError::Validation(
            "message text is required for text messages".into(),
        )),
    }
}

/// POSTs a JSON payload with bearer auth and maps the response the way every
/// Graph-style provider expects: non-2xx bodies become `ProviderRejected`
/// with the reason preserved verbatim (truncated to 512 bytes), transport
/// failures become `Transport`.
pub(crate) async fn post_json(
    client: &reqwest::Client,
    provider: Provider,
    url: &str,
    bearer: &str,
    payload: &Value,
) -> Result<Value, SendError> {
    let response = client
        .post(url)
        .bearer_auth(bearer)
        .json(payload)
        .send()
        .await
        .map_err(|err| {
            counter!("provider_send_total", "provider" => provider.as_str(), "result" => "transport_error")
                .increment(1);
            SendError::Transport(err)
        })?;

    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_else(|_| "<unreadable>".into());
        counter!("provider_send_total", "provider" => provider.as_str(), "result" => "rejected")
            .increment(1);
        return Err(SendError::ProviderRejected {
            provider,
            reason: if body.len() > 512 {
                body[..512].to_string()
            } else {
                body
            },
        });
    }

    let body = response.json::<Value>().await.map_err(|err| {
        counter!("provider_send_total", "provider" => provider.as_str(), "result" => "decode_error")
            .increment(1);
        SendError::ProviderRejected {
            provider,
            reason: format!("undecodable response body: {err}"),
        }
    })?;
    counter!("provider_send_total", "provider" => provider.as_str(), "result" => "ok").increment(1);
    Ok(body)
}

/// Maps each provider to its adapter. The coordinator resolves the adapter
/// for a conversation's channel type here.
#[derive(Clone, Default)]
pub struct AdapterRegistry {
    adapters: HashMap<Provider, Arc<dyn SendAdapter>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with all four built-in adapters sharing one HTTP client.
    pub fn with_defaults(client: reqwest::Client) -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(WhatsAppAdapter::new(client.clone())));
        registry.register(Arc::new(MessengerAdapter::new(client.clone())));
        registry.register(Arc::new(InstagramAdapter::new(client.clone())));
        registry.register(Arc::new(TikTokAdapter::new(client)));
        registry
    }

    pub fn register(&mut self, adapter: Arc<dyn SendAdapter>) {
        self.adapters.insert(adapter.provider(), adapter);
    }

    pub fn get(&self, provider: Provider) -> Option<Arc<dyn SendAdapter>> {
        self.adapters.get(&provider).cloned()
    }
}
