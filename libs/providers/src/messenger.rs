//! Messenger adapter. Sends through the Graph `me/messages` surface using a
//! page access token.

use async_trait::async_trait;
use serde_json::{Value, json};

use odm_core::{ChannelConfig, MessageType, Provider, SendError};

use crate::{SendAdapter, SendOutcome, SendRequest, post_json, validate_request};

const GRAPH_VERSION: &str = "v19.0";

pub struct MessengerAdapter {
    client: reqwest::Client,
}

impl MessengerAdapter {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }

    fn credentials(request: &SendRequest) -> Result<(String, String), SendError> {
        match &request.channel.config {
            ChannelConfig::Messenger {
                page_access_token,
                api_base,
                ..
            } => Ok((api_base.clone(), page_access_token.clone())),
            _ => Err(SendError::Validation(
                "channel config is not a Messenger config".into(),
            )),
        }
    }

    pub fn build_payload(request: &SendRequest) -> Result<Value, SendError> {
        let message = match request.message_type {
            MessageType::Text => json!({ "text": request.content.clone().unwrap_or_default() }),
            media_type => {
                let media = request.media.as_ref().ok_or_else(|| {
                    SendError::Validation("media descriptor is required".into())
                })?;
                let kind = match media_type {
                    MessageType::Image => "image",
                    MessageType::Audio => "audio",
                    MessageType::Video => "video",
                    MessageType::File => "file",
                    MessageType::Text => unreachable!("text handled above"),
                };
                json!({
                    "attachment": {
                        "type": kind,
                        "payload": { "url": media.url, "is_reusable": false }
                    }
                })
            }
        };
        Ok(json!({
            "recipient": { "id": request.to },
            "messaging_type": "RESPONSE",
            "message": message,
        }))
    }

    fn extract_message_id(body: &Value) -> Result<String, SendError> {
        body.get("message_id")
            .and_then(|id| id.as_str())
            .map(str::to_owned)
            .ok_or_else(|| SendError::ProviderRejected {
                provider: Provider::Messenger,
                reason: "response carried no message id".into(),
            })
    }
}

#[async_trait]
impl SendAdapter for MessengerAdapter {
    fn provider(&self) -> Provider {
        Provider::Messenger
    }

    async fn send(&self, request: &SendRequest) -> Result<SendOutcome, SendError> {
        validate_request(request)?;
        let (api_base, token) = Self::credentials(request)?;
        let payload = Self::build_payload(request)?;
        let url = format!(
            "{}/{GRAPH_VERSION}/me/messages",
            api_base.trim_end_matches('/')
        );
        tracing::debug!(recipient = %request.to, "sending messenger message");

        let body = post_json(&self.client, Provider::Messenger, &url, &token, &payload).await?;
        let external_message_id = Self::extract_message_id(&body)?;
        Ok(SendOutcome {
            external_message_id,
            raw: body,
        })
    }
}
