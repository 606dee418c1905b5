//! TikTok adapter. The Business Messaging API wraps results in a
//! `{code, message, data}` envelope; a non-zero code is a rejection even on
//! an HTTP 200.

use async_trait::async_trait;
use serde_json::{Value, json};

use odm_core::{ChannelConfig, MessageType, Provider, SendError};

use crate::{SendAdapter, SendOutcome, SendRequest, post_json, validate_request};

pub struct TikTokAdapter {
    client: reqwest::Client,
}

impl TikTokAdapter {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }

    fn credentials(request: &SendRequest) -> Result<(String, String, String), SendError> {
        match &request.channel.config {
            ChannelConfig::TikTok {
                business_id,
                access_token,
                api_base,
            } => Ok((api_base.clone(), business_id.clone(), access_token.clone())),
            _ => Err(SendError::Validation(
                "channel config is not a TikTok config".into(),
            )),
        }
    }

    pub fn build_payload(request: &SendRequest, business_id: &str) -> Result<Value, SendError> {
        match request.message_type {
            MessageType::Text => Ok(json!({
                "business_id": business_id,
                "recipient_id": request.to,
                "message_type": "text",
                "content": { "text": request.content.clone().unwrap_or_default() },
            })),
            media_type => {
                let media = request.media.as_ref().ok_or_else(|| {
                    SendError::Validation("media descriptor is required".into())
                })?;
                // Business messaging only carries image and video media.
                let kind = match media_type {
                    MessageType::Image => "image",
                    MessageType::Video => "video",
                    other => {
                        return Err(SendError::Validation(format!(
                            "tiktok does not support {} attachments",
                            other.as_str()
                        )));
                    }
                };
                Ok(json!({
                    "business_id": business_id,
                    "recipient_id": request.to,
                    "message_type": kind,
                    "content": { "media_url": media.url },
                }))
            }
        }
    }

    fn extract_message_id(body: &Value) -> Result<String, SendError> {
        let code = body.get("code").and_then(|code| code.as_i64()).unwrap_or(0);
        if code != 0 {
            let reason = body
                .get("message")
                .and_then(|message| message.as_str())
                .unwrap_or("unknown provider error")
                .to_string();
            return Err(SendError::ProviderRejected {
                provider: Provider::TikTok,
                reason,
            });
        }
        body.get("data")
            .and_then(|data| data.get("message_id"))
            .and_then(|id| id.as_str())
            .map(str::to_owned)
            .ok_or_else(|| SendError::ProviderRejected {
                provider: Provider::TikTok,
                reason: "response carried no message id".into(),
            })
    }
}

#[async_trait]
impl SendAdapter for TikTokAdapter {
    fn provider(&self) -> Provider {
        Provider::TikTok
    }

    async fn send(&self, request: &SendRequest) -> Result<SendOutcome, SendError> {
        validate_request(request)?;
        let (api_base, business_id, token) = Self::credentials(request)?;
        let payload = Self::build_payload(request, &business_id)?;
        let url = format!(
            "{}/business/message/send",
            api_base.trim_end_matches('/')
        );
        tracing::debug!(recipient = %request.to, "sending tiktok message");

        let body = post_json(&self.client, Provider::TikTok, &url, &token, &payload).await?;
        let external_message_id = Self::extract_message_id(&body)?;
        Ok(SendOutcome {
            external_message_id,
            raw: body,
        })
    }
}
