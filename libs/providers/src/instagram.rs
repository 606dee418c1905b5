//! Instagram adapter. Messaging for professional accounts goes through the
//! Graph `{account_id}/messages` surface; the payload mirrors Messenger's
//! recipient/message shape but is addressed per account.

use async_trait::async_trait;
use serde_json::{Value, json};

use odm_core::{ChannelConfig, MessageType, Provider, SendError};

use crate::{SendAdapter, SendOutcome, SendRequest, post_json, validate_request};

const GRAPH_VERSION: &str = "v19.0";

pub struct InstagramAdapter {
    client: reqwest::Client,
}

impl InstagramAdapter {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }

    fn credentials(request: &SendRequest) -> Result<(String, String, String), SendError> {
        match &request.channel.config {
            ChannelConfig::Instagram {
                account_id,
                access_token,
                api_base,
            } => Ok((api_base.clone(), account_id.clone(), access_token.clone())),
            _ => Err(SendError::Validation(
                "channel config is not an Instagram config".into(),
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
                // Instagram messaging only accepts image and video attachments.
                let kind = match media_type {
                    MessageType::Image => "image",
                    MessageType::Video => "video",
                    other => {
                        return Err(SendError::Validation(format!(
                            "instagram does not support {} attachments",
                            other.as_str()
                        )));
                    }
                };
                json!({
                    "attachment": {
                        "type": kind,
                        "payload": { "url": media.url }
                    }
                })
            }
        };
        Ok(json!({
            "recipient": { "id": request.to },
            "message": message,
        }))
    }

    fn extract_message_id(body: &Value) -> Result<String, SendError> {
        body.get("message_id")
            .and_then(|id| id.as_str())
            .map(str::to_owned)
            .ok_or_else(|| SendError::ProviderRejected {
                provider: Provider::Instagram,
                reason: "response carried no message id".into(),
            })
    }
}

#[async_trait]
impl SendAdapter for InstagramAdapter {
    fn provider(&self) -> Provider {
        Provider::Instagram
    }

    async fn send(&self, request: &SendRequest) -> Result<SendOutcome, SendError> {
        validate_request(request)?;
        let (api_base, account_id, token) = Self::credentials(request)?;
        let payload = Self::build_payload(request)?;
        let url = format!(
            "{}/{GRAPH_VERSION}/{}/messages",
            api_base.trim_end_matches('/'),
            account_id
        );
        tracing::debug!(recipient = %request.to, "sending instagram message");

        let body = post_json(&self.client, Provider::Instagram, &url, &token, &payload).await?;
        let external_message_id = Self::extract_message_id(&body)?;
        Ok(SendOutcome {
            external_message_id,
            raw: body,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{channel, text_request};
    use odm_core::{Channel, MediaDescriptor};

    fn instagram_channel() -> Channel {
        channel(ChannelConfig::Instagram {
            account_id: "1789".into(),
            access_token: "ig-token".into(),
            api_base: "https://graph.facebook.com".into(),
        })
    }

    #[test]
    fn text_payload_shape() {
        let request = text_request(instagram_channel(), "igsid-4", Some("Hola"));
        let payload = InstagramAdapter::build_payload(&request).unwrap();
        assert_eq!(payload["recipient"]["id"], "igsid-4");
        assert_eq!(payload["message"]["text"], "Hola");
    }

    #[test]
    fn unsupported_attachment_kinds_fail_validation() {
        let mut request = text_request(instagram_channel(), "igsid-4", None);
        request.message_type = MessageType::File;
        request.media = Some(MediaDescriptor {
            url: "https://cdn.example.com/doc.pdf".into(),
            mime_type: None,
            file_name: None,
        });
        let err = InstagramAdapter::build_payload(&request).unwrap_err();
        assert!(matches!(err, SendError::Validation(_)));
    }
}
