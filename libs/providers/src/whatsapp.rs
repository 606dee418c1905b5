//! WhatsApp adapter. Sends free text and media within the session window and
//! provider-approved templates (name + language + positional components)
//! outside it.

use async_trait::async_trait;
use serde_json::{Value, json};

use odm_core::{ChannelConfig, MessageType, Provider, SendError};

use crate::{SendAdapter, SendOutcome, SendRequest, post_json, validate_request};

/// Graph API caption limit for media messages.
pub const CAPTION_LIMIT: usize = 1024;

const GRAPH_VERSION: &str = "v19.0";

/// Strips every non-digit from a destination. Idempotent:
/// `normalize(normalize(d)) == normalize(d)`.
///
/// ```
/// use odm_providers::whatsapp::normalize_destination;
///
/// assert_eq!(normalize_destination("+51 987-654-321"), "51987654321");
/// assert_eq!(
///     normalize_destination(&normalize_destination("+51 987-654-321")),
///     "51987654321"
/// );
/// ```
pub fn normalize_destination(to: &str) -> String {
    to.chars().filter(|c| c.is_ascii_digit()).collect()
}

/// A normalized destination is deliverable iff its digit length is in [8, 15].
pub fn is_valid_destination(normalized: &str) -> bool {
    (8..=15).contains(&normalized.len()) && normalized.chars().all(|c| c.is_ascii_digit())
}

fn truncate_caption(caption: &str) -> String {
    caption.chars().take(CAPTION_LIMIT).collect()
}

pub struct WhatsAppAdapter {
    client: reqwest::Client,
}

impl WhatsAppAdapter {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }

    fn credentials(request: &SendRequest) -> Result<(String, String, String), SendError> {
        match &request.channel.config {
            ChannelConfig::WhatsApp {
                phone_number_id,
                access_token,
                api_base,
            } => Ok((
                api_base.clone(),
                phone_number_id.clone(),
                access_token.clone(),
            )),
            _ => Err(SendError::Validation(
                "channel config is not a WhatsApp config".into(),
            )),
        }
    }

    fn endpoint(api_base: &str, phone_number_id: &str) -> String {
        format!(
            "{}/{GRAPH_VERSION}/{}/messages",
            api_base.trim_end_matches('/'),
            phone_number_id
        )
    }

    /// Builds the Graph payload for a validated request. Template sends take
    /// the template path; otherwise the message type selects the wire shape.
    pub fn build_payload(request: &SendRequest, to: &str) -> Result<Value, SendError> {
        if let Some(template_send) = &request.template {
            let components =
                odm_templates::build_components(&template_send.template, &template_send.params);
            return Ok(json!({
                "messaging_product": "whatsapp",
                "to": to,
                "type": "template",
                "template": {
                    "name": template_send.template.name,
                    "language": { "code": template_send.template.language },
                    "components": components,
                }
            }));
        }

        match request.message_type {
            MessageType::Text => {
                let body = request.content.clone().unwrap_or_default();
                Ok(json!({
                    "messaging_product": "whatsapp",
                    "to": to,
                    "type": "text",
                    "text": { "preview_url": false, "body": body }
                }))
            }
            media_type => {
                let media = request.media.as_ref().ok_or_else(|| {
                    SendError::Validation("media descriptor is required".into())
                })?;
                let kind = match media_type {
                    MessageType::Image => "image",
                    MessageType::Audio => "audio",
                    MessageType::Video => "video",
                    MessageType::File => "document",
                    MessageType::Text => unreachable!("text handled above"),
                };
                let mut attachment = json!({ "link": media.url });
                // Audio messages carry no caption on the Graph API.
                if media_type != MessageType::Audio {
                    if let Some(caption) = &request.content {
                        attachment["caption"] = json!(truncate_caption(caption));
                    }
                }
                let mut payload = json!({
                    "messaging_product": "whatsapp",
                    "to": to,
                    "type": kind,
                });
                payload[kind] = attachment;
                Ok(payload)
            }
        }
    }

    fn extract_message_id(body: &Value) -> Result<String, SendError> {
        body.get("messages")
            .and_then(|messages| messages.get(0))
            .and_then(|message| message.get("id"))
            .and_then(|id| id.as_str())
            .map(str::to_owned)
            .ok_or_else(|| SendError::ProviderRejected {
                provider: Provider::WhatsApp,
                reason: "response carried no message id".into(),
            })
    }
}

#[async_trait]
impl SendAdapter for WhatsAppAdapter {
    fn provider(&self) -> Provider {
        Provider::WhatsApp
    }

    async fn send(&self, request: &SendRequest) -> Result<SendOutcome, SendError> {
        validate_request(request)?;
        let to = normalize_destination(&request.to);
        if !is_valid_destination(&to) {
            return Err(SendError::Validation(format!(
                "destination must contain 8 to 15 digits, got {} after normalization",
                to.len()
            )));
        }

        let (api_base, phone_number_id, access_token) = Self::credentials(request)?;
        let payload = Self::build_payload(request, &to)?;
        let url = Self::endpoint(&api_base, &phone_number_id);
        tracing::debug!(to = %to, kind = ?request.message_type, "sending whatsapp message");

        let body = post_json(&self.client, Provider::WhatsApp, &url, &access_token, &payload)
            .await?;
        let external_message_id = Self::extract_message_id(&body)?;
        Ok(SendOutcome {
            external_message_id,
            raw: body,
        })
    }
}
