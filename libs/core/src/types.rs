use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

/// Supported messaging providers (kept small and stable).
///
/// ```
/// use odm_core::Provider;
///
/// let p = Provider::WhatsApp;
/// assert_eq!(p.as_str(), "whatsapp");
/// assert_eq!(p.display_name(), "WhatsApp");
/// ```
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    WhatsApp,
    Messenger,
    Instagram,
    TikTok,
}

impl Provider {
    /// Returns the lowercase string identifier used in payloads and metrics labels.
    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::WhatsApp => "whatsapp",
            Provider::Messenger => "messenger",
            Provider::Instagram => "instagram",
            Provider::TikTok => "tiktok",
        }
    }

    /// Human-readable provider name used in operator-facing error copy.
    pub fn display_name(&self) -> &'static str {
        match self {
            Provider::WhatsApp => "WhatsApp",
            Provider::Messenger => "Messenger",
            Provider::Instagram => "Instagram",
            Provider::TikTok => "TikTok",
        }
    }
}

impl std::fmt::Display for Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle state of a conversation thread.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ConversationStatus {
    Open,
    Pending,
    Closed,
    Snoozed,
    Bot,
    Agent,
}

impl ConversationStatus {
    /// Closed conversations never receive routed inbound messages; everything
    /// else is considered actively usable for routing.
    pub fn is_routable(&self) -> bool {
        !matches!(self, ConversationStatus::Closed)
    }
}

/// The ordered thread between one contact and one channel.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Conversation {
    pub id: Uuid,
    pub contact_id: String,
    /// `None` marks an internal-only conversation with no provider behind it.
    pub channel: Option<Provider>,
    pub channel_id: Option<Uuid>,
    pub status: ConversationStatus,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub last_message_at: Option<OffsetDateTime>,
    #[serde(default)]
    pub unread_count: u32,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

/// Who authored a message.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SenderKind {
    Visitor,
    Agent,
    Automated,
    System,
}

/// Sender identity attached to every message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SenderRef {
    pub id: String,
    pub kind: SenderKind,
}

impl SenderRef {
    pub fn visitor(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: SenderKind::Visitor,
        }
    }

    pub fn agent(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: SenderKind::Agent,
        }
    }

    pub fn automated(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: SenderKind::Automated,
        }
    }
}

/// Content kind carried by a message.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    Text,
    Image,
    Audio,
    Video,
    File,
}

impl MessageType {
    /// Every non-text kind requires a media descriptor with a URL.
    pub fn is_media(&self) -> bool {
        !matches!(self, MessageType::Text)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::Text => "text",
            MessageType::Image => "image",
            MessageType::Audio => "audio",
            MessageType::Video => "video",
            MessageType::File => "file",
        }
    }
}

/// Delivery state of a message. Progression is forward-only:
/// pending → sent → delivered → read, or pending/sent → failed.
///
/// ```
/// use odm_core::MessageStatus;
///
/// assert!(MessageStatus::Read.rank() > MessageStatus::Delivered.rank());
/// assert!(MessageStatus::Delivered.rank() > MessageStatus::Sent.rank());
/// ```
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    Pending,
    Sent,
    Delivered,
    Read,
    Failed,
}

impl MessageStatus {
    /// Ordering used to reject out-of-order provider callbacks.
    pub fn rank(&self) -> u8 {
        match self {
            MessageStatus::Pending => 0,
            MessageStatus::Sent => 1,
            MessageStatus::Delivered => 2,
            MessageStatus::Read => 3,
            // Failed is terminal but orthogonal to the delivery ladder.
            MessageStatus::Failed => 4,
        }
    }
}

/// Reference to an uploaded or externally hosted attachment.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct MediaDescriptor {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
}

/// Free-form message metadata: optimistic correlation plus template refs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct MessageMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template_language: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub template_params: BTreeMap<String, String>,
}

impl MessageMetadata {
    pub fn is_empty(&self) -> bool {
        self.correlation_id.is_none()
            && self.template_name.is_none()
            && self.template_language.is_none()
            && self.template_params.is_empty()
    }
}

/// Canonical message record. Exactly one exists per logical send.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    pub id: Uuid,
    pub conversation_id: Uuid,
    pub sender: SenderRef,
    pub message_type: MessageType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media: Option<MediaDescriptor>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<Provider>,
    /// Provider-assigned id, `None` until the provider acknowledges the send.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_id: Option<String>,
    pub status: MessageStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
    #[serde(default, skip_serializing_if = "MessageMetadata::is_empty")]
    pub metadata: MessageMetadata,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub read_at: Option<OffsetDateTime>,
}

/// Fields supplied when appending a message; the store assigns id and
/// timestamps.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NewMessage {
    pub sender: SenderRef,
    pub message_type: MessageType,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub media: Option<MediaDescriptor>,
    #[serde(default)]
    pub provider: Option<Provider>,
    /// Pre-known provider id (inbound ingestion); used for duplicate detection.
    #[serde(default)]
    pub external_id: Option<String>,
    pub status: MessageStatus,
    #[serde(default)]
    pub metadata: MessageMetadata,
}

impl NewMessage {
    /// Plain outbound text draft in `pending` state.
    pub fn pending_text(sender: SenderRef, content: impl Into<String>) -> Self {
        Self {
            sender,
            message_type: MessageType::Text,
            content: Some(content.into()),
            media: None,
            provider: None,
            external_id: None,
            status: MessageStatus::Pending,
            metadata: MessageMetadata::default(),
        }
    }
}

/// Approval state of a provider-registered template.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TemplateStatus {
    Approved,
    Pending,
    Rejected,
    Paused,
}

/// Header media kinds accepted by provider template registries.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum HeaderFormat {
    #[default]
    Text,
    Image,
    Video,
    Document,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TemplateButton {
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

/// One ordered component of a provider-approved template. Header and body
/// text may contain positional `{{n}}` placeholders.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TemplateComponent {
    Header {
        #[serde(default)]
        format: HeaderFormat,
        #[serde(default)]
        text: Option<String>,
    },
    Body {
        text: String,
    },
    Footer {
        text: String,
    },
    Buttons {
        buttons: Vec<TemplateButton>,
    },
}

/// Provider-preapproved message skeleton, synced from the provider registry.
/// Immutable to this subsystem except status and sync timestamp.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MessageTemplate {
    pub id: Uuid,
    pub channel_id: Uuid,
    pub provider: Provider,
    pub name: String,
    pub language: String,
    pub category: String,
    pub status: TemplateStatus,
    pub components: Vec<TemplateComponent>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub synced_at: Option<OffsetDateTime>,
}

impl MessageTemplate {
    /// Body component text, if the template declares one.
    pub fn body_text(&self) -> Option<&str> {
        self.components.iter().find_map(|component| match component {
            TemplateComponent::Body { text } => Some(text.as_str()),
            _ => None,
        })
    }

    /// Header component text, for text-format headers only.
    pub fn header_text(&self) -> Option<&str> {
        self.components.iter().find_map(|component| match component {
            TemplateComponent::Header {
                format: HeaderFormat::Text,
                text: Some(text),
            } => Some(text.as_str()),
            _ => None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_serializes_lowercase() {
        let json = serde_json::to_string(&Provider::TikTok).unwrap();
        assert_eq!(json, "\"tiktok\"");
        let back: Provider = serde_json::from_str("\"whatsapp\"").unwrap();
        assert_eq!(back, Provider::WhatsApp);
    }

    #[test]
    fn status_ladder_is_ordered() {
        assert!(MessageStatus::Sent.rank() > MessageStatus::Pending.rank());
        assert!(MessageStatus::Read.rank() > MessageStatus::Delivered.rank());
    }

    #[test]
    fn template_component_tagging() {
        let body: TemplateComponent =
            serde_json::from_str(r#"{"type":"body","text":"Hola {{1}}"}"#).unwrap();
        match body {
            TemplateComponent::Body { text } => assert_eq!(text, "Hola {{1}}"),
            other => panic!("unexpected component: {other:?}"),
        }
    }

    #[test]
    fn closed_conversations_are_not_routable() {
        assert!(!ConversationStatus::Closed.is_routable());
        assert!(ConversationStatus::Snoozed.is_routable());
    }
}
