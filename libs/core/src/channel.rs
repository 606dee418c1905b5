use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::Provider;

/// Operational state of a configured channel.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ChannelStatus {
    Active,
    Inactive,
    Pending,
}

/// Provider-specific configuration, discriminated by provider. Exactly one
/// config shape exists per provider type; the discriminant keeps the payload
/// from ever degrading into an untyped blob.
///
/// ```
/// use odm_core::{ChannelConfig, Provider};
///
/// let config: ChannelConfig = serde_json::from_str(
///     r#"{"provider":"whatsapp","phone_number_id":"123","access_token":"t"}"#,
/// ).unwrap();
/// assert_eq!(config.provider(), Provider::WhatsApp);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "provider", rename_all = "lowercase")]
pub enum ChannelConfig {
    WhatsApp {
        phone_number_id: String,
        access_token: String,
        #[serde(default = "default_graph_base")]
        api_base: String,
    },
    Messenger {
        page_id: String,
        page_access_token: String,
        #[serde(default = "default_graph_base")]
        api_base: String,
    },
    Instagram {
        account_id: String,
        access_token: String,
        #[serde(default = "default_graph_base")]
        api_base: String,
    },
    TikTok {
        business_id: String,
        access_token: String,
        #[serde(default = "default_tiktok_base")]
        api_base: String,
    },
}

fn default_graph_base() -> String {
    "https://graph.facebook.com".into()
}

fn default_tiktok_base() -> String {
    "https://business-api.tiktok.com".into()
}

impl ChannelConfig {
    pub fn provider(&self) -> Provider {
        match self {
            ChannelConfig::WhatsApp { .. } => Provider::WhatsApp,
            ChannelConfig::Messenger { .. } => Provider::Messenger,
            ChannelConfig::Instagram { .. } => Provider::Instagram,
            ChannelConfig::TikTok { .. } => Provider::TikTok,
        }
    }

    pub fn api_base(&self) -> &str {
        match self {
            ChannelConfig::WhatsApp { api_base, .. }
            | ChannelConfig::Messenger { api_base, .. }
            | ChannelConfig::Instagram { api_base, .. }
            | ChannelConfig::TikTok { api_base, .. } => api_base,
        }
    }

    pub fn access_token(&self) -> &str {
        match self {
            ChannelConfig::WhatsApp { access_token, .. }
            | ChannelConfig::Instagram { access_token, .. }
            | ChannelConfig::TikTok { access_token, .. } => access_token,
            ChannelConfig::Messenger {
                page_access_token, ..
            } => page_access_token,
        }
    }
}

/// A configured connection to one external messaging provider account.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Channel {
    pub id: Uuid,
    pub name: String,
    pub status: ChannelStatus,
    pub config: ChannelConfig,
}

impl Channel {
    pub fn provider(&self) -> Provider {
        self.config.provider()
    }

    pub fn is_active(&self) -> bool {
        self.status == ChannelStatus::Active
    }
}
