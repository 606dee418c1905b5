use thiserror::Error;

use crate::types::Provider;

/// Failure taxonomy for a single send attempt.
///
/// Adapters never swallow errors: every variant reaches the coordinator,
/// which resolves the pending record to `failed` with the reason preserved.
#[derive(Debug, Error)]
pub enum SendError {
    /// Bad input, surfaced before any network call.
    #[error("{0}")]
    Validation(String),
    /// No channel of the required provider type exists.
    #[error("No active {} channel found", .0.display_name())]
    NotConfigured(Provider),
    /// A channel exists but is not in the active state.
    #[error("{} channel is not active", .0.display_name())]
    ChannelInactive(Provider),
    /// The external API refused the message; the reason is kept verbatim for
    /// operator diagnosis.
    #[error("{} rejected the message: {reason}", provider.display_name())]
    ProviderRejected { provider: Provider, reason: String },
    /// Network or timeout failure; treated like a provider rejection.
    #[error("provider transport error: {0}")]
    Transport(#[source] reqwest::Error),
}

impl SendError {
    /// The failure reason persisted on the canonical message record.
    pub fn failure_reason(&self) -> String {
        self.to_string()
    }
}

/// Errors surfaced by the message/channel/template stores.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("store error")]
    Internal(#[source] anyhow::Error),
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_configured_copy_matches_operator_expectations() {
        let err = SendError::NotConfigured(Provider::WhatsApp);
        assert_eq!(err.to_string(), "No active WhatsApp channel found");
    }

    #[test]
    fn provider_rejection_keeps_reason_verbatim() {
        let err = SendError::ProviderRejected {
            provider: Provider::TikTok,
            reason: "(#131030) Recipient phone number not in allowed list".into(),
        };
        assert!(err
            .failure_reason()
            .contains("Recipient phone number not in allowed list"));
    }
}
