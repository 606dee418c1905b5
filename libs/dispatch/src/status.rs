//! Delivery-status reconciliation.
//!
//! Provider webhooks (a collaborator boundary) report acknowledgement
//! transitions keyed by (provider, external id). The mapping back to the
//! canonical message happens here; the store enforces the forward-only
//! status ladder, so late or duplicate callbacks degrade to no-ops.

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use odm_core::{Message, MessageStatus, MessageStore, Provider, SharedMessageStore, StoreError};

/// Status value carried by a provider callback.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CallbackStatus {
    Sent,
    Delivered,
    Read,
    Failed,
}

/// Webhook payload shape exposed to provider-status collaborators.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusUpdate {
    pub provider: Provider,
    pub external_id: String,
    pub status: CallbackStatus,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub read_at: Option<OffsetDateTime>,
    #[serde(default)]
    pub reason: Option<String>,
}

/// Applies one provider callback to its canonical message. Unknown external
/// ids surface `NotFound` to the webhook caller.
pub async fn apply_status_update(
    store: &SharedMessageStore,
    update: StatusUpdate,
) -> Result<Message, StoreError> {
    let message = store
        .find_by_external_id(update.provider, &update.external_id)
        .await?
        .ok_or_else(|| {
            StoreError::NotFound(format!(
                "no message with external id {} for {}",
                update.external_id, update.provider
            ))
        })?;

    match update.status {
        CallbackStatus::Failed => {
            let reason = update
                .reason
                .unwrap_or_else(|| "provider reported delivery failure".into());
            store.mark_failed(message.id, &reason).await
        }
        CallbackStatus::Sent => store.update_status(message.id, MessageStatus::Sent).await,
        CallbackStatus::Delivered => {
            store
                .update_status(message.id, MessageStatus::Delivered)
                .await
        }
        CallbackStatus::Read => store.update_status(message.id, MessageStatus::Read).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use odm_core::{
        InMemoryMessageStore, MessageStore, NewMessage, SenderRef, SharedMessageStore,
    };

    async fn seeded() -> (SharedMessageStore, uuid::Uuid) {
        let store: SharedMessageStore = InMemoryMessageStore::shared();
        let conversation = store
            .find_or_create_conversation("51987654321", Some(Provider::WhatsApp), None)
            .await
            .unwrap();
        let message = store
            .create_message(
                conversation.id,
                NewMessage::pending_text(SenderRef::agent("agent-1"), "Hola"),
            )
            .await
            .unwrap();
        store
            .set_external_id(message.id, "wamid.X", Provider::WhatsApp)
            .await
            .unwrap();
        store
            .update_status(message.id, MessageStatus::Sent)
            .await
            .unwrap();
        (store, message.id)
    }

    fn update(status: CallbackStatus) -> StatusUpdate {
        StatusUpdate {
            provider: Provider::WhatsApp,
            external_id: "wamid.X".into(),
            status,
            read_at: None,
            reason: None,
        }
    }

    #[tokio::test]
    async fn delivered_then_read_progresses() {
        let (store, id) = seeded().await;
        let delivered = apply_status_update(&store, update(CallbackStatus::Delivered))
            .await
            .unwrap();
        assert_eq!(delivered.status, MessageStatus::Delivered);

        let read = apply_status_update(&store, update(CallbackStatus::Read))
            .await
            .unwrap();
        assert_eq!(read.status, MessageStatus::Read);
        assert!(read.read_at.is_some());
        assert_eq!(read.id, id);
    }

    #[tokio::test]
    async fn late_delivered_callback_never_downgrades_read() {
        let (store, _) = seeded().await;
        apply_status_update(&store, update(CallbackStatus::Read))
            .await
            .unwrap();
        let after = apply_status_update(&store, update(CallbackStatus::Delivered))
            .await
            .unwrap();
        assert_eq!(after.status, MessageStatus::Read);
    }

    #[tokio::test]
    async fn unknown_external_id_is_not_found() {
        let (store, _) = seeded().await;
        let mut bogus = update(CallbackStatus::Delivered);
        bogus.external_id = "wamid.unknown".into();
        let err = apply_status_update(&store, bogus).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn failure_callback_records_reason() {
        let (store, id) = seeded().await;
        let mut failed = update(CallbackStatus::Failed);
        failed.reason = Some("expired message window".into());
        let message = apply_status_update(&store, failed).await.unwrap();
        assert_eq!(message.status, MessageStatus::Failed);
        assert_eq!(message.failure_reason.as_deref(), Some("expired message window"));
        assert_eq!(message.id, id);
    }
}
