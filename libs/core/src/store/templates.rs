use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use time::OffsetDateTime;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::{StoreError, StoreResult};
use crate::types::{MessageTemplate, TemplateStatus};

/// Read-mostly template registry, synced externally from the provider.
/// Only status and sync timestamp are mutable from this subsystem.
#[async_trait]
pub trait TemplateStore: Send + Sync {
    async fn upsert(&self, template: MessageTemplate) -> StoreResult<()>;

    /// Looks up an approved template by channel, name, and language. Only
    /// approved templates may originate contact outside the free-messaging
    /// window.
    async fn approved(
        &self,
        channel_id: Uuid,
        name: &str,
        language: &str,
    ) -> StoreResult<Option<MessageTemplate>>;

    async fn set_status(
        &self,
        id: Uuid,
        status: TemplateStatus,
        synced_at: OffsetDateTime,
    ) -> StoreResult<()>;
}

pub type SharedTemplateStore = Arc<dyn TemplateStore>;

#[derive(Clone, Default)]
pub struct InMemoryTemplateStore {
    inner: Arc<RwLock<HashMap<Uuid, MessageTemplate>>>,
}

impl InMemoryTemplateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> SharedTemplateStore {
        Arc::new(Self::new())
    }
}

#[async_trait]
impl TemplateStore for InMemoryTemplateStore {
    async fn upsert(&self, template: MessageTemplate) -> StoreResult<()> {
        self.inner.write().await.insert(template.id, template);
        Ok(())
    }

    async fn approved(
        &self,
        channel_id: Uuid,
        name: &str,
        language: &str,
    ) -> StoreResult<Option<MessageTemplate>> {
        let guard = self.inner.read().await;
        Ok(guard
            .values()
            .find(|template| {
                template.channel_id == channel_id
                    && template.status == TemplateStatus::Approved
                    && template.name == name
                    && template.language == language
            })
            .cloned())
    }

    async fn set_status(
        &self,
        id: Uuid,
        status: TemplateStatus,
        synced_at: OffsetDateTime,
    ) -> StoreResult<()> {
        let mut guard = self.inner.write().await;
        let template = guard
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(format!("template {id}")))?;
        template.status = status;
        template.synced_at = Some(synced_at);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Provider, TemplateComponent};

    fn order_update(channel_id: Uuid, status: TemplateStatus) -> MessageTemplate {
        MessageTemplate {
            id: Uuid::new_v4(),
            channel_id,
            provider: Provider::WhatsApp,
            name: "order_update".into(),
            language: "es".into(),
            category: "utility".into(),
            status,
            components: vec![TemplateComponent::Body {
                text: "Pedido {{1}} enviado".into(),
            }],
            synced_at: None,
        }
    }

    #[tokio::test]
    async fn only_approved_templates_resolve() {
        let store = InMemoryTemplateStore::new();
        let channel_id = Uuid::new_v4();
        let paused = order_update(channel_id, TemplateStatus::Paused);
        store.upsert(paused.clone()).await.unwrap();
        assert!(store
            .approved(channel_id, "order_update", "es")
            .await
            .unwrap()
            .is_none());

        store
            .set_status(
                paused.id,
                TemplateStatus::Approved,
                OffsetDateTime::now_utc(),
            )
            .await
            .unwrap();
        assert!(store
            .approved(channel_id, "order_update", "es")
            .await
            .unwrap()
            .is_some());
    }
}
