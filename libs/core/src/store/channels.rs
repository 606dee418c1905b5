use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::channel::Channel;
use crate::error::{SendError, StoreResult};
use crate::types::Provider;

/// Registry of configured provider channels. The coordinator only ever
/// selects active channels; resolution distinguishes "nothing configured"
/// from "configured but inactive".
#[async_trait]
pub trait ChannelStore: Send + Sync {
    async fn upsert(&self, channel: Channel) -> StoreResult<()>;
    async fn get(&self, id: Uuid) -> StoreResult<Option<Channel>>;
    async fn list(&self) -> StoreResult<Vec<Channel>>;

    /// Resolves the single active channel of the given provider type.
    async fn active_channel(&self, provider: Provider) -> Result<Channel, SendError>;
}

pub type SharedChannelStore = Arc<dyn ChannelStore>;

#[derive(Clone, Default)]
pub struct InMemoryChannelStore {
    inner: Arc<RwLock<HashMap<Uuid, Channel>>>,
}

impl InMemoryChannelStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> SharedChannelStore {
        Arc::new(Self::new())
    }
}

#[async_trait]
impl ChannelStore for InMemoryChannelStore {
    async fn upsert(&self, channel: Channel) -> StoreResult<()> {
        self.inner.write().await.insert(channel.id, channel);
        Ok(())
    }

    async fn get(&self, id: Uuid) -> StoreResult<Option<Channel>> {
        Ok(self.inner.read().await.get(&id).cloned())
    }

    async fn list(&self) -> StoreResult<Vec<Channel>> {
        Ok(self.inner.read().await.values().cloned().collect())
    }

    async fn active_channel(&self, provider: Provider) -> Result<Channel, SendError> {
        let guard = self.inner.read().await;
        let mut inactive_seen = false;
        for channel in guard.values() {
            if channel.provider() != provider {
                continue;
            }
            if channel.is_active() {
                return Ok(channel.clone());
            }
            inactive_seen = true;
        }
        if inactive_seen {
            Err(SendError::ChannelInactive(provider))
        } else {
            Err(SendError::NotConfigured(provider))
        }
    }
}
