//! Store traits and in-memory implementations.
//!
//! The message store is the durability boundary of the dispatch pipeline:
//! the coordinator writes a `pending` record here before any provider call
//! and resolves it afterwards. Appends fan out over a per-conversation
//! broadcast channel that the widget gateway subscribes to.

use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};

use async_trait::async_trait;
use time::OffsetDateTime;
use tokio::sync::{RwLock, broadcast};
use uuid::Uuid;

use crate::error::{StoreError, StoreResult};
use crate::types::{
    Conversation, ConversationStatus, Message, MessageStatus, NewMessage, Provider, SenderKind,
};

mod channels;
mod templates;

pub use channels::{InMemoryChannelStore, ChannelStore, SharedChannelStore};
pub use templates::{InMemoryTemplateStore, SharedTemplateStore, TemplateStore};

#[cfg(feature = "store_sqlite")]
mod sqlite;
#[cfg(feature = "store_sqlite")]
pub use sqlite::sqlite_message_store;

/// Rows per chunk attempted as a batch before falling back to row level.
pub const BULK_CHUNK_SIZE: usize = 50;

/// Outcome of a chunked bulk append.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BulkOutcome {
    pub inserted: usize,
    /// Rows dropped because their external id was already present.
    pub skipped: usize,
}

#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Appends a message to a conversation, assigning id and timestamp and
    /// bumping the conversation's `last_message_at`/unread counters.
    async fn create_message(&self, conversation_id: Uuid, new: NewMessage) -> StoreResult<Message>;

    /// Records the provider-assigned id once the provider acknowledges.
    async fn set_external_id(
        &self,
        message_id: Uuid,
        external_id: &str,
        provider: Provider,
    ) -> StoreResult<Message>;

    /// Forward-only status transition; a stale callback is a no-op.
    async fn update_status(&self, message_id: Uuid, status: MessageStatus) -> StoreResult<Message>;

    /// Terminal failure with the reason preserved verbatim.
    async fn mark_failed(&self, message_id: Uuid, reason: &str) -> StoreResult<Message>;

    async fn message(&self, message_id: Uuid) -> StoreResult<Message>;

    /// Messages strictly after `after` in append order; the full transcript
    /// when `after` is `None` or no longer present.
    async fn messages_after(
        &self,
        conversation_id: Uuid,
        after: Option<Uuid>,
    ) -> StoreResult<Vec<Message>>;

    /// Maps a provider callback back to its canonical message.
    async fn find_by_external_id(
        &self,
        provider: Provider,
        external_id: &str,
    ) -> StoreResult<Option<Message>>;

    /// Returns the actively-used conversation for the (contact, channel)
    /// pair, creating one when none is routable.
    async fn find_or_create_conversation(
        &self,
        contact_id: &str,
        channel: Option<Provider>,
        channel_id: Option<Uuid>,
    ) -> StoreResult<Conversation>;

    async fn conversation(&self, conversation_id: Uuid) -> StoreResult<Conversation>;

    async fn find_conversation_by_contact(
        &self,
        contact_id: &str,
    ) -> StoreResult<Option<Conversation>>;

    async fn set_conversation_status(
        &self,
        conversation_id: Uuid,
        status: ConversationStatus,
    ) -> StoreResult<()>;

    /// Admin-only hard delete; cascades messages.
    async fn delete_conversation(&self, conversation_id: Uuid) -> StoreResult<()>;

    /// Live append fan-out for one conversation.
    async fn subscribe(&self, conversation_id: Uuid)
    -> StoreResult<broadcast::Receiver<Message>>;

    /// Chunked bulk append: batch first, fall back to row level on a
    /// duplicate external id, never abandon partial success.
    async fn append_many(
        &self,
        conversation_id: Uuid,
        batch: Vec<NewMessage>,
    ) -> StoreResult<BulkOutcome>;
}

pub type SharedMessageStore = Arc<dyn MessageStore>;

type RoutingKey = (String, Option<Provider>);

struct ConversationRecord {
    conversation: Conversation,
    messages: Vec<Message>,
    broadcaster: broadcast::Sender<Message>,
}

impl ConversationRecord {
    fn new(conversation: Conversation) -> Self {
        let (sender, _) = broadcast::channel(32);
        Self {
            conversation,
            messages: Vec::new(),
            broadcaster: sender,
        }
    }
}

#[derive(Default)]
struct Inner {
    conversations: HashMap<Uuid, ConversationRecord>,
    routing: HashMap<RoutingKey, Uuid>,
    message_index: HashMap<Uuid, Uuid>,
    external_index: HashMap<(Provider, String), Uuid>,
}

impl Inner {
    fn record_mut(&mut self, conversation_id: Uuid) -> StoreResult<&mut ConversationRecord> {
        self.conversations
            .get_mut(&conversation_id)
            .ok_or_else(|| StoreError::NotFound(format!("conversation {conversation_id}")))
    }

    fn message_mut(&mut self, message_id: Uuid) -> StoreResult<&mut Message> {
        let conversation_id = *self
            .message_index
            .get(&message_id)
            .ok_or_else(|| StoreError::NotFound(format!("message {message_id}")))?;
        let record = self.record_mut(conversation_id)?;
        record
            .messages
            .iter_mut()
            .find(|message| message.id == message_id)
            .ok_or_else(|| StoreError::NotFound(format!("message {message_id}")))
    }

    fn insert_message(
        &mut self,
        conversation_id: Uuid,
        new: NewMessage,
    ) -> StoreResult<Message> {
        if let (Some(provider), Some(external_id)) = (new.provider, new.external_id.as_deref()) {
            if self
                .external_index
                .contains_key(&(provider, external_id.to_string()))
            {
                return Err(StoreError::Conflict(format!(
                    "external id {external_id} already recorded for {provider}"
                )));
            }
        }

        let record = self.record_mut(conversation_id)?;
        let now = OffsetDateTime::now_utc();
        let message = Message {
            id: Uuid::new_v4(),
            conversation_id,
            sender: new.sender,
            message_type: new.message_type,
            content: new.content,
            media: new.media,
            provider: new.provider,
            external_id: new.external_id,
            status: new.status,
            failure_reason: None,
            metadata: new.metadata,
            created_at: now,
            read_at: None,
        };

        record.conversation.last_message_at = Some(now);
        if message.sender.kind == SenderKind::Visitor {
            record.conversation.unread_count += 1;
        }
        record.messages.push(message.clone());
        let _ = record.broadcaster.send(message.clone());

        self.message_index.insert(message.id, conversation_id);
        if let (Some(provider), Some(external_id)) = (message.provider, message.external_id.clone())
        {
            self.external_index
                .insert((provider, external_id), message.id);
        }
        Ok(message)
    }
}

/// In-memory message store used by tests, demos, and single-node deployments.
#[derive(Clone, Default)]
pub struct InMemoryMessageStore {
    inner: Arc<RwLock<Inner>>,
}

impl InMemoryMessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> SharedMessageStore {
        Arc::new(Self::new())
    }
}

#[async_trait]
impl MessageStore for InMemoryMessageStore {
    async fn create_message(&self, conversation_id: Uuid, new: NewMessage) -> StoreResult<Message> {
        let mut guard = self.inner.write().await;
        guard.insert_message(conversation_id, new)
    }

    async fn set_external_id(
        &self,
        message_id: Uuid,
        external_id: &str,
        provider: Provider,
    ) -> StoreResult<Message> {
        let mut guard = self.inner.write().await;
        let key = (provider, external_id.to_string());
        if let Some(existing) = guard.external_index.get(&key) {
            if *existing != message_id {
                return Err(StoreError::Conflict(format!(
                    "external id {external_id} already bound to message {existing}"
                )));
            }
        }
        let message = guard.message_mut(message_id)?;
        message.external_id = Some(external_id.to_string());
        message.provider = Some(provider);
        let message = message.clone();
        guard.external_index.insert(key, message_id);
        Ok(message)
    }

    async fn update_status(&self, message_id: Uuid, status: MessageStatus) -> StoreResult<Message> {
        let mut guard = self.inner.write().await;
        let message = guard.message_mut(message_id)?;
        if status.rank() <= message.status.rank() {
            // Out-of-order callback; keep the more advanced state.
            return Ok(message.clone());
        }
        message.status = status;
        if status == MessageStatus::Read && message.read_at.is_none() {
            message.read_at = Some(OffsetDateTime::now_utc());
        }
        Ok(message.clone())
    }

    async fn mark_failed(&self, message_id: Uuid, reason: &str) -> StoreResult<Message> {
        let mut guard = self.inner.write().await;
        let message = guard.message_mut(message_id)?;
        message.status = MessageStatus::Failed;
        message.failure_reason = Some(reason.to_string());
        Ok(message.clone())
    }

    async fn message(&self, message_id: Uuid) -> StoreResult<Message> {
        let guard = self.inner.read().await;
        let conversation_id = guard
            .message_index
            .get(&message_id)
            .ok_or_else(|| StoreError::NotFound(format!("message {message_id}")))?;
        let record = guard
            .conversations
            .get(conversation_id)
            .ok_or_else(|| StoreError::NotFound(format!("conversation {conversation_id}")))?;
        record
            .messages
            .iter()
            .find(|message| message.id == message_id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("message {message_id}")))
    }

    async fn messages_after(
        &self,
        conversation_id: Uuid,
        after: Option<Uuid>,
    ) -> StoreResult<Vec<Message>> {
        let guard = self.inner.read().await;
        let record = guard
            .conversations
            .get(&conversation_id)
            .ok_or_else(|| StoreError::NotFound(format!("conversation {conversation_id}")))?;
        let start = after
            .and_then(|id| record.messages.iter().position(|message| message.id == id))
            .map(|position| position + 1)
            .unwrap_or(0);
        Ok(record.messages[start..].to_vec())
    }

    async fn find_by_external_id(
        &self,
        provider: Provider,
        external_id: &str,
    ) -> StoreResult<Option<Message>> {
        let message_id = {
            let guard = self.inner.read().await;
            guard
                .external_index
                .get(&(provider, external_id.to_string()))
                .copied()
        };
        match message_id {
            Some(id) => self.message(id).await.map(Some),
            None => Ok(None),
        }
    }

    async fn find_or_create_conversation(
        &self,
        contact_id: &str,
        channel: Option<Provider>,
        channel_id: Option<Uuid>,
    ) -> StoreResult<Conversation> {
        let mut guard = self.inner.write().await;
        let key: RoutingKey = (contact_id.to_string(), channel);
        if let Some(existing) = guard.routing.get(&key).copied() {
            if let Some(record) = guard.conversations.get(&existing) {
                if record.conversation.status.is_routable() {
                    return Ok(record.conversation.clone());
                }
            }
        }

        let conversation = Conversation {
            id: Uuid::new_v4(),
            contact_id: contact_id.to_string(),
            channel,
            channel_id,
            status: ConversationStatus::Open,
            last_message_at: None,
            unread_count: 0,
            created_at: OffsetDateTime::now_utc(),
        };
        guard.routing.insert(key, conversation.id);
        guard
            .conversations
            .insert(conversation.id, ConversationRecord::new(conversation.clone()));
        Ok(conversation)
    }

    async fn conversation(&self, conversation_id: Uuid) -> StoreResult<Conversation> {
        let guard = self.inner.read().await;
        guard
            .conversations
            .get(&conversation_id)
            .map(|record| record.conversation.clone())
            .ok_or_else(|| StoreError::NotFound(format!("conversation {conversation_id}")))
    }

    async fn find_conversation_by_contact(
        &self,
        contact_id: &str,
    ) -> StoreResult<Option<Conversation>> {
        let guard = self.inner.read().await;
        let mut found: Option<&Conversation> = None;
        for record in guard.conversations.values() {
            let conversation = &record.conversation;
            if conversation.contact_id != contact_id || !conversation.status.is_routable() {
                continue;
            }
            let newer = match found {
                Some(current) => conversation.created_at > current.created_at,
                None => true,
            };
            if newer {
                found = Some(conversation);
            }
        }
        Ok(found.cloned())
    }

    async fn set_conversation_status(
        &self,
        conversation_id: Uuid,
        status: ConversationStatus,
    ) -> StoreResult<()> {
        let mut guard = self.inner.write().await;
        let record = guard.record_mut(conversation_id)?;
        record.conversation.status = status;
        Ok(())
    }

    async fn delete_conversation(&self, conversation_id: Uuid) -> StoreResult<()> {
        let mut guard = self.inner.write().await;
        let record = guard
            .conversations
            .remove(&conversation_id)
            .ok_or_else(|| StoreError::NotFound(format!("conversation {conversation_id}")))?;
        for message in &record.messages {
            guard.message_index.remove(&message.id);
            if let (Some(provider), Some(external_id)) = (message.provider, &message.external_id) {
                guard.external_index.remove(&(provider, external_id.clone()));
            }
        }
        guard
            .routing
            .retain(|_, mapped| *mapped != conversation_id);
        Ok(())
    }

    async fn subscribe(
        &self,
        conversation_id: Uuid,
    ) -> StoreResult<broadcast::Receiver<Message>> {
        let guard = self.inner.read().await;
        let record = guard
            .conversations
            .get(&conversation_id)
            .ok_or_else(|| StoreError::NotFound(format!("conversation {conversation_id}")))?;
        Ok(record.broadcaster.subscribe())
    }

    async fn append_many(
        &self,
        conversation_id: Uuid,
        batch: Vec<NewMessage>,
    ) -> StoreResult<BulkOutcome> {
        let mut outcome = BulkOutcome::default();
        let mut guard = self.inner.write().await;
        guard.record_mut(conversation_id)?;

        for chunk in batch.chunks(BULK_CHUNK_SIZE) {
            let mut staged: HashSet<(Provider, &str)> = HashSet::new();
            let conflict_free = chunk.iter().all(|new| {
                match (new.provider, new.external_id.as_deref()) {
                    (Some(provider), Some(external_id)) => {
                        !guard
                            .external_index
                            .contains_key(&(provider, external_id.to_string()))
                            && staged.insert((provider, external_id))
                    }
                    _ => true,
                }
            });

            if conflict_free {
                for new in chunk {
                    guard.insert_message(conversation_id, new.clone())?;
                    outcome.inserted += 1;
                }
                continue;
            }

            // Row-level fallback: keep every non-conflicting row.
            for new in chunk {
                match guard.insert_message(conversation_id, new.clone()) {
                    Ok(_) => outcome.inserted += 1,
                    Err(StoreError::Conflict(_)) => outcome.skipped += 1,
                    Err(other) => return Err(other),
                }
            }
        }
        Ok(outcome)
    }
}
