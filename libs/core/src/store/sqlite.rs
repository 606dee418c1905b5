use std::{
    collections::HashMap,
    path::Path,
    sync::{Arc, Mutex as StdMutex},
};

use async_trait::async_trait;
use rusqlite::{Connection, params};
use time::OffsetDateTime;
use tokio::{
    sync::{Mutex, broadcast},
    task::spawn_blocking,
};
use uuid::Uuid;

use super::{BULK_CHUNK_SIZE, BulkOutcome, MessageStore, SharedMessageStore};
use crate::error::{StoreError, StoreResult};
use crate::types::{
    Conversation, ConversationStatus, Message, MessageStatus, NewMessage, Provider, SenderKind,
};

const CREATE_TABLE_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS conversations (
    id TEXT PRIMARY KEY,
    record TEXT NOT NULL
);
"#;

/// SQLite-backed message store. Conversations persist as JSON documents;
/// append fan-out stays in-process through per-conversation broadcast
/// channels, exactly like the in-memory store.
#[derive(Clone)]
pub struct SqliteMessageStore {
    conn: Arc<StdMutex<Connection>>,
    channels: Arc<Mutex<HashMap<Uuid, broadcast::Sender<Message>>>>,
}

/// Opens (or creates) a store at the given path.
pub fn sqlite_message_store(path: impl AsRef<Path>) -> anyhow::Result<SharedMessageStore> {
    let conn = Connection::open(path)?;
    conn.execute_batch(CREATE_TABLE_SQL)?;
    Ok(Arc::new(SqliteMessageStore {
        conn: Arc::new(StdMutex::new(conn)),
        channels: Arc::new(Mutex::new(HashMap::new())),
    }))
}

#[derive(serde::Serialize, serde::Deserialize)]
struct PersistedRecord {
    conversation: Conversation,
    messages: Vec<Message>,
}

impl SqliteMessageStore {
    async fn with_conn<F, T>(&self, func: F) -> StoreResult<T>
    where
        F: FnOnce(&Connection) -> StoreResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        spawn_blocking(move || {
            let guard = conn.lock().expect("sqlite connection mutex poisoned");
            func(&guard)
        })
        .await
        .map_err(|err| StoreError::Internal(err.into()))?
    }

    async fn load(&self, conversation_id: Uuid) -> StoreResult<Option<PersistedRecord>> {
        let id = conversation_id.to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn
                .prepare("SELECT record FROM conversations WHERE id = ?1")
                .map_err(|err| StoreError::Internal(err.into()))?;
            let mut rows = stmt
                .query(params![id])
                .map_err(|err| StoreError::Internal(err.into()))?;
            match rows.next().map_err(|err| StoreError::Internal(err.into()))? {
                Some(row) => {
                    let json: String =
                        row.get(0).map_err(|err| StoreError::Internal(err.into()))?;
                    let record: PersistedRecord = serde_json::from_str(&json)
                        .map_err(|err| StoreError::Internal(err.into()))?;
                    Ok(Some(record))
                }
                None => Ok(None),
            }
        })
        .await
    }

    async fn load_required(&self, conversation_id: Uuid) -> StoreResult<PersistedRecord> {
        self.load(conversation_id)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("conversation {conversation_id}")))
    }

    async fn load_all(&self) -> StoreResult<Vec<PersistedRecord>> {
        self.with_conn(|conn| {
            let mut stmt = conn
                .prepare("SELECT record FROM conversations")
                .map_err(|err| StoreError::Internal(err.into()))?;
            let rows = stmt
                .query_map([], |row| row.get::<_, String>(0))
                .map_err(|err| StoreError::Internal(err.into()))?;
            let mut records = Vec::new();
            for row in rows {
                let json = row.map_err(|err| StoreError::Internal(err.into()))?;
                records.push(
                    serde_json::from_str(&json)
                        .map_err(|err| StoreError::Internal(err.into()))?,
                );
            }
            Ok(records)
        })
        .await
    }

    async fn save(&self, record: &PersistedRecord) -> StoreResult<()> {
        let id = record.conversation.id.to_string();
        let json =
            serde_json::to_string(record).map_err(|err| StoreError::Internal(err.into()))?;
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO conversations (id, record) VALUES (?1, ?2)
                 ON CONFLICT(id) DO UPDATE SET record = excluded.record",
                params![id, json],
            )
            .map_err(|err| StoreError::Internal(err.into()))?;
            Ok(())
        })
        .await
    }

    /// Loads the record owning a message; scanning is acceptable for the
    /// document-per-conversation layout this store uses.
    async fn locate_message(&self, message_id: Uuid) -> StoreResult<PersistedRecord> {
        let records = self.load_all().await?;
        records
            .into_iter()
            .find(|record| record.messages.iter().any(|message| message.id == message_id))
            .ok_or_else(|| StoreError::NotFound(format!("message {message_id}")))
    }

    async fn external_id_taken(&self, provider: Provider, external_id: &str) -> StoreResult<bool> {
        let records = self.load_all().await?;
        Ok(records.iter().any(|record| {
            record.messages.iter().any(|message| {
                message.provider == Some(provider)
                    && message.external_id.as_deref() == Some(external_id)
            })
        }))
    }

    async fn broadcast(&self, message: &Message) {
        let mut guard = self.channels.lock().await;
        let sender = guard
            .entry(message.conversation_id)
            .or_insert_with(|| broadcast::channel(32).0);
        let _ = sender.send(message.clone());
    }

    fn build_message(conversation_id: Uuid, new: NewMessage) -> Message {
        Message {
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
            created_at: OffsetDateTime::now_utc(),
            read_at: None,
        }
    }

    fn push_message(record: &mut PersistedRecord, message: &Message) {
        record.conversation.last_message_at = Some(message.created_at);
        if message.sender.kind == SenderKind::Visitor {
            record.conversation.unread_count += 1;
        }
        record.messages.push(message.clone());
    }

    async fn insert_one(
        &self,
        record: &mut PersistedRecord,
        new: NewMessage,
    ) -> StoreResult<Message> {
        if let (Some(provider), Some(external_id)) = (new.provider, new.external_id.as_deref()) {
            let duplicate_in_record = record.messages.iter().any(|message| {
                message.provider == Some(provider)
                    && message.external_id.as_deref() == Some(external_id)
            });
            if duplicate_in_record || self.external_id_taken(provider, external_id).await? {
                return Err(StoreError::Conflict(format!(
                    "external id {external_id} already recorded for {provider}"
                )));
            }
        }
        let message = Self::build_message(record.conversation.id, new);
        Self::push_message(record, &message);
        Ok(message)
    }
}

#[async_trait]
impl MessageStore for SqliteMessageStore {
    async fn create_message(&self, conversation_id: Uuid, new: NewMessage) -> StoreResult<Message> {
        let mut record = self.load_required(conversation_id).await?;
        let message = self.insert_one(&mut record, new).await?;
        self.save(&record).await?;
        self.broadcast(&message).await;
        Ok(message)
    }

    async fn set_external_id(
        &self,
        message_id: Uuid,
        external_id: &str,
        provider: Provider,
    ) -> StoreResult<Message> {
        let mut record = self.locate_message(message_id).await?;
        let position = record
            .messages
            .iter()
            .position(|message| message.id == message_id)
            .ok_or_else(|| StoreError::NotFound(format!("message {message_id}")))?;
        if record.messages.iter().any(|message| {
            message.id != message_id
                && message.provider == Some(provider)
                && message.external_id.as_deref() == Some(external_id)
        }) {
            return Err(StoreError::Conflict(format!(
                "external id {external_id} already bound"
            )));
        }
        let message = &mut record.messages[position];
        message.external_id = Some(external_id.to_string());
        message.provider = Some(provider);
        let updated = message.clone();
        self.save(&record).await?;
        Ok(updated)
    }

    async fn update_status(&self, message_id: Uuid, status: MessageStatus) -> StoreResult<Message> {
        let mut record = self.locate_message(message_id).await?;
        let message = record
            .messages
            .iter_mut()
            .find(|message| message.id == message_id)
            .ok_or_else(|| StoreError::NotFound(format!("message {message_id}")))?;
        if status.rank() <= message.status.rank() {
            return Ok(message.clone());
        }
        message.status = status;
        if status == MessageStatus::Read && message.read_at.is_none() {
            message.read_at = Some(OffsetDateTime::now_utc());
        }
        let updated = message.clone();
        self.save(&record).await?;
        Ok(updated)
    }

    async fn mark_failed(&self, message_id: Uuid, reason: &str) -> StoreResult<Message> {
        let mut record = self.locate_message(message_id).await?;
        let message = record
            .messages
            .iter_mut()
            .find(|message| message.id == message_id)
            .ok_or_else(|| StoreError::NotFound(format!("message {message_id}")))?;
        message.status = MessageStatus::Failed;
        message.failure_reason = Some(reason.to_string());
        let updated = message.clone();
        self.save(&record).await?;
        Ok(updated)
    }

    async fn message(&self, message_id: Uuid) -> StoreResult<Message> {
        let record = self.locate_message(message_id).await?;
        record
            .messages
            .into_iter()
            .find(|message| message.id == message_id)
            .ok_or_else(|| StoreError::NotFound(format!("message {message_id}")))
    }

    async fn messages_after(
        &self,
        conversation_id: Uuid,
        after: Option<Uuid>,
    ) -> StoreResult<Vec<Message>> {
        let record = self.load_required(conversation_id).await?;
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
        let records = self.load_all().await?;
        Ok(records.into_iter().find_map(|record| {
            record.messages.into_iter().find(|message| {
                message.provider == Some(provider)
                    && message.external_id.as_deref() == Some(external_id)
            })
        }))
    }

    async fn find_or_create_conversation(
        &self,
        contact_id: &str,
        channel: Option<Provider>,
        channel_id: Option<Uuid>,
    ) -> StoreResult<Conversation> {
        let records = self.load_all().await?;
        if let Some(existing) = records.iter().find(|record| {
            record.conversation.contact_id == contact_id
                && record.conversation.channel == channel
                && record.conversation.status.is_routable()
        }) {
            return Ok(existing.conversation.clone());
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
        let record = PersistedRecord {
            conversation: conversation.clone(),
            messages: Vec::new(),
        };
        self.save(&record).await?;
        self.channels
            .lock()
            .await
            .insert(conversation.id, broadcast::channel(32).0);
        Ok(conversation)
    }

    async fn conversation(&self, conversation_id: Uuid) -> StoreResult<Conversation> {
        Ok(self.load_required(conversation_id).await?.conversation)
    }

    async fn find_conversation_by_contact(
        &self,
        contact_id: &str,
    ) -> StoreResult<Option<Conversation>> {
        let records = self.load_all().await?;
        Ok(records
            .into_iter()
            .map(|record| record.conversation)
            .filter(|conversation| {
                conversation.contact_id == contact_id && conversation.status.is_routable()
            })
            .max_by_key(|conversation| conversation.created_at))
    }

    async fn set_conversation_status(
        &self,
        conversation_id: Uuid,
        status: ConversationStatus,
    ) -> StoreResult<()> {
        let mut record = self.load_required(conversation_id).await?;
        record.conversation.status = status;
        self.save(&record).await
    }

    async fn delete_conversation(&self, conversation_id: Uuid) -> StoreResult<()> {
        let id = conversation_id.to_string();
        let deleted = self
            .with_conn(move |conn| {
                conn.execute("DELETE FROM conversations WHERE id = ?1", params![id])
                    .map_err(|err| StoreError::Internal(err.into()))
            })
            .await?;
        if deleted == 0 {
            return Err(StoreError::NotFound(format!(
                "conversation {conversation_id}"
            )));
        }
        self.channels.lock().await.remove(&conversation_id);
        Ok(())
    }

    async fn subscribe(
        &self,
        conversation_id: Uuid,
    ) -> StoreResult<broadcast::Receiver<Message>> {
        self.load_required(conversation_id).await?;
        let mut guard = self.channels.lock().await;
        let sender = guard
            .entry(conversation_id)
            .or_insert_with(|| broadcast::channel(32).0);
        Ok(sender.subscribe())
    }

    async fn append_many(
        &self,
        conversation_id: Uuid,
        batch: Vec<NewMessage>,
    ) -> StoreResult<BulkOutcome> {
        let mut outcome = BulkOutcome::default();
        for chunk in batch.chunks(BULK_CHUNK_SIZE) {
            let mut record = self.load_required(conversation_id).await?;
            let mut staged = Vec::new();
            let mut conflict = false;
            for new in chunk {
                match self.insert_one(&mut record, new.clone()).await {
                    Ok(message) => staged.push(message),
                    Err(StoreError::Conflict(_)) => {
                        conflict = true;
                        break;
                    }
                    Err(other) => return Err(other),
                }
            }

            if !conflict {
                self.save(&record).await?;
                outcome.inserted += staged.len();
                for message in &staged {
                    self.broadcast(message).await;
                }
                continue;
            }

            // Row-level fallback: re-run the chunk one row at a time so a
            // single duplicate cannot sink its neighbours.
            for new in chunk {
                match self.create_message(conversation_id, new.clone()).await {
                    Ok(_) => outcome.inserted += 1,
                    Err(StoreError::Conflict(_)) => outcome.skipped += 1,
                    Err(other) => return Err(other),
                }
            }
        }
        Ok(outcome)
    }
}
