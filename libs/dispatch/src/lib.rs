//! Dispatch coordinator.
//!
//! Turns a send intent into a durable record plus a best-effort delivery
//! attempt. The canonical message is written as `pending` before any network
//! call; the adapter outcome then resolves it to `sent` or `failed`. The two
//! steps are intentionally not transactional: a crash between them leaves a
//! `pending` record for later external reconciliation.

use std::collections::BTreeMap;

use thiserror::Error;
use uuid::Uuid;

use odm_core::{
    ChannelStore, MediaDescriptor, Message, MessageMetadata, MessageStatus, MessageStore,
    MessageType, NewMessage, SendError, SenderRef, SharedChannelStore, SharedMessageStore,
    SharedTemplateStore, StoreError, TemplateStore,
};
use odm_providers::{AdapterRegistry, SendRequest, TemplateSend};

mod status;

pub use status::{CallbackStatus, StatusUpdate, apply_status_update};

/// Template reference carried by a send intent; resolved against the
/// template registry at dispatch time.
#[derive(Debug, Clone, PartialEq)]
pub struct TemplateRef {
    pub name: String,
    pub language: String,
    pub params: BTreeMap<String, String>,
}

/// What a caller wants delivered into one conversation.
#[derive(Debug, Clone)]
pub struct SendIntent {
    pub conversation_id: Uuid,
    pub sender: SenderRef,
    pub message_type: MessageType,
    pub content: Option<String>,
    pub media: Option<MediaDescriptor>,
    pub template: Option<TemplateRef>,
    /// Destination override; defaults to the conversation's contact id.
    pub to: Option<String>,
    /// Optimistic correlation id minted by the client.
    pub correlation_id: Option<String>,
}

impl SendIntent {
    pub fn text(conversation_id: Uuid, sender: SenderRef, content: impl Into<String>) -> Self {
        Self {
            conversation_id,
            sender,
            message_type: MessageType::Text,
            content: Some(content.into()),
            media: None,
            template: None,
            to: None,
            correlation_id: None,
        }
    }

    fn is_empty(&self) -> bool {
        let no_text = self
            .content
            .as_deref()
            .map(|text| text.trim().is_empty())
            .unwrap_or(true);
        no_text && self.template.is_none() && self.media.is_none()
    }
}

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error(transparent)]
    Send(#[from] SendError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Composes store, channel registry, template registry, and adapters.
#[derive(Clone)]
pub struct Dispatcher {
    store: SharedMessageStore,
    channels: SharedChannelStore,
    templates: SharedTemplateStore,
    adapters: AdapterRegistry,
}

impl Dispatcher {
    pub fn new(
        store: SharedMessageStore,
        channels: SharedChannelStore,
        templates: SharedTemplateStore,
        adapters: AdapterRegistry,
    ) -> Self {
        Self {
            store,
            channels,
            templates,
            adapters,
        }
    }

    pub fn store(&self) -> &SharedMessageStore {
        &self.store
    }

    /// Runs one coordinator pass. Returns `Ok(None)` when the intent carries
    /// nothing to deliver. On adapter failure the canonical record is
    /// retained as `failed` (never dropped) and the error is propagated.
    pub async fn dispatch(&self, intent: SendIntent) -> Result<Option<Message>, DispatchError> {
        if intent.is_empty() {
            return Ok(None);
        }

        let conversation = self.store.conversation(intent.conversation_id).await?;

        let mut metadata = MessageMetadata {
            correlation_id: intent.correlation_id.clone(),
            ..Default::default()
        };
        if let Some(template_ref) = &intent.template {
            metadata.template_name = Some(template_ref.name.clone());
            metadata.template_language = Some(template_ref.language.clone());
            metadata.template_params = template_ref.params.clone();
        }

        // Step 1: the durable pending record, before any network call.
        let pending = self
            .store
            .create_message(
                conversation.id,
                NewMessage {
                    sender: intent.sender.clone(),
                    message_type: intent.message_type,
                    content: intent.content.clone(),
                    media: intent.media.clone(),
                    provider: conversation.channel,
                    external_id: None,
                    status: MessageStatus::Pending,
                    metadata,
                },
            )
            .await?;

        // Internal-only conversations have no provider behind them.
        let Some(provider) = conversation.channel else {
            let sent = self
                .store
                .update_status(pending.id, MessageStatus::Sent)
                .await?;
            return Ok(Some(sent));
        };

        let channel = match self.channels.active_channel(provider).await {
            Ok(channel) => channel,
            Err(err) => return self.fail(pending.id, err).await,
        };

        // Template takes precedence over free text when both are supplied.
        let template = match &intent.template {
            Some(template_ref) => {
                match self.resolve_template(channel.id, template_ref).await {
                    Ok(resolved) => Some(resolved),
                    Err(err) => return self.fail(pending.id, err).await,
                }
            }
            None => None,
        };

        let Some(adapter) = self.adapters.get(provider) else {
            return self.fail(pending.id, SendError::NotConfigured(provider)).await;
        };

        let request = SendRequest {
            to: intent.to.unwrap_or_else(|| conversation.contact_id.clone()),
            message_type: intent.message_type,
            content: intent.content,
            media: intent.media,
            template,
            channel,
        };

        match adapter.send(&request).await {
            Ok(outcome) => {
                self.store
                    .set_external_id(pending.id, &outcome.external_message_id, provider)
                    .await?;
                let sent = self
                    .store
                    .update_status(pending.id, MessageStatus::Sent)
                    .await?;
                tracing::info!(
                    message = %sent.id,
                    provider = %provider,
                    external_id = %outcome.external_message_id,
                    "message dispatched"
                );
                Ok(Some(sent))
            }
            Err(err) => self.fail(pending.id, err).await,
        }
    }

    /// The coordinator re-validates parameter completeness itself; a caller's
    /// resolution cannot be assumed complete.
    async fn resolve_template(
        &self,
        channel_id: Uuid,
        template_ref: &TemplateRef,
    ) -> Result<TemplateSend, SendError> {
        let template = self
            .templates
            .approved(channel_id, &template_ref.name, &template_ref.language)
            .await
            .map_err(|err| SendError::Validation(err.to_string()))?
            .ok_or_else(|| {
                SendError::Validation(format!(
                    "template {} ({}) is not approved for this channel",
                    template_ref.name, template_ref.language
                ))
            })?;

        let missing = odm_templates::missing_parameters(&template, &template_ref.params);
        if !missing.is_empty() {
            return Err(SendError::Validation(format!(
                "missing template parameters: {}",
                missing.into_iter().collect::<Vec<_>>().join(", ")
            )));
        }

        Ok(TemplateSend {
            template,
            params: template_ref.params.clone(),
        })
    }

    async fn fail(
        &self,
        message_id: Uuid,
        err: SendError,
    ) -> Result<Option<Message>, DispatchError> {
        let reason = err.failure_reason();
        tracing::warn!(message = %message_id, %reason, "dispatch failed");
        self.store.mark_failed(message_id, &reason).await?;
        Err(err.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Arc;
    use tokio::sync::Mutex;

    use odm_core::{
        Channel, ChannelConfig, ChannelStatus, InMemoryChannelStore, InMemoryMessageStore,
        InMemoryTemplateStore, MessageTemplate, Provider, TemplateComponent, TemplateStatus,
    };
    use odm_providers::{SendAdapter, SendOutcome};

    struct ScriptedAdapter {
        provider: Provider,
        outcome: Mutex<Vec<Result<String, SendError>>>,
        requests: Mutex<Vec<SendRequest>>,
    }

    impl ScriptedAdapter {
        fn succeeding(provider: Provider, external_id: &str) -> Self {
            Self {
                provider,
                outcome: Mutex::new(vec![Ok(external_id.to_string())]),
                requests: Mutex::new(Vec::new()),
            }
        }

        fn failing(provider: Provider, err: SendError) -> Self {
            Self {
                provider,
                outcome: Mutex::new(vec![Err(err)]),
                requests: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl SendAdapter for ScriptedAdapter {
        fn provider(&self) -> Provider {
            self.provider
        }

        async fn send(&self, request: &SendRequest) -> Result<SendOutcome, SendError> {
            self.requests.lock().await.push(request.clone());
            match self.outcome.lock().await.pop().expect("scripted outcome") {
                Ok(id) => Ok(SendOutcome {
                    external_message_id: id,
                    raw: serde_json::json!({}),
                }),
                Err(err) => Err(err),
            }
        }
    }

    fn whatsapp_channel() -> Channel {
        Channel {
            id: Uuid::new_v4(),
            name: "Primary WhatsApp".into(),
            status: ChannelStatus::Active,
            config: ChannelConfig::WhatsApp {
                phone_number_id: "1050123".into(),
                access_token: "token".into(),
                api_base: "https://graph.facebook.com".into(),
            },
        }
    }

    struct Harness {
        dispatcher: Dispatcher,
        store: SharedMessageStore,
        channels: SharedChannelStore,
        templates: SharedTemplateStore,
    }

    fn harness(adapter: Option<Arc<dyn SendAdapter>>) -> Harness {
        let store: SharedMessageStore = InMemoryMessageStore::shared();
        let channels: SharedChannelStore = InMemoryChannelStore::shared();
        let templates: SharedTemplateStore = InMemoryTemplateStore::shared();
        let mut adapters = AdapterRegistry::new();
        if let Some(adapter) = adapter {
            adapters.register(adapter);
        }
        Harness {
            dispatcher: Dispatcher::new(
                store.clone(),
                channels.clone(),
                templates.clone(),
                adapters,
            ),
            store,
            channels,
            templates,
        }
    }

    #[tokio::test]
    async fn successful_send_transitions_pending_to_sent() {
        let adapter = Arc::new(ScriptedAdapter::succeeding(Provider::WhatsApp, "wamid.X"));
        let harness = harness(Some(adapter.clone()));
        harness.channels.upsert(whatsapp_channel()).await.unwrap();
        let conversation = harness
            .store
            .find_or_create_conversation("51987654321", Some(Provider::WhatsApp), None)
            .await
            .unwrap();

        let sent = harness
            .dispatcher
            .dispatch(SendIntent::text(
                conversation.id,
                SenderRef::agent("agent-1"),
                "Hola",
            ))
            .await
            .unwrap()
            .expect("a message was dispatched");

        assert_eq!(sent.status, MessageStatus::Sent);
        assert_eq!(sent.external_id.as_deref(), Some("wamid.X"));

        // The destination defaults to the conversation's contact id.
        let requests = adapter.requests.lock().await;
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].to, "51987654321");
    }

    #[tokio::test]
    async fn missing_channel_marks_failed_with_reason() {
        let harness = harness(Some(Arc::new(ScriptedAdapter::succeeding(
            Provider::WhatsApp,
            "wamid.X",
        ))));
        let conversation = harness
            .store
            .find_or_create_conversation("51987654321", Some(Provider::WhatsApp), None)
            .await
            .unwrap();

        let err = harness
            .dispatcher
            .dispatch(SendIntent::text(
                conversation.id,
                SenderRef::agent("agent-1"),
                "Hola",
            ))
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "No active WhatsApp channel found");

        let messages = harness
            .store
            .messages_after(conversation.id, None)
            .await
            .unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].status, MessageStatus::Failed);
        assert_eq!(
            messages[0].failure_reason.as_deref(),
            Some("No active WhatsApp channel found")
        );
    }

    #[tokio::test]
    async fn empty_intent_is_a_no_op() {
        let harness = harness(None);
        let conversation = harness
            .store
            .find_or_create_conversation("c-1", None, None)
            .await
            .unwrap();

        let outcome = harness
            .dispatcher
            .dispatch(SendIntent {
                conversation_id: conversation.id,
                sender: SenderRef::agent("agent-1"),
                message_type: MessageType::Text,
                content: Some("   ".into()),
                media: None,
                template: None,
                to: None,
                correlation_id: None,
            })
            .await
            .unwrap();
        assert!(outcome.is_none());
        assert!(harness
            .store
            .messages_after(conversation.id, None)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn internal_conversations_bypass_adapters() {
        let harness = harness(None);
        let conversation = harness
            .store
            .find_or_create_conversation("c-2", None, None)
            .await
            .unwrap();

        let sent = harness
            .dispatcher
            .dispatch(SendIntent::text(
                conversation.id,
                SenderRef::agent("agent-1"),
                "internal note",
            ))
            .await
            .unwrap()
            .expect("internal message recorded");
        assert_eq!(sent.status, MessageStatus::Sent);
        assert!(sent.external_id.is_none());
    }

    #[tokio::test]
    async fn provider_rejection_preserves_reason_verbatim() {
        let reason = "(#131030) Recipient phone number not in allowed list";
        let harness = harness(Some(Arc::new(ScriptedAdapter::failing(
            Provider::WhatsApp,
            SendError::ProviderRejected {
                provider: Provider::WhatsApp,
                reason: reason.into(),
            },
        ))));
        harness.channels.upsert(whatsapp_channel()).await.unwrap();
        let conversation = harness
            .store
            .find_or_create_conversation("51987654321", Some(Provider::WhatsApp), None)
            .await
            .unwrap();

        harness
            .dispatcher
            .dispatch(SendIntent::text(
                conversation.id,
                SenderRef::agent("agent-1"),
                "Hola",
            ))
            .await
            .unwrap_err();

        let messages = harness
            .store
            .messages_after(conversation.id, None)
            .await
            .unwrap();
        assert!(messages[0]
            .failure_reason
            .as_deref()
            .unwrap()
            .contains(reason));
    }

    #[tokio::test]
    async fn incomplete_template_parameters_fail_validation() {
        let harness = harness(Some(Arc::new(ScriptedAdapter::succeeding(
            Provider::WhatsApp,
            "wamid.X",
        ))));
        let channel = whatsapp_channel();
        harness.channels.upsert(channel.clone()).await.unwrap();
        harness
            .templates
            .upsert(MessageTemplate {
                id: Uuid::new_v4(),
                channel_id: channel.id,
                provider: Provider::WhatsApp,
                name: "order_update".into(),
                language: "es".into(),
                category: "utility".into(),
                status: TemplateStatus::Approved,
                components: vec![TemplateComponent::Body {
                    text: "Hola {{1}}, estado {{2}}".into(),
                }],
                synced_at: None,
            })
            .await
            .unwrap();

        let conversation = harness
            .store
            .find_or_create_conversation("51987654321", Some(Provider::WhatsApp), None)
            .await
            .unwrap();

        let mut params = BTreeMap::new();
        params.insert("param_1".to_string(), "Ana".to_string());
        let err = harness
            .dispatcher
            .dispatch(SendIntent {
                conversation_id: conversation.id,
                sender: SenderRef::agent("agent-1"),
                message_type: MessageType::Text,
                content: None,
                media: None,
                template: Some(TemplateRef {
                    name: "order_update".into(),
                    language: "es".into(),
                    params,
                }),
                to: None,
                correlation_id: None,
            })
            .await
            .unwrap_err();
        assert!(err.to_string().contains("param_2"));

        let messages = harness
            .store
            .messages_after(conversation.id, None)
            .await
            .unwrap();
        assert_eq!(messages[0].status, MessageStatus::Failed);
    }

    #[tokio::test]
    async fn correlation_id_lands_in_metadata() {
        let harness = harness(None);
        let conversation = harness
            .store
            .find_or_create_conversation("c-3", None, None)
            .await
            .unwrap();

        let mut intent =
            SendIntent::text(conversation.id, SenderRef::visitor("v-1"), "optimistic");
        intent.correlation_id = Some("corr-123".into());
        let message = harness
            .dispatcher
            .dispatch(intent)
            .await
            .unwrap()
            .expect("recorded");
        assert_eq!(
            message.metadata.correlation_id.as_deref(),
            Some("corr-123")
        );
    }
}
