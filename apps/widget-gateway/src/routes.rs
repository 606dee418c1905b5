//! HTTP handlers for the widget public surface.

use axum::{
    Json, Router,
    extract::{Extension, Query},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use tracing::{error, warn};
use uuid::Uuid;

use odm_core::{Message, MessageStore, SenderRef, StoreError};
use odm_dispatch::{SendIntent, StatusUpdate, apply_status_update};

use crate::{SharedGatewayState, WidgetEntry, stream};

/// Builds the widget router. CORS is layered on by the binary so deployments
/// can scope allowed origins.
pub fn router(state: SharedGatewayState) -> Router {
    Router::new()
        .route(
            "/widget/config",
            get(widget_config_handler).options(preflight_handler),
        )
        .route(
            "/widget/messages",
            get(list_messages_handler)
                .post(post_message_handler)
                .options(preflight_handler),
        )
        .route("/widget/conversation", get(conversation_probe_handler))
        .route(
            "/widget/visitor_conversation",
            get(visitor_conversation_handler),
        )
        .route("/widget/stream", get(stream::stream_handler))
        .route("/webhooks/provider_status", post(provider_status_handler))
        .layer(Extension(state))
}

pub(crate) fn resolve_widget<'a>(
    state: &'a SharedGatewayState,
    token: Option<&str>,
) -> Result<&'a WidgetEntry, StatusCode> {
    let token = token
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .ok_or(StatusCode::BAD_REQUEST)?;
    state.widgets.get(token).ok_or(StatusCode::NOT_FOUND)
}

pub(crate) fn map_store_error(err: StoreError) -> StatusCode {
    match err {
        StoreError::NotFound(_) => StatusCode::NOT_FOUND,
        StoreError::Conflict(_) => StatusCode::CONFLICT,
        StoreError::Internal(err) => {
            error!("store error: {err}");
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

async fn preflight_handler() -> StatusCode {
    StatusCode::NO_CONTENT
}

#[doc(hidden)]
#[derive(Debug, Deserialize)]
pub struct TokenQuery {
    #[serde(default)]
    token: Option<String>,
}

#[derive(Debug, Serialize)]
struct WidgetConfigResponse {
    inbox_name: String,
    welcome_title: String,
    welcome_tagline: String,
}

/// Welcome copy for the widget shell. Doubles as the client's connectivity
/// probe.
async fn widget_config_handler(
    Extension(state): Extension<SharedGatewayState>,
    Query(query): Query<TokenQuery>,
) -> Result<Json<WidgetConfigResponse>, StatusCode> {
    let widget = resolve_widget(&state, query.token.as_deref())?;
    Ok(Json(WidgetConfigResponse {
        inbox_name: widget.inbox_name.clone(),
        welcome_title: widget.welcome_title.clone(),
        welcome_tagline: widget.welcome_tagline.clone(),
    }))
}

#[doc(hidden)]
#[derive(Debug, Deserialize)]
pub struct MessagesQuery {
    #[serde(default)]
    token: Option<String>,
    #[serde(default)]
    conversation_id: Option<Uuid>,
    #[serde(default)]
    last_message_id: Option<Uuid>,
}

#[derive(Debug, Serialize)]
struct MessagesResponse {
    messages: Vec<Message>,
}

async fn list_messages_handler(
    Extension(state): Extension<SharedGatewayState>,
    Query(query): Query<MessagesQuery>,
) -> Result<Json<MessagesResponse>, StatusCode> {
    resolve_widget(&state, query.token.as_deref())?;
    let Some(conversation_id) = query.conversation_id else {
        return Ok(Json(MessagesResponse {
            messages: Vec::new(),
        }));
    };
    let messages = state
        .dispatcher
        .store()
        .messages_after(conversation_id, query.last_message_id)
        .await
        .map_err(map_store_error)?;
    Ok(Json(MessagesResponse { messages }))
}

#[doc(hidden)]
#[derive(Debug, Deserialize)]
pub struct PostMessageBody {
    #[serde(default)]
    token: Option<String>,
    #[serde(default)]
    conversation_id: Option<Uuid>,
    #[serde(default)]
    content: Option<String>,
    #[allow(dead_code)]
    #[serde(default)]
    visitor_info: Option<serde_json::Value>,
    #[serde(default)]
    visitor_id: Option<String>,
    #[serde(default)]
    correlation_id: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct PostMessageResponse {
    pub success: bool,
    pub message: Message,
    pub conversation_id: Uuid,
    pub ai_response: Option<String>,
}

/// The single send endpoint. Lazily creates the conversation when no id is
/// supplied; the first message implicitly opens the thread.
async fn post_message_handler(
    Extension(state): Extension<SharedGatewayState>,
    Json(body): Json<PostMessageBody>,
) -> Result<Json<PostMessageResponse>, StatusCode> {
    resolve_widget(&state, body.token.as_deref())?;
    let content = body
        .content
        .as_deref()
        .map(str::trim)
        .filter(|content| !content.is_empty())
        .ok_or(StatusCode::BAD_REQUEST)?
        .to_string();

    let visitor_id = body
        .visitor_id
        .clone()
        .filter(|id| !id.trim().is_empty())
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let store = state.dispatcher.store().clone();
    let conversation = match body.conversation_id {
        Some(id) => store.conversation(id).await.map_err(map_store_error)?,
        None => store
            .find_or_create_conversation(&visitor_id, None, None)
            .await
            .map_err(map_store_error)?,
    };
    let is_first_contact = store
        .messages_after(conversation.id, None)
        .await
        .map_err(map_store_error)?
        .is_empty();

    let mut intent = SendIntent::text(
        conversation.id,
        SenderRef::visitor(visitor_id),
        content,
    );
    intent.correlation_id = body.correlation_id.clone();

    let message = state
        .dispatcher
        .dispatch(intent)
        .await
        .map_err(|err| {
            warn!("widget send failed: {err}");
            StatusCode::INTERNAL_SERVER_ERROR
        })?
        .ok_or(StatusCode::BAD_REQUEST)?;

    let mut ai_response = None;
    if let Some(responder) = &state.auto_responder {
        if let Some(reply) = responder.reply(&message, is_first_contact).await {
            let outcome = state
                .dispatcher
                .dispatch(SendIntent::text(
                    conversation.id,
                    SenderRef::automated("assistant"),
                    reply.clone(),
                ))
                .await;
            match outcome {
                Ok(_) => ai_response = Some(reply),
                Err(err) => warn!("auto-response failed: {err}"),
            }
        }
    }

    Ok(Json(PostMessageResponse {
        success: true,
        message,
        conversation_id: conversation.id,
        ai_response,
    }))
}

#[doc(hidden)]
#[derive(Debug, Deserialize)]
pub struct ConversationProbeQuery {
    #[serde(default)]
    token: Option<String>,
    #[serde(default)]
    conversation_id: Option<Uuid>,
}

/// Lightweight existence check used by the client's resumption path.
async fn conversation_probe_handler(
    Extension(state): Extension<SharedGatewayState>,
    Query(query): Query<ConversationProbeQuery>,
) -> Result<StatusCode, StatusCode> {
    resolve_widget(&state, query.token.as_deref())?;
    let conversation_id = query.conversation_id.ok_or(StatusCode::BAD_REQUEST)?;
    state
        .dispatcher
        .store()
        .conversation(conversation_id)
        .await
        .map_err(map_store_error)?;
    Ok(StatusCode::NO_CONTENT)
}

#[doc(hidden)]
#[derive(Debug, Deserialize)]
pub struct VisitorConversationQuery {
    #[serde(default)]
    token: Option<String>,
    #[serde(default)]
    visitor_id: Option<String>,
}

#[derive(Debug, Serialize)]
struct VisitorConversationResponse {
    conversation_id: Uuid,
}

/// Resolves the visitor's most recent open conversation by stable anonymous
/// id, for clients whose stored conversation id went stale.
async fn visitor_conversation_handler(
    Extension(state): Extension<SharedGatewayState>,
    Query(query): Query<VisitorConversationQuery>,
) -> Result<Json<VisitorConversationResponse>, StatusCode> {
    resolve_widget(&state, query.token.as_deref())?;
    let visitor_id = query
        .visitor_id
        .as_deref()
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .ok_or(StatusCode::BAD_REQUEST)?;
    let conversation = state
        .dispatcher
        .store()
        .find_conversation_by_contact(visitor_id)
        .await
        .map_err(map_store_error)?
        .ok_or(StatusCode::NOT_FOUND)?;
    Ok(Json(VisitorConversationResponse {
        conversation_id: conversation.id,
    }))
}

/// Provider-status webhook boundary: `{provider, external_id, status,
/// read_at?}` mapped back to the canonical message.
async fn provider_status_handler(
    Extension(state): Extension<SharedGatewayState>,
    Json(update): Json<StatusUpdate>,
) -> Result<StatusCode, StatusCode> {
    apply_status_update(state.dispatcher.store(), update)
        .await
        .map_err(map_store_error)?;
    Ok(StatusCode::NO_CONTENT)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use odm_core::{
        InMemoryChannelStore, InMemoryMessageStore, InMemoryTemplateStore, MessageStatus,
        Provider, SenderKind,
    };
    use odm_dispatch::Dispatcher;
    use odm_providers::AdapterRegistry;

    use crate::{GatewayState, GreetingResponder, WidgetRegistry};

    const TOKEN: &str = "wdg_pub_token";

    fn state() -> SharedGatewayState {
        let store = InMemoryMessageStore::shared();
        let dispatcher = Dispatcher::new(
            store,
            InMemoryChannelStore::shared(),
            InMemoryTemplateStore::shared(),
            AdapterRegistry::new(),
        );
        Arc::new(GatewayState {
            widgets: WidgetRegistry::new([crate::WidgetEntry {
                token: TOKEN.into(),
                inbox_name: "Soporte".into(),
                welcome_title: "Hola 👋".into(),
                welcome_tagline: "Escríbenos y te respondemos en minutos.".into(),
            }]),
            dispatcher,
            auto_responder: Some(Arc::new(GreetingResponder {
                greeting: "¡Gracias por escribir! Un agente te atenderá pronto.".into(),
            })),
        })
    }

    fn token_query(token: Option<&str>) -> Query<TokenQuery> {
        Query(TokenQuery {
            token: token.map(str::to_owned),
        })
    }

    async fn post_message(
        state: &SharedGatewayState,
        body: PostMessageBody,
    ) -> Result<PostMessageResponse, StatusCode> {
        post_message_handler(Extension(Arc::clone(state)), Json(body))
            .await
            .map(|Json(response)| response)
    }

    fn send_body(conversation_id: Option<Uuid>, content: Option<&str>) -> PostMessageBody {
        PostMessageBody {
            token: Some(TOKEN.into()),
            conversation_id,
            content: content.map(str::to_owned),
            visitor_info: None,
            visitor_id: Some("visitor-42".into()),
            correlation_id: None,
        }
    }

    #[tokio::test]
    async fn config_requires_and_validates_token() {
        let state = state();
        let missing = widget_config_handler(Extension(Arc::clone(&state)), token_query(None))
            .await
            .unwrap_err();
        assert_eq!(missing, StatusCode::BAD_REQUEST);

        let unknown =
            widget_config_handler(Extension(Arc::clone(&state)), token_query(Some("nope")))
                .await
                .unwrap_err();
        assert_eq!(unknown, StatusCode::NOT_FOUND);

        let Json(config) = widget_config_handler(Extension(state), token_query(Some(TOKEN)))
            .await
            .unwrap();
        assert_eq!(config.inbox_name, "Soporte");
    }

    #[tokio::test]
    async fn get_without_conversation_returns_empty_list() {
        let state = state();
        let Json(response) = list_messages_handler(
            Extension(state),
            Query(MessagesQuery {
                token: Some(TOKEN.into()),
                conversation_id: None,
                last_message_id: None,
            }),
        )
        .await
        .unwrap();
        assert!(response.messages.is_empty());
    }

    #[tokio::test]
    async fn post_creates_conversation_and_get_returns_the_message() {
        let state = state();
        let response = post_message(&state, send_body(None, Some("Hola, necesito ayuda")))
            .await
            .unwrap();
        assert!(response.success);
        assert_eq!(response.message.status, MessageStatus::Sent);
        assert!(response.ai_response.is_some());

        let Json(listing) = list_messages_handler(
            Extension(Arc::clone(&state)),
            Query(MessagesQuery {
                token: Some(TOKEN.into()),
                conversation_id: Some(response.conversation_id),
                last_message_id: None,
            }),
        )
        .await
        .unwrap();
        // The visitor message plus the automated greeting.
        assert_eq!(listing.messages.len(), 2);
        assert_eq!(
            listing.messages[0].content.as_deref(),
            Some("Hola, necesito ayuda")
        );
        assert_eq!(listing.messages[1].sender.kind, SenderKind::Automated);
    }

    #[tokio::test]
    async fn greeting_fires_only_on_first_contact() {
        let state = state();
        let first = post_message(&state, send_body(None, Some("primera")))
            .await
            .unwrap();
        assert!(first.ai_response.is_some());

        let second = post_message(
            &state,
            send_body(Some(first.conversation_id), Some("segunda")),
        )
        .await
        .unwrap();
        assert!(second.ai_response.is_none());
    }

    #[tokio::test]
    async fn post_validates_token_and_content() {
        let state = state();
        let mut body = send_body(None, Some("hola"));
        body.token = None;
        assert_eq!(
            post_message(&state, body).await.unwrap_err(),
            StatusCode::BAD_REQUEST
        );

        let mut body = send_body(None, Some("hola"));
        body.token = Some("nope".into());
        assert_eq!(
            post_message(&state, body).await.unwrap_err(),
            StatusCode::NOT_FOUND
        );

        assert_eq!(
            post_message(&state, send_body(None, Some("   ")))
                .await
                .unwrap_err(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            post_message(&state, send_body(None, None)).await.unwrap_err(),
            StatusCode::BAD_REQUEST
        );
    }

    #[tokio::test]
    async fn existence_probe_distinguishes_known_and_stale_ids() {
        let state = state();
        let created = post_message(&state, send_body(None, Some("hola")))
            .await
            .unwrap();

        let ok = conversation_probe_handler(
            Extension(Arc::clone(&state)),
            Query(ConversationProbeQuery {
                token: Some(TOKEN.into()),
                conversation_id: Some(created.conversation_id),
            }),
        )
        .await
        .unwrap();
        assert_eq!(ok, StatusCode::NO_CONTENT);

        let stale = conversation_probe_handler(
            Extension(state),
            Query(ConversationProbeQuery {
                token: Some(TOKEN.into()),
                conversation_id: Some(Uuid::new_v4()),
            }),
        )
        .await
        .unwrap_err();
        assert_eq!(stale, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn visitor_lookup_finds_the_open_conversation() {
        let state = state();
        let created = post_message(&state, send_body(None, Some("hola")))
            .await
            .unwrap();

        let Json(found) = visitor_conversation_handler(
            Extension(Arc::clone(&state)),
            Query(VisitorConversationQuery {
                token: Some(TOKEN.into()),
                visitor_id: Some("visitor-42".into()),
            }),
        )
        .await
        .unwrap();
        assert_eq!(found.conversation_id, created.conversation_id);

        let none = visitor_conversation_handler(
            Extension(state),
            Query(VisitorConversationQuery {
                token: Some(TOKEN.into()),
                visitor_id: Some("someone-else".into()),
            }),
        )
        .await
        .unwrap_err();
        assert_eq!(none, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn status_webhook_404s_on_unknown_external_id() {
        let state = state();
        let err = provider_status_handler(
            Extension(state),
            Json(odm_dispatch::StatusUpdate {
                provider: Provider::WhatsApp,
                external_id: "wamid.unknown".into(),
                status: odm_dispatch::CallbackStatus::Delivered,
                read_at: None,
                reason: None,
            }),
        )
        .await
        .unwrap_err();
        assert_eq!(err, StatusCode::NOT_FOUND);
    }
}
