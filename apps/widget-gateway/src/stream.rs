//! Per-conversation SSE push stream.
//!
//! One connection per conversation. The stream opens with a `connected`
//! handshake, relays every append as a `message` event, and emits a typed
//! `ping` heartbeat so clients can distinguish a quiet conversation from a
//! dead connection. A lagged subscriber is not fatal: clients deduplicate by
//! id and catch up through the transcript fetch.

use std::convert::Infallible;
use std::time::Duration;

use axum::{
    extract::{Extension, Query},
    http::StatusCode,
    response::sse::{Event, Sse},
};
use futures::{Stream, StreamExt};
use metrics::counter;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use uuid::Uuid;

use odm_core::{Message, MessageStore};

use crate::SharedGatewayState;
use crate::routes::{map_store_error, resolve_widget};

/// Heartbeat cadence on an otherwise quiet stream.
pub const PING_INTERVAL: Duration = Duration::from_secs(30);

/// Wire events emitted on the push stream.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StreamEvent {
    Connected,
    Ping,
    Message { message: Message },
}

#[doc(hidden)]
#[derive(Debug, Deserialize)]
pub struct StreamQuery {
    #[serde(default)]
    token: Option<String>,
    #[serde(default)]
    conversation_id: Option<Uuid>,
}

pub async fn stream_handler(
    Extension(state): Extension<SharedGatewayState>,
    Query(query): Query<StreamQuery>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, StatusCode> {
    resolve_widget(&state, query.token.as_deref())?;
    let conversation_id = query.conversation_id.ok_or(StatusCode::BAD_REQUEST)?;
    let receiver = state
        .dispatcher
        .store()
        .subscribe(conversation_id)
        .await
        .map_err(map_store_error)?;

    counter!("widget_stream_connections_total").increment(1);
    let stream = live_events(receiver).map(|event| Ok::<Event, Infallible>(sse_event(&event)));
    Ok(Sse::new(stream))
}

/// The typed event sequence for one subscription: handshake, appends, and
/// heartbeats, ending when the conversation's broadcaster closes.
pub(crate) fn live_events(
    mut receiver: broadcast::Receiver<Message>,
) -> impl Stream<Item = StreamEvent> {
    async_stream::stream! {
        yield StreamEvent::Connected;
        let mut ping = tokio::time::interval(PING_INTERVAL);
        // Consume the interval's immediate first tick.
        ping.tick().await;
        loop {
            tokio::select! {
                _ = ping.tick() => yield StreamEvent::Ping,
                received = receiver.recv() => match received {
                    Ok(message) => yield StreamEvent::Message { message },
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "stream subscriber lagged");
                        continue;
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        }
    }
}

fn sse_event(event: &StreamEvent) -> Event {
    match Event::default().json_data(event) {
        Ok(event) => event,
        Err(err) => {
            tracing::warn!("failed to serialize stream event: {err}");
            Event::default().comment("serialization-error")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use odm_core::{InMemoryMessageStore, NewMessage, SenderRef};

    #[test]
    fn events_serialize_to_the_wire_shape() {
        let connected = serde_json::to_value(StreamEvent::Connected).unwrap();
        assert_eq!(connected["type"], "connected");

        let ping = serde_json::to_value(StreamEvent::Ping).unwrap();
        assert_eq!(ping["type"], "ping");
    }

    #[tokio::test]
    async fn handshake_then_live_messages() {
        let store = InMemoryMessageStore::new();
        let conversation = store
            .find_or_create_conversation("v-1", None, None)
            .await
            .unwrap();
        let receiver = store.subscribe(conversation.id).await.unwrap();
        let mut events = Box::pin(live_events(receiver));

        let first = tokio::time::timeout(Duration::from_secs(1), events.next())
            .await
            .expect("handshake arrives")
            .unwrap();
        assert_eq!(first, StreamEvent::Connected);

        store
            .create_message(
                conversation.id,
                NewMessage::pending_text(SenderRef::agent("agent-1"), "respuesta"),
            )
            .await
            .unwrap();

        let second = tokio::time::timeout(Duration::from_secs(1), events.next())
            .await
            .expect("message arrives")
            .unwrap();
        match second {
            StreamEvent::Message { message } => {
                assert_eq!(message.content.as_deref(), Some("respuesta"));
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }
}
