//! Typed client for the widget gateway surface, plus the transport-level
//! error taxonomy.

use async_trait::async_trait;
use futures::{StreamExt, stream::BoxStream};
use metrics::counter;
use reqwest::{Client, StatusCode, Url};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use odm_core::Message;

use crate::sse::{SseParser, StreamEvent};

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("widget api configuration error")]
    Config(#[source] anyhow::Error),
    #[error("widget api transport error")]
    Transport(#[source] reqwest::Error),
    #[error("widget api remote error (status {status}): {message}")]
    Remote { status: StatusCode, message: String },
    #[error("widget api response decode error")]
    Decode(#[source] anyhow::Error),
    #[error("widget client is shut down")]
    Closed,
}

impl ClientError {
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            ClientError::Remote {
                status: StatusCode::NOT_FOUND,
                ..
            }
        )
    }
}

/// Welcome copy returned by the gateway; fetching it doubles as the
/// connectivity probe.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct WidgetConfig {
    pub inbox_name: String,
    pub welcome_title: String,
    pub welcome_tagline: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct SendMessageRequest {
    pub conversation_id: Option<Uuid>,
    pub visitor_id: String,
    pub content: String,
    pub correlation_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SendResponse {
    pub success: bool,
    pub message: Message,
    pub conversation_id: Uuid,
    pub ai_response: Option<String>,
}

pub type EventStream = BoxStream<'static, Result<StreamEvent, ClientError>>;

#[async_trait]
pub trait WidgetApi: Send + Sync {
    async fn fetch_config(&self) -> Result<WidgetConfig, ClientError>;

    /// Lightweight existence probe; a stale id resolves to `Ok(false)`.
    async fn conversation_exists(&self, conversation_id: Uuid) -> Result<bool, ClientError>;

    async fn visitor_conversation(&self, visitor_id: &str)
    -> Result<Option<Uuid>, ClientError>;

    async fn fetch_messages(
        &self,
        conversation_id: Uuid,
        last_message_id: Option<Uuid>,
    ) -> Result<Vec<Message>, ClientError>;

    async fn send_message(&self, request: SendMessageRequest)
    -> Result<SendResponse, ClientError>;

    /// Opens the push stream for one conversation.
    async fn open_stream(&self, conversation_id: Uuid) -> Result<EventStream, ClientError>;
}

pub struct HttpWidgetApi {
    client: Client,
    base_url: Url,
    token: String,
}

impl HttpWidgetApi {
    pub fn new(client: Client, base_url: &str, token: &str) -> Result<Self, ClientError> {
        let mut url = Url::parse(base_url).map_err(|err| ClientError::Config(err.into()))?;
        if !base_url.ends_with('/') {
            url = url
                .join("./")
                .map_err(|err| ClientError::Config(err.into()))?;
        }
        Ok(Self {
            client,
            base_url: url,
            token: token.to_string(),
        })
    }

    fn endpoint(&self, path: &str) -> Result<Url, ClientError> {
        self.base_url
            .join(path)
            .map_err(|err| ClientError::Config(err.into()))
    }
}

async fn map_response<T>(
    endpoint: &'static str,
    response: reqwest::Response,
) -> Result<T, ClientError>
where
    T: for<'de> Deserialize<'de>,
{
    let status = response.status();
    if !status.is_success() {
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| "<unreadable>".into());
        counter!(
            "widget_api_errors_total",
            "kind" => "remote",
            "endpoint" => endpoint
        )
        .increment(1);
        return Err(ClientError::Remote {
            status,
            message: if body.len() > 512 {
                body[..512].to_string()
            } else {
                body
            },
        });
    }

    response.json::<T>().await.map_err(|err| {
        counter!(
            "widget_api_errors_total",
            "kind" => "decode",
            "endpoint" => endpoint
        )
        .increment(1);
        ClientError::Decode(err.into())
    })
}

fn transport(endpoint: &'static str, err: reqwest::Error) -> ClientError {
    counter!(
        "widget_api_errors_total",
        "kind" => "transport",
        "endpoint" => endpoint
    )
    .increment(1);
    ClientError::Transport(err)
}

#[derive(Debug, Deserialize)]
struct MessagesEnvelope {
    messages: Vec<Message>,
}

#[derive(Debug, Deserialize)]
struct VisitorConversationEnvelope {
    conversation_id: Uuid,
}

#[async_trait]
impl WidgetApi for HttpWidgetApi {
    async fn fetch_config(&self) -> Result<WidgetConfig, ClientError> {
        let url = self.endpoint("widget/config")?;
        let response = self
            .client
            .get(url)
            .query(&[("token", self.token.as_str())])
            .send()
            .await
            .map_err(|err| transport("config", err))?;
        map_response("config", response).await
    }

    async fn conversation_exists(&self, conversation_id: Uuid) -> Result<bool, ClientError> {
        let url = self.endpoint("widget/conversation")?;
        let response = self
            .client
            .get(url)
            .query(&[
                ("token", self.token.as_str()),
                ("conversation_id", &conversation_id.to_string()),
            ])
            .send()
            .await
            .map_err(|err| transport("conversation_probe", err))?;
        match response.status() {
            StatusCode::NO_CONTENT => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            status => {
                let message = response
                    .text()
                    .await
                    .unwrap_or_else(|_| "<unreadable>".into());
                Err(ClientError::Remote { status, message })
            }
        }
    }

    async fn visitor_conversation(
        &self,
        visitor_id: &str,
    ) -> Result<Option<Uuid>, ClientError> {
        let url = self.endpoint("widget/visitor_conversation")?;
        let response = self
            .client
            .get(url)
            .query(&[("token", self.token.as_str()), ("visitor_id", visitor_id)])
            .send()
            .await
            .map_err(|err| transport("visitor_conversation", err))?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        map_response::<VisitorConversationEnvelope>("visitor_conversation", response)
            .await
            .map(|envelope| Some(envelope.conversation_id))
    }

    async fn fetch_messages(
        &self,
        conversation_id: Uuid,
        last_message_id: Option<Uuid>,
    ) -> Result<Vec<Message>, ClientError> {
        let url = self.endpoint("widget/messages")?;
        let mut query = vec![
            ("token", self.token.clone()),
            ("conversation_id", conversation_id.to_string()),
        ];
        if let Some(last) = last_message_id {
            query.push(("last_message_id", last.to_string()));
        }
        let response = self
            .client
            .get(url)
            .query(&query)
            .send()
            .await
            .map_err(|err| transport("messages", err))?;
        map_response::<MessagesEnvelope>("messages", response)
            .await
            .map(|envelope| envelope.messages)
    }

    async fn send_message(
        &self,
        request: SendMessageRequest,
    ) -> Result<SendResponse, ClientError> {
        let url = self.endpoint("widget/messages")?;
        let body = serde_json::json!({
            "token": self.token,
            "conversation_id": request.conversation_id,
            "content": request.content,
            "visitor_id": request.visitor_id,
            "correlation_id": request.correlation_id,
        });
        let response = self
            .client
            .post(url)
            .json(&body)
            .send()
            .await
            .map_err(|err| transport("send", err))?;
        map_response("send", response).await
    }

    async fn open_stream(&self, conversation_id: Uuid) -> Result<EventStream, ClientError> {
        let url = self.endpoint("widget/stream")?;
        let response = self
            .client
            .get(url)
            .query(&[
                ("token", self.token.as_str()),
                ("conversation_id", &conversation_id.to_string()),
            ])
            .send()
            .await
            .map_err(|err| transport("stream", err))?;
        let status = response.status();
        if !status.is_success() {
            let message = response
                .text()
                .await
                .unwrap_or_else(|_| "<unreadable>".into());
            return Err(ClientError::Remote { status, message });
        }

        let mut chunks = response.bytes_stream();
        let stream = async_stream::stream! {
            let mut parser = SseParser::new();
            while let Some(chunk) = chunks.next().await {
                match chunk {
                    Ok(chunk) => {
                        for payload in parser.push(&chunk) {
                            match serde_json::from_str::<StreamEvent>(&payload) {
                                Ok(event) => yield Ok(event),
                                Err(err) => {
                                    tracing::warn!("undecodable stream payload: {err}");
                                }
                            }
                        }
                    }
                    Err(err) => {
                        yield Err(ClientError::Transport(err));
                        break;
                    }
                }
            }
        };
        Ok(stream.boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_url_normalization_keeps_joins_stable() {
        let api = HttpWidgetApi::new(Client::new(), "http://localhost:8090", "tok").unwrap();
        assert_eq!(
            api.endpoint("widget/config").unwrap().as_str(),
            "http://localhost:8090/widget/config"
        );

        let api = HttpWidgetApi::new(Client::new(), "http://localhost:8090/", "tok").unwrap();
        assert_eq!(
            api.endpoint("widget/stream").unwrap().as_str(),
            "http://localhost:8090/widget/stream"
        );
    }

    #[test]
    fn not_found_detection() {
        let err = ClientError::Remote {
            status: StatusCode::NOT_FOUND,
            message: "gone".into(),
        };
        assert!(err.is_not_found());
        assert!(!ClientError::Closed.is_not_found());
    }
}
