//! Reqwest-backed implementation of the message-send surface.

use std::sync::Arc;

use async_trait::async_trait;
use reqwest::Client;

use super::{
    AccessProvider, ApiError, ChunkKind, MessageReceipt, MessagingApi, OutboundMessage,
    ReplyTarget, StreamChunk, StreamReceipt,
};

pub struct HttpMessagingApi {
    http: Client,
    base_url: String,
    access: Arc<dyn AccessProvider>,
}

impl HttpMessagingApi {
    pub fn new(http: Client, base_url: String, access: Arc<dyn AccessProvider>) -> Self {
        Self {
            http,
            base_url,
            access,
        }
    }

    fn messages_url(&self, target: &ReplyTarget) -> String {
        match target {
            ReplyTarget::Direct { open_id } => {
                format!("{}/v2/users/{open_id}/messages", self.base_url)
            }
            ReplyTarget::Group { group_open_id } => {
                format!("{}/v2/groups/{group_open_id}/messages", self.base_url)
            }
            ReplyTarget::Channel { channel_id } => {
                format!("{}/channels/{channel_id}/messages", self.base_url)
            }
        }
    }

    async fn post_message(&self, target: &ReplyTarget, body: &SendRequest<'_>) -> Result<SendResponse, ApiError> {
        let token = self.access.token().await?;
        let response = self
            .http
            .post(self.messages_url(target))
            .header("Authorization", format!("Bot {token}"))
            .json(body)
            .send()
            .await?;

        let status = response.status();
        if status.as_u16() == 429 {
            let retry_after_seconds = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse().ok());
            return Err(ApiError::RateLimited {
                retry_after_seconds,
            });
        }
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(ApiError::Api {
                status: status.as_u16(),
                message,
            });
        }

        Ok(response.json().await?)
    }
}

#[async_trait]
impl MessagingApi for HttpMessagingApi {
    async fn send_reply(
        &self,
        target: &ReplyTarget,
        reply_to: &str,
        message: &OutboundMessage,
    ) -> Result<MessageReceipt, ApiError> {
        let body = SendRequest {
            content: &message.content,
            msg_id: Some(reply_to),
            image: message.image_url.as_deref(),
            stream: None,
        };
        let response = self.post_message(target, &body).await?;
        Ok(MessageReceipt {
            message_id: response.id,
        })
    }

    async fn send_proactive(
        &self,
        target: &ReplyTarget,
        message: &OutboundMessage,
    ) -> Result<MessageReceipt, ApiError> {
        let body = SendRequest {
            content: &message.content,
            msg_id: None,
            image: message.image_url.as_deref(),
            stream: None,
        };
        let response = self.post_message(target, &body).await?;
        Ok(MessageReceipt {
            message_id: response.id,
        })
    }

    async fn send_stream_chunk(
        &self,
        target: &ReplyTarget,
        reply_to: &str,
        chunk: &StreamChunk,
    ) -> Result<StreamReceipt, ApiError> {
        let body = SendRequest {
            content: &chunk.content,
            msg_id: Some(reply_to),
            image: None,
            stream: Some(StreamField {
                state: match chunk.kind {
                    ChunkKind::Content => "delta",
                    ChunkKind::KeepAlive => "keepalive",
                    ChunkKind::Done => "done",
                },
                index: chunk.index,
                id: chunk.stream_id.as_deref(),
            }),
        };
        let response = self.post_message(target, &body).await?;

        // The first chunk's receipt carries the server-assigned stream id;
        // later receipts echo the one we sent.
        let stream_id = response
            .stream_id
            .or_else(|| chunk.stream_id.clone())
            .unwrap_or(response.id);
        Ok(StreamReceipt { stream_id })
    }

    fn supports_streaming(&self, target: &ReplyTarget) -> bool {
        // Guild channels render full messages only; the chunked stream is a
        // c2c/group transport feature.
        !matches!(target, ReplyTarget::Channel { .. })
    }
}

// ============================================================================
// Request/Response Types
// ============================================================================

#[derive(serde::Serialize)]
struct SendRequest<'a> {
    content: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    msg_id: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    image: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream: Option<StreamField<'a>>,
}

#[derive(serde::Serialize)]
struct StreamField<'a> {
    state: &'a str,
    index: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    id: Option<&'a str>,
}

#[derive(serde::Deserialize)]
struct SendResponse {
    id: String,
    #[serde(default)]
    stream_id: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    struct StaticAccess;

    #[async_trait]
    impl AccessProvider for StaticAccess {
        async fn token(&self) -> Result<String, ApiError> {
            Ok("tok".to_string())
        }
        async fn gateway_url(&self) -> Result<String, ApiError> {
            Ok("wss://gw.relay.example".to_string())
        }
        async fn force_refresh(&self) {}
    }

    fn api() -> HttpMessagingApi {
        HttpMessagingApi::new(
            Client::new(),
            "https://api.relay.example".to_string(),
            Arc::new(StaticAccess),
        )
    }

    #[test]
    fn message_urls_per_target() {
        let api = api();
        assert_eq!(
            api.messages_url(&ReplyTarget::Direct {
                open_id: "u1".into()
            }),
            "https://api.relay.example/v2/users/u1/messages"
        );
        assert_eq!(
            api.messages_url(&ReplyTarget::Group {
                group_open_id: "g1".into()
            }),
            "https://api.relay.example/v2/groups/g1/messages"
        );
        assert_eq!(
            api.messages_url(&ReplyTarget::Channel {
                channel_id: "c1".into()
            }),
            "https://api.relay.example/channels/c1/messages"
        );
    }

    #[test]
    fn channels_do_not_stream() {
        let api = api();
        assert!(api.supports_streaming(&ReplyTarget::Direct {
            open_id: "u1".into()
        }));
        assert!(api.supports_streaming(&ReplyTarget::Group {
            group_open_id: "g1".into()
        }));
        assert!(!api.supports_streaming(&ReplyTarget::Channel {
            channel_id: "c1".into()
        }));
    }

    #[test]
    fn stream_request_serializes_state() {
        let body = SendRequest {
            content: "hi",
            msg_id: Some("m1"),
            image: None,
            stream: Some(StreamField {
                state: "delta",
                index: 2,
                id: Some("st-1"),
            }),
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["stream"]["state"], "delta");
        assert_eq!(json["stream"]["index"], 2);
        assert_eq!(json["stream"]["id"], "st-1");
        assert!(json.get("image").is_none());
    }
}
