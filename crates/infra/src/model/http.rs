//! JSON-over-HTTP model endpoint.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use conduit_pipeline::stages::History;
use conduit_pipeline::{InboundMessage, MessageKind, ModelCall, ModelOutput, PipelineContext, StageError};

/// Body posted to the model endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelRequest {
    pub event_id: String,
    pub conversation_id: String,
    pub kind: MessageKind,
    pub text: String,
    pub history: Vec<HistoryTurn>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryTurn {
    pub user: String,
    pub assistant: String,
}

impl ModelRequest {
    pub fn from_context(ctx: &PipelineContext) -> Result<Self, StageError> {
        let message = match ctx.get::<InboundMessage>() {
            Some(message) => message.clone(),
            None => InboundMessage::decode(ctx.event().payload())?,
        };
        let history = ctx
            .get::<History>()
            .map(|h| {
                h.0.iter()
                    .map(|t| HistoryTurn {
                        user: t.user_text.clone(),
                        assistant: t.reply_text.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default();

        Ok(Self {
            event_id: ctx.event_id().to_string(),
            conversation_id: message.conversation_id,
            kind: message.kind,
            text: message.text,
            history,
        })
    }
}

#[derive(Debug, Deserialize)]
struct ModelResponse {
    text: String,
}

/// Posts a [`ModelRequest`] and expects `{"text": "..."}` back.
#[derive(Debug, Clone)]
pub struct HttpModelCall {
    client: reqwest::Client,
    url: String,
}

impl HttpModelCall {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl ModelCall for HttpModelCall {
    async fn call(&self, ctx: &PipelineContext) -> Result<ModelOutput, StageError> {
        let request = ModelRequest::from_context(ctx)?;

        let response = self
            .client
            .post(&self.url)
            .json(&request)
            .send()
            .await
            .map_err(|e| StageError::dependency(format!("model request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(StageError::new("model_http", format!("model endpoint returned {status}"))
                .with_metadata("http_status", status.as_u16().to_string()));
        }

        let body: ModelResponse = response
            .json()
            .await
            .map_err(|e| StageError::new("model_response", format!("invalid model response: {e}")))?;
        Ok(ModelOutput::new(body.text))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::StatusCode;
    use axum::routing::post;
    use axum::{Json, Router};
    use chrono::Utc;
    use conduit_core::{Event, EventId};

    async fn serve(app: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}/generate")
    }

    fn ctx() -> PipelineContext {
        let payload = br#"{"conversation_id":"c1","text":"ping"}"#.to_vec();
        PipelineContext::new(Event::new(EventId::new("4-0"), payload, Utc::now()), 1)
    }

    #[tokio::test]
    async fn posts_request_and_reads_text() {
        let app = Router::new().route(
            "/generate",
            post(|Json(req): Json<ModelRequest>| async move {
                Json(serde_json::json!({ "text": format!("{} -> pong", req.text) }))
            }),
        );
        let model = HttpModelCall::new(serve(app).await, Duration::from_secs(5)).unwrap();

        let output = model.call(&ctx()).await.unwrap();
        assert_eq!(output.text, "ping -> pong");
    }

    #[tokio::test]
    async fn non_success_status_is_a_stage_error() {
        let app = Router::new().route("/generate", post(|| async { StatusCode::SERVICE_UNAVAILABLE }));
        let model = HttpModelCall::new(serve(app).await, Duration::from_secs(5)).unwrap();

        let err = model.call(&ctx()).await.unwrap_err();
        assert_eq!(err.kind, "model_http");
        assert_eq!(err.metadata["http_status"], "503");
    }

    #[test]
    fn request_includes_loaded_history() {
        use conduit_pipeline::ConversationTurn;

        let mut ctx = ctx();
        ctx.insert(History(vec![ConversationTurn {
            event_id: EventId::new("1-0"),
            conversation_id: "c1".to_string(),
            user_text: "hi".to_string(),
            reply_text: "hello".to_string(),
            created_at: Utc::now(),
        }]));

        let request = ModelRequest::from_context(&ctx).unwrap();
        assert_eq!(request.conversation_id, "c1");
        assert_eq!(
            request.history,
            vec![HistoryTurn {
                user: "hi".to_string(),
                assistant: "hello".to_string()
            }]
        );
    }
}
