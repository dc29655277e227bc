// agent-chat/crates/agent-chat/src/client/mod.rs
//! Typed client for the chat backend.
//!
//! Token lifecycle lives in an explicit [`TokenSession`] owned by the
//! [`ApiClient`], with time supplied by a [`Clock`] so refresh timing can be
//! driven from tests.

pub mod sse;
pub mod token_session;

pub use sse::SseDecoder;
pub use token_session::{Clock, ManualClock, SystemClock, TokenSession};

use chrono::{DateTime, Utc};
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::pin::Pin;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{Mutex, MutexGuard};
use tracing::debug;

use crate::config::ModelInfo;
use crate::events::{ChatEvent, EventDecodeError};

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("server returned {status}: {message}")]
    Api { status: u16, message: String },
    #[error("not logged in")]
    NotAuthenticated,
    #[error("invalid token: {0}")]
    InvalidToken(String),
    #[error("unknown event type `{0}`")]
    UnknownEvent(String),
    #[error("failed to decode event: {0}")]
    Decode(#[from] EventDecodeError),
}

pub type ChatEventStream = Pin<Box<dyn Stream<Item = Result<ChatEvent, ClientError>> + Send>>;

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    refresh_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ModelsResponse {
    models: Vec<ModelInfo>,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SessionInfo {
    pub id: i64,
    pub title: Option<String>,
    pub model_id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
struct ChatStreamBody<'a> {
    session_id: i64,
    message: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    model_id: Option<&'a str>,
    files: &'a [i64],
}

pub struct ApiClient {
    base_url: String,
    http: reqwest::Client,
    session: Mutex<TokenSession>,
}

impl ApiClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_clock(base_url, Arc::new(SystemClock))
    }

    pub fn with_clock(base_url: impl Into<String>, clock: Arc<dyn Clock>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            http: reqwest::Client::new(),
            session: Mutex::new(TokenSession::new(clock)),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    pub async fn is_authenticated(&self) -> bool {
        self.session.lock().await.is_authenticated()
    }

    pub async fn logout(&self) {
        self.session.lock().await.clear();
    }

    pub async fn login(&self, username: &str, password: &str) -> Result<(), ClientError> {
        let response = self
            .http
            .post(self.url("/api/auth/login"))
            .json(&serde_json::json!({ "username": username, "password": password }))
            .send()
            .await?;
        let tokens: TokenResponse = check(response).await?.json().await?;
        self.session
            .lock()
            .await
            .set_tokens(tokens.access_token, tokens.refresh_token)
    }

    /// Exchanges the refresh token for a new access token.
    pub async fn refresh(&self) -> Result<(), ClientError> {
        let mut session = self.session.lock().await;
        self.refresh_locked(&mut session).await
    }

    async fn refresh_locked(&self, session: &mut MutexGuard<'_, TokenSession>) -> Result<(), ClientError> {
        if !session.can_refresh() {
            session.clear();
            return Err(ClientError::NotAuthenticated);
        }
        let refresh_token = session.refresh_token().unwrap_or_default().to_string();
        let response = self
            .http
            .post(self.url("/api/auth/refresh"))
            .bearer_auth(refresh_token)
            .send()
            .await?;
        let response = match check(response).await {
            Ok(response) => response,
            Err(err) => {
                if matches!(err, ClientError::Api { status: 401, .. }) {
                    session.clear();
                }
                return Err(err);
            }
        };
        let tokens: TokenResponse = response.json().await?;
        session.set_tokens(tokens.access_token, tokens.refresh_token)?;
        debug!("Access token refreshed");
        Ok(())
    }

    /// Current access token, refreshed first when it is about to expire.
    async fn access_token(&self) -> Result<String, ClientError> {
        let mut session = self.session.lock().await;
        if session.needs_refresh() {
            self.refresh_locked(&mut session).await?;
        }
        session
            .access_token()
            .map(str::to_string)
            .ok_or(ClientError::NotAuthenticated)
    }

    pub async fn list_models(&self) -> Result<Vec<ModelInfo>, ClientError> {
        let token = self.access_token().await?;
        let response = self
            .http
            .get(self.url("/api/models"))
            .bearer_auth(token)
            .send()
            .await?;
        let body: ModelsResponse = check(response).await?.json().await?;
        Ok(body.models)
    }

    pub async fn create_session(&self, title: Option<&str>, model_id: &str) -> Result<SessionInfo, ClientError> {
        let token = self.access_token().await?;
        let response = self
            .http
            .post(self.url("/api/sessions"))
            .bearer_auth(token)
            .json(&serde_json::json!({ "title": title, "model_id": model_id }))
            .send()
            .await?;
        Ok(check(response).await?.json().await?)
    }

    /// Starts a chat turn and yields its events as they arrive.
    pub async fn chat_stream(
        &self,
        session_id: i64,
        message: &str,
        model_id: Option<&str>,
        files: &[i64],
    ) -> Result<ChatEventStream, ClientError> {
        let token = self.access_token().await?;
        let response = self
            .http
            .post(self.url("/api/chat/stream"))
            .bearer_auth(token)
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .json(&ChatStreamBody {
                session_id,
                message,
                model_id,
                files,
            })
            .send()
            .await?;
        let byte_stream = check(response).await?.bytes_stream();

        Ok(Box::pin(async_stream::stream! {
            let mut decoder = SseDecoder::new();
            futures::pin_mut!(byte_stream);
            while let Some(chunk) = byte_stream.next().await {
                match chunk {
                    Ok(bytes) => {
                        for event in decoder.push(&bytes) {
                            yield event;
                        }
                    }
                    Err(e) => {
                        yield Err(ClientError::Http(e));
                        return;
                    }
                }
            }
            if let Some(event) = decoder.finish() {
                yield event;
            }
        }))
    }
}

/// Turns a non-2xx response into [`ClientError::Api`].
async fn check(response: reqwest::Response) -> Result<reqwest::Response, ClientError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let text = response.text().await.unwrap_or_default();
    let message = serde_json::from_str::<ErrorBody>(&text)
        .map(|body| body.error)
        .unwrap_or(text);
    Err(ClientError::Api {
        status: status.as_u16(),
        message,
    })
}
