//! Chat backends behind the capability-checked [`ChatBackend`] trait.
//!
//! | Provider | Backend | Available |
//! |---|---|---|
//! | `ollama`, `openai` | [`OpenAiCompatChat`] (`/v1/chat/completions`) | yes |
//! | `gemini`, `claude`, `qwen` | [`UnwiredChat`] | no |
//! | anything else | [`StubChat`] (echo) | yes |
//!
//! Callers check [`ChatBackend::is_available`] first and fall back to
//! [`StubChat`] instead of catching a runtime failure.
//!
//! # Example
//!
//! ```rust,no_run
//! use so100_runtime::chat::{ChatConfig, ChatMessage, build_chat};
//!
//! # async fn demo() {
//! let backend = build_chat(&ChatConfig::default());
//! let reply = backend.chat(&[ChatMessage::user("what do you see?")]).await;
//! # }
//! ```

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

/// Prepended as a system message when the caller supplies none.
pub const SYSTEM_PROMPT: &str = "\
You are the assistant of an SO100 robot arm demo. The operator can start or \
stop the camera stream and ask the arm to search for and grasp an object. \
Answer briefly and never claim to have moved the arm yourself.";

/// Upper bound on one completion request, connect to last body byte.
pub const DEFAULT_CHAT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Error, Debug)]
pub enum ChatError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Unexpected response format: {0}")]
    BadResponse(String),

    #[error("{0} backend is not wired up")]
    Unavailable(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }
}

#[async_trait]
pub trait ChatBackend: Send + Sync {
    fn name(&self) -> &str;

    fn is_available(&self) -> bool;

    /// Reply to the conversation so far.
    async fn chat(&self, messages: &[ChatMessage]) -> Result<String, ChatError>;
}

// ─────────────────────────────────────────────────────────────────────────────
// StubChat
// ─────────────────────────────────────────────────────────────────────────────

/// Echoes the last user message. Needs no network.
#[derive(Debug, Clone, Copy, Default)]
pub struct StubChat;

impl StubChat {
    pub fn reply_to(text: &str) -> String {
        format!("[STUB LLM] I received: '{text}'. Configure a real LLM to get meaningful answers.")
    }
}

#[async_trait]
impl ChatBackend for StubChat {
    fn name(&self) -> &str {
        "stub"
    }

    fn is_available(&self) -> bool {
        true
    }

    async fn chat(&self, messages: &[ChatMessage]) -> Result<String, ChatError> {
        let last_user = messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(|m| m.content.as_str())
            .unwrap_or_default();
        Ok(Self::reply_to(last_user))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// UnwiredChat
// ─────────────────────────────────────────────────────────────────────────────

/// A known provider this build has no client for.
#[derive(Debug, Clone)]
pub struct UnwiredChat {
    provider: String,
}

impl UnwiredChat {
    pub fn new(provider: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
        }
    }
}

#[async_trait]
impl ChatBackend for UnwiredChat {
    fn name(&self) -> &str {
        &self.provider
    }

    fn is_available(&self) -> bool {
        false
    }

    async fn chat(&self, _: &[ChatMessage]) -> Result<String, ChatError> {
        Err(ChatError::Unavailable(self.provider.clone()))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// OpenAiCompatChat
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Serialize)]
struct CompletionRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    stream: bool,
}

#[derive(Deserialize)]
struct CompletionResponse {
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ChatMessage,
}

/// Client for any OpenAI-compatible `/v1/chat/completions` endpoint, such as
/// a local Ollama server.
pub struct OpenAiCompatChat {
    provider: String,
    base_url: String,
    model: String,
    api_key: Option<String>,
    timeout: Duration,
    client: reqwest::Client,
}

impl OpenAiCompatChat {
    pub fn new(provider: impl Into<String>, base_url: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            model: model.into(),
            api_key: None,
            timeout: DEFAULT_CHAT_TIMEOUT,
            client: reqwest::Client::new(),
        }
    }

    pub fn with_api_key(mut self, key: Option<String>) -> Self {
        self.api_key = key;
        self
    }

    /// A request still pending after `timeout` fails with [`ChatError::Http`].
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn endpoint(&self) -> String {
        format!("{}/v1/chat/completions", self.base_url)
    }

    fn with_system_prompt(messages: &[ChatMessage]) -> Vec<ChatMessage> {
        let mut out = messages.to_vec();
        if !out.iter().any(|m| m.role == Role::System) {
            out.insert(0, ChatMessage::system(SYSTEM_PROMPT));
        }
        out
    }
}

#[async_trait]
impl ChatBackend for OpenAiCompatChat {
    fn name(&self) -> &str {
        &self.provider
    }

    fn is_available(&self) -> bool {
        true
    }

    async fn chat(&self, messages: &[ChatMessage]) -> Result<String, ChatError> {
        let messages = Self::with_system_prompt(messages);
        let body = CompletionRequest {
            model: &self.model,
            messages: &messages,
            stream: false,
        };
        let mut request = self.client.post(self.endpoint()).timeout(self.timeout).json(&body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }
        let response: CompletionResponse = request.send().await?.error_for_status()?.json().await?;

        response
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| ChatError::BadResponse("empty choices array".into()))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Factory
// ─────────────────────────────────────────────────────────────────────────────

/// Chat provider selection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChatConfig {
    pub provider: String,
    pub model: String,
    pub base_url: String,
    /// Name of the environment variable holding the API key, if any.
    pub api_key_env: Option<String>,
    pub timeout_ms: u64,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            provider: "stub".to_string(),
            model: "llama3".to_string(),
            base_url: "http://localhost:11434".to_string(),
            api_key_env: None,
            timeout_ms: DEFAULT_CHAT_TIMEOUT.as_millis() as u64,
        }
    }
}

/// Build the backend named by `config.provider` (case-insensitive).
pub fn build_chat(config: &ChatConfig) -> Arc<dyn ChatBackend> {
    let provider = config.provider.trim().to_lowercase();
    match provider.as_str() {
        "ollama" | "openai" => {
            let api_key = config.api_key_env.as_deref().and_then(|var| {
                let key = std::env::var(var).ok();
                if key.is_none() {
                    warn!(var, "chat API key variable is not set");
                }
                key
            });
            info!(
                provider = %provider,
                model = %config.model,
                base_url = %config.base_url,
                timeout_ms = config.timeout_ms,
                "chat backend"
            );
            Arc::new(
                OpenAiCompatChat::new(provider.clone(), config.base_url.clone(), config.model.clone())
                    .with_api_key(api_key)
                    .with_timeout(Duration::from_millis(config.timeout_ms)),
            )
        }
        "gemini" | "claude" | "qwen" => {
            warn!(provider = %provider, "chat provider not wired up; replies will come from the stub");
            Arc::new(UnwiredChat::new(provider))
        }
        _ => Arc::new(StubChat),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(provider: &str) -> ChatConfig {
        ChatConfig {
            provider: provider.to_string(),
            ..ChatConfig::default()
        }
    }

    #[tokio::test]
    async fn stub_echoes_the_last_user_message() {
        let reply = StubChat
            .chat(&[
                ChatMessage::user("first"),
                ChatMessage::system("ignored"),
                ChatMessage::user("what do you see?"),
            ])
            .await
            .unwrap();
        assert_eq!(
            reply,
            "[STUB LLM] I received: 'what do you see?'. Configure a real LLM to get meaningful answers."
        );
    }

    #[tokio::test]
    async fn stub_without_user_message_echoes_empty_text() {
        let reply = StubChat.chat(&[]).await.unwrap();
        assert!(reply.contains("I received: ''"));
    }

    #[test]
    fn factory_selects_backend_by_provider() {
        assert_eq!(build_chat(&config("stub")).name(), "stub");
        assert_eq!(build_chat(&config("anything")).name(), "stub");

        let ollama = build_chat(&config("Ollama"));
        assert_eq!(ollama.name(), "ollama");
        assert!(ollama.is_available());

        for provider in ["gemini", "claude", "qwen"] {
            let backend = build_chat(&config(provider));
            assert_eq!(backend.name(), provider);
            assert!(!backend.is_available());
        }
    }

    #[tokio::test]
    async fn unwired_backend_reports_unavailable() {
        let err = UnwiredChat::new("claude")
            .chat(&[ChatMessage::user("hi")])
            .await
            .unwrap_err();
        assert!(matches!(err, ChatError::Unavailable(p) if p == "claude"));
    }

    #[test]
    fn system_prompt_is_prepended_only_when_missing() {
        let with = OpenAiCompatChat::with_system_prompt(&[ChatMessage::user("hi")]);
        assert_eq!(with[0].role, Role::System);
        assert_eq!(with[0].content, SYSTEM_PROMPT);

        let own = [ChatMessage::system("custom"), ChatMessage::user("hi")];
        let kept = OpenAiCompatChat::with_system_prompt(&own);
        assert_eq!(kept, own.to_vec());
    }

    #[test]
    fn endpoint_tolerates_trailing_slash() {
        let chat = OpenAiCompatChat::new("ollama", "http://localhost:11434/", "llama3");
        assert_eq!(chat.endpoint(), "http://localhost:11434/v1/chat/completions");
    }

    #[test]
    fn role_serializes_lowercase() {
        let json = serde_json::to_string(&ChatMessage::user("x")).unwrap();
        assert_eq!(json, r#"{"role":"user","content":"x"}"#);
    }

    #[test]
    fn timeout_defaults_to_thirty_seconds() {
        assert_eq!(ChatConfig::default().timeout_ms, 30_000);
        let chat = OpenAiCompatChat::new("ollama", "http://localhost:11434", "llama3");
        assert_eq!(chat.timeout(), DEFAULT_CHAT_TIMEOUT);
    }

    #[tokio::test]
    async fn silent_server_times_out_instead_of_hanging() {
        // Accepts the connection, reads the request, never answers.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((stream, _)) = listener.accept().await {
                held.push(stream);
            }
        });

        let chat = OpenAiCompatChat::new("ollama", format!("http://{addr}"), "llama3")
            .with_timeout(Duration::from_millis(200));
        let outcome = tokio::time::timeout(Duration::from_secs(5), chat.chat(&[ChatMessage::user("hi")]))
            .await
            .expect("chat request must give up on its own");
        match outcome {
            Err(ChatError::Http(e)) => assert!(e.is_timeout(), "unexpected error: {e}"),
            other => panic!("expected a timeout, got {other:?}"),
        }
    }
}
