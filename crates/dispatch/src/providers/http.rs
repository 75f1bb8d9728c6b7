//! OpenAI-compatible chat-completions provider.

use crate::collaborator::{Capability, Collaborator, CollaboratorId};
use crate::config::CollaboratorSettings;
use crate::error::{ConfigError, DispatchError};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::time::Duration;
use tracing::debug;

const DEFAULT_MODEL: &str = "gpt-4o-mini";

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
}

#[derive(Serialize)]
struct ChatMessage {
    role: &'static str,
    content: String,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    usage: Option<Value>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatResponseMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct ChatResponseMessage {
    content: String,
}

/// Language-model provider reached over HTTP.
///
/// The payload's `prompt` (or the payload itself when it is a string) is sent
/// as the user message; the system message names the provider and the
/// capabilities it serves. The result is
/// `{"content": ..., "model": ..., "finish_reason": ..., "usage": ...}`.
#[derive(Debug, Clone)]
pub struct HttpProvider {
    id: CollaboratorId,
    client: Client,
    endpoint: String,
    model: String,
    api_key: Option<String>,
    capabilities: Vec<Capability>,
    max_tokens: Option<u32>,
    temperature: Option<f32>,
}

impl HttpProvider {
    pub fn new(
        id: CollaboratorId,
        endpoint: impl Into<String>,
        model: impl Into<String>,
        api_key: Option<String>,
    ) -> Result<Self, DispatchError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(120))
            .build()
            .map_err(|e| DispatchError::Transport {
                reason: e.to_string(),
            })?;

        Ok(Self {
            id,
            client,
            endpoint: endpoint.into(),
            model: model.into(),
            api_key,
            capabilities: Vec::new(),
            max_tokens: None,
            temperature: None,
        })
    }

    /// Build from a `[collaborators.<id>]` section; the API key is read from
    /// the variable named by `api_key_env`.
    pub fn from_settings(
        id: CollaboratorId,
        settings: &CollaboratorSettings,
    ) -> Result<Self, ConfigError> {
        let endpoint = settings.endpoint.clone().ok_or_else(|| {
            ConfigError::invalid(format!("collaborators.{}.endpoint", id), "required")
        })?;
        let api_key = match &settings.api_key_env {
            Some(var) => Some(std::env::var(var).map_err(|_| {
                ConfigError::invalid(
                    format!("collaborators.{}.api_key_env", id),
                    format!("environment variable {} is not set", var),
                )
            })?),
            None => None,
        };
        let model = settings
            .model
            .clone()
            .unwrap_or_else(|| DEFAULT_MODEL.to_string());

        let provider = Self::new(id.clone(), endpoint, model, api_key)
            .map_err(|e| ConfigError::invalid(format!("collaborators.{}", id), e.to_string()))?;
        Ok(provider.with_capabilities(
            settings.capabilities.iter().map(|c| Capability::from(c.as_str())),
        ))
    }

    pub fn with_capabilities<I>(mut self, capabilities: I) -> Self
    where
        I: IntoIterator<Item = Capability>,
    {
        self.capabilities = capabilities.into_iter().collect();
        self
    }

    pub fn with_parameters(mut self, max_tokens: Option<u32>, temperature: Option<f32>) -> Self {
        self.max_tokens = max_tokens;
        self.temperature = temperature;
        self
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    fn system_prompt(&self, capability: &Capability) -> String {
        let served: Vec<&str> = self.capabilities.iter().map(|c| c.as_str()).collect();
        if served.is_empty() {
            format!("You are {}. Perform the '{}' task.", self.id, capability)
        } else {
            format!(
                "You are {}, specialised in: {}. Perform the '{}' task.",
                self.id,
                served.join(", "),
                capability
            )
        }
    }

    fn prompt_from(&self, payload: &Value) -> Result<String, DispatchError> {
        match payload {
            Value::String(prompt) => Ok(prompt.clone()),
            Value::Object(map) => map
                .get("prompt")
                .and_then(Value::as_str)
                .map(str::to_string)
                .ok_or_else(|| DispatchError::attempt_failed(&self.id, "payload has no 'prompt'")),
            _ => Err(DispatchError::attempt_failed(
                &self.id,
                "payload must be a string or an object with 'prompt'",
            )),
        }
    }
}

#[async_trait]
impl Collaborator for HttpProvider {
    fn id(&self) -> &CollaboratorId {
        &self.id
    }

    async fn invoke(
        &self,
        capability: &Capability,
        payload: Value,
    ) -> Result<Value, DispatchError> {
        let request = ChatRequest {
            model: &self.model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: self.system_prompt(capability),
                },
                ChatMessage {
                    role: "user",
                    content: self.prompt_from(&payload)?,
                },
            ],
            max_tokens: self.max_tokens,
            temperature: self.temperature,
        };

        let mut builder = self.client.post(&self.endpoint).json(&request);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }

        debug!(
            collaborator = %self.id,
            model = %self.model,
            capability = %capability,
            "Sending chat completion"
        );
        let response = builder.send().await.map_err(|e| DispatchError::Transport {
            reason: e.to_string(),
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(DispatchError::attempt_failed(
                &self.id,
                format!("HTTP {}: {}", status.as_u16(), body),
            ));
        }

        let chat: ChatResponse = response.json().await.map_err(|e| {
            DispatchError::attempt_failed(&self.id, format!("malformed response: {}", e))
        })?;
        let choice = chat
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| DispatchError::attempt_failed(&self.id, "response has no choices"))?;

        Ok(json!({
            "content": choice.message.content,
            "model": chat.model.unwrap_or_else(|| self.model.clone()),
            "finish_reason": choice.finish_reason,
            "usage": chat.usage,
        }))
    }
}
