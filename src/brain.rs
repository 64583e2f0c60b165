use std::future::Future;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;

use crate::config::AgentConfig;
use crate::credentials::CredentialStore;
use crate::error::AgentError;
use crate::types::LogEntry;

const SYSTEM_INSTRUCTION: &str = r#"You are a browser automation agent. You see a screenshot of the current page and decide the next actions that move toward the user's goal.

Reply with ONLY a JSON object, no markdown, no explanation:
{"actions":[ ... ], "complete": false}

Available actions:
- {"type":"navigate","url":"https://..."}
- {"type":"click_at","x":500,"y":300}
- {"type":"scroll","delta_y":600}
- {"type":"type","text":"search query"}
- {"type":"wait","ms":1000}
- {"type":"complete"}

Rules:
1. Coordinates for click_at are normalized: x and y range from 0 to 1000 across the screenshot's width and height, regardless of its pixel size.
2. type appends text to the currently focused field. Click the field first.
3. Return at most a few actions per reply; you will get a fresh screenshot afterwards.
4. When the goal is achieved, return {"actions":[{"type":"complete"}],"complete":true}.
5. Never guess credentials or payment details."#;

/// One HTTP exchange with the decision engine.
#[derive(Debug, Clone)]
pub struct TransportReply {
    pub status: u16,
    pub body: Value,
}

#[async_trait]
pub trait EngineTransport: Send + Sync {
    async fn post_json(&self, url: &str, api_key: &str, body: &Value) -> Result<TransportReply, AgentError>;
    async fn get_json(&self, url: &str, api_key: &str) -> Result<TransportReply, AgentError>;
}

pub struct HttpTransport {
    client: Client,
}

impl HttpTransport {
    pub fn new() -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(120))
            .connect_timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self { client })
    }

    async fn reply(response: reqwest::Response) -> Result<TransportReply, AgentError> {
        let status = response.status().as_u16();
        let text = response
            .text()
            .await
            .map_err(|e| AgentError::Network(e.to_string()))?;
        let body = serde_json::from_str(&text).unwrap_or(Value::String(text));
        Ok(TransportReply { status, body })
    }
}

#[async_trait]
impl EngineTransport for HttpTransport {
    async fn post_json(&self, url: &str, api_key: &str, body: &Value) -> Result<TransportReply, AgentError> {
        let response = self
            .client
            .post(url)
            .header("x-goog-api-key", api_key)
            .json(body)
            .send()
            .await
            .map_err(|e| AgentError::Network(e.to_string()))?;
        Self::reply(response).await
    }

    async fn get_json(&self, url: &str, api_key: &str) -> Result<TransportReply, AgentError> {
        let response = self
            .client
            .get(url)
            .header("x-goog-api-key", api_key)
            .send()
            .await
            .map_err(|e| AgentError::Network(e.to_string()))?;
        Self::reply(response).await
    }
}

/// A model as advertised by the engine's model listing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelInfo {
    pub name: String,
    pub generates_content: bool,
}

impl ModelInfo {
    pub fn is_capable(&self) -> bool {
        self.generates_content && !self.name.to_lowercase().contains("embedding")
    }
}

/// First preferred capable model, else the first capable one, else the first listed.
pub fn pick_default_model(models: &[ModelInfo], preference: &[String]) -> Option<String> {
    let capable: Vec<&ModelInfo> = models.iter().filter(|m| m.is_capable()).collect();
    preference
        .iter()
        .find_map(|wanted| {
            capable
                .iter()
                .find(|m| m.name == *wanted || m.name.starts_with(&format!("{wanted}-")))
                .map(|m| m.name.clone())
        })
        .or_else(|| capable.first().map(|m| m.name.clone()))
        .or_else(|| models.first().map(|m| m.name.clone()))
}

/// The decision engine: turns (goal, recent log, screenshot) into raw model text.
pub struct Brain {
    transport: Arc<dyn EngineTransport>,
    credentials: Arc<dyn CredentialStore>,
    credential_key: String,
    api_base: String,
    preference: Vec<String>,
    model: RwLock<Option<String>>,
    max_attempts: u32,
    initial_backoff: Duration,
}

impl Brain {
    pub fn new(
        transport: Arc<dyn EngineTransport>,
        credentials: Arc<dyn CredentialStore>,
        config: &AgentConfig,
    ) -> Self {
        Self {
            transport,
            credentials,
            credential_key: config.credential_key.clone(),
            api_base: config.api_base.trim_end_matches('/').to_string(),
            preference: config.model_preference.clone(),
            model: RwLock::new(config.model.clone()),
            max_attempts: config.max_attempts.max(1),
            initial_backoff: config.initial_backoff(),
        }
    }

    pub fn model(&self) -> Option<String> {
        self.model.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Takes effect on the next request; a call already in flight keeps its model.
    pub fn set_model(&self, model: impl Into<String>) {
        let model = model.into();
        let model = model.trim().trim_start_matches("models/").to_string();
        *self.model.write().unwrap_or_else(|e| e.into_inner()) = Some(model);
    }

    pub fn credentials(&self) -> &Arc<dyn CredentialStore> {
        &self.credentials
    }

    pub fn credential_key(&self) -> &str {
        &self.credential_key
    }

    fn api_key(&self) -> Result<String, AgentError> {
        self.credentials
            .load(&self.credential_key)
            .filter(|k| !k.trim().is_empty())
            .ok_or_else(|| AgentError::MissingCredential {
                key: self.credential_key.clone(),
            })
    }

    fn active_model(&self) -> String {
        self.model()
            .or_else(|| self.preference.first().cloned())
            .unwrap_or_else(|| "gemini-2.0-flash".to_string())
    }

    pub async fn generate_actions(
        &self,
        goal: &str,
        context: &[LogEntry],
        image_base64: &str,
        cancel: &CancellationToken,
    ) -> Result<String, AgentError> {
        let api_key = self.api_key()?;
        let model = self.active_model();
        let url = format!("{}/models/{}:generateContent", self.api_base, model);
        let body = request_body(goal, context, image_base64);

        tracing::debug!("requesting actions from {model}");
        let reply = self
            .with_retry(cancel, || self.transport.post_json(&url, &api_key, &body))
            .await?;
        candidate_text(&reply.body)
    }

    /// All models the engine lists, capable or not.
    pub async fn fetch_models(&self) -> Result<Vec<ModelInfo>, AgentError> {
        let api_key = self.api_key()?;
        let url = format!("{}/models?pageSize=1000", self.api_base);
        let cancel = CancellationToken::new();
        let reply = self
            .with_retry(&cancel, || self.transport.get_json(&url, &api_key))
            .await?;

        let models = reply
            .body
            .get("models")
            .and_then(Value::as_array)
            .ok_or_else(|| AgentError::MalformedReply("model listing has no 'models'".to_string()))?;

        Ok(models
            .iter()
            .filter_map(|m| {
                let name = m.get("name")?.as_str()?;
                let generates_content = m
                    .get("supportedGenerationMethods")
                    .and_then(Value::as_array)
                    .is_some_and(|methods| {
                        methods.iter().any(|v| v.as_str() == Some("generateContent"))
                    });
                Some(ModelInfo {
                    name: name.trim_start_matches("models/").to_string(),
                    generates_content,
                })
            })
            .collect())
    }

    /// Names of models that can generate content.
    pub async fn list_models(&self) -> Result<Vec<String>, AgentError> {
        Ok(self
            .fetch_models()
            .await?
            .into_iter()
            .filter(ModelInfo::is_capable)
            .map(|m| m.name)
            .collect())
    }

    /// Select a default model from the engine's listing. Returns the chosen name.
    pub async fn select_default_model(&self) -> Result<Option<String>, AgentError> {
        let models = self.fetch_models().await?;
        let picked = pick_default_model(&models, &self.preference);
        if let Some(name) = &picked {
            self.set_model(name.clone());
        }
        Ok(picked)
    }

    /// Retries HTTP 429 and 5xx with doubling backoff; anything else is returned as is.
    async fn with_retry<F, Fut>(
        &self,
        cancel: &CancellationToken,
        mut call: F,
    ) -> Result<TransportReply, AgentError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<TransportReply, AgentError>>,
    {
        let mut backoff = self.initial_backoff;
        let mut attempt = 0;

        loop {
            attempt += 1;
            if cancel.is_cancelled() {
                return Err(AgentError::Cancelled);
            }

            let reply = tokio::select! {
                _ = cancel.cancelled() => return Err(AgentError::Cancelled),
                reply = call() => reply?,
            };

            if (200..300).contains(&reply.status) {
                return Ok(reply);
            }
            if !AgentError::is_retryable_status(reply.status) {
                return Err(AgentError::Status {
                    status: reply.status,
                    message: error_message(&reply.body),
                });
            }
            if attempt >= self.max_attempts {
                return Err(AgentError::RateLimited {
                    status: reply.status,
                    attempts: attempt,
                });
            }

            tracing::warn!(
                "decision engine returned HTTP {} (attempt {}/{}), retrying in {:?}",
                reply.status,
                attempt,
                self.max_attempts,
                backoff
            );
            tokio::select! {
                _ = cancel.cancelled() => return Err(AgentError::Cancelled),
                _ = tokio::time::sleep(backoff) => {}
            }
            backoff *= 2;
        }
    }
}

fn request_body(goal: &str, context: &[LogEntry], image_base64: &str) -> Value {
    let mut prompt = format!("Goal: {goal}\n\nRecent activity:\n");
    if context.is_empty() {
        prompt.push_str("- none yet\n");
    }
    for entry in context {
        prompt.push_str(&format!("- [{}] {}\n", entry.kind.as_str(), entry.message));
    }
    prompt.push_str("\nThe screenshot shows the current page. What are the next actions?");

    json!({
        "systemInstruction": { "parts": [{ "text": SYSTEM_INSTRUCTION }] },
        "contents": [{
            "role": "user",
            "parts": [
                { "text": prompt },
                { "inlineData": { "mimeType": "image/png", "data": image_base64 } }
            ]
        }],
        "generationConfig": {
            "temperature": 0.2,
            "responseMimeType": "application/json"
        }
    })
}

fn candidate_text(body: &Value) -> Result<String, AgentError> {
    let parts = body["candidates"][0]["content"]["parts"].as_array();
    let text: String = parts
        .map(|parts| {
            parts
                .iter()
                .filter_map(|p| p.get("text").and_then(Value::as_str))
                .collect()
        })
        .unwrap_or_default();

    if text.trim().is_empty() {
        let reason = body["promptFeedback"]["blockReason"]
            .as_str()
            .map(|r| format!("blocked: {r}"))
            .unwrap_or_else(|| "no candidate text".to_string());
        return Err(AgentError::MalformedReply(reason));
    }
    Ok(text)
}

fn error_message(body: &Value) -> String {
    body["error"]["message"]
        .as_str()
        .map(str::to_string)
        .unwrap_or_else(|| match body {
            Value::String(s) => s.chars().take(200).collect(),
            other => other.to_string(),
        })
}
