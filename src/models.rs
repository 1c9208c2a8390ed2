use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::AppConfig;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct CompletionRequest {
    pub model: String,
    pub prompt: String,
    pub system_instruction: Option<String>,
    pub temperature: Option<f32>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct CompletionResponse {
    pub text: Option<String>,
    pub model: String,
}

#[derive(Debug, Error)]
pub enum CompletionError {
    #[error("no API credential configured")]
    MissingCredential,
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("completion service returned {status}: {body}")]
    Status { status: reqwest::StatusCode, body: String },
    #[error("unreadable completion response: {0}")]
    Decode(#[from] serde_json::Error),
}

#[async_trait]
pub trait CompletionService: Send + Sync {
    fn is_configured(&self) -> bool;
    async fn generate(&self, req: CompletionRequest) -> Result<CompletionResponse, CompletionError>;
}

#[derive(Clone)]
pub struct GeminiClient {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

impl GeminiClient {
    pub fn new(base_url: impl Into<String>, api_key: Option<String>) -> Self {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_default();
        Self { client, base_url: base_url.into(), api_key }
    }

    pub fn from_config(cfg: &AppConfig) -> Self {
        Self::new(cfg.base_url.clone(), cfg.api_key.clone())
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateContentRequest<'a> {
    contents: Vec<Content<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<Content<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    generation_config: Option<GenerationConfig>,
}

#[derive(Debug, Serialize)]
struct Content<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    role: Option<&'a str>,
    parts: Vec<PartOut<'a>>,
}

#[derive(Debug, Serialize)]
struct PartOut<'a> {
    text: &'a str,
}

#[derive(Debug, Serialize)]
struct GenerationConfig {
    temperature: f32,
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct GenerateContentResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    #[serde(default)]
    model_version: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    #[serde(default)]
    content: Option<CandidateContent>,
}

#[derive(Debug, Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<PartIn>,
}

#[derive(Debug, Deserialize)]
struct PartIn {
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    thought: bool,
}

impl GenerateContentResponse {
    fn text(&self) -> Option<String> {
        let parts = &self.candidates.first()?.content.as_ref()?.parts;
        let text: String = parts
            .iter()
            .filter(|p| !p.thought)
            .filter_map(|p| p.text.as_deref())
            .collect();
        Some(text).filter(|t| !t.trim().is_empty())
    }
}

#[async_trait]
impl CompletionService for GeminiClient {
    fn is_configured(&self) -> bool {
        self.api_key.as_deref().is_some_and(|k| !k.is_empty())
    }

    async fn generate(&self, req: CompletionRequest) -> Result<CompletionResponse, CompletionError> {
        let key = self.api_key.as_deref().filter(|k| !k.is_empty()).ok_or(CompletionError::MissingCredential)?;
        let url = format!("{}/models/{}:generateContent", self.base_url.trim_end_matches('/'), req.model);
        let body = GenerateContentRequest {
            contents: vec![Content { role: Some("user"), parts: vec![PartOut { text: &req.prompt }] }],
            system_instruction: req
                .system_instruction
                .as_deref()
                .map(|s| Content { role: None, parts: vec![PartOut { text: s }] }),
            generation_config: req.temperature.map(|temperature| GenerationConfig { temperature }),
        };
        tracing::debug!(model = %req.model, "calling generateContent");
        let resp = self.client.post(url).header("x-goog-api-key", key).json(&body).send().await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(CompletionError::Status { status, body });
        }
        let raw = resp.text().await?;
        let v: GenerateContentResponse = serde_json::from_str(&raw)?;
        Ok(CompletionResponse { text: v.text(), model: v.model_version.clone().unwrap_or(req.model) })
    }
}
