// src/gemini.rs

use crate::config::GeminiConfig;
use crate::error::{ReceiptError, Result};
use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tracing::{info, warn};

/// One request to the document-understanding service.
#[derive(Debug, Clone)]
pub struct VisionRequest<'a> {
    pub data: &'a [u8],
    pub mime_type: &'a str,
    pub prompt: &'a str,
    /// When set, the service is asked for schema-conformant JSON instead of free text.
    pub response_schema: Option<Value>,
}

/// Black-box vision/LLM service: document bytes + instructions in, text out.
#[async_trait]
pub trait VisionService: Send + Sync {
    /// `stage` names the caller for error reporting ("bounding box", "field").
    async fn generate(&self, stage: &'static str, request: VisionRequest<'_>) -> Result<String>;
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateContentRequest {
    contents: Vec<Content>,
    generation_config: GenerationConfig,
}

#[derive(Debug, Serialize)]
struct Content {
    role: &'static str,
    parts: Vec<Part>,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum Part {
    InlineData { inline_data: InlineData },
    Text { text: String },
}

#[derive(Debug, Serialize)]
struct InlineData {
    mime_type: String,
    data: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    temperature: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_mime_type: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_schema: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct GenerateContentResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: Option<CandidateContent>,
    #[serde(rename = "finishReason")]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<ResponsePart>,
}

#[derive(Debug, Deserialize)]
struct ResponsePart {
    text: Option<String>,
}

fn build_request(request: &VisionRequest<'_>) -> GenerateContentRequest {
    let structured = request.response_schema.is_some();
    GenerateContentRequest {
        contents: vec![Content {
            role: "user",
            parts: vec![
                Part::InlineData {
                    inline_data: InlineData {
                        mime_type: request.mime_type.to_string(),
                        data: general_purpose::STANDARD.encode(request.data),
                    },
                },
                Part::Text {
                    text: request.prompt.to_string(),
                },
            ],
        }],
        generation_config: GenerationConfig {
            temperature: 0.0,
            response_mime_type: structured.then_some("application/json"),
            response_schema: request.response_schema.clone(),
        },
    }
}

/// Concatenate the text parts of the first candidate.
fn response_text(response: GenerateContentResponse) -> std::result::Result<String, String> {
    let candidate = response
        .candidates
        .into_iter()
        .next()
        .ok_or("empty response: no candidates")?;
    let text: String = candidate
        .content
        .map(|c| c.parts.into_iter().filter_map(|p| p.text).collect())
        .unwrap_or_default();
    if text.trim().is_empty() {
        return Err(format!(
            "candidate has no text (finish reason: {})",
            candidate.finish_reason.as_deref().unwrap_or("unknown")
        ));
    }
    Ok(text)
}

/// Gemini `generateContent` client. Holds the HTTP client and credentials so
/// callers pass one handle through the pipeline instead of a global.
pub struct GeminiClient {
    http: Client,
    base_url: String,
    model: String,
    api_key: String,
}

impl GeminiClient {
    pub fn new(config: &GeminiConfig) -> Result<Self> {
        let api_key = config.api_key()?;
        let http = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| ReceiptError::Config(format!("failed to build HTTP client: {e}")))?;
        info!(url = %config.base_url, model = %config.model, "Using Gemini backend");
        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            api_key,
        })
    }
}

#[async_trait]
impl VisionService for GeminiClient {
    async fn generate(&self, stage: &'static str, request: VisionRequest<'_>) -> Result<String> {
        let body = build_request(&request);
        let url = format!("{}/models/{}:generateContent", self.base_url, self.model);

        info!(
            stage,
            bytes = request.data.len(),
            mime = request.mime_type,
            structured = request.response_schema.is_some(),
            "Sending document to Gemini"
        );

        let response = self
            .http
            .post(&url)
            .header("x-goog-api-key", &self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| ReceiptError::extraction(stage, format!("service unreachable: {e}")))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            warn!(stage, status = %status, "Gemini returned an error status");
            return Err(ReceiptError::extraction(
                stage,
                format!("Gemini API error {status}: {body}"),
            ));
        }

        let parsed: GenerateContentResponse = response
            .json()
            .await
            .map_err(|e| ReceiptError::extraction(stage, format!("unparsable response: {e}")))?;

        let text = response_text(parsed).map_err(|e| ReceiptError::extraction(stage, e))?;
        info!(stage, chars = text.len(), "Response received from Gemini");
        Ok(text)
    }
}
