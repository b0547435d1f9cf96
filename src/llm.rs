//! Language-model backend for the planning stage
//!
//! The LLM is confined to planning and never touches numeric computation;
//! quant values come exclusively from the sandbox and providers. The
//! backend is mandatory: a job submitted without one fails fast with a
//! fatal configuration error.

use crate::error::OrchestrationError;
use crate::Result;
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{error, info};

/// Minimal completion interface the Plan stage depends on.
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Whether the backend can actually serve requests.
    fn configured(&self) -> bool;

    async fn generate(&self, prompt: &str) -> Result<String>;
}

/// Reusable Gemini client (connection-pooled)
pub struct GeminiClient {
    client: Client,
    api_key: String,
    base_url: String,
}

impl GeminiClient {
    pub fn new(api_key: String) -> Self {
        let client = Client::builder()
            .pool_idle_timeout(Duration::from_secs(90))
            .pool_max_idle_per_host(8)
            .timeout(Duration::from_secs(30))
            .build()
            .expect("failed to build HTTP client");

        Self {
            client,
            api_key,
            base_url: "https://generativelanguage.googleapis.com/v1beta/models/gemini-2.0-flash:generateContent".to_string(),
        }
    }

    pub fn from_env() -> Self {
        Self::new(std::env::var("GEMINI_API_KEY").unwrap_or_default())
    }
}

#[async_trait]
impl LlmClient for GeminiClient {
    fn configured(&self) -> bool {
        !self.api_key.trim().is_empty()
    }

    async fn generate(&self, prompt: &str) -> Result<String> {
        if !self.configured() {
            return Err(OrchestrationError::FatalConfig(
                "GEMINI_API_KEY not configured".to_string(),
            ));
        }

        let url = format!("{}?key={}", self.base_url, self.api_key);

        let request = GeminiRequest {
            contents: vec![Content {
                parts: vec![Part {
                    text: prompt.to_string(),
                }],
            }],
            generation_config: GenerationConfig {
                temperature: 0.2,
                top_p: 0.9,
                top_k: 40,
                max_output_tokens: 1024,
            },
        };

        info!("Calling Gemini API");

        let response = self
            .client
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                error!("Gemini API request failed: {}", e);
                OrchestrationError::Llm(format!("Gemini API error: {}", e))
            })?;

        if !response.status().is_success() {
            let error_text = response.text().await.unwrap_or_default();
            error!("Gemini API error response: {}", error_text);
            return Err(OrchestrationError::Llm(format!(
                "Gemini API error: {}",
                error_text
            )));
        }

        let gemini_response: GeminiResponse = response.json().await.map_err(|e| {
            error!("Failed to parse Gemini response: {}", e);
            OrchestrationError::Llm(format!("Gemini parse error: {}", e))
        })?;

        gemini_response
            .candidates
            .first()
            .and_then(|c| c.content.parts.first())
            .map(|p| p.text.clone())
            .ok_or_else(|| OrchestrationError::Llm("Empty response from Gemini".to_string()))
    }
}

#[derive(Debug, Serialize)]
struct GeminiRequest {
    contents: Vec<Content>,
    generation_config: GenerationConfig,
}

#[derive(Debug, Serialize, Deserialize)]
struct Content {
    parts: Vec<Part>,
}

#[derive(Debug, Serialize, Deserialize)]
struct Part {
    text: String,
}

#[derive(Debug, Serialize)]
struct GenerationConfig {
    temperature: f32,
    top_p: f32,
    top_k: i32,
    max_output_tokens: i32,
}

#[derive(Debug, Deserialize)]
struct GeminiResponse {
    candidates: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: Content,
}

/// Scripted backend for tests and the one-shot demo: returns canned
/// responses in order, then repeats the last one.
pub struct ScriptedLlm {
    responses: std::sync::Mutex<Vec<String>>,
}

impl ScriptedLlm {
    pub fn new(responses: Vec<String>) -> Self {
        Self {
            responses: std::sync::Mutex::new(responses),
        }
    }

    pub fn single(response: impl Into<String>) -> Self {
        Self::new(vec![response.into()])
    }
}

#[async_trait]
impl LlmClient for ScriptedLlm {
    fn configured(&self) -> bool {
        true
    }

    async fn generate(&self, _prompt: &str) -> Result<String> {
        let mut responses = self
            .responses
            .lock()
            .map_err(|_| OrchestrationError::Llm("scripted responses poisoned".to_string()))?;
        if responses.len() > 1 {
            Ok(responses.remove(0))
        } else {
            responses
                .first()
                .cloned()
                .ok_or_else(|| OrchestrationError::Llm("no scripted response".to_string()))
        }
    }
}
