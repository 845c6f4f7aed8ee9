//! Chat-completions client for OpenAI-compatible vision endpoints.

use std::fmt;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use reqwest::{Client, header};
use serde::Deserialize;
use serde_json::json;

use super::{Analysis, AnalysisError, Analyzer, parse_payload};
use crate::config::Config;

/// Sends one image per request to a chat-completions endpoint.
pub struct VisionClient {
    client: Client,
    api_url: String,
    model: String,
    api_key: Option<String>,
    system_prompt: String,
}

impl fmt::Debug for VisionClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VisionClient")
            .field("api_url", &self.api_url)
            .field("model", &self.model)
            .field("api_key", &self.api_key.as_ref().map(|_| "[REDACTED]"))
            .finish_non_exhaustive()
    }
}

impl VisionClient {
    /// Create a client from configuration.
    ///
    /// The configured `timeout` bounds each request end to end.
    pub fn from_config(config: &Config) -> Result<Self, AnalysisError> {
        let client = Client::builder()
            .timeout(config.request_timeout())
            .build()?;

        Ok(Self {
            client,
            api_url: config.api_url.clone(),
            model: config.model.clone(),
            api_key: config.api_key.clone().filter(|k| !k.trim().is_empty()),
            system_prompt: config.system_prompt.clone(),
        })
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    fn request_body(&self, image: &[u8], media_type: &str, prompt: &str) -> serde_json::Value {
        let data_uri = format!("data:{media_type};base64,{}", STANDARD.encode(image));
        json!({
            "model": self.model,
            "messages": [
                {"role": "system", "content": self.system_prompt},
                {
                    "role": "user",
                    "content": [
                        {"type": "text", "text": prompt},
                        {"type": "image_url", "image_url": {"url": data_uri}},
                    ],
                },
            ],
            "stream": false,
        })
    }

    async fn send(
        &self,
        image: &[u8],
        media_type: &str,
        prompt: &str,
    ) -> Result<Analysis, AnalysisError> {
        let mut request = self
            .client
            .post(&self.api_url)
            .header(
                header::CONTENT_TYPE,
                header::HeaderValue::from_static("application/json"),
            )
            .json(&self.request_body(image, media_type, prompt));
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await?;
        let status = response.status();
        let body = response.text().await?;

        if !status.is_success() {
            return Err(AnalysisError::Status {
                status: status.as_u16(),
                body: truncate(&body, 500),
            });
        }

        let parsed: ChatResponse = serde_json::from_str(&body)
            .map_err(|e| AnalysisError::MalformedResponse(format!("invalid JSON body: {e}")))?;

        let content = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message)
            .and_then(|m| m.content)
            .ok_or_else(|| {
                AnalysisError::MalformedResponse("response has no message content".to_string())
            })?;

        let (short_name, description) = parse_payload(&content)?;
        let model_id = parsed
            .model
            .filter(|m| !m.trim().is_empty())
            .unwrap_or_else(|| self.model.clone());

        Ok(Analysis {
            short_name,
            description,
            model_id,
        })
    }
}

impl Analyzer for VisionClient {
    async fn analyze(
        &self,
        image: &[u8],
        media_type: &str,
        prompt: &str,
    ) -> Result<Analysis, AnalysisError> {
        self.send(image, media_type, prompt).await
    }
}

#[derive(Deserialize)]
struct ChatResponse {
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    #[serde(default)]
    message: Option<Message>,
}

#[derive(Deserialize)]
struct Message {
    #[serde(default)]
    content: Option<String>,
}

fn truncate(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}...", &text[..idx]),
        None => text.to_string(),
    }
}
