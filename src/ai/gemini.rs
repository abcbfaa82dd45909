use reqwest::Client;
use serde_json::{Value, json};
use std::time::Duration;

use super::{ModelError, VisionModel, validate_api_key};
use crate::error::ProcessError;

const SERVICE: &str = "Gemini";
const ENDPOINT: &str = "https://generativelanguage.googleapis.com/v1beta/models";
pub const DEFAULT_MODEL: &str = "gemini-1.5-flash";

pub struct GeminiModel {
    api_key: String,
    model: String,
    client: Client,
}

impl GeminiModel {
    /// Fails with [`ProcessError::Config`] if the key is unusable or the
    /// HTTP client can't be built.
    pub fn new(api_key: &str, model: &str) -> Result<Self, ProcessError> {
        validate_api_key(api_key)?;
        let client = Client::builder()
            .timeout(Duration::from_secs(120))
            .build()
            .map_err(|e| ProcessError::Config(format!("failed to build HTTP client: {e}")))?;
        let model = if model.trim().is_empty() { DEFAULT_MODEL } else { model.trim() };
        Ok(Self {
            api_key: api_key.to_string(),
            model: model.to_string(),
            client,
        })
    }

    fn request_body(prompt: &str, image_base64: &str, mime_type: &str) -> Value {
        json!({
            "contents": [
                {
                    "parts": [
                        { "text": prompt },
                        {
                            "inline_data": {
                                "mime_type": mime_type,
                                "data": image_base64
                            }
                        }
                    ]
                }
            ],
            "generationConfig": {
                "maxOutputTokens": 1000,
                "responseMimeType": "application/json"
            }
        })
    }
}

/// Concatenate the text parts of the first candidate.
fn extract_text(response: &Value) -> Option<String> {
    let parts = response["candidates"][0]["content"]["parts"].as_array()?;
    let text: String = parts
        .iter()
        .filter_map(|p| p["text"].as_str())
        .collect();
    if text.is_empty() { None } else { Some(text) }
}

#[async_trait::async_trait]
impl VisionModel for GeminiModel {
    fn name(&self) -> &str {
        SERVICE
    }

    async fn generate(
        &self,
        prompt: &str,
        image_base64: &str,
        mime_type: &str,
    ) -> Result<Option<String>, ModelError> {
        let url = format!("{ENDPOINT}/{}:generateContent", self.model);

        let resp = self
            .client
            .post(&url)
            .header("x-goog-api-key", &self.api_key)
            .json(&Self::request_body(prompt, image_base64, mime_type))
            .send()
            .await
            .map_err(|source| ModelError::Transport { service: SERVICE, source })?;

        let status = resp.status();
        let text = resp
            .text()
            .await
            .map_err(|source| ModelError::Transport { service: SERVICE, source })?;

        if !status.is_success() {
            return Err(ModelError::Api {
                service: SERVICE,
                status: status.as_u16(),
                body: text,
            });
        }

        let json: Value = serde_json::from_str(&text).map_err(|e| ModelError::Response {
            service: SERVICE,
            detail: e.to_string(),
        })?;

        if let Some(reason) = json["promptFeedback"]["blockReason"].as_str() {
            log::warn!("  Gemini blocked the request: {reason}");
        }

        Ok(extract_text(&json))
    }
}
