use reqwest::Client;
use serde_json::{Value, json};
use std::time::Duration;

use super::{ModelError, VisionModel, validate_api_key};
use crate::error::ProcessError;

const SERVICE: &str = "OpenAI";
const ENDPOINT: &str = "https://api.openai.com/v1/chat/completions";
pub const DEFAULT_MODEL: &str = "gpt-4o-mini";

pub struct OpenAiModel {
    api_key: String,
    model: String,
    client: Client,
}

impl OpenAiModel {
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

    fn request_body(&self, prompt: &str, image_base64: &str, mime_type: &str) -> Value {
        json!({
            "model": self.model,
            "messages": [
                {
                    "role": "system",
                    "content": "You are an image metadata assistant. You MUST respond with a single valid JSON object only."
                },
                {
                    "role": "user",
                    "content": [
                        {
                            "type": "text",
                            "text": prompt
                        },
                        {
                            "type": "image_url",
                            "image_url": {
                                "url": format!("data:{mime_type};base64,{image_base64}"),
                                "detail": "low"
                            }
                        }
                    ]
                }
            ],
            "max_tokens": 1000,
            "response_format": { "type": "json_object" }
        })
    }
}

#[async_trait::async_trait]
impl VisionModel for OpenAiModel {
    fn name(&self) -> &str {
        SERVICE
    }

    async fn generate(
        &self,
        prompt: &str,
        image_base64: &str,
        mime_type: &str,
    ) -> Result<Option<String>, ModelError> {
        let resp = self
            .client
            .post(ENDPOINT)
            .bearer_auth(&self.api_key)
            .json(&self.request_body(prompt, image_base64, mime_type))
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

        Ok(json["choices"][0]["message"]["content"]
            .as_str()
            .map(String::from))
    }
}
