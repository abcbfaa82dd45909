mod gemini;
mod openai;
pub mod retry;

pub use gemini::{DEFAULT_MODEL as GEMINI_DEFAULT_MODEL, GeminiModel};
pub use openai::{DEFAULT_MODEL as OPENAI_DEFAULT_MODEL, OpenAiModel};
pub use retry::{RetryPolicy, Sleeper, TokioSleeper};

use base64::Engine;
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;

use crate::config::ModelConfig;
use crate::error::ProcessError;
use crate::pipeline::UploadedImage;

/// Instruction sent with every image.
///
/// Asks for a single JSON object with the five keys [`MetadataRecord`] knows
/// about. Anything else in the answer is ignored.
pub const SYSTEM_PROMPT: &str = r#"You are an expert photo editor preparing images for a press archive.
Look at the attached image and produce IPTC metadata for it.

Return a JSON object with exactly these keys:

- "caption": one or two sentences describing the scene, subjects, and mood
- "keywords": a list of 5-15 short keyword strings
- "byline": the photographer, if a credit or watermark identifies one; otherwise null
- "credit": the agency or organisation to credit, if identifiable; otherwise null
- "source": where the image originates (event, venue, or publication), if identifiable; otherwise null

If people are visible, always include one keyword describing their emotion.

Return ONLY the JSON object. No commentary, no markdown, no code fences."#;

/// Descriptive metadata produced by the model and embedded by the writer.
///
/// Every field is optional. Absent fields are not written, so existing
/// values in the target file survive.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MetadataRecord {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub caption: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub keywords: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub byline: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub credit: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

impl MetadataRecord {
    /// Build a record from a parsed JSON value. Returns `None` if the value
    /// is not an object.
    ///
    /// Text fields must be non-blank strings. `keywords` is normalized to a
    /// list: array elements that are strings, numbers, or booleans are kept
    /// in order; a plain string is split on commas.
    pub fn from_value(value: &serde_json::Value) -> Option<Self> {
        let obj = value.as_object()?;
        Some(Self {
            caption: obj.get("caption").and_then(text_field),
            keywords: obj.get("keywords").and_then(keyword_list),
            byline: obj.get("byline").and_then(text_field),
            credit: obj.get("credit").and_then(text_field),
            source: obj.get("source").and_then(text_field),
        })
    }

    /// True if at least one field is populated.
    pub fn has_any(&self) -> bool {
        self.caption.is_some()
            || self.keywords.is_some()
            || self.byline.is_some()
            || self.credit.is_some()
            || self.source.is_some()
    }
}

fn text_field(value: &serde_json::Value) -> Option<String> {
    let s = value.as_str()?.trim();
    if s.is_empty() { None } else { Some(s.to_string()) }
}

fn keyword_list(value: &serde_json::Value) -> Option<Vec<String>> {
    use serde_json::Value;

    let keywords: Vec<String> = match value {
        Value::Array(items) => items
            .iter()
            .filter_map(|item| match item {
                Value::String(s) => Some(s.trim().to_string()),
                Value::Number(n) => Some(n.to_string()),
                _ => None,
            })
            .filter(|s| !s.is_empty())
            .collect(),
        Value::String(s) => s
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect(),
        _ => Vec::new(),
    };

    if keywords.is_empty() { None } else { Some(keywords) }
}

/// A transport or service failure. These are the errors worth retrying.
#[derive(Debug, Error)]
pub enum ModelError {
    #[error("{service} request failed: {source}")]
    Transport {
        service: &'static str,
        #[source]
        source: reqwest::Error,
    },

    #[error("{service} API error ({status}): {body}")]
    Api {
        service: &'static str,
        status: u16,
        body: String,
    },

    #[error("{service} returned an unreadable response: {detail}")]
    Response {
        service: &'static str,
        detail: String,
    },
}

/// A cloud vision-language model.
///
/// Implementations send one prompt plus one image and hand back whatever text
/// the model produced. `Ok(None)` means the service answered but with no text.
/// Parsing and retrying live in [`Analyzer`], not here.
#[async_trait::async_trait]
pub trait VisionModel: Send + Sync {
    /// Display name, e.g. "Gemini".
    fn name(&self) -> &str;

    async fn generate(
        &self,
        prompt: &str,
        image_base64: &str,
        mime_type: &str,
    ) -> Result<Option<String>, ModelError>;
}

/// Reject API keys that can't possibly work, before anything hits the network.
pub fn validate_api_key(api_key: &str) -> Result<(), ProcessError> {
    if api_key.trim().is_empty() {
        return Err(ProcessError::Config("API key is empty".into()));
    }
    if !api_key.chars().all(|c| c.is_ascii_graphic()) {
        return Err(ProcessError::Config(
            "API key contains whitespace, control, or non-ASCII characters".into(),
        ));
    }
    Ok(())
}

/// Construct the configured provider with the given key.
pub fn build_model(
    config: &ModelConfig,
    api_key: &str,
) -> Result<Box<dyn VisionModel>, ProcessError> {
    match config.provider.to_ascii_lowercase().as_str() {
        "gemini" => Ok(Box::new(GeminiModel::new(api_key, &config.model)?)),
        "openai" => Ok(Box::new(OpenAiModel::new(api_key, &config.model)?)),
        other => Err(ProcessError::Config(format!(
            "unknown model provider \"{other}\" (expected \"gemini\" or \"openai\")"
        ))),
    }
}

/// Base64-encode image bytes for transport.
pub fn encode_image(bytes: &[u8]) -> Result<String, ProcessError> {
    if bytes.is_empty() {
        return Err(ProcessError::Encoding("image is empty".into()));
    }
    Ok(base64::engine::general_purpose::STANDARD.encode(bytes))
}

/// Turn raw model text into a [`MetadataRecord`].
///
/// Strips a surrounding Markdown code fence, removes control and zero-width
/// characters, then parses strictly. Failures here are never retried.
pub fn parse_model_response(text: &str) -> Result<MetadataRecord, ProcessError> {
    let unfenced = strip_code_fence(text.trim());
    let cleaned: String = unfenced.chars().filter(|c| !is_stripped_char(*c)).collect();

    if cleaned.is_empty() {
        return Err(ProcessError::MalformedResponse(
            "response is empty after sanitization".into(),
        ));
    }

    let value: serde_json::Value = serde_json::from_str(&cleaned)
        .map_err(|e| ProcessError::MalformedResponse(format!("invalid JSON: {e}")))?;

    let record = MetadataRecord::from_value(&value)
        .ok_or_else(|| ProcessError::MalformedResponse("expected a JSON object".into()))?;

    if !record.has_any() {
        return Err(ProcessError::MalformedResponse(
            "JSON object has none of caption, keywords, byline, credit, source".into(),
        ));
    }

    Ok(record)
}

fn strip_code_fence(text: &str) -> String {
    if !text.starts_with("```") {
        return text.to_string();
    }

    let mut lines: Vec<&str> = text.lines().collect();
    if lines.first().is_some_and(|l| l.trim().starts_with("```")) {
        lines.remove(0);
    }
    if lines.last().is_some_and(|l| l.trim() == "```") {
        lines.pop();
    }
    lines.join("\n").trim().to_string()
}

/// C0/C1 controls, the U+2000 space block through ZWJ, and the BOM.
fn is_stripped_char(c: char) -> bool {
    matches!(
        c,
        '\u{0000}'..='\u{001F}' | '\u{007F}'..='\u{009F}' | '\u{2000}'..='\u{200D}' | '\u{FEFF}'
    )
}

/// Sends images to a [`VisionModel`] under a [`RetryPolicy`] and parses the answers.
pub struct Analyzer {
    model: Box<dyn VisionModel>,
    policy: RetryPolicy,
    sleeper: Arc<dyn Sleeper>,
}

impl Analyzer {
    pub fn new(model: Box<dyn VisionModel>, policy: RetryPolicy) -> Self {
        Self {
            model,
            policy,
            sleeper: Arc::new(TokioSleeper),
        }
    }

    /// Replace the sleeper used between retries.
    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn model_name(&self) -> &str {
        self.model.name()
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    /// Analyze one uploaded image.
    pub async fn analyze(&self, image: &UploadedImage) -> Result<MetadataRecord, ProcessError> {
        self.analyze_bytes(&image.bytes, image.mime_type()).await
    }

    /// Analyze raw image bytes.
    ///
    /// Transport and service errors are retried per the policy. An empty
    /// answer or unparseable JSON fails on the spot.
    pub async fn analyze_bytes(
        &self,
        image_bytes: &[u8],
        mime_type: &str,
    ) -> Result<MetadataRecord, ProcessError> {
        let image_base64 = encode_image(image_bytes)?;
        let model = self.model.as_ref();
        let encoded: &str = &image_base64;

        let text = self
            .policy
            .run(self.sleeper.as_ref(), move |attempt| {
                log::debug!("  {} attempt {attempt}", model.name());
                model.generate(SYSTEM_PROMPT, encoded, mime_type)
            })
            .await
            .map_err(|e| ProcessError::RetriesExhausted {
                attempts: e.attempts,
                last: e.last.to_string(),
            })?;

        let text = text
            .filter(|t| !t.trim().is_empty())
            .ok_or_else(|| ProcessError::MalformedResponse("model returned no text".into()))?;

        log::debug!("Raw model response:\n{text}");
        parse_model_response(&text)
    }
}
