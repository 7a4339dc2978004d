use std::time::Duration;

use anyhow::{bail, Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use reqwest::blocking::Client as HttpClient;
use reqwest::header::CONTENT_TYPE;
use serde_json::{json, Map, Value};
use sifter_contracts::chat::render_transcript;
use sifter_contracts::providers::{NamedProvider, ProviderRegistry};
use sifter_contracts::{DetectedBox, SifterError, SifterResult};
use tracing::debug;

use crate::config::DetectorConfig;
use crate::region::{DetectionKind, DetectionRequest, DetectionResponse, RegionDetector};
use crate::text::{error_chain_text, extract_json_object_from_text, response_json_or_error, truncate_text};

pub const GEMINI_PROVIDER: &str = "gemini";
pub const OPENAI_PROVIDER: &str = "openai";
pub const DRYRUN_PROVIDER: &str = "dryrun";

pub const DRYRUN_REPLY: &str =
    "Dry run: no detection model was called, so nothing will be replaced.";

const MAX_OUTPUT_TOKENS: u64 = 512;

pub type DetectorRegistry = ProviderRegistry<Box<dyn RegionDetector>>;

pub fn default_detector_registry(config: &DetectorConfig) -> DetectorRegistry {
    let mut registry: DetectorRegistry = ProviderRegistry::default();
    registry.register(Box::new(GeminiDetector::new(config)));
    registry.register(Box::new(OpenAiDetector::new(config)));
    registry.register(Box::new(DryrunDetector));
    registry
}

/// Nothing is retried; the flattened chain is what the caller sees.
fn collaborator_error(err: anyhow::Error) -> SifterError {
    SifterError::ExternalCollaborator(error_chain_text(&err, 600))
}

pub struct GeminiDetector {
    api_base: String,
    api_key: Option<String>,
    timeout: Duration,
    http: HttpClient,
}

impl GeminiDetector {
    pub fn new(config: &DetectorConfig) -> Self {
        Self {
            api_base: config.gemini_api_base.clone(),
            api_key: config.gemini_api_key.clone(),
            timeout: config.request_timeout,
            http: HttpClient::new(),
        }
    }

    fn endpoint_for_model(&self, model: &str) -> String {
        let trimmed = model.trim();
        let model_path = if trimmed.starts_with("models/") {
            trimmed.to_string()
        } else {
            format!("models/{trimmed}")
        };
        format!("{}/{}:generateContent", self.api_base, model_path)
    }

    fn build_payload(request: &DetectionRequest<'_>) -> Value {
        json!({
            "contents": [{
                "role": "user",
                "parts": [
                    {
                        "inlineData": {
                            "mimeType": request.image.mime_type,
                            "data": BASE64.encode(&request.image.bytes),
                        }
                    },
                    { "text": detection_instruction(request) },
                ],
            }],
            "generationConfig": {
                "responseMimeType": "application/json",
                "temperature": 0,
            },
        })
    }

    fn extract_text(response: &Value) -> String {
        let mut parts: Vec<String> = Vec::new();
        let candidates = response
            .get("candidates")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        for candidate in candidates {
            let rows = candidate
                .get("content")
                .and_then(|content| content.get("parts"))
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default();
            for row in rows {
                if let Some(text) = row.get("text").and_then(Value::as_str) {
                    if !text.trim().is_empty() {
                        parts.push(text.trim().to_string());
                    }
                }
            }
            if !parts.is_empty() {
                break;
            }
        }
        parts.join("\n")
    }

    fn call(&self, request: &DetectionRequest<'_>) -> Result<DetectionResponse> {
        let Some(api_key) = self.api_key.as_deref() else {
            bail!("GEMINI_API_KEY or GOOGLE_API_KEY not set");
        };
        let endpoint = self.endpoint_for_model(request.model);
        debug!(provider = GEMINI_PROVIDER, model = request.model, "requesting detection");
        let response = self
            .http
            .post(&endpoint)
            .query(&[("key", api_key)])
            .timeout(self.timeout)
            .json(&Self::build_payload(request))
            .send()
            .with_context(|| format!("Gemini request failed ({endpoint})"))?;
        let parsed = response_json_or_error("Gemini", response)?;
        let text = Self::extract_text(&parsed);
        if text.is_empty() {
            bail!("Gemini returned no text candidates");
        }
        parse_detection_text(&text, &request.kind)
    }
}

impl NamedProvider for GeminiDetector {
    fn name(&self) -> &str {
        GEMINI_PROVIDER
    }
}

impl RegionDetector for GeminiDetector {
    fn detect(&self, request: &DetectionRequest<'_>) -> SifterResult<DetectionResponse> {
        self.call(request).map_err(collaborator_error)
    }
}

pub struct OpenAiDetector {
    api_base: String,
    api_key: Option<String>,
    timeout: Duration,
    http: HttpClient,
}

impl OpenAiDetector {
    pub fn new(config: &DetectorConfig) -> Self {
        Self {
            api_base: config.openai_api_base.clone(),
            api_key: config.openai_api_key.clone(),
            timeout: config.request_timeout,
            http: HttpClient::new(),
        }
    }

    fn build_payload(request: &DetectionRequest<'_>) -> Value {
        json!({
            "model": request.model,
            "input": [{
                "role": "user",
                "content": [
                    { "type": "input_text", "text": detection_instruction(request) },
                    { "type": "input_image", "image_url": request.image.to_data_uri() },
                ],
            }],
            "max_output_tokens": MAX_OUTPUT_TOKENS,
        })
    }

    fn extract_text(response: &Value) -> String {
        if let Some(text) = response.get("output_text").and_then(Value::as_str) {
            if !text.trim().is_empty() {
                return text.trim().to_string();
            }
        }
        let mut parts: Vec<String> = Vec::new();
        let rows = response
            .get("output")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        for row in rows {
            let content = row
                .get("content")
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default();
            for chunk in content {
                let kind = chunk.get("type").and_then(Value::as_str).unwrap_or_default();
                if !matches!(kind, "output_text" | "text") {
                    continue;
                }
                if let Some(text) = chunk.get("text").and_then(Value::as_str) {
                    if !text.trim().is_empty() {
                        parts.push(text.trim().to_string());
                    }
                }
            }
        }
        parts.join("\n")
    }

    fn call(&self, request: &DetectionRequest<'_>) -> Result<DetectionResponse> {
        let Some(api_key) = self.api_key.as_deref() else {
            bail!("OPENAI_API_KEY not set");
        };
        let endpoint = format!("{}/responses", self.api_base);
        debug!(provider = OPENAI_PROVIDER, model = request.model, "requesting detection");
        let response = self
            .http
            .post(&endpoint)
            .bearer_auth(api_key)
            .header(CONTENT_TYPE, "application/json")
            .timeout(self.timeout)
            .json(&Self::build_payload(request))
            .send()
            .with_context(|| format!("OpenAI request failed ({endpoint})"))?;
        let parsed = response_json_or_error("OpenAI", response)?;
        let text = Self::extract_text(&parsed);
        if text.is_empty() {
            bail!("OpenAI returned no output text");
        }
        parse_detection_text(&text, &request.kind)
    }
}

impl NamedProvider for OpenAiDetector {
    fn name(&self) -> &str {
        OPENAI_PROVIDER
    }
}

impl RegionDetector for OpenAiDetector {
    fn detect(&self, request: &DetectionRequest<'_>) -> SifterResult<DetectionResponse> {
        self.call(request).map_err(collaborator_error)
    }
}

/// Offline detector: never selects a region.
#[derive(Debug, Clone, Copy, Default)]
pub struct DryrunDetector;

impl NamedProvider for DryrunDetector {
    fn name(&self) -> &str {
        DRYRUN_PROVIDER
    }
}

impl RegionDetector for DryrunDetector {
    fn detect(&self, request: &DetectionRequest<'_>) -> SifterResult<DetectionResponse> {
        let reply = match request.kind {
            DetectionKind::Conversation(_) => Some(DRYRUN_REPLY.to_string()),
            _ => None,
        };
        Ok(DetectionResponse {
            region: None,
            reply,
        })
    }
}

const BOX_RULES: &str = "Coordinates are integer pixels of the attached image with the origin at the top-left corner. Return JSON only, no markdown.";

pub(crate) fn detection_instruction(request: &DetectionRequest<'_>) -> String {
    let dims = request.image_dims;
    match request.kind {
        DetectionKind::Prompted(prompt) => format!(
            "You are locating a region to remove from a frame of an animated GIF ({dims} pixels).\n\
             Find the area the user describes and answer with its bounding box as \
             {{\"x\": int, \"y\": int, \"width\": int, \"height\": int}}.\n\
             If nothing matches, answer with width and height 0.\n\
             {BOX_RULES}\n\nUser request: {}",
            prompt.trim()
        ),
        DetectionKind::Automatic => format!(
            "You are locating a region to remove from a frame of an animated GIF ({dims} pixels).\n\
             Find the most prominent logo, watermark, or piece of overlaid text and answer with its \
             bounding box as {{\"x\": int, \"y\": int, \"width\": int, \"height\": int}}.\n\
             If there is no obvious logo or text, answer with width and height 0.\n\
             {BOX_RULES}"
        ),
        DetectionKind::Conversation(messages) => format!(
            "You help a user decide which part of an animated GIF to remove. The attached image is its \
             first frame ({dims} pixels).\n\
             Talk with the user to pin down what they want removed, and ask for confirmation once you \
             are confident.\n\
             Answer with {{\"response\": string, \"boundingBox\": {{\"x\": int, \"y\": int, \
             \"width\": int, \"height\": int}} | null}}.\n\
             Give a boundingBox only after the user has confirmed; otherwise it must be null. If the \
             user changes their mind or the object cannot be found, it must be null.\n\
             Always include a short, friendly response.\n\
             {BOX_RULES}\n\nConversation so far, most recent last:\n{}",
            render_transcript(messages)
        ),
    }
}

/// Reads a detector's JSON answer into a response.
///
/// Box requests accept the four fields at the top level or under
/// `boundingBox`; conversation requests also need a `response` string.
pub(crate) fn parse_detection_text(text: &str, kind: &DetectionKind<'_>) -> Result<DetectionResponse> {
    let Some(object) = extract_json_object_from_text(text) else {
        bail!("detector answer is not a JSON object: {}", truncate_text(text, 200));
    };

    let nested = object
        .get("boundingBox")
        .or_else(|| object.get("bounding_box"));
    let region = match nested {
        Some(Value::Null) => None,
        Some(Value::Object(inner)) => Some(parse_box(inner)?),
        Some(other) => bail!("boundingBox must be an object or null, got {other}"),
        None if matches!(kind, DetectionKind::Conversation(_)) => None,
        None => Some(parse_box(&object)?),
    };

    let reply = match kind {
        DetectionKind::Conversation(_) => {
            let Some(reply) = object
                .get("response")
                .or_else(|| object.get("reply"))
                .and_then(Value::as_str)
                .map(str::trim)
                .filter(|value| !value.is_empty())
            else {
                bail!("detector answer has no 'response' text");
            };
            Some(reply.to_string())
        }
        _ => None,
    };
    Ok(DetectionResponse { region, reply })
}

fn parse_box(object: &Map<String, Value>) -> Result<DetectedBox> {
    let field = |key: &str| -> Result<f64> {
        object
            .get(key)
            .and_then(Value::as_f64)
            .with_context(|| format!("bounding box is missing numeric '{key}'"))
    };
    Ok(DetectedBox::new(
        field("x")?,
        field("y")?,
        field("width")?,
        field("height")?,
    ))
}
