use std::env;
use std::time::Duration;

use sifter_contracts::{ColorSpec, SifterError, SifterResult};

use crate::color_distance::DistanceMetric;

/// NeuQuant sampling factor handed to the GIF encoder (1 best, 30 fastest).
pub const QUANTIZE_SPEED: i32 = 10;
pub const DEFAULT_DETECT_TIMEOUT_S: f64 = 60.0;
pub const DEFAULT_GEMINI_API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta";
pub const DEFAULT_OPENAI_API_BASE: &str = "https://api.openai.com/v1";
/// Longest edge of the still sent for detection when the model does not say.
pub const DEFAULT_PREVIEW_MAX_DIM: u32 = 2048;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncoderConfig {
    pub quantize_speed: i32,
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            quantize_speed: QUANTIZE_SPEED,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct EditConfig {
    /// Fill used by `replace_section` and prompted/automatic replacement.
    pub fill: ColorSpec,
    pub metric: DistanceMetric,
    /// Upper bound on decoded frames; `None` decodes everything.
    pub max_frames: Option<usize>,
    pub encoder: EncoderConfig,
    pub preview_max_dim: u32,
}

impl Default for EditConfig {
    fn default() -> Self {
        Self {
            fill: ColorSpec::WHITE,
            metric: DistanceMetric::default(),
            max_frames: None,
            encoder: EncoderConfig::default(),
            preview_max_dim: DEFAULT_PREVIEW_MAX_DIM,
        }
    }
}

impl EditConfig {
    /// Reads `SIFTER_MAX_FRAMES`, `SIFTER_DISTANCE_METRIC` and
    /// `SIFTER_QUANTIZE_SPEED`. Unset values keep their defaults; values that
    /// are set but unparseable are rejected.
    pub fn from_env() -> SifterResult<Self> {
        let mut config = Self::default();
        if let Some(raw) = non_empty_env("SIFTER_MAX_FRAMES") {
            let parsed = raw.parse::<usize>().map_err(|_| {
                SifterError::MalformedInput(format!("SIFTER_MAX_FRAMES must be an integer, got '{raw}'"))
            })?;
            config.max_frames = (parsed > 0).then_some(parsed);
        }
        if let Some(raw) = non_empty_env("SIFTER_DISTANCE_METRIC") {
            config.metric = raw.parse()?;
        }
        if let Some(raw) = non_empty_env("SIFTER_QUANTIZE_SPEED") {
            let parsed = raw.parse::<i32>().map_err(|_| {
                SifterError::MalformedInput(format!(
                    "SIFTER_QUANTIZE_SPEED must be an integer, got '{raw}'"
                ))
            })?;
            config.encoder.quantize_speed = parsed.clamp(1, 30);
        }
        Ok(config)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DetectorConfig {
    pub gemini_api_base: String,
    pub gemini_api_key: Option<String>,
    pub openai_api_base: String,
    pub openai_api_key: Option<String>,
    pub request_timeout: Duration,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            gemini_api_base: DEFAULT_GEMINI_API_BASE.to_string(),
            gemini_api_key: None,
            openai_api_base: DEFAULT_OPENAI_API_BASE.to_string(),
            openai_api_key: None,
            request_timeout: Duration::from_secs_f64(DEFAULT_DETECT_TIMEOUT_S),
        }
    }
}

impl DetectorConfig {
    pub fn from_env() -> Self {
        let timeout_s = non_empty_env("SIFTER_DETECT_TIMEOUT_S")
            .and_then(|raw| raw.parse::<f64>().ok())
            .filter(|value| value.is_finite())
            .unwrap_or(DEFAULT_DETECT_TIMEOUT_S)
            .clamp(1.0, 600.0);
        Self {
            gemini_api_base: api_base_from_env("GEMINI_API_BASE", DEFAULT_GEMINI_API_BASE),
            gemini_api_key: non_empty_env("GEMINI_API_KEY")
                .or_else(|| non_empty_env("GOOGLE_API_KEY")),
            openai_api_base: api_base_from_env("OPENAI_API_BASE", DEFAULT_OPENAI_API_BASE),
            openai_api_key: non_empty_env("OPENAI_API_KEY"),
            request_timeout: Duration::from_secs_f64(timeout_s),
        }
    }
}

fn api_base_from_env(key: &str, default: &str) -> String {
    non_empty_env(key)
        .map(|value| value.trim_end_matches('/').to_string())
        .unwrap_or_else(|| default.to_string())
}

pub(crate) fn non_empty_env(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}
