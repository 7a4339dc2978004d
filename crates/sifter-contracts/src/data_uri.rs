use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;

use crate::error::SifterError;

pub const GIF_MIME: &str = "image/gif";
pub const PNG_MIME: &str = "image/png";

const BASE64_MARKER: &str = ";base64,";
const FALLBACK_MIME: &str = "application/octet-stream";

/// Opaque bytes plus their declared MIME type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedImage {
    pub bytes: Vec<u8>,
    pub mime_type: String,
}

impl EncodedImage {
    pub fn new(bytes: Vec<u8>, mime_type: impl Into<String>) -> Self {
        Self {
            bytes,
            mime_type: mime_type.into(),
        }
    }

    pub fn gif(bytes: Vec<u8>) -> Self {
        Self::new(bytes, GIF_MIME)
    }

    pub fn is_gif(&self) -> bool {
        self.mime_type.eq_ignore_ascii_case(GIF_MIME)
    }

    pub fn to_data_uri(&self) -> String {
        encode(&self.bytes, &self.mime_type)
    }
}

pub fn decode(uri: &str) -> Result<EncodedImage, SifterError> {
    let trimmed = uri.trim();
    let Some(rest) = trimmed.strip_prefix("data:") else {
        return Err(SifterError::MalformedInput(
            "data URI must start with 'data:'".to_string(),
        ));
    };
    let Some((mime, payload)) = rest.split_once(BASE64_MARKER) else {
        return Err(SifterError::MalformedInput(
            "data URI is missing the ';base64,' marker".to_string(),
        ));
    };
    let compact: String = payload
        .chars()
        .filter(|ch| !ch.is_ascii_whitespace())
        .collect();
    let bytes = BASE64
        .decode(compact.as_bytes())
        .map_err(|err| SifterError::MalformedInput(format!("invalid base64 payload: {err}")))?;
    let mime = mime.trim();
    let mime_type = if mime.is_empty() { FALLBACK_MIME } else { mime };
    Ok(EncodedImage::new(bytes, mime_type))
}

pub fn encode(bytes: &[u8], mime_type: &str) -> String {
    format!("data:{mime_type}{BASE64_MARKER}{}", BASE64.encode(bytes))
}

pub fn looks_like_data_uri(raw: &str) -> bool {
    raw.trim_start().starts_with("data:")
}
