use sifter_contracts::chat::ChatMessage;
use sifter_contracts::providers::NamedProvider;
use sifter_contracts::{
    DetectedBox, EncodedImage, FrameDims, Rectangle, RegionOutcome, SifterError, SifterResult,
};

use crate::frames::FramePreview;

/// How the edit region is chosen.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegionRequest {
    Direct(Rectangle),
    /// Region described in free text, located by a detector.
    Prompted { prompt: String },
    /// Most prominent logo, watermark or text, located by a detector.
    Automatic,
    /// Region agreed on over a conversation. The history is forwarded as is.
    Conversation { messages: Vec<ChatMessage> },
}

impl RegionRequest {
    pub fn needs_detection(&self) -> bool {
        !matches!(self, RegionRequest::Direct(_))
    }

    pub fn label(&self) -> &'static str {
        match self {
            RegionRequest::Direct(_) => "direct",
            RegionRequest::Prompted { .. } => "prompted",
            RegionRequest::Automatic => "automatic",
            RegionRequest::Conversation { .. } => "conversation",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetectionKind<'a> {
    Prompted(&'a str),
    Automatic,
    Conversation(&'a [ChatMessage]),
}

/// What a detector is handed: the frame-0 still and the question.
#[derive(Debug, Clone, Copy)]
pub struct DetectionRequest<'a> {
    pub image: &'a EncodedImage,
    /// Dimensions of `image`, which may be a downscaled still.
    pub image_dims: FrameDims,
    pub kind: DetectionKind<'a>,
    pub model: &'a str,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct DetectionResponse {
    /// Box in `image_dims` coordinates; `None` when nothing was selected.
    pub region: Option<DetectedBox>,
    /// Conversational reply, only for conversation requests.
    pub reply: Option<String>,
}

/// External collaborator that proposes an edit region for a still image.
pub trait RegionDetector: NamedProvider + Send + Sync {
    fn detect(&self, request: &DetectionRequest<'_>) -> SifterResult<DetectionResponse>;
}

/// Validates a caller-supplied rectangle. Zero area means nothing selected.
pub fn resolve_direct(rect: Rectangle, dims: FrameDims) -> SifterResult<RegionOutcome> {
    if rect.is_empty() {
        return Ok(RegionOutcome::NoRegion);
    }
    rect.check_within(dims)
        .map_err(|reason| SifterError::InvalidRegion(format!("{rect}: {reason}")))?;
    Ok(RegionOutcome::Region(rect))
}

/// Maps a detector's box from still coordinates onto the real frame.
pub fn resolve_detected(
    response: &DetectionResponse,
    preview: &FramePreview,
) -> SifterResult<RegionOutcome> {
    let Some(detected) = response.region else {
        return Ok(RegionOutcome::NoRegion);
    };
    let (sx, sy) = preview.scale();
    let scaled = if sx == 1.0 && sy == 1.0 {
        detected
    } else {
        detected.scaled(sx, sy)
    };
    scaled.resolve(preview.frame_dims)
}
