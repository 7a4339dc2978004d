pub mod color_distance;
pub mod config;
pub mod detectors;
pub mod encoder;
pub mod frames;
pub mod media;
pub mod pipeline;
pub mod region;
pub mod transform;

mod text;

pub use color_distance::{ColorMatcher, DistanceMetric};
pub use config::{DetectorConfig, EditConfig, EncoderConfig};
pub use detectors::{default_detector_registry, DetectorRegistry, DryrunDetector};
pub use encoder::encode;
pub use frames::{
    extract, first_frame_png, DecodedFrame, ExtractMode, FrameDelay, FramePreview, FrameSequence,
    LoopCount,
};
pub use pipeline::{
    ChatEditOutcome, EditOperation, EditOutcome, EditRequest, GifEditPipeline, PipelineStage,
};
pub use region::{
    DetectionKind, DetectionRequest, DetectionResponse, RegionDetector, RegionRequest,
};
pub use transform::{apply, apply_all, TransformPlan, TransformPolicy};
