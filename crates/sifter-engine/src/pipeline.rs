use std::fmt;
use std::time::Instant;

use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};
use sifter_contracts::chat::ChatMessage;
use sifter_contracts::data_uri;
use sifter_contracts::events::{EventPayload, EventWriter};
use sifter_contracts::models::{ModelSelector, CAPABILITY_CHAT, CAPABILITY_DETECT};
use sifter_contracts::receipts::{EditRequestRecord, EditResultRecord};
use sifter_contracts::{
    ColorSpec, ColorSubstitutionRule, EncodedImage, FrameDims, Rectangle, RegionOutcome,
    SifterError, SifterResult,
};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{DetectorConfig, EditConfig};
use crate::detectors::{
    default_detector_registry, DetectorRegistry, DRYRUN_PROVIDER, GEMINI_PROVIDER, OPENAI_PROVIDER,
};
use crate::encoder::encode;
use crate::frames::{extract, first_frame_png, ExtractMode, LoopCount};
use crate::region::{
    resolve_detected, resolve_direct, DetectionKind, DetectionRequest, RegionDetector,
    RegionRequest,
};
use crate::transform::{apply_all, TransformPlan, TransformPolicy};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineStage {
    Idle,
    Decoding,
    Previewing,
    Extracting,
    Transforming,
    Encoding,
    Done,
    Failed(String),
}

impl PipelineStage {
    pub fn name(&self) -> &'static str {
        match self {
            PipelineStage::Idle => "idle",
            PipelineStage::Decoding => "decoding",
            PipelineStage::Previewing => "previewing",
            PipelineStage::Extracting => "extracting",
            PipelineStage::Transforming => "transforming",
            PipelineStage::Encoding => "encoding",
            PipelineStage::Done => "done",
            PipelineStage::Failed(_) => "failed",
        }
    }
}

impl fmt::Display for PipelineStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipelineStage::Failed(reason) => write!(f, "failed: {reason}"),
            other => f.write_str(other.name()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum EditOperation {
    /// Opaque box; `None` uses the configured fill.
    Replace { fill: Option<ColorSpec> },
    Cutout,
    Punch,
    Crop,
    Recolor(ColorSubstitutionRule),
}

impl EditOperation {
    pub fn name(&self) -> &'static str {
        match self {
            EditOperation::Replace { .. } => "replace_section",
            EditOperation::Cutout => "cutout_section",
            EditOperation::Punch => "punch_section",
            EditOperation::Crop => "crop",
            EditOperation::Recolor(_) => "replace_color",
        }
    }

    pub fn needs_region(&self) -> bool {
        !matches!(self, EditOperation::Recolor(_))
    }

    fn policy(&self, rect: Option<Rectangle>, default_fill: ColorSpec) -> SifterResult<TransformPolicy> {
        if let EditOperation::Recolor(rule) = self {
            return Ok(TransformPolicy::ColorSubstitute { rule: *rule });
        }
        let Some(rect) = rect else {
            return Err(SifterError::MalformedInput(format!(
                "{} needs a region",
                self.name()
            )));
        };
        Ok(match self {
            EditOperation::Replace { fill } => TransformPolicy::OpaqueReplace {
                rect,
                fill: fill.unwrap_or(default_fill),
            },
            EditOperation::Cutout => TransformPolicy::CutoutTransparent { rect },
            EditOperation::Punch => TransformPolicy::AlphaPunch { rect },
            EditOperation::Crop => TransformPolicy::Crop { rect },
            EditOperation::Recolor(rule) => TransformPolicy::ColorSubstitute { rule: *rule },
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct EditRequest {
    pub operation: EditOperation,
    pub region: Option<RegionRequest>,
}

impl EditRequest {
    pub fn new(operation: EditOperation, region: Option<RegionRequest>) -> Self {
        Self { operation, region }
    }

    pub fn direct(operation: EditOperation, rect: Rectangle) -> Self {
        Self::new(operation, Some(RegionRequest::Direct(rect)))
    }

    /// Receipt view of this request.
    pub fn record(&self) -> EditRequestRecord {
        let mut record = EditRequestRecord::new(self.operation.name());
        if let EditOperation::Recolor(rule) = self.operation {
            record.color_rule = Some(rule);
        }
        match &self.region {
            Some(RegionRequest::Direct(rect)) => record.region = Some(*rect),
            Some(RegionRequest::Prompted { prompt }) => record.prompt = Some(prompt.clone()),
            Some(RegionRequest::Conversation { messages }) => {
                record
                    .metadata
                    .insert("messages".to_string(), json!(messages.len()));
            }
            Some(RegionRequest::Automatic) | None => {}
        }
        if let Some(region) = &self.region {
            record
                .metadata
                .insert("region_source".to_string(), json!(region.label()));
        }
        record
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct EditOutcome {
    pub data_uri: String,
    /// Frames written; 0 when the input was passed through undecoded.
    pub frame_count: usize,
    pub passthrough: bool,
    pub region: Option<RegionOutcome>,
    pub stages: Vec<PipelineStage>,
    pub invocation_id: String,
    pub dims: Option<FrameDims>,
    pub delays_cs: Vec<u16>,
    pub loop_count: Option<LoopCount>,
    pub reply: Option<String>,
    pub detector: Option<String>,
    pub model: Option<String>,
    pub fallback_reason: Option<String>,
    pub input_sha256: String,
    pub output_sha256: String,
    pub elapsed_ms: u64,
}

impl EditOutcome {
    pub fn image(&self) -> SifterResult<EncodedImage> {
        data_uri::decode(&self.data_uri)
    }

    pub fn result_record(&self) -> EditResultRecord {
        let dims = self.dims.unwrap_or(FrameDims::new(0, 0));
        EditResultRecord {
            invocation_id: self.invocation_id.clone(),
            passthrough: self.passthrough,
            region: self.region,
            frame_count: self.frame_count,
            width: dims.width,
            height: dims.height,
            delays_cs: self.delays_cs.clone(),
            loop_count: self
                .loop_count
                .map(|value| value.to_string())
                .unwrap_or_else(|| "unchanged".to_string()),
            input_sha256: self.input_sha256.clone(),
            output_sha256: self.output_sha256.clone(),
            elapsed_ms: self.elapsed_ms,
            stages: self
                .stages
                .iter()
                .map(|stage| stage.name().to_string())
                .collect(),
        }
    }
}

/// Result of one chat turn: the model's reply, plus the edited GIF once a
/// region has been confirmed.
#[derive(Debug, Clone, PartialEq)]
pub struct ChatEditOutcome {
    pub reply: String,
    pub image: Option<String>,
    pub edit: EditOutcome,
}

#[derive(Debug, Default)]
struct DetectionSummary {
    reply: Option<String>,
    detector: Option<String>,
    model: Option<String>,
    fallback_reason: Option<String>,
}

struct Invocation {
    id: String,
    operation: &'static str,
    events: EventWriter,
    stages: Vec<PipelineStage>,
    started: Instant,
}

impl Invocation {
    fn start(events: &EventWriter, operation: &'static str) -> Self {
        let id = Uuid::new_v4().to_string();
        Self {
            events: events.for_invocation(id.clone()),
            id,
            operation,
            stages: vec![PipelineStage::Idle],
            started: Instant::now(),
        }
    }

    fn emit(&self, event_type: &str, payload: EventPayload) {
        if let Err(err) = self.events.emit(event_type, payload) {
            warn!(invocation_id = %self.id, error = %err, "event log write failed");
        }
    }

    fn enter(&mut self, stage: PipelineStage) {
        info!(
            invocation_id = %self.id,
            operation = self.operation,
            stage = stage.name(),
            "pipeline stage"
        );
        self.emit(
            "stage_changed",
            map_object(json!({
                "operation": self.operation,
                "stage": stage.name(),
            })),
        );
        self.stages.push(stage);
    }

    fn fail(&mut self, err: SifterError) -> SifterError {
        warn!(
            invocation_id = %self.id,
            operation = self.operation,
            kind = err.kind(),
            error = %err,
            "pipeline failed"
        );
        self.emit(
            "edit_failed",
            map_object(json!({
                "operation": self.operation,
                "error_kind": err.kind(),
                "message": err.to_string(),
            })),
        );
        self.stages.push(PipelineStage::Failed(err.to_string()));
        err
    }

    fn elapsed_ms(&self) -> u64 {
        u64::try_from(self.started.elapsed().as_millis()).unwrap_or(u64::MAX)
    }
}

/// Region editor for animated GIFs carried as Data-URIs.
///
/// Each call is one invocation with its own id. A failure at any stage ends
/// the invocation with no output.
pub struct GifEditPipeline {
    config: EditConfig,
    detectors: DetectorRegistry,
    selector: ModelSelector,
    detector: String,
    model: Option<String>,
    events: EventWriter,
}

impl GifEditPipeline {
    /// Uses the built-in detectors. The default detector is the first one
    /// with credentials, falling back to `dryrun`.
    pub fn new(config: EditConfig, detector_config: &DetectorConfig) -> Self {
        let detector = if detector_config.gemini_api_key.is_some() {
            GEMINI_PROVIDER
        } else if detector_config.openai_api_key.is_some() {
            OPENAI_PROVIDER
        } else {
            DRYRUN_PROVIDER
        };
        Self {
            config,
            detectors: default_detector_registry(detector_config),
            selector: ModelSelector::new(None),
            detector: detector.to_string(),
            model: None,
            events: EventWriter::disabled("idle"),
        }
    }

    pub fn with_events(mut self, events: EventWriter) -> Self {
        self.events = events;
        self
    }

    /// Registers `detector` and makes it the active one.
    pub fn with_detector(mut self, detector: Box<dyn RegionDetector>) -> Self {
        self.detector = detector.name().to_string();
        self.detectors.register(detector);
        self
    }

    pub fn detector(&self) -> &str {
        &self.detector
    }

    pub fn detectors(&self) -> Vec<String> {
        self.detectors.list()
    }

    pub fn set_detector(&mut self, name: &str) -> SifterResult<()> {
        let name = name.trim();
        if !self.detectors.contains(name) {
            return Err(SifterError::MalformedInput(format!(
                "unknown detector '{name}' (available: {})",
                self.detectors.list().join(", ")
            )));
        }
        self.detector = name.to_string();
        Ok(())
    }

    pub fn model(&self) -> Option<&str> {
        self.model.as_deref()
    }

    pub fn set_model(&mut self, model: Option<String>) {
        self.model = model
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty());
    }

    pub fn replace_section(&self, uri: &str, rect: Rectangle) -> SifterResult<EditOutcome> {
        self.edit(uri, &EditRequest::direct(EditOperation::Replace { fill: None }, rect))
    }

    pub fn cutout_section(&self, uri: &str, rect: Rectangle) -> SifterResult<EditOutcome> {
        self.edit(uri, &EditRequest::direct(EditOperation::Cutout, rect))
    }

    pub fn punch_section(&self, uri: &str, rect: Rectangle) -> SifterResult<EditOutcome> {
        self.edit(uri, &EditRequest::direct(EditOperation::Punch, rect))
    }

    pub fn crop(&self, uri: &str, rect: Rectangle) -> SifterResult<EditOutcome> {
        self.edit(uri, &EditRequest::direct(EditOperation::Crop, rect))
    }

    pub fn replace_color(&self, uri: &str, rule: ColorSubstitutionRule) -> SifterResult<EditOutcome> {
        self.edit(uri, &EditRequest::new(EditOperation::Recolor(rule), None))
    }

    pub fn detect_and_replace(&self, uri: &str, prompt: &str) -> SifterResult<EditOutcome> {
        self.edit(
            uri,
            &EditRequest::new(
                EditOperation::Replace { fill: None },
                Some(RegionRequest::Prompted {
                    prompt: prompt.trim().to_string(),
                }),
            ),
        )
    }

    pub fn auto_replace(&self, uri: &str) -> SifterResult<EditOutcome> {
        self.edit(
            uri,
            &EditRequest::new(
                EditOperation::Replace { fill: None },
                Some(RegionRequest::Automatic),
            ),
        )
    }

    /// One conversation turn. The history goes to the detector untouched;
    /// nothing is remembered between calls.
    pub fn chat_and_replace(
        &self,
        uri: &str,
        messages: &[ChatMessage],
    ) -> SifterResult<ChatEditOutcome> {
        let edit = self.edit(
            uri,
            &EditRequest::new(
                EditOperation::Replace { fill: None },
                Some(RegionRequest::Conversation {
                    messages: messages.to_vec(),
                }),
            ),
        )?;
        let reply = edit.reply.clone().unwrap_or_default();
        let image = (!edit.passthrough).then(|| edit.data_uri.clone());
        Ok(ChatEditOutcome { reply, image, edit })
    }

    /// PNG Data-URI of frame 0 at full size.
    pub fn preview_first_frame(&self, uri: &str) -> SifterResult<String> {
        let input = data_uri::decode(uri)?;
        let preview = first_frame_png(&input.bytes, None)?;
        debug!(dims = %preview.frame_dims, "rendered first frame");
        Ok(preview.data_uri())
    }

    pub fn edit(&self, uri: &str, request: &EditRequest) -> SifterResult<EditOutcome> {
        let mut run = Invocation::start(&self.events, request.operation.name());
        run.enter(PipelineStage::Decoding);
        let input = data_uri::decode(uri).map_err(|err| run.fail(err))?;
        if !input.is_gif() {
            warn!(
                invocation_id = %run.id,
                mime_type = %input.mime_type,
                "input is not declared as image/gif; decoding anyway"
            );
        }
        let input_sha256 = sha256_hex(&input.bytes);

        match (request.operation.needs_region(), &request.region) {
            (true, None) => {
                return Err(run.fail(SifterError::MalformedInput(format!(
                    "{} needs a region",
                    request.operation.name()
                ))))
            }
            (false, Some(_)) => {
                return Err(run.fail(SifterError::MalformedInput(
                    "colour substitution applies to whole frames and takes no region".to_string(),
                )))
            }
            _ => {}
        }
        match &request.region {
            Some(RegionRequest::Prompted { prompt }) if prompt.trim().is_empty() => {
                return Err(run.fail(SifterError::MalformedInput(
                    "detection prompt is empty".to_string(),
                )))
            }
            Some(RegionRequest::Conversation { messages }) if messages.is_empty() => {
                return Err(run.fail(SifterError::MalformedInput(
                    "conversation has no messages".to_string(),
                )))
            }
            _ => {}
        }

        let mut detection = DetectionSummary::default();
        let mut detected: Option<Rectangle> = None;
        match &request.region {
            Some(RegionRequest::Direct(rect)) if rect.is_empty() => {
                return Ok(self.pass_through(run, input, input_sha256, detection));
            }
            Some(region) if region.needs_detection() => {
                run.enter(PipelineStage::Previewing);
                let outcome = self
                    .detect_region(&run, &input.bytes, region, &mut detection)
                    .map_err(|err| run.fail(err))?;
                match outcome {
                    RegionOutcome::NoRegion => {
                        return Ok(self.pass_through(run, input, input_sha256, detection));
                    }
                    RegionOutcome::Region(rect) => detected = Some(rect),
                }
            }
            _ => {}
        }

        run.enter(PipelineStage::Extracting);
        let sequence = extract(
            &input.bytes,
            ExtractMode::AllFramesCumulative,
            self.config.max_frames,
        )
        .map_err(|err| run.fail(err))?;
        let dims = sequence.validate_uniform().map_err(|err| run.fail(err))?;

        let rect = match &request.region {
            Some(RegionRequest::Direct(rect)) => {
                match resolve_direct(*rect, dims).map_err(|err| run.fail(err))? {
                    RegionOutcome::Region(rect) => Some(rect),
                    RegionOutcome::NoRegion => None,
                }
            }
            _ => detected,
        };

        run.enter(PipelineStage::Transforming);
        let plan = request
            .operation
            .policy(rect, self.config.fill)
            .and_then(|policy| TransformPlan::new(policy, dims, self.config.metric))
            .map_err(|err| run.fail(err))?;
        let transformed = apply_all(&sequence, &plan).map_err(|err| run.fail(err))?;

        run.enter(PipelineStage::Encoding);
        let bytes = encode(&transformed, &self.config.encoder).map_err(|err| run.fail(err))?;
        let output_sha256 = sha256_hex(&bytes);
        let output_dims = transformed.validate_uniform().map_err(|err| run.fail(err))?;

        run.enter(PipelineStage::Done);
        let elapsed_ms = run.elapsed_ms();
        let region = rect.map(RegionOutcome::Region);
        run.emit(
            "edit_completed",
            map_object(json!({
                "operation": run.operation,
                "policy": plan.policy().name(),
                "region": region,
                "frames": transformed.len(),
                "width": output_dims.width,
                "height": output_dims.height,
                "elapsed_ms": elapsed_ms,
                "output_sha256": output_sha256,
            })),
        );
        info!(
            invocation_id = %run.id,
            operation = run.operation,
            frames = transformed.len(),
            elapsed_ms,
            "edit completed"
        );

        Ok(EditOutcome {
            data_uri: EncodedImage::gif(bytes).to_data_uri(),
            frame_count: transformed.len(),
            passthrough: false,
            region,
            stages: run.stages,
            invocation_id: run.id,
            dims: Some(output_dims),
            delays_cs: transformed.delays_cs(),
            loop_count: Some(transformed.loop_count()),
            reply: detection.reply,
            detector: detection.detector,
            model: detection.model,
            fallback_reason: detection.fallback_reason,
            input_sha256,
            output_sha256,
            elapsed_ms,
        })
    }

    fn detect_region(
        &self,
        run: &Invocation,
        bytes: &[u8],
        region: &RegionRequest,
        summary: &mut DetectionSummary,
    ) -> SifterResult<RegionOutcome> {
        let Some(detector) = self.detectors.get(&self.detector) else {
            return Err(SifterError::MalformedInput(format!(
                "unknown detector '{}'",
                self.detector
            )));
        };
        let (kind, capability) = match region {
            RegionRequest::Prompted { prompt } => (DetectionKind::Prompted(prompt), CAPABILITY_DETECT),
            RegionRequest::Automatic => (DetectionKind::Automatic, CAPABILITY_DETECT),
            RegionRequest::Conversation { messages } => {
                (DetectionKind::Conversation(messages), CAPABILITY_CHAT)
            }
            RegionRequest::Direct(_) => {
                return Err(SifterError::MalformedInput(
                    "direct rectangles are not sent for detection".to_string(),
                ))
            }
        };

        let (model, max_dim, fallback_reason) = match self.selector.select_for_provider(
            self.model.as_deref(),
            detector.name(),
            capability,
        ) {
            Ok(selection) => (
                selection.model.name,
                selection.model.max_image_dim,
                selection.fallback_reason,
            ),
            // Detectors outside the model registry take the model as given.
            Err(reason) => (
                self.model
                    .clone()
                    .unwrap_or_else(|| detector.name().to_string()),
                None,
                Some(reason),
            ),
        };
        let preview = first_frame_png(bytes, Some(max_dim.unwrap_or(self.config.preview_max_dim)))?;

        let request = DetectionRequest {
            image: &preview.image,
            image_dims: preview.preview_dims,
            kind,
            model: &model,
        };
        let response = detector.detect(&request)?;
        if matches!(kind, DetectionKind::Conversation(_)) && response.reply.is_none() {
            return Err(SifterError::ExternalCollaborator(format!(
                "detector '{}' returned no reply",
                detector.name()
            )));
        }
        let outcome = resolve_detected(&response, &preview)?;

        run.emit(
            "region_detected",
            map_object(json!({
                "detector": detector.name(),
                "model": model,
                "fallback_reason": fallback_reason,
                "detected_box": response.region,
                "region": outcome,
                "preview_width": preview.preview_dims.width,
                "preview_height": preview.preview_dims.height,
            })),
        );
        info!(
            invocation_id = %run.id,
            detector = detector.name(),
            model = %model,
            found = !outcome.is_none(),
            "region detection finished"
        );

        summary.reply = response.reply;
        summary.detector = Some(detector.name().to_string());
        summary.model = Some(model);
        summary.fallback_reason = fallback_reason;
        Ok(outcome)
    }

    fn pass_through(
        &self,
        mut run: Invocation,
        input: EncodedImage,
        input_sha256: String,
        detection: DetectionSummary,
    ) -> EditOutcome {
        warn!(
            invocation_id = %run.id,
            operation = run.operation,
            "no region selected; returning the input unchanged"
        );
        run.enter(PipelineStage::Done);
        let elapsed_ms = run.elapsed_ms();
        run.emit(
            "edit_passthrough",
            map_object(json!({
                "operation": run.operation,
                "elapsed_ms": elapsed_ms,
            })),
        );
        EditOutcome {
            data_uri: EncodedImage::gif(input.bytes).to_data_uri(),
            frame_count: 0,
            passthrough: true,
            region: Some(RegionOutcome::NoRegion),
            stages: run.stages,
            invocation_id: run.id,
            dims: None,
            delays_cs: Vec::new(),
            loop_count: None,
            reply: detection.reply,
            detector: detection.detector,
            model: detection.model,
            fallback_reason: detection.fallback_reason,
            output_sha256: input_sha256.clone(),
            input_sha256,
            elapsed_ms,
        }
    }
}

fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

fn map_object(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use serde_json::Value;
    use sifter_contracts::chat::ChatMessage;
    use sifter_contracts::data_uri;
    use sifter_contracts::events::EventWriter;
    use sifter_contracts::providers::NamedProvider;
    use sifter_contracts::{
        ColorSpec, ColorSubstitutionRule, DetectedBox, Rectangle, RegionOutcome, SifterError,
        SifterResult,
    };

    use super::{EditOperation, EditRequest, GifEditPipeline, PipelineStage};
    use crate::config::{DetectorConfig, EditConfig};
    use crate::frames::{extract, ExtractMode};
    use crate::region::{
        DetectionKind, DetectionRequest, DetectionResponse, RegionDetector, RegionRequest,
    };

    /// Answers every request with a fixed box and reply, recording the kind.
    struct FixedDetector {
        region: Option<DetectedBox>,
        reply: Option<String>,
        seen: Mutex<Vec<String>>,
    }

    impl FixedDetector {
        fn boxed(region: Option<DetectedBox>, reply: Option<&str>) -> Box<Self> {
            Box::new(Self {
                region,
                reply: reply.map(str::to_string),
                seen: Mutex::new(Vec::new()),
            })
        }
    }

    impl NamedProvider for FixedDetector {
        fn name(&self) -> &str {
            "fixed"
        }
    }

    impl RegionDetector for FixedDetector {
        fn detect(&self, request: &DetectionRequest<'_>) -> SifterResult<DetectionResponse> {
            let label = match request.kind {
                DetectionKind::Prompted(prompt) => format!("prompted:{prompt}"),
                DetectionKind::Automatic => "automatic".to_string(),
                DetectionKind::Conversation(messages) => format!("conversation:{}", messages.len()),
            };
            if let Ok(mut seen) = self.seen.lock() {
                seen.push(label);
            }
            Ok(DetectionResponse {
                region: self.region,
                reply: self.reply.clone(),
            })
        }
    }

    fn square_gif_uri() -> String {
        let (width, height) = (20u16, 16u16);
        let mut out = Vec::new();
        {
            let mut encoder = gif::Encoder::new(&mut out, width, height, &[]).unwrap();
            encoder.set_repeat(gif::Repeat::Infinite).unwrap();
            for delay in [10u16, 5, 20] {
                let mut rgba = Vec::new();
                for y in 0..height {
                    for x in 0..width {
                        if (4..8).contains(&x) && (4..8).contains(&y) {
                            rgba.extend_from_slice(&[255, 0, 0, 255]);
                        } else {
                            rgba.extend_from_slice(&[40, 40, 40, 255]);
                        }
                    }
                }
                let mut frame = gif::Frame::from_rgba_speed(width, height, &mut rgba, 10);
                frame.delay = delay;
                encoder.write_frame(&frame).unwrap();
            }
        }
        data_uri::encode(&out, "image/gif")
    }

    fn pipeline() -> GifEditPipeline {
        GifEditPipeline::new(EditConfig::default(), &DetectorConfig::default())
    }

    #[test]
    fn direct_replace_runs_every_stage() -> anyhow::Result<()> {
        let outcome = pipeline().replace_section(&square_gif_uri(), Rectangle::new(0, 0, 2, 2))?;
        assert!(!outcome.passthrough);
        assert_eq!(outcome.frame_count, 3);
        assert_eq!(outcome.delays_cs, vec![10, 5, 20]);
        assert_eq!(
            outcome.stages,
            vec![
                PipelineStage::Idle,
                PipelineStage::Decoding,
                PipelineStage::Extracting,
                PipelineStage::Transforming,
                PipelineStage::Encoding,
                PipelineStage::Done,
            ]
        );
        let decoded = extract(&outcome.image()?.bytes, ExtractMode::AllFramesCumulative, None)?;
        assert_eq!(decoded.frames()[2].pixel(1, 1), Some(&[255, 255, 255, 255][..]));
        assert_eq!(decoded.frames()[2].pixel(5, 5), Some(&[255, 0, 0, 255][..]));
        Ok(())
    }

    #[test]
    fn zero_area_rectangle_passes_input_through() -> anyhow::Result<()> {
        let uri = square_gif_uri();
        let outcome = pipeline().cutout_section(&uri, Rectangle::new(3, 3, 0, 5))?;
        assert!(outcome.passthrough);
        assert_eq!(outcome.region, Some(RegionOutcome::NoRegion));
        assert_eq!(outcome.data_uri, uri);
        assert_eq!(outcome.input_sha256, outcome.output_sha256);
        Ok(())
    }

    #[test]
    fn out_of_bounds_rectangle_fails_without_output() {
        let err = pipeline()
            .punch_section(&square_gif_uri(), Rectangle::new(10, 0, 11, 4))
            .unwrap_err();
        assert!(matches!(err, SifterError::InvalidRegion(_)));
    }

    #[test]
    fn malformed_uri_is_rejected() {
        let err = pipeline()
            .crop("not a data uri", Rectangle::new(0, 0, 1, 1))
            .unwrap_err();
        assert!(matches!(err, SifterError::MalformedInput(_)));
        let err = pipeline()
            .crop(&data_uri::encode(b"GIF89a", "image/gif"), Rectangle::new(0, 0, 1, 1))
            .unwrap_err();
        assert!(matches!(err, SifterError::Decode(_)));
    }

    #[test]
    fn crop_shrinks_every_frame() -> anyhow::Result<()> {
        let outcome = pipeline().crop(&square_gif_uri(), Rectangle::new(4, 4, 4, 4))?;
        let decoded = extract(&outcome.image()?.bytes, ExtractMode::AllFramesCumulative, None)?;
        assert_eq!(decoded.len(), 3);
        assert!(decoded
            .frames()
            .iter()
            .all(|frame| frame.width == 4 && frame.height == 4));
        assert_eq!(decoded.frames()[0].pixel(0, 0), Some(&[255, 0, 0, 255][..]));
        Ok(())
    }

    #[test]
    fn recolor_rejects_a_region() {
        let rule = ColorSubstitutionRule::new(ColorSpec::WHITE, ColorSpec::BLACK, 10.0).unwrap();
        let request = EditRequest::new(
            EditOperation::Recolor(rule),
            Some(RegionRequest::Direct(Rectangle::new(0, 0, 1, 1))),
        );
        assert!(matches!(
            pipeline().edit(&square_gif_uri(), &request),
            Err(SifterError::MalformedInput(_))
        ));
    }

    #[test]
    fn prompted_detection_replaces_the_detected_box() -> anyhow::Result<()> {
        let pipeline = pipeline().with_detector(FixedDetector::boxed(
            Some(DetectedBox::new(4.2, 3.8, 4.0, 4.0)),
            None,
        ));
        assert_eq!(pipeline.detector(), "fixed");
        let outcome = pipeline.detect_and_replace(&square_gif_uri(), "the red square")?;
        assert_eq!(
            outcome.region,
            Some(RegionOutcome::Region(Rectangle::new(4, 4, 4, 4)))
        );
        assert!(outcome.stages.contains(&PipelineStage::Previewing));
        assert_eq!(outcome.detector.as_deref(), Some("fixed"));
        let decoded = extract(&outcome.image()?.bytes, ExtractMode::AllFramesCumulative, None)?;
        assert_eq!(decoded.frames()[1].pixel(5, 5), Some(&[255, 255, 255, 255][..]));
        Ok(())
    }

    #[test]
    fn detector_finding_nothing_is_a_pass_through() -> anyhow::Result<()> {
        let uri = square_gif_uri();
        let pipeline = pipeline().with_detector(FixedDetector::boxed(
            Some(DetectedBox::new(0.0, 0.0, 0.0, 0.0)),
            None,
        ));
        let outcome = pipeline.auto_replace(&uri)?;
        assert!(outcome.passthrough);
        assert_eq!(outcome.data_uri, uri);
        assert!(!outcome.stages.contains(&PipelineStage::Extracting));
        Ok(())
    }

    #[test]
    fn detected_box_outside_frame_is_invalid_region() {
        let pipeline = pipeline().with_detector(FixedDetector::boxed(
            Some(DetectedBox::new(18.0, 0.0, 5.0, 5.0)),
            None,
        ));
        assert!(matches!(
            pipeline.auto_replace(&square_gif_uri()),
            Err(SifterError::InvalidRegion(_))
        ));
    }

    #[test]
    fn chat_without_confirmation_returns_reply_only() -> anyhow::Result<()> {
        let pipeline = pipeline().with_detector(FixedDetector::boxed(None, Some("Remove the red square?")));
        let messages = vec![ChatMessage::user("get rid of the red thing")];
        let outcome = pipeline.chat_and_replace(&square_gif_uri(), &messages)?;
        assert_eq!(outcome.reply, "Remove the red square?");
        assert!(outcome.image.is_none());
        Ok(())
    }

    #[test]
    fn chat_with_confirmed_box_returns_image() -> anyhow::Result<()> {
        let pipeline = pipeline().with_detector(FixedDetector::boxed(
            Some(DetectedBox::new(4.0, 4.0, 4.0, 4.0)),
            Some("Done, the square is gone."),
        ));
        let messages = vec![
            ChatMessage::user("remove the red square"),
            ChatMessage::model("The one in the top left?"),
            ChatMessage::user("yes"),
        ];
        let outcome = pipeline.chat_and_replace(&square_gif_uri(), &messages)?;
        assert!(outcome.image.is_some());
        assert_eq!(outcome.reply, "Done, the square is gone.");
        assert!(pipeline.chat_and_replace(&square_gif_uri(), &[]).is_err());
        Ok(())
    }

    #[test]
    fn chat_reply_is_required() {
        let pipeline = pipeline().with_detector(FixedDetector::boxed(None, None));
        let err = pipeline
            .chat_and_replace(&square_gif_uri(), &[ChatMessage::user("hi")])
            .unwrap_err();
        assert!(matches!(err, SifterError::ExternalCollaborator(_)));
    }

    #[test]
    fn dryrun_is_the_default_without_credentials() -> anyhow::Result<()> {
        let mut pipeline = pipeline();
        assert_eq!(pipeline.detector(), "dryrun");
        let outcome = pipeline.auto_replace(&square_gif_uri())?;
        assert!(outcome.passthrough);
        assert_eq!(outcome.model.as_deref(), Some("dryrun-detect-1"));
        assert!(pipeline.set_detector("nope").is_err());
        pipeline.set_detector("openai")?;
        assert_eq!(pipeline.detector(), "openai");
        Ok(())
    }

    /// 10x10, left half red and right half green.
    fn two_tone_gif_uri() -> String {
        let mut out = Vec::new();
        {
            let mut encoder = gif::Encoder::new(&mut out, 10, 10, &[]).unwrap();
            let mut rgba = (0..100u32)
                .flat_map(|index| {
                    if index % 10 < 5 {
                        [255, 0, 0, 255]
                    } else {
                        [0, 200, 0, 255]
                    }
                })
                .collect::<Vec<u8>>();
            let mut frame = gif::Frame::from_rgba_speed(10, 10, &mut rgba, 10);
            frame.delay = 8;
            encoder.write_frame(&frame).unwrap();
        }
        data_uri::encode(&out, "image/gif")
    }

    /// 32x16 canvas painted by two 16x16 patches of 256 colours each, so the
    /// second composited frame holds 512 distinct colours.
    fn patchwork_gif_uri() -> String {
        let mut out = Vec::new();
        {
            let mut encoder = gif::Encoder::new(&mut out, 32, 16, &[]).unwrap();
            for (left, blue) in [(0u16, 0u8), (16, 255)] {
                let mut rgba = (0..256u32)
                    .flat_map(|index| {
                        let (x, y) = (index % 16, index / 16);
                        [(x * 16) as u8, (y * 16) as u8, blue, 255]
                    })
                    .collect::<Vec<u8>>();
                let mut frame = gif::Frame::from_rgba_speed(16, 16, &mut rgba, 10);
                frame.left = left;
                frame.delay = 6;
                frame.dispose = gif::DisposalMethod::Keep;
                encoder.write_frame(&frame).unwrap();
            }
        }
        data_uri::encode(&out, "image/gif")
    }

    fn assert_hole(bytes: &[u8], frame_index: usize, rect: Rectangle) -> anyhow::Result<()> {
        let decoded = extract(bytes, ExtractMode::AllFramesCumulative, None)?;
        let frame = &decoded.frames()[frame_index];
        for y in 0..frame.height {
            for x in 0..frame.width {
                let alpha = frame.pixel(x, y).map(|px| px[3]);
                let expected = if rect.contains(x, y) { 0 } else { 255 };
                assert_eq!(alpha, Some(expected), "frame {frame_index} ({x},{y})");
            }
        }
        Ok(())
    }

    #[test]
    fn cutout_clears_every_colour_in_the_rectangle() -> anyhow::Result<()> {
        let rect = Rectangle::new(2, 2, 6, 6);
        let outcome = pipeline().cutout_section(&two_tone_gif_uri(), rect)?;
        let bytes = outcome.image()?.bytes;
        assert_hole(&bytes, 0, rect)?;

        let decoded = extract(&bytes, ExtractMode::AllFramesCumulative, None)?;
        assert_eq!(decoded.frames()[0].pixel(0, 0), Some(&[255, 0, 0, 255][..]));
        assert_eq!(decoded.frames()[0].pixel(9, 9), Some(&[0, 200, 0, 255][..]));
        Ok(())
    }

    #[test]
    fn punch_clears_every_colour_in_the_rectangle() -> anyhow::Result<()> {
        let rect = Rectangle::new(2, 2, 6, 6);
        let outcome = pipeline().punch_section(&two_tone_gif_uri(), rect)?;
        assert_hole(&outcome.image()?.bytes, 0, rect)
    }

    #[test]
    fn cutout_holds_on_frames_with_more_than_256_colours() -> anyhow::Result<()> {
        let rect = Rectangle::new(8, 4, 16, 8);
        let uri = patchwork_gif_uri();
        let outcome = pipeline().cutout_section(&uri, rect)?;
        assert_eq!(outcome.frame_count, 2);
        assert_hole(&outcome.image()?.bytes, 1, rect)?;

        let punched = pipeline().punch_section(&uri, rect)?;
        assert_hole(&punched.image()?.bytes, 1, rect)
    }

    #[test]
    fn preview_is_a_png_of_the_first_frame() -> anyhow::Result<()> {
        let preview = pipeline().preview_first_frame(&square_gif_uri())?;
        let image = data_uri::decode(&preview)?;
        assert_eq!(image.mime_type, "image/png");
        assert_eq!(&image.bytes[1..4], b"PNG");
        Ok(())
    }

    #[test]
    fn stages_and_failures_reach_the_event_log() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let events_path = temp.path().join("events.jsonl");
        let pipeline = pipeline().with_events(EventWriter::new(&events_path, "session"));
        pipeline.replace_section(&square_gif_uri(), Rectangle::new(0, 0, 1, 1))?;
        let _ = pipeline.replace_section(&square_gif_uri(), Rectangle::new(0, 0, 99, 1));

        let rows = std::fs::read_to_string(&events_path)?
            .lines()
            .map(serde_json::from_str::<Value>)
            .collect::<Result<Vec<Value>, _>>()?;
        let types = rows
            .iter()
            .filter_map(|row| row["type"].as_str())
            .collect::<Vec<&str>>();
        assert!(types.contains(&"stage_changed"));
        assert!(types.contains(&"edit_completed"));
        assert!(types.contains(&"edit_failed"));
        let failed = rows.iter().find(|row| row["type"] == "edit_failed").unwrap();
        assert_eq!(failed["error_kind"], "invalid_region");
        assert_ne!(rows[0]["invocation_id"], failed["invocation_id"]);
        Ok(())
    }

    #[test]
    fn request_record_describes_the_edit() {
        let request = EditRequest::new(
            EditOperation::Replace { fill: None },
            Some(RegionRequest::Prompted {
                prompt: "logo".to_string(),
            }),
        );
        let record = request.record();
        assert_eq!(record.operation, "replace_section");
        assert_eq!(record.prompt.as_deref(), Some("logo"));
        assert_eq!(record.metadata["region_source"], "prompted");
    }
}
