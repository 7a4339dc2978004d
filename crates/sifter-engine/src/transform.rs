use std::collections::HashMap;

use rayon::prelude::*;
use sifter_contracts::{
    ColorSpec, ColorSubstitutionRule, FrameDims, Rectangle, SifterError, SifterResult,
};
use tracing::debug;

use crate::color_distance::{ColorMatcher, DistanceMetric};
use crate::frames::{DecodedFrame, FrameSequence};

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TransformPolicy {
    /// Pixels in the rectangle become `fill`, fully opaque.
    OpaqueReplace { rect: Rectangle, fill: ColorSpec },
    /// Pixels in the rectangle become fully transparent; colour is kept.
    CutoutTransparent { rect: Rectangle },
    /// Destination-out composite of an opaque mask over the rectangle.
    AlphaPunch { rect: Rectangle },
    ColorSubstitute { rule: ColorSubstitutionRule },
    Crop { rect: Rectangle },
}

impl TransformPolicy {
    pub fn name(&self) -> &'static str {
        match self {
            TransformPolicy::OpaqueReplace { .. } => "opaque_replace",
            TransformPolicy::CutoutTransparent { .. } => "cutout_transparent",
            TransformPolicy::AlphaPunch { .. } => "alpha_punch",
            TransformPolicy::ColorSubstitute { .. } => "color_substitute",
            TransformPolicy::Crop { .. } => "crop",
        }
    }

    pub fn rect(&self) -> Option<Rectangle> {
        match self {
            TransformPolicy::OpaqueReplace { rect, .. }
            | TransformPolicy::CutoutTransparent { rect }
            | TransformPolicy::AlphaPunch { rect }
            | TransformPolicy::Crop { rect } => Some(*rect),
            TransformPolicy::ColorSubstitute { .. } => None,
        }
    }
}

/// A policy checked against the frame size it will run on.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TransformPlan {
    policy: TransformPolicy,
    frame_dims: FrameDims,
    metric: DistanceMetric,
}

impl TransformPlan {
    pub fn new(
        policy: TransformPolicy,
        frame_dims: FrameDims,
        metric: DistanceMetric,
    ) -> SifterResult<Self> {
        if let Some(rect) = policy.rect() {
            rect.check_within(frame_dims)
                .map_err(|reason| SifterError::Geometry(format!("{rect}: {reason}")))?;
        }
        if let TransformPolicy::ColorSubstitute { rule } = &policy {
            rule.validate()?;
        }
        Ok(Self {
            policy,
            frame_dims,
            metric,
        })
    }

    pub fn policy(&self) -> &TransformPolicy {
        &self.policy
    }

    pub fn frame_dims(&self) -> FrameDims {
        self.frame_dims
    }
}

pub fn apply(frame: &DecodedFrame, plan: &TransformPlan) -> SifterResult<DecodedFrame> {
    if frame.dims() != plan.frame_dims {
        return Err(SifterError::Geometry(format!(
            "frame is {} but the edit was planned for {}",
            frame.dims(),
            plan.frame_dims
        )));
    }
    frame.check_buffer().map_err(SifterError::Geometry)?;

    let out = match plan.policy {
        TransformPolicy::OpaqueReplace { rect, fill } => opaque_replace(frame, rect, fill),
        TransformPolicy::CutoutTransparent { rect } => cutout_transparent(frame, rect),
        TransformPolicy::AlphaPunch { rect } => alpha_punch(frame, rect),
        TransformPolicy::ColorSubstitute { rule } => color_substitute(frame, &rule, plan.metric),
        TransformPolicy::Crop { rect } => crop(frame, rect),
    };
    Ok(out)
}

/// Applies `plan` to every frame in parallel; output order matches input.
pub fn apply_all(sequence: &FrameSequence, plan: &TransformPlan) -> SifterResult<FrameSequence> {
    debug!(
        frames = sequence.len(),
        policy = plan.policy.name(),
        "transforming frames"
    );
    let frames = sequence
        .frames()
        .par_iter()
        .map(|frame| apply(frame, plan))
        .collect::<SifterResult<Vec<DecodedFrame>>>()?;
    Ok(FrameSequence::new(frames, sequence.loop_count()))
}

/// Calls `visit` with each pixel of `rect`.
fn for_each_in_rect(frame: &mut DecodedFrame, rect: Rectangle, mut visit: impl FnMut(&mut [u8])) {
    let channels = frame.layout.channels();
    let stride = frame.width as usize * channels;
    let x0 = rect.x as usize * channels;
    let x1 = x0 + rect.width as usize * channels;
    for y in rect.y as usize..rect.y as usize + rect.height as usize {
        let row = &mut frame.pixels[y * stride..(y + 1) * stride];
        for px in row[x0..x1].chunks_exact_mut(channels) {
            visit(px);
        }
    }
}

fn opaque_replace(frame: &DecodedFrame, rect: Rectangle, fill: ColorSpec) -> DecodedFrame {
    let mut out = frame.clone();
    let [r, g, b] = fill.to_array();
    for_each_in_rect(&mut out, rect, |px| {
        px[0] = r;
        px[1] = g;
        px[2] = b;
        if px.len() == 4 {
            px[3] = 255;
        }
    });
    out
}

fn cutout_transparent(frame: &DecodedFrame, rect: Rectangle) -> DecodedFrame {
    let mut out = frame.to_rgba();
    for_each_in_rect(&mut out, rect, |px| px[3] = 0);
    out
}

fn alpha_punch(frame: &DecodedFrame, rect: Rectangle) -> DecodedFrame {
    let mut out = frame.to_rgba();
    // Opaque mask: full coverage inside the rectangle.
    for_each_in_rect(&mut out, rect, |px| destination_out(px, 1.0));
    out
}

/// `a' = a·(1−m)` on a straight-alpha pixel. Premultiplied colour scales by
/// the same factor, so only a fully cleared pixel loses its colour.
fn destination_out(px: &mut [u8], coverage: f32) {
    let keep = (1.0 - coverage.clamp(0.0, 1.0)) * f32::from(px[3]) / 255.0;
    let alpha = (keep * 255.0).round() as u8;
    px[3] = alpha;
    if alpha == 0 {
        px[0] = 0;
        px[1] = 0;
        px[2] = 0;
    }
}

fn color_substitute(
    frame: &DecodedFrame,
    rule: &ColorSubstitutionRule,
    metric: DistanceMetric,
) -> DecodedFrame {
    if rule.is_identity() {
        return frame.clone();
    }
    let matcher = ColorMatcher::new(rule.source, rule.tolerance, metric);
    let target = rule.target.to_array();
    let channels = frame.layout.channels();

    let mut out = frame.clone();
    let mut memo: HashMap<[u8; 3], bool> = HashMap::new();
    for px in out.pixels.chunks_exact_mut(channels) {
        let rgb = [px[0], px[1], px[2]];
        let hit = *memo.entry(rgb).or_insert_with(|| matcher.matches(rgb));
        if hit {
            px[..3].copy_from_slice(&target);
        }
    }
    out
}

fn crop(frame: &DecodedFrame, rect: Rectangle) -> DecodedFrame {
    let channels = frame.layout.channels();
    let stride = frame.width as usize * channels;
    let x0 = rect.x as usize * channels;
    let row_len = rect.width as usize * channels;
    let mut pixels = Vec::with_capacity(row_len * rect.height as usize);
    for y in rect.y as usize..rect.y as usize + rect.height as usize {
        let start = y * stride + x0;
        pixels.extend_from_slice(&frame.pixels[start..start + row_len]);
    }
    DecodedFrame {
        width: rect.width,
        height: rect.height,
        layout: frame.layout,
        pixels,
        delay: frame.delay,
    }
}
