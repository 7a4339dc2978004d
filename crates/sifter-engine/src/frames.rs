use std::fmt;
use std::io::Cursor;

use image::codecs::gif::GifDecoder;
use image::imageops::FilterType;
use image::{AnimationDecoder, DynamicImage, ImageFormat, RgbaImage};
use sifter_contracts::data_uri::PNG_MIME;
use sifter_contracts::{EncodedImage, FrameDims, SifterError, SifterResult};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelLayout {
    Rgb,
    Rgba,
}

impl ChannelLayout {
    pub fn channels(&self) -> usize {
        match self {
            ChannelLayout::Rgb => 3,
            ChannelLayout::Rgba => 4,
        }
    }
}

/// Frame display time in GIF-native centiseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FrameDelay(u16);

impl FrameDelay {
    pub fn from_centis(centis: u16) -> Self {
        Self(centis)
    }

    /// Converts a decoder-reported `numer/denom` millisecond ratio, rounding
    /// to the nearest centisecond.
    pub fn from_millis_ratio(numer: u32, denom: u32) -> Self {
        if denom == 0 {
            return Self(0);
        }
        let millis = f64::from(numer) / f64::from(denom);
        let centis = (millis / 10.0).round().clamp(0.0, f64::from(u16::MAX));
        Self(centis as u16)
    }

    pub fn centis(&self) -> u16 {
        self.0
    }

    pub fn millis(&self) -> u32 {
        u32::from(self.0) * 10
    }
}

/// Animation loop behaviour.
///
/// `Finite(0)` is a GIF with no NETSCAPE2.0 extension: it plays once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopCount {
    Infinite,
    Finite(u16),
}

impl Default for LoopCount {
    fn default() -> Self {
        LoopCount::Finite(0)
    }
}

impl From<gif::Repeat> for LoopCount {
    fn from(value: gif::Repeat) -> Self {
        match value {
            gif::Repeat::Infinite => LoopCount::Infinite,
            gif::Repeat::Finite(count) => LoopCount::Finite(count),
        }
    }
}

impl fmt::Display for LoopCount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoopCount::Infinite => f.write_str("infinite"),
            LoopCount::Finite(0) => f.write_str("once"),
            LoopCount::Finite(count) => write!(f, "{count}"),
        }
    }
}

/// One composited frame. Each frame owns its pixel buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedFrame {
    pub width: u32,
    pub height: u32,
    pub layout: ChannelLayout,
    pub pixels: Vec<u8>,
    pub delay: FrameDelay,
}

impl DecodedFrame {
    pub fn rgba(width: u32, height: u32, pixels: Vec<u8>, delay: FrameDelay) -> Self {
        Self {
            width,
            height,
            layout: ChannelLayout::Rgba,
            pixels,
            delay,
        }
    }

    pub fn rgb(width: u32, height: u32, pixels: Vec<u8>, delay: FrameDelay) -> Self {
        Self {
            width,
            height,
            layout: ChannelLayout::Rgb,
            pixels,
            delay,
        }
    }

    pub fn dims(&self) -> FrameDims {
        FrameDims::new(self.width, self.height)
    }

    pub fn expected_len(&self) -> usize {
        self.width as usize * self.height as usize * self.layout.channels()
    }

    /// Buffer length must be exactly width × height × channels.
    pub fn check_buffer(&self) -> Result<(), String> {
        let expected = self.expected_len();
        if self.pixels.len() != expected {
            return Err(format!(
                "frame buffer holds {} bytes, expected {expected} for {} {:?}",
                self.pixels.len(),
                self.dims(),
                self.layout
            ));
        }
        Ok(())
    }

    pub fn pixel(&self, x: u32, y: u32) -> Option<&[u8]> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let channels = self.layout.channels();
        let start = (y as usize * self.width as usize + x as usize) * channels;
        self.pixels.get(start..start + channels)
    }

    /// RGBA copy of this frame; RGB pixels become fully opaque.
    pub fn to_rgba(&self) -> DecodedFrame {
        match self.layout {
            ChannelLayout::Rgba => self.clone(),
            ChannelLayout::Rgb => {
                let mut pixels = Vec::with_capacity(self.pixels.len() / 3 * 4);
                for px in self.pixels.chunks_exact(3) {
                    pixels.extend_from_slice(&[px[0], px[1], px[2], 255]);
                }
                DecodedFrame::rgba(self.width, self.height, pixels, self.delay)
            }
        }
    }
}

/// Ordered frames of one animation. Index 0 is the frame sent for analysis.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameSequence {
    frames: Vec<DecodedFrame>,
    loop_count: LoopCount,
}

impl FrameSequence {
    pub fn new(frames: Vec<DecodedFrame>, loop_count: LoopCount) -> Self {
        Self { frames, loop_count }
    }

    pub fn frames(&self) -> &[DecodedFrame] {
        &self.frames
    }

    pub fn into_frames(self) -> Vec<DecodedFrame> {
        self.frames
    }

    pub fn first(&self) -> Option<&DecodedFrame> {
        self.frames.first()
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn loop_count(&self) -> LoopCount {
        self.loop_count
    }

    pub fn delays_cs(&self) -> Vec<u16> {
        self.frames.iter().map(|frame| frame.delay.centis()).collect()
    }

    /// Shared dimensions of every frame.
    pub fn validate_uniform(&self) -> SifterResult<FrameDims> {
        let Some(first) = self.frames.first() else {
            return Err(SifterError::Geometry("frame sequence is empty".to_string()));
        };
        let dims = first.dims();
        for (index, frame) in self.frames.iter().enumerate().skip(1) {
            if frame.dims() != dims {
                return Err(SifterError::Geometry(format!(
                    "frame {index} is {} but frame 0 is {dims}",
                    frame.dims()
                )));
            }
        }
        Ok(dims)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtractMode {
    FirstFrameOnly,
    AllFramesCumulative,
}

/// Decodes GIF bytes into composited frames.
///
/// Frames come out of the decoder already composited with disposal
/// applied, so every frame is a full canvas. `max_frames` bounds how many
/// frames are accepted before the input is rejected.
pub fn extract(
    bytes: &[u8],
    mode: ExtractMode,
    max_frames: Option<usize>,
) -> SifterResult<FrameSequence> {
    let loop_count = read_loop_count(bytes)?;
    let decoder = GifDecoder::new(Cursor::new(bytes))
        .map_err(|err| SifterError::Decode(format!("not a readable GIF: {err}")))?;

    let mut frames = Vec::new();
    for (index, frame) in decoder.into_frames().enumerate() {
        if let Some(limit) = max_frames {
            if index >= limit {
                return Err(SifterError::Decode(format!(
                    "GIF has more than {limit} frames"
                )));
            }
        }
        let frame = frame.map_err(|err| {
            SifterError::Decode(format!("frame {index} failed to decode: {err}"))
        })?;
        let (numer, denom) = frame.delay().numer_denom_ms();
        let buffer = frame.into_buffer();
        frames.push(DecodedFrame::rgba(
            buffer.width(),
            buffer.height(),
            buffer.into_raw(),
            FrameDelay::from_millis_ratio(numer, denom),
        ));
        if mode == ExtractMode::FirstFrameOnly {
            break;
        }
    }
    if frames.is_empty() {
        return Err(SifterError::Decode("GIF contains no frames".to_string()));
    }

    let sequence = FrameSequence::new(frames, loop_count);
    let dims = sequence.validate_uniform()?;
    debug!(
        frames = sequence.len(),
        width = dims.width,
        height = dims.height,
        loop_count = %loop_count,
        "decoded gif"
    );
    Ok(sequence)
}

/// Reads the NETSCAPE2.0 repetition count with a header-only pass.
pub fn read_loop_count(bytes: &[u8]) -> SifterResult<LoopCount> {
    let mut options = gif::DecodeOptions::new();
    options.set_color_output(gif::ColorOutput::Indexed);
    let mut decoder = options
        .read_info(Cursor::new(bytes))
        .map_err(|err| SifterError::Decode(format!("not a readable GIF: {err}")))?;
    match decoder.next_frame_info() {
        Ok(Some(_)) => {}
        Ok(None) => return Err(SifterError::Decode("GIF contains no frames".to_string())),
        Err(err) => {
            return Err(SifterError::Decode(format!(
                "frame 0 failed to decode: {err}"
            )))
        }
    }
    Ok(LoopCount::from(decoder.repeat()))
}

/// Still of frame 0, plus the scale between it and the real frame.
#[derive(Debug, Clone, PartialEq)]
pub struct FramePreview {
    pub image: EncodedImage,
    pub frame_dims: FrameDims,
    pub preview_dims: FrameDims,
}

impl FramePreview {
    /// Factors that map preview coordinates back onto the frame.
    pub fn scale(&self) -> (f64, f64) {
        (
            f64::from(self.frame_dims.width) / f64::from(self.preview_dims.width.max(1)),
            f64::from(self.frame_dims.height) / f64::from(self.preview_dims.height.max(1)),
        )
    }

    pub fn data_uri(&self) -> String {
        self.image.to_data_uri()
    }
}

/// PNG still of frame 0. With `max_dim`, the still is downscaled to fit.
pub fn first_frame_png(bytes: &[u8], max_dim: Option<u32>) -> SifterResult<FramePreview> {
    let sequence = extract(bytes, ExtractMode::FirstFrameOnly, None)?;
    let Some(frame) = sequence.into_frames().into_iter().next() else {
        return Err(SifterError::Decode("GIF contains no frames".to_string()));
    };
    let frame = frame.to_rgba();
    let frame_dims = frame.dims();
    let Some(buffer) = RgbaImage::from_raw(frame.width, frame.height, frame.pixels) else {
        return Err(SifterError::Decode(format!(
            "frame 0 buffer does not match {frame_dims}"
        )));
    };

    let mut still = DynamicImage::ImageRgba8(buffer);
    if let Some(limit) = max_dim.filter(|limit| *limit > 0) {
        if frame_dims.width > limit || frame_dims.height > limit {
            still = still.resize(limit, limit, FilterType::Triangle);
        }
    }
    let preview_dims = FrameDims::new(still.width(), still.height());

    let mut png = Cursor::new(Vec::new());
    still
        .write_to(&mut png, ImageFormat::Png)
        .map_err(|err| SifterError::Encode(format!("PNG still encode failed: {err}")))?;
    Ok(FramePreview {
        image: EncodedImage::new(png.into_inner(), PNG_MIME),
        frame_dims,
        preview_dims,
    })
}

#[cfg(test)]
mod tests {
    use super::{
        extract, first_frame_png, read_loop_count, DecodedFrame, ExtractMode, FrameDelay,
        FrameSequence, LoopCount,
    };
    use sifter_contracts::{FrameDims, SifterError};

    /// Builds a GIF with solid-colour frames via the gif crate.
    fn solid_gif(
        width: u16,
        height: u16,
        colors: &[[u8; 4]],
        delays_cs: &[u16],
        repeat: Option<gif::Repeat>,
    ) -> Vec<u8> {
        let mut out = Vec::new();
        {
            let mut encoder = gif::Encoder::new(&mut out, width, height, &[]).unwrap();
            if let Some(repeat) = repeat {
                encoder.set_repeat(repeat).unwrap();
            }
            for (color, delay) in colors.iter().zip(delays_cs.iter()) {
                let mut rgba = color.repeat(width as usize * height as usize);
                let mut frame = gif::Frame::from_rgba_speed(width, height, &mut rgba, 10);
                frame.delay = *delay;
                frame.dispose = gif::DisposalMethod::Background;
                encoder.write_frame(&frame).unwrap();
            }
        }
        out
    }

    #[test]
    fn extract_reads_every_frame_with_delays() {
        let bytes = solid_gif(
            8,
            6,
            &[[255, 0, 0, 255], [0, 255, 0, 255], [0, 0, 255, 255]],
            &[10, 5, 20],
            Some(gif::Repeat::Infinite),
        );
        let sequence = extract(&bytes, ExtractMode::AllFramesCumulative, None).unwrap();
        assert_eq!(sequence.len(), 3);
        assert_eq!(sequence.delays_cs(), vec![10, 5, 20]);
        assert_eq!(sequence.loop_count(), LoopCount::Infinite);
        assert_eq!(sequence.validate_uniform().unwrap(), FrameDims::new(8, 6));
        assert_eq!(sequence.frames()[1].pixel(3, 3), Some(&[0, 255, 0, 255][..]));
    }

    #[test]
    fn first_frame_only_stops_after_one() {
        let bytes = solid_gif(
            4,
            4,
            &[[255, 0, 0, 255], [0, 255, 0, 255]],
            &[3, 3],
            None,
        );
        let sequence = extract(&bytes, ExtractMode::FirstFrameOnly, None).unwrap();
        assert_eq!(sequence.len(), 1);
        assert_eq!(sequence.loop_count(), LoopCount::Finite(0));
    }

    #[test]
    fn frame_limit_rejects_long_animations() {
        let bytes = solid_gif(
            2,
            2,
            &[[1, 1, 1, 255], [2, 2, 2, 255], [3, 3, 3, 255]],
            &[1, 1, 1],
            None,
        );
        assert!(extract(&bytes, ExtractMode::AllFramesCumulative, Some(3)).is_ok());
        assert!(matches!(
            extract(&bytes, ExtractMode::AllFramesCumulative, Some(2)),
            Err(SifterError::Decode(_))
        ));
    }

    #[test]
    fn non_gif_bytes_fail_to_decode() {
        assert!(matches!(
            extract(b"\x89PNG\r\n\x1a\nnot really", ExtractMode::AllFramesCumulative, None),
            Err(SifterError::Decode(_))
        ));
        assert!(matches!(
            extract(&[], ExtractMode::FirstFrameOnly, None),
            Err(SifterError::Decode(_))
        ));
    }

    #[test]
    fn finite_loop_count_is_read_from_header() {
        let bytes = solid_gif(2, 2, &[[0, 0, 0, 255]], &[1], Some(gif::Repeat::Finite(3)));
        assert_eq!(read_loop_count(&bytes).unwrap(), LoopCount::Finite(3));
    }

    #[test]
    fn mixed_sizes_are_a_geometry_error() {
        let sequence = FrameSequence::new(
            vec![
                DecodedFrame::rgba(2, 2, vec![0; 16], FrameDelay::default()),
                DecodedFrame::rgba(3, 2, vec![0; 24], FrameDelay::default()),
            ],
            LoopCount::Infinite,
        );
        assert!(matches!(
            sequence.validate_uniform(),
            Err(SifterError::Geometry(_))
        ));
    }

    #[test]
    fn delay_conversion_rounds_to_centiseconds() {
        assert_eq!(FrameDelay::from_millis_ratio(100, 1).centis(), 10);
        assert_eq!(FrameDelay::from_millis_ratio(55, 1).centis(), 6);
        assert_eq!(FrameDelay::from_millis_ratio(1, 0).centis(), 0);
        assert_eq!(FrameDelay::from_centis(20).millis(), 200);
    }

    #[test]
    fn rgb_frames_promote_to_opaque_rgba() {
        let frame = DecodedFrame::rgb(1, 2, vec![1, 2, 3, 4, 5, 6], FrameDelay::from_centis(7));
        let rgba = frame.to_rgba();
        assert_eq!(rgba.pixels, vec![1, 2, 3, 255, 4, 5, 6, 255]);
        assert_eq!(rgba.delay.centis(), 7);
        assert!(rgba.check_buffer().is_ok());
    }

    #[test]
    fn preview_downscales_and_reports_scale() {
        let bytes = solid_gif(40, 20, &[[9, 9, 9, 255]], &[1], None);
        let preview = first_frame_png(&bytes, Some(10)).unwrap();
        assert_eq!(preview.frame_dims, FrameDims::new(40, 20));
        assert_eq!(preview.preview_dims, FrameDims::new(10, 5));
        assert_eq!(preview.scale(), (4.0, 4.0));
        assert!(preview.data_uri().starts_with("data:image/png;base64,"));

        let full = first_frame_png(&bytes, None).unwrap();
        assert_eq!(full.preview_dims, FrameDims::new(40, 20));
    }
}
