use sifter_contracts::{SifterError, SifterResult};
use tracing::debug;

use crate::config::EncoderConfig;
use crate::frames::{FrameSequence, LoopCount};

/// Re-encodes composited frames as an animated GIF.
///
/// Every frame is written full-canvas with background disposal, so pixels
/// made transparent by an edit stay transparent on playback. Delays are
/// written in the stored centiseconds and the loop count is carried over
/// (`Finite(0)` writes no NETSCAPE2.0 extension). Every alpha-0 pixel shares
/// the frame's single transparent index whatever its RGB.
pub fn encode(sequence: &FrameSequence, config: &EncoderConfig) -> SifterResult<Vec<u8>> {
    let dims = sequence
        .validate_uniform()
        .map_err(|err| SifterError::Encode(format!("cannot encode: {err}")))?;
    let width = u16::try_from(dims.width)
        .map_err(|_| SifterError::Encode(format!("{dims} exceeds the GIF canvas limit")))?;
    let height = u16::try_from(dims.height)
        .map_err(|_| SifterError::Encode(format!("{dims} exceeds the GIF canvas limit")))?;
    for (index, frame) in sequence.frames().iter().enumerate() {
        frame
            .check_buffer()
            .map_err(|reason| SifterError::Encode(format!("frame {index}: {reason}")))?;
    }
    let speed = config.quantize_speed.clamp(1, 30);

    let mut out = Vec::new();
    {
        let mut encoder = gif::Encoder::new(&mut out, width, height, &[])
            .map_err(|err| SifterError::Encode(format!("GIF header write failed: {err}")))?;
        let repeat = match sequence.loop_count() {
            LoopCount::Infinite => Some(gif::Repeat::Infinite),
            LoopCount::Finite(0) => None,
            LoopCount::Finite(count) => Some(gif::Repeat::Finite(count)),
        };
        if let Some(repeat) = repeat {
            encoder.set_repeat(repeat).map_err(|err| {
                SifterError::Encode(format!("loop extension write failed: {err}"))
            })?;
        }

        for (index, frame) in sequence.frames().iter().enumerate() {
            let mut rgba = frame.to_rgba().pixels;
            collapse_transparent(&mut rgba);
            let mut gif_frame = gif::Frame::from_rgba_speed(width, height, &mut rgba, speed);
            pin_transparent_index(&mut gif_frame, &rgba);
            gif_frame.delay = frame.delay.centis();
            gif_frame.dispose = gif::DisposalMethod::Background;
            encoder.write_frame(&gif_frame).map_err(|err| {
                SifterError::Encode(format!("frame {index} write failed: {err}"))
            })?;
        }
    }

    debug!(
        frames = sequence.len(),
        bytes = out.len(),
        speed,
        "encoded gif"
    );
    Ok(out)
}

const TRANSPARENT_KEY: [u8; 4] = [0, 0, 0, 0];

/// A GIF frame has one transparent index, so all alpha-0 pixels must agree
/// on a single colour before quantization.
fn collapse_transparent(rgba: &mut [u8]) {
    for px in rgba.chunks_exact_mut(4) {
        if px[3] == 0 {
            px.copy_from_slice(&TRANSPARENT_KEY);
        }
    }
}

/// NeuQuant may hand the transparent index to nearby opaque colours, or
/// give the key a different index. Force alpha-0 pixels onto the key and
/// move opaque ones off it.
fn pin_transparent_index(frame: &mut gif::Frame<'_>, rgba: &[u8]) {
    let Some(key) = frame.transparent else {
        return;
    };
    let Some(palette) = frame.palette.clone() else {
        return;
    };
    let buffer = frame.buffer.to_mut();
    for (slot, px) in buffer.iter_mut().zip(rgba.chunks_exact(4)) {
        if px[3] == 0 {
            *slot = key;
        } else if *slot == key {
            if let Some(nearest) = nearest_entry(&palette, px, key) {
                *slot = nearest;
            }
        }
    }
}

fn nearest_entry(palette: &[u8], px: &[u8], skip: u8) -> Option<u8> {
    palette
        .chunks_exact(3)
        .enumerate()
        .filter(|(index, _)| *index != usize::from(skip))
        .min_by_key(|(_, entry)| {
            entry
                .iter()
                .zip(px)
                .map(|(a, b)| {
                    let d = i32::from(*a) - i32::from(*b);
                    d * d
                })
                .sum::<i32>()
        })
        .and_then(|(index, _)| u8::try_from(index).ok())
}
