use std::io::Cursor;

use image::codecs::gif::GifDecoder;
use image::AnimationDecoder;
use sifter_contracts::{
    data_uri, ColorSpec, ColorSubstitutionRule, FrameDims, Rectangle, SifterError,
};
use sifter_engine::{
    apply, apply_all, encode, extract, DecodedFrame, DetectorConfig, DistanceMetric, EditConfig,
    EncoderConfig, ExtractMode, FrameDelay, FrameSequence, GifEditPipeline, LoopCount,
    TransformPlan, TransformPolicy,
};

const RED: [u8; 4] = [255, 0, 0, 255];
const BLUE: [u8; 4] = [0, 0, 255, 255];
const BACKGROUNDS: [[u8; 4]; 3] = [[30, 120, 60, 255], [240, 230, 140, 255], [70, 70, 70, 255]];

/// 100x100 frames, each with its own background and a red square at
/// (10,10,20,20).
fn red_square_gif(delays_cs: &[u16], repeat: gif::Repeat) -> Vec<u8> {
    let mut out = Vec::new();
    {
        let mut encoder = gif::Encoder::new(&mut out, 100, 100, &[]).unwrap();
        encoder.set_repeat(repeat).unwrap();
        for (index, delay) in delays_cs.iter().enumerate() {
            let background = BACKGROUNDS[index % BACKGROUNDS.len()];
            let mut rgba = Vec::with_capacity(100 * 100 * 4);
            for y in 0..100u32 {
                for x in 0..100u32 {
                    let inside = (10..30).contains(&x) && (10..30).contains(&y);
                    rgba.extend_from_slice(if inside { &RED } else { &background });
                }
            }
            let mut frame = gif::Frame::from_rgba_speed(100, 100, &mut rgba, 10);
            frame.delay = *delay;
            encoder.write_frame(&frame).unwrap();
        }
    }
    out
}

fn pipeline() -> GifEditPipeline {
    GifEditPipeline::new(EditConfig::default(), &DetectorConfig::default())
}

fn decode_all(bytes: &[u8]) -> FrameSequence {
    extract(bytes, ExtractMode::AllFramesCumulative, None).unwrap()
}

/// Frame delays as the `image` decoder reports them, in milliseconds.
fn delays_ms(bytes: &[u8]) -> Vec<u32> {
    GifDecoder::new(Cursor::new(bytes))
        .unwrap()
        .into_frames()
        .map(|frame| {
            let (numer, denom) = frame.unwrap().delay().numer_denom_ms();
            numer / denom
        })
        .collect()
}

#[test]
fn no_region_round_trip_keeps_frames_delays_and_loop() -> anyhow::Result<()> {
    let bytes = red_square_gif(&[10, 5, 20], gif::Repeat::Finite(3));
    let uri = data_uri::encode(&bytes, "image/gif");

    let outcome = pipeline().replace_section(&uri, Rectangle::new(0, 0, 0, 0))?;
    assert!(outcome.passthrough);
    assert_eq!(outcome.image()?.bytes, bytes);

    let input = decode_all(&bytes);
    let reencoded = decode_all(&encode(&input, &EncoderConfig::default())?);
    assert_eq!(reencoded.len(), input.len());
    assert_eq!(reencoded.delays_cs(), input.delays_cs());
    assert_eq!(reencoded.loop_count(), LoopCount::Finite(3));
    for (left, right) in input.frames().iter().zip(reencoded.frames()) {
        assert_eq!(left.pixels, right.pixels);
    }
    Ok(())
}

#[test]
fn parallel_transform_preserves_frame_order() -> anyhow::Result<()> {
    let frames = (0..64u8)
        .map(|index| {
            let mut pixels = [0u8, 0, 0, 255].repeat(16);
            pixels[0] = index;
            DecodedFrame::rgba(4, 4, pixels, FrameDelay::from_centis(u16::from(index) + 1))
        })
        .collect();
    let sequence = FrameSequence::new(frames, LoopCount::Infinite);
    let plan = TransformPlan::new(
        TransformPolicy::OpaqueReplace {
            rect: Rectangle::new(2, 2, 2, 2),
            fill: ColorSpec::WHITE,
        },
        FrameDims::new(4, 4),
        DistanceMetric::default(),
    )?;

    let out = apply_all(&sequence, &plan)?;
    assert_eq!(out.len(), 64);
    for (index, frame) in out.frames().iter().enumerate() {
        assert_eq!(frame.pixels[0] as usize, index);
        assert_eq!(frame.delay.centis() as usize, index + 1);
    }
    Ok(())
}

#[test]
fn out_of_bounds_rectangles_fail_without_output() {
    let uri = data_uri::encode(&red_square_gif(&[10], gif::Repeat::Infinite), "image/gif");
    let rects = [
        Rectangle::new(90, 0, 11, 10),
        Rectangle::new(0, 95, 10, 6),
        Rectangle::new(100, 100, 1, 1),
        Rectangle::new(0, 0, 101, 100),
    ];
    for rect in rects {
        for result in [
            pipeline().replace_section(&uri, rect),
            pipeline().cutout_section(&uri, rect),
            pipeline().punch_section(&uri, rect),
            pipeline().crop(&uri, rect),
        ] {
            assert!(
                matches!(
                    result,
                    Err(SifterError::InvalidRegion(_)) | Err(SifterError::Geometry(_))
                ),
                "{rect} was accepted"
            );
        }
    }

    let plan = TransformPlan::new(
        TransformPolicy::Crop {
            rect: Rectangle::new(90, 0, 11, 10),
        },
        FrameDims::new(100, 100),
        DistanceMetric::default(),
    );
    assert!(matches!(plan, Err(SifterError::Geometry(_))));
}

#[test]
fn substituting_a_colour_with_itself_changes_nothing() -> anyhow::Result<()> {
    let sequence = decode_all(&red_square_gif(&[4, 4, 4], gif::Repeat::Infinite));
    for tolerance in [0.0, 1.0, 20.0, 55.5, 100.0] {
        for metric in [DistanceMetric::Ciede2000, DistanceMetric::EuclideanRgb] {
            let rule = ColorSubstitutionRule::new(ColorSpec::new(255, 0, 0), ColorSpec::new(255, 0, 0), tolerance)?;
            let plan = TransformPlan::new(
                TransformPolicy::ColorSubstitute { rule },
                FrameDims::new(100, 100),
                metric,
            )?;
            let out = apply_all(&sequence, &plan)?;
            assert_eq!(out.frames(), sequence.frames());
        }
    }
    Ok(())
}

#[test]
fn opaque_replace_touches_only_the_rectangle() -> anyhow::Result<()> {
    let (width, height) = (23u32, 17u32);
    let pixels = (0..width * height)
        .flat_map(|index| {
            let value = (index * 37 % 251) as u8;
            [value, value.wrapping_mul(3), 255 - value, (value % 7) * 36]
        })
        .collect::<Vec<u8>>();
    let frame = DecodedFrame::rgba(width, height, pixels, FrameDelay::from_centis(5));
    let rect = Rectangle::new(4, 3, 11, 9);
    let fill = ColorSpec::new(12, 200, 99);
    let plan = TransformPlan::new(
        TransformPolicy::OpaqueReplace { rect, fill },
        FrameDims::new(width, height),
        DistanceMetric::default(),
    )?;

    let out = apply(&frame, &plan)?;
    for y in 0..height {
        for x in 0..width {
            let after = out.pixel(x, y).unwrap();
            if rect.contains(x, y) {
                assert_eq!(after, &[12, 200, 99, 255][..], "({x},{y})");
            } else {
                assert_eq!(after, frame.pixel(x, y).unwrap(), "({x},{y})");
            }
        }
    }
    Ok(())
}

#[test]
fn delays_survive_an_edit_in_order() -> anyhow::Result<()> {
    let uri = data_uri::encode(&red_square_gif(&[10, 5, 20], gif::Repeat::Infinite), "image/gif");
    let outcome = pipeline().cutout_section(&uri, Rectangle::new(0, 0, 5, 5))?;
    assert_eq!(outcome.delays_cs, vec![10, 5, 20]);
    assert_eq!(delays_ms(&outcome.image()?.bytes), vec![100, 50, 200]);
    Ok(())
}

#[test]
fn red_square_turns_blue_on_every_frame() -> anyhow::Result<()> {
    let bytes = red_square_gif(&[10, 5, 20], gif::Repeat::Infinite);
    let uri = data_uri::encode(&bytes, "image/gif");
    let rule = ColorSubstitutionRule::new(ColorSpec::new(255, 0, 0), ColorSpec::new(0, 0, 255), 20.0)?;

    let outcome = pipeline().replace_color(&uri, rule)?;
    assert_eq!(outcome.frame_count, 3);
    assert_eq!(outcome.image()?.mime_type, "image/gif");

    let before = decode_all(&bytes);
    let after = decode_all(&outcome.image()?.bytes);
    assert_eq!(after.len(), 3);
    assert_eq!(after.delays_cs(), vec![10, 5, 20]);
    assert_eq!(after.loop_count(), LoopCount::Infinite);
    for (index, (old, new)) in before.frames().iter().zip(after.frames()).enumerate() {
        for y in 0..100 {
            for x in 0..100 {
                let inside = (10..30).contains(&x) && (10..30).contains(&y);
                let pixel = new.pixel(x, y).unwrap();
                if inside {
                    assert_eq!(pixel, &BLUE[..], "frame {index} ({x},{y})");
                } else {
                    assert_eq!(pixel, old.pixel(x, y).unwrap(), "frame {index} ({x},{y})");
                }
            }
        }
    }
    Ok(())
}
