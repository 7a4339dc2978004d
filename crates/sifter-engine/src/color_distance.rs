use std::fmt;
use std::str::FromStr;

use sifter_contracts::{ColorSpec, SifterError};

/// CIEDE2000 on sRGB with a D65 white point by default. `EuclideanRgb` is
/// rescaled to the same 0–100 range as tolerances.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DistanceMetric {
    #[default]
    Ciede2000,
    EuclideanRgb,
}

impl DistanceMetric {
    pub fn as_str(&self) -> &'static str {
        match self {
            DistanceMetric::Ciede2000 => "ciede2000",
            DistanceMetric::EuclideanRgb => "rgb",
        }
    }

    pub fn distance(&self, left: [u8; 3], right: [u8; 3]) -> f64 {
        match self {
            DistanceMetric::Ciede2000 => ciede2000(srgb_to_lab(left), srgb_to_lab(right)),
            DistanceMetric::EuclideanRgb => euclidean_rgb(left, right),
        }
    }
}

impl fmt::Display for DistanceMetric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DistanceMetric {
    type Err = SifterError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "ciede2000" | "de2000" | "lab" => Ok(DistanceMetric::Ciede2000),
            "rgb" | "euclidean" | "euclidean_rgb" => Ok(DistanceMetric::EuclideanRgb),
            other => Err(SifterError::MalformedInput(format!(
                "unknown distance metric '{other}' (expected ciede2000 or rgb)"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Lab {
    pub l: f64,
    pub a: f64,
    pub b: f64,
}

impl Lab {
    pub fn new(l: f64, a: f64, b: f64) -> Self {
        Self { l, a, b }
    }
}

const REF_X: f64 = 95.047;
const REF_Y: f64 = 100.0;
const REF_Z: f64 = 108.883;

pub fn srgb_to_lab(rgb: [u8; 3]) -> Lab {
    let linear = |channel: u8| -> f64 {
        let c = f64::from(channel) / 255.0;
        let value = if c > 0.04045 {
            ((c + 0.055) / 1.055).powf(2.4)
        } else {
            c / 12.92
        };
        value * 100.0
    };
    let (r, g, b) = (linear(rgb[0]), linear(rgb[1]), linear(rgb[2]));

    let x = r * 0.4124 + g * 0.3576 + b * 0.1805;
    let y = r * 0.2126 + g * 0.7152 + b * 0.0722;
    let z = r * 0.0193 + g * 0.1192 + b * 0.9505;

    let f = |t: f64| -> f64 {
        if t > 0.008856 {
            t.cbrt()
        } else {
            7.787 * t + 16.0 / 116.0
        }
    };
    let (fx, fy, fz) = (f(x / REF_X), f(y / REF_Y), f(z / REF_Z));
    Lab::new(116.0 * fy - 16.0, 500.0 * (fx - fy), 200.0 * (fy - fz))
}

pub fn ciede2000(lab1: Lab, lab2: Lab) -> f64 {
    let pow25_7 = 25f64.powi(7);

    let c1 = lab1.a.hypot(lab1.b);
    let c2 = lab2.a.hypot(lab2.b);
    let c_bar = (c1 + c2) / 2.0;
    let c_bar7 = c_bar.powi(7);
    let g = 0.5 * (1.0 - (c_bar7 / (c_bar7 + pow25_7)).sqrt());

    let a1p = (1.0 + g) * lab1.a;
    let a2p = (1.0 + g) * lab2.a;
    let c1p = a1p.hypot(lab1.b);
    let c2p = a2p.hypot(lab2.b);

    let hue = |b: f64, ap: f64| -> f64 {
        if b == 0.0 && ap == 0.0 {
            return 0.0;
        }
        let degrees = b.atan2(ap).to_degrees();
        if degrees < 0.0 {
            degrees + 360.0
        } else {
            degrees
        }
    };
    let h1p = hue(lab1.b, a1p);
    let h2p = hue(lab2.b, a2p);

    let delta_lp = lab2.l - lab1.l;
    let delta_cp = c2p - c1p;
    let chroma_product = c1p * c2p;

    let delta_hp_angle = if chroma_product == 0.0 {
        0.0
    } else {
        let diff = h2p - h1p;
        if diff.abs() <= 180.0 {
            diff
        } else if diff > 180.0 {
            diff - 360.0
        } else {
            diff + 360.0
        }
    };
    let delta_hp = 2.0 * chroma_product.sqrt() * (delta_hp_angle.to_radians() / 2.0).sin();

    let l_bar_p = (lab1.l + lab2.l) / 2.0;
    let c_bar_p = (c1p + c2p) / 2.0;
    let h_bar_p = if chroma_product == 0.0 {
        h1p + h2p
    } else if (h1p - h2p).abs() <= 180.0 {
        (h1p + h2p) / 2.0
    } else if h1p + h2p < 360.0 {
        (h1p + h2p + 360.0) / 2.0
    } else {
        (h1p + h2p - 360.0) / 2.0
    };

    let t = 1.0 - 0.17 * (h_bar_p - 30.0).to_radians().cos()
        + 0.24 * (2.0 * h_bar_p).to_radians().cos()
        + 0.32 * (3.0 * h_bar_p + 6.0).to_radians().cos()
        - 0.20 * (4.0 * h_bar_p - 63.0).to_radians().cos();
    let delta_theta = 30.0 * (-((h_bar_p - 275.0) / 25.0).powi(2)).exp();
    let c_bar_p7 = c_bar_p.powi(7);
    let r_c = 2.0 * (c_bar_p7 / (c_bar_p7 + pow25_7)).sqrt();
    let l_offset = (l_bar_p - 50.0).powi(2);
    let s_l = 1.0 + 0.015 * l_offset / (20.0 + l_offset).sqrt();
    let s_c = 1.0 + 0.045 * c_bar_p;
    let s_h = 1.0 + 0.015 * c_bar_p * t;
    let r_t = -(2.0 * delta_theta).to_radians().sin() * r_c;

    let l_term = delta_lp / s_l;
    let c_term = delta_cp / s_c;
    let h_term = delta_hp / s_h;
    (l_term * l_term + c_term * c_term + h_term * h_term + r_t * c_term * h_term).sqrt()
}

/// RGB euclidean distance scaled so black↔white is 100.
pub fn euclidean_rgb(left: [u8; 3], right: [u8; 3]) -> f64 {
    let sum: f64 = left
        .iter()
        .zip(right.iter())
        .map(|(l, r)| {
            let delta = f64::from(*l) - f64::from(*r);
            delta * delta
        })
        .sum();
    sum.sqrt() / (3.0f64 * 255.0 * 255.0).sqrt() * 100.0
}

/// Precomputed matcher for one substitution source colour.
#[derive(Debug, Clone, Copy)]
pub struct ColorMatcher {
    metric: DistanceMetric,
    source: [u8; 3],
    source_lab: Lab,
    tolerance: f64,
}

impl ColorMatcher {
    pub fn new(source: ColorSpec, tolerance: f64, metric: DistanceMetric) -> Self {
        let source = source.to_array();
        Self {
            metric,
            source,
            source_lab: srgb_to_lab(source),
            tolerance,
        }
    }

    pub fn distance(&self, rgb: [u8; 3]) -> f64 {
        match self.metric {
            DistanceMetric::Ciede2000 => ciede2000(self.source_lab, srgb_to_lab(rgb)),
            DistanceMetric::EuclideanRgb => euclidean_rgb(self.source, rgb),
        }
    }

    pub fn matches(&self, rgb: [u8; 3]) -> bool {
        self.distance(rgb) < self.tolerance
    }
}

#[cfg(test)]
mod tests {
    use sifter_contracts::ColorSpec;

    use super::{ciede2000, euclidean_rgb, srgb_to_lab, ColorMatcher, DistanceMetric, Lab};

    fn assert_close(actual: f64, expected: f64, eps: f64) {
        assert!(
            (actual - expected).abs() < eps,
            "expected {expected}, got {actual}"
        );
    }

    #[test]
    fn ciede2000_matches_reference_pairs() {
        // Sharma, Wu & Dalal reference data.
        assert_close(
            ciede2000(
                Lab::new(50.0, 2.6772, -79.7751),
                Lab::new(50.0, 0.0, -82.7485),
            ),
            2.0425,
            1e-4,
        );
        assert_close(
            ciede2000(Lab::new(50.0, 2.5, 0.0), Lab::new(73.0, 25.0, -18.0)),
            27.1492,
            1e-4,
        );
        assert_close(
            ciede2000(Lab::new(50.0, 2.5, 0.0), Lab::new(50.0, 0.0, -2.5)),
            4.3065,
            1e-4,
        );
    }

    #[test]
    fn ciede2000_is_zero_for_identical_colors() {
        let lab = srgb_to_lab([12, 200, 77]);
        assert_close(ciede2000(lab, lab), 0.0, 1e-12);
    }

    #[test]
    fn srgb_white_maps_to_l100() {
        let white = srgb_to_lab([255, 255, 255]);
        assert_close(white.l, 100.0, 0.01);
        assert_close(white.a, 0.0, 0.05);
        assert_close(white.b, 0.0, 0.05);
        let black = srgb_to_lab([0, 0, 0]);
        assert_close(black.l, 0.0, 1e-9);
    }

    #[test]
    fn euclidean_scale_spans_zero_to_hundred() {
        assert_close(euclidean_rgb([0, 0, 0], [255, 255, 255]), 100.0, 1e-9);
        assert_close(euclidean_rgb([9, 9, 9], [9, 9, 9]), 0.0, 1e-12);
    }

    #[test]
    fn red_and_blue_are_far_apart() {
        let distance = DistanceMetric::Ciede2000.distance([255, 0, 0], [0, 0, 255]);
        assert!(distance > 20.0, "got {distance}");
    }

    #[test]
    fn matcher_uses_strict_threshold() {
        let matcher = ColorMatcher::new(ColorSpec::new(255, 0, 0), 20.0, DistanceMetric::Ciede2000);
        assert!(matcher.matches([255, 0, 0]));
        assert!(matcher.matches([250, 5, 5]));
        assert!(!matcher.matches([0, 0, 255]));
        assert!(!matcher.matches([255, 255, 255]));

        let zero = ColorMatcher::new(ColorSpec::new(255, 0, 0), 0.0, DistanceMetric::Ciede2000);
        assert!(!zero.matches([255, 0, 0]));
    }

    #[test]
    fn parse_metric_names() {
        assert_eq!("CIEDE2000".parse::<DistanceMetric>().unwrap(), DistanceMetric::Ciede2000);
        assert_eq!("rgb".parse::<DistanceMetric>().unwrap(), DistanceMetric::EuclideanRgb);
        assert!("hsv".parse::<DistanceMetric>().is_err());
    }
}
