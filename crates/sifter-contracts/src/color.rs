use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::SifterError;

pub const DEFAULT_TOLERANCE: f64 = 20.0;
pub const MAX_TOLERANCE: f64 = 100.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ColorSpec {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl ColorSpec {
    pub const WHITE: ColorSpec = ColorSpec::new(255, 255, 255);
    pub const BLACK: ColorSpec = ColorSpec::new(0, 0, 0);

    pub const fn new(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b }
    }

    pub fn to_array(self) -> [u8; 3] {
        [self.r, self.g, self.b]
    }

    pub fn to_hex(self) -> String {
        format!("#{}", hex::encode(self.to_array()))
    }
}

impl fmt::Display for ColorSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "rgb({},{},{})", self.r, self.g, self.b)
    }
}

impl FromStr for ColorSpec {
    type Err = SifterError;

    /// Accepts `r,g,b`, `#rrggbb` or `rrggbb`.
    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let trimmed = raw.trim();
        if trimmed.contains(',') {
            let parts: Vec<&str> = trimmed.split(',').map(str::trim).collect();
            if parts.len() != 3 {
                return Err(SifterError::MalformedInput(format!(
                    "color must have three components (got '{raw}')"
                )));
            }
            let mut channels = [0u8; 3];
            for (slot, part) in channels.iter_mut().zip(parts) {
                *slot = part.parse::<u8>().map_err(|_| {
                    SifterError::MalformedInput(format!(
                        "color component '{part}' is not in 0..=255"
                    ))
                })?;
            }
            return Ok(ColorSpec::new(channels[0], channels[1], channels[2]));
        }

        let digits = trimmed.strip_prefix('#').unwrap_or(trimmed);
        let bytes = hex::decode(digits)
            .map_err(|err| SifterError::MalformedInput(format!("invalid hex color '{raw}': {err}")))?;
        match bytes.as_slice() {
            [r, g, b] => Ok(ColorSpec::new(*r, *g, *b)),
            _ => Err(SifterError::MalformedInput(format!(
                "hex color must be 6 digits (got '{raw}')"
            ))),
        }
    }
}

/// Every pixel closer than `tolerance` to `source` is rewritten to `target`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ColorSubstitutionRule {
    pub source: ColorSpec,
    pub target: ColorSpec,
    pub tolerance: f64,
}

impl ColorSubstitutionRule {
    pub fn new(source: ColorSpec, target: ColorSpec, tolerance: f64) -> Result<Self, SifterError> {
        let rule = Self {
            source,
            target,
            tolerance,
        };
        rule.validate()?;
        Ok(rule)
    }

    pub fn validate(&self) -> Result<(), SifterError> {
        if !self.tolerance.is_finite() || !(0.0..=MAX_TOLERANCE).contains(&self.tolerance) {
            return Err(SifterError::MalformedInput(format!(
                "tolerance must be within 0..=100 (got {})",
                self.tolerance
            )));
        }
        Ok(())
    }

    pub fn is_identity(&self) -> bool {
        self.source == self.target || self.tolerance == 0.0
    }
}
