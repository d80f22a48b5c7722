//! Quantized scalar codec.
//!
//! Every scalar a brain artifact stores (axon strengths, thresholds, neuron
//! params, buffer snapshots) is an integer code under one of four map shapes.
//! The codec is live at runtime too: plasticity re-encodes drifted strengths
//! and homeostasis steps buffers through code space, so decode/encode must
//! round-trip within one code step.

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// How codes map onto the physical value range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum QuantShape {
    /// Codes spread linearly across `[min, max]`.
    LinearUnsigned,
    /// Linear with gamma warp on the normalized magnitude.
    GammaUnsigned,
    /// Two adjacent center codes both decode to exactly 0; magnitude scales
    /// by `max(|min|, |max|)`.
    LinearSignedCentered,
    /// Signed-centered with gamma warp on the normalized magnitude.
    GammaSignedCentered,
}

/// A quantization map: shape plus physical range and gamma exponent.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct QuantMap {
    pub shape: QuantShape,
    pub min: f32,
    pub max: f32,
    pub gamma: f32,
}

impl QuantMap {
    pub fn new(shape: QuantShape, min: f32, max: f32, gamma: f32) -> Self {
        Self {
            shape,
            min,
            max,
            gamma: if gamma <= 0.0 { 1.0 } else { gamma },
        }
    }

    /// Largest code representable at the given bit width (1..=30 bits).
    pub fn max_code(bits: u32) -> u32 {
        assert!(
            (1..=30).contains(&bits),
            "bit width must be between 1 and 30"
        );
        (1 << bits) - 1
    }

    /// Magnitude scale for the signed-centered shapes.
    pub fn max_abs(&self) -> f32 {
        self.min.abs().max(self.max.abs())
    }

    /// Decode a stored code to its physical value. Codes outside
    /// `[0, max_code]` clamp rather than error.
    pub fn decode(&self, code: u32, bits: u32) -> f32 {
        let max_code = Self::max_code(bits);
        let code = code.min(max_code);
        match self.shape {
            QuantShape::LinearUnsigned => self.decode_unsigned(code, max_code, false),
            QuantShape::GammaUnsigned => self.decode_unsigned(code, max_code, true),
            QuantShape::LinearSignedCentered => self.decode_signed(code, max_code, false),
            QuantShape::GammaSignedCentered => self.decode_signed(code, max_code, true),
        }
    }

    /// Encode a physical value to its nearest code. Values outside
    /// `[min, max]` clamp rather than error.
    pub fn encode(&self, value: f32, bits: u32) -> u32 {
        let max_code = Self::max_code(bits);
        match self.shape {
            QuantShape::LinearUnsigned => self.encode_unsigned(value, max_code, false),
            QuantShape::GammaUnsigned => self.encode_unsigned(value, max_code, true),
            QuantShape::LinearSignedCentered => self.encode_signed(value, max_code, false),
            QuantShape::GammaSignedCentered => self.encode_signed(value, max_code, true),
        }
    }

    fn decode_unsigned(&self, code: u32, max_code: u32, use_gamma: bool) -> f32 {
        let range = self.max - self.min;
        if range == 0.0 {
            return self.min;
        }

        let mut u = code as f32 / max_code as f32;
        if use_gamma {
            u = u.powf(self.gamma);
        }
        self.min + u * range
    }

    fn encode_unsigned(&self, value: f32, max_code: u32, use_gamma: bool) -> u32 {
        let range = self.max - self.min;
        if range == 0.0 {
            return 0;
        }

        let clamped = value.clamp(self.min, self.max);
        let mut u = (clamped - self.min) / range;
        if use_gamma {
            u = u.powf(1.0 / self.gamma);
        }
        let code = (u * max_code as f32).round();
        (code.max(0.0) as u32).min(max_code)
    }

    fn decode_signed(&self, code: u32, max_code: u32, use_gamma: bool) -> f32 {
        let max_abs = self.max_abs();
        if max_abs == 0.0 {
            return 0.0;
        }

        let mut t = Self::signed_unit(code, max_code);
        if use_gamma {
            t = t.signum() * t.abs().powf(self.gamma);
        }
        (t * max_abs).clamp(self.min, self.max)
    }

    fn encode_signed(&self, value: f32, max_code: u32, use_gamma: bool) -> u32 {
        let max_abs = self.max_abs();
        let center_hi = (max_code + 1) / 2;
        let center_lo = center_hi.wrapping_sub(1);

        if max_abs == 0.0 || center_hi == 0 || center_lo == 0 {
            return center_hi.min(max_code);
        }

        let clamped = value.clamp(self.min, self.max);
        let mut t = (clamped / max_abs).clamp(-1.0, 1.0);
        if use_gamma {
            t = t.signum() * t.abs().powf(1.0 / self.gamma);
        }

        let steps = (t.abs() * center_lo as f32).round() as u32;
        let code = if t >= 0.0 {
            center_hi.saturating_add(steps)
        } else {
            center_lo.saturating_sub(steps.min(center_lo))
        };
        code.min(max_code)
    }

    // Normalized signed decode: the two center codes form a symmetric
    // dead-zone at exactly 0.
    fn signed_unit(code: u32, max_code: u32) -> f32 {
        let center_hi = (max_code + 1) / 2;
        if center_hi == 0 {
            return 0.0;
        }
        let center_lo = center_hi - 1;
        if center_lo == 0 || code == center_lo || code == center_hi {
            return 0.0;
        }

        if code < center_lo {
            -((center_lo - code) as f32) / center_lo as f32
        } else {
            (code - center_hi) as f32 / center_lo as f32
        }
    }
}

/// The quantization maps a brain artifact uses for its neuron and axon
/// scalars. The loader hands these to the shard state; the engine reuses the
/// strength map when plasticity re-encodes drifted strengths.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct QuantSchema {
    pub strength: QuantMap,
    pub pre_activation_threshold: QuantMap,
    pub activation_threshold: QuantMap,
    pub param_a: QuantMap,
    pub param_b: QuantMap,
}

impl Default for QuantSchema {
    fn default() -> Self {
        Self {
            strength: QuantMap::new(QuantShape::GammaSignedCentered, -1.0, 1.0, 2.0),
            pre_activation_threshold: QuantMap::new(
                QuantShape::GammaSignedCentered,
                -1.0,
                1.0,
                2.0,
            ),
            activation_threshold: QuantMap::new(QuantShape::GammaUnsigned, 0.0, 1.0, 2.0),
            param_a: QuantMap::new(QuantShape::GammaSignedCentered, -3.0, 3.0, 2.0),
            param_b: QuantMap::new(QuantShape::GammaSignedCentered, -3.0, 3.0, 2.0),
        }
    }
}

/// Map used for buffer values in homeostasis stepping and snapshot capture.
pub fn buffer_map() -> QuantMap {
    QuantMap::new(QuantShape::GammaSignedCentered, -4.0, 4.0, 2.0)
}

/// Bit width used whenever buffers pass through code space.
pub const BUFFER_BITS: u32 = 16;
