//! Qm.n fixed-point types used on the wire.
//!
//! `UFixed<I, F>` is unsigned, `IFixed<I, F>` is two's complement with the
//! sign bit counted in `I`. `I + F` must be 8, 16, 24 or 32.
//!
//! Conversion from floating point rounds half away from zero and then
//! saturates to the representable range; NaN converts to zero. Conversion
//! back to floating point is exact.

use heapless::Vec;

pub type Q16_16 = UFixed<16, 16>;
pub type Q24_8 = UFixed<24, 8>;
pub type SQ16_16 = IFixed<16, 16>;
pub type SQ24_8 = IFixed<24, 8>;
pub type SQ8_8 = IFixed<8, 8>;

pub type WireBytes = Vec<u8, 4>;

pub trait FixedPoint: Copy {
    /// Width on the wire.
    const BYTES: usize;

    fn from_f64(value: f64) -> Self;
    fn to_f64(self) -> f64;
    /// Raw wire bits, zero-extended to 32 bits.
    fn to_raw(self) -> u32;
    /// Build from raw wire bits; bits above the width are ignored.
    fn from_raw(raw: u32) -> Self;

    fn to_le_bytes(self) -> WireBytes {
        let mut out = Vec::new();
        for &byte in &self.to_raw().to_le_bytes()[..Self::BYTES] {
            // Capacity 4 always fits BYTES <= 4.
            let _ = out.push(byte);
        }
        out
    }

    fn from_le_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != Self::BYTES {
            return None;
        }
        let mut raw = [0u8; 4];
        raw[..Self::BYTES].copy_from_slice(bytes);
        Some(Self::from_raw(u32::from_le_bytes(raw)))
    }
}

const fn width_mask(bits: u32) -> u32 {
    if bits >= 32 {
        u32::MAX
    } else {
        (1u32 << bits) - 1
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct UFixed<const I: u32, const F: u32> {
    bits: u32,
}

impl<const I: u32, const F: u32> UFixed<I, F> {
    const VALID: () = assert!(I + F > 0 && I + F <= 32 && (I + F) % 8 == 0);
    pub const WIDTH: u32 = I + F;
    const MASK: u32 = width_mask(I + F);
    const SCALE: f64 = (1u64 << F) as f64;

    pub const fn from_bits(bits: u32) -> Self {
        let () = Self::VALID;
        Self { bits: bits & Self::MASK }
    }

    pub const fn bits(self) -> u32 {
        self.bits
    }

    pub fn max_value() -> f64 {
        f64::from(Self::MASK) / Self::SCALE
    }
}

impl<const I: u32, const F: u32> FixedPoint for UFixed<I, F> {
    const BYTES: usize = ((I + F) / 8) as usize;

    fn from_f64(value: f64) -> Self {
        if value.is_nan() {
            return Self::from_bits(0);
        }
        let scaled = (value * Self::SCALE).round();
        let bits = if scaled <= 0.0 {
            0
        } else if scaled >= f64::from(Self::MASK) {
            Self::MASK
        } else {
            scaled as u32
        };
        Self::from_bits(bits)
    }

    fn to_f64(self) -> f64 {
        f64::from(self.bits) / Self::SCALE
    }

    fn to_raw(self) -> u32 {
        self.bits
    }

    fn from_raw(raw: u32) -> Self {
        Self::from_bits(raw)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct IFixed<const I: u32, const F: u32> {
    bits: i32,
}

impl<const I: u32, const F: u32> IFixed<I, F> {
    const VALID: () = assert!(I + F >= 8 && I + F <= 32 && (I + F) % 8 == 0 && I >= 1);
    pub const WIDTH: u32 = I + F;
    const MASK: u32 = width_mask(I + F);
    const MAX_BITS: i32 = (width_mask(I + F - 1)) as i32;
    const MIN_BITS: i32 = -Self::MAX_BITS - 1;
    const SCALE: f64 = (1u64 << F) as f64;

    pub const fn from_bits(bits: i32) -> Self {
        let () = Self::VALID;
        let bits = if bits > Self::MAX_BITS {
            Self::MAX_BITS
        } else if bits < Self::MIN_BITS {
            Self::MIN_BITS
        } else {
            bits
        };
        Self { bits }
    }

    pub const fn bits(self) -> i32 {
        self.bits
    }
}

impl<const I: u32, const F: u32> FixedPoint for IFixed<I, F> {
    const BYTES: usize = ((I + F) / 8) as usize;

    fn from_f64(value: f64) -> Self {
        if value.is_nan() {
            return Self::from_bits(0);
        }
        let scaled = (value * Self::SCALE).round();
        let bits = if scaled <= f64::from(Self::MIN_BITS) {
            Self::MIN_BITS
        } else if scaled >= f64::from(Self::MAX_BITS) {
            Self::MAX_BITS
        } else {
            scaled as i32
        };
        Self::from_bits(bits)
    }

    fn to_f64(self) -> f64 {
        f64::from(self.bits) / Self::SCALE
    }

    fn to_raw(self) -> u32 {
        (self.bits as u32) & Self::MASK
    }

    fn from_raw(raw: u32) -> Self {
        let shift = 32 - Self::WIDTH;
        // Sign-extend from the top bit of the wire width.
        let extended = ((raw << shift) as i32) >> shift;
        Self::from_bits(extended)
    }
}
