//! DSHOT-style throttle codec.
//!
//! Frame layout (16 bits, MSB first):
//! - bits 15..5: throttle code (0-2047)
//! - bit 4: telemetry request
//! - bits 3..0: checksum, XOR fold of the leading 12 bits

use thiserror::Error;

pub const PWM_MIN: i32 = 1000;
pub const PWM_MAX: i32 = 2000;
pub const CODE_MIN: i32 = 48;
pub const CODE_MAX: i32 = 2047;

pub const FRAME_BITS: usize = 16;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("frame must be exactly {FRAME_BITS} bits, got {len}")]
    Length { len: usize },
    #[error("invalid digit {digit:?} at position {pos} (expected '0' or '1')")]
    InvalidDigit { pos: usize, digit: char },
    #[error("throttle code {0} does not fit in 11 bits")]
    ThrottleOutOfRange(u16),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecodedFrame {
    pub throttle: u16,
    pub telemetry: bool,
    pub checksum: u8,
    pub checksum_valid: bool,
}

impl DecodedFrame {
    /// Throttle code mapped back to PWM microseconds.
    pub fn pwm(&self) -> i32 {
        throttle_to_pwm(self.throttle as i32)
    }
}

fn remap(v: i32, in_min: i32, in_max: i32, out_min: i32, out_max: i32) -> i32 {
    // f64 throughout: far out-of-range inputs must not overflow; the final cast saturates
    let t = (f64::from(v) - f64::from(in_min)) / (f64::from(in_max) - f64::from(in_min));
    (t * (f64::from(out_max) - f64::from(out_min)) + f64::from(out_min)).round() as i32
}

/// Linear PWM -> throttle code. Not clamped: values outside 1000..=2000 extrapolate.
pub fn pwm_to_throttle(pwm_us: i32) -> i32 {
    remap(pwm_us, PWM_MIN, PWM_MAX, CODE_MIN, CODE_MAX)
}

/// Inverse of [`pwm_to_throttle`], same rounding.
pub fn throttle_to_pwm(code: i32) -> i32 {
    remap(code, CODE_MIN, CODE_MAX, PWM_MIN, PWM_MAX)
}

/// Checksum over the leading 12 bits (throttle + telemetry flag).
pub fn frame_checksum(bits12: u16) -> u8 {
    let b = bits12 & 0x0FFF;
    ((b >> 8) ^ ((b >> 4) & 0xF) ^ (b & 0xF)) as u8
}

pub fn encode_frame(throttle: u16, telemetry: bool) -> Result<u16, FrameError> {
    if throttle > CODE_MAX as u16 {
        return Err(FrameError::ThrottleOutOfRange(throttle));
    }
    let bits12 = (throttle << 1) | telemetry as u16;
    Ok((bits12 << 4) | frame_checksum(bits12) as u16)
}

/// Splits a packed frame. Throttle and flag are returned even when the
/// checksum does not match; the caller decides what to do with it.
pub fn decode_word(word: u16) -> DecodedFrame {
    let bits12 = word >> 4;
    let checksum = (word & 0xF) as u8;
    DecodedFrame {
        throttle: bits12 >> 1,
        telemetry: bits12 & 1 == 1,
        checksum,
        checksum_valid: frame_checksum(bits12) == checksum,
    }
}

/// Decodes a frame given as a string of '0'/'1' digits, MSB first.
pub fn decode_frame(bits: &str) -> Result<DecodedFrame, FrameError> {
    let len = bits.chars().count();
    if len != FRAME_BITS {
        return Err(FrameError::Length { len });
    }
    let mut word = 0u16;
    for (pos, digit) in bits.chars().enumerate() {
        let bit = match digit {
            '0' => 0,
            '1' => 1,
            _ => return Err(FrameError::InvalidDigit { pos, digit }),
        };
        word = (word << 1) | bit;
    }
    Ok(decode_word(word))
}
