use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Rig calibration: a reference weight and the raw load-cell reading it produced.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Calibration {
    pub weight_grams: f64,
    pub raw_at_weight: f64,
}

impl Default for Calibration {
    fn default() -> Self {
        Self { weight_grams: 490.0, raw_at_weight: 220_000.0 }
    }
}

impl Calibration {
    pub fn new(weight_grams: f64, raw_at_weight: f64) -> Option<Self> {
        let cal = Self { weight_grams, raw_at_weight };
        cal.is_valid().then_some(cal)
    }

    pub fn is_valid(&self) -> bool {
        self.weight_grams.is_finite() && self.raw_at_weight.is_finite() && self.raw_at_weight != 0.0
    }

    /// Raw reading -> thrust in grams. The load cell reads negative under thrust.
    pub fn thrust(&self, thrust_raw: f64) -> f64 {
        -(thrust_raw * self.weight_grams) / self.raw_at_weight
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ParseError {
    #[error("line is not ascii/utf-8")]
    Encoding,
    #[error("expected 3 comma separated fields, got {0}")]
    FieldCount(usize),
    #[error("bad timestamp {0:?}")]
    Timestamp(String),
    #[error("bad throttle {0:?}")]
    Throttle(String),
    #[error("bad thrust reading {0:?}")]
    ThrustRaw(String),
    #[error("thrust reading is not finite: {0}")]
    NonFinite(f64),
}

/// One telemetry line from the bench: `timestamp,throttle,thrust_raw`.
///
/// `thrust` is always derived from `thrust_raw` through a [`Calibration`];
/// there is no way to set it on its own.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TelemetryRecord {
    timestamp: u64,
    throttle: u32,
    thrust: f64,
    thrust_raw: f64,
}

impl TelemetryRecord {
    pub fn calibrated(timestamp: u64, throttle: u32, thrust_raw: f64, cal: &Calibration) -> Self {
        Self { timestamp, throttle, thrust: cal.thrust(thrust_raw), thrust_raw }
    }

    /// Parses one inbound line. Surrounding whitespace and whitespace around
    /// each field are ignored; the trailing newline may or may not be present.
    pub fn parse_line(line: &str, cal: &Calibration) -> Result<Self, ParseError> {
        let fields: Vec<&str> = line.trim().split(',').map(str::trim).collect();
        if fields.len() != 3 {
            return Err(ParseError::FieldCount(fields.len()));
        }
        let timestamp = fields[0]
            .parse::<u64>()
            .map_err(|_| ParseError::Timestamp(fields[0].to_string()))?;
        let throttle = fields[1]
            .parse::<u32>()
            .map_err(|_| ParseError::Throttle(fields[1].to_string()))?;
        let thrust_raw = fields[2]
            .parse::<f64>()
            .map_err(|_| ParseError::ThrustRaw(fields[2].to_string()))?;
        if !thrust_raw.is_finite() {
            return Err(ParseError::NonFinite(thrust_raw));
        }
        Ok(Self::calibrated(timestamp, throttle, thrust_raw, cal))
    }

    pub fn parse_bytes(line: &[u8], cal: &Calibration) -> Result<Self, ParseError> {
        let s = std::str::from_utf8(line).map_err(|_| ParseError::Encoding)?;
        Self::parse_line(s, cal)
    }

    /// Bench clock, milliseconds since controller boot.
    pub fn timestamp(&self) -> u64 { self.timestamp }

    /// PWM throttle the controller reports as applied.
    pub fn throttle(&self) -> u32 { self.throttle }

    /// Calibrated thrust in grams.
    pub fn thrust(&self) -> f64 { self.thrust }

    pub fn thrust_raw(&self) -> f64 { self.thrust_raw }
}
