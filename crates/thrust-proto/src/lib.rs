pub mod codec;
pub mod command;
pub mod telemetry;

pub use codec::{DecodedFrame, FrameError};
pub use command::Command;
pub use telemetry::{Calibration, ParseError, TelemetryRecord};
