pub mod backoff;
pub mod cache;
pub mod doctor;
pub mod link;
pub mod sink;

use serde::Deserialize;
use std::time::Duration;

pub use cache::LatestValueCache;
pub use link::{LinkError, LinkState, SerialLink};
pub use sink::RecordSink;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct LinkConfig {
    /// Bench controller serial device, e.g. "/dev/ttyACM0".
    pub serial_dev: Option<String>,
    pub baud: Option<u32>,

    /// Per-call I/O timeouts. Default 1s each.
    pub read_timeout_ms: Option<u64>,
    pub write_timeout_ms: Option<u64>,

    /// Error backoff: first delay and cap. Default 50ms / 2000ms.
    pub backoff_base_ms: Option<u64>,
    pub backoff_max_ms: Option<u64>,
}

pub const DEFAULT_BAUD: u32 = 115200;

impl LinkConfig {
    pub fn baud(&self) -> u32 {
        self.baud.unwrap_or(DEFAULT_BAUD)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms.unwrap_or(1000))
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms.unwrap_or(1000))
    }

    pub fn backoff(&self) -> backoff::Backoff {
        backoff::Backoff::new(
            Duration::from_millis(self.backoff_base_ms.unwrap_or(50)),
            Duration::from_millis(self.backoff_max_ms.unwrap_or(2000)),
        )
    }
}
