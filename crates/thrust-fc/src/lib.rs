pub mod mav;
pub mod worker;

use serde::Deserialize;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct FcConfig {
    /// Flight controller serial device; overridden by `run --ap`.
    pub serial_dev: Option<String>,
    pub baud: Option<u32>,

    /// MAVLink ids we use (bench side)
    pub sys_id: Option<u8>,
    pub comp_id: Option<u8>,

    /// target system/component (FC side). 1/1 is common for ArduPilot.
    pub target_sys: Option<u8>,
    pub target_comp: Option<u8>,

    /// Motor instance for MAV_CMD_DO_MOTOR_TEST (1-based).
    pub motor: Option<u8>,

    /// Seconds the FC keeps a motor-test value before reverting. Default 5.
    pub test_timeout_s: Option<f32>,

    /// Heartbeat wait on connect. Default 10s.
    pub heartbeat_timeout_ms: Option<u64>,
}

pub const DEFAULT_FC_BAUD: u32 = 921600;

impl FcConfig {
    pub fn baud(&self) -> u32 { self.baud.unwrap_or(DEFAULT_FC_BAUD) }
    pub fn sys_id(&self) -> u8 { self.sys_id.unwrap_or(255) }
    pub fn comp_id(&self) -> u8 { self.comp_id.unwrap_or(190) }
    pub fn target_sys(&self) -> u8 { self.target_sys.unwrap_or(1) }
    pub fn target_comp(&self) -> u8 { self.target_comp.unwrap_or(1) }
    pub fn motor(&self) -> u8 { self.motor.unwrap_or(2) }
    pub fn test_timeout_s(&self) -> f32 { self.test_timeout_s.unwrap_or(5.0) }
    pub fn heartbeat_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.heartbeat_timeout_ms.unwrap_or(10_000))
    }
}
