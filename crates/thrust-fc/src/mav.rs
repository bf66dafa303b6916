use anyhow::{Context, Result};
use mavlink::{
    common::{
        MavAutopilot, MavCmd, MavMessage, MavModeFlag, MavState, MavType, COMMAND_LONG_DATA,
        HEARTBEAT_DATA,
    },
    MavConnection, MavHeader,
};
use std::time::{Duration, Instant};
use tokio_serial::SerialPortBuilderExt;
use tracing::{debug, info, warn};

use crate::FcConfig;

pub const MOTOR_PWM_MIN: u16 = 1000;
pub const MOTOR_PWM_MAX: u16 = 2000;

/// MOTOR_TEST_THROTTLE_PWM
const THROTTLE_TYPE_PWM: f32 = 1.0;

pub struct FcLink {
    conn: Box<dyn MavConnection<MavMessage> + Send>,
    hdr: MavHeader,
    target_sys: u8,
    target_comp: u8,
    seen_heartbeat: bool,
}

impl FcLink {
    pub fn open(dev: &str, cfg: &FcConfig) -> Result<Self> {
        let baud = cfg.baud();
        // quick validate device
        let _ = tokio_serial::new(dev, baud)
            .open_native_async()
            .with_context(|| format!("open fc serial device {}", dev))?;

        let url = format!("serial:{}:{}", dev, baud);
        let conn = mavlink::connect::<MavMessage>(&url)
            .with_context(|| format!("mavlink connect {}", url))?;

        Ok(Self {
            conn,
            hdr: MavHeader { system_id: cfg.sys_id(), component_id: cfg.comp_id(), sequence: 0 },
            target_sys: cfg.target_sys(),
            target_comp: cfg.target_comp(),
            seen_heartbeat: false,
        })
    }

    /// Blocks until the FC sends a HEARTBEAT. The timeout is checked between
    /// received messages; a completely silent port blocks in `recv`.
    pub fn wait_heartbeat(&mut self, timeout: Duration) -> Result<()> {
        let start = Instant::now();
        while start.elapsed() < timeout {
            match self.conn.recv() {
                Ok((hdr, MavMessage::HEARTBEAT(_))) => {
                    self.seen_heartbeat = true;
                    info!(
                        "fc: heartbeat from sys={} comp={} after {}ms",
                        hdr.system_id,
                        hdr.component_id,
                        start.elapsed().as_millis()
                    );
                    return Ok(());
                }
                Ok((_hdr, msg)) => debug!("fc: ignoring {}", message_name(&msg)),
                Err(e) => {
                    debug!("fc: recv error while waiting for heartbeat: {:?}", e);
                    std::thread::sleep(Duration::from_millis(25));
                }
            }
        }
        anyhow::bail!("no FC heartbeat within {:?}", timeout)
    }

    pub fn send_heartbeat(&mut self) -> Result<()> {
        self.send(MavMessage::HEARTBEAT(gcs_heartbeat()))
    }

    /// Spins `motor` at `pwm` for `timeout_s` seconds via MAV_CMD_DO_MOTOR_TEST.
    pub fn cmd_motor_test(&mut self, motor: u8, pwm: u16, timeout_s: f32) -> Result<()> {
        anyhow::ensure!(self.seen_heartbeat, "no FC heartbeat seen yet");
        let clamped = clamp_pwm(pwm);
        if clamped != pwm {
            warn!("fc: motor pwm {} clamped to {}", pwm, clamped);
        }
        let cmd = motor_test_command(self.target_sys, self.target_comp, motor, clamped, timeout_s);
        self.send(MavMessage::COMMAND_LONG(cmd))
    }

    fn send(&mut self, msg: MavMessage) -> Result<()> {
        self.hdr.sequence = self.hdr.sequence.wrapping_add(1);
        self.conn.send(&self.hdr, &msg).context("mavlink send")?;
        Ok(())
    }
}

fn gcs_heartbeat() -> HEARTBEAT_DATA {
    HEARTBEAT_DATA {
        custom_mode: 0,
        mavtype: MavType::MAV_TYPE_GCS,
        autopilot: MavAutopilot::MAV_AUTOPILOT_INVALID,
        base_mode: MavModeFlag::empty(),
        system_status: MavState::MAV_STATE_ACTIVE,
        mavlink_version: 3,
    }
}

pub fn clamp_pwm(pwm: u16) -> u16 {
    pwm.clamp(MOTOR_PWM_MIN, MOTOR_PWM_MAX)
}

pub fn motor_test_command(
    target_sys: u8,
    target_comp: u8,
    motor: u8,
    pwm: u16,
    timeout_s: f32,
) -> COMMAND_LONG_DATA {
    COMMAND_LONG_DATA {
        target_system: target_sys,
        target_component: target_comp,
        command: MavCmd::MAV_CMD_DO_MOTOR_TEST.into(),
        confirmation: 0,
        param1: motor as f32,
        param2: THROTTLE_TYPE_PWM,
        param3: pwm as f32,
        param4: timeout_s,
        param5: 0.0,
        param6: 0.0,
        param7: 0.0,
    }
}

fn message_name(msg: &MavMessage) -> String {
    let dbg = format!("{:?}", msg);
    dbg.split(['(', ' ', '{']).next().unwrap_or_default().to_string()
}
