use anyhow::Result;
use serde::Deserialize;
use std::time::Duration;
use tracing::{info, warn};

use thrust_fc::worker::MotorTestWorker;
use thrust_link::SerialLink;
use thrust_proto::TelemetryRecord;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SweepCfg {
    pub pwm_min: Option<i32>,
    pub pwm_max: Option<i32>,
    pub step: Option<i32>,
    pub step_delay_ms: Option<u64>,
    pub hold_final_ms: Option<u64>,
    pub ramp_down_step: Option<i32>,
    pub ramp_down_delay_ms: Option<u64>,
    pub stop_repeats: Option<u32>,
    pub stop_delay_ms: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct SweepPlan {
    pub pwm_min: i32,
    pub pwm_max: i32,
    pub step: i32,
    pub step_delay: Duration,
    pub hold_final: Duration,
    pub ramp_down_step: i32,
    pub ramp_down_delay: Duration,
    pub stop_repeats: u32,
    pub stop_delay: Duration,
}

impl SweepPlan {
    pub fn from_cfg(cfg: &SweepCfg) -> Result<Self> {
        let plan = Self {
            pwm_min: cfg.pwm_min.unwrap_or(1000),
            pwm_max: cfg.pwm_max.unwrap_or(2000),
            step: cfg.step.unwrap_or(1),
            step_delay: Duration::from_millis(cfg.step_delay_ms.unwrap_or(20)),
            hold_final: Duration::from_millis(cfg.hold_final_ms.unwrap_or(3000)),
            ramp_down_step: cfg.ramp_down_step.unwrap_or(10),
            ramp_down_delay: Duration::from_millis(cfg.ramp_down_delay_ms.unwrap_or(10)),
            stop_repeats: cfg.stop_repeats.unwrap_or(5),
            stop_delay: Duration::from_millis(cfg.stop_delay_ms.unwrap_or(50)),
        };
        anyhow::ensure!(
            1000 <= plan.pwm_min && plan.pwm_min < plan.pwm_max && plan.pwm_max <= 2000,
            "sweep range must satisfy 1000 <= pwm_min < pwm_max <= 2000"
        );
        anyhow::ensure!(plan.step > 0, "sweep.step must be > 0");
        anyhow::ensure!(plan.ramp_down_step > 0, "sweep.ramp_down_step must be > 0");
        anyhow::ensure!(plan.stop_repeats > 0, "sweep.stop_repeats must be > 0");
        Ok(plan)
    }

    /// pwm_min + step, ... up to and ending exactly at pwm_max.
    pub fn ramp_up(&self) -> impl Iterator<Item = i32> {
        let (max, step) = (self.pwm_max, self.step);
        let mut pwm = self.pwm_min;
        std::iter::from_fn(move || {
            if pwm >= max {
                return None;
            }
            pwm = (pwm + step).min(max);
            Some(pwm)
        })
    }

    /// pwm_max down towards pwm_min, exclusive.
    pub fn ramp_down(&self) -> impl Iterator<Item = i32> {
        let (min, step) = (self.pwm_min, self.ramp_down_step);
        std::iter::successors(Some(self.pwm_max), move |p| Some(p - step)).take_while(move |p| *p > min)
    }
}

pub fn progress_line(pwm: i32, plan: &SweepPlan, latest: Option<&TelemetryRecord>) -> String {
    let done = (pwm - plan.pwm_min) as f64 / (plan.pwm_max - plan.pwm_min) as f64 * 100.0;
    match latest {
        Some(r) => format!(
            "[{}] {:4}/{:4} ({:3}%) -> {:.1}",
            r.timestamp(),
            r.throttle(),
            plan.pwm_max,
            done.round() as i64,
            r.thrust()
        ),
        None => format!("[-] {:4}/{:4} ({:3}%) -> no telemetry yet", pwm, plan.pwm_max, done.round() as i64),
    }
}

fn motor(fc: Option<&MotorTestWorker>, pwm: i32) {
    if let Some(fc) = fc {
        // plan bounds keep pwm in 1000..=2000
        fc.set_motor_pwm(pwm as u16);
    }
}

/// Ramp up, hold, ramp the motor down. Whatever happens, the bench and the
/// motor are commanded back to pwm_min before returning.
pub async fn run(link: &SerialLink, fc: Option<&MotorTestWorker>, plan: &SweepPlan) -> Result<()> {
    let res = tokio::select! {
        r = drive(link, fc, plan) => r,
        _ = tokio::signal::ctrl_c() => Err(anyhow::anyhow!("sweep interrupted")),
    };
    if let Err(e) = &res {
        warn!("sweep: {:#}, stopping motor", e);
    }
    stop(link, fc, plan).await;
    res
}

async fn drive(link: &SerialLink, fc: Option<&MotorTestWorker>, plan: &SweepPlan) -> Result<()> {
    info!(
        "sweep: {} -> {} step {} every {:?}",
        plan.pwm_min, plan.pwm_max, plan.step, plan.step_delay
    );
    for pwm in plan.ramp_up() {
        motor(fc, pwm);
        link.set_throttle(pwm);
        println!("{}", progress_line(pwm, plan, link.latest().as_ref()));
        tokio::time::sleep(plan.step_delay).await;
    }

    info!("sweep: holding {} for {:?}", plan.pwm_max, plan.hold_final);
    tokio::time::sleep(plan.hold_final).await;

    info!(
        "sweep: ramping down from {} to {}, steps of {}, delay {:?}",
        plan.pwm_max, plan.pwm_min, plan.ramp_down_step, plan.ramp_down_delay
    );
    for pwm in plan.ramp_down() {
        motor(fc, pwm);
        tokio::time::sleep(plan.ramp_down_delay).await;
    }
    Ok(())
}

async fn stop(link: &SerialLink, fc: Option<&MotorTestWorker>, plan: &SweepPlan) {
    for _ in 0..plan.stop_repeats {
        link.set_throttle(plan.pwm_min);
        motor(fc, plan.pwm_min);
        tokio::time::sleep(plan.stop_delay).await;
    }
}
