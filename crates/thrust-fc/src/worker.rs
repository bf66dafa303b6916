//! Runs the blocking MAVLink link on its own thread and feeds it motor-test
//! values from async code.
//!
//! The thread is detached rather than a `spawn_blocking` task: a silent port
//! can block inside `recv` forever, and the runtime waits for blocking tasks
//! on drop, so a hung handshake would keep the process alive.

use anyhow::{Context, Result};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{info, warn};

use crate::mav::FcLink;
use crate::FcConfig;

/// Blocking side of the worker; [`FcLink`] in production.
pub trait MotorTestPort {
    fn wait_heartbeat(&mut self, timeout: Duration) -> Result<()>;
    fn send_heartbeat(&mut self) -> Result<()>;
    fn cmd_motor_test(&mut self, motor: u8, pwm: u16, timeout_s: f32) -> Result<()>;
}

impl MotorTestPort for FcLink {
    fn wait_heartbeat(&mut self, timeout: Duration) -> Result<()> {
        FcLink::wait_heartbeat(self, timeout)
    }

    fn send_heartbeat(&mut self) -> Result<()> {
        FcLink::send_heartbeat(self)
    }

    fn cmd_motor_test(&mut self, motor: u8, pwm: u16, timeout_s: f32) -> Result<()> {
        FcLink::cmd_motor_test(self, motor, pwm, timeout_s)
    }
}

pub struct MotorTestWorker {
    tx: mpsc::UnboundedSender<u16>,
    done: oneshot::Receiver<()>,
}

/// Upper bound for draining queued commands in [`MotorTestWorker::close`].
const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

impl MotorTestWorker {
    /// Opens the FC, waits for its heartbeat, then starts forwarding.
    pub async fn connect(dev: &str, cfg: &FcConfig) -> Result<Self> {
        info!("fc: connecting to {} @ {}, motor {}", dev, cfg.baud(), cfg.motor());
        let dev = dev.to_string();
        let open_cfg = cfg.clone();
        Self::start(cfg, move || FcLink::open(&dev, &open_cfg)).await
    }

    /// Same as [`connect`](Self::connect) with a caller-supplied port.
    pub async fn start<P, F>(cfg: &FcConfig, open: F) -> Result<Self>
    where
        P: MotorTestPort + 'static,
        F: FnOnce() -> Result<P> + Send + 'static,
    {
        let (tx, mut rx) = mpsc::unbounded_channel::<u16>();
        let (ready_tx, ready_rx) = oneshot::channel::<Result<()>>();
        let (done_tx, done) = oneshot::channel::<()>();
        let hb_timeout = cfg.heartbeat_timeout();
        let motor = cfg.motor();
        let timeout_s = cfg.test_timeout_s();

        std::thread::Builder::new()
            .name("fc-motor-test".into())
            .spawn(move || {
                let mut port = match open().and_then(|mut p| {
                    p.wait_heartbeat(hb_timeout)?;
                    p.send_heartbeat()?;
                    Ok(p)
                }) {
                    Ok(p) => {
                        let _ = ready_tx.send(Ok(()));
                        p
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };

                while let Some(pwm) = rx.blocking_recv() {
                    if let Err(e) = port.cmd_motor_test(motor, pwm, timeout_s) {
                        warn!("fc: motor test pwm={} failed: {:#}", pwm, e);
                    }
                }
                info!("fc: worker done");
                let _ = done_tx.send(());
            })
            .context("fc: spawn worker thread")?;

        // a silent port can block inside recv; bound the wait here as well
        let ready = tokio::time::timeout(hb_timeout * 2, ready_rx)
            .await
            .context("fc: timed out waiting for heartbeat")?
            .context("fc: worker exited early")?;
        ready?;
        Ok(Self { tx, done })
    }

    pub fn set_motor_pwm(&self, pwm: u16) {
        if self.tx.send(pwm).is_err() {
            warn!("fc: worker gone, motor pwm {} not sent", pwm);
        }
    }

    /// Drains queued commands and stops the worker.
    pub async fn close(self) {
        drop(self.tx);
        match tokio::time::timeout(CLOSE_TIMEOUT, self.done).await {
            Ok(Ok(())) => {}
            Ok(Err(_)) => warn!("fc: worker ended abnormally"),
            Err(_) => warn!("fc: worker still busy after {:?}, leaving it behind", CLOSE_TIMEOUT),
        }
    }
}
