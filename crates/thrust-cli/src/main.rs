mod csv_log;
mod summary;
mod sweep;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;
use tokio::io::AsyncBufReadExt;
use tracing::{info, warn};

use thrust_fc::worker::MotorTestWorker;
use thrust_fc::FcConfig;
use thrust_link::{doctor as link_doctor, LinkConfig, SerialLink};
use thrust_proto::{codec, Calibration};

use csv_log::CsvSink;
use sweep::{SweepCfg, SweepPlan};

#[derive(Debug, Parser)]
#[command(name = "thrustbench", version, about = "Motor thrust bench: throttle sweeps and thrust logging")]
struct Cli {
    /// TOML config; built-in defaults apply when omitted.
    #[arg(long)]
    config: Option<String>,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Validate the config.
    Doctor,
    /// Throttle sweep: ramp up, hold, ramp down, logging thrust to CSV.
    Run {
        /// Bench serial port; falls back to link.serial_dev.
        port: Option<String>,
        /// Flight controller (ArduPilot) serial port for motor-test commands.
        #[arg(short = 'a', long)]
        ap: Option<String>,
        #[arg(long)]
        ap_baud: Option<u32>,
        /// Output directory
        #[arg(short, long, default_value = "results")]
        output: PathBuf,
        /// Only measure thrust; no motor-test commands to the FC.
        #[arg(short, long)]
        dry: bool,
    },
    /// Print calibrated thrust continuously.
    Watch {
        port: Option<String>,
        #[arg(short = 'i', long, default_value_t = 100)]
        interval_ms: u64,
    },
    /// Type throttle values (or "reboot") and send them to the bench.
    Console { port: Option<String> },
    /// Decode a 16-bit throttle frame given as binary digits.
    Decode { bits: String },
    /// Average a run CSV per pwm and write a summarized table.
    Summarize { input: PathBuf, output: PathBuf },
}

#[derive(Debug, Default, serde::Deserialize)]
struct Config {
    #[serde(default)]
    link: LinkConfig,
    calibration: Option<Calibration>,
    fc: Option<FcConfig>,
    #[serde(default)]
    sweep: SweepCfg,
}

impl Config {
    fn calibration(&self) -> Calibration {
        self.calibration.unwrap_or_default()
    }
}

fn load_config(path: Option<&str>) -> Result<Config> {
    let Some(path) = path else { return Ok(Config::default()); };
    let s = std::fs::read_to_string(path).with_context(|| format!("read config {}", path))?;
    toml::from_str(&s).context("parse config toml")
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let cfg = load_config(cli.config.as_deref())?;

    match cli.cmd {
        Command::Doctor => doctor(&cfg)?,
        Command::Run { port, ap, ap_baud, output, dry } => {
            let port = bench_port(&cfg, port)?;
            run(&cfg, &port, ap, ap_baud, &output, dry).await?
        }
        Command::Watch { port, interval_ms } => {
            let port = bench_port(&cfg, port)?;
            watch(&cfg, &port, Duration::from_millis(interval_ms)).await?
        }
        Command::Console { port } => console(&cfg, &bench_port(&cfg, port)?).await?,
        Command::Decode { bits } => decode(&bits)?,
        Command::Summarize { input, output } => summary::summarize(&input, &output)?,
    }
    Ok(())
}

fn doctor(cfg: &Config) -> Result<()> {
    info!("doctor: starting");
    link_doctor::check_link(&cfg.link)?;
    link_doctor::check_calibration(&cfg.calibration())?;
    SweepPlan::from_cfg(&cfg.sweep)?;
    if let Some(fc) = &cfg.fc {
        anyhow::ensure!(fc.baud() > 0, "fc.baud invalid");
        anyhow::ensure!(fc.motor() > 0, "fc.motor is 1-based");
        anyhow::ensure!(fc.test_timeout_s() > 0.0, "fc.test_timeout_s must be > 0");
    }
    info!("doctor: OK");
    Ok(())
}

fn bench_port(cfg: &Config, port: Option<String>) -> Result<String> {
    port.or_else(|| cfg.link.serial_dev.clone())
        .context("bench port missing (positional argument or link.serial_dev)")
}

fn open_link(cfg: &Config, port: &str) -> Result<SerialLink> {
    let mut link = SerialLink::new(cfg.link.clone(), cfg.calibration());
    link.start(port, cfg.link.baud())?;
    Ok(link)
}

async fn run(
    cfg: &Config,
    port: &str,
    ap: Option<String>,
    ap_baud: Option<u32>,
    output: &std::path::Path,
    dry: bool,
) -> Result<()> {
    let plan = SweepPlan::from_cfg(&cfg.sweep)?;

    let fc = if dry {
        info!("run: dry run, thrust measurement only");
        None
    } else {
        let mut fc_cfg = cfg.fc.clone().unwrap_or_default();
        if ap_baud.is_some() {
            fc_cfg.baud = ap_baud;
        }
        let dev = ap
            .or_else(|| fc_cfg.serial_dev.clone())
            .context("must supply the AP port (--ap or fc.serial_dev), or use --dry")?;
        info!("run: waiting for heartbeat from AP, using motor {}", fc_cfg.motor());
        Some(MotorTestWorker::connect(&dev, &fc_cfg).await?)
    };

    let (sink, path) = CsvSink::create_in(output, time::OffsetDateTime::now_utc())?;
    info!("run: writing results to {}", path.display());

    info!("run: connecting to {}", port);
    let mut link = SerialLink::new(cfg.link.clone(), cfg.calibration()).with_sink(sink);
    link.start(port, cfg.link.baud())?;
    tokio::time::sleep(Duration::from_millis(300)).await;

    let res = sweep::run(&link, fc.as_ref(), &plan).await;

    link.shutdown().await;
    if let Some(fc) = fc {
        fc.close().await;
    }
    res?;
    info!("run: done");
    Ok(())
}

async fn watch(cfg: &Config, port: &str, interval: Duration) -> Result<()> {
    let mut link = open_link(cfg, port)?;
    info!("watch: printing every {:?}", interval);
    tokio::time::sleep(Duration::from_secs(1)).await;

    let mut tick = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = tick.tick() => match link.latest() {
                Some(r) => println!("{:.1}", r.thrust()),
                None => println!("-"),
            },
        }
    }
    link.shutdown().await;
    Ok(())
}

async fn console(cfg: &Config, port: &str) -> Result<()> {
    let mut link = open_link(cfg, port)?;
    let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();

    println!("throttle in us (1000-2000) or 'reboot', ctrl-d to quit");
    while let Some(line) = lines.next_line().await.context("read stdin")? {
        let input = line.trim();
        if input.is_empty() {
            continue;
        }
        if input == "reboot" {
            link.request_reboot();
            continue;
        }
        match input.parse::<i32>() {
            Ok(pwm) => {
                link.set_throttle(pwm);
                match link.latest() {
                    Some(r) => println!("throttle: {}", r.throttle()),
                    None => println!("throttle: no telemetry yet"),
                }
            }
            Err(e) => warn!("console: {:?} is not a throttle value: {}", input, e),
        }
    }
    link.shutdown().await;
    Ok(())
}

fn decode(bits: &str) -> Result<()> {
    let f = codec::decode_frame(bits.trim())?;
    println!(
        "throttle: {} ({}), telem: {}, crc: {} ({})",
        f.throttle,
        f.pwm(),
        f.telemetry as u8,
        f.checksum,
        if f.checksum_valid { "ok" } else { "MISMATCH" }
    );
    Ok(())
}
