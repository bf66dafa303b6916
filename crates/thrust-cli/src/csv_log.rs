use anyhow::{Context, Result};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use thrust_link::RecordSink;
use thrust_proto::TelemetryRecord;

pub const HEADER: &str = "timestamp,pwm,thrust,thrust_raw";

/// Rows buffered between flushes.
pub const FLUSH_EVERY: usize = 50;

/// Run log: one row per telemetry record, thrust in kgf.
pub struct CsvSink<W: Write> {
    out: W,
    unflushed: usize,
}

impl<W: Write> CsvSink<W> {
    pub fn new(mut out: W) -> Result<Self> {
        writeln!(out, "{}", HEADER).context("write csv header")?;
        Ok(Self { out, unflushed: 0 })
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

impl CsvSink<BufWriter<File>> {
    /// Creates `<dir>/run_<YYYY-MM-DD_HH:MM:SS>.csv`, making `dir` if needed.
    pub fn create_in(dir: &Path, now: time::OffsetDateTime) -> Result<(Self, PathBuf)> {
        std::fs::create_dir_all(dir).with_context(|| format!("create output dir {}", dir.display()))?;
        let path = dir.join(run_file_name(now)?);
        let f = File::create(&path).with_context(|| format!("create {}", path.display()))?;
        Ok((Self::new(BufWriter::new(f))?, path))
    }
}

pub fn run_file_name(now: time::OffsetDateTime) -> Result<String> {
    let fmt = time::macros::format_description!("[year]-[month]-[day]_[hour]:[minute]:[second]");
    Ok(format!("run_{}.csv", now.format(fmt).context("format run timestamp")?))
}

impl<W: Write + Send> RecordSink for CsvSink<W> {
    fn accept(&mut self, r: &TelemetryRecord) -> Result<()> {
        writeln!(
            self.out,
            "{},{},{:.3},{}",
            r.timestamp(),
            r.throttle(),
            r.thrust() / 1000.0,
            r.thrust_raw()
        )?;
        self.unflushed += 1;
        if self.unflushed >= FLUSH_EVERY {
            self.unflushed = 0;
            self.out.flush().context("flush csv")?;
        }
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.unflushed = 0;
        self.out.flush().context("flush csv on close")
    }
}
