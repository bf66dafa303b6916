//! Full-duplex line link to the thrust bench controller.
//!
//! Two tasks per link: the receive task parses `timestamp,throttle,thrust_raw`
//! lines into [`TelemetryRecord`]s and the send task drains the outbound
//! command queue. Both race every await against the shutdown signal.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_serial::SerialPortBuilderExt;
use tracing::{debug, info, trace, warn};

use thrust_proto::{Calibration, Command, TelemetryRecord};

use crate::backoff::Backoff;
use crate::cache::LatestValueCache;
use crate::sink::RecordSink;
use crate::LinkConfig;

/// Longest accepted inbound line, terminator included. Longer lines are
/// dropped up to the next newline.
pub const MAX_LINE: usize = 256;

#[derive(Debug, Error)]
pub enum LinkError {
    #[error("open serial device {dev} @ {baud}")]
    Connection {
        dev: String,
        baud: u32,
        #[source]
        source: tokio_serial::Error,
    },
    #[error("read failed")]
    Read(#[source] std::io::Error),
    #[error("transport closed")]
    Eof,
    #[error("write failed")]
    Write(#[source] std::io::Error),
    #[error("write timed out after {0:?}")]
    WriteTimeout(Duration),
    #[error("link already started")]
    AlreadyStarted,
    #[error("link was shut down")]
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Idle,
    Running,
    Closed,
}

pub struct SerialLink {
    cfg: LinkConfig,
    calibration: Calibration,
    cache: Arc<LatestValueCache>,
    cmd_tx: mpsc::UnboundedSender<Command>,
    cmd_rx: Option<mpsc::UnboundedReceiver<Command>>,
    rec_tx: Option<mpsc::UnboundedSender<TelemetryRecord>>,
    rec_rx: Option<mpsc::UnboundedReceiver<TelemetryRecord>>,
    sink: Option<Box<dyn RecordSink>>,
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
    state: LinkState,
}

impl SerialLink {
    pub fn new(cfg: LinkConfig, calibration: Calibration) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (rec_tx, rec_rx) = mpsc::unbounded_channel();
        let (shutdown, _) = watch::channel(false);
        Self {
            cfg,
            calibration,
            cache: Arc::new(LatestValueCache::new()),
            cmd_tx,
            cmd_rx: Some(cmd_rx),
            rec_tx: Some(rec_tx),
            rec_rx: Some(rec_rx),
            sink: None,
            shutdown,
            tasks: Vec::new(),
            state: LinkState::Idle,
        }
    }

    pub fn with_sink(mut self, sink: impl RecordSink + 'static) -> Self {
        self.set_sink(sink);
        self
    }

    /// Only takes effect before [`start`](Self::start).
    pub fn set_sink(&mut self, sink: impl RecordSink + 'static) {
        if self.state != LinkState::Idle {
            warn!("link: sink attached after start is ignored");
            return;
        }
        self.sink = Some(Box::new(sink));
    }

    /// Opens the serial device and spawns the receive/send tasks.
    /// Must be called from within a tokio runtime.
    pub fn start(&mut self, dev: &str, baud: u32) -> Result<(), LinkError> {
        self.check_startable()?;
        let port = tokio_serial::new(dev, baud)
            .open_native_async()
            .map_err(|source| LinkError::Connection { dev: dev.to_string(), baud, source })?;
        info!("link: opened {} @ {}", dev, baud);
        self.start_with(port)
    }

    /// Same as [`start`](Self::start) over an already open transport.
    pub fn start_with<T>(&mut self, io: T) -> Result<(), LinkError>
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        self.check_startable()?;
        let (cmd_rx, rec_tx) = match (self.cmd_rx.take(), self.rec_tx.take()) {
            (Some(c), Some(r)) => (c, r),
            _ => return Err(LinkError::Closed),
        };
        if self.rec_rx.take().is_some() {
            debug!("link: record queue not taken, records go to cache and sink only");
        }
        let (reader, writer) = tokio::io::split(io);

        let rx = RxTask {
            calibration: self.calibration,
            read_timeout: self.cfg.read_timeout(),
            backoff: self.cfg.backoff(),
            cache: self.cache.clone(),
            records: rec_tx,
            sink: self.sink.take(),
            shutdown: self.shutdown.subscribe(),
        };
        let tx = TxTask {
            write_timeout: self.cfg.write_timeout(),
            backoff: self.cfg.backoff(),
            commands: cmd_rx,
            shutdown: self.shutdown.subscribe(),
        };

        self.tasks.push(tokio::spawn(rx.run(reader)));
        self.tasks.push(tokio::spawn(tx.run(writer)));
        self.state = LinkState::Running;
        Ok(())
    }

    fn check_startable(&self) -> Result<(), LinkError> {
        match self.state {
            LinkState::Idle => Ok(()),
            LinkState::Running => Err(LinkError::AlreadyStarted),
            LinkState::Closed => Err(LinkError::Closed),
        }
    }

    /// Queues a raw command line. Never blocks; a missing newline is added.
    pub fn enqueue_command(&self, text: impl Into<String>) {
        self.enqueue(Command::raw(text));
    }

    pub fn set_throttle(&self, pwm: i32) {
        self.enqueue(Command::Throttle(pwm));
    }

    pub fn request_reboot(&self) {
        self.enqueue(Command::Reboot);
    }

    pub fn enqueue(&self, cmd: Command) {
        if let Err(e) = self.cmd_tx.send(cmd) {
            debug!("link: dropping {:?}, send task is gone", e.0);
        }
    }

    pub fn latest(&self) -> Option<TelemetryRecord> {
        self.cache.read()
    }

    pub fn cache(&self) -> Arc<LatestValueCache> {
        self.cache.clone()
    }

    /// Hands out the inbound record queue. Only the first call before
    /// [`start`](Self::start) gets it; an untaken queue is dropped on start.
    pub fn take_records(&mut self) -> Option<mpsc::UnboundedReceiver<TelemetryRecord>> {
        self.rec_rx.take()
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    /// Stops both tasks and waits for them. Safe to call more than once.
    pub async fn shutdown(&mut self) {
        self.shutdown.send_replace(true);
        for task in self.tasks.drain(..) {
            if let Err(e) = task.await {
                warn!("link: task ended abnormally: {}", e);
            }
        }
        if self.state == LinkState::Running {
            info!("link: closed");
        }
        self.cmd_rx = None;
        self.rec_tx = None;
        self.state = LinkState::Closed;
    }
}

impl Drop for SerialLink {
    fn drop(&mut self) {
        self.shutdown.send_replace(true);
    }
}

/// Resolves once shutdown is requested or the link is dropped.
async fn stopped(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

/// Sleeps for `delay` unless shutdown arrives first. Returns false on shutdown.
async fn pause(delay: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    tokio::select! {
        _ = stopped(shutdown) => false,
        _ = tokio::time::sleep(delay) => true,
    }
}

struct RxTask {
    calibration: Calibration,
    read_timeout: Duration,
    backoff: Backoff,
    cache: Arc<LatestValueCache>,
    records: mpsc::UnboundedSender<TelemetryRecord>,
    sink: Option<Box<dyn RecordSink>>,
    shutdown: watch::Receiver<bool>,
}

enum ReadStep {
    Line,
    Overflow,
    Idle,
    Failed(LinkError),
}

impl RxTask {
    async fn run<R: AsyncRead + Unpin>(mut self, reader: R) {
        let mut reader = BufReader::new(reader);
        // Partial bytes survive a timed-out read and are completed next time.
        let mut line = Vec::with_capacity(64);
        let mut discarding = false;

        loop {
            if *self.shutdown.borrow() {
                break;
            }
            let room = (MAX_LINE + 1).saturating_sub(line.len()).max(1) as u64;
            let mut limited = (&mut reader).take(room);
            let res = tokio::select! {
                _ = stopped(&mut self.shutdown) => break,
                res = tokio::time::timeout(
                    self.read_timeout,
                    limited.read_until(b'\n', &mut line),
                ) => res,
            };
            let step = match res {
                Err(_) => ReadStep::Idle,
                Ok(Ok(0)) => ReadStep::Failed(LinkError::Eof),
                Ok(Ok(_)) if line.len() > MAX_LINE && line.last() != Some(&b'\n') => ReadStep::Overflow,
                // a final unterminated line at EOF is parsed as well
                Ok(Ok(_)) => ReadStep::Line,
                Ok(Err(e)) => ReadStep::Failed(LinkError::Read(e)),
            };

            match step {
                ReadStep::Line if discarding => {
                    self.backoff.reset();
                    discarding = false;
                    line.clear();
                }
                ReadStep::Line => {
                    self.backoff.reset();
                    let res = TelemetryRecord::parse_bytes(&line, &self.calibration);
                    line.clear();
                    match res {
                        Ok(rec) => self.handle(rec),
                        Err(e) => warn!("link rx: skipping malformed line: {}", e),
                    }
                }
                ReadStep::Overflow => {
                    self.backoff.reset();
                    if !discarding {
                        warn!("link rx: dropping line longer than {} bytes", MAX_LINE);
                    }
                    discarding = true;
                    line.clear();
                }
                ReadStep::Idle => {
                    debug!("link rx: no complete line within {:?}", self.read_timeout);
                }
                ReadStep::Failed(e) => {
                    line.clear();
                    let delay = self.backoff.next();
                    warn!(
                        "link rx: {:#} (failures: {}, retry in {:?})",
                        anyhow::Error::from(e),
                        self.backoff.failures(),
                        delay
                    );
                    if !pause(delay, &mut self.shutdown).await {
                        break;
                    }
                }
            }
        }
        if let Some(sink) = self.sink.as_mut() {
            if let Err(e) = sink.close() {
                warn!("link rx: closing sink failed: {:#}", e);
            }
        }
        debug!("link rx: done");
    }

    fn handle(&mut self, rec: TelemetryRecord) {
        trace!("link rx: {:?}", rec);
        // nobody listening is fine
        let _ = self.records.send(rec);
        self.cache.publish(rec);
        if let Some(sink) = self.sink.as_mut() {
            if let Err(e) = sink.accept(&rec) {
                warn!("link rx: sink failed: {:#}", e);
            }
        }
    }
}

struct TxTask {
    write_timeout: Duration,
    backoff: Backoff,
    commands: mpsc::UnboundedReceiver<Command>,
    shutdown: watch::Receiver<bool>,
}

impl TxTask {
    async fn run<W: AsyncWrite + Unpin>(mut self, mut writer: W) {
        loop {
            if *self.shutdown.borrow() {
                break;
            }
            let cmd = tokio::select! {
                _ = stopped(&mut self.shutdown) => break,
                cmd = self.commands.recv() => match cmd {
                    Some(cmd) => cmd,
                    None => break,
                },
            };

            let line = cmd.to_line();
            let res = tokio::select! {
                _ = stopped(&mut self.shutdown) => break,
                res = write_line(&mut writer, &line, self.write_timeout) => res,
            };

            match res {
                Ok(()) => {
                    trace!("link tx: {:?}", line);
                    self.backoff.reset();
                }
                Err(e) => {
                    // the command is dropped, never retried
                    let delay = self.backoff.next();
                    warn!(
                        "link tx: dropping {:?}: {:#} (failures: {}, retry in {:?})",
                        line.trim_end(),
                        anyhow::Error::from(e),
                        self.backoff.failures(),
                        delay
                    );
                    if !pause(delay, &mut self.shutdown).await {
                        break;
                    }
                }
            }
        }
        debug!("link tx: done");
    }
}

async fn write_line<W: AsyncWrite + Unpin>(writer: &mut W, line: &str, limit: Duration) -> Result<(), LinkError> {
    let io = async {
        writer.write_all(line.as_bytes()).await?;
        writer.flush().await
    };
    match tokio::time::timeout(limit, io).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(LinkError::Write(e)),
        Err(_) => Err(LinkError::WriteTimeout(limit)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::pin::Pin;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::task::{Context, Poll};
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream, ReadBuf};
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(2);

    fn quick_cfg() -> LinkConfig {
        LinkConfig {
            read_timeout_ms: Some(50),
            write_timeout_ms: Some(200),
            backoff_base_ms: Some(5),
            backoff_max_ms: Some(20),
            ..Default::default()
        }
    }

    fn started(cfg: LinkConfig) -> (SerialLink, DuplexStream, mpsc::UnboundedReceiver<TelemetryRecord>) {
        let (ours, bench) = tokio::io::duplex(1024);
        let mut link = SerialLink::new(cfg, Calibration::default());
        let records = link.take_records().unwrap();
        link.start_with(ours).unwrap();
        (link, bench, records)
    }

    #[tokio::test]
    async fn commands_reach_the_wire_in_order() {
        let (mut link, bench, _records) = started(quick_cfg());
        link.enqueue_command("A");
        link.enqueue_command("B\n");
        tokio::time::sleep(Duration::from_millis(10)).await;
        link.enqueue_command("C");
        link.set_throttle(1500);
        link.request_reboot();

        let mut lines = BufReader::new(bench).lines();
        let mut got = Vec::new();
        for _ in 0..5 {
            got.push(timeout(WAIT, lines.next_line()).await.unwrap().unwrap().unwrap());
        }
        assert_eq!(got, vec!["A", "B", "C", "1500", "reboot"]);
        link.shutdown().await;
    }

    #[tokio::test]
    async fn records_queue_is_only_handed_out_before_start() {
        let (ours, _bench) = tokio::io::duplex(64);
        let mut link = SerialLink::new(quick_cfg(), Calibration::default());
        link.start_with(ours).unwrap();
        assert!(link.take_records().is_none());
        link.shutdown().await;
    }

    #[tokio::test]
    async fn commands_queued_before_start_are_sent() {
        let (ours, bench) = tokio::io::duplex(1024);
        let mut link = SerialLink::new(quick_cfg(), Calibration::default());
        link.set_throttle(1000);
        link.start_with(ours).unwrap();

        let mut lines = BufReader::new(bench).lines();
        let first = timeout(WAIT, lines.next_line()).await.unwrap().unwrap();
        assert_eq!(first.as_deref(), Some("1000"));
        link.shutdown().await;
    }

    #[tokio::test]
    async fn telemetry_lands_in_queue_cache_and_sink() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen2 = seen.clone();
        let (ours, mut bench) = tokio::io::duplex(1024);
        let mut link = SerialLink::new(quick_cfg(), Calibration::default()).with_sink(
            move |r: &TelemetryRecord| -> anyhow::Result<()> {
                seen2.lock().unwrap().push(r.timestamp());
                Ok(())
            },
        );
        let mut records = link.take_records().unwrap();
        assert!(link.take_records().is_none());
        assert!(link.latest().is_none());
        link.start_with(ours).unwrap();

        bench.write_all(b"100, 1500, 220000\n101,1501,0\n").await.unwrap();

        let a = timeout(WAIT, records.recv()).await.unwrap().unwrap();
        let b = timeout(WAIT, records.recv()).await.unwrap().unwrap();
        assert_eq!((a.timestamp(), a.throttle(), a.thrust()), (100, 1500, -490.0));
        assert_eq!(b.timestamp(), 101);
        assert_eq!(link.latest(), Some(b));
        assert_eq!(*seen.lock().unwrap(), vec![100, 101]);
        link.shutdown().await;
    }

    #[tokio::test]
    async fn malformed_lines_are_skipped() {
        let (mut link, mut bench, mut records) = started(quick_cfg());

        bench.write_all(b"garbage\n1,2\n\n7,1200,110000\n").await.unwrap();

        let r = timeout(WAIT, records.recv()).await.unwrap().unwrap();
        assert_eq!(r.timestamp(), 7);
        assert_eq!(r.thrust(), -245.0);
        link.shutdown().await;
    }

    #[tokio::test]
    async fn line_split_across_read_timeout_is_joined() {
        let (mut link, mut bench, mut records) = started(quick_cfg());

        bench.write_all(b"42,13").await.unwrap();
        // longer than the 50ms read timeout
        tokio::time::sleep(Duration::from_millis(150)).await;
        bench.write_all(b"00,220000\n").await.unwrap();

        let r = timeout(WAIT, records.recv()).await.unwrap().unwrap();
        assert_eq!((r.timestamp(), r.throttle()), (42, 1300));
        link.shutdown().await;
    }

    #[tokio::test]
    async fn failing_sink_does_not_stop_receiving() {
        let (ours, mut bench) = tokio::io::duplex(1024);
        let mut link = SerialLink::new(quick_cfg(), Calibration::default())
            .with_sink(|_: &TelemetryRecord| -> anyhow::Result<()> { anyhow::bail!("disk full") });
        let mut records = link.take_records().unwrap();
        link.start_with(ours).unwrap();

        bench.write_all(b"1,1000,0\n2,1000,0\n").await.unwrap();
        assert_eq!(timeout(WAIT, records.recv()).await.unwrap().unwrap().timestamp(), 1);
        assert_eq!(timeout(WAIT, records.recv()).await.unwrap().unwrap().timestamp(), 2);
        link.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_is_prompt_and_idempotent() {
        let cfg = LinkConfig {
            read_timeout_ms: Some(60_000),
            write_timeout_ms: Some(60_000),
            ..Default::default()
        };
        let (mut link, _bench, _records) = started(cfg);
        assert_eq!(link.state(), LinkState::Running);

        timeout(Duration::from_secs(1), link.shutdown()).await.unwrap();
        assert_eq!(link.state(), LinkState::Closed);
        timeout(Duration::from_secs(1), link.shutdown()).await.unwrap();

        // commands after shutdown are dropped quietly
        link.set_throttle(1000);
        let (io, _other) = tokio::io::duplex(16);
        assert!(matches!(link.start_with(io), Err(LinkError::Closed)));
    }

    #[tokio::test]
    async fn second_start_is_rejected() {
        let (mut link, _bench, _records) = started(quick_cfg());
        let (io, _other) = tokio::io::duplex(16);
        assert!(matches!(link.start_with(io), Err(LinkError::AlreadyStarted)));
        link.shutdown().await;
    }

    /// Transport that is at EOF and rejects every write, counting attempts.
    #[derive(Clone, Default)]
    struct DeadPort {
        reads: Arc<AtomicUsize>,
        writes: Arc<AtomicUsize>,
    }

    impl AsyncRead for DeadPort {
        fn poll_read(self: Pin<&mut Self>, _: &mut Context<'_>, _: &mut ReadBuf<'_>) -> Poll<std::io::Result<()>> {
            self.reads.fetch_add(1, Ordering::SeqCst);
            Poll::Ready(Ok(()))
        }
    }

    impl AsyncWrite for DeadPort {
        fn poll_write(self: Pin<&mut Self>, _: &mut Context<'_>, _: &[u8]) -> Poll<std::io::Result<usize>> {
            self.writes.fetch_add(1, Ordering::SeqCst);
            Poll::Ready(Err(std::io::ErrorKind::BrokenPipe.into()))
        }

        fn poll_flush(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<std::io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<std::io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    #[tokio::test]
    async fn dead_transport_failures_are_rate_limited() {
        let port = DeadPort::default();
        let mut link = SerialLink::new(quick_cfg(), Calibration::default());
        link.start_with(port.clone()).unwrap();
        for pwm in 1000..1500 {
            link.set_throttle(pwm);
        }
        tokio::time::sleep(Duration::from_millis(300)).await;
        timeout(Duration::from_secs(1), link.shutdown()).await.unwrap();

        // 5ms doubling to a 20ms cap allows roughly 17 attempts in 300ms
        let reads = port.reads.load(Ordering::SeqCst);
        let writes = port.writes.load(Ordering::SeqCst);
        assert!((2..=40).contains(&reads), "reads: {}", reads);
        assert!((2..=40).contains(&writes), "writes: {}", writes);
    }

    #[tokio::test]
    async fn oversized_line_is_dropped_up_to_its_newline() {
        let (mut link, mut bench, mut records) = started(quick_cfg());

        // the bytes past the cap look like a record and must not be parsed
        let mut junk = vec![b'x'; MAX_LINE + 1];
        junk.extend_from_slice(b"6,1000,0\n");
        bench.write_all(&junk).await.unwrap();
        bench.write_all(&vec![b'y'; 64 * 1024]).await.unwrap();
        bench.write_all(b"\n5,1000,0\n").await.unwrap();

        let r = timeout(WAIT, records.recv()).await.unwrap().unwrap();
        assert_eq!(r.timestamp(), 5);
        link.shutdown().await;
    }

    #[tokio::test]
    async fn sink_is_closed_on_shutdown() {
        struct Flag(Arc<AtomicBool>);
        impl RecordSink for Flag {
            fn accept(&mut self, _: &TelemetryRecord) -> anyhow::Result<()> {
                Ok(())
            }
            fn close(&mut self) -> anyhow::Result<()> {
                self.0.store(true, Ordering::SeqCst);
                Ok(())
            }
        }

        let closed = Arc::new(AtomicBool::new(false));
        let (ours, _bench) = tokio::io::duplex(64);
        let mut link = SerialLink::new(quick_cfg(), Calibration::default()).with_sink(Flag(closed.clone()));
        link.start_with(ours).unwrap();
        assert!(!closed.load(Ordering::SeqCst));
        link.shutdown().await;
        assert!(closed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn missing_device_is_a_connection_error() {
        let mut link = SerialLink::new(quick_cfg(), Calibration::default());
        let err = link.start("/dev/thrustbench-does-not-exist", 115200).unwrap_err();
        assert!(matches!(err, LinkError::Connection { .. }));
        assert_eq!(link.state(), LinkState::Idle);
    }
}
