use anyhow::Result;
use thrust_proto::TelemetryRecord;

/// Receives every parsed record, in wire order. Errors are logged by the link
/// and never stop the receive task.
pub trait RecordSink: Send {
    fn accept(&mut self, record: &TelemetryRecord) -> Result<()>;

    /// Called once when the receive task stops.
    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

impl<F> RecordSink for F
where
    F: FnMut(&TelemetryRecord) -> Result<()> + Send,
{
    fn accept(&mut self, record: &TelemetryRecord) -> Result<()> {
        self(record)
    }
}
