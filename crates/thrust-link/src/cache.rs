use arc_swap::ArcSwapOption;
use std::sync::Arc;

use thrust_proto::TelemetryRecord;

/// Most recent telemetry record, readable from any thread.
///
/// Each publish swaps in a freshly built snapshot with a single atomic store,
/// so readers see either nothing or a complete record.
#[derive(Debug, Default)]
pub struct LatestValueCache {
    slot: ArcSwapOption<TelemetryRecord>,
}

impl LatestValueCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn publish(&self, record: TelemetryRecord) {
        self.slot.store(Some(Arc::new(record)));
    }

    pub fn read(&self) -> Option<TelemetryRecord> {
        self.slot.load().as_deref().copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use thrust_proto::Calibration;

    fn rec(ts: u64, raw: f64) -> TelemetryRecord {
        TelemetryRecord::calibrated(ts, 1500, raw, &Calibration::default())
    }

    #[test]
    fn empty_until_first_publish() {
        let cache = LatestValueCache::new();
        assert!(cache.read().is_none());
        let r = rec(1, 220000.0);
        cache.publish(r);
        assert_eq!(cache.read(), Some(r));
        assert_eq!(cache.read(), Some(r));
        let r2 = rec(2, 0.0);
        cache.publish(r2);
        assert_eq!(cache.read(), Some(r2));
    }

    #[test]
    fn concurrent_readers_only_see_whole_records() {
        let cache = Arc::new(LatestValueCache::new());
        let cal = Calibration::default();

        let writer = {
            let cache = cache.clone();
            std::thread::spawn(move || {
                for ts in 0..5000u64 {
                    cache.publish(TelemetryRecord::calibrated(ts, ts as u32, ts as f64, &cal));
                }
            })
        };
        let readers: Vec<_> = (0..4)
            .map(|_| {
                let cache = cache.clone();
                std::thread::spawn(move || {
                    for _ in 0..5000 {
                        if let Some(r) = cache.read() {
                            // every field was written from the same ts
                            assert_eq!(r.throttle() as u64, r.timestamp());
                            assert_eq!(r.thrust_raw(), r.timestamp() as f64);
                            assert_eq!(r.thrust(), cal.thrust(r.thrust_raw()));
                        }
                    }
                })
            })
            .collect();

        writer.join().unwrap();
        for r in readers {
            r.join().unwrap();
        }
        assert_eq!(cache.read().map(|r| r.timestamp()), Some(4999));
    }
}
