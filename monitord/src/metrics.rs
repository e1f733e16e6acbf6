use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::RwLock;
use std::time::SystemTime;

use crate::monitor::MonitorType;

/// Process-wide counters for the daemon's own health, separate from the
/// telemetry records it collects. Updated from drain/consumer threads so
/// every field is atomic; no counter here requires cross-field consistency,
/// so there's no single coarse lock.
pub struct Metrics {
    pub start_time: SystemTime,
    monitors_loaded: AtomicUsize,
    monitors_running: AtomicUsize,
    per_monitor: RwLock<BTreeMap<MonitorType, MonitorCounters>>,
}

#[derive(Default)]
struct MonitorCounters {
    records_emitted: AtomicU64,
    records_dropped: AtomicU64,
    drain_errors: AtomicU64,
}

impl Metrics {
    pub fn new() -> Self {
        let per_monitor = MonitorType::ALL
            .into_iter()
            .map(|ty| (ty, MonitorCounters::default()))
            .collect();
        Metrics {
            start_time: SystemTime::now(),
            monitors_loaded: AtomicUsize::new(0),
            monitors_running: AtomicUsize::new(0),
            per_monitor: RwLock::new(per_monitor),
        }
    }

    pub fn set_loaded(&self, count: usize) {
        self.monitors_loaded.store(count, Ordering::Relaxed);
    }

    pub fn loaded(&self) -> usize {
        self.monitors_loaded.load(Ordering::Relaxed)
    }

    pub fn set_running(&self, count: usize) {
        self.monitors_running.store(count, Ordering::Relaxed);
    }

    pub fn running(&self) -> usize {
        self.monitors_running.load(Ordering::Relaxed)
    }

    pub fn record_emitted(&self, ty: MonitorType) {
        if let Some(c) = self.per_monitor.read().unwrap().get(&ty) {
            c.records_emitted.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_dropped(&self, ty: MonitorType) {
        if let Some(c) = self.per_monitor.read().unwrap().get(&ty) {
            c.records_dropped.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_drain_error(&self, ty: MonitorType) {
        if let Some(c) = self.per_monitor.read().unwrap().get(&ty) {
            c.drain_errors.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// `(emitted, dropped, drain_errors)` for one monitor.
    pub fn snapshot(&self, ty: MonitorType) -> (u64, u64, u64) {
        self.per_monitor
            .read()
            .unwrap()
            .get(&ty)
            .map(|c| {
                (
                    c.records_emitted.load(Ordering::Relaxed),
                    c.records_dropped.load(Ordering::Relaxed),
                    c.drain_errors.load(Ordering::Relaxed),
                )
            })
            .unwrap_or_default()
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().map(|d| d.as_secs()).unwrap_or(0)
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_start_at_zero() {
        let m = Metrics::new();
        assert_eq!(m.snapshot(MonitorType::Exec), (0, 0, 0));
        assert_eq!(m.loaded(), 0);
    }

    #[test]
    fn record_emitted_increments_only_its_monitor() {
        let m = Metrics::new();
        m.record_emitted(MonitorType::Exec);
        m.record_emitted(MonitorType::Exec);
        m.record_dropped(MonitorType::Exec);
        assert_eq!(m.snapshot(MonitorType::Exec), (2, 1, 0));
        assert_eq!(m.snapshot(MonitorType::Syscall), (0, 0, 0));
    }
}
