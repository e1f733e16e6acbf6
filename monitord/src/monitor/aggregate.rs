//! Shared driver for the six snapshot-and-drain monitors (§4.4(a)):
//! syscall, bio, open, func, interrupt, page_fault. Each cycle, at cadence
//! `interval`, snapshots the keys currently in the stats map, then for each
//! key performs a lookup-then-delete, turning a vanished key into a
//! skipped (not failed) row — the `TransientDrainError` case, handled
//! inline rather than as a propagated error per the error design's
//! "skipped silently" policy.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use aya::maps::{HashMap as BpfHashMap, MapData};

use crate::error::MonitorError;
use crate::monitor::Record;
use crate::output::ProducerHandle;

/// `probe-common`'s wire structs (`SyscallKey`, `BioStats`, ...) derive
/// `bytemuck::Pod`, but `aya::maps::HashMap` requires the distinct
/// `aya::Pod` marker, which has no blanket impl over `bytemuck::Pod`. The
/// impl can't live in `probe-common` (no `aya` dependency there) and can't
/// target the wire structs directly from here either — both the trait and
/// the type are foreign to this crate, which orphan rules forbid. This
/// transparent wrapper is local to `monitord`, so it carries the impl once,
/// generically, the way `cognitod`'s `TelemetryConfigPod` carries it for a
/// single type.
#[repr(transparent)]
#[derive(Copy, Clone)]
struct AyaPod<T>(T);

unsafe impl<T: bytemuck::Pod + Send + Sync + 'static> aya::Pod for AyaPod<T> {}

pub struct AggregateDriver {
    stop_flag: Arc<AtomicBool>,
    thread: Mutex<Option<JoinHandle<()>>>,
    interval: Duration,
    map_name: &'static str,
}

impl AggregateDriver {
    pub fn new(map_name: &'static str, interval: Duration) -> Self {
        AggregateDriver {
            stop_flag: Arc::new(AtomicBool::new(false)),
            thread: Mutex::new(None),
            interval,
            map_name,
        }
    }

    /// Opens the named `HashMap<K, V>` off `ebpf` and spawns the drain
    /// thread. `to_record` turns a decoded `(key, value)` pair into a
    /// `Record`, returning `None` to apply a per-monitor filter
    /// (`should_emit`) before it ever reaches the sink.
    pub fn spawn<K, V>(
        &self,
        ebpf: &mut aya::Ebpf,
        tx: ProducerHandle,
        to_record: impl Fn(K, V) -> Option<Record> + Send + Sync + 'static,
    ) -> Result<(), MonitorError>
    where
        K: bytemuck::Pod + Send + Sync + 'static,
        V: bytemuck::Pod + Send + Sync + 'static,
    {
        let map_name = self.map_name;
        let map = ebpf
            .take_map(map_name)
            .ok_or_else(|| MonitorError::Load {
                monitor: map_name.to_string(),
                reason: format!("{map_name} map not found"),
            })?;
        let mut stats: BpfHashMap<MapData, AyaPod<K>, AyaPod<V>> =
            BpfHashMap::try_from(map).map_err(|e| MonitorError::Load {
                monitor: map_name.to_string(),
                reason: e.to_string(),
            })?;

        let stop_flag = self.stop_flag.clone();
        let interval = self.interval;
        let handle = std::thread::spawn(move || {
            while !stop_flag.load(Ordering::Relaxed) {
                std::thread::sleep(interval);
                if stop_flag.load(Ordering::Relaxed) {
                    break;
                }

                let keys: Vec<AyaPod<K>> = stats.keys().filter_map(|k| k.ok()).collect();
                for key in keys {
                    let value = match stats.get(&key, 0) {
                        Ok(v) => v,
                        // Key vanished between snapshot and read: another
                        // cycle (or this one, via a racing insert) already
                        // consumed it. Skip silently (TransientDrainError).
                        Err(_) => continue,
                    };
                    let _ = stats.remove(&key);
                    if let Some(record) = to_record(key.0, value.0) {
                        tx.handle_data(record);
                    }
                }
            }
        });
        *self.thread.lock().unwrap() = Some(handle);
        Ok(())
    }

    pub fn stop(&self) {
        self.stop_flag.store(true, Ordering::Relaxed);
        if let Some(handle) = self.thread.lock().unwrap().take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn driver_starts_unstopped() {
        let driver = AggregateDriver::new("TEST_STATS", Duration::from_secs(1));
        assert!(!driver.stop_flag.load(Ordering::Relaxed));
    }
}
