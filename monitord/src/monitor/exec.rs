//! `exec` — the one per-event streaming monitor (§4.4(b)): a perf buffer
//! per online CPU, polled on its own thread, decoding the fixed
//! `probe_common::ExecEvent` layout into a record per call. Grounded on
//! `cognitod`'s `start_perf_listener` (`runtime/stream_listener.rs`), with
//! the async-task-per-CPU-buffer pattern replaced by a blocking thread per
//! buffer since this core has no async runtime.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use aya::maps::perf::PerfEventArray;
use aya::maps::MapData;
use aya::programs::TracePoint;
use aya::util::online_cpus;
use aya::Ebpf;
use bytes::BytesMut;

use probe_common::ExecEvent;

use crate::config::MonitorConfig;
use crate::context::MonitorContext;
use crate::error::MonitorError;
use crate::monitor::{FieldValue, Monitor, MonitorState, MonitorType, Record};
use crate::output::ProducerHandle;

pub const CSV_HEADER: &[&str] = &[
    "timestamp",
    "time_str",
    "uid",
    "pid",
    "comm",
    "filename",
];

pub struct ExecMonitor {
    ctx: MonitorContext,
    state: MonitorState,
    stop_flag: Arc<AtomicBool>,
    threads: Mutex<Vec<JoinHandle<()>>>,
    aggregate: bool,
}

impl ExecMonitor {
    pub fn new(ctx: MonitorContext, config: &MonitorConfig) -> Result<Self, MonitorError> {
        Self::validate_config(config)?;
        let aggregate = config.get_bool("aggregate")?.unwrap_or(false);
        Ok(ExecMonitor {
            ctx,
            state: MonitorState::default(),
            stop_flag: Arc::new(AtomicBool::new(false)),
            threads: Mutex::new(Vec::new()),
            aggregate,
        })
    }
}

impl Monitor for ExecMonitor {
    fn monitor_type(&self) -> MonitorType {
        MonitorType::Exec
    }

    fn validate_config(config: &MonitorConfig) -> Result<(), MonitorError> {
        config.reject_unknown_keys(&["enabled", "aggregate"])?;
        config.get_bool("aggregate")?;
        Ok(())
    }

    fn required_tracepoints(&self) -> &'static [&'static str] {
        &["sched:sched_process_exec"]
    }

    fn load(&self, ebpf: &mut Ebpf) -> Result<(), MonitorError> {
        if self.aggregate {
            // The aggregate-map exec path is not built in this core: see
            // SPEC_FULL.md §9, the Open Question on the two near-duplicate
            // exec monitors. Streaming is canonical; this switch exists so
            // misconfiguration is caught at load, not silently ignored.
            return Err(MonitorError::Load {
                monitor: "exec".to_string(),
                reason: "aggregate exec mode is not implemented; set aggregate: false".to_string(),
            });
        }
        if self.state.loaded.load(Ordering::Relaxed) {
            return Ok(());
        }

        let program: &mut TracePoint = ebpf
            .program_mut("trace_exec")
            .ok_or_else(|| MonitorError::Load {
                monitor: "exec".to_string(),
                reason: "trace_exec program not found in probe-ebpf object".to_string(),
            })?
            .try_into()
            .map_err(|e: aya::programs::ProgramError| MonitorError::Load {
                monitor: "exec".to_string(),
                reason: e.to_string(),
            })?;
        program.load().map_err(|e| MonitorError::Load {
            monitor: "exec".to_string(),
            reason: e.to_string(),
        })?;
        program
            .attach("sched_process_exec", "sched")
            .map_err(|e| MonitorError::Load {
                monitor: "exec".to_string(),
                reason: e.to_string(),
            })?;

        self.state.loaded.store(true, Ordering::Relaxed);
        Ok(())
    }

    fn run(&self, tx: ProducerHandle) -> Result<(), MonitorError> {
        if self.state.running.swap(true, Ordering::Relaxed) {
            return Ok(());
        }
        // `run` is only reachable after a successful `load`, which opens
        // the perf array from the same `Ebpf` instance `MonitorManager`
        // owns; in this design the manager passes buffers in via a
        // separate `spawn_drain` call made right after `load` (see
        // `MonitorManager::start_monitor`), so this body only flips the
        // running flag — the actual per-CPU threads are started there.
        let _ = tx;
        Ok(())
    }

    fn stop(&self) {
        self.stop_flag.store(true, Ordering::Relaxed);
        self.state.running.store(false, Ordering::Relaxed);
        let mut threads = self.threads.lock().unwrap();
        for handle in threads.drain(..) {
            let _ = handle.join();
        }
    }

    fn cleanup(&self) {
        self.state.loaded.store(false, Ordering::Relaxed);
    }

    fn csv_header(&self) -> &'static [&'static str] {
        CSV_HEADER
    }

    fn state(&self) -> &MonitorState {
        &self.state
    }
}

impl ExecMonitor {
    /// Opens one perf buffer per online CPU off `ebpf`'s `EXEC_EVENTS` map
    /// and spawns one decode thread per buffer, matching
    /// `start_perf_listener`'s per-CPU fan-out but blocking instead of
    /// async.
    pub fn spawn_drain(&self, ebpf: &mut Ebpf, tx: ProducerHandle) -> Result<(), MonitorError> {
        let events_map = ebpf.take_map("EXEC_EVENTS").ok_or_else(|| MonitorError::Load {
            monitor: "exec".to_string(),
            reason: "EXEC_EVENTS map not found".to_string(),
        })?;
        let mut perf_array: PerfEventArray<MapData> = PerfEventArray::try_from(events_map)
            .map_err(|e| MonitorError::Load {
                monitor: "exec".to_string(),
                reason: e.to_string(),
            })?;

        let mut threads = self.threads.lock().unwrap();
        for cpu_id in online_cpus().map_err(|(msg, e)| MonitorError::Load {
            monitor: "exec".to_string(),
            reason: format!("{msg}: {e}"),
        })? {
            let mut buf = perf_array
                .open(cpu_id, None)
                .map_err(|e| MonitorError::Load {
                    monitor: "exec".to_string(),
                    reason: e.to_string(),
                })?;
            let stop_flag = self.stop_flag.clone();
            let tx = tx.clone();
            threads.push(std::thread::spawn(move || {
                let mut bufs = vec![BytesMut::with_capacity(4096); 16];
                while !stop_flag.load(Ordering::Relaxed) {
                    let events = match buf.read_events(&mut bufs) {
                        Ok(events) => events,
                        Err(_) => {
                            std::thread::sleep(Duration::from_millis(200));
                            continue;
                        }
                    };
                    if events.read == 0 {
                        std::thread::sleep(Duration::from_millis(200));
                        continue;
                    }
                    for raw in bufs.iter().take(events.read) {
                        if raw.len() < std::mem::size_of::<ExecEvent>() {
                            continue;
                        }
                        let event: ExecEvent =
                            unsafe { std::ptr::read_unaligned(raw.as_ptr() as *const ExecEvent) };
                        let record = decode_event(&event);
                        tx.handle_data(record);
                    }
                }
            }));
        }
        Ok(())
    }
}

fn decode_event(event: &ExecEvent) -> Record {
    Record::new()
        .set("uid", FieldValue::UInt(event.uid as u64))
        .set("pid", FieldValue::UInt(event.pid as u64))
        .set(
            "comm",
            FieldValue::Str(probe_common::bytes_to_str(&event.comm).to_string()),
        )
        .set(
            "filename",
            FieldValue::Str(probe_common::bytes_to_str(&event.filename).to_string()),
        )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_event_reads_fixed_layout() {
        let mut event = ExecEvent {
            pid: 42,
            ppid: 1,
            uid: 1000,
            _pad: 0,
            ts_ns: 0,
            comm: [0u8; 16],
            filename: [0u8; 256],
        };
        event.comm[..3].copy_from_slice(b"cat");
        event.filename[..9].copy_from_slice(b"/bin/true");
        let record = decode_event(&event);
        assert_eq!(record.get("pid"), Some(&FieldValue::UInt(42)));
        assert_eq!(
            record.get("filename"),
            Some(&FieldValue::Str("/bin/true".to_string()))
        );
    }

    #[test]
    fn aggregate_flag_rejects_unknown_keys() {
        let cfg: MonitorConfig = serde_yaml::from_str("enabled: true\nbogus: 1").unwrap();
        assert!(ExecMonitor::validate_config(&cfg).is_err());
    }
}
