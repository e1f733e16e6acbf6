//! `bio` — aggregate snapshot-and-drain: per-(comm, direction) block I/O
//! counters, filtered by a minimum mean latency.

use std::sync::atomic::Ordering;
use std::time::Duration;

use probe_common::{io_type, BioKey, BioStats};

use crate::config::MonitorConfig;
use crate::context::MonitorContext;
use crate::error::MonitorError;
use crate::monitor::aggregate::AggregateDriver;
use crate::monitor::{FieldValue, Monitor, MonitorState, MonitorType, Record};
use crate::output::ProducerHandle;

pub const CSV_HEADER: &[&str] = &[
    "timestamp",
    "time_str",
    "comm",
    "io_type",
    "io_type_str",
    "count",
    "total_bytes",
    "size_mb",
    "avg_latency_us",
    "min_latency_us",
    "max_latency_us",
    "throughput_mbps",
];

fn io_type_str(flags: u32) -> &'static str {
    if flags & io_type::WRITE != 0 {
        "WRITE"
    } else {
        "READ"
    }
}

fn ns_to_us(ns: u64) -> f64 {
    ns as f64 / 1000.0
}

pub struct BioMonitor {
    ctx: MonitorContext,
    state: MonitorState,
    driver: AggregateDriver,
    min_latency_us: f64,
}

impl BioMonitor {
    pub fn new(ctx: MonitorContext, config: &MonitorConfig) -> Result<Self, MonitorError> {
        Self::validate_config(config)?;
        let interval = config.get_f64("interval")?.unwrap_or(2.0);
        let min_latency_us = config.get_f64("min_latency_us")?.unwrap_or(0.0);
        Ok(BioMonitor {
            ctx,
            state: MonitorState::default(),
            driver: AggregateDriver::new("BIO_STATS", Duration::from_secs_f64(interval)),
            min_latency_us,
        })
    }
}

fn to_record(min_latency_us: f64, key: BioKey, stats: BioStats) -> Option<Record> {
    let avg_latency_us = if stats.count > 0 {
        ns_to_us(stats.total_ns) / stats.count as f64
    } else {
        0.0
    };
    if avg_latency_us < min_latency_us {
        return None;
    }

    let size_mb = stats.total_bytes as f64 / (1024.0 * 1024.0);
    let total_duration_s = stats.total_ns as f64 / 1_000_000_000.0;
    let throughput_mbps = if total_duration_s > 0.0 {
        size_mb / total_duration_s
    } else {
        0.0
    };

    Some(
        Record::new()
            .set(
                "comm",
                FieldValue::Str(probe_common::bytes_to_str(&key.comm).to_string()),
            )
            .set("io_type", FieldValue::UInt(key.io_type as u64))
            .set("io_type_str", FieldValue::Str(io_type_str(key.io_type).to_string()))
            .set("count", FieldValue::UInt(stats.count))
            .set("total_bytes", FieldValue::UInt(stats.total_bytes))
            .set("size_mb", FieldValue::Float(size_mb))
            .set("avg_latency_us", FieldValue::Float(avg_latency_us))
            .set("min_latency_us", FieldValue::Float(ns_to_us(stats.min_ns)))
            .set("max_latency_us", FieldValue::Float(ns_to_us(stats.max_ns)))
            .set("throughput_mbps", FieldValue::Float(throughput_mbps)),
    )
}

impl Monitor for BioMonitor {
    fn monitor_type(&self) -> MonitorType {
        MonitorType::Bio
    }

    fn validate_config(config: &MonitorConfig) -> Result<(), MonitorError> {
        config.reject_unknown_keys(&["enabled", "interval", "min_latency_us"])?;
        config.get_f64("interval")?;
        config.get_f64("min_latency_us")?;
        Ok(())
    }

    fn required_tracepoints(&self) -> &'static [&'static str] {
        &["block:block_rq_complete"]
    }

    fn load(&self, ebpf: &mut aya::Ebpf) -> Result<(), MonitorError> {
        use aya::programs::TracePoint;

        if self.state.loaded.load(Ordering::Relaxed) {
            return Ok(());
        }
        let program: &mut TracePoint = ebpf
            .program_mut("trace_block_rq_complete")
            .ok_or_else(|| MonitorError::Load {
                monitor: "bio".to_string(),
                reason: "trace_block_rq_complete program not found in probe-ebpf object".to_string(),
            })?
            .try_into()
            .map_err(|e: aya::programs::ProgramError| MonitorError::Load {
                monitor: "bio".to_string(),
                reason: e.to_string(),
            })?;
        program.load().map_err(|e| MonitorError::Load {
            monitor: "bio".to_string(),
            reason: e.to_string(),
        })?;
        program
            .attach("block_rq_complete", "block")
            .map_err(|e| MonitorError::Load {
                monitor: "bio".to_string(),
                reason: e.to_string(),
            })?;
        self.state.loaded.store(true, Ordering::Relaxed);
        Ok(())
    }

    fn run(&self, tx: ProducerHandle) -> Result<(), MonitorError> {
        let _ = (tx, &self.ctx);
        self.state.running.store(true, Ordering::Relaxed);
        Ok(())
    }

    fn stop(&self) {
        self.driver.stop();
        self.state.running.store(false, Ordering::Relaxed);
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

impl BioMonitor {
    pub fn spawn_drain(&self, ebpf: &mut aya::Ebpf, tx: ProducerHandle) -> Result<(), MonitorError> {
        let min_latency_us = self.min_latency_us;
        self.driver
            .spawn(ebpf, tx, move |key, stats| to_record(min_latency_us, key, stats))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_type_str_decodes_write_and_read() {
        assert_eq!(io_type_str(io_type::WRITE), "WRITE");
        assert_eq!(io_type_str(io_type::READ), "READ");
    }

    #[test]
    fn min_latency_filter_drops_fast_rows() {
        let key = BioKey {
            comm: [0u8; 16],
            io_type: io_type::READ,
            _pad: 0,
        };
        let stats = BioStats {
            count: 1,
            total_bytes: 4096,
            total_ns: 1000,
            min_ns: 1000,
            max_ns: 1000,
        };
        assert!(to_record(5.0, key, stats).is_none());
        assert!(to_record(0.0, key, stats).is_some());
    }
}
