//! `open` — aggregate snapshot-and-drain: per-(comm, operation, filename)
//! open/openat/creat counters, filtered by a minimum call count and
//! optionally restricted to error-only rows.

use std::sync::atomic::Ordering;
use std::time::Duration;

use probe_common::{open_op, OpenKey, OpenStats};

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
    "operation",
    "filename",
    "count",
    "errors",
    "error_rate",
    "avg_lat_us",
    "min_lat_us",
    "max_lat_us",
    "flags",
];

fn operation_str(op: u32) -> &'static str {
    match op {
        open_op::OPEN => "open",
        open_op::OPENAT => "openat",
        open_op::CREAT => "creat",
        _ => "unknown",
    }
}

fn ns_to_us(ns: u64) -> f64 {
    ns as f64 / 1000.0
}

pub struct OpenMonitor {
    ctx: MonitorContext,
    state: MonitorState,
    driver: AggregateDriver,
    min_count: u64,
    show_errors_only: bool,
}

impl OpenMonitor {
    pub fn new(ctx: MonitorContext, config: &MonitorConfig) -> Result<Self, MonitorError> {
        Self::validate_config(config)?;
        let interval = config.get_f64("interval")?.unwrap_or(2.0);
        let min_count = config.get_u64("min_count")?.unwrap_or(0);
        let show_errors_only = config.get_bool("show_errors_only")?.unwrap_or(false);
        Ok(OpenMonitor {
            ctx,
            state: MonitorState::default(),
            driver: AggregateDriver::new("OPEN_STATS", Duration::from_secs_f64(interval)),
            min_count,
            show_errors_only,
        })
    }
}

fn to_record(min_count: u64, show_errors_only: bool, key: OpenKey, stats: OpenStats) -> Option<Record> {
    if stats.count < min_count {
        return None;
    }
    if show_errors_only && stats.errors == 0 {
        return None;
    }

    let error_rate = if stats.count > 0 {
        stats.errors as f64 / stats.count as f64
    } else {
        0.0
    };
    let avg_lat_us = if stats.count > 0 {
        ns_to_us(stats.total_ns) / stats.count as f64
    } else {
        0.0
    };

    Some(
        Record::new()
            .set(
                "comm",
                FieldValue::Str(probe_common::bytes_to_str(&key.comm).to_string()),
            )
            .set("operation", FieldValue::Str(operation_str(key.operation).to_string()))
            .set(
                "filename",
                FieldValue::Str(probe_common::bytes_to_str(&key.filename).to_string()),
            )
            .set("count", FieldValue::UInt(stats.count))
            .set("errors", FieldValue::UInt(stats.errors))
            .set("error_rate", FieldValue::Float(error_rate))
            .set("avg_lat_us", FieldValue::Float(avg_lat_us))
            .set("min_lat_us", FieldValue::Float(ns_to_us(stats.min_ns)))
            .set("max_lat_us", FieldValue::Float(ns_to_us(stats.max_ns)))
            .set("flags", FieldValue::UInt(stats.flags as u64)),
    )
}

impl Monitor for OpenMonitor {
    fn monitor_type(&self) -> MonitorType {
        MonitorType::Open
    }

    fn validate_config(config: &MonitorConfig) -> Result<(), MonitorError> {
        config.reject_unknown_keys(&["enabled", "interval", "min_count", "show_errors_only"])?;
        config.get_f64("interval")?;
        config.get_u64("min_count")?;
        config.get_bool("show_errors_only")?;
        Ok(())
    }

    fn required_tracepoints(&self) -> &'static [&'static str] {
        &[
            "syscalls:sys_enter_open",
            "syscalls:sys_exit_open",
            "syscalls:sys_enter_openat",
            "syscalls:sys_exit_openat",
            "syscalls:sys_enter_creat",
            "syscalls:sys_exit_creat",
        ]
    }

    fn load(&self, ebpf: &mut aya::Ebpf) -> Result<(), MonitorError> {
        use aya::programs::TracePoint;

        if self.state.loaded.load(Ordering::Relaxed) {
            return Ok(());
        }
        for (prog_name, name) in [
            ("trace_sys_enter_open", "sys_enter_open"),
            ("trace_sys_exit_open", "sys_exit_open"),
            ("trace_sys_enter_openat", "sys_enter_openat"),
            ("trace_sys_exit_openat", "sys_exit_openat"),
            ("trace_sys_enter_creat", "sys_enter_creat"),
            ("trace_sys_exit_creat", "sys_exit_creat"),
        ] {
            let program: &mut TracePoint = ebpf
                .program_mut(prog_name)
                .ok_or_else(|| MonitorError::Load {
                    monitor: "open".to_string(),
                    reason: format!("{prog_name} program not found in probe-ebpf object"),
                })?
                .try_into()
                .map_err(|e: aya::programs::ProgramError| MonitorError::Load {
                    monitor: "open".to_string(),
                    reason: e.to_string(),
                })?;
            program.load().map_err(|e| MonitorError::Load {
                monitor: "open".to_string(),
                reason: e.to_string(),
            })?;
            program.attach(name, "syscalls").map_err(|e| MonitorError::Load {
                monitor: "open".to_string(),
                reason: e.to_string(),
            })?;
        }
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

impl OpenMonitor {
    pub fn spawn_drain(&self, ebpf: &mut aya::Ebpf, tx: ProducerHandle) -> Result<(), MonitorError> {
        let min_count = self.min_count;
        let show_errors_only = self.show_errors_only;
        self.driver
            .spawn(ebpf, tx, move |key, stats| to_record(min_count, show_errors_only, key, stats))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_key() -> OpenKey {
        let mut key = OpenKey {
            comm: [0u8; 16],
            operation: open_op::OPENAT,
            _pad: 0,
            filename: [0u8; 128],
        };
        key.filename[..5].copy_from_slice(b"/etc\0");
        key
    }

    #[test]
    fn min_count_filters_low_frequency_rows() {
        let key = sample_key();
        let stats = OpenStats {
            count: 2,
            errors: 0,
            total_ns: 0,
            min_ns: 0,
            max_ns: 0,
            flags: 0,
            _pad: 0,
        };
        assert!(to_record(5, false, key, stats).is_none());
        assert!(to_record(1, false, key, stats).is_some());
    }

    #[test]
    fn show_errors_only_requires_errors() {
        let key = sample_key();
        let stats = OpenStats {
            count: 5,
            errors: 0,
            total_ns: 0,
            min_ns: 0,
            max_ns: 0,
            flags: 0,
            _pad: 0,
        };
        assert!(to_record(0, true, key, stats).is_none());
    }

    #[test]
    fn operation_str_names_all_three() {
        assert_eq!(operation_str(open_op::OPEN), "open");
        assert_eq!(operation_str(open_op::OPENAT), "openat");
        assert_eq!(operation_str(open_op::CREAT), "creat");
    }
}
