//! `syscall` — aggregate snapshot-and-drain (§4.4(a)): per-(comm, syscall
//! number) call counts, error counts and latency extrema, bucketed into a
//! category so `monitor_categories` can disable whole buckets at once.

use std::sync::atomic::Ordering;
use std::time::Duration;

use probe_common::{SyscallCategory, SyscallKey, SyscallStats};

use crate::config::MonitorConfig;
use crate::context::MonitorContext;
use crate::error::MonitorError;
use crate::monitor::aggregate::AggregateDriver;
use crate::monitor::syscall_table;
use crate::monitor::{FieldValue, Monitor, MonitorState, MonitorType, Record};
use crate::output::ProducerHandle;

pub const CSV_HEADER: &[&str] = &[
    "timestamp",
    "time_str",
    "comm",
    "syscall_nr",
    "syscall_name",
    "category",
    "count",
    "error_count",
    "error_rate",
];

const CATEGORIES: &[(&str, SyscallCategory)] = &[
    ("file_io", SyscallCategory::FileIo),
    ("network", SyscallCategory::Network),
    ("memory", SyscallCategory::Memory),
    ("process", SyscallCategory::Process),
    ("signal", SyscallCategory::Signal),
    ("time", SyscallCategory::Time),
    ("ipc", SyscallCategory::Ipc),
    ("other", SyscallCategory::Other),
];

pub struct SyscallMonitor {
    ctx: MonitorContext,
    state: MonitorState,
    driver: AggregateDriver,
    show_errors_only: bool,
    disabled_categories: Vec<SyscallCategory>,
}

impl SyscallMonitor {
    pub fn new(ctx: MonitorContext, config: &MonitorConfig) -> Result<Self, MonitorError> {
        Self::validate_config(config)?;
        let interval = config.get_f64("interval")?.unwrap_or(2.0);
        let show_errors_only = config.get_bool("show_errors_only")?.unwrap_or(false);
        let disabled_categories = config
            .get_bool_map("monitor_categories")?
            .unwrap_or_default()
            .into_iter()
            .filter(|(_, enabled)| !enabled)
            .filter_map(|(name, _)| {
                CATEGORIES
                    .iter()
                    .find(|(cat_name, _)| *cat_name == name)
                    .map(|(_, cat)| *cat)
            })
            .collect();

        Ok(SyscallMonitor {
            ctx,
            state: MonitorState::default(),
            driver: AggregateDriver::new("SYSCALL_STATS", Duration::from_secs_f64(interval)),
            show_errors_only,
            disabled_categories,
        })
    }

}

fn to_record(
    show_errors_only: bool,
    disabled: &[SyscallCategory],
    key: SyscallKey,
    stats: SyscallStats,
) -> Option<Record> {
    let category = syscall_table::category_for(key.syscall_nr);
    if disabled.contains(&category) {
        return None;
    }
    if show_errors_only && stats.error_count == 0 {
        return None;
    }

    let error_rate = if stats.count > 0 {
        stats.error_count as f64 / stats.count as f64
    } else {
        0.0
    };

    Some(
        Record::new()
            .set(
                "comm",
                FieldValue::Str(probe_common::bytes_to_str(&key.comm).to_string()),
            )
            .set("syscall_nr", FieldValue::UInt(key.syscall_nr as u64))
            .set(
                "syscall_name",
                FieldValue::Str(syscall_table::name_for(key.syscall_nr)),
            )
            .set("category", FieldValue::Str(category.as_str().to_string()))
            .set("count", FieldValue::UInt(stats.count))
            .set("error_count", FieldValue::UInt(stats.error_count))
            .set("error_rate", FieldValue::Float(error_rate)),
    )
}

impl Monitor for SyscallMonitor {
    fn monitor_type(&self) -> MonitorType {
        MonitorType::Syscall
    }

    fn validate_config(config: &MonitorConfig) -> Result<(), MonitorError> {
        config.reject_unknown_keys(&[
            "enabled",
            "interval",
            "monitor_categories",
            "show_errors_only",
        ])?;
        config.get_f64("interval")?;
        config.get_bool("show_errors_only")?;
        if let Some(map) = config.get_bool_map("monitor_categories")? {
            for name in map.keys() {
                if !CATEGORIES.iter().any(|(cat_name, _)| cat_name == name) {
                    return Err(MonitorError::Config {
                        key: format!("monitor_categories.{name}"),
                        reason: "not a recognized syscall category".to_string(),
                    });
                }
            }
        }
        Ok(())
    }

    fn required_tracepoints(&self) -> &'static [&'static str] {
        &["raw_syscalls:sys_enter", "raw_syscalls:sys_exit"]
    }

    fn load(&self, ebpf: &mut aya::Ebpf) -> Result<(), MonitorError> {
        use aya::programs::TracePoint;

        if self.state.loaded.load(Ordering::Relaxed) {
            return Ok(());
        }
        for (prog_name, category, name) in [
            ("trace_sys_enter", "raw_syscalls", "sys_enter"),
            ("trace_sys_exit", "raw_syscalls", "sys_exit"),
        ] {
            let program: &mut TracePoint = ebpf
                .program_mut(prog_name)
                .ok_or_else(|| MonitorError::Load {
                    monitor: "syscall".to_string(),
                    reason: format!("{prog_name} program not found in probe-ebpf object"),
                })?
                .try_into()
                .map_err(|e: aya::programs::ProgramError| MonitorError::Load {
                    monitor: "syscall".to_string(),
                    reason: e.to_string(),
                })?;
            program.load().map_err(|e| MonitorError::Load {
                monitor: "syscall".to_string(),
                reason: e.to_string(),
            })?;
            program.attach(name, category).map_err(|e| MonitorError::Load {
                monitor: "syscall".to_string(),
                reason: e.to_string(),
            })?;
        }
        self.state.loaded.store(true, Ordering::Relaxed);
        Ok(())
    }

    fn run(&self, tx: ProducerHandle) -> Result<(), MonitorError> {
        let _ = (tx, &self.ctx);
        // Actual drain-thread spawn happens in `spawn_drain`, which needs
        // `&mut Ebpf` to take the stats map; see `ExecMonitor` for the same
        // split and why `Monitor::run` alone can't do it.
        if self.state.running.swap(true, Ordering::Relaxed) {
            return Ok(());
        }
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

impl SyscallMonitor {
    pub fn spawn_drain(&self, ebpf: &mut aya::Ebpf, tx: ProducerHandle) -> Result<(), MonitorError> {
        let show_errors_only = self.show_errors_only;
        let disabled = self.disabled_categories.clone();
        self.driver.spawn(ebpf, tx, move |key, stats| {
            to_record(show_errors_only, &disabled, key, stats)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_category_is_dropped() {
        let key = SyscallKey {
            comm: [0u8; 16],
            syscall_nr: 42, // connect, Network
            _pad: 0,
        };
        let stats = SyscallStats {
            count: 5,
            error_count: 0,
            total_ns: 0,
            min_ns: 0,
            max_ns: 0,
        };
        assert!(to_record(false, &[SyscallCategory::Network], key, stats).is_none());
        assert!(to_record(false, &[], key, stats).is_some());
    }

    #[test]
    fn show_errors_only_requires_errors() {
        let key = SyscallKey {
            comm: [0u8; 16],
            syscall_nr: 0,
            _pad: 0,
        };
        let stats = SyscallStats {
            count: 5,
            error_count: 0,
            total_ns: 0,
            min_ns: 0,
            max_ns: 0,
        };
        assert!(to_record(true, &[], key, stats).is_none());
    }

    #[test]
    fn validate_config_rejects_unknown_category() {
        let cfg: MonitorConfig = serde_yaml::from_str(
            "enabled: true\nmonitor_categories:\n  not_a_category: true",
        )
        .unwrap();
        assert!(SyscallMonitor::validate_config(&cfg).is_err());
    }
}
