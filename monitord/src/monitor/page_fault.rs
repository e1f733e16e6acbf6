//! `page_fault` — aggregate snapshot-and-drain: per-(comm, fault kind, cpu)
//! page fault counters with a NUMA node looked up from `cpu` via
//! `/sys/devices/system/node/*/cpulist`. No filtering options.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::Ordering;
use std::time::Duration;

use probe_common::{fault_type, PageFaultKey, PageFaultStats};

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
    "fault_type",
    "fault_type_str",
    "cpu",
    "numa_node",
    "count",
];

/// Primary label is `MAJOR`/`MINOR` (else `UNKNOWN`), then `|WRITE` and
/// `|USER` suffixes are appended when those bits are set.
fn fault_type_str(flags: u32) -> String {
    let mut label = if flags & fault_type::MAJOR != 0 {
        "MAJOR".to_string()
    } else if flags & fault_type::MINOR != 0 {
        "MINOR".to_string()
    } else {
        "UNKNOWN".to_string()
    };
    if flags & fault_type::WRITE != 0 {
        label.push_str("|WRITE");
    }
    if flags & fault_type::USER != 0 {
        label.push_str("|USER");
    }
    label
}

/// Parses `/sys/devices/system/node/node<N>/cpulist` (e.g. `0-3,8` or
/// `0,2,4-6`) into a `cpu -> node` lookup table.
fn read_cpu_to_numa_node(sys_devices_system_node: &Path) -> BTreeMap<u32, u32> {
    let mut map = BTreeMap::new();
    let Ok(entries) = std::fs::read_dir(sys_devices_system_node) else {
        return map;
    };
    for entry in entries.flatten() {
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        let Some(node_str) = name.strip_prefix("node") else { continue };
        let Ok(node) = node_str.parse::<u32>() else { continue };

        let cpulist_path = entry.path().join("cpulist");
        let Ok(contents) = std::fs::read_to_string(&cpulist_path) else {
            continue;
        };
        for range in contents.trim().split(',') {
            if range.is_empty() {
                continue;
            }
            if let Some((start, end)) = range.split_once('-') {
                if let (Ok(start), Ok(end)) = (start.parse::<u32>(), end.parse::<u32>()) {
                    for cpu in start..=end {
                        map.insert(cpu, node);
                    }
                }
            } else if let Ok(cpu) = range.parse::<u32>() {
                map.insert(cpu, node);
            }
        }
    }
    map
}

pub struct PageFaultMonitor {
    ctx: MonitorContext,
    state: MonitorState,
    driver: AggregateDriver,
    cpu_to_numa: BTreeMap<u32, u32>,
}

impl PageFaultMonitor {
    pub fn new(ctx: MonitorContext, config: &MonitorConfig) -> Result<Self, MonitorError> {
        Self::validate_config(config)?;
        let interval = config.get_f64("interval")?.unwrap_or(2.0);
        Ok(PageFaultMonitor {
            ctx,
            state: MonitorState::default(),
            driver: AggregateDriver::new("PAGE_FAULT_STATS", Duration::from_secs_f64(interval)),
            cpu_to_numa: read_cpu_to_numa_node(Path::new("/sys/devices/system/node")),
        })
    }
}

fn to_record(cpu_to_numa: &BTreeMap<u32, u32>, key: PageFaultKey, stats: PageFaultStats) -> Option<Record> {
    let numa_node = cpu_to_numa.get(&key.cpu).copied().unwrap_or(key.numa_node);
    Some(
        Record::new()
            .set(
                "comm",
                FieldValue::Str(probe_common::bytes_to_str(&key.comm).to_string()),
            )
            .set("fault_type", FieldValue::UInt(key.fault_type as u64))
            .set("fault_type_str", FieldValue::Str(fault_type_str(key.fault_type)))
            .set("cpu", FieldValue::UInt(key.cpu as u64))
            .set("numa_node", FieldValue::UInt(numa_node as u64))
            .set("count", FieldValue::UInt(stats.count)),
    )
}

impl Monitor for PageFaultMonitor {
    fn monitor_type(&self) -> MonitorType {
        MonitorType::PageFault
    }

    fn validate_config(config: &MonitorConfig) -> Result<(), MonitorError> {
        config.reject_unknown_keys(&["enabled", "interval"])?;
        config.get_f64("interval")?;
        Ok(())
    }

    fn required_tracepoints(&self) -> &'static [&'static str] {
        &["exceptions:page_fault_user", "exceptions:page_fault_kernel"]
    }

    fn load(&self, ebpf: &mut aya::Ebpf) -> Result<(), MonitorError> {
        use aya::programs::TracePoint;

        if self.state.loaded.load(Ordering::Relaxed) {
            return Ok(());
        }
        for (prog_name, name) in [
            ("trace_page_fault_user", "page_fault_user"),
            ("trace_page_fault_kernel", "page_fault_kernel"),
        ] {
            let program: &mut TracePoint = ebpf
                .program_mut(prog_name)
                .ok_or_else(|| MonitorError::Load {
                    monitor: "page_fault".to_string(),
                    reason: format!("{prog_name} program not found in probe-ebpf object"),
                })?
                .try_into()
                .map_err(|e: aya::programs::ProgramError| MonitorError::Load {
                    monitor: "page_fault".to_string(),
                    reason: e.to_string(),
                })?;
            program.load().map_err(|e| MonitorError::Load {
                monitor: "page_fault".to_string(),
                reason: e.to_string(),
            })?;
            program
                .attach(name, "exceptions")
                .map_err(|e| MonitorError::Load {
                    monitor: "page_fault".to_string(),
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

impl PageFaultMonitor {
    pub fn spawn_drain(&self, ebpf: &mut aya::Ebpf, tx: ProducerHandle) -> Result<(), MonitorError> {
        let cpu_to_numa = self.cpu_to_numa.clone();
        self.driver
            .spawn(ebpf, tx, move |key, stats| to_record(&cpu_to_numa, key, stats))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fault_type_str_orders_primary_then_suffixes() {
        assert_eq!(fault_type_str(fault_type::MAJOR), "MAJOR");
        assert_eq!(fault_type_str(fault_type::MINOR), "MINOR");
        assert_eq!(fault_type_str(0), "UNKNOWN");
        assert_eq!(
            fault_type_str(fault_type::MAJOR | fault_type::WRITE | fault_type::USER),
            "MAJOR|WRITE|USER"
        );
        assert_eq!(fault_type_str(fault_type::MINOR | fault_type::USER), "MINOR|USER");
    }

    #[test]
    fn parses_cpulist_ranges() {
        let dir = tempfile::tempdir().unwrap();
        let node0 = dir.path().join("node0");
        std::fs::create_dir_all(&node0).unwrap();
        std::fs::write(node0.join("cpulist"), "0-2,5\n").unwrap();

        let map = read_cpu_to_numa_node(dir.path());
        assert_eq!(map.get(&0), Some(&0));
        assert_eq!(map.get(&2), Some(&0));
        assert_eq!(map.get(&5), Some(&0));
        assert_eq!(map.get(&3), None);
    }
}
