//! `func` — dynamic kernel function probing. The original design generated
//! one BCC kprobe per matched symbol at runtime from a C template; aya
//! cross-compiles `probe-ebpf` ahead of time, so instead `probe-ebpf`
//! declares `MAX_FUNC_PROBES` (32) pre-built `trace_func_N` kprobe slots
//! (see `probe-ebpf/src/program.rs`) and this monitor matches configured
//! glob patterns against `/proc/kallsyms`, then attaches up to that many
//! matched symbols to consecutive slots at load time.

use std::fs;
use std::sync::atomic::Ordering;
use std::time::Duration;

use probe_common::{FuncKey, FuncStats, MAX_FUNC_PROBES};

use crate::config::MonitorConfig;
use crate::context::MonitorContext;
use crate::error::MonitorError;
use crate::monitor::aggregate::AggregateDriver;
use crate::monitor::{FieldValue, Monitor, MonitorState, MonitorType, Record};
use crate::output::ProducerHandle;

pub const CSV_HEADER: &[&str] = &["timestamp", "time_str", "comm", "func_name", "count"];

const KALLSYMS_PATH: &str = "/proc/kallsyms";

/// Translates a shell-style glob (`*`, `?`) into an anchored regex-free
/// matcher; kallsyms names are plain identifiers so a hand-rolled matcher
/// avoids pulling in a regex dependency for this one case.
fn glob_match(pattern: &str, name: &str) -> bool {
    fn go(pattern: &[u8], name: &[u8]) -> bool {
        match (pattern.first(), name.first()) {
            (None, None) => true,
            (Some(b'*'), _) => {
                go(&pattern[1..], name) || (!name.is_empty() && go(pattern, &name[1..]))
            }
            (Some(b'?'), Some(_)) => go(&pattern[1..], &name[1..]),
            (Some(p), Some(n)) if p == n => go(&pattern[1..], &name[1..]),
            _ => false,
        }
    }
    go(pattern.as_bytes(), name.as_bytes())
}

/// Reads `/proc/kallsyms` and returns every function-symbol name (type `t`
/// or `T` — local/global text symbols) matching any of `patterns`, capped
/// at `limit`.
fn matching_symbols(kallsyms_path: &str, patterns: &[String], limit: usize) -> Result<Vec<String>, MonitorError> {
    let contents = fs::read_to_string(kallsyms_path).map_err(|e| MonitorError::Io {
        path: kallsyms_path.into(),
        source: e,
    })?;

    let mut matched = Vec::new();
    for line in contents.lines() {
        let mut fields = line.split_whitespace();
        let (_addr, kind, name) = match (fields.next(), fields.next(), fields.next()) {
            (Some(a), Some(k), Some(n)) => (a, k, n),
            _ => continue,
        };
        if kind != "t" && kind != "T" {
            continue;
        }
        if patterns.iter().any(|p| glob_match(p, name)) {
            matched.push(name.to_string());
            if matched.len() >= limit {
                break;
            }
        }
    }
    Ok(matched)
}

pub struct FuncMonitor {
    ctx: MonitorContext,
    state: MonitorState,
    driver: AggregateDriver,
    patterns: Vec<String>,
    probe_limit: usize,
    attached: std::sync::Mutex<Vec<String>>,
}

impl FuncMonitor {
    pub fn new(ctx: MonitorContext, config: &MonitorConfig) -> Result<Self, MonitorError> {
        Self::validate_config(config)?;
        let interval = config.get_f64("interval")?.unwrap_or(2.0);
        let patterns = config.get_str_list("patterns")?.unwrap_or_default();
        let probe_limit = config
            .get_u64("probe_limit")?
            .map(|v| v as usize)
            .unwrap_or(MAX_FUNC_PROBES as usize)
            .min(MAX_FUNC_PROBES as usize);
        Ok(FuncMonitor {
            ctx,
            state: MonitorState::default(),
            driver: AggregateDriver::new("FUNC_STATS", Duration::from_secs_f64(interval)),
            patterns,
            probe_limit,
            attached: std::sync::Mutex::new(Vec::new()),
        })
    }
}

fn to_record(attached: &[String], key: FuncKey, stats: FuncStats) -> Option<Record> {
    let func_name = attached
        .get(key.func_id as usize)
        .cloned()
        .unwrap_or_else(|| format!("func_{}", key.func_id));
    Some(
        Record::new()
            .set(
                "comm",
                FieldValue::Str(probe_common::bytes_to_str(&key.comm).to_string()),
            )
            .set("func_name", FieldValue::Str(func_name))
            .set("count", FieldValue::UInt(stats.count)),
    )
}

impl Monitor for FuncMonitor {
    fn monitor_type(&self) -> MonitorType {
        MonitorType::Func
    }

    fn validate_config(config: &MonitorConfig) -> Result<(), MonitorError> {
        config.reject_unknown_keys(&["enabled", "interval", "patterns", "probe_limit"])?;
        config.get_f64("interval")?;
        config.get_str_list("patterns")?;
        if let Some(limit) = config.get_u64("probe_limit")? {
            if limit == 0 || limit > MAX_FUNC_PROBES as u64 {
                return Err(MonitorError::Config {
                    key: "probe_limit".to_string(),
                    reason: format!("must be between 1 and {MAX_FUNC_PROBES}"),
                });
            }
        }
        Ok(())
    }

    fn load(&self, ebpf: &mut aya::Ebpf) -> Result<(), MonitorError> {
        use aya::programs::KProbe;

        if self.state.loaded.load(Ordering::Relaxed) {
            return Ok(());
        }
        if self.patterns.is_empty() {
            self.state.loaded.store(true, Ordering::Relaxed);
            return Ok(());
        }

        let symbols = matching_symbols(KALLSYMS_PATH, &self.patterns, self.probe_limit)?;
        let mut attached_count = 0usize;
        for (id, symbol) in symbols.iter().enumerate() {
            let prog_name = format!("trace_func_{id}");
            let attempt = (|| -> Result<(), MonitorError> {
                let program: &mut KProbe = ebpf
                    .program_mut(&prog_name)
                    .ok_or_else(|| MonitorError::Load {
                        monitor: "func".to_string(),
                        reason: format!("{prog_name} program not found in probe-ebpf object"),
                    })?
                    .try_into()
                    .map_err(|e: aya::programs::ProgramError| MonitorError::Load {
                        monitor: "func".to_string(),
                        reason: e.to_string(),
                    })?;
                program.load().map_err(|e| MonitorError::Load {
                    monitor: "func".to_string(),
                    reason: e.to_string(),
                })?;
                program.attach(symbol, 0).map_err(|e| MonitorError::Load {
                    monitor: "func".to_string(),
                    reason: format!("attaching to `{symbol}`: {e}"),
                })?;
                Ok(())
            })();
            match attempt {
                Ok(()) => attached_count += 1,
                Err(e) => log::warn!("func monitor: skipping `{symbol}`: {e}"),
            }
        }
        if attached_count == 0 {
            return Err(MonitorError::Load {
                monitor: "func".to_string(),
                reason: "no symbol probes attached".to_string(),
            });
        }
        *self.attached.lock().unwrap() = symbols;
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

impl FuncMonitor {
    pub fn spawn_drain(&self, ebpf: &mut aya::Ebpf, tx: ProducerHandle) -> Result<(), MonitorError> {
        let attached = self.attached.lock().unwrap().clone();
        self.driver
            .spawn(ebpf, tx, move |key, stats| to_record(&attached, key, stats))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn glob_matches_star_and_question_mark() {
        assert!(glob_match("vfs_*", "vfs_read"));
        assert!(glob_match("sys_?pen", "sys_open"));
        assert!(!glob_match("vfs_*", "do_sys_open"));
        assert!(glob_match("*", "anything"));
    }

    #[test]
    fn matching_symbols_respects_limit() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kallsyms");
        std::fs::write(
            &path,
            "ffffffff81000000 T vfs_read\nffffffff81000010 t vfs_write\nffffffff81000020 T do_mmap\n",
        )
        .unwrap();
        let matched = matching_symbols(path.to_str().unwrap(), &["vfs_*".to_string()], 1).unwrap();
        assert_eq!(matched.len(), 1);
        assert_eq!(matched[0], "vfs_read");
    }

    #[test]
    fn probe_limit_is_capped_by_max_func_probes() {
        let cfg: MonitorConfig = serde_yaml::from_str("enabled: true\nprobe_limit: 9999").unwrap();
        assert!(FuncMonitor::validate_config(&cfg).is_err());
    }
}
