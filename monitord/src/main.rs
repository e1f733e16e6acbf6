//! CLI entry point (§6): parses arguments, probes the environment, loads
//! configuration, builds and starts the monitors, then blocks until a
//! shutdown signal arrives. Grounded on `cognitod`'s `main.rs` — argument
//! parsing via `clap::Parser`, `env_logger::init()`, locating the compiled
//! eBPF object off a fixed candidate list with an env var override, and
//! `EbpfLoader`/`aya_log::EbpfLogger` bootstrapping — generalized from one
//! hardcoded probe set to the `MonitorFactory`-built selection, and with
//! `--daemon-status`/`--daemon-stop` added as client-side paths that never
//! touch the eBPF stack at all.

use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::time::Duration;

use aya::{Ebpf, EbpfLoader};
use clap::Parser;

use monitord::capability::CapabilityChecker;
use monitord::config::ConfigStore;
use monitord::daemon::DaemonController;
use monitord::error::MonitorError;
use monitord::factory::MonitorFactory;
use monitord::manager::MonitorManager;
use monitord::monitor::MonitorType;
use monitord::output::OutputController;

#[derive(Parser, Debug)]
#[command(name = "monitord", version, about = "eBPF-powered Linux system telemetry collector")]
struct Args {
    /// Path to the monitor configuration file
    #[arg(short = 'c', long = "config", value_name = "PATH", default_value = "config/monitor_config.yaml")]
    config: PathBuf,

    /// Comma-separated monitor selection, e.g. `exec,syscall,bio`
    #[arg(short = 'm', long = "monitors", value_name = "TYPE[,TYPE...]", value_delimiter = ',')]
    monitors: Vec<String>,

    /// Daemonize: double-fork into the background and write a PID file
    #[arg(short = 'd', long = "daemon")]
    daemon: bool,

    /// Print whether a daemon instance is running, then exit
    #[arg(long = "daemon-status")]
    daemon_status: bool,

    /// Stop the running daemon instance, then exit
    #[arg(long = "daemon-stop")]
    daemon_stop: bool,

    /// Print MonitorManager load/run status as JSON once monitors start
    #[arg(long = "status")]
    status: bool,

    /// Increase log verbosity (stacks: -v, -vv)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    verbose: u8,
}

fn selected_monitor_types(args: &Args) -> Result<Vec<MonitorType>, MonitorError> {
    if args.monitors.is_empty() {
        return Ok(MonitorType::ALL.to_vec());
    }
    args.monitors
        .iter()
        .map(|name| {
            MonitorType::parse(name).ok_or_else(|| MonitorError::Config {
                key: "--monitors".to_string(),
                reason: format!("`{name}` is not a registered monitor type"),
            })
        })
        .collect()
}

fn init_logging(verbose: u8, configured_level: Option<&str>) {
    let level = match verbose {
        0 => configured_level.unwrap_or("info").to_string(),
        1 => "debug".to_string(),
        _ => "trace".to_string(),
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();
}

/// Locates the compiled `probe-ebpf` object: an env var override first, then
/// the conventional `cargo xtask build-ebpf` output paths relative to the
/// process's current directory.
fn read_probe_object() -> anyhow::Result<Vec<u8>> {
    if let Ok(path) = std::env::var("MONITORD_PROBE_PATH") {
        return Ok(std::fs::read(&path)?);
    }
    const CANDIDATES: [&str; 4] = [
        "/usr/local/share/monitord/probe-ebpf",
        "target/bpfel-unknown-none/release/probe-ebpf",
        "./target/bpfel-unknown-none/release/probe-ebpf",
        "../target/bpfel-unknown-none/release/probe-ebpf",
    ];
    for candidate in CANDIDATES {
        if Path::new(candidate).exists() {
            return Ok(std::fs::read(candidate)?);
        }
    }
    anyhow::bail!(
        "compiled probe-ebpf object not found; build it with `cargo xtask build-ebpf` or set MONITORD_PROBE_PATH"
    );
}

/// The returned `EbpfLogger` must be kept alive for the process lifetime:
/// dropping it stops relaying `bpf_printk!`/`aya_log_ebpf` output from the
/// loaded programs into the `log` facade.
fn load_ebpf() -> anyhow::Result<(Ebpf, Option<aya_log::EbpfLogger>)> {
    let bytes = read_probe_object()?;
    let mut ebpf = EbpfLoader::new().load(&bytes)?;
    let logger = match aya_log::EbpfLogger::init(&mut ebpf) {
        Ok(logger) => {
            log::info!("probe-ebpf logger initialized");
            Some(logger)
        }
        Err(e) => {
            log::warn!("probe-ebpf logger not active: {e}");
            None
        }
    };
    Ok((ebpf, logger))
}

fn run_daemon_status(controller: &DaemonController, pid_file: &Path) -> i32 {
    if controller.is_running() {
        println!("monitord is running (pid file: {})", pid_file.display());
        0
    } else {
        println!("monitord is not running (pid file: {})", pid_file.display());
        1
    }
}

fn run_daemon_stop(controller: &DaemonController) -> i32 {
    match controller.stop_daemon() {
        Ok(()) => {
            println!("monitord stopped");
            0
        }
        Err(e) => {
            eprintln!("failed to stop monitord: {e}");
            1
        }
    }
}

fn print_status(manager: &MonitorManager) {
    println!("{}", manager.status_json());
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let config = match ConfigStore::load(&args.config) {
        Ok(c) => c,
        Err(e) => {
            // Logging isn't set up yet for a config load failure; this is a
            // startup-time fatal error, so print and exit rather than log.
            eprintln!("monitord: configuration error: {e}");
            std::process::exit(1);
        }
    };
    init_logging(args.verbose, config.logging.level.as_deref());

    let daemon_controller = DaemonController::new(config.app.pid_file.clone());

    if args.daemon_status {
        std::process::exit(run_daemon_status(&daemon_controller, &config.app.pid_file));
    }
    if args.daemon_stop {
        std::process::exit(run_daemon_stop(&daemon_controller));
    }

    let selected = match selected_monitor_types(&args) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("monitord: {e}");
            std::process::exit(1);
        }
    };

    let environment = match CapabilityChecker::probe() {
        Ok(env) => env,
        Err(e) => {
            eprintln!("monitord: environment check failed: {e}");
            std::process::exit(1);
        }
    };
    log::info!(
        "kernel {}.{}.{} detected; compile flags {:?}",
        environment.kernel_version.0,
        environment.kernel_version.1,
        environment.kernel_version.2,
        environment.compile_flags
    );

    let factory = MonitorFactory::new(&config, environment.compile_flags);
    let monitors = match factory.build(&selected) {
        Ok(m) => m,
        Err(e) => {
            eprintln!("monitord: failed to build monitors: {e}");
            std::process::exit(1);
        }
    };

    let (mut ebpf, _ebpf_logger) = match load_ebpf() {
        Ok(pair) => pair,
        Err(e) => {
            eprintln!("monitord: failed to load eBPF object: {e}");
            std::process::exit(1);
        }
    };

    let output = OutputController::new(config.output.clone());
    let manager = MonitorManager::new(monitors, output);

    if args.daemon {
        if let Err(e) = daemon_controller.daemonize() {
            eprintln!("monitord: failed to daemonize: {e}");
            std::process::exit(1);
        }
    } else {
        let shutdown = daemon_controller.shutdown_flag();
        let _ = ctrlc::set_handler(move || {
            shutdown.store(true, Ordering::SeqCst);
        });
    }

    if let Err(e) = manager.start(&mut ebpf) {
        eprintln!("monitord: failed to start monitors: {e}");
        std::process::exit(1);
    }
    log::info!("monitord started with {} monitor(s) selected", selected.len());
    if args.status {
        print_status(&manager);
    }

    let shutdown = daemon_controller.shutdown_flag();
    while !shutdown.load(Ordering::Relaxed) {
        std::thread::sleep(Duration::from_millis(200));
    }

    log::info!("shutdown requested, draining and stopping monitors");
    manager.stop();
    daemon_controller.perform_shutdown();
    Ok(())
}
