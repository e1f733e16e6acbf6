//! Daemonization and controlled shutdown (§4.8). Double-fork into the
//! background, an `flock`-backed PID file so at most one daemon instance
//! holds a given `pid_file` path, and signal-driven shutdown in normal
//! (non-signal-handler) context.
//!
//! Grounded on `original_source/src/utils/daemon_manager.py` for the
//! fork/setsid/redirect sequence and the stop-then-escalate client path,
//! and on `DataDog-libdatadog`'s `FLock` (`ddtelemetry/.../locks.rs`) for
//! the open-then-`fcntl(F_SETLK)` exclusive-lock pattern, swapped from
//! `fcntl` region locks to a whole-file `flock` since the PID file has no
//! concurrent readers to partially lock against.

use std::fs;
use std::io::{Read, Write};
use std::os::unix::io::{IntoRawFd, RawFd};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use nix::fcntl::{self, OFlag};
use nix::sys::stat::Mode;
use nix::unistd::Pid;

use crate::error::MonitorError;

enum LockState {
    Open,
    Locked,
}

/// Whole-file exclusive `flock`, released automatically on drop (either by
/// process exit or explicit `drop`). A second instance attempting
/// `try_lock` on the same path while this one holds it gets
/// `PidFileConflict`.
struct PidFileLock {
    fd: RawFd,
    path: PathBuf,
    state: LockState,
}

impl PidFileLock {
    fn open(path: &Path) -> Result<Self, MonitorError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| MonitorError::Io {
                path: parent.to_path_buf(),
                source: e,
            })?;
        }
        let fd = fcntl::open(
            path,
            OFlag::O_CREAT | OFlag::O_RDWR | OFlag::O_NOCTTY,
            Mode::S_IRUSR | Mode::S_IWUSR | Mode::S_IRGRP | Mode::S_IROTH,
        )
        .map_err(|e| MonitorError::Io {
            path: path.to_path_buf(),
            source: std::io::Error::from(e),
        })?
        .into_raw_fd();
        Ok(PidFileLock {
            fd,
            path: path.to_path_buf(),
            state: LockState::Open,
        })
    }

    fn try_lock(path: &Path) -> Result<Self, MonitorError> {
        let mut this = Self::open(path)?;
        let ret = unsafe { libc::flock(this.fd, libc::LOCK_EX | libc::LOCK_NB) };
        if ret != 0 {
            let errno = std::io::Error::last_os_error();
            if errno.raw_os_error() == Some(libc::EWOULDBLOCK) {
                return Err(MonitorError::PidFileConflict {
                    path: path.to_path_buf(),
                });
            }
            return Err(MonitorError::Io {
                path: path.to_path_buf(),
                source: errno,
            });
        }
        this.state = LockState::Locked;
        Ok(this)
    }

    /// Probes whether another process currently holds the exclusive lock
    /// on `path`, without the delete-on-drop side effect `try_lock` has.
    /// Opens the file, attempts the lock, and immediately releases it again
    /// on success — `this.state` is left at `Open` throughout, so its
    /// `Drop` only closes the fd and never removes the file.
    fn is_locked_by_other(path: &Path) -> Result<bool, MonitorError> {
        let this = Self::open(path)?;
        let ret = unsafe { libc::flock(this.fd, libc::LOCK_EX | libc::LOCK_NB) };
        if ret != 0 {
            let errno = std::io::Error::last_os_error();
            if errno.raw_os_error() == Some(libc::EWOULDBLOCK) {
                return Ok(true);
            }
            return Err(MonitorError::Io {
                path: path.to_path_buf(),
                source: errno,
            });
        }
        unsafe {
            libc::flock(this.fd, libc::LOCK_UN);
        }
        Ok(false)
    }

    fn write_pid(&mut self, pid: Pid) -> Result<(), MonitorError> {
        use std::os::unix::io::FromRawFd;
        // SAFETY: `fd` is owned by this `PidFileLock` for its lifetime; we
        // borrow it as a `File` only for this single write and immediately
        // forget it so the fd isn't closed twice.
        let mut file = unsafe { fs::File::from_raw_fd(self.fd) };
        let result = (|| -> std::io::Result<()> {
            use std::io::Seek;
            file.set_len(0)?;
            file.seek(std::io::SeekFrom::Start(0))?;
            write!(file, "{}\n", pid.as_raw())?;
            file.flush()?;
            file.sync_all()
        })();
        std::mem::forget(file);
        result.map_err(|e| MonitorError::Io {
            path: self.path.clone(),
            source: e,
        })
    }
}

impl Drop for PidFileLock {
    fn drop(&mut self) {
        if matches!(self.state, LockState::Locked) {
            let _ = fs::remove_file(&self.path);
        }
        if self.fd >= 0 {
            unsafe {
                libc::close(self.fd);
            }
        }
    }
}

fn read_pid_file(path: &Path) -> Option<Pid> {
    let mut contents = String::new();
    fs::File::open(path).ok()?.read_to_string(&mut contents).ok()?;
    contents.trim().parse::<i32>().ok().map(Pid::from_raw)
}

fn process_is_alive(pid: Pid) -> bool {
    // `kill(pid, 0)` performs no signal delivery, only existence/permission
    // checks, which is the Rust-side equivalent of the original's
    // `os.kill(pid, 0)` liveness probe.
    nix::sys::signal::kill(pid, None).is_ok()
}

pub struct DaemonController {
    pid_file: PathBuf,
    lock: Arc<std::sync::Mutex<Option<PidFileLock>>>,
    shutdown: Arc<AtomicBool>,
}

impl DaemonController {
    pub fn new(pid_file: PathBuf) -> Self {
        DaemonController {
            pid_file,
            lock: Arc::new(std::sync::Mutex::new(None)),
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn shutdown_flag(&self) -> Arc<AtomicBool> {
        self.shutdown.clone()
    }

    /// Strictly read-only: reports whether a daemon currently holds the
    /// lock on `pid_file`, with no side effects. Deliberately diverges from
    /// the original Python's `is_running`, which deleted a stale PID file
    /// as a side effect of checking it — a read should never mutate state
    /// a concurrent `stop`/`daemonize` is relying on.
    pub fn is_running(&self) -> bool {
        match read_pid_file(&self.pid_file) {
            Some(pid) => {
                process_is_alive(pid)
                    && PidFileLock::is_locked_by_other(&self.pid_file).unwrap_or(false)
            }
            None => false,
        }
    }

    /// Removes `pid_file` if it names a process that is no longer alive.
    /// The only code path permitted to delete a PID file outside of normal
    /// shutdown.
    pub fn cleanup_stale_pid_file(&self) -> Result<(), MonitorError> {
        if let Some(pid) = read_pid_file(&self.pid_file) {
            if !process_is_alive(pid) {
                fs::remove_file(&self.pid_file).map_err(|e| MonitorError::Io {
                    path: self.pid_file.clone(),
                    source: e,
                })?;
            }
        }
        Ok(())
    }

    /// Double-fork into the background: first fork detaches from the
    /// shell's process group, `setsid` starts a new session, second fork
    /// prevents ever reacquiring a controlling terminal. The PID file is
    /// locked and written by the final (grandchild) process only, after it
    /// has its real, stable PID.
    pub fn daemonize(&self) -> Result<(), MonitorError> {
        self.cleanup_stale_pid_file()?;

        // SAFETY: `fork` is async-signal-safe here because nothing between
        // it and `_exit`/`execve`-equivalent paths allocates or takes a
        // lock that could deadlock in the child.
        match unsafe { nix::unistd::fork() } {
            Ok(nix::unistd::ForkResult::Parent { .. }) => std::process::exit(0),
            Ok(nix::unistd::ForkResult::Child) => {}
            Err(e) => {
                return Err(MonitorError::Environment {
                    check: "fork".to_string(),
                    reason: e.to_string(),
                })
            }
        }

        nix::unistd::setsid().map_err(|e| MonitorError::Environment {
            check: "setsid".to_string(),
            reason: e.to_string(),
        })?;

        match unsafe { nix::unistd::fork() } {
            Ok(nix::unistd::ForkResult::Parent { .. }) => std::process::exit(0),
            Ok(nix::unistd::ForkResult::Child) => {}
            Err(e) => {
                return Err(MonitorError::Environment {
                    check: "fork".to_string(),
                    reason: e.to_string(),
                })
            }
        }

        unsafe {
            libc::umask(0o022);
        }
        redirect_standard_fds()?;

        let mut lock = PidFileLock::try_lock(&self.pid_file)?;
        lock.write_pid(Pid::this())?;
        *self.lock.lock().unwrap() = Some(lock);

        self.install_signal_handlers();
        Ok(())
    }

    fn install_signal_handlers(&self) {
        let shutdown = self.shutdown.clone();
        let _ = ctrlc::set_handler(move || {
            shutdown.store(true, Ordering::SeqCst);
        });
        unsafe {
            libc::signal(libc::SIGHUP, libc::SIG_IGN);
            libc::signal(libc::SIGPIPE, libc::SIG_IGN);
        }
    }

    /// Runs in normal context (not a signal handler): releases the PID
    /// file lock, which also removes it.
    pub fn perform_shutdown(&self) {
        *self.lock.lock().unwrap() = None;
    }

    /// Client-side stop: reads the PID file, sends `SIGTERM`, polls for
    /// exit, escalates to `SIGKILL` after a 10s grace period.
    pub fn stop_daemon(&self) -> Result<(), MonitorError> {
        let pid = read_pid_file(&self.pid_file).ok_or_else(|| MonitorError::Environment {
            check: "pid_file".to_string(),
            reason: format!("{} does not exist or is not a valid pid", self.pid_file.display()),
        })?;
        if !process_is_alive(pid) {
            self.cleanup_stale_pid_file()?;
            return Ok(());
        }

        nix::sys::signal::kill(pid, nix::sys::signal::Signal::SIGTERM).map_err(|e| {
            MonitorError::Environment {
                check: "sigterm".to_string(),
                reason: e.to_string(),
            }
        })?;

        let deadline = Instant::now() + Duration::from_secs(10);
        while Instant::now() < deadline {
            if !process_is_alive(pid) {
                return Ok(());
            }
            std::thread::sleep(Duration::from_millis(200));
        }

        nix::sys::signal::kill(pid, nix::sys::signal::Signal::SIGKILL).map_err(|e| {
            MonitorError::Environment {
                check: "sigkill".to_string(),
                reason: e.to_string(),
            }
        })?;
        Ok(())
    }
}

fn redirect_standard_fds() -> Result<(), MonitorError> {
    use std::os::unix::io::AsRawFd;
    let dev_null = fs::OpenOptions::new()
        .read(true)
        .write(true)
        .open("/dev/null")
        .map_err(|e| MonitorError::Io {
            path: PathBuf::from("/dev/null"),
            source: e,
        })?;
    let fd = dev_null.as_raw_fd();
    unsafe {
        libc::dup2(fd, libc::STDIN_FILENO);
        libc::dup2(fd, libc::STDOUT_FILENO);
        libc::dup2(fd, libc::STDERR_FILENO);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pid_file_lock_is_exclusive() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("monitor.pid");
        let _first = PidFileLock::try_lock(&path).unwrap();
        let second = PidFileLock::try_lock(&path);
        assert!(second.is_err());
    }

    #[test]
    fn lock_is_released_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("monitor.pid");
        {
            let _first = PidFileLock::try_lock(&path).unwrap();
        }
        let second = PidFileLock::try_lock(&path);
        assert!(second.is_ok());
    }

    #[test]
    fn is_running_is_false_with_no_pid_file() {
        let dir = tempfile::tempdir().unwrap();
        let controller = DaemonController::new(dir.path().join("monitor.pid"));
        assert!(!controller.is_running());
    }

    #[test]
    fn is_running_probe_does_not_delete_pid_file() {
        // A pid file naming a live pid (our own) but with no lock held on
        // it, as if a prior daemon instance crashed without cleaning up.
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("monitor.pid");
        fs::write(&path, format!("{}\n", Pid::this().as_raw())).unwrap();

        let controller = DaemonController::new(path.clone());
        assert!(!controller.is_running());
        assert!(path.exists(), "is_running must not delete the pid file it just probed");
    }

    #[test]
    fn write_pid_appends_newline_and_syncs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("monitor.pid");
        let mut lock = PidFileLock::try_lock(&path).unwrap();
        lock.write_pid(Pid::from_raw(4242)).unwrap();
        let contents = fs::read_to_string(&path).unwrap();
        assert_eq!(contents, "4242\n");
    }
}
