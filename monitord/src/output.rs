//! The output controller: a multi-producer, single-consumer pipeline with
//! per-monitor bounded buffers, batched CSV serialization, optional console
//! rendering, periodic flushes, and deterministic drain on shutdown.
//!
//! Grounded on `original_source/src/utils/output_controller.py`: the
//! `events_buffer = defaultdict(lambda: deque(maxlen=buffer_size))`
//! head-drop-on-overflow FIFO, the single `_output_loop` consumer thread,
//! `_write_csv_batch`/`_write_console_batch`, and the `FileOnly` /
//! `FileAndConsole` mode switch keyed on registered-monitor count.

use std::collections::{BTreeMap, VecDeque};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use chrono::Local;

use crate::config::GlobalConfig;
use crate::error::MonitorError;
use crate::monitor::{MonitorType, Record};

pub fn format_timestamp(unix_secs: u64) -> String {
    chrono::DateTime::from_timestamp(unix_secs as i64, 0)
        .map(|dt| dt.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_default()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConsoleMode {
    FileOnly,
    FileAndConsole,
}

/// A bounded FIFO with head-drop-on-overflow, the Rust equivalent of
/// Python's `deque(maxlen=N)`.
struct BoundedFifo {
    queue: VecDeque<Record>,
    capacity: usize,
    dropped: AtomicU64,
}

impl BoundedFifo {
    fn new(capacity: usize) -> Self {
        BoundedFifo {
            queue: VecDeque::with_capacity(capacity.min(4096)),
            capacity,
            dropped: AtomicU64::new(0),
        }
    }

    fn push(&mut self, record: Record) {
        if self.queue.len() >= self.capacity {
            self.queue.pop_front();
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        self.queue.push_back(record);
    }

    fn pop_batch(&mut self, n: usize) -> Vec<Record> {
        let n = n.min(self.queue.len());
        self.queue.drain(..n).collect()
    }

    fn drain_all(&mut self) -> Vec<Record> {
        self.queue.drain(..).collect()
    }
}

struct MonitorSlot {
    header: &'static [&'static str],
    csv_row: Box<dyn Fn(&Record) -> Vec<String> + Send + Sync>,
    console_header: String,
    console_row: Box<dyn Fn(&Record) -> String + Send + Sync>,
    file: Mutex<BufWriter<File>>,
    path: PathBuf,
    fifo: Mutex<BoundedFifo>,
    header_printed: AtomicBool,
}

/// Cloneable producer-side handle a monitor's drain thread pushes records
/// through. Producers never block: `handle_data` always returns
/// immediately, dropping the oldest queued record on overflow.
#[derive(Clone)]
pub struct ProducerHandle {
    inner: Arc<OutputControllerInner>,
    ty: MonitorType,
}

impl ProducerHandle {
    pub fn handle_data(&self, record: Record) {
        self.inner.handle_data(self.ty, record);
    }
}

type RecordFilter = dyn Fn(&Record) -> bool + Send + Sync;

struct OutputControllerInner {
    global: GlobalConfig,
    slots: Mutex<BTreeMap<MonitorType, Arc<MonitorSlot>>>,
    mode: Mutex<ConsoleMode>,
    console_lock: Mutex<()>,
    shutdown: AtomicBool,
    last_flush: Mutex<Instant>,
    filter: Mutex<Option<Arc<RecordFilter>>>,
}

impl OutputControllerInner {
    fn handle_data(&self, ty: MonitorType, record: Record) {
        if let Some(filter) = self.filter.lock().unwrap().as_ref() {
            if !filter(&record) {
                return;
            }
        }
        let slots = self.slots.lock().unwrap();
        if let Some(slot) = slots.get(&ty) {
            slot.fifo.lock().unwrap().push(record);
        }
    }

    fn update_mode(&self, registered_count: usize) {
        let mut mode = self.mode.lock().unwrap();
        *mode = if registered_count <= 1 {
            ConsoleMode::FileAndConsole
        } else {
            ConsoleMode::FileOnly
        };
    }

    fn process_once(&self) -> bool {
        let mode = *self.mode.lock().unwrap();
        let slots: Vec<Arc<MonitorSlot>> = self.slots.lock().unwrap().values().cloned().collect();
        let mut did_work = false;

        for slot in &slots {
            let batch = slot.fifo.lock().unwrap().pop_batch(self.global.batch_size);
            if batch.is_empty() {
                continue;
            }
            did_work = true;
            self.write_csv_batch(slot, &batch);
            if mode == ConsoleMode::FileAndConsole {
                self.write_console_batch(slot, &batch);
            }
            if batch.len() >= self.global.large_batch_threshold {
                let _ = slot.file.lock().unwrap().flush();
            }
        }

        let mut last_flush = self.last_flush.lock().unwrap();
        if last_flush.elapsed() >= Duration::from_secs_f64(self.global.flush_interval_s) {
            self.flush_all(&slots);
            *last_flush = Instant::now();
        }

        did_work
    }

    fn write_csv_batch(&self, slot: &MonitorSlot, batch: &[Record]) {
        let mut file = slot.file.lock().unwrap();
        let delim = self.global.csv_delimiter;
        for record in batch {
            let row = (slot.csv_row)(record);
            let line = row.join(&delim.to_string());
            if writeln!(file, "{line}").is_err() {
                log::warn!("[monitord] failed to write csv row for {}", slot.path.display());
            }
        }
    }

    fn write_console_batch(&self, slot: &MonitorSlot, batch: &[Record]) {
        let _guard = self.console_lock.lock().unwrap();
        if !slot.header_printed.swap(true, Ordering::Relaxed) {
            println!("{}", slot.console_header);
        }
        for record in batch {
            println!("{}", (slot.console_row)(record));
        }
        let _ = std::io::stdout().flush();
    }

    fn flush_all(&self, slots: &[Arc<MonitorSlot>]) {
        for slot in slots {
            let _ = slot.file.lock().unwrap().flush();
        }
    }
}

pub struct OutputController {
    inner: Arc<OutputControllerInner>,
    consumer: Mutex<Option<JoinHandle<()>>>,
}

impl OutputController {
    pub fn new(global: GlobalConfig) -> Self {
        OutputController {
            inner: Arc::new(OutputControllerInner {
                global,
                slots: Mutex::new(BTreeMap::new()),
                mode: Mutex::new(ConsoleMode::FileOnly),
                console_lock: Mutex::new(()),
                shutdown: AtomicBool::new(false),
                last_flush: Mutex::new(Instant::now()),
                filter: Mutex::new(None),
            }),
            consumer: Mutex::new(None),
        }
    }

    /// Installs a process/user allow-list predicate applied to every
    /// record from every monitor before it reaches a sink's FIFO. `None`
    /// (the default) admits everything.
    pub fn set_filter(&self, filter: impl Fn(&Record) -> bool + Send + Sync + 'static) {
        *self.inner.filter.lock().unwrap() = Some(Arc::new(filter));
    }

    /// Opens `<output_dir>/<type>_<ts>.csv`, writes the header row if
    /// configured, and allocates the type's bounded FIFO.
    pub fn register(
        &self,
        ty: MonitorType,
        header: &'static [&'static str],
        csv_row: impl Fn(&Record) -> Vec<String> + Send + Sync + 'static,
        console_header: String,
        console_row: impl Fn(&Record) -> String + Send + Sync + 'static,
    ) -> Result<ProducerHandle, MonitorError> {
        std::fs::create_dir_all(&self.inner.global.output_dir).map_err(|e| MonitorError::Io {
            path: self.inner.global.output_dir.clone(),
            source: e,
        })?;

        let ts = Local::now().format("%Y%m%d_%H%M%S");
        let path = self
            .inner
            .global
            .output_dir
            .join(format!("{}_{}.csv", ty.as_str(), ts));

        let file = File::create(&path).map_err(|e| MonitorError::Io {
            path: path.clone(),
            source: e,
        })?;
        let mut writer = BufWriter::new(file);
        if self.inner.global.include_header {
            let line = header.join(&self.inner.global.csv_delimiter.to_string());
            writeln!(writer, "{line}").map_err(|e| MonitorError::Io {
                path: path.clone(),
                source: e,
            })?;
        }

        let slot = Arc::new(MonitorSlot {
            header,
            csv_row: Box::new(csv_row),
            console_header,
            console_row: Box::new(console_row),
            file: Mutex::new(writer),
            path,
            fifo: Mutex::new(BoundedFifo::new(self.inner.global.buffer_size)),
            header_printed: AtomicBool::new(false),
        });

        let mut slots = self.inner.slots.lock().unwrap();
        slots.insert(ty, slot);
        let count = slots.len();
        drop(slots);
        self.inner.update_mode(count);

        Ok(ProducerHandle {
            inner: self.inner.clone(),
            ty,
        })
    }

    pub fn unregister(&self, ty: MonitorType) {
        let mut slots = self.inner.slots.lock().unwrap();
        if let Some(slot) = slots.remove(&ty) {
            let mut fifo = slot.fifo.lock().unwrap();
            let leftover = fifo.drain_all();
            drop(fifo);
            if !leftover.is_empty() {
                self.inner.write_csv_batch(&slot, &leftover);
            }
            let _ = slot.file.lock().unwrap().flush();
        }
        let count = slots.len();
        drop(slots);
        self.inner.update_mode(count);
    }

    pub fn start(&self) {
        let inner = self.inner.clone();
        let sleep = Duration::from_secs_f64(inner.global.output_thread_sleep_s.max(0.01));
        let handle = std::thread::spawn(move || {
            while !inner.shutdown.load(Ordering::Relaxed) {
                let did_work = inner.process_once();
                if !did_work {
                    std::thread::sleep(sleep);
                }
            }
        });
        *self.consumer.lock().unwrap() = Some(handle);
    }

    /// Sets the shutdown flag, joins the consumer thread, then makes a
    /// final drain pass over every FIFO so no in-buffer records are lost,
    /// then flushes and closes every file.
    pub fn stop(&self) {
        self.inner.shutdown.store(true, Ordering::Relaxed);
        if let Some(handle) = self.consumer.lock().unwrap().take() {
            let _ = handle.join();
        }

        let slots: Vec<Arc<MonitorSlot>> = self.inner.slots.lock().unwrap().values().cloned().collect();
        for slot in &slots {
            let leftover = slot.fifo.lock().unwrap().drain_all();
            if !leftover.is_empty() {
                self.inner.write_csv_batch(slot, &leftover);
            }
        }
        self.inner.flush_all(&slots);
    }

    pub fn overflow_count(&self, ty: MonitorType) -> u64 {
        self.inner
            .slots
            .lock()
            .unwrap()
            .get(&ty)
            .map(|s| s.fifo.lock().unwrap().dropped.load(Ordering::Relaxed))
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bounded_fifo_head_drops_on_overflow() {
        let mut fifo = BoundedFifo::new(2);
        fifo.push(Record::new());
        fifo.push(Record::new());
        fifo.push(Record::new());
        assert_eq!(fifo.queue.len(), 2);
        assert_eq!(fifo.dropped.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn pop_batch_respects_queue_length() {
        let mut fifo = BoundedFifo::new(10);
        for _ in 0..3 {
            fifo.push(Record::new());
        }
        let batch = fifo.pop_batch(100);
        assert_eq!(batch.len(), 3);
        assert!(fifo.queue.is_empty());
    }

    #[test]
    fn register_creates_csv_with_header() {
        let dir = tempfile::tempdir().unwrap();
        let mut global = GlobalConfig::default();
        global.output_dir = dir.path().to_path_buf();
        global.output_thread_sleep_s = 0.01;
        let controller = OutputController::new(global);
        let handle = controller
            .register(
                MonitorType::Exec,
                &["timestamp", "time_str", "pid"],
                |r| {
                    vec![r
                        .get("pid")
                        .map(|v| v.to_string())
                        .unwrap_or_default()]
                },
                "PID".to_string(),
                |r| r.get("pid").map(|v| v.to_string()).unwrap_or_default(),
            )
            .unwrap();
        controller.start();
        handle.handle_data(Record::new());
        controller.stop();

        let entries: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(entries.len(), 1);
    }
}
