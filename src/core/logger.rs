use std::sync::RwLock;
use std::time::{Duration, Instant};

use crossbeam::channel::{Receiver, RecvTimeoutError, Sender};
use crossbeam::queue::ArrayQueue;
use log::{Level, LevelFilter, Log, Metadata, Record, SetLoggerError};
use once_cell::sync::{Lazy, OnceCell};

/// Trigger an asynchronous flush when this many lines are queued.
const ASYNC_FLUSH_QD_LINES_THRESHOLD: usize = 10_000;

/// Performs a *synchronous* flush when this many lines are queued, so that a
/// thread logging faster than the logger thread can write blocks instead of
/// growing the queue without bound.
const SYNC_FLUSH_QD_LINES_THRESHOLD: usize = 10 * ASYNC_FLUSH_QD_LINES_THRESHOLD;

/// Logging thread flushes at least this often.
const MIN_FLUSH_FREQUENCY: Duration = Duration::from_secs(5);

static SYSTRAP_LOGGER: Lazy<SystrapLogger> = Lazy::new(SystrapLogger::new);

/// Reference point for the wall-clock column.
static START: Lazy<Instant> = Lazy::new(Instant::now);

/// Install the systrap logger as the `log` backend.
///
/// Fails if any logger (including this one) was already installed.
pub fn init(max_log_level: LevelFilter) -> Result<(), SetLoggerError> {
    Lazy::force(&START);
    log::set_logger(&*SYSTRAP_LOGGER)?;
    SYSTRAP_LOGGER.set_max_level(max_log_level);
    log::set_max_level(max_log_level);

    // Start the thread that will receive log records and flush them to output.
    std::thread::Builder::new()
        .name("systrap-logger".to_string())
        .spawn(move || SYSTRAP_LOGGER.logger_thread_fn())
        .unwrap();

    // Arrange to flush the logger on panic. The flush happens on the
    // panicking thread since the logger thread may be the one in trouble.
    let default_panic_handler = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        SYSTRAP_LOGGER.flush_records(None).ok();
        default_panic_handler(panic_info);
    }));

    Ok(())
}

/// Synchronously write out everything queued so far. Used before aborting.
pub fn flush() {
    if SYSTRAP_LOGGER.max_log_level.get().is_some() {
        // Don't wait on the logger thread; it may be the thread that's aborting.
        SYSTRAP_LOGGER.flush_records(None).ok();
    }
}

/// Logger for the supervisor.
///
/// Records are queued on a lock-free queue by the logging threads (guest
/// dispatch threads, control-plane workers) and written to stderr by a
/// dedicated thread, keeping formatting I/O off the switch path.
pub struct SystrapLogger {
    // crossbeam's Sender is Sync, so it can be shared directly.
    command_sender: Sender<LoggerCommand>,
    command_receiver: Receiver<LoggerCommand>,

    // Commands and records are kept apart since the channel can't cheaply
    // report its length, and the queue doesn't support blocking.
    records: ArrayQueue<SystrapLogRecord>,

    // When false, a (still-asynchronous) flush is requested for every record.
    buffering_enabled: RwLock<bool>,

    max_log_level: OnceCell<LevelFilter>,
}

thread_local!(static THREAD_NAME: String = get_thread_name());
thread_local!(static THREAD_ID: nix::unistd::Pid = nix::unistd::gettid());

fn get_thread_name() -> String {
    std::thread::current()
        .name()
        .map(str::to_owned)
        .unwrap_or_default()
}

impl SystrapLogger {
    fn new() -> SystrapLogger {
        let (command_sender, command_receiver) = crossbeam::channel::unbounded();

        SystrapLogger {
            records: ArrayQueue::new(SYNC_FLUSH_QD_LINES_THRESHOLD),
            command_sender,
            command_receiver,
            buffering_enabled: RwLock::new(true),
            max_log_level: OnceCell::new(),
        }
    }

    fn logger_thread_fn(&self) {
        loop {
            match self.command_receiver.recv_timeout(MIN_FLUSH_FREQUENCY) {
                Ok(LoggerCommand::Flush(done_sender)) => self.flush_records(done_sender).unwrap(),
                Err(RecvTimeoutError::Timeout) => self.flush_records(None).unwrap(),
                Err(e) => panic!("Unexpected error {}", e),
            }
        }
    }

    // Writes out the records queued at the time of the call. If `done_sender`
    // is provided, it's notified after the flush has completed.
    fn flush_records(&self, done_sender: Option<Sender<()>>) -> std::io::Result<()> {
        use std::io::Write;

        // Records that arrive while flushing wait for the next flush, so a
        // synchronous caller isn't held up by other threads' logging.
        let mut toflush = self.records.len();

        let stderr_unlocked = std::io::stderr();
        let stderr_locked = stderr_unlocked.lock();
        let mut stderr = std::io::BufWriter::new(stderr_locked);

        while toflush > 0 {
            // Another thread can drain the queue concurrently when it panics.
            let Some(record) = self.records.pop() else {
                break;
            };
            toflush -= 1;
            write!(stderr, "{record}")?;
        }
        stderr.flush()?;

        if let Some(done_sender) = done_sender {
            // Logging from here could deadlock.
            done_sender.send(()).unwrap_or_else(|e| {
                eprintln!("WARNING: Logger couldn't notify calling thread: {:?}", e)
            });
        }
        Ok(())
    }

    /// When disabled, the logger thread is notified to write each record as
    /// soon as it's created. The calling thread still isn't blocked on the
    /// record actually being written.
    pub fn set_buffering_enabled(&self, buffering_enabled: bool) {
        *self.buffering_enabled.write().unwrap() = buffering_enabled;
    }

    /// If the maximum log level has not yet been set, returns `LevelFilter::Trace`.
    pub fn max_level(&self) -> LevelFilter {
        self.max_log_level
            .get()
            .copied()
            .unwrap_or(LevelFilter::Trace)
    }

    /// Only intended to be called from `init()`. Panics if called more than once.
    fn set_max_level(&self, level: LevelFilter) {
        self.max_log_level.set(level).unwrap()
    }

    fn flush_sync(&self) {
        let (done_sender, done_receiver) = crossbeam::channel::bounded(1);
        self.send_command(LoggerCommand::Flush(Some(done_sender)));
        done_receiver.recv().unwrap();
    }

    fn flush_async(&self) {
        self.send_command(LoggerCommand::Flush(None));
    }

    fn send_command(&self, cmd: LoggerCommand) {
        self.command_sender.send(cmd).unwrap_or_else(|e| {
            eprintln!("WARNING: Couldn't send command to logger thread: {:?}", e);
        });
    }
}

impl Log for SystrapLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }

        let mut systraprecord = SystrapLogRecord {
            level: record.level(),
            file: record.file_static(),
            module_path: record.module_path_static(),
            line: record.line(),
            message: std::fmt::format(*record.args()),
            wall_time: START.elapsed(),
            thread_name: THREAD_NAME
                .try_with(|name| (*name).clone())
                .unwrap_or_else(|_| get_thread_name()),
            thread_id: THREAD_ID
                .try_with(|id| *id)
                .unwrap_or_else(|_| nix::unistd::gettid()),
        };

        loop {
            match self.records.push(systraprecord) {
                Ok(()) => break,
                Err(r) => {
                    // Queue is full. Flush it and try again.
                    systraprecord = r;
                    self.flush_sync();
                }
            }
        }

        if record.level() == Level::Error {
            // Likely about to abort; flush *synchronously*.
            self.flush_sync();
        } else if self.records.len() > ASYNC_FLUSH_QD_LINES_THRESHOLD
            || !*self.buffering_enabled.read().unwrap()
        {
            self.flush_async();
        }
    }

    fn flush(&self) {
        self.flush_sync();
    }
}

struct SystrapLogRecord {
    level: Level,
    file: Option<&'static str>,
    module_path: Option<&'static str>,
    line: Option<u32>,
    message: String,
    wall_time: Duration,
    thread_name: String,
    thread_id: nix::unistd::Pid,
}

impl std::fmt::Display for SystrapLogRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let secs = self.wall_time.as_secs();
        write!(
            f,
            "{:02}:{:02}:{:02}.{:06}",
            secs / 3600,
            (secs / 60) % 60,
            secs % 60,
            self.wall_time.subsec_micros()
        )?;
        write!(f, " [{}:{}]", self.thread_id, self.thread_name)?;
        write!(f, " [{level}]", level = self.level)?;
        let file = self
            .file
            .map(|f| f.rsplit_once('/').map_or(f, |(_, name)| name))
            .unwrap_or("n/a");
        write!(f, " [{file}:")?;
        if let Some(line) = self.line {
            write!(f, "{line}")?;
        } else {
            write!(f, "n/a")?;
        }
        writeln!(
            f,
            "] [{module}] {msg}",
            module = self.module_path.unwrap_or("n/a"),
            msg = self.message
        )
    }
}

enum LoggerCommand {
    // Flush; takes an optional one-shot channel to notify that the flush has completed.
    Flush(Option<Sender<()>>),
}

pub fn set_buffering_enabled(buffering_enabled: bool) {
    SYSTRAP_LOGGER.set_buffering_enabled(buffering_enabled);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_format() {
        let record = SystrapLogRecord {
            level: Level::Warn,
            file: Some("src/subprocess/thread.rs"),
            module_path: Some("systrap::subprocess::thread"),
            line: Some(42),
            message: "stub exited".to_string(),
            wall_time: Duration::from_micros(3_723_000_005),
            thread_name: "systrap-ctl-0".to_string(),
            thread_id: nix::unistd::Pid::from_raw(77),
        };
        assert_eq!(
            record.to_string(),
            "01:02:03.000005 [77:systrap-ctl-0] [WARN] [thread.rs:42] \
             [systrap::subprocess::thread] stub exited\n"
        );
    }

    #[test]
    fn record_format_without_location() {
        let record = SystrapLogRecord {
            level: Level::Info,
            file: None,
            module_path: None,
            line: None,
            message: "x".to_string(),
            wall_time: Duration::ZERO,
            thread_name: String::new(),
            thread_id: nix::unistd::Pid::from_raw(1),
        };
        assert_eq!(
            record.to_string(),
            "00:00:00.000000 [1:] [INFO] [n/a:n/a] [n/a] x\n"
        );
    }
}
