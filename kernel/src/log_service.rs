//! Structured kernel log service
//!
//! Backend for the `log` facade plus a fixed-size, heap-free circular
//! buffer of structured entries. Each entry carries the tick timestamp,
//! severity, target, and a fixed-length copy of the message, so the most
//! recent kernel activity survives for post-mortem inspection even when
//! the console has scrolled. Once full the ring silently overwrites the
//! oldest entries.

use core::fmt::Write as _;

use log::{Level, LevelFilter, Log, Metadata, Record};
use spin::Mutex;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Maximum number of log entries the circular buffer can hold.
const LOG_BUFFER_CAPACITY: usize = 128;

/// Maximum length (in bytes) of a log message stored in a [`LogEntry`].
const LOG_MESSAGE_MAX_LEN: usize = 96;

/// Maximum length (in bytes) of the target tag in a [`LogEntry`].
const LOG_TARGET_MAX_LEN: usize = 24;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// A single structured log entry.
#[derive(Clone, Copy)]
pub struct LogEntry {
    /// Timer ticks since boot at the time of logging.
    pub timestamp: u64,
    /// Severity of the message.
    pub level: Level,
    target_buf: [u8; LOG_TARGET_MAX_LEN],
    target_len: u8,
    message_buf: [u8; LOG_MESSAGE_MAX_LEN],
    message_len: u8,
}

impl LogEntry {
    const fn empty() -> Self {
        Self {
            timestamp: 0,
            level: Level::Trace,
            target_buf: [0u8; LOG_TARGET_MAX_LEN],
            target_len: 0,
            message_buf: [0u8; LOG_MESSAGE_MAX_LEN],
            message_len: 0,
        }
    }

    /// The log target (module path) as a `&str`.
    pub fn target(&self) -> &str {
        let len = self.target_len as usize;
        // Truncation happens on char boundaries is not guaranteed; fall back
        // to empty on a split multi-byte sequence.
        core::str::from_utf8(&self.target_buf[..len]).unwrap_or("")
    }

    /// The message text as a `&str`.
    pub fn message(&self) -> &str {
        let len = self.message_len as usize;
        core::str::from_utf8(&self.message_buf[..len]).unwrap_or("")
    }
}

/// Fixed-size byte sink used to format a record into a [`LogEntry`].
struct FixedWriter<'a> {
    buf: &'a mut [u8],
    len: usize,
}

impl core::fmt::Write for FixedWriter<'_> {
    fn write_str(&mut self, s: &str) -> core::fmt::Result {
        let room = self.buf.len() - self.len;
        let take = s.len().min(room);
        self.buf[self.len..self.len + take].copy_from_slice(&s.as_bytes()[..take]);
        self.len += take;
        Ok(())
    }
}

struct LogRing {
    entries: [LogEntry; LOG_BUFFER_CAPACITY],
    next: usize,
    count: usize,
}

impl LogRing {
    const fn new() -> Self {
        Self {
            entries: [LogEntry::empty(); LOG_BUFFER_CAPACITY],
            next: 0,
            count: 0,
        }
    }

    fn push(&mut self, entry: LogEntry) {
        self.entries[self.next] = entry;
        self.next = (self.next + 1) % LOG_BUFFER_CAPACITY;
        self.count = (self.count + 1).min(LOG_BUFFER_CAPACITY);
    }
}

// ---------------------------------------------------------------------------
// `log` facade backend
// ---------------------------------------------------------------------------

/// Logger that records into the ring and echoes to the kernel console.
pub struct KernelLog {
    ring: Mutex<LogRing>,
}

static KERNEL_LOG: KernelLog = KernelLog {
    ring: Mutex::new(LogRing::new()),
};

impl Log for KernelLog {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }

        let mut entry = LogEntry::empty();
        entry.timestamp = crate::timer::ticks();
        entry.level = record.level();

        let target = record.target().as_bytes();
        let take = target.len().min(LOG_TARGET_MAX_LEN);
        entry.target_buf[..take].copy_from_slice(&target[..take]);
        entry.target_len = take as u8;

        let mut writer = FixedWriter {
            buf: &mut entry.message_buf,
            len: 0,
        };
        let _ = write!(writer, "{}", record.args());
        entry.message_len = writer.len as u8;

        self.ring.lock().push(entry);

        println!("[{:5}] {}: {}", record.level(), record.target(), record.args());
    }

    fn flush(&self) {}
}

/// Install the kernel logger as the `log` facade backend.
///
/// Idempotent: a second call (e.g. from several unit tests) is a no-op.
pub fn init() {
    if log::set_logger(&KERNEL_LOG).is_ok() {
        log::set_max_level(LevelFilter::Info);
    }
}

/// Number of entries currently retained in the ring.
pub fn entry_count() -> usize {
    KERNEL_LOG.ring.lock().count
}

/// Copy out the most recent entry, if any.
pub fn last_entry() -> Option<LogEntry> {
    let ring = KERNEL_LOG.ring.lock();
    if ring.count == 0 {
        return None;
    }
    let idx = (ring.next + LOG_BUFFER_CAPACITY - 1) % LOG_BUFFER_CAPACITY;
    Some(ring.entries[idx])
}
