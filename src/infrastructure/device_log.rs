//! Per-device session logs
//!
//! Every connection gets a directory `{name}_{address}` holding two
//! append-only streams: `*_info.log` for lifecycle events and `*_data.log`
//! for characteristic payloads. Writing is best-effort: failures are traced
//! and swallowed so they never interrupt the connection lifecycle.

use crate::domain::error::BleError;
use chrono::{DateTime, Local};
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

const HEADER_SEPARATOR: &str = "==============================";
const FOOTER_MARKER: &str = "=== LOG CLOSED ===";

/// Directory / append-file operations the log sink depends on
pub trait LogFilesystem: Send + Sync {
    fn create_dir_all(&self, path: &Path) -> io::Result<()>;
    fn open_append(&self, path: &Path) -> io::Result<Box<dyn Write + Send>>;
}

/// `LogFilesystem` backed by the local disk
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalFilesystem;

impl LogFilesystem for LocalFilesystem {
    fn create_dir_all(&self, path: &Path) -> io::Result<()> {
        fs::create_dir_all(path)
    }

    fn open_append(&self, path: &Path) -> io::Result<Box<dyn Write + Send>> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Box::new(file))
    }
}

/// Timestamp and line formatting for device logs
#[derive(Debug, Clone, Copy, Default)]
pub struct LogFormatter;

impl LogFormatter {
    /// `yyyy-MM-dd HH:mm:ss.SSS`
    pub fn timestamp(&self, at: DateTime<Local>) -> String {
        at.format("%Y-%m-%d %H:%M:%S%.3f").to_string()
    }

    /// `yyyyMMdd_HHmmss`, used as the log file prefix
    pub fn file_stamp(&self, at: DateTime<Local>) -> String {
        at.format("%Y%m%d_%H%M%S").to_string()
    }

    pub fn line(&self, at: DateTime<Local>, message: &str) -> String {
        format!("[{}] {}\n", self.timestamp(at), message)
    }

    pub fn header(&self, kind: StreamKind, name: &str, address: &str, at: DateTime<Local>) -> String {
        format!(
            "=== BLUETOOTH DEVICE {} LOG ===\nDevice: {}\nAddress: {}\nStarted: {}\n{}\n\n",
            kind.label(),
            name,
            address,
            self.timestamp(at),
            HEADER_SEPARATOR
        )
    }

    pub fn footer(&self, at: DateTime<Local>) -> String {
        format!("\n{}\nClosed: {}\n", FOOTER_MARKER, self.timestamp(at))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Info,
    Data,
}

impl StreamKind {
    fn label(self) -> &'static str {
        match self {
            Self::Info => "INFO",
            Self::Data => "DATA",
        }
    }

    fn file_suffix(self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Data => "data",
        }
    }
}

/// Directory name for a device: spaces become `_`, colons are stripped
pub fn device_dir_name(device_name: &str, device_id: &str) -> String {
    let safe_name: String = device_name
        .chars()
        .filter(|c| *c != ':')
        .map(|c| match c {
            ' ' | '/' | '\\' => '_',
            c => c,
        })
        .collect();
    let safe_id: String = device_id.chars().filter(|c| *c != ':').collect();
    format!("{}_{}", safe_name, safe_id)
}

struct LogStream {
    kind: StreamKind,
    path: PathBuf,
    writer: Option<Box<dyn Write + Send>>,
}

impl LogStream {
    fn open(fs: &dyn LogFilesystem, path: PathBuf, kind: StreamKind) -> io::Result<Self> {
        let writer = fs.open_append(&path)?;
        Ok(Self {
            kind,
            path,
            writer: Some(writer),
        })
    }

    fn detached(path: PathBuf, kind: StreamKind) -> Self {
        Self {
            kind,
            path,
            writer: None,
        }
    }

    /// Detaches the stream on the first failure; detached streams drop
    /// writes silently since the failure was already reported.
    fn write(&mut self, text: &str) -> io::Result<()> {
        let Some(writer) = self.writer.as_mut() else {
            return Ok(());
        };
        let result = writer.write_all(text.as_bytes());
        if result.is_err() {
            self.writer = None;
        }
        result
    }

    fn finish(&mut self, footer: &str) -> io::Result<()> {
        self.write(footer)?;
        let result = match self.writer.as_mut() {
            Some(writer) => writer.flush(),
            None => Ok(()),
        };
        self.writer = None;
        result
    }
}

/// The pair of log streams owned by one connection session
pub struct DeviceLogger {
    device_id: String,
    device_name: String,
    directory: PathBuf,
    info: LogStream,
    data: LogStream,
    formatter: LogFormatter,
    closed: bool,
}

impl DeviceLogger {
    /// Create the device directory and both streams, writing their headers.
    ///
    /// Never fails: a stream that cannot be opened or written is reported
    /// once as [`BleError::LogWriteFailed`] and detached.
    pub fn open(fs: &dyn LogFilesystem, root: &Path, device_id: &str, device_name: &str) -> Self {
        let formatter = LogFormatter;
        let now = Local::now();
        let directory = root.join(device_dir_name(device_name, device_id));
        let stamp = formatter.file_stamp(now);

        if let Err(e) = fs.create_dir_all(&directory) {
            warn!("Could not create log directory {}: {}", directory.display(), e);
        }

        let open_stream = |kind: StreamKind| {
            let path = directory.join(format!("{}_{}.log", stamp, kind.file_suffix()));
            let mut stream = LogStream::open(fs, path.clone(), kind).unwrap_or_else(|e| {
                report(device_id, kind, &e);
                LogStream::detached(path, kind)
            });
            if let Err(e) = stream.write(&formatter.header(kind, device_name, device_id, now)) {
                report(device_id, kind, &e);
            }
            stream
        };

        let info = open_stream(StreamKind::Info);
        let data = open_stream(StreamKind::Data);

        debug!("Logger initialized for {} ({})", device_name, device_id);

        Self {
            device_id: device_id.to_string(),
            device_name: device_name.to_string(),
            directory,
            info,
            data,
            formatter,
            closed: false,
        }
    }

    pub fn append_info(&mut self, message: &str) {
        self.append(StreamKind::Info, message);
    }

    pub fn append_data(&mut self, message: &str) {
        self.append(StreamKind::Data, message);
    }

    fn append(&mut self, kind: StreamKind, message: &str) {
        if self.closed {
            return;
        }
        let line = self.formatter.line(Local::now(), message);
        let stream = match kind {
            StreamKind::Info => &mut self.info,
            StreamKind::Data => &mut self.data,
        };
        match stream.write(&line) {
            Ok(()) => debug!("[{}] {}: {}", self.device_name, kind.label(), message),
            Err(e) => report(&self.device_id, kind, &e),
        }
    }

    /// Write the closing footer to both streams and release them
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;

        let footer = self.formatter.footer(Local::now());
        for stream in [&mut self.info, &mut self.data] {
            if let Err(e) = stream.finish(&footer) {
                report(&self.device_id, stream.kind, &e);
            }
        }
        debug!("Logger closed for {} ({})", self.device_name, self.device_id);
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    pub fn info_path(&self) -> &Path {
        &self.info.path
    }

    pub fn data_path(&self) -> &Path {
        &self.data.path
    }
}

fn report(device_id: &str, kind: StreamKind, e: &io::Error) {
    let err = BleError::LogWriteFailed {
        device_id: device_id.to_string(),
        stream: kind.file_suffix(),
        reason: e.to_string(),
    };
    warn!("{}", err);
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn read_lines(path: &Path) -> Vec<String> {
        fs::read_to_string(path)
            .unwrap()
            .lines()
            .map(String::from)
            .collect()
    }

    struct BrokenFilesystem;

    impl LogFilesystem for BrokenFilesystem {
        fn create_dir_all(&self, _path: &Path) -> io::Result<()> {
            Err(io::Error::new(io::ErrorKind::PermissionDenied, "read-only"))
        }

        fn open_append(&self, _path: &Path) -> io::Result<Box<dyn Write + Send>> {
            Err(io::Error::new(io::ErrorKind::PermissionDenied, "read-only"))
        }
    }

    /// Info streams fail on every write (disk full); data streams are discarded
    struct FullDisk {
        info_writes: Arc<AtomicUsize>,
    }

    struct FailingWriter(Arc<AtomicUsize>);

    impl Write for FailingWriter {
        fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Err(io::Error::new(io::ErrorKind::Other, "no space left on device"))
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl LogFilesystem for FullDisk {
        fn create_dir_all(&self, _path: &Path) -> io::Result<()> {
            Ok(())
        }

        fn open_append(&self, path: &Path) -> io::Result<Box<dyn Write + Send>> {
            if path.to_string_lossy().ends_with("_info.log") {
                Ok(Box::new(FailingWriter(self.info_writes.clone())))
            } else {
                Ok(Box::new(io::sink()))
            }
        }
    }

    #[test]
    fn test_dir_name_is_sanitized() {
        assert_eq!(
            device_dir_name("Pixel Buds", "AA:BB:CC:DD:EE:FF"),
            "Pixel_Buds_AABBCCDDEEFF"
        );
        assert_eq!(device_dir_name("a:b/c", "11:22"), "ab_c_1122");
    }

    #[test]
    fn test_formatter_layout() {
        let formatter = LogFormatter;
        let at = Local.with_ymd_and_hms(2024, 3, 9, 7, 5, 2).unwrap();

        assert_eq!(formatter.timestamp(at), "2024-03-09 07:05:02.000");
        assert_eq!(formatter.file_stamp(at), "20240309_070502");
        assert_eq!(formatter.line(at, "hello"), "[2024-03-09 07:05:02.000] hello\n");
        assert_eq!(
            formatter.footer(at),
            "\n=== LOG CLOSED ===\nClosed: 2024-03-09 07:05:02.000\n"
        );
    }

    #[test]
    fn test_open_writes_headers_to_both_streams() {
        let dir = tempfile::tempdir().unwrap();
        let logger = DeviceLogger::open(&LocalFilesystem, dir.path(), "AA:BB", "Pixel Buds");

        assert_eq!(logger.directory(), dir.path().join("Pixel_Buds_AABB"));
        let entries: Vec<_> = fs::read_dir(logger.directory()).unwrap().collect();
        assert_eq!(entries.len(), 2);

        let info = read_lines(logger.info_path());
        assert_eq!(info[0], "=== BLUETOOTH DEVICE INFO LOG ===");
        assert_eq!(info[1], "Device: Pixel Buds");
        assert_eq!(info[2], "Address: AA:BB");
        assert!(info[3].starts_with("Started: "));
        assert_eq!(info[4], HEADER_SEPARATOR);

        let data = read_lines(logger.data_path());
        assert_eq!(data[0], "=== BLUETOOTH DEVICE DATA LOG ===");
        assert!(logger.info_path().to_string_lossy().ends_with("_info.log"));
        assert!(logger.data_path().to_string_lossy().ends_with("_data.log"));
    }

    #[test]
    fn test_appends_go_to_their_own_stream() {
        let dir = tempfile::tempdir().unwrap();
        let mut logger = DeviceLogger::open(&LocalFilesystem, dir.path(), "AA:BB", "Buds");

        logger.append_info("Services discovered");
        logger.append_data("Notification from 2a19: d");

        let info = read_lines(logger.info_path());
        let data = read_lines(logger.data_path());
        let last_info = info.last().unwrap();
        assert!(last_info.starts_with('['));
        assert!(last_info.ends_with("] Services discovered"));
        // "[yyyy-MM-dd HH:mm:ss.SSS] " prefix
        assert_eq!(last_info.find(']'), Some(24));
        assert!(data.last().unwrap().ends_with("] Notification from 2a19: d"));
        assert!(!info.iter().any(|l| l.contains("Notification")));
    }

    #[test]
    fn test_close_writes_footer_and_ignores_later_appends() {
        let dir = tempfile::tempdir().unwrap();
        let mut logger = DeviceLogger::open(&LocalFilesystem, dir.path(), "AA:BB", "Buds");
        logger.append_info("before close");
        logger.close();
        assert!(logger.is_closed());

        let info_len = read_lines(logger.info_path()).len();
        let data_len = read_lines(logger.data_path()).len();

        logger.append_info("late info");
        logger.append_data("late data");
        logger.close();

        for path in [logger.info_path(), logger.data_path()] {
            let lines = read_lines(path);
            assert_eq!(lines[lines.len() - 2], FOOTER_MARKER);
            assert!(lines[lines.len() - 1].starts_with("Closed: "));
        }
        assert_eq!(read_lines(logger.info_path()).len(), info_len);
        assert_eq!(read_lines(logger.data_path()).len(), data_len);
    }

    #[test]
    fn test_write_failures_are_swallowed() {
        let root = PathBuf::from("/nonexistent");
        let mut logger = DeviceLogger::open(&BrokenFilesystem, &root, "AA:BB", "Buds");
        logger.append_info("dropped");
        logger.append_data("dropped");
        logger.close();
        assert!(logger.is_closed());
    }

    #[test]
    fn test_failing_stream_is_detached_after_first_error() {
        let info_writes = Arc::new(AtomicUsize::new(0));
        let fs = FullDisk {
            info_writes: info_writes.clone(),
        };
        let mut logger = DeviceLogger::open(&fs, Path::new("/logs"), "AA:BB", "Buds");
        for i in 0..5 {
            logger.append_info(&format!("Connection check {}", i));
            logger.append_data("Notification from 2A19: d");
        }
        logger.close();

        // Only the header write reached the failing writer
        assert_eq!(info_writes.load(Ordering::SeqCst), 1);
        assert!(logger.is_closed());
    }
}
