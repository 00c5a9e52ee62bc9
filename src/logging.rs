//! Logging setup and the log helpers used by the proxy core
//!
//! Events go to the console (filtered by `RUST_LOG`), WARN and above also go
//! to the error log file, and events with target [`ACCESS_TARGET`] go to the
//! access log file. The files are opened once the configuration is known and
//! can be reopened when a reload moves them.

use chrono::{DateTime, Utc};
use hyper::{Method, StatusCode, Uri, Version};
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info, Level};
use tracing_subscriber::filter::{LevelFilter, Targets};
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Tracing target of access log lines
pub const ACCESS_TARGET: &str = "access";

/// Log an informational message under `tag`
pub fn log_info(tag: &str, message: &str) {
    info!(tag = tag, "{}", message);
}

/// Log an error message under `tag`
pub fn log_error(tag: &str, message: &str) {
    error!(tag = tag, "{}", message);
}

/// Request details for one access log line
pub struct AccessEntry<'a> {
    pub client: SocketAddr,
    pub method: &'a Method,
    pub uri: &'a Uri,
    pub version: Version,
    pub referer: Option<&'a str>,
    pub user_agent: Option<&'a str>,
    pub status: StatusCode,
    pub time: DateTime<Utc>,
}

impl AccessEntry<'_> {
    /// Apache combined log format, without the response size
    pub fn format(&self) -> String {
        format!(
            "{} - - [{}] \"{} {} {:?}\" {} - \"{}\" \"{}\"",
            self.client.ip(),
            self.time.format("%d/%b/%Y:%H:%M:%S %z"),
            self.method,
            self.uri,
            self.version,
            self.status.as_u16(),
            self.referer.unwrap_or("-"),
            self.user_agent.unwrap_or("-"),
        )
    }
}

/// Write one access log line
pub fn access(entry: &AccessEntry<'_>) {
    info!(target: ACCESS_TARGET, "{}", entry.format());
}

/// A log file that can be opened after the subscriber is installed and
/// reopened at a new path later. Writes are dropped while it is closed.
#[derive(Clone, Default)]
pub struct LogFile {
    file: Arc<Mutex<Option<(PathBuf, File)>>>,
}

impl LogFile {
    /// Open `path` for appending, replacing any previously opened file
    pub fn open(&self, path: &Path) -> io::Result<()> {
        let mut slot = self.file.lock();
        if matches!(slot.as_ref(), Some((current, _)) if current == path) {
            return Ok(());
        }

        let mut options = OpenOptions::new();
        options.create(true).append(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o640);
        }

        let file = options.open(path)?;
        *slot = Some((path.to_path_buf(), file));
        Ok(())
    }

    pub fn path(&self) -> Option<PathBuf> {
        self.file.lock().as_ref().map(|(path, _)| path.clone())
    }
}

impl Write for LogFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self.file.lock().as_mut() {
            Some((_, file)) => file.write(buf),
            None => Ok(buf.len()),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.file.lock().as_mut() {
            Some((_, file)) => file.flush(),
            None => Ok(()),
        }
    }
}

impl<'a> MakeWriter<'a> for LogFile {
    type Writer = LogFile;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

/// Handles to the access and error log files
#[derive(Clone, Default)]
pub struct LogFiles {
    pub access: LogFile,
    pub error: LogFile,
}

impl LogFiles {
    /// Point the log files at the configured paths. Failures are logged and
    /// leave the previous file in place.
    pub fn apply(&self, access_log: &Path, error_log: &Path) {
        if let Err(e) = self.access.open(access_log) {
            log_error("logging", &format!("cannot open access log '{}': {}", access_log.display(), e));
        }
        if let Err(e) = self.error.open(error_log) {
            log_error("logging", &format!("cannot open error log '{}': {}", error_log.display(), e));
        }
    }
}

/// Install the global subscriber and return the (still closed) log files
pub fn init() -> anyhow::Result<LogFiles> {
    let files = LogFiles::default();

    let console_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("hostproxy=info,access=info"));
    let console = tracing_subscriber::fmt::layer().with_filter(console_filter);

    let access = tracing_subscriber::fmt::layer()
        .with_writer(files.access.clone())
        .with_ansi(false)
        .without_time()
        .with_level(false)
        .with_target(false)
        .with_filter(Targets::new().with_target(ACCESS_TARGET, Level::INFO));

    let errors = tracing_subscriber::fmt::layer()
        .with_writer(files.error.clone())
        .with_ansi(false)
        .with_filter(LevelFilter::WARN);

    tracing_subscriber::registry()
        .with(console)
        .with(access)
        .with(errors)
        .try_init()?;

    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_access_entry_format() {
        let uri: Uri = "/index.html?a=1".parse().unwrap();

        let entry = AccessEntry {
            client: "203.0.113.9:41000".parse().unwrap(),
            method: &Method::GET,
            uri: &uri,
            version: Version::HTTP_11,
            referer: None,
            user_agent: Some("curl/8.0"),
            status: StatusCode::OK,
            time: Utc.with_ymd_and_hms(2024, 3, 5, 14, 7, 9).unwrap(),
        };

        assert_eq!(
            entry.format(),
            "203.0.113.9 - - [05/Mar/2024:14:07:09 +0000] \"GET /index.html?a=1 HTTP/1.1\" 200 - \"-\" \"curl/8.0\""
        );
    }

    #[test]
    fn test_closed_log_file_drops_writes() {
        let mut file = LogFile::default();
        assert_eq!(file.write(b"dropped").unwrap(), 7);
        assert!(file.path().is_none());
    }

    #[test]
    fn test_log_file_open_and_reopen() {
        let dir = tempfile::TempDir::new().unwrap();
        let first = dir.path().join("first.log");
        let second = dir.path().join("second.log");

        let mut file = LogFile::default();
        file.open(&first).unwrap();
        file.write_all(b"one\n").unwrap();
        file.open(&second).unwrap();
        file.write_all(b"two\n").unwrap();
        file.flush().unwrap();

        assert_eq!(std::fs::read_to_string(&first).unwrap(), "one\n");
        assert_eq!(std::fs::read_to_string(&second).unwrap(), "two\n");
        assert_eq!(file.path(), Some(second));
    }

    #[test]
    fn test_log_files_apply_keeps_previous_on_failure() {
        let dir = tempfile::TempDir::new().unwrap();
        let access = dir.path().join("access.log");
        let error = dir.path().join("error.log");

        let files = LogFiles::default();
        files.apply(&access, &error);
        files.apply(&dir.path().join("missing/access.log"), &error);

        assert_eq!(files.access.path(), Some(access));
        assert_eq!(files.error.path(), Some(error));
    }
}
