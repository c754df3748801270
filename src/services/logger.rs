use std::fs;
use std::path::{Path, PathBuf};

use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Log file name inside the logs directory.
pub const LOG_FILE_NAME: &str = "heartmula.log";

/// Target used for lines captured from the service process.
pub const SERVICE_TARGET: &str = "heartmula::service";

/// Initialize the launcher's logging.
///
/// Sets up:
/// - File output: `{logs_dir}/heartmula.log`, append-only, never rotated.
///   Every event becomes one line with timestamp, level and target.
/// - Console output (stderr): human-readable, compact.
/// - Environment filter: defaults to `info`, configurable via `RUST_LOG`.
///
/// If the log file cannot be opened the launcher keeps running with the
/// console sink only. Returns the log file path when the file sink is active.
pub fn init(log_dir: &Path) -> Option<PathBuf> {
    match try_init(log_dir) {
        Ok(path) => path,
        Err(e) => {
            eprintln!("{}", e);
            None
        }
    }
}

/// Like [`init`], but reports an already-installed global subscriber as an error.
pub fn try_init(log_dir: &Path) -> Result<Option<PathBuf>, String> {
    let file_appender = match build_file_appender(log_dir) {
        Ok(appender) => Some(appender),
        Err(e) => {
            eprintln!(
                "Warning: cannot write log file in {}: {} (console logging only)",
                log_dir.display(),
                e
            );
            None
        }
    };
    let log_file = file_appender
        .as_ref()
        .map(|_| log_dir.join(LOG_FILE_NAME));

    // A failed write on this layer is dropped by the fmt layer; it never
    // reaches the code that emitted the event.
    let file_layer = file_appender.map(|appender| {
        fmt::layer()
            .with_writer(appender)
            .with_ansi(false)
            .with_target(true)
            .with_thread_ids(false)
    });

    let console_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_ansi(true)
        .with_target(false)
        .compact();

    tracing_subscriber::registry()
        .with(default_filter())
        .with(file_layer)
        .with(console_layer)
        .try_init()
        .map_err(|e| format!("Logger already initialized: {}", e))?;

    tracing::info!(
        log_file = %log_file.as_deref().map(|p| p.display().to_string()).unwrap_or_else(|| "-".into()),
        "Logger initialized"
    );
    Ok(log_file)
}

/// `RUST_LOG` if set, otherwise `info` with HTTP client internals quieted.
pub fn default_filter() -> EnvFilter {
    EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,reqwest=warn,hyper=warn,hyper_util=warn,mio=warn"))
}

fn build_file_appender(log_dir: &Path) -> Result<RollingFileAppender, String> {
    fs::create_dir_all(log_dir).map_err(|e| e.to_string())?;
    RollingFileAppender::builder()
        .rotation(Rotation::NEVER)
        .filename_prefix(LOG_FILE_NAME)
        .build(log_dir)
        .map_err(|e| e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_appender_creates_log_file() {
        use std::io::Write;

        let td = tempfile::tempdir().expect("tempdir");
        let log_dir = td.path().join("logs");
        let mut appender = build_file_appender(&log_dir).expect("appender");
        appender.write_all(b"first\n").expect("write");
        appender.write_all(b"second\n").expect("write");
        appender.flush().expect("flush");

        let contents = fs::read_to_string(log_dir.join(LOG_FILE_NAME)).expect("read");
        assert_eq!(contents, "first\nsecond\n");
    }

    #[test]
    fn test_file_appender_appends_across_sessions() {
        use std::io::Write;

        let td = tempfile::tempdir().expect("tempdir");
        {
            let mut appender = build_file_appender(td.path()).expect("appender");
            appender.write_all(b"session one\n").expect("write");
        }
        {
            let mut appender = build_file_appender(td.path()).expect("appender");
            appender.write_all(b"session two\n").expect("write");
        }
        let contents = fs::read_to_string(td.path().join(LOG_FILE_NAME)).expect("read");
        assert_eq!(contents.lines().count(), 2);
    }

    // The only test that installs the global subscriber.
    #[test]
    fn test_init_writes_timestamped_lines_to_log_file() {
        let td = tempfile::tempdir().expect("tempdir");
        let log_file = try_init(td.path())
            .expect("global subscriber")
            .expect("file sink");
        assert_eq!(log_file, td.path().join(LOG_FILE_NAME));

        tracing::warn!(target: SERVICE_TARGET, stream = "stdout", "backend-line-for-file");

        let contents = fs::read_to_string(&log_file).expect("read");
        let line = contents
            .lines()
            .find(|l| l.contains("backend-line-for-file"))
            .expect("event written to file");
        let timestamp = line.split_whitespace().next().expect("timestamp");
        assert!(
            chrono::DateTime::parse_from_rfc3339(timestamp).is_ok(),
            "no timestamp in {:?}",
            line
        );
        assert!(line.contains("WARN"));
        assert!(line.contains(SERVICE_TARGET));
        assert!(line.contains("stream=\"stdout\""));
        // Plain text only in the file.
        assert!(!line.contains('\u{1b}'));

        assert!(try_init(td.path()).is_err());
    }

    #[test]
    fn test_file_appender_rejects_unwritable_dir() {
        let td = tempfile::tempdir().expect("tempdir");
        // A regular file where the directory should be.
        let blocker = td.path().join("logs");
        fs::write(&blocker, b"x").expect("write");
        assert!(build_file_appender(&blocker).is_err());
    }
}
