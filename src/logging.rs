//! Purpose: Install the process-wide tracing subscriber.
//! Exports: `init_tracing`, `log_file_name`.
//! Role: Diagnostics go to stderr or a JSON log file, never to stdout.
//! Invariants: stdout carries only conversion payload bytes.
//! Invariants: `RUST_LOG` overrides the default level in both modes.
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use gitsqlite::api::{Error, ErrorKind};
use tracing_subscriber::EnvFilter;

const STDERR_DEFAULT_LEVEL: &str = "warn";
const FILE_DEFAULT_LEVEL: &str = "debug";

/// Returns the log file path when logging to a file.
pub(crate) fn init_tracing(log_dir: Option<&Path>) -> Result<Option<PathBuf>, Error> {
    let Some(dir) = log_dir else {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(env_filter(STDERR_DEFAULT_LEVEL))
            .with_target(false)
            .with_writer(std::io::stderr)
            .try_init();
        return Ok(None);
    };

    fs::create_dir_all(dir).map_err(|err| {
        Error::new(ErrorKind::Io)
            .with_message("failed to create log directory")
            .with_path(dir)
            .with_source(err)
    })?;
    let path = dir.join(log_file_name(SystemTime::now(), std::process::id(), random_tag()));
    let file = File::create(&path).map_err(|err| {
        Error::new(ErrorKind::Io)
            .with_message("failed to create log file")
            .with_path(&path)
            .with_source(err)
    })?;
    let _ = tracing_subscriber::fmt()
        .json()
        .with_env_filter(env_filter(FILE_DEFAULT_LEVEL))
        .with_current_span(true)
        .with_writer(Mutex::new(file))
        .try_init();
    Ok(Some(path))
}

fn env_filter(default_level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level))
}

/// `gitsqlite_<UTC yyyymmddThhmmssZ>_<pid>_<tag>.log`
pub(crate) fn log_file_name(now: SystemTime, pid: u32, tag: u32) -> String {
    format!("gitsqlite_{}_{pid}_{tag:08x}.log", utc_stamp(now))
}

fn utc_stamp(now: SystemTime) -> String {
    let secs = now
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs() as i64)
        .unwrap_or(0);
    let Ok(ts) = time::OffsetDateTime::from_unix_timestamp(secs) else {
        return secs.to_string();
    };
    let Ok(format) = time::format_description::parse("[year][month][day]T[hour][minute][second]Z")
    else {
        return secs.to_string();
    };
    ts.format(&format).unwrap_or_else(|_| secs.to_string())
}

fn random_tag() -> u32 {
    let mut bytes = [0u8; 4];
    match getrandom::fill(&mut bytes) {
        Ok(()) => u32::from_le_bytes(bytes),
        Err(_) => SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.subsec_nanos())
            .unwrap_or(0),
    }
}

#[cfg(test)]
mod tests {
    use super::log_file_name;
    use std::time::{Duration, UNIX_EPOCH};

    #[test]
    fn log_file_name_is_sortable_and_unique_per_process() {
        let at = UNIX_EPOCH + Duration::from_secs(1_767_225_600);
        assert_eq!(
            log_file_name(at, 4242, 0xdead_beef),
            "gitsqlite_20260101T000000Z_4242_deadbeef.log"
        );
        assert_ne!(log_file_name(at, 4242, 1), log_file_name(at, 4243, 1));
    }
}
