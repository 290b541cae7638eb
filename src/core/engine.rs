//! Purpose: Run the external SQLite shell for dump and restore.
//! Exports: `Engine`, `DumpStream`, `SqliteEngine`, `SqliteDump`.
//! Role: Capability seam between the pipeline and the subprocess; fakes implement it in tests.
//! Invariants: Output bytes are opaque here; only the normalizer interprets them.
//! Invariants: Non-zero exits become `ErrorKind::Engine` carrying captured stderr.
//! Invariants: Dump subprocesses die with their handle (kill-on-drop) and on `kill`.
#![allow(async_fn_in_trait)]

use std::io;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::process::{ExitStatus, Stdio};
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncReadExt, ReadBuf};
use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tokio::task::JoinHandle;

use super::error::{Error, ErrorKind};

const DUMP_DIRECTIVE: &str = ".dump";
const MAX_CAPTURED_STDERR: u64 = 64 * 1024;

/// External dump/restore engine.
pub trait Engine {
    type Dump: DumpStream;

    /// Start dumping the database at `path`; the returned stream yields raw dump text.
    async fn dump(&self, path: &Path) -> Result<Self::Dump, Error>;

    /// Create or populate the database at `path` from SQL text read from `input`.
    async fn restore<R>(&self, path: &Path, input: &mut R) -> Result<(), Error>
    where
        R: AsyncRead + Unpin + ?Sized;
}

/// Running dump: readable output plus lifecycle control of whatever produces it.
pub trait DumpStream: AsyncRead + Unpin {
    /// Wait for the producer to exit once its output has been drained.
    async fn finish(self) -> Result<(), Error>;

    /// Terminate the producer; safe to call more than once.
    async fn kill(&mut self);
}

#[derive(Clone, Debug)]
pub struct SqliteEngine {
    program: PathBuf,
}

impl SqliteEngine {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    /// Version line reported by `sqlite3 -version`.
    pub async fn version(&self) -> Result<String, Error> {
        let output = Command::new(&self.program)
            .arg("-version")
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|err| self.spawn_error(err))?;
        if !output.status.success() {
            return Err(engine_failure(output.status, &output.stderr));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    fn spawn_error(&self, err: io::Error) -> Error {
        if err.kind() == io::ErrorKind::NotFound {
            return Error::new(ErrorKind::NotFound)
                .with_message("sqlite3 executable not found")
                .with_path(&self.program)
                .with_hint("Install sqlite3 or pass --sqlite <path>.")
                .with_source(err);
        }
        Error::new(ErrorKind::Engine)
            .with_message("failed to start sqlite3")
            .with_path(&self.program)
            .with_source(err)
    }
}

impl Engine for SqliteEngine {
    type Dump = SqliteDump;

    async fn dump(&self, path: &Path) -> Result<SqliteDump, Error> {
        let mut child = Command::new(&self.program)
            .arg(path)
            .arg(DUMP_DIRECTIVE)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| self.spawn_error(err))?;
        let stdout = child.stdout.take().ok_or_else(|| {
            Error::new(ErrorKind::Internal).with_message("sqlite3 stdout was not captured")
        })?;
        let stderr = child.stderr.take().map(|stderr| tokio::spawn(capture_stderr(stderr)));
        tracing::debug!(
            program = %self.program.display(),
            db = %path.display(),
            pid = ?child.id(),
            "started dump"
        );
        Ok(SqliteDump {
            child,
            stdout,
            stderr,
            killed: false,
        })
    }

    async fn restore<R>(&self, path: &Path, input: &mut R) -> Result<(), Error>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let mut child = Command::new(&self.program)
            .arg(path)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| self.spawn_error(err))?;
        tracing::debug!(
            program = %self.program.display(),
            db = %path.display(),
            pid = ?child.id(),
            "started restore"
        );

        let mut stdin = child.stdin.take().ok_or_else(|| {
            Error::new(ErrorKind::Internal).with_message("sqlite3 stdin was not captured")
        })?;
        let stderr = child.stderr.take();

        let feed = async {
            let fed = tokio::io::copy(input, &mut stdin).await;
            // Closing stdin is what tells the shell the script is complete.
            drop(stdin);
            fed
        };
        let collect = async {
            match stderr {
                Some(stderr) => capture_stderr(stderr).await,
                None => Vec::new(),
            }
        };
        let (fed, captured) = tokio::join!(feed, collect);

        let status = child.wait().await.map_err(|err| {
            Error::new(ErrorKind::Engine)
                .with_message("failed to wait for sqlite3")
                .with_source(err)
        })?;
        if !status.success() {
            return Err(engine_failure(status, &captured));
        }
        match fed {
            Ok(bytes) => {
                tracing::debug!(bytes, "restore input consumed");
                Ok(())
            }
            Err(err) => Err(Error::new(ErrorKind::Io)
                .with_message("failed to feed sqlite3 stdin")
                .with_source(err)),
        }
    }
}

/// Subprocess-backed dump stream.
#[derive(Debug)]
pub struct SqliteDump {
    child: Child,
    stdout: ChildStdout,
    stderr: Option<JoinHandle<Vec<u8>>>,
    killed: bool,
}

impl SqliteDump {
    pub fn id(&self) -> Option<u32> {
        self.child.id()
    }

    async fn captured_stderr(&mut self) -> Vec<u8> {
        match self.stderr.take() {
            Some(handle) => handle.await.unwrap_or_default(),
            None => Vec::new(),
        }
    }
}

impl AsyncRead for SqliteDump {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stdout).poll_read(cx, buf)
    }
}

impl DumpStream for SqliteDump {
    async fn finish(mut self) -> Result<(), Error> {
        let status = self.child.wait().await.map_err(|err| {
            Error::new(ErrorKind::Engine)
                .with_message("failed to wait for sqlite3")
                .with_source(err)
        })?;
        let captured = self.captured_stderr().await;
        if !status.success() {
            return Err(engine_failure(status, &captured));
        }
        if !captured.is_empty() {
            let text = String::from_utf8_lossy(&captured);
            tracing::warn!(stderr = %text.trim(), "sqlite3 reported diagnostics");
        }
        Ok(())
    }

    async fn kill(&mut self) {
        if self.killed {
            return;
        }
        self.killed = true;
        let pid = self.child.id();
        match self.child.kill().await {
            Ok(()) => tracing::debug!(pid = ?pid, "killed dump subprocess"),
            Err(err) => tracing::debug!(pid = ?pid, error = %err, "dump subprocess already gone"),
        }
        if let Some(handle) = self.stderr.take() {
            handle.abort();
        }
    }
}

async fn capture_stderr(mut stderr: ChildStderr) -> Vec<u8> {
    let mut captured = Vec::new();
    if let Err(err) = (&mut stderr)
        .take(MAX_CAPTURED_STDERR)
        .read_to_end(&mut captured)
        .await
    {
        tracing::debug!(error = %err, "stderr capture ended early");
        return captured;
    }
    // Keep draining so a chatty engine never blocks on a full stderr pipe.
    let _ = tokio::io::copy(&mut stderr, &mut tokio::io::sink()).await;
    captured
}

fn engine_failure(status: ExitStatus, stderr: &[u8]) -> Error {
    let text = String::from_utf8_lossy(stderr).trim().to_string();
    let message = if text.is_empty() {
        format!("sqlite3 failed ({status})")
    } else {
        format!("sqlite3 failed ({status}): {text}")
    };
    Error::new(ErrorKind::Engine).with_message(message)
}

#[cfg(test)]
mod tests {
    use super::{DumpStream, Engine, SqliteEngine, engine_failure};
    use crate::core::error::ErrorKind;
    use std::path::Path;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn missing_program_maps_to_not_found() {
        let engine = SqliteEngine::new("/nonexistent/gitsqlite-test/sqlite3");
        let err = engine
            .dump(Path::new("/tmp/none.db"))
            .await
            .expect_err("missing");
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert!(err.hint().is_some());
    }

    #[cfg(unix)]
    #[test]
    fn engine_failure_embeds_stderr_or_generic_text() {
        use std::os::unix::process::ExitStatusExt;
        let status = std::process::ExitStatus::from_raw(1 << 8);
        let err = engine_failure(status, b"Error: file is not a database\n");
        assert_eq!(err.kind(), ErrorKind::Engine);
        assert!(err.message().unwrap().ends_with("Error: file is not a database"));

        let generic = engine_failure(status, b"   ");
        assert!(generic.message().unwrap().starts_with("sqlite3 failed ("));
    }

    // `echo` stands in for the engine: it prints its arguments and exits 0.
    #[cfg(unix)]
    #[tokio::test]
    async fn dump_streams_stdout_of_subprocess() {
        let engine = SqliteEngine::new("echo");
        let mut dump = engine.dump(Path::new("db.sqlite")).await.expect("spawn");
        let mut text = String::new();
        dump.read_to_string(&mut text).await.expect("read");
        dump.finish().await.expect("finish");
        assert_eq!(text, "db.sqlite .dump\n");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn dump_reports_nonzero_exit() {
        let engine = SqliteEngine::new("false");
        let mut dump = engine.dump(Path::new("db.sqlite")).await.expect("spawn");
        let mut sink = Vec::new();
        dump.read_to_end(&mut sink).await.expect("read");
        let err = dump.finish().await.expect_err("non-zero");
        assert_eq!(err.kind(), ErrorKind::Engine);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn kill_terminates_endless_producer() {
        let engine = SqliteEngine::new("yes");
        let mut dump = engine.dump(Path::new("db.sqlite")).await.expect("spawn");
        let mut buf = [0u8; 64];
        let n = dump.read(&mut buf).await.expect("read");
        assert!(n > 0);
        dump.kill().await;
        dump.kill().await;
        let err = dump.finish().await.expect_err("killed process is not a success");
        assert_eq!(err.kind(), ErrorKind::Engine);
    }
}
