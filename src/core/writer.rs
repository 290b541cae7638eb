//! Purpose: Deadline-bounded writes to the final output sink.
//! Exports: `GuardedWriter`, `DEFAULT_WRITE_TIMEOUT`, `DEFAULT_CHUNK_SIZE`.
//! Role: Turn a write that blocks forever (reader gone, pipe never drains) into an error.
//! Invariants: Every chunk, flush and shutdown is guarded by the same per-call deadline.
//! Invariants: A timeout is reported once and never retried.
//! Invariants: Closed-pipe I/O errors surface as `ErrorKind::BrokenPipe`.
use std::time::Duration;

use tokio::io::{AsyncWrite, AsyncWriteExt};

use super::error::{Error, ErrorKind};

pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(1);
pub const DEFAULT_CHUNK_SIZE: usize = 32 * 1024;

#[derive(Debug)]
pub struct GuardedWriter<W> {
    inner: W,
    timeout: Duration,
    chunk_size: usize,
    written: u64,
}

impl<W> GuardedWriter<W>
where
    W: AsyncWrite + Unpin,
{
    pub fn new(inner: W) -> Self {
        Self::with_limits(inner, DEFAULT_WRITE_TIMEOUT, DEFAULT_CHUNK_SIZE)
    }

    pub fn with_limits(inner: W, timeout: Duration, chunk_size: usize) -> Self {
        Self {
            inner,
            timeout,
            chunk_size: chunk_size.max(1),
            written: 0,
        }
    }

    pub fn bytes_written(&self) -> u64 {
        self.written
    }

    pub fn into_inner(self) -> W {
        self.inner
    }

    /// Zero-length write plus flush, to find an already-closed sink before a large transfer.
    pub async fn probe(&mut self) -> Result<(), Error> {
        let inner = &mut self.inner;
        let result = guard(self.timeout, "probe", async move {
            inner.write(&[]).await?;
            inner.flush().await
        })
        .await;
        self.checked("probe", result)
    }

    /// Write all of `buf` in chunks, each bounded by the write deadline.
    ///
    /// `bytes_written` counts every byte the sink accepted, including the part of a
    /// chunk that landed before a failure.
    pub async fn write_all(&mut self, buf: &[u8]) -> Result<usize, Error> {
        for chunk in buf.chunks(self.chunk_size) {
            let written = &mut self.written;
            let result = guard(
                self.timeout,
                "write",
                write_counted(&mut self.inner, chunk, written),
            )
            .await;
            self.checked("write", result)?;
        }
        Ok(buf.len())
    }

    pub async fn flush(&mut self) -> Result<(), Error> {
        let result = guard(self.timeout, "flush", self.inner.flush()).await;
        self.checked("flush", result)
    }

    pub async fn shutdown(&mut self) -> Result<(), Error> {
        let result = guard(self.timeout, "shutdown", self.inner.shutdown()).await;
        self.checked("shutdown", result)
    }

    fn checked<T>(&self, op: &str, result: Result<T, Error>) -> Result<T, Error> {
        if let Err(err) = &result {
            tracing::debug!(
                op,
                written = self.written,
                timeout = ?self.timeout,
                kind = ?err.kind(),
                "output write failed"
            );
        }
        result
    }
}

async fn write_counted<W>(inner: &mut W, chunk: &[u8], written: &mut u64) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut rest = chunk;
    while !rest.is_empty() {
        let n = inner.write(rest).await?;
        if n == 0 {
            return Err(std::io::ErrorKind::WriteZero.into());
        }
        *written += n as u64;
        rest = &rest[n..];
    }
    Ok(())
}

async fn guard<F, T>(timeout: Duration, op: &str, fut: F) -> Result<T, Error>
where
    F: Future<Output = std::io::Result<T>>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(err)) => Err(Error::from_write_io(err, &format!("output {op} failed"))),
        Err(_) => Err(Error::new(ErrorKind::Timeout)
            .with_message(format!(
                "output {op} did not complete within {}ms",
                timeout.as_millis()
            ))
            .with_hint("The reading side of the output stopped consuming data.")),
    }
}
