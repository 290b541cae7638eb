//! Purpose: Stream engine dump output through the normalizer to a guarded sink.
//! Exports: `PipeCoordinator`, `PipelineConfig`, `PipelineState`, `PipelineEvent`, `ConversionStats`.
//! Role: Concurrency core; one producer and one consumer joined by an in-process pipe.
//! Invariants: Output order equals engine order minus dropped lines; nothing is reordered.
//! Invariants: The first terminal event (failure, deadline, interrupt) decides the outcome.
//! Invariants: On any failure the producer is cancelled and its subprocess killed before returning.
use std::path::Path;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWrite, BufReader, DuplexStream};

use super::cancel::{CancelReason, CancelSignal};
use super::engine::{DumpStream, Engine};
use super::error::{Error, ErrorKind, is_closed_pipe};
use super::normalize::{NormalizeStats, Normalizer};
use super::writer::{DEFAULT_CHUNK_SIZE, DEFAULT_WRITE_TIMEOUT, GuardedWriter};

pub const DEFAULT_PIPELINE_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_PIPE_CAPACITY: usize = 64 * 1024;
pub const DEFAULT_CANCEL_GRACE: Duration = Duration::from_secs(2);

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct PipelineConfig {
    pub write_timeout: Duration,
    pub chunk_size: usize,
    /// Master deadline for the whole pipeline; zero disables it.
    pub pipeline_timeout: Duration,
    pub pipe_capacity: usize,
    /// How long a cancelled producer gets to kill and reap its subprocess.
    pub cancel_grace: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            write_timeout: DEFAULT_WRITE_TIMEOUT,
            chunk_size: DEFAULT_CHUNK_SIZE,
            pipeline_timeout: DEFAULT_PIPELINE_TIMEOUT,
            pipe_capacity: DEFAULT_PIPE_CAPACITY,
            cancel_grace: DEFAULT_CANCEL_GRACE,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct ConversionStats {
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub lines_in: u64,
    pub lines_out: u64,
    pub lines_dropped: u64,
}

impl ConversionStats {
    fn from_parts(bytes_in: u64, bytes_out: u64, lines: NormalizeStats) -> Self {
        Self {
            bytes_in,
            bytes_out,
            lines_in: lines.lines_in,
            lines_out: lines.lines_out,
            lines_dropped: lines.lines_dropped(),
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PipelineState {
    Running,
    ProducerDone,
    ConsumerDone,
    ProducerFailed,
    ConsumerFailed,
    TimedOut,
    Interrupted,
    Done,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PipelineEvent {
    ProducerFinished,
    ConsumerFinished,
    ProducerFailed,
    ConsumerFailed,
    DeadlineElapsed,
    Interrupted,
}

impl PipelineState {
    pub fn is_terminal(self) -> bool {
        !matches!(
            self,
            PipelineState::Running | PipelineState::ProducerDone | PipelineState::ConsumerDone
        )
    }

    /// Next state; terminal states ignore every later event.
    pub fn advance(self, event: PipelineEvent) -> Self {
        use PipelineEvent as E;
        use PipelineState as S;
        if self.is_terminal() {
            return self;
        }
        match (self, event) {
            (_, E::ProducerFailed) => S::ProducerFailed,
            (_, E::ConsumerFailed) => S::ConsumerFailed,
            (_, E::DeadlineElapsed) => S::TimedOut,
            (_, E::Interrupted) => S::Interrupted,
            (S::Running, E::ProducerFinished) => S::ProducerDone,
            (S::Running, E::ConsumerFinished) => S::ConsumerDone,
            (S::ConsumerDone, E::ProducerFinished) | (S::ProducerDone, E::ConsumerFinished) => {
                S::Done
            }
            (state, _) => state,
        }
    }

    fn cancel_reason(self) -> Option<CancelReason> {
        match self {
            PipelineState::ProducerFailed => Some(CancelReason::ProducerFailed),
            PipelineState::ConsumerFailed => Some(CancelReason::BrokenDownstream),
            PipelineState::TimedOut => Some(CancelReason::Timeout),
            PipelineState::Interrupted => Some(CancelReason::Interrupted),
            _ => None,
        }
    }
}

pub struct PipeCoordinator<'a, E> {
    engine: &'a E,
    config: PipelineConfig,
    cancel: CancelSignal,
}

impl<'a, E> PipeCoordinator<'a, E>
where
    E: Engine,
{
    pub fn new(engine: &'a E, config: PipelineConfig) -> Self {
        Self {
            engine,
            config,
            cancel: CancelSignal::new(),
        }
    }

    pub fn with_cancel(mut self, cancel: CancelSignal) -> Self {
        self.cancel = cancel;
        self
    }

    /// Dump `db_path`, normalize every line, and write the result to `output`.
    #[tracing::instrument(name = "pipeline", skip_all, fields(db = %db_path.display()))]
    pub async fn run<W>(
        &self,
        db_path: &Path,
        normalizer: Normalizer,
        output: &mut GuardedWriter<W>,
    ) -> Result<ConversionStats, Error>
    where
        W: AsyncWrite + Unpin,
    {
        if let Some(reason) = self.cancel.reason() {
            return Err(cancelled_error(reason));
        }
        let bytes_before = output.bytes_written();
        let dump = self.engine.dump(db_path).await?;
        let (tx, rx) = tokio::io::duplex(self.config.pipe_capacity.max(1));

        let (outcome, bytes_in, lines) = {
            let producer = produce(dump, tx, &self.cancel);
            let consumer = consume(rx, normalizer, output, self.config.chunk_size);
            let deadline = master_deadline(self.config.pipeline_timeout);
            tokio::pin!(producer, consumer, deadline);

            let mut state = PipelineState::Running;
            let mut producer_live = true;
            let mut produced: Option<u64> = None;
            let mut consumed: Option<NormalizeStats> = None;
            let mut failure: Option<Error> = None;

            while !state.is_terminal() {
                let (event, error) = tokio::select! {
                    result = &mut producer, if producer_live => match result {
                        Ok(bytes) => {
                            producer_live = false;
                            produced = Some(bytes);
                            (PipelineEvent::ProducerFinished, None)
                        }
                        Err(err) => {
                            producer_live = false;
                            (PipelineEvent::ProducerFailed, Some(err))
                        }
                    },
                    result = &mut consumer, if consumed.is_none() => match result {
                        Ok(stats) => {
                            consumed = Some(stats);
                            (PipelineEvent::ConsumerFinished, None)
                        }
                        Err(err) => (PipelineEvent::ConsumerFailed, Some(err)),
                    },
                    _ = &mut deadline => (
                        PipelineEvent::DeadlineElapsed,
                        Some(pipeline_timeout_error(self.config.pipeline_timeout)),
                    ),
                    reason = self.cancel.cancelled() => (
                        PipelineEvent::Interrupted,
                        Some(cancelled_error(reason)),
                    ),
                };
                let next = state.advance(event);
                tracing::debug!(from = ?state, to = ?next, "pipeline transition");
                state = next;
                if let Some(reason) = state.cancel_reason() {
                    self.cancel.cancel(reason);
                }
                if failure.is_none() {
                    failure = error;
                }
            }

            if producer_live {
                // Let the producer observe the signal and kill its subprocess.
                if tokio::time::timeout(self.config.cancel_grace, &mut producer)
                    .await
                    .is_err()
                {
                    tracing::warn!("producer did not stop within grace period; dropping it");
                }
            }

            let outcome = match failure {
                Some(err) => Err(err),
                None if state == PipelineState::Done => Ok(()),
                None => Err(Error::new(ErrorKind::Internal)
                    .with_message(format!("pipeline ended in state {state:?}"))),
            };
            (outcome, produced.unwrap_or(0), consumed.unwrap_or_default())
        };

        match outcome {
            Ok(()) => {
                let stats = ConversionStats::from_parts(
                    bytes_in,
                    output.bytes_written() - bytes_before,
                    lines,
                );
                tracing::info!(
                    bytes_in = stats.bytes_in,
                    bytes_out = stats.bytes_out,
                    lines_in = stats.lines_in,
                    lines_out = stats.lines_out,
                    lines_dropped = stats.lines_dropped,
                    "pipeline finished"
                );
                Ok(stats)
            }
            Err(err) => {
                tracing::info!(kind = ?err.kind(), error = %err, "pipeline failed");
                Err(err)
            }
        }
    }
}

async fn produce<D>(mut dump: D, mut tx: DuplexStream, cancel: &CancelSignal) -> Result<u64, Error>
where
    D: DumpStream,
{
    let copied = tokio::select! {
        copied = tokio::io::copy(&mut dump, &mut tx) => Some(copied),
        _ = cancel.cancelled() => None,
    };
    // Dropping our end is the consumer's EOF.
    drop(tx);

    match copied {
        Some(Ok(bytes)) => {
            dump.finish().await?;
            tracing::debug!(bytes, "producer finished");
            Ok(bytes)
        }
        Some(Err(err)) => {
            dump.kill().await;
            if is_closed_pipe(&err) {
                return Err(Error::new(ErrorKind::BrokenPipe)
                    .with_message("dump consumer closed the pipe")
                    .with_source(err));
            }
            Err(Error::new(ErrorKind::Engine)
                .with_message("failed to read dump output")
                .with_source(err))
        }
        None => {
            dump.kill().await;
            let reason = cancel.reason().unwrap_or(CancelReason::Interrupted);
            tracing::debug!(?reason, "producer cancelled");
            Err(cancelled_error(reason))
        }
    }
}

async fn consume<W>(
    rx: DuplexStream,
    mut normalizer: Normalizer,
    output: &mut GuardedWriter<W>,
    chunk_size: usize,
) -> Result<NormalizeStats, Error>
where
    W: AsyncWrite + Unpin,
{
    let chunk_size = chunk_size.max(1);
    let mut reader = BufReader::new(rx);
    let mut line = Vec::new();
    let mut pending = Vec::with_capacity(chunk_size);

    loop {
        line.clear();
        let read = reader.read_until(b'\n', &mut line).await.map_err(|err| {
            Error::new(ErrorKind::Io)
                .with_message("failed to read dump stream")
                .with_source(err)
        })?;
        if read == 0 {
            break;
        }
        normalizer.push_line(&line, &mut pending);
        if pending.len() >= chunk_size {
            output.write_all(&pending).await?;
            pending.clear();
        }
    }

    let stats = normalizer.finish();
    if !pending.is_empty() {
        output.write_all(&pending).await?;
    }
    output.flush().await?;
    Ok(stats)
}

async fn master_deadline(timeout: Duration) {
    if timeout.is_zero() {
        std::future::pending::<()>().await;
    }
    tokio::time::sleep(timeout).await;
}

fn pipeline_timeout_error(timeout: Duration) -> Error {
    Error::new(ErrorKind::Timeout)
        .with_message(format!(
            "conversion did not finish within {}ms",
            timeout.as_millis()
        ))
        .with_hint("Raise --timeout for very large databases, or 0s to disable it.")
}

pub(crate) fn cancelled_error(reason: CancelReason) -> Error {
    match reason {
        CancelReason::Interrupted => {
            Error::new(ErrorKind::Internal).with_message("conversion interrupted")
        }
        CancelReason::Timeout => {
            Error::new(ErrorKind::Timeout).with_message("conversion cancelled after timeout")
        }
        CancelReason::BrokenDownstream => {
            Error::new(ErrorKind::BrokenPipe).with_message("conversion cancelled: output closed")
        }
        CancelReason::ProducerFailed => {
            Error::new(ErrorKind::Engine).with_message("conversion cancelled: dump failed")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{PipelineEvent as E, PipelineState as S};

    #[test]
    fn happy_paths_reach_done_in_either_order() {
        assert_eq!(
            S::Running.advance(E::ProducerFinished).advance(E::ConsumerFinished),
            S::Done
        );
        assert_eq!(
            S::Running.advance(E::ConsumerFinished).advance(E::ProducerFinished),
            S::Done
        );
    }

    #[test]
    fn first_terminal_event_wins() {
        let state = S::Running.advance(E::ConsumerFailed);
        assert_eq!(state, S::ConsumerFailed);
        assert_eq!(state.advance(E::DeadlineElapsed), S::ConsumerFailed);
        assert_eq!(state.advance(E::ProducerFinished), S::ConsumerFailed);

        let draining = S::Running.advance(E::ProducerFinished);
        assert_eq!(draining, S::ProducerDone);
        assert_eq!(draining.advance(E::DeadlineElapsed), S::TimedOut);
        assert_eq!(S::Done.advance(E::ProducerFailed), S::Done);
    }

    #[test]
    fn only_failures_request_cancellation() {
        assert!(S::ProducerDone.cancel_reason().is_none());
        assert!(S::Done.cancel_reason().is_none());
        assert!(S::ConsumerFailed.cancel_reason().is_some());
        assert!(S::TimedOut.cancel_reason().is_some());
        assert!(!S::ProducerDone.is_terminal());
        assert!(S::Interrupted.is_terminal());
    }
}
