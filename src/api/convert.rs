//! Purpose: High-level clean, smudge and diff conversions.
//! Exports: `Converter`.
//! Role: Wires staging, the engine, the pipe coordinator and the guarded writer per request.
//! Invariants: Every staged file is released before a conversion returns, success or failure.
//! Invariants: Output is probed before any engine process starts.
use std::path::{Path, PathBuf};

use tokio::io::{AsyncRead, AsyncWrite};

use crate::core::cancel::CancelSignal;
use crate::core::engine::Engine;
use crate::core::error::Error;
use crate::core::normalize::{NormalizeOptions, Normalizer};
use crate::core::pipeline::{ConversionStats, PipeCoordinator, PipelineConfig, cancelled_error};
use crate::core::staging::StagedFile;
use crate::core::writer::GuardedWriter;

#[derive(Debug)]
pub struct Converter<E> {
    engine: E,
    normalize: NormalizeOptions,
    pipeline: PipelineConfig,
    cancel: CancelSignal,
    stage_dir: Option<PathBuf>,
}

impl<E> Converter<E>
where
    E: Engine,
{
    pub fn new(engine: E) -> Self {
        Self {
            engine,
            normalize: NormalizeOptions::default(),
            pipeline: PipelineConfig::default(),
            cancel: CancelSignal::new(),
            stage_dir: None,
        }
    }

    pub fn with_normalize(mut self, options: NormalizeOptions) -> Self {
        self.normalize = options;
        self
    }

    pub fn with_pipeline(mut self, config: PipelineConfig) -> Self {
        self.pipeline = config;
        self
    }

    pub fn with_cancel(mut self, cancel: CancelSignal) -> Self {
        self.cancel = cancel;
        self
    }

    /// Directory for staged database files (default: the system temp dir).
    pub fn with_stage_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.stage_dir = Some(dir.into());
        self
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    pub fn cancel_signal(&self) -> CancelSignal {
        self.cancel.clone()
    }

    /// Binary database on `input` to canonical SQL text on `output`.
    pub async fn clean<R, W>(&self, input: &mut R, output: W) -> Result<ConversionStats, Error>
    where
        R: AsyncRead + Unpin + ?Sized,
        W: AsyncWrite + Unpin,
    {
        self.normalize.validate()?;
        let mut writer = self.writer(output);
        writer.probe().await?;

        let staged = self.acquire()?;
        let result = async {
            let staged_bytes = self.cancellable(staged.fill_from(input)).await?;
            tracing::debug!(bytes = staged_bytes, "staged input database");
            let stats = self
                .coordinator()
                .run(staged.path(), Normalizer::new(self.normalize), &mut writer)
                .await?;
            writer.shutdown().await?;
            Ok::<_, Error>(stats)
        }
        .await;
        finish_with_release(result, staged)
    }

    /// Existing database file at `db_path` to canonical SQL text; nothing is staged.
    pub async fn diff<W>(&self, db_path: &Path, output: W) -> Result<ConversionStats, Error>
    where
        W: AsyncWrite + Unpin,
    {
        self.normalize.validate()?;
        let mut writer = self.writer(output);
        writer.probe().await?;
        let stats = self
            .coordinator()
            .run(db_path, Normalizer::new(self.normalize), &mut writer)
            .await?;
        writer.shutdown().await?;
        Ok(stats)
    }

    /// SQL text on `input` to a binary database on `output`; returns bytes written.
    pub async fn smudge<R, W>(&self, input: &mut R, output: W) -> Result<u64, Error>
    where
        R: AsyncRead + Unpin + ?Sized,
        W: AsyncWrite + Unpin,
    {
        let mut writer = self.writer(output);
        writer.probe().await?;

        let staged = self.acquire()?;
        let result = async {
            self.cancellable(self.engine.restore(staged.path(), input)).await?;
            let bytes = staged.read_all().await?;
            writer.write_all(&bytes).await?;
            writer.shutdown().await?;
            tracing::info!(bytes_out = writer.bytes_written(), "smudge finished");
            Ok::<_, Error>(writer.bytes_written())
        }
        .await;
        finish_with_release(result, staged)
    }

    fn writer<W>(&self, output: W) -> GuardedWriter<W>
    where
        W: AsyncWrite + Unpin,
    {
        GuardedWriter::with_limits(output, self.pipeline.write_timeout, self.pipeline.chunk_size)
    }

    fn coordinator(&self) -> PipeCoordinator<'_, E> {
        PipeCoordinator::new(&self.engine, self.pipeline).with_cancel(self.cancel.clone())
    }

    fn acquire(&self) -> Result<StagedFile, Error> {
        match &self.stage_dir {
            Some(dir) => StagedFile::acquire_in(dir),
            None => StagedFile::acquire(),
        }
    }

    /// Run `fut` unless the shared signal fires first; dropping it kills any subprocess it owns.
    async fn cancellable<T, F>(&self, fut: F) -> Result<T, Error>
    where
        F: Future<Output = Result<T, Error>>,
    {
        tokio::select! {
            result = fut => result,
            reason = self.cancel.cancelled() => Err(cancelled_error(reason)),
        }
    }
}

fn finish_with_release<T>(result: Result<T, Error>, staged: StagedFile) -> Result<T, Error> {
    let released = staged.release();
    match (result, released) {
        (Ok(value), Ok(())) => Ok(value),
        (Ok(_), Err(err)) => Err(err),
        (Err(err), Ok(())) => Err(err),
        (Err(err), Err(release_err)) => {
            tracing::warn!(error = %release_err, "failed to release staging file after error");
            Err(err)
        }
    }
}
