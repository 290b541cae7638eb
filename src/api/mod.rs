//! Purpose: Define the public Rust API boundary for gitsqlite.
//! Exports: Conversion entry points, the engine seam, configuration and error types.
//! Role: Public surface used by the CLI and by integration tests.
//! Invariants: This module is the only public path to core modules.

mod convert;

pub use crate::core::cancel::{CancelReason, CancelSignal};
pub use crate::core::engine::{DumpStream, Engine, SqliteDump, SqliteEngine};
#[doc(hidden)]
pub use crate::core::error::to_exit_code;
pub use crate::core::error::{Error, ErrorKind};
pub use crate::core::float::{MAX_PRECISION, format_significant};
pub use crate::core::normalize::{
    DEFAULT_FLOAT_PRECISION, LineAction, LineClass, NormalizeOptions, NormalizeStats, Normalizer,
    Partition, normalize_bytes,
};
pub use crate::core::pipeline::{
    ConversionStats, DEFAULT_PIPELINE_TIMEOUT, PipeCoordinator, PipelineConfig, PipelineEvent,
    PipelineState,
};
pub use crate::core::staging::StagedFile;
pub use crate::core::writer::{DEFAULT_CHUNK_SIZE, DEFAULT_WRITE_TIMEOUT, GuardedWriter};
pub use convert::Converter;
