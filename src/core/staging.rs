//! Purpose: Scoped on-disk staging file for one conversion.
//! Exports: `StagedFile`.
//! Role: Give the engine a real path to read or write; remove it on every exit path.
//! Invariants: Names are unique per acquire; an existing file is never reused.
//! Invariants: Drop removes the file (and SQLite sidecars) even on error or cancellation.
//! Invariants: Releasing a file that is already gone counts as success.
use std::io;
use std::path::{Path, PathBuf};

use tempfile::TempPath;
use tokio::io::{AsyncRead, AsyncWriteExt};

use super::error::{Error, ErrorKind};

const STAGE_PREFIX: &str = "gitsqlite-";
const STAGE_SUFFIX: &str = ".db";
const SIDECAR_SUFFIXES: [&str; 3] = ["-journal", "-wal", "-shm"];

#[derive(Debug)]
pub struct StagedFile {
    path: Option<TempPath>,
}

impl StagedFile {
    pub fn acquire() -> Result<Self, Error> {
        Self::acquire_in(&std::env::temp_dir())
    }

    pub fn acquire_in(dir: &Path) -> Result<Self, Error> {
        let file = tempfile::Builder::new()
            .prefix(STAGE_PREFIX)
            .suffix(STAGE_SUFFIX)
            .tempfile_in(dir)
            .map_err(|err| {
                Error::new(ErrorKind::Io)
                    .with_message("failed to create staging file")
                    .with_path(dir)
                    .with_hint("Check that the temp directory exists and has free space.")
                    .with_source(err)
            })?;
        let path = file.into_temp_path();
        tracing::debug!(path = %path.display(), "staging file acquired");
        Ok(Self { path: Some(path) })
    }

    pub fn path(&self) -> &Path {
        self.path.as_deref().unwrap_or(Path::new(""))
    }

    /// Copy `reader` into the staged file, replacing its contents.
    pub async fn fill_from<R>(&self, reader: &mut R) -> Result<u64, Error>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let path = self.path();
        let mut file = tokio::fs::File::create(path)
            .await
            .map_err(|err| stage_io_error(err, "failed to open staging file", path))?;
        let copied = tokio::io::copy(reader, &mut file)
            .await
            .map_err(|err| stage_io_error(err, "failed to write staging file", path))?;
        file.flush()
            .await
            .map_err(|err| stage_io_error(err, "failed to flush staging file", path))?;
        Ok(copied)
    }

    pub async fn read_all(&self) -> Result<Vec<u8>, Error> {
        let path = self.path();
        tokio::fs::read(path)
            .await
            .map_err(|err| stage_io_error(err, "failed to read staging file", path))
    }

    /// Delete the staged file now, surfacing failures other than "already gone".
    pub fn release(mut self) -> Result<(), Error> {
        let Some(path) = self.path.take() else {
            return Ok(());
        };
        let owned: PathBuf = path.to_path_buf();
        remove_sidecars(&owned);
        match path.close() {
            Ok(()) => {
                tracing::debug!(path = %owned.display(), "staging file released");
                Ok(())
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(stage_io_error(err, "failed to remove staging file", &owned)),
        }
    }
}

impl Drop for StagedFile {
    fn drop(&mut self) {
        if let Some(path) = self.path.take() {
            remove_sidecars(&path);
            // TempPath removes the main file when dropped.
            drop(path);
        }
    }
}

fn remove_sidecars(path: &Path) {
    for suffix in SIDECAR_SUFFIXES {
        let mut sidecar = path.as_os_str().to_owned();
        sidecar.push(suffix);
        match std::fs::remove_file(&sidecar) {
            Ok(()) => tracing::debug!(path = ?sidecar, "removed engine sidecar file"),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => tracing::warn!(path = ?sidecar, error = %err, "failed to remove sidecar"),
        }
    }
}

fn stage_io_error(err: io::Error, message: &str, path: &Path) -> Error {
    Error::new(ErrorKind::Io)
        .with_message(message)
        .with_path(path)
        .with_source(err)
}

#[cfg(test)]
mod tests {
    use super::StagedFile;
    use crate::core::error::ErrorKind;

    #[test]
    fn acquire_creates_unique_files_and_release_removes_them() {
        let temp = tempfile::tempdir().expect("tempdir");
        let first = StagedFile::acquire_in(temp.path()).expect("first");
        let second = StagedFile::acquire_in(temp.path()).expect("second");

        assert_ne!(first.path(), second.path());
        assert!(first.path().exists());
        let name = first.path().file_name().unwrap().to_string_lossy().to_string();
        assert!(name.starts_with("gitsqlite-"));
        assert!(name.ends_with(".db"));

        let first_path = first.path().to_path_buf();
        first.release().expect("release");
        assert!(!first_path.exists());
        assert!(second.path().exists());
    }

    #[test]
    fn release_tolerates_already_removed_file() {
        let temp = tempfile::tempdir().expect("tempdir");
        let staged = StagedFile::acquire_in(temp.path()).expect("acquire");
        std::fs::remove_file(staged.path()).expect("remove");
        staged.release().expect("release after removal");
    }

    #[test]
    fn drop_removes_file_and_sidecars() {
        let temp = tempfile::tempdir().expect("tempdir");
        let staged = StagedFile::acquire_in(temp.path()).expect("acquire");
        let path = staged.path().to_path_buf();
        let journal = temp
            .path()
            .join(format!("{}-journal", path.file_name().unwrap().to_string_lossy()));
        std::fs::write(&journal, b"j").expect("journal");

        drop(staged);
        assert!(!path.exists());
        assert!(!journal.exists());
    }

    #[test]
    fn acquire_in_missing_dir_fails_fast() {
        let temp = tempfile::tempdir().expect("tempdir");
        let missing = temp.path().join("does-not-exist");
        let err = StagedFile::acquire_in(&missing).expect_err("missing dir");
        assert_eq!(err.kind(), ErrorKind::Io);
        assert_eq!(err.path(), Some(missing.as_path()));
    }

    #[tokio::test]
    async fn fill_from_replaces_contents() {
        let temp = tempfile::tempdir().expect("tempdir");
        let staged = StagedFile::acquire_in(temp.path()).expect("acquire");
        let mut input: &[u8] = b"SQLite format 3\0payload";
        let copied = staged.fill_from(&mut input).await.expect("fill");
        assert_eq!(copied, 23);
        assert_eq!(staged.read_all().await.expect("read"), b"SQLite format 3\0payload");
    }
}
