//! Purpose: Locate the sqlite3 executable used as the dump/restore engine.
//! Exports: `resolve_engine`, `default_engine_name`.
//! Role: Keep binary-resolution heuristics out of the conversion core.
//! Invariants: Resolution order is explicit path, then `PATH`, then package-manager dirs.
//! Invariants: A missing engine is always `ErrorKind::NotFound` with a hint.

use std::ffi::OsStr;
use std::path::{Path, PathBuf};

use gitsqlite::api::{Error, ErrorKind};

pub(crate) fn default_engine_name() -> &'static str {
    if cfg!(windows) { "sqlite3.exe" } else { "sqlite3" }
}

pub(crate) fn resolve_engine(explicit: Option<&Path>) -> Result<PathBuf, Error> {
    let path_var = std::env::var_os("PATH");
    resolve_with(explicit, path_var.as_deref(), &fallback_dirs())
}

fn resolve_with(
    explicit: Option<&Path>,
    path_var: Option<&OsStr>,
    fallbacks: &[PathBuf],
) -> Result<PathBuf, Error> {
    if let Some(explicit) = explicit {
        let has_dir = explicit.components().count() > 1;
        if has_dir {
            if is_executable(explicit) {
                return Ok(explicit.to_path_buf());
            }
            return Err(not_found(explicit));
        }
        return search(explicit.as_os_str(), path_var, &[]).ok_or_else(|| not_found(explicit));
    }

    let name = OsStr::new(default_engine_name());
    search(name, path_var, fallbacks).ok_or_else(|| not_found(Path::new(name)))
}

fn search(name: &OsStr, path_var: Option<&OsStr>, fallbacks: &[PathBuf]) -> Option<PathBuf> {
    let from_path = path_var
        .map(|value| std::env::split_paths(value).collect::<Vec<_>>())
        .unwrap_or_default();
    from_path
        .iter()
        .chain(fallbacks.iter())
        .filter(|dir| !dir.as_os_str().is_empty())
        .map(|dir| dir.join(name))
        .find(|candidate| is_executable(candidate))
}

fn fallback_dirs() -> Vec<PathBuf> {
    let mut dirs = Vec::new();
    if cfg!(windows) {
        if let Some(local) = std::env::var_os("LOCALAPPDATA") {
            dirs.push(PathBuf::from(local).join("Microsoft").join("WinGet").join("Links"));
        }
        if let Some(home) = std::env::var_os("USERPROFILE") {
            dirs.push(PathBuf::from(home).join("scoop").join("shims"));
        }
        dirs.push(PathBuf::from(r"C:\ProgramData\chocolatey\bin"));
    } else {
        for dir in [
            "/opt/homebrew/bin",
            "/usr/local/bin",
            "/home/linuxbrew/.linuxbrew/bin",
            "/opt/local/bin",
            "/usr/bin",
        ] {
            dirs.push(PathBuf::from(dir));
        }
    }
    dirs
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(path)
        .map(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}

fn not_found(path: &Path) -> Error {
    Error::new(ErrorKind::NotFound)
        .with_message("sqlite3 executable not found")
        .with_path(path)
        .with_hint("Install the sqlite3 command-line shell or pass --sqlite <path>.")
}
