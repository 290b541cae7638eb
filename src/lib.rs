//! Purpose: Library crate behind the `gitsqlite` clean/smudge filter.
//! Exports: `api` (conversions, engine seam, configuration, errors).
//! Role: Keeps the streaming pipeline testable without the CLI.
//! Invariants: Core modules take explicit inputs/outputs; no hidden global state.
mod core;

pub mod api;
