//! Purpose: Hold top-level CLI command dispatch for `gitsqlite`.
//! Exports: `dispatch_command`.
//! Role: Keep `main.rs` focused on parse/bootstrap and delegate command execution.
//! Invariants: Conversions run on one runtime whose shutdown is bounded.
//! Invariants: Ctrl-C and SIGTERM cancel the running conversion instead of killing the process.

use super::*;

use gitsqlite::api::{CancelReason, CancelSignal, Converter, SqliteEngine};
use tokio::runtime::Runtime;

use crate::engine_paths::resolve_engine;

/// Upper bound on waiting for blocking stdio threads after a conversion ends.
const SHUTDOWN_GRACE: Duration = Duration::from_millis(500);

pub(super) fn dispatch_command(
    command: Command,
    sqlite: Option<&Path>,
) -> Result<RunOutcome, Error> {
    match command {
        Command::Completion { shell } => {
            let mut cmd = Cli::command();
            clap_complete::aot::generate(shell, &mut cmd, "gitsqlite", &mut io::stdout());
            Ok(RunOutcome::ok())
        }
        Command::Version => {
            emit_version_output(sqlite)?;
            Ok(RunOutcome::ok())
        }
        Command::Locate => {
            let path = resolve_engine(sqlite)?;
            println!("{}", path.display());
            Ok(RunOutcome::ok())
        }
        Command::Clean {
            normalize,
            pipeline,
        } => {
            let converter = Converter::new(engine(sqlite)?)
                .with_normalize(normalize.options())
                .with_pipeline(pipeline.config()?);
            run_conversion(converter, |converter| async move {
                let mut stdin = tokio::io::stdin();
                let stats = converter.clean(&mut stdin, tokio::io::stdout()).await?;
                tracing::info!(
                    bytes_in = stats.bytes_in,
                    bytes_out = stats.bytes_out,
                    lines_dropped = stats.lines_dropped,
                    "clean finished"
                );
                Ok(())
            })?;
            Ok(RunOutcome::ok())
        }
        Command::Smudge { pipeline } => {
            let converter = Converter::new(engine(sqlite)?).with_pipeline(pipeline.config()?);
            run_conversion(converter, |converter| async move {
                let mut stdin = tokio::io::stdin();
                converter.smudge(&mut stdin, tokio::io::stdout()).await?;
                Ok(())
            })?;
            Ok(RunOutcome::ok())
        }
        Command::Diff {
            path,
            normalize,
            pipeline,
        } => {
            if !path.is_file() {
                return Err(Error::new(ErrorKind::NotFound)
                    .with_message("database file not found")
                    .with_path(&path)
                    .with_hint("Pass the path of an existing SQLite database file."));
            }
            let converter = Converter::new(engine(sqlite)?)
                .with_normalize(normalize.options())
                .with_pipeline(pipeline.config()?);
            run_conversion(converter, |converter| async move {
                let stats = converter.diff(&path, tokio::io::stdout()).await?;
                tracing::info!(
                    path = %path.display(),
                    bytes_in = stats.bytes_in,
                    lines_dropped = stats.lines_dropped,
                    "diff finished"
                );
                Ok(())
            })?;
            Ok(RunOutcome::ok())
        }
    }
}

fn engine(sqlite: Option<&Path>) -> Result<SqliteEngine, Error> {
    let program = resolve_engine(sqlite)?;
    tracing::debug!(program = %program.display(), "resolved sqlite3");
    Ok(SqliteEngine::new(program))
}

fn build_runtime() -> Result<Runtime, Error> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| {
            Error::new(ErrorKind::Internal)
                .with_message("failed to start runtime")
                .with_source(err)
        })
}

/// Drive one conversion to completion, cancelling it on Ctrl-C or SIGTERM.
fn run_conversion<F, Fut>(converter: Converter<SqliteEngine>, work: F) -> Result<(), Error>
where
    F: FnOnce(Converter<SqliteEngine>) -> Fut,
    Fut: Future<Output = Result<(), Error>>,
{
    let runtime = build_runtime()?;
    let cancel = CancelSignal::new();
    let converter = converter.with_cancel(cancel.clone());
    runtime.spawn(interrupt_watcher(cancel));
    let result = runtime.block_on(work(converter));
    runtime.shutdown_timeout(SHUTDOWN_GRACE);
    result
}

async fn interrupt_watcher(cancel: CancelSignal) {
    tokio::select! {
        _ = interrupt_signal() => {
            if cancel.cancel(CancelReason::Interrupted) {
                tracing::warn!("interrupted; cancelling conversion");
            }
        }
        _ = cancel.cancelled() => {}
    }
}

async fn interrupt_signal() {
    let ctrl_c = async {
        if tokio::signal::ctrl_c().await.is_err() {
            std::future::pending::<()>().await;
        }
    };
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                tracing::debug!(error = %err, "SIGTERM handler unavailable");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(unix)]
    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    #[cfg(not(unix))]
    ctrl_c.await;
}

fn emit_version_output(sqlite: Option<&Path>) -> Result<(), Error> {
    let engine = match resolve_engine(sqlite) {
        Ok(program) => {
            let engine = SqliteEngine::new(program);
            let version = build_runtime()?.block_on(engine.version());
            Some((engine, version))
        }
        Err(err) => {
            tracing::debug!(error = %err, "sqlite3 not resolved for version output");
            None
        }
    };

    if io::stdout().is_terminal() {
        println!("gitsqlite {}", env!("CARGO_PKG_VERSION"));
        match &engine {
            Some((engine, Ok(version))) => {
                println!("sqlite3 {version} ({})", engine.program().display())
            }
            Some((engine, Err(err))) => {
                println!("sqlite3 unusable ({}): {err}", engine.program().display())
            }
            None => println!("sqlite3 not found"),
        }
        return Ok(());
    }

    let sqlite = match &engine {
        Some((engine, version)) => json!({
            "path": engine.program().display().to_string(),
            "version": version.as_ref().ok(),
        }),
        None => Value::Null,
    };
    let value = json!({
        "name": "gitsqlite",
        "version": env!("CARGO_PKG_VERSION"),
        "sqlite": sqlite,
    });
    let json = serde_json::to_string(&value).map_err(|err| {
        Error::new(ErrorKind::Internal)
            .with_message("failed to encode version output")
            .with_source(err)
    })?;
    println!("{json}");
    Ok(())
}
