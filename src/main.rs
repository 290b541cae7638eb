//! Purpose: `gitsqlite` CLI entry point.
//! Role: Binary crate root; parses args, sets up logging, delegates to command dispatch.
//! Invariants: stdout carries only conversion payload (or version/locate output).
//! Invariants: Non-interactive errors are emitted as JSON on stderr.
//! Invariants: Process exit code is derived from `api::to_exit_code`.
#![allow(clippy::result_large_err)]
use std::ffi::OsString;
use std::io::{self, IsTerminal};
use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::{
    Args, CommandFactory, Parser, Subcommand, ValueEnum, ValueHint,
    error::ErrorKind as ClapErrorKind,
};
use clap_complete::aot::Shell;
use serde_json::{Map, Value, json};
use std::error::Error as StdError;

mod command_dispatch;
mod engine_paths;
mod logging;

use gitsqlite::api::{
    DEFAULT_FLOAT_PRECISION, Error, ErrorKind, MAX_PRECISION, NormalizeOptions, Partition,
    PipelineConfig, to_exit_code,
};

#[derive(Copy, Clone, Debug)]
struct RunOutcome {
    exit_code: i32,
}

impl RunOutcome {
    fn ok() -> Self {
        Self { exit_code: 0 }
    }

    fn with_code(exit_code: i32) -> Self {
        Self { exit_code }
    }
}

fn main() {
    let exit_code = match run(std::env::args_os()) {
        Ok(outcome) => outcome.exit_code,
        Err((err, color_mode)) => {
            emit_error(&err, color_mode);
            to_exit_code(err.kind())
        }
    };
    std::process::exit(exit_code);
}

fn run<I>(args: I) -> Result<RunOutcome, (Error, ColorMode)>
where
    I: IntoIterator<Item = OsString>,
{
    let cli = match Cli::try_parse_from(args) {
        Ok(cli) => cli,
        Err(err) => match err.kind() {
            ClapErrorKind::DisplayHelp
            | ClapErrorKind::DisplayVersion
            | ClapErrorKind::DisplayHelpOnMissingArgumentOrSubcommand => {
                err.print().map_err(|io_err| {
                    (
                        Error::new(ErrorKind::Io)
                            .with_message("failed to write help")
                            .with_source(io_err),
                        ColorMode::Auto,
                    )
                })?;
                let exit_code = if matches!(
                    err.kind(),
                    ClapErrorKind::DisplayHelpOnMissingArgumentOrSubcommand
                ) {
                    2
                } else {
                    0
                };
                return Ok(RunOutcome::with_code(exit_code));
            }
            _ => {
                let message = clap_error_summary(&err);
                let hint = clap_error_hint(&err);
                return Err((
                    Error::new(ErrorKind::Usage)
                        .with_message(message)
                        .with_hint(hint),
                    ColorMode::Auto,
                ));
            }
        },
    };

    let color_mode = cli.color;
    let log_file = logging::init_tracing(cli.log_dir()).map_err(|err| (err, color_mode))?;
    if let Some(path) = &log_file {
        tracing::debug!(
            path = %path.display(),
            args = ?std::env::args_os().collect::<Vec<_>>(),
            "logging to file"
        );
    }

    command_dispatch::dispatch_command(cli.command, cli.sqlite.as_deref())
        .map_err(add_io_hint)
        .map_err(add_internal_hint)
        .map_err(|err| {
            tracing::error!(kind = ?err.kind(), error = %err, "command failed");
            (err, color_mode)
        })
}

#[derive(Parser)]
#[command(
    name = "gitsqlite",
    version,
    about = "Git clean/smudge filter that stores SQLite databases as canonical SQL text",
    help_template = r#"{about-with-newline}
{before-help}USAGE
  {usage}

COMMANDS
{subcommands}

OPTIONS
{options}

{after-help}
"#,
    long_about = None,
    before_help = r#"The repository holds diffable SQL text; the working tree holds the binary database.

Mental model:
  - `clean` turns a database on stdin into SQL text on stdout (git add)
  - `smudge` turns SQL text on stdin into a database on stdout (git checkout)
  - `diff` prints SQL text for a database file (git diff textconv)
"#,
    after_help = r#"EXAMPLES
  $ git config filter.gitsqlite.clean "gitsqlite clean"
  $ git config filter.gitsqlite.smudge "gitsqlite smudge"
  $ git config diff.gitsqlite.textconv "gitsqlite diff"
  $ echo '*.db filter=gitsqlite diff=gitsqlite' >> .gitattributes

  $ gitsqlite clean < app.db > app.sql
  $ gitsqlite smudge < app.sql > app.db
  $ gitsqlite --sqlite /opt/sqlite/bin/sqlite3 clean --data-only < app.db

LEARN MORE
  $ gitsqlite <command> --help"#,
    arg_required_else_help = true
)]
struct Cli {
    #[arg(
        long,
        global = true,
        value_name = "PATH",
        help = "sqlite3 executable to run (default: search PATH, then common install dirs)",
        value_hint = ValueHint::ExecutablePath
    )]
    sqlite: Option<PathBuf>,
    #[arg(
        long,
        global = true,
        help = "Write JSON debug logs to a file (current directory unless --log-dir)"
    )]
    log: bool,
    #[arg(
        long,
        global = true,
        value_name = "DIR",
        help = "Directory for log files (implies --log)",
        value_hint = ValueHint::DirPath
    )]
    log_dir: Option<PathBuf>,
    #[arg(
        long,
        global = true,
        default_value = "auto",
        value_enum,
        help = "Colorize stderr diagnostics: auto|always|never"
    )]
    color: ColorMode,

    #[command(subcommand)]
    command: Command,
}

impl Cli {
    fn log_dir(&self) -> Option<&Path> {
        match (&self.log_dir, self.log) {
            (Some(dir), _) => Some(dir.as_path()),
            (None, true) => Some(Path::new(".")),
            (None, false) => None,
        }
    }
}

#[derive(Copy, Clone, Debug, ValueEnum)]
enum ColorMode {
    Auto,
    Always,
    Never,
}

impl ColorMode {
    fn use_color(self, is_tty: bool) -> bool {
        match self {
            ColorMode::Auto => is_tty,
            ColorMode::Always => true,
            ColorMode::Never => false,
        }
    }
}

#[derive(Subcommand)]
enum Command {
    #[command(
        about = "Convert a database on stdin to canonical SQL text on stdout",
        long_about = r#"Convert a binary SQLite database on stdin to canonical SQL text on stdout.

Runs as the git clean filter. The input is staged to a temporary file, dumped
by sqlite3, and normalized line by line: internal sqlite_sequence bookkeeping
is dropped and float literals are rounded so repeated runs give identical text."#,
        after_help = r#"EXAMPLES
  $ gitsqlite clean < app.db > app.sql
  $ gitsqlite clean --schema-only < app.db
  $ gitsqlite clean --float-precision 10 --timeout 2m < big.db > big.sql"#
    )]
    Clean {
        #[command(flatten)]
        normalize: NormalizeArgs,
        #[command(flatten)]
        pipeline: PipelineArgs,
    },
    #[command(
        about = "Rebuild a database from SQL text on stdin and write it to stdout",
        long_about = r#"Rebuild a binary SQLite database from SQL text on stdin.

Runs as the git smudge filter. The text is replayed by sqlite3 into a temporary
database whose bytes are then written to stdout."#,
        after_help = r#"EXAMPLES
  $ gitsqlite smudge < app.sql > app.db"#
    )]
    Smudge {
        #[command(flatten)]
        pipeline: PipelineArgs,
    },
    #[command(
        about = "Print canonical SQL text for a database file",
        long_about = r#"Print canonical SQL text for an existing database file.

Intended for git's diff textconv hook; the file is read in place and nothing is staged."#,
        after_help = r#"EXAMPLES
  $ gitsqlite diff app.db
  $ gitsqlite diff --data-only app.db"#
    )]
    Diff {
        #[arg(help = "Database file to print", value_hint = ValueHint::FilePath)]
        path: PathBuf,
        #[command(flatten)]
        normalize: NormalizeArgs,
        #[command(flatten)]
        pipeline: PipelineArgs,
    },
    #[command(about = "Print the sqlite3 executable that would be used")]
    Locate,
    #[command(about = "Print version info (JSON when stdout is not a terminal)")]
    Version,
    #[command(
        about = "Generate shell completion scripts",
        after_help = r#"EXAMPLES
  $ gitsqlite completion bash > ~/.local/share/bash-completion/completions/gitsqlite
  $ gitsqlite completion zsh > ~/.zfunc/_gitsqlite"#
    )]
    Completion {
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[derive(Args, Clone, Debug)]
struct NormalizeArgs {
    #[arg(
        long,
        value_name = "DIGITS",
        default_value_t = DEFAULT_FLOAT_PRECISION,
        value_parser = clap::value_parser!(u8).range(1..=i64::from(MAX_PRECISION)),
        help = "Significant digits kept in float literals (1-17)"
    )]
    float_precision: u8,
    #[arg(
        long,
        conflicts_with = "float_precision",
        help = "Leave float literals exactly as sqlite3 prints them"
    )]
    raw_floats: bool,
    #[arg(long, conflicts_with = "data_only", help = "Keep only schema statements")]
    schema_only: bool,
    #[arg(long, help = "Keep only data statements")]
    data_only: bool,
}

impl NormalizeArgs {
    fn options(&self) -> NormalizeOptions {
        let partition = if self.schema_only {
            Partition::SchemaOnly
        } else if self.data_only {
            Partition::DataOnly
        } else {
            Partition::Full
        };
        NormalizeOptions {
            float_precision: (!self.raw_floats).then_some(self.float_precision),
            partition,
        }
    }
}

#[derive(Args, Clone, Debug)]
struct PipelineArgs {
    #[arg(
        long,
        value_name = "DURATION",
        default_value = "1s",
        help = "Deadline for each chunk written to stdout (ms|s|m|h)"
    )]
    write_timeout: String,
    #[arg(
        long,
        value_name = "DURATION",
        default_value = "30s",
        help = "Deadline for the whole conversion (ms|s|m|h; 0s disables)"
    )]
    timeout: String,
}

impl PipelineArgs {
    fn config(&self) -> Result<PipelineConfig, Error> {
        let write_timeout = parse_duration(&self.write_timeout)?;
        if write_timeout.is_zero() {
            return Err(Error::new(ErrorKind::Usage)
                .with_message("--write-timeout must be greater than zero")
                .with_hint("Use a value like 500ms or 2s."));
        }
        Ok(PipelineConfig {
            write_timeout,
            pipeline_timeout: parse_duration(&self.timeout)?,
            ..PipelineConfig::default()
        })
    }
}

fn parse_duration(input: &str) -> Result<Duration, Error> {
    let invalid = || {
        Error::new(ErrorKind::Usage)
            .with_message(format!("invalid duration: {input:?}"))
            .with_hint("Use a number plus ms|s|m|h (e.g. 10s).")
    };
    let trimmed = input.trim();
    let split = trimmed.char_indices().find(|(_, ch)| !ch.is_ascii_digit());
    let (num_str, unit) = match split {
        Some((idx, _)) => trimmed.split_at(idx),
        None => ("", ""),
    };
    if num_str.is_empty() || unit.is_empty() {
        return Err(invalid());
    }
    let value: u64 = num_str.parse().map_err(|_| invalid())?;
    let millis = match unit {
        "ms" => value,
        "s" => value.saturating_mul(1_000),
        "m" => value.saturating_mul(60_000),
        "h" => value.saturating_mul(3_600_000),
        _ => return Err(invalid()),
    };
    Ok(Duration::from_millis(millis))
}

fn add_io_hint(err: Error) -> Error {
    if err.hint().is_some() {
        return err;
    }
    match err.kind() {
        ErrorKind::Io => {
            err.with_hint("I/O error. Check the temp directory, disk space, and stdin/stdout.")
        }
        ErrorKind::BrokenPipe => {
            err.with_hint("The process reading stdout exited before the output was complete.")
        }
        _ => err,
    }
}

fn add_internal_hint(err: Error) -> Error {
    if err.kind() != ErrorKind::Internal || err.hint().is_some() {
        return err;
    }
    err.with_hint(
        "Unexpected internal failure. Retry with --log and RUST_BACKTRACE=1 and share the log if it persists.",
    )
}

#[derive(Copy, Clone, Debug)]
enum AnsiColor {
    Red,
    Yellow,
}

fn colorize_label(label: &str, enabled: bool, color: AnsiColor) -> String {
    if !enabled {
        return label.to_string();
    }
    let code = match color {
        AnsiColor::Red => "31",
        AnsiColor::Yellow => "33",
    };
    format!("\u{1b}[{code}m{label}\u{1b}[0m")
}

fn emit_error(err: &Error, color_mode: ColorMode) {
    let is_tty = io::stderr().is_terminal();
    if is_tty {
        eprintln!("{}", error_text(err, color_mode.use_color(is_tty)));
        return;
    }

    let value = error_json(err);
    let json = serde_json::to_string(&value).unwrap_or_else(|_| {
        "{\"error\":{\"kind\":\"Internal\",\"message\":\"json encode failed\"}}".to_string()
    });
    eprintln!("{json}");
}

fn error_message(err: &Error) -> String {
    if let Some(message) = err.message() {
        return message.to_string();
    }
    match err.kind() {
        ErrorKind::Internal => "internal error".to_string(),
        ErrorKind::Usage => "usage error".to_string(),
        ErrorKind::NotFound => "not found".to_string(),
        ErrorKind::Engine => "sqlite3 failed".to_string(),
        ErrorKind::Io => "i/o error".to_string(),
        ErrorKind::BrokenPipe => "output closed".to_string(),
        ErrorKind::Timeout => "timed out".to_string(),
    }
}

fn error_causes(err: &Error) -> Vec<String> {
    let mut causes = Vec::new();
    let mut cur = err.source();
    while let Some(source) = cur {
        causes.push(source.to_string());
        cur = source.source();
    }
    causes
}

fn error_json(err: &Error) -> Value {
    let mut inner = Map::new();
    inner.insert("kind".to_string(), json!(format!("{:?}", err.kind())));
    inner.insert("message".to_string(), json!(error_message(err)));
    if let Some(hint) = err.hint() {
        inner.insert("hint".to_string(), json!(hint));
    }
    if let Some(path) = err.path() {
        inner.insert("path".to_string(), json!(path.display().to_string()));
    }
    let causes = error_causes(err);
    if !causes.is_empty() {
        inner.insert("causes".to_string(), json!(causes));
    }

    let mut outer = Map::new();
    outer.insert("error".to_string(), Value::Object(inner));
    Value::Object(outer)
}

fn error_text(err: &Error, use_color: bool) -> String {
    let mut lines = Vec::new();
    lines.push(format!(
        "{} {}",
        colorize_label("error:", use_color, AnsiColor::Red),
        error_message(err)
    ));

    if let Some(hint) = err.hint() {
        lines.push(format!(
            "{} {hint}",
            colorize_label("hint:", use_color, AnsiColor::Yellow)
        ));
    }
    if let Some(path) = err.path() {
        lines.push(format!(
            "{} {}",
            colorize_label("path:", use_color, AnsiColor::Yellow),
            path.display()
        ));
    }

    let causes = error_causes(err);
    if let Some(cause) = causes.first() {
        lines.push(format!(
            "{} {cause}",
            colorize_label("caused by:", use_color, AnsiColor::Yellow)
        ));
    }

    lines.join("\n")
}

fn clap_error_summary(err: &clap::Error) -> String {
    for line in err.to_string().lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        if let Some(rest) = trimmed.strip_prefix("error:") {
            return rest.trim().to_string();
        }
        return trimmed.to_string();
    }
    "invalid arguments".to_string()
}

fn clap_error_hint(err: &clap::Error) -> String {
    let rendered = err.to_string();
    let usage = rendered
        .lines()
        .find_map(|line| line.trim().strip_prefix("Usage: "))
        .map(str::trim);

    let Some(usage) = usage else {
        return "Try `gitsqlite --help`.".to_string();
    };

    let tokens: Vec<&str> = usage.split_whitespace().collect();
    let Some(pos) = tokens.iter().position(|t| *t == "gitsqlite") else {
        return "Try `gitsqlite --help`.".to_string();
    };

    let parts: Vec<&str> = tokens
        .iter()
        .skip(pos + 1)
        .take_while(|token| {
            !token.starts_with('-') && !token.starts_with('<') && !token.starts_with('[')
        })
        .copied()
        .collect();

    if parts.is_empty() {
        return "Try `gitsqlite --help`.".to_string();
    }
    format!("Try `gitsqlite {} --help`.", parts.join(" "))
}
