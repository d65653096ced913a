//! Purpose: `segscan` CLI entry point.
//! Role: Binary crate root; parses args, runs scans or the server, emits JSON Lines on stdout.
//! Invariants: Records are written one JSON object per line, in delivery order.
//! Invariants: Errors are emitted on stderr (text on a TTY, JSON otherwise).
//! Invariants: Process exit code is derived from `api::to_exit_code`.
#![allow(clippy::result_large_err)]
use std::io::{self, IsTerminal, Write};
use std::path::{Path, PathBuf};

use clap::{Args, Parser, Subcommand, ValueHint, error::ErrorKind as ClapErrorKind};
use serde_json::{Map, Value, json};
use std::error::Error as StdError;

mod command_dispatch;
mod serve;

use segscan::api::{
    AttributeValue, Error, ErrorKind, Key, Predicate, ScanCursor, default_table_dir,
    item_from_json, to_exit_code,
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
    let exit_code = match run() {
        Ok(outcome) => outcome.exit_code,
        Err(err) => {
            emit_error(&err);
            to_exit_code(err.kind())
        }
    };
    std::process::exit(exit_code);
}

fn run() -> Result<RunOutcome, Error> {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => match err.kind() {
            ClapErrorKind::DisplayHelp
            | ClapErrorKind::DisplayVersion
            | ClapErrorKind::DisplayHelpOnMissingArgumentOrSubcommand => {
                err.print().map_err(|io_err| {
                    Error::new(ErrorKind::Io)
                        .with_message("failed to write help")
                        .with_source(io_err)
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
                return Err(Error::new(ErrorKind::Usage)
                    .with_message(clap_error_summary(&err))
                    .with_hint("Try `segscan --help`."));
            }
        },
    };

    let table_dir = cli.dir.unwrap_or_else(default_table_dir);
    command_dispatch::dispatch_command(cli.command, table_dir)
        .map_err(add_io_hint)
        .map_err(add_internal_hint)
}

#[derive(Parser)]
#[command(
    name = "segscan",
    version,
    about = "Parallel segmented table scans",
    long_about = r#"Scan a partitioned key-value table with N concurrent segment workers.

Tables are JSON Lines files (`<dir>/<table>.jsonl`, one item per line).
Scan them locally, or start `segscan serve` and scan over HTTP with --remote."#,
    after_help = r#"EXAMPLES
  $ segscan scan users --parallelism 4
  $ segscan scan users --filter '#s = :active' --name '#s=status' --value ':active="on"'
  $ segscan scan users --parallelism 4 --max-records 100 --cursor-file users.cursor
  $ segscan serve --bind 127.0.0.1:9710
  $ segscan scan users --remote http://127.0.0.1:9710
  $ segscan serve --bind 0.0.0.0:9710 --allow-non-loopback --token-file ./token
  $ segscan scan users --remote http://db.internal:9710 --token-file ./token"#,
    arg_required_else_help = true
)]
struct Cli {
    #[arg(
        long,
        global = true,
        help = "Table directory (default: ~/.segscan/tables)",
        value_hint = ValueHint::DirPath
    )]
    dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    #[command(about = "Scan a table and print matching items as JSON Lines")]
    Scan(ScanArgs),
    #[command(about = "Serve local tables over HTTP for remote scans")]
    Serve(ServeArgs),
}

#[derive(Args)]
struct ScanArgs {
    #[arg(help = "Table name")]
    table: String,
    #[arg(long, help = "Base URL of a `segscan serve` instance")]
    remote: Option<String>,
    #[arg(long, help = "Bearer token for --remote (dev-only; prefer --token-file)")]
    token: Option<String>,
    #[arg(
        long,
        help = "Read the bearer token for --remote from a file",
        value_hint = ValueHint::FilePath
    )]
    token_file: Option<PathBuf>,
    #[arg(
        long = "key",
        default_value = "id",
        help = "Key attribute of local tables (repeat for composite keys)"
    )]
    key_attributes: Vec<String>,
    #[arg(long, default_value_t = 1, help = "Number of concurrent segments")]
    parallelism: u32,
    #[arg(long, help = "Request strongly consistent reads")]
    consistent_read: bool,
    #[arg(long, help = "Filter expression evaluated by the store")]
    filter: Option<String>,
    #[arg(
        long = "name",
        value_name = "#PLACEHOLDER=ATTR",
        help = "Attribute name substitution (repeatable)"
    )]
    names: Vec<String>,
    #[arg(
        long = "value",
        value_name = ":PLACEHOLDER=JSON",
        help = "Attribute value substitution (repeatable)"
    )]
    values: Vec<String>,
    #[arg(long, help = "Maximum items evaluated per page request")]
    limit: Option<u32>,
    #[arg(long, help = "Stop after emitting this many records")]
    max_records: Option<u64>,
    #[arg(long, help = "Exclusive start key as a JSON object (parallelism 1 only)")]
    start_key: Option<String>,
    #[arg(
        long,
        help = "Resume from and save progress to this file",
        value_hint = ValueHint::FilePath
    )]
    cursor_file: Option<PathBuf>,
}

#[derive(Args)]
struct ServeArgs {
    #[arg(long, default_value = "127.0.0.1:9710", help = "Bind address")]
    bind: String,
    #[arg(
        long = "key",
        default_value = "id",
        help = "Key attribute of served tables (repeat for composite keys)"
    )]
    key_attributes: Vec<String>,
    #[arg(long, default_value_t = segscan::api::DEFAULT_PAGE_LIMIT, help = "Default items evaluated per page")]
    page_limit: u32,
    #[arg(long, help = "Allow binding to a non-loopback address (requires a token)")]
    allow_non_loopback: bool,
    #[arg(long, help = "Require this bearer token (dev-only; prefer --token-file)")]
    token: Option<String>,
    #[arg(
        long,
        help = "Require the bearer token stored in this file",
        value_hint = ValueHint::FilePath
    )]
    token_file: Option<PathBuf>,
}

fn build_predicate(expression: &str, names: &[String], values: &[String]) -> Result<Predicate, Error> {
    let mut predicate = Predicate::new(expression);
    for raw in names {
        let (placeholder, attribute) = split_substitution(raw, "--name", '#')?;
        predicate = predicate.with_name(placeholder, attribute);
    }
    for raw in values {
        let (placeholder, json) = split_substitution(raw, "--value", ':')?;
        let value: Value = serde_json::from_str(json).map_err(|err| {
            Error::new(ErrorKind::Usage)
                .with_message(format!("--value {placeholder} is not valid JSON"))
                .with_hint("Quote strings as JSON, e.g. --value ':v=\"text\"'.")
                .with_source(err)
        })?;
        predicate = predicate.with_value(placeholder, AttributeValue::from_json(&value));
    }
    Ok(predicate)
}

fn split_substitution<'a>(raw: &'a str, flag: &str, sigil: char) -> Result<(&'a str, &'a str), Error> {
    match raw.split_once('=') {
        Some((placeholder, rest)) if placeholder.starts_with(sigil) && placeholder.len() > 1 => {
            Ok((placeholder, rest))
        }
        _ => Err(Error::new(ErrorKind::Usage)
            .with_message(format!("invalid {flag} value `{raw}`"))
            .with_hint(format!("Use {flag} '{sigil}placeholder=...'."))),
    }
}

fn parse_start_key(raw: &str) -> Result<Key, Error> {
    let value: Value = serde_json::from_str(raw).map_err(|err| {
        Error::new(ErrorKind::Usage)
            .with_message("--start-key is not valid JSON")
            .with_source(err)
    })?;
    item_from_json(&value).map_err(|err| err.with_hint("Pass the key as a JSON object."))
}

fn read_token_file(path: &Path) -> Result<String, Error> {
    let raw = std::fs::read_to_string(path).map_err(|err| {
        Error::new(ErrorKind::Usage)
            .with_message(format!("failed to read token file {}", path.display()))
            .with_source(err)
    })?;
    let token = raw.trim().to_string();
    if token.is_empty() {
        return Err(Error::new(ErrorKind::Usage)
            .with_message(format!("token file {} is empty", path.display())));
    }
    Ok(token)
}

fn resolve_token_value(
    token: Option<String>,
    token_file: Option<&Path>,
) -> Result<Option<String>, Error> {
    if token.is_some() && token_file.is_some() {
        return Err(Error::new(ErrorKind::Usage)
            .with_message("--token cannot be combined with --token-file")
            .with_hint("Use --token-file for safer handling, or pass --token for local/dev use."));
    }
    if let Some(path) = token_file {
        return read_token_file(path).map(Some);
    }
    Ok(token)
}

fn read_cursor_file(path: &Path) -> Result<Option<ScanCursor>, Error> {
    let text = match std::fs::read_to_string(path) {
        Ok(text) => text,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(err) => {
            return Err(Error::new(ErrorKind::Io)
                .with_message(format!("failed to read cursor file {}", path.display()))
                .with_source(err));
        }
    };
    let cursor = serde_json::from_str(&text).map_err(|err| {
        Error::new(ErrorKind::Usage)
            .with_message(format!("invalid cursor file {}", path.display()))
            .with_hint("Delete the cursor file to restart the scan from the beginning.")
            .with_source(err)
    })?;
    Ok(Some(cursor))
}

/// Saves an unfinished cursor, or removes the file once every segment is exhausted.
fn write_cursor_file(path: &Path, cursor: &ScanCursor) -> Result<(), Error> {
    if cursor.is_complete() {
        return match std::fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(Error::new(ErrorKind::Io)
                .with_message(format!("failed to remove cursor file {}", path.display()))
                .with_source(err)),
        };
    }
    let text = serde_json::to_string(cursor).map_err(|err| {
        Error::new(ErrorKind::Internal)
            .with_message("failed to encode cursor")
            .with_source(err)
    })?;
    std::fs::write(path, text).map_err(|err| {
        Error::new(ErrorKind::Io)
            .with_message(format!("failed to write cursor file {}", path.display()))
            .with_source(err)
    })
}

fn emit_record(out: &mut impl Write, record: &Value) -> Result<(), Error> {
    serde_json::to_writer(&mut *out, record)
        .map_err(io::Error::from)
        .and_then(|()| out.write_all(b"\n"))
        .map_err(|err| {
            Error::new(ErrorKind::Io)
                .with_message("failed to write output")
                .with_source(err)
        })
}

fn add_io_hint(err: Error) -> Error {
    if err.hint().is_some() {
        return err;
    }
    match err.kind() {
        ErrorKind::NotFound => {
            err.with_hint("Check the table name and --dir (tables are `<dir>/<table>.jsonl`).")
        }
        ErrorKind::Transport => {
            err.with_hint("Check that the remote server is running and reachable.")
        }
        ErrorKind::Permission => {
            err.with_hint("Pass the server's bearer token with --token or --token-file.")
        }
        ErrorKind::Io => err.with_hint("I/O error. Check the path and filesystem permissions."),
        _ => err,
    }
}

fn add_internal_hint(err: Error) -> Error {
    if err.kind() != ErrorKind::Internal || err.hint().is_some() {
        return err;
    }
    err.with_hint(
        "Unexpected internal failure. Retry with RUST_BACKTRACE=1 and share command/context if it persists.",
    )
}

fn emit_error(err: &Error) {
    if io::stderr().is_terminal() {
        eprintln!("{}", error_text(err));
        return;
    }
    let json = serde_json::to_string(&error_json(err)).unwrap_or_else(|_| {
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
        ErrorKind::InvalidExpression => "invalid filter expression".to_string(),
        ErrorKind::Transport => "transport failure".to_string(),
        ErrorKind::Decode => "failed to decode record".to_string(),
        ErrorKind::NotFound => "not found".to_string(),
        ErrorKind::Permission => "permission denied".to_string(),
        ErrorKind::Io => "i/o error".to_string(),
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
    if let Some(table) = err.table() {
        inner.insert("table".to_string(), json!(table));
    }
    if let Some(segment) = err.segment() {
        inner.insert("segment".to_string(), json!(segment));
    }
    let causes = error_causes(err);
    if !causes.is_empty() {
        inner.insert("causes".to_string(), json!(causes));
    }

    let mut outer = Map::new();
    outer.insert("error".to_string(), Value::Object(inner));
    Value::Object(outer)
}

fn error_text(err: &Error) -> String {
    let mut lines = vec![format!("error: {}", error_message(err))];
    if let Some(hint) = err.hint() {
        lines.push(format!("hint: {hint}"));
    }
    if let Some(table) = err.table() {
        lines.push(format!("table: {table}"));
    }
    if let Some(segment) = err.segment() {
        lines.push(format!("segment: {segment}"));
    }
    if let Some(cause) = error_causes(err).first() {
        lines.push(format!("caused by: {cause}"));
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
