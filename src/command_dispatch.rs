//! Purpose: Hold top-level CLI command dispatch for `segscan`.
//! Exports: `dispatch_command`.
//! Role: Keep `main.rs` focused on parse/bootstrap and delegate command execution.
//! Invariants: Each command builds its own tokio runtime; nothing async leaks into `main`.
//! Invariants: A cursor file always reflects exactly the records written to stdout.

use super::*;
use segscan::api::{
    LocalClient, RemoteTransport, Resumable, ScanOptions, Scanner, SerdeDecoder, Transport,
    ensure_predicate,
};
use std::net::SocketAddr;
use tokio_stream::{Stream, StreamExt};

pub(super) fn dispatch_command(command: Command, table_dir: PathBuf) -> Result<RunOutcome, Error> {
    match command {
        Command::Scan(args) => {
            serve::init_tracing("warn");
            let runtime = build_runtime()?;
            runtime.block_on(run_scan(args, table_dir))?;
            Ok(RunOutcome::ok())
        }
        Command::Serve(args) => {
            let bind: SocketAddr = args.bind.parse().map_err(|_| {
                Error::new(ErrorKind::Usage)
                    .with_message("invalid bind address")
                    .with_hint("Use a host:port value like 127.0.0.1:9710.")
            })?;
            let token = resolve_token_value(args.token, args.token_file.as_deref())?;
            let config = serve::ServeConfig {
                bind,
                table_dir,
                key_attributes: args.key_attributes,
                page_limit: args.page_limit,
                allow_non_loopback: args.allow_non_loopback,
                token,
            };
            let runtime = build_runtime()?;
            runtime.block_on(serve::serve(config))?;
            Ok(RunOutcome::ok())
        }
    }
}

fn build_runtime() -> Result<tokio::runtime::Runtime, Error> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| {
            Error::new(ErrorKind::Internal)
                .with_message("failed to start runtime")
                .with_source(err)
        })
}

async fn run_scan(args: ScanArgs, table_dir: PathBuf) -> Result<(), Error> {
    let predicate = match args.filter.as_deref() {
        Some(expression) => {
            let predicate = build_predicate(expression, &args.names, &args.values)?;
            ensure_predicate(&predicate).map_err(|err| err.with_table(args.table.clone()))?;
            Some(predicate)
        }
        None if !args.names.is_empty() || !args.values.is_empty() => {
            return Err(Error::new(ErrorKind::Usage)
                .with_message("--name and --value require --filter")
                .with_hint("Add --filter with an expression that uses the placeholders."));
        }
        None => None,
    };
    let token = resolve_token_value(args.token.clone(), args.token_file.as_deref())?;
    let options = scan_options(&args)?;

    match args.remote.as_deref() {
        Some(base_url) => {
            let mut transport = RemoteTransport::new(base_url)?;
            if let Some(token) = token {
                transport = transport.with_token(token);
            }
            scan_to_stdout(Scanner::new(transport), &args, predicate, options).await
        }
        None if token.is_some() => Err(Error::new(ErrorKind::Usage)
            .with_message("--token and --token-file only apply to --remote scans")
            .with_hint("Add --remote or drop the token flags.")),
        None => {
            let scanner = LocalClient::new()
                .with_table_dir(table_dir)
                .with_key_attributes(args.key_attributes.clone())
                .scanner(&args.table)?;
            scan_to_stdout(scanner, &args, predicate, options).await
        }
    }
}

fn scan_options(args: &ScanArgs) -> Result<ScanOptions, Error> {
    let mut options = ScanOptions::new(args.parallelism).with_consistent_read(args.consistent_read);
    if let Some(limit) = args.limit {
        options = options.with_page_limit(limit);
    }
    let cursor = match &args.cursor_file {
        Some(path) => read_cursor_file(path)?,
        None => None,
    };
    match (cursor, &args.start_key) {
        (Some(_), Some(_)) => Err(Error::new(ErrorKind::Usage)
            .with_message("--start-key cannot be combined with a saved cursor")
            .with_hint("Delete the cursor file or drop --start-key.")),
        (Some(cursor), None) => {
            tracing::info!(segments = cursor.total_segments, "resuming from cursor file");
            Ok(options.resume_from(cursor))
        }
        (None, Some(raw)) => Ok(options.with_start_key(parse_start_key(raw)?)),
        (None, None) => Ok(options),
    }
}

async fn scan_to_stdout<T: Transport>(
    scanner: Scanner<T>,
    args: &ScanArgs,
    predicate: Option<Predicate>,
    options: ScanOptions,
) -> Result<(), Error> {
    let stdout = io::stdout();
    let mut out = io::BufWriter::new(stdout.lock());

    match &args.cursor_file {
        None => {
            let mut records = scanner.scan_with(
                &args.table,
                predicate,
                options,
                SerdeDecoder::<Value>::new(),
            )?;
            let result =
                emit_records(&mut records, &mut out, args.max_records, |record: Value| record)
                    .await;
            records.cancel();
            flush(&mut out)?;
            result?;
        }
        Some(path) => {
            let mut scan = scanner.scan_resumable_with(
                &args.table,
                predicate,
                options,
                SerdeDecoder::<Value>::new(),
            )?;
            let result = emit_records(
                &mut scan,
                &mut out,
                args.max_records,
                |resumable: Resumable<Value>| resumable.record,
            )
            .await;
            scan.cancel();
            flush(&mut out)?;
            write_cursor_file(path, &scan.cursor())?;
            result?;
        }
    }
    Ok(())
}

async fn emit_records<S, R>(
    stream: &mut S,
    out: &mut impl Write,
    max_records: Option<u64>,
    record: impl Fn(R) -> Value,
) -> Result<u64, Error>
where
    S: Stream<Item = Result<R, Error>> + Unpin,
{
    let mut emitted = 0_u64;
    while max_records.is_none_or(|max| emitted < max) {
        let Some(next) = stream.next().await else {
            break;
        };
        emit_record(out, &record(next?))?;
        emitted += 1;
    }
    tracing::debug!(emitted, "scan output finished");
    Ok(emitted)
}

fn flush(out: &mut impl Write) -> Result<(), Error> {
    out.flush().map_err(|err| {
        Error::new(ErrorKind::Io)
            .with_message("failed to write output")
            .with_source(err)
    })
}
