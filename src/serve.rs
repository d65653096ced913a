//! Purpose: Serve segmented scan requests over HTTP/JSON.
//! Exports: `ServeConfig`, `serve`, `init_tracing`.
//! Role: Axum-based loopback server backing `RemoteTransport`.
//! Invariants: Tables are loaded once at startup; requests never touch the filesystem.
//! Invariants: Loopback-only unless explicitly allowed; non-loopback binds require a token.
//! Invariants: With a token configured, every table route checks `Authorization: Bearer`.
//! Invariants: Errors are JSON envelopes whose `kind` round-trips through `RemoteTransport`.

use axum::extract::{Path as AxumPath, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use serde_json::json;
use std::future::IntoFuture;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::time::Duration;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use segscan::api::{Error, ErrorKind, LocalClient, MemoryStore, ScanRequest};

#[derive(Clone, Debug)]
pub struct ServeConfig {
    pub bind: SocketAddr,
    pub table_dir: PathBuf,
    pub key_attributes: Vec<String>,
    pub page_limit: u32,
    pub allow_non_loopback: bool,
    pub token: Option<String>,
}

struct AppState {
    store: MemoryStore,
    token: Option<String>,
}

pub async fn serve(config: ServeConfig) -> Result<(), Error> {
    validate_config(&config)?;

    init_tracing("info");

    let store = LocalClient::new()
        .with_table_dir(&config.table_dir)
        .with_key_attributes(config.key_attributes.clone())
        .with_page_limit(config.page_limit)
        .open_store()?;
    tracing::info!(
        tables = store.table_names().count(),
        dir = %config.table_dir.display(),
        "loaded tables"
    );

    let listener = tokio::net::TcpListener::bind(config.bind)
        .await
        .map_err(|err| {
            Error::new(ErrorKind::Io)
                .with_message("failed to bind server")
                .with_source(err)
        })?;
    tracing::info!(bind = %config.bind, auth = config.token.is_some(), "listening");

    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();
    let server = axum::serve(listener, router(store, config.token.clone()))
        .with_graceful_shutdown(async {
            let _ = shutdown_rx.await;
        })
        .into_future();
    tokio::pin!(server);

    tokio::select! {
        result = &mut server => {
            result.map_err(|err| {
                Error::new(ErrorKind::Io)
                    .with_message("server failed")
                    .with_source(err)
            })?;
        }
        _ = shutdown_signal() => {
            let _ = shutdown_tx.send(());
            match tokio::time::timeout(Duration::from_secs(10), &mut server).await {
                Ok(result) => result.map_err(|err| {
                    Error::new(ErrorKind::Io)
                        .with_message("server failed")
                        .with_source(err)
                })?,
                Err(_) => {
                    return Err(Error::new(ErrorKind::Io).with_message("server shutdown timed out"));
                }
            }
        }
    };
    Ok(())
}

fn router(store: MemoryStore, token: Option<String>) -> Router {
    let state = Arc::new(AppState { store, token });
    Router::new()
        .route("/healthz", get(healthz))
        .route("/v0/tables", get(list_tables))
        .route("/v0/tables/:table/scan", post(scan_table))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn is_loopback(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(addr) => addr.is_loopback(),
        IpAddr::V6(addr) => addr.is_loopback(),
    }
}

fn validate_config(config: &ServeConfig) -> Result<(), Error> {
    if !is_loopback(config.bind.ip()) && !config.allow_non_loopback {
        return Err(Error::new(ErrorKind::Usage)
            .with_message("non-loopback bind requires explicit opt-in")
            .with_hint("Re-run with --allow-non-loopback or use a loopback address."));
    }
    if !is_loopback(config.bind.ip()) && config.token.is_none() {
        return Err(Error::new(ErrorKind::Usage)
            .with_message("non-loopback bind requires a bearer token")
            .with_hint("Use --token-file (or --token for local testing)."));
    }
    if config.key_attributes.is_empty() {
        return Err(Error::new(ErrorKind::Usage)
            .with_message("at least one key attribute is required")
            .with_hint("Use --key id (repeat --key for composite keys)."));
    }
    if config.page_limit == 0 {
        return Err(Error::new(ErrorKind::Usage)
            .with_message("--page-limit must be greater than zero")
            .with_hint("Use a positive value like 100."));
    }
    Ok(())
}

/// Installs the global subscriber once; `RUST_LOG` overrides `default_level`.
pub fn init_tracing(default_level: &str) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                tracing::warn!(error = %err, "failed to install SIGTERM handler");
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

async fn healthz() -> Response {
    json_response(json!({ "ok": true }))
}

fn authorize(headers: &HeaderMap, state: &AppState) -> Result<(), Error> {
    let Some(token) = state.token.as_ref() else {
        return Ok(());
    };
    let Some(value) = headers.get(header::AUTHORIZATION) else {
        return Err(Error::new(ErrorKind::Permission).with_message("missing bearer token"));
    };
    let value = value.to_str().unwrap_or_default();
    if value != format!("Bearer {token}") {
        return Err(Error::new(ErrorKind::Permission).with_message("invalid bearer token"));
    }
    Ok(())
}

async fn list_tables(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    if let Err(err) = authorize(&headers, &state) {
        return error_response(err);
    }
    let tables: Vec<&str> = state.store.table_names().collect();
    json_response(json!({ "tables": tables }))
}

async fn scan_table(
    State(state): State<Arc<AppState>>,
    AxumPath(table): AxumPath<String>,
    headers: HeaderMap,
    Json(mut request): Json<ScanRequest>,
) -> Response {
    if let Err(err) = authorize(&headers, &state) {
        return error_response(err);
    }
    if request.table.is_empty() {
        request.table = table;
    } else if request.table != table {
        return error_response(
            Error::new(ErrorKind::Usage)
                .with_message("request table does not match the url")
                .with_table(table),
        );
    }
    match state.store.scan(&request) {
        Ok(response) => {
            tracing::debug!(
                table = %request.table,
                segment = request.segment,
                total_segments = request.total_segments,
                items = response.count,
                "served scan page"
            );
            (StatusCode::OK, Json(response)).into_response()
        }
        Err(err) => error_response(err),
    }
}

#[derive(Debug, Serialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    kind: String,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    hint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    table: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    segment: Option<u32>,
}

fn json_response(payload: serde_json::Value) -> Response {
    let mut response = Json(payload).into_response();
    response
        .headers_mut()
        .insert("segscan-version", HeaderValue::from_static("0"));
    response
}

fn error_response(err: Error) -> Response {
    let status = match err.kind() {
        ErrorKind::Usage | ErrorKind::InvalidExpression => StatusCode::BAD_REQUEST,
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::Permission => StatusCode::UNAUTHORIZED,
        ErrorKind::Decode => StatusCode::UNPROCESSABLE_ENTITY,
        ErrorKind::Transport => StatusCode::BAD_GATEWAY,
        ErrorKind::Io | ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    };
    let body = ErrorEnvelope {
        error: ErrorBody {
            kind: format!("{:?}", err.kind()),
            message: err.message().unwrap_or("error").to_string(),
            hint: err.hint().map(str::to_string),
            table: err.table().map(str::to_string),
            segment: err.segment(),
        },
    };
    let mut response = (status, Json(body)).into_response();
    response
        .headers_mut()
        .insert("segscan-version", HeaderValue::from_static("0"));
    response
}

#[cfg(test)]
mod tests {
    use super::{ErrorKind, ServeConfig, router, serve, validate_config};
    use segscan::api::{
        MemoryStore, MemoryTable, Predicate, RemoteTransport, ScanOptions, Scanner, item_from_json,
    };
    use serde_json::{Value, json};
    use tokio_stream::StreamExt;

    fn config(bind: &str) -> ServeConfig {
        ServeConfig {
            bind: bind.parse().expect("bind"),
            table_dir: std::env::temp_dir(),
            key_attributes: vec!["id".to_string()],
            page_limit: 100,
            allow_non_loopback: false,
            token: None,
        }
    }

    #[tokio::test]
    async fn serve_rejects_non_loopback_bind() {
        let err = serve(config("0.0.0.0:0"))
            .await
            .expect_err("expected usage error");
        assert_eq!(err.kind(), ErrorKind::Usage);
    }

    #[test]
    fn non_loopback_needs_flag_and_token() {
        let mut config = config("0.0.0.0:0");
        config.allow_non_loopback = true;
        let err = validate_config(&config).expect_err("token required");
        assert_eq!(err.kind(), ErrorKind::Usage);

        config.token = Some("s3cret".to_string());
        validate_config(&config).expect("valid");
    }

    #[test]
    fn key_attributes_and_page_limit_are_required() {
        let mut no_keys = config("127.0.0.1:0");
        no_keys.key_attributes.clear();
        assert_eq!(
            validate_config(&no_keys).expect_err("err").kind(),
            ErrorKind::Usage
        );

        let mut no_limit = config("127.0.0.1:0");
        no_limit.page_limit = 0;
        assert_eq!(
            validate_config(&no_limit).expect_err("err").kind(),
            ErrorKind::Usage
        );
    }

    async fn spawn_server(store: MemoryStore) -> String {
        spawn_server_with_token(store, None).await
    }

    async fn spawn_server_with_token(store: MemoryStore, token: Option<&str>) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let addr = listener.local_addr().expect("addr");
        let app = router(store, token.map(str::to_string));
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        format!("http://{addr}")
    }

    fn users(count: u32) -> MemoryStore {
        let mut table = MemoryTable::new("users", vec!["id".to_string()]);
        for n in 0..count {
            table
                .insert(item_from_json(&json!({"id": format!("u{n:02}"), "n": n})).expect("item"))
                .expect("insert");
        }
        MemoryStore::new().with_page_limit(3).with_table(table)
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn remote_scan_reads_every_item() {
        let base = spawn_server(users(12)).await;
        let scanner = Scanner::new(RemoteTransport::new(base).expect("transport"));
        let mut stream = scanner
            .scan_all::<Value>("users", ScanOptions::new(3))
            .expect("stream");
        let mut ids = Vec::new();
        while let Some(record) = stream.next().await {
            ids.push(record.expect("record")["id"].as_str().expect("id").to_string());
        }
        ids.sort();
        let expected: Vec<String> = (0..12).map(|n| format!("u{n:02}")).collect();
        assert_eq!(ids, expected);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn remote_errors_keep_their_kind() {
        let base = spawn_server(users(2)).await;
        let transport = RemoteTransport::new(base).expect("transport");

        let tables = transport.list_tables().await.expect("tables");
        assert_eq!(tables, vec!["users".to_string()]);

        let scanner = Scanner::new(transport);
        let mut missing = scanner
            .scan_all::<Value>("ghost", ScanOptions::new(1))
            .expect("stream");
        let err = missing.next().await.expect("item").expect_err("err");
        assert_eq!(err.kind(), ErrorKind::NotFound);

        let mut invalid = scanner
            .scan::<Value>("users", Predicate::new("n >"), ScanOptions::new(2))
            .expect("stream");
        let err = invalid.next().await.expect("item").expect_err("err");
        assert_eq!(err.kind(), ErrorKind::InvalidExpression);
        assert_eq!(err.table(), Some("users"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn bearer_token_guards_table_routes() {
        let base = spawn_server_with_token(users(4), Some("s3cret")).await;

        let anonymous = RemoteTransport::new(base.clone()).expect("transport");
        let err = anonymous.list_tables().await.expect_err("unauthorized");
        assert_eq!(err.kind(), ErrorKind::Permission);
        let mut denied = Scanner::new(anonymous)
            .scan_all::<Value>("users", ScanOptions::new(2))
            .expect("stream");
        let err = denied.next().await.expect("item").expect_err("err");
        assert_eq!(err.kind(), ErrorKind::Permission);

        let wrong = RemoteTransport::new(base.clone())
            .expect("transport")
            .with_token("guess");
        assert_eq!(
            wrong.list_tables().await.expect_err("err").kind(),
            ErrorKind::Permission
        );

        let authorized = RemoteTransport::new(base)
            .expect("transport")
            .with_token("s3cret");
        assert_eq!(
            authorized.list_tables().await.expect("tables"),
            vec!["users".to_string()]
        );
        let mut stream = Scanner::new(authorized)
            .scan_all::<Value>("users", ScanOptions::new(2))
            .expect("stream");
        let mut count = 0;
        while let Some(record) = stream.next().await {
            record.expect("record");
            count += 1;
        }
        assert_eq!(count, 4);
    }
}
