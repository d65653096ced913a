//! Purpose: Send scan requests to a `segscan serve` instance over HTTP.
//! Exports: `RemoteTransport`, `DEFAULT_REMOTE_TIMEOUT`.
//! Role: Network `Transport` used by `segscan scan --remote` and embedding services.
//! Invariants: One scan request is one `POST /v0/tables/{table}/scan` round trip; no retries.
//! Invariants: Each round trip owns its connection; dropping the future closes the socket.
//! Invariants: Every round trip is bounded by the transport timeout.
//! Invariants: Remote error envelopes keep their kind; connection failures map to `Transport`.
#![allow(clippy::result_large_err)]

use super::ApiResult;
use crate::core::error::{Error, ErrorKind, parse_error_kind};
use crate::core::request::{ScanRequest, ScanResponse};
use crate::core::transport::Transport;
use axum::body::Body;
use hyper::client::conn::http1;
use hyper::{Method, Request, StatusCode, header};
use hyper_util::rt::TokioIo;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use url::{Position, Url};

pub const DEFAULT_REMOTE_TIMEOUT: Duration = Duration::from_secs(30);

const MAX_RESPONSE_BYTES: usize = 64 * 1024 * 1024;

#[derive(Clone)]
pub struct RemoteTransport {
    inner: Arc<RemoteTransportInner>,
}

#[derive(Clone)]
struct RemoteTransportInner {
    base_url: Url,
    authority: String,
    token: Option<String>,
    timeout: Duration,
}

#[derive(Deserialize)]
struct ErrorEnvelope {
    error: RemoteError,
}

#[derive(Deserialize)]
struct RemoteError {
    kind: String,
    message: Option<String>,
    hint: Option<String>,
    table: Option<String>,
    segment: Option<u32>,
}

#[derive(Deserialize)]
struct TablesEnvelope {
    tables: Vec<String>,
}

impl RemoteTransport {
    pub fn new(base_url: impl Into<String>) -> ApiResult<Self> {
        let base_url = normalize_base_url(base_url.into())?;
        let authority = authority_of(&base_url)?;
        Ok(Self {
            inner: Arc::new(RemoteTransportInner {
                base_url,
                authority,
                token: None,
                timeout: DEFAULT_REMOTE_TIMEOUT,
            }),
        })
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        Arc::make_mut(&mut self.inner).token = Some(token.into());
        self
    }

    /// Bounds each round trip, including connect and body read.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        Arc::make_mut(&mut self.inner).timeout = timeout;
        self
    }

    pub fn base_url(&self) -> &Url {
        &self.inner.base_url
    }

    /// Lists tables the server has loaded.
    pub async fn list_tables(&self) -> ApiResult<Vec<String>> {
        let url = build_url(&self.inner.base_url, &["v0", "tables"])?;
        let envelope: TablesEnvelope = self.round_trip(Method::GET, &url, None).await?;
        Ok(envelope.tables)
    }

    /// Executes a single scan request.
    pub async fn scan(&self, request: &ScanRequest) -> ApiResult<ScanResponse> {
        let url = build_url(
            &self.inner.base_url,
            &["v0", "tables", request.table.as_str(), "scan"],
        )?;
        let payload = serde_json::to_string(request).map_err(|err| {
            Error::new(ErrorKind::Internal)
                .with_message("failed to encode request json")
                .with_source(err)
        })?;
        self.round_trip(Method::POST, &url, Some(payload)).await
    }

    async fn round_trip<R>(&self, method: Method, url: &Url, payload: Option<String>) -> ApiResult<R>
    where
        R: DeserializeOwned,
    {
        let timeout = self.inner.timeout;
        let (status, body) = tokio::time::timeout(timeout, self.exchange(method, url, payload))
            .await
            .map_err(|_| {
                Error::new(ErrorKind::Transport)
                    .with_message(format!("request timed out after {}ms", timeout.as_millis()))
            })??;
        if !status.is_success() {
            return Err(parse_error_body(
                status.as_u16(),
                &String::from_utf8_lossy(&body),
            ));
        }
        serde_json::from_slice(&body).map_err(|err| {
            Error::new(ErrorKind::Transport)
                .with_message("invalid response json")
                .with_source(err)
        })
    }

    async fn exchange(
        &self,
        method: Method,
        url: &Url,
        payload: Option<String>,
    ) -> ApiResult<(StatusCode, Vec<u8>)> {
        let stream = TcpStream::connect(self.inner.authority.as_str())
            .await
            .map_err(|err| transport_error("failed to connect").with_source(err))?;
        let (mut sender, connection) = http1::handshake(TokioIo::new(stream))
            .await
            .map_err(|err| transport_error("http handshake failed").with_source(err))?;

        let mut builder = Request::builder()
            .method(method)
            .uri(&url[Position::BeforePath..])
            .header(header::HOST, self.inner.authority.as_str())
            .header(header::ACCEPT, "application/json");
        if let Some(token) = &self.inner.token {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {token}"));
        }
        let request = match payload {
            Some(json) => builder
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(json)),
            None => builder.body(Body::empty()),
        }
        .map_err(|err| {
            Error::new(ErrorKind::Internal)
                .with_message("failed to build request")
                .with_source(err)
        })?;

        // The connection is driven here rather than spawned, so dropping this
        // future drops the socket. It finishes once `sender` is dropped.
        let exchange = async move {
            let response = sender
                .send_request(request)
                .await
                .map_err(|err| transport_error("request failed").with_source(err))?;
            let status = response.status();
            let body = axum::body::to_bytes(Body::new(response.into_body()), MAX_RESPONSE_BYTES)
                .await
                .map_err(|err| transport_error("failed to read response body").with_source(err))?;
            Ok::<_, Error>((status, body.to_vec()))
        };
        let (result, closed) = tokio::join!(exchange, connection);
        if let Err(err) = closed {
            tracing::debug!(error = %err, "remote connection closed with error");
        }
        result
    }
}

impl Transport for RemoteTransport {
    async fn execute(&self, request: ScanRequest) -> Result<ScanResponse, Error> {
        self.scan(&request).await
    }
}

fn transport_error(message: &str) -> Error {
    Error::new(ErrorKind::Transport).with_message(message)
}

fn normalize_base_url(raw: String) -> ApiResult<Url> {
    let mut url = Url::parse(&raw).map_err(|err| {
        Error::new(ErrorKind::Usage)
            .with_message("invalid remote base url")
            .with_source(err)
    })?;
    if url.scheme() != "http" {
        return Err(Error::new(ErrorKind::Usage)
            .with_message("remote base url must use the http scheme")
            .with_hint("`segscan serve` speaks plain HTTP; terminate TLS in front of both ends."));
    }
    if url.path() != "/" && !url.path().is_empty() {
        return Err(
            Error::new(ErrorKind::Usage).with_message("remote base url must not include a path")
        );
    }
    url.set_path("/");
    url.set_query(None);
    url.set_fragment(None);
    Ok(url)
}

fn authority_of(url: &Url) -> ApiResult<String> {
    let host = url
        .host_str()
        .ok_or_else(|| Error::new(ErrorKind::Usage).with_message("remote base url needs a host"))?;
    let port = url.port_or_known_default().unwrap_or(80);
    Ok(format!("{host}:{port}"))
}

fn build_url(base_url: &Url, segments: &[&str]) -> ApiResult<Url> {
    let mut url = base_url.clone();
    {
        let mut path = url.path_segments_mut().map_err(|_| {
            Error::new(ErrorKind::Usage).with_message("remote base url cannot be a base")
        })?;
        path.clear();
        for segment in segments {
            path.push(segment);
        }
    }
    Ok(url)
}

fn parse_error_body(status: u16, body: &str) -> Error {
    if let Ok(envelope) = serde_json::from_str::<ErrorEnvelope>(body) {
        return error_from_remote(envelope.error);
    }
    let kind = error_kind_from_status(status);
    Error::new(kind).with_message(format!("remote error status {status}"))
}

fn error_from_remote(remote: RemoteError) -> Error {
    let mut err = Error::new(parse_error_kind(&remote.kind));
    if let Some(message) = remote.message {
        err = err.with_message(message);
    }
    if let Some(hint) = remote.hint {
        err = err.with_hint(hint);
    }
    if let Some(table) = remote.table {
        err = err.with_table(table);
    }
    if let Some(segment) = remote.segment {
        err = err.with_segment(segment);
    }
    err
}

fn error_kind_from_status(status: u16) -> ErrorKind {
    match status {
        400 | 413 | 422 => ErrorKind::Usage,
        401 | 403 => ErrorKind::Permission,
        404 => ErrorKind::NotFound,
        500..=599 => ErrorKind::Internal,
        _ => ErrorKind::Transport,
    }
}
