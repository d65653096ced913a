//! Purpose: End-to-end tests for `segscan serve` and remote scans.
//! Exports: None (integration test module).
//! Role: Validate remote scans and error propagation across TCP.
//! Invariants: Uses a loopback-only server with a temp table directory.
//! Invariants: Bounded waits avoid test flakiness.
//! Invariants: Server processes are cleaned up on drop.

use segscan::api::{ErrorKind, Predicate, RemoteTransport, ScanOptions, Scanner};
use serde_json::Value;
use std::collections::BTreeSet;
use std::io::Read;
use std::net::{SocketAddr, TcpListener};
use std::process::{Child, Command, Stdio};
use std::sync::{Mutex, MutexGuard};
use std::thread::sleep;
use std::time::{Duration, Instant};
use tokio_stream::StreamExt;

type TestResult<T> = Result<T, Box<dyn std::error::Error>>;

static SERVER_LOCK: Mutex<()> = Mutex::new(());

struct TestServer {
    child: Child,
    base_url: String,
    _server_guard: MutexGuard<'static, ()>,
}

impl TestServer {
    fn start(table_dir: &std::path::Path) -> TestResult<Self> {
        Self::start_with(table_dir, &[])
    }

    fn start_with(table_dir: &std::path::Path, extra: &[&str]) -> TestResult<Self> {
        let guard = SERVER_LOCK
            .lock()
            .unwrap_or_else(|poison| poison.into_inner());
        let mut last_err: Option<Box<dyn std::error::Error>> = None;
        for _attempt in 0..3 {
            let port = pick_port()?;
            let bind = format!("127.0.0.1:{port}");
            let base_url = format!("http://{bind}");

            let mut child = Command::new(env!("CARGO_BIN_EXE_segscan"))
                .arg("--dir")
                .arg(table_dir)
                .arg("serve")
                .arg("--bind")
                .arg(&bind)
                .arg("--page-limit")
                .arg("3")
                .args(extra)
                .env("RUST_LOG", "warn")
                .stdout(Stdio::null())
                .stderr(Stdio::piped())
                .spawn()?;

            match wait_for_server(&mut child, bind.parse()?) {
                Ok(()) => {
                    return Ok(Self {
                        child,
                        base_url,
                        _server_guard: guard,
                    });
                }
                Err(err) => {
                    let _ = child.kill();
                    let _ = child.wait();
                    last_err = Some(err);
                    sleep(Duration::from_millis(30));
                }
            }
        }

        Err(last_err.unwrap_or_else(|| "server failed to start".into()))
    }

    fn scanner(&self) -> TestResult<Scanner<RemoteTransport>> {
        Ok(Scanner::new(RemoteTransport::new(self.base_url.clone())?))
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

fn write_users(dir: &std::path::Path, count: u32) -> TestResult<()> {
    let mut lines = String::new();
    for n in 0..count {
        lines.push_str(&format!("{{\"id\": \"u{n:02}\", \"n\": {n}}}\n"));
    }
    std::fs::write(dir.join("users.jsonl"), lines)?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn remote_parallel_scan_reads_every_item() -> TestResult<()> {
    let temp_dir = tempfile::tempdir()?;
    write_users(temp_dir.path(), 26)?;
    let server = TestServer::start(temp_dir.path())?;

    let mut stream = server
        .scanner()?
        .scan_all::<Value>("users", ScanOptions::new(4))?;
    let mut ids = BTreeSet::new();
    let mut total = 0;
    while let Some(record) = stream.next().await {
        let record = record?;
        ids.insert(record["id"].as_str().unwrap_or_default().to_string());
        total += 1;
    }
    assert_eq!(total, 26);
    assert_eq!(ids.len(), 26);
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn remote_filter_errors_surface_as_invalid_expression() -> TestResult<()> {
    let temp_dir = tempfile::tempdir()?;
    write_users(temp_dir.path(), 4)?;
    let server = TestServer::start(temp_dir.path())?;

    let mut stream = server.scanner()?.scan::<Value>(
        "users",
        Predicate::new("n = :missing"),
        ScanOptions::new(2),
    )?;
    let err = match stream.next().await {
        Some(Err(err)) => err,
        other => return Err(format!("expected error, got {other:?}").into()),
    };
    assert_eq!(err.kind(), ErrorKind::InvalidExpression);
    Ok(())
}

#[test]
fn cli_scans_through_remote_server() -> TestResult<()> {
    let temp_dir = tempfile::tempdir()?;
    write_users(temp_dir.path(), 9)?;
    let server = TestServer::start(temp_dir.path())?;

    let output = Command::new(env!("CARGO_BIN_EXE_segscan"))
        .args(["scan", "users", "--remote", &server.base_url, "--parallelism", "3"])
        .output()?;
    assert!(output.status.success());
    let count = String::from_utf8_lossy(&output.stdout).lines().count();
    assert_eq!(count, 9);

    let missing = Command::new(env!("CARGO_BIN_EXE_segscan"))
        .args(["scan", "ghost", "--remote", &server.base_url])
        .output()?;
    assert_eq!(missing.status.code(), Some(3));
    Ok(())
}

#[test]
fn cli_token_reaches_the_server() -> TestResult<()> {
    let temp_dir = tempfile::tempdir()?;
    write_users(temp_dir.path(), 5)?;
    let token_path = temp_dir.path().join("token");
    std::fs::write(&token_path, "s3cret\n")?;
    let server = TestServer::start_with(temp_dir.path(), &["--token", "s3cret"])?;

    let denied = Command::new(env!("CARGO_BIN_EXE_segscan"))
        .args(["scan", "users", "--remote", &server.base_url])
        .output()?;
    assert_eq!(denied.status.code(), Some(7));
    assert!(denied.stdout.is_empty());

    let with_flag = Command::new(env!("CARGO_BIN_EXE_segscan"))
        .args(["scan", "users", "--remote", &server.base_url, "--token", "s3cret"])
        .output()?;
    assert!(with_flag.status.success());
    assert_eq!(String::from_utf8_lossy(&with_flag.stdout).lines().count(), 5);

    let with_file = Command::new(env!("CARGO_BIN_EXE_segscan"))
        .args(["scan", "users", "--remote", &server.base_url, "--parallelism", "2"])
        .arg("--token-file")
        .arg(&token_path)
        .output()?;
    assert!(with_file.status.success());
    assert_eq!(String::from_utf8_lossy(&with_file.stdout).lines().count(), 5);
    Ok(())
}

fn pick_port() -> TestResult<u16> {
    let listener = TcpListener::bind("127.0.0.1:0")?;
    let port = listener.local_addr()?.port();
    drop(listener);
    Ok(port)
}

fn wait_for_server(child: &mut Child, addr: SocketAddr) -> TestResult<()> {
    let url = format!("http://{addr}/healthz");
    let start = Instant::now();
    loop {
        if let Ok(resp) = ureq::get(&url).call() {
            if resp.status() == 200 {
                return Ok(());
            }
        }
        if let Some(status) = child.try_wait()? {
            let mut stderr = String::new();
            if let Some(mut pipe) = child.stderr.take() {
                let _ = pipe.read_to_string(&mut stderr);
            }
            let detail = stderr.trim();
            return Err(format!(
                "server exited before ready (status: {status}, stderr: {})",
                if detail.is_empty() { "<empty>" } else { detail }
            )
            .into());
        }
        if start.elapsed() > Duration::from_secs(8) {
            return Err("server did not start in time".into());
        }
        sleep(Duration::from_millis(20));
    }
}
