#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rusqlite::{Connection, OpenFlags};
use spool::{Config, Database, MessageCallback, MessageEvent};

/// Installs a test-friendly tracing subscriber once per binary. Log output
/// is controlled with `RUST_LOG`.
pub fn init_tracing() {
    use std::sync::Once;
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// A config with intervals shrunk for test wall-clock time.
pub fn test_config() -> Config {
    Config {
        flush_interval: Duration::from_millis(5),
        polling_interval: Duration::from_millis(10),
        ..Config::default()
    }
}

pub fn create_temp_db_file(name: &str) -> (tempfile::TempDir, PathBuf) {
    init_tracing();
    let dir = tempfile::TempDir::new().expect("create temp dir");
    let path = dir.path().join(name);
    let _ = Database::open(&path).expect("initialize database");
    (dir, path)
}

pub fn open_read_only(path: &Path) -> Connection {
    Connection::open_with_flags(
        path,
        OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )
    .expect("open read-only connection")
}

pub fn open_read_write(path: &Path) -> Connection {
    Connection::open(path).expect("open read-write connection")
}

pub fn count_all(conn: &Connection) -> i64 {
    conn.query_row("SELECT COUNT(*) FROM messages", [], |row| row.get(0))
        .expect("count rows")
}

pub fn count_undelivered(conn: &Connection) -> i64 {
    conn.query_row(
        "SELECT COUNT(*) FROM messages WHERE delivered_ms IS NULL",
        [],
        |row| row.get(0),
    )
    .expect("count undelivered rows")
}

pub async fn eventually<T>(
    timeout: Duration,
    interval: Duration,
    mut f: impl FnMut() -> Option<T>,
) -> T {
    let start = std::time::Instant::now();
    loop {
        if let Some(v) = f() {
            return v;
        }
        if start.elapsed() > timeout {
            panic!("condition not met within {:?}", timeout);
        }
        tokio::time::sleep(interval).await;
    }
}

/// A callback that collects every event it receives, for asserting on
/// delivery order and content.
pub fn collector() -> (Arc<Mutex<Vec<MessageEvent>>>, MessageCallback) {
    let received: Arc<Mutex<Vec<MessageEvent>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = received.clone();
    let callback: MessageCallback = Box::new(move |event| {
        sink.lock().expect("collector lock").push(event);
    });
    (received, callback)
}

/// The payloads collected so far, in delivery order.
pub fn collected_data(received: &Arc<Mutex<Vec<MessageEvent>>>) -> Vec<String> {
    received
        .lock()
        .expect("collector lock")
        .iter()
        .map(|e| e.data.clone())
        .collect()
}

pub fn collected_len(received: &Arc<Mutex<Vec<MessageEvent>>>) -> usize {
    received.lock().expect("collector lock").len()
}
