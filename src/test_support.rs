use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use rusqlite::Connection;

use crate::adapters::db::{open_connection, run_migrations};

static TEST_DB_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Opens a fresh, fully migrated database under ./target/testdb. Each call
/// gets its own file so tests can run in parallel.
pub fn open_test_connection(test_name: &str) -> Connection {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis();
    let counter = TEST_DB_COUNTER.fetch_add(1, Ordering::Relaxed);
    let path = Path::new("./target/testdb").join(format!("{test_name}-{now}-{counter}.sqlite"));

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).expect("test db dir should be creatable");
    }

    let mut connection =
        open_connection(path.to_string_lossy().as_ref()).expect("test db should open");
    run_migrations(&mut connection).expect("test migrations should succeed");
    connection
}
