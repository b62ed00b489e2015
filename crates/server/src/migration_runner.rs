//! Schema migrations for rusqlite.
//!
//! Migrations are compiled into the binary so a deployed relayd never
//! depends on a migrations directory being present next to it. Applied
//! versions are tracked in `schema_versions` and pending ones run in
//! order at startup, before any other database work.

use std::collections::HashSet;

use rusqlite::{params, Connection};
use tracing::info;

/// Ordered list of (version, name, sql). Append only.
const MIGRATIONS: &[(i64, &str, &str)] = &[(
    1,
    "initial",
    include_str!("../../../migrations/001_initial.sql"),
)];

/// Run all pending migrations against the given connection.
pub fn run_migrations(conn: &mut Connection) -> anyhow::Result<()> {
    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA busy_timeout = 5000;
         PRAGMA synchronous = NORMAL;",
    )?;

    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_versions (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
        )",
    )?;

    let applied: HashSet<i64> = conn
        .prepare("SELECT version FROM schema_versions")?
        .query_map([], |row| row.get(0))?
        .filter_map(|r| r.ok())
        .collect();

    let mut pending = 0;
    for (version, name, sql) in MIGRATIONS {
        if applied.contains(version) {
            continue;
        }

        let tx = conn.transaction()?;
        tx.execute_batch(sql)?;
        tx.execute(
            "INSERT OR IGNORE INTO schema_versions (version, name) VALUES (?1, ?2)",
            params![version, name],
        )?;
        tx.commit()?;

        info!(
            component = "migrations",
            event = "migration.applied",
            version = version,
            name = %name,
            "Applied migration"
        );
        pending += 1;
    }

    info!(
        component = "migrations",
        event = "migrations.complete",
        total = MIGRATIONS.len(),
        applied = pending,
        "Migration check complete"
    );

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn migrations_are_idempotent() {
        let mut conn = Connection::open_in_memory().expect("open");
        run_migrations(&mut conn).expect("first run");
        run_migrations(&mut conn).expect("second run");

        let versions: i64 = conn
            .query_row("SELECT COUNT(*) FROM schema_versions", [], |r| r.get(0))
            .expect("count");
        assert_eq!(versions, MIGRATIONS.len() as i64);
    }

    #[test]
    fn initial_schema_has_expected_tables() {
        let mut conn = Connection::open_in_memory().expect("open");
        run_migrations(&mut conn).expect("migrate");

        for table in ["sessions", "events", "artifacts"] {
            let found: i64 = conn
                .query_row(
                    "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
                    params![table],
                    |r| r.get(0),
                )
                .expect("query");
            assert_eq!(found, 1, "missing table {}", table);
        }
    }
}
