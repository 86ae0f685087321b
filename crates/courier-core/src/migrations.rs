// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Embedded schema for the envelope store.
//!
//! Both backends create the same tables: `incoming_envelopes`,
//! `outgoing_envelopes` and `dead_letter_envelopes` for messages, plus
//! `nodes`, `node_assignments`, `leader_lease` and `control_queue` for the
//! durability agents. [`SqliteStore::from_path`](crate::SqliteStore::from_path) and
//! [`PostgresStore::connect`](crate::PostgresStore::connect) run them on
//! their own; call these directly when handing the stores an existing pool.
//!
//! ```ignore
//! let pool = PgPool::connect(&database_url).await?;
//! courier_core::migrations::run_postgres(&pool).await?;
//! let store = PostgresStore::new(pool);
//! ```

use sqlx::migrate::Migrator;
use tracing::{debug, info};

use crate::error::{CoreError, Result};

/// PostgreSQL schema.
pub static POSTGRES: Migrator = sqlx::migrate!("./migrations/postgresql");

/// SQLite schema.
pub static SQLITE: Migrator = sqlx::migrate!("./migrations/sqlite");

/// Tables every store schema provides.
pub const TABLES: &[&str] = &[
    "incoming_envelopes",
    "outgoing_envelopes",
    "dead_letter_envelopes",
    "nodes",
    "node_assignments",
    "leader_lease",
    "control_queue",
];

/// Bring a PostgreSQL database up to the current schema.
pub async fn run_postgres(pool: &sqlx::PgPool) -> Result<()> {
    debug!(backend = "postgres", "Applying envelope store migrations");
    POSTGRES.run(pool).await.map_err(|e| migrate_error("postgres", e))?;
    log_version("postgres", &POSTGRES);
    Ok(())
}

/// Bring a SQLite database up to the current schema.
pub async fn run_sqlite(pool: &sqlx::SqlitePool) -> Result<()> {
    debug!(backend = "sqlite", "Applying envelope store migrations");
    SQLITE.run(pool).await.map_err(|e| migrate_error("sqlite", e))?;
    log_version("sqlite", &SQLITE);
    Ok(())
}

/// Newest migration version embedded for a backend.
pub fn latest_version(migrator: &Migrator) -> Option<i64> {
    migrator.iter().map(|migration| migration.version).max()
}

fn log_version(backend: &str, migrator: &Migrator) {
    info!(
        backend = backend,
        version = latest_version(migrator).unwrap_or_default(),
        "Envelope store schema ready"
    );
}

fn migrate_error(backend: &str, err: sqlx::migrate::MigrateError) -> CoreError {
    CoreError::database("migrate", format!("{} schema migration failed: {}", backend, err))
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::sqlite::SqlitePoolOptions;

    #[tokio::test]
    async fn test_sqlite_schema_is_idempotent_and_complete() {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();

        run_sqlite(&pool).await.unwrap();
        run_sqlite(&pool).await.unwrap();

        let names: Vec<String> =
            sqlx::query_scalar("SELECT name FROM sqlite_master WHERE type = 'table'")
                .fetch_all(&pool)
                .await
                .unwrap();
        for table in TABLES {
            assert!(names.iter().any(|name| name == table), "missing table {}", table);
        }
    }

    #[test]
    fn test_backends_share_schema_version() {
        assert!(latest_version(&SQLITE).is_some());
        assert_eq!(latest_version(&SQLITE), latest_version(&POSTGRES));
    }
}
