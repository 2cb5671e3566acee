//! Migration system for tracking and applying database changes.
//!
//! Each migration has a version number and an `up`/`down` pair. Migrations
//! are applied in version order and tracked in a `_migrations` table.

mod default_newsletter;
mod schema;

use chrono::{DateTime, Utc};
use dispatch_common::{Error, Result};
use rusqlite::{Connection, OptionalExtension, TransactionBehavior, params};
use serde::Serialize;
use tracing::{debug, info};

use crate::timestamp;

pub use default_newsletter::{DefaultNewsletter, merge_settings};
pub use schema::CREATE_NEWSLETTER_TABLES;

/// One reversible step in the database's history.
///
/// Both directions run inside an exclusive transaction opened by the
/// [`Migrator`]; they must not commit or roll back themselves.
pub trait Migration: Send + Sync {
    fn version(&self) -> u32;
    fn name(&self) -> &'static str;
    fn up(&self, conn: &Connection) -> Result<()>;
    fn down(&self, conn: &Connection) -> Result<()>;
}

/// A migration expressed as two SQL scripts.
pub struct SqlMigration {
    pub version: u32,
    pub name: &'static str,
    pub up: &'static str,
    pub down: &'static str,
}

impl Migration for SqlMigration {
    fn version(&self) -> u32 {
        self.version
    }

    fn name(&self) -> &'static str {
        self.name
    }

    fn up(&self, conn: &Connection) -> Result<()> {
        conn.execute_batch(self.up)
            .map_err(|e| Error::Database(format!("migration {} failed: {e}", self.name)))
    }

    fn down(&self, conn: &Connection) -> Result<()> {
        conn.execute_batch(self.down)
            .map_err(|e| Error::Database(format!("rollback of {} failed: {e}", self.name)))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AppliedMigration {
    pub version: u32,
    pub name: String,
    pub applied_at: DateTime<Utc>,
}

/// Ordered registry of migrations plus the bookkeeping to apply them once.
pub struct Migrator {
    migrations: Vec<Box<dyn Migration>>,
}

impl Migrator {
    pub fn new(mut migrations: Vec<Box<dyn Migration>>) -> Self {
        migrations.sort_by_key(|m| m.version());
        Self { migrations }
    }

    /// Schema first, then the default newsletter seed.
    pub fn builtin() -> Self {
        Self::new(vec![
            Box::new(CREATE_NEWSLETTER_TABLES) as Box<dyn Migration>,
            Box::new(DefaultNewsletter),
        ])
    }

    pub fn latest_version(&self) -> u32 {
        self.migrations.last().map_or(0, |m| m.version())
    }

    pub fn migrate(&self, conn: &mut Connection) -> Result<Vec<u32>> {
        self.migrate_to(conn, self.latest_version())
    }

    /// Apply pending migrations up to and including `target`.
    ///
    /// Each one runs in its own `EXCLUSIVE` transaction and re-checks the
    /// ledger inside it, so a concurrent runner that got there first turns
    /// this one into a no-op. A failure rolls back only the failing step.
    pub fn migrate_to(&self, conn: &mut Connection, target: u32) -> Result<Vec<u32>> {
        ensure_ledger(conn)?;

        let mut applied = Vec::new();
        for migration in self.migrations.iter().filter(|m| m.version() <= target) {
            let version = migration.version();
            let tx = conn
                .transaction_with_behavior(TransactionBehavior::Exclusive)
                .map_err(|e| Error::Transaction(format!("failed to begin migration {version}: {e}")))?;

            if is_applied(&tx, version)? {
                continue;
            }

            migration.up(&tx)?;
            tx.execute(
                "INSERT INTO _migrations (version, name, applied_at) VALUES (?1, ?2, ?3)",
                params![version, migration.name(), timestamp::format(&timestamp::now())],
            )
            .map_err(|e| Error::Database(format!("failed to record migration {version}: {e}")))?;
            tx.commit()
                .map_err(|e| Error::Transaction(format!("failed to commit migration {version}: {e}")))?;

            info!("applied migration {version} ({})", migration.name());
            applied.push(version);
        }

        if applied.is_empty() {
            debug!("database already at version {target} or later");
        }
        Ok(applied)
    }

    /// Reverse the `steps` most recently applied migrations, newest first.
    pub fn rollback(&self, conn: &mut Connection, steps: usize) -> Result<Vec<u32>> {
        ensure_ledger(conn)?;

        let mut newest_first = self.applied(conn)?;
        newest_first.reverse();

        let mut reverted = Vec::new();
        for record in newest_first.into_iter().take(steps) {
            let version = record.version;
            let migration = self
                .migrations
                .iter()
                .find(|m| m.version() == version)
                .ok_or_else(|| {
                    Error::Database(format!("no migration registered for applied version {version}"))
                })?;

            let tx = conn
                .transaction_with_behavior(TransactionBehavior::Exclusive)
                .map_err(|e| Error::Transaction(format!("failed to begin rollback {version}: {e}")))?;

            if !is_applied(&tx, version)? {
                continue;
            }

            migration.down(&tx)?;
            tx.execute("DELETE FROM _migrations WHERE version = ?1", params![version])
                .map_err(|e| Error::Database(format!("failed to unrecord migration {version}: {e}")))?;
            tx.commit()
                .map_err(|e| Error::Transaction(format!("failed to commit rollback {version}: {e}")))?;

            info!("rolled back migration {version} ({})", migration.name());
            reverted.push(version);
        }
        Ok(reverted)
    }

    /// Ledger entries in version order.
    pub fn applied(&self, conn: &Connection) -> Result<Vec<AppliedMigration>> {
        ensure_ledger(conn)?;
        let mut stmt = conn
            .prepare("SELECT version, name, applied_at FROM _migrations ORDER BY version ASC")
            .map_err(|e| Error::Database(format!("failed to prepare query: {e}")))?;

        let rows = stmt
            .query_map([], |row| {
                Ok(AppliedMigration {
                    version: row.get(0)?,
                    name: row.get(1)?,
                    applied_at: timestamp::column(row, 2)?,
                })
            })
            .map_err(|e| Error::Database(format!("failed to query migrations: {e}")))?;

        let mut applied = Vec::new();
        for row in rows {
            applied.push(row.map_err(|e| Error::Database(format!("failed to read migration row: {e}")))?);
        }
        Ok(applied)
    }

    /// Registered versions not yet in the ledger.
    pub fn pending(&self, conn: &Connection) -> Result<Vec<u32>> {
        let applied: Vec<u32> = self.applied(conn)?.iter().map(|m| m.version).collect();
        Ok(self
            .migrations
            .iter()
            .map(|m| m.version())
            .filter(|v| !applied.contains(v))
            .collect())
    }
}

fn ensure_ledger(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS _migrations (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at TEXT NOT NULL
        );",
    )
    .map_err(|e| Error::Database(format!("failed to create migrations table: {e}")))
}

fn is_applied(conn: &Connection, version: u32) -> Result<bool> {
    let found = conn
        .query_row(
            "SELECT 1 FROM _migrations WHERE version = ?1",
            params![version],
            |_| Ok(()),
        )
        .optional()
        .map_err(|e| Error::Database(format!("failed to check migration {version}: {e}")))?;
    Ok(found.is_some())
}
