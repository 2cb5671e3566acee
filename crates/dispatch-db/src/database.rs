use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use dispatch_common::{Error, Result};
use dispatch_config::AppConfig;
use rusqlite::{Connection, ErrorCode, Transaction, TransactionBehavior, ffi};
use tracing::info;

use crate::migrations::{AppliedMigration, Migrator};
use crate::slug::SlugGenerator;

/// Handle to the SQLite database holding settings, newsletters, members and
/// their subscriptions.
pub struct Database {
    conn: Mutex<Connection>,
    slugs: SlugGenerator,
    migrator: Migrator,
}

impl Database {
    /// Open the database at `db_path` and apply every pending migration.
    pub fn open(db_path: &Path, config: &AppConfig) -> Result<Self> {
        let db = Self::connect(db_path, config)?;
        db.migrate()?;
        Ok(db)
    }

    /// In-memory database with all migrations applied.
    pub fn in_memory() -> Result<Self> {
        let db = Self::connect_in_memory()?;
        db.migrate()?;
        Ok(db)
    }

    /// Open the database without touching its schema.
    pub fn connect(db_path: &Path, config: &AppConfig) -> Result<Self> {
        info!("opening database at {}", db_path.display());
        if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(db_path)
            .map_err(|e| Error::Database(format!("failed to open database: {e}")))?;

        conn.execute_batch("PRAGMA journal_mode=WAL;")
            .map_err(|e| Error::Database(format!("failed to set pragmas: {e}")))?;

        Self::from_connection(conn, config)
    }

    pub fn connect_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| Error::Database(format!("failed to open in-memory database: {e}")))?;

        Self::from_connection(conn, &AppConfig::default())
    }

    fn from_connection(conn: Connection, config: &AppConfig) -> Result<Self> {
        conn.execute_batch("PRAGMA foreign_keys=ON;")
            .map_err(|e| Error::Database(format!("failed to set pragmas: {e}")))?;
        conn.busy_timeout(Duration::from_millis(config.database.busy_timeout_ms))
            .map_err(|e| Error::Database(format!("failed to set busy timeout: {e}")))?;

        Ok(Self {
            conn: Mutex::new(conn),
            slugs: SlugGenerator::from(config.slugs),
            migrator: Migrator::builtin(),
        })
    }

    pub fn connection(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| Error::Database("database lock poisoned".into()))
    }

    pub fn slugs(&self) -> &SlugGenerator {
        &self.slugs
    }

    pub fn migrator(&self) -> &Migrator {
        &self.migrator
    }

    /// Apply all pending migrations. Returns the versions that were applied.
    pub fn migrate(&self) -> Result<Vec<u32>> {
        let mut conn = self.connection()?;
        self.migrator.migrate(&mut conn)
    }

    pub fn migrate_to(&self, target: u32) -> Result<Vec<u32>> {
        let mut conn = self.connection()?;
        self.migrator.migrate_to(&mut conn, target)
    }

    /// Reverse the `steps` most recently applied migrations, newest first.
    pub fn rollback(&self, steps: usize) -> Result<Vec<u32>> {
        let mut conn = self.connection()?;
        self.migrator.rollback(&mut conn, steps)
    }

    pub fn applied_migrations(&self) -> Result<Vec<AppliedMigration>> {
        let conn = self.connection()?;
        self.migrator.applied(&conn)
    }

    /// Run `f` inside one transaction on the shared connection.
    pub fn transaction<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let conn = self.connection()?;
        with_transaction(&conn, f)
    }
}

/// Run `f` inside the caller's transaction if `conn` already has one open,
/// otherwise inside a fresh `IMMEDIATE` transaction committed on success.
///
/// The fresh transaction is rolled back when `f` fails.
pub fn with_transaction<T>(conn: &Connection, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
    if !conn.is_autocommit() {
        return f(conn);
    }

    let tx = Transaction::new_unchecked(conn, TransactionBehavior::Immediate)
        .map_err(|e| Error::Transaction(format!("failed to begin transaction: {e}")))?;
    let value = f(&tx)?;
    tx.commit()
        .map_err(|e| Error::Transaction(format!("failed to commit transaction: {e}")))?;
    Ok(value)
}

/// Classify a failed write. Unique and primary key violations become
/// `Conflict`, dangling foreign keys become `Validation`.
pub(crate) fn write_error(context: &str, err: rusqlite::Error) -> Error {
    match &err {
        rusqlite::Error::SqliteFailure(failure, _)
            if failure.code == ErrorCode::ConstraintViolation =>
        {
            match failure.extended_code {
                ffi::SQLITE_CONSTRAINT_UNIQUE | ffi::SQLITE_CONSTRAINT_PRIMARYKEY => {
                    Error::Conflict(format!("{context}: {err}"))
                }
                ffi::SQLITE_CONSTRAINT_FOREIGNKEY => {
                    Error::Validation(format!("{context}: referenced row does not exist"))
                }
                _ => Error::Validation(format!("{context}: {err}")),
            }
        }
        _ => Error::Database(format!("{context}: {err}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch_table(conn: &Connection) {
        conn.execute_batch("CREATE TABLE scratch (id INTEGER PRIMARY KEY, label TEXT UNIQUE)")
            .unwrap();
    }

    fn scratch_count(conn: &Connection) -> i64 {
        conn.query_row("SELECT COUNT(*) FROM scratch", [], |row| row.get(0))
            .unwrap()
    }

    #[test]
    fn in_memory_applies_all_migrations() {
        let db = Database::in_memory().unwrap();
        let applied = db.applied_migrations().unwrap();
        let versions: Vec<u32> = applied.iter().map(|m| m.version).collect();
        assert_eq!(versions, vec![1, 2]);
    }

    #[test]
    fn failed_closure_rolls_back_fresh_transaction() {
        let db = Database::connect_in_memory().unwrap();
        let conn = db.connection().unwrap();
        scratch_table(&conn);

        let result: Result<()> = with_transaction(&conn, |tx| {
            tx.execute("INSERT INTO scratch (label) VALUES ('a')", [])
                .unwrap();
            Err(Error::Other("boom".into()))
        });

        assert!(result.is_err());
        assert_eq!(scratch_count(&conn), 0);
        assert!(conn.is_autocommit());
    }

    #[test]
    fn joins_an_open_transaction_instead_of_committing() {
        let db = Database::connect_in_memory().unwrap();
        let mut conn = db.connection().unwrap();
        scratch_table(&conn);

        {
            let outer = conn.transaction().unwrap();
            with_transaction(&outer, |tx| {
                tx.execute("INSERT INTO scratch (label) VALUES ('a')", [])
                    .map_err(|e| Error::Database(e.to_string()))?;
                Ok(())
            })
            .unwrap();
            // dropped without commit
        }

        assert_eq!(scratch_count(&conn), 0);
    }

    #[test]
    fn unique_violation_is_a_conflict() {
        let db = Database::connect_in_memory().unwrap();
        let conn = db.connection().unwrap();
        scratch_table(&conn);
        conn.execute("INSERT INTO scratch (label) VALUES ('a')", [])
            .unwrap();

        let err = conn
            .execute("INSERT INTO scratch (label) VALUES ('a')", [])
            .unwrap_err();
        assert!(write_error("insert scratch", err).is_conflict());
    }

    #[test]
    fn open_creates_parent_directories_and_migrates() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("dispatch.db");

        let db = Database::open(&path, &AppConfig::default()).unwrap();
        assert!(path.exists());
        assert_eq!(db.applied_migrations().unwrap().len(), 2);

        drop(db);
        let reopened = Database::open(&path, &AppConfig::default()).unwrap();
        assert!(reopened.migrate().unwrap().is_empty());
    }
}
