use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use rusqlite::{Connection, params};

use crate::runtime::ResolvedPaths;

struct Migration {
    version: u32,
    name: &'static str,
    sql: &'static str,
}

const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "baseline",
        sql: include_str!("migrations/v001_baseline.sql"),
    },
    Migration {
        version: 2,
        name: "indexes",
        sql: include_str!("migrations/v002_indexes.sql"),
    },
];

/// Report returned after running migrations.
#[derive(Debug, Clone)]
pub struct MigrateReport {
    pub applied: Vec<AppliedMigration>,
    pub current_version: u32,
}

#[derive(Debug, Clone)]
pub struct AppliedMigration {
    pub version: u32,
    pub name: String,
}

/// Run all pending migrations against the database at `paths.db_path`.
/// Creates the database and parent directories if they do not exist.
pub fn run_migrations(paths: &ResolvedPaths) -> Result<MigrateReport> {
    ensure_db_parent(paths)?;
    let connection = open_connection(&paths.db_path)?;
    migrate_connection(&connection)
}

/// Applies pending migrations to an already open connection.
pub fn migrate_connection(connection: &Connection) -> Result<MigrateReport> {
    ensure_schema_migrations_table(connection)?;

    let current = current_version(connection)?;
    let mut applied = Vec::new();

    for migration in MIGRATIONS {
        if migration.version <= current {
            continue;
        }
        apply_migration(connection, migration).with_context(|| {
            format!(
                "failed to apply migration v{:03}_{}",
                migration.version, migration.name
            )
        })?;
        tracing::debug!(version = migration.version, name = migration.name, "applied migration");
        applied.push(AppliedMigration {
            version: migration.version,
            name: migration.name.to_string(),
        });
    }

    let final_version = current_version(connection)?;
    Ok(MigrateReport {
        applied,
        current_version: final_version,
    })
}

/// Returns the number of migrations that have not yet been applied.
pub fn pending_migration_count(paths: &ResolvedPaths) -> Result<usize> {
    if !paths.db_path.exists() {
        return Ok(MIGRATIONS.len());
    }
    let connection = open_connection(&paths.db_path)?;
    ensure_schema_migrations_table(&connection)?;
    let current = current_version(&connection)?;
    Ok(MIGRATIONS
        .iter()
        .filter(|m| m.version > current)
        .count())
}

/// Returns the highest applied migration version, or 0 if none applied.
pub fn current_version(connection: &Connection) -> Result<u32> {
    let version: i64 = connection
        .query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
            [],
            |row| row.get(0),
        )
        .context("failed to read current migration version")?;
    u32::try_from(version).context("migration version does not fit into u32")
}

/// Opens a migrated database for course work, failing when migrations are pending.
pub fn open_migrated(paths: &ResolvedPaths) -> Result<Connection> {
    let pending = pending_migration_count(paths)?;
    if pending > 0 {
        anyhow::bail!(
            "{pending} schema migration(s) pending for {}. {}",
            paths.db_path.display(),
            crate::runtime::MIGRATIONS_POLICY_MESSAGE
        );
    }
    open_connection(&paths.db_path)
}

pub fn open_connection(db_path: &Path) -> Result<Connection> {
    let connection = Connection::open(db_path)
        .with_context(|| format!("failed to open {}", db_path.display()))?;
    connection
        .busy_timeout(Duration::from_secs(5))
        .context("failed to set sqlite busy timeout")?;
    connection
        .pragma_update(None, "foreign_keys", "ON")
        .context("failed to enable foreign_keys pragma")?;
    connection
        .pragma_update(None, "journal_mode", "WAL")
        .context("failed to enable WAL journal mode")?;
    Ok(connection)
}

fn ensure_schema_migrations_table(connection: &Connection) -> Result<()> {
    connection
        .execute_batch(
            "CREATE TABLE IF NOT EXISTS schema_migrations (
                version INTEGER PRIMARY KEY,
                name TEXT NOT NULL,
                applied_at_unix INTEGER NOT NULL
            );",
        )
        .context("failed to create schema_migrations table")
}

fn apply_migration(connection: &Connection, migration: &Migration) -> Result<()> {
    crate::store::within_savepoint(connection, "migration_apply", || {
        connection
            .execute_batch(migration.sql)
            .with_context(|| format!("SQL execution failed for v{:03}", migration.version))?;
        connection
            .execute(
                "INSERT INTO schema_migrations (version, name, applied_at_unix) VALUES (?1, ?2, ?3)",
                params![
                    i64::from(migration.version),
                    migration.name,
                    chrono::Utc::now().timestamp(),
                ],
            )
            .context("failed to record migration")?;
        Ok(())
    })
}

fn ensure_db_parent(paths: &ResolvedPaths) -> Result<()> {
    let parent = paths
        .db_path
        .parent()
        .ok_or_else(|| anyhow::anyhow!("db path has no parent: {}", paths.db_path.display()))?;
    fs::create_dir_all(parent).with_context(|| {
        format!(
            "failed to create database parent directory {}",
            parent.display()
        )
    })
}

#[cfg(test)]
pub(crate) fn memory_db() -> Connection {
    let connection = Connection::open_in_memory().expect("open in-memory db");
    connection
        .pragma_update(None, "foreign_keys", "ON")
        .expect("foreign keys");
    migrate_connection(&connection).expect("migrate");
    connection
}
