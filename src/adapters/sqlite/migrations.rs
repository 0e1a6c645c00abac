//! Embedded schema migrations.

use sqlx::SqlitePool;
use thiserror::Error;

/// Errors applying schema migrations.
#[derive(Debug, Error)]
pub enum MigrationError {
    /// A migration script failed
    #[error("Failed to execute migration {version}: {source}")]
    ExecutionError {
        /// Migration version
        version: i64,
        /// Underlying error
        #[source]
        source: sqlx::Error,
    },
    /// Could not read the applied versions
    #[error("Failed to get schema version: {0}")]
    VersionCheckError(#[source] sqlx::Error),
}

/// One embedded schema migration.
#[derive(Debug, Clone)]
pub struct Migration {
    /// Monotonic version, recorded once applied
    pub version: i64,
    /// Short label stored alongside the version
    pub description: &'static str,
    /// Statements to execute
    pub sql: &'static str,
}

/// Applies pending migrations and tracks the applied versions.
pub struct Migrator {
    pool: SqlitePool,
}

impl Migrator {
    /// Migrator over `pool`.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Apply every migration newer than the recorded version, in order.
    /// Returns the number applied.
    pub async fn run(&self, migrations: &[Migration]) -> Result<usize, MigrationError> {
        self.ensure_migrations_table().await?;
        let current_version = self.current_version().await?;

        let mut applied = 0;
        for migration in migrations.iter().filter(|m| m.version > current_version) {
            self.apply(migration).await?;
            applied += 1;
        }
        if applied > 0 {
            tracing::info!(applied, "applied schema migrations");
        }
        Ok(applied)
    }

    async fn ensure_migrations_table(&self) -> Result<(), MigrationError> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS schema_migrations (
                version INTEGER PRIMARY KEY,
                applied_at TEXT NOT NULL DEFAULT (datetime('now')),
                description TEXT
            )",
        )
        .execute(&self.pool)
        .await
        .map_err(|e| MigrationError::ExecutionError { version: 0, source: e })?;
        Ok(())
    }

    /// Highest applied version, 0 on a fresh database.
    pub async fn current_version(&self) -> Result<i64, MigrationError> {
        let (version,): (i64,) =
            sqlx::query_as("SELECT COALESCE(MAX(version), 0) FROM schema_migrations")
                .fetch_one(&self.pool)
                .await
                .map_err(MigrationError::VersionCheckError)?;
        Ok(version)
    }

    async fn apply(&self, migration: &Migration) -> Result<(), MigrationError> {
        let failed = |source| MigrationError::ExecutionError {
            version: migration.version,
            source,
        };

        let mut tx = self.pool.begin().await.map_err(failed)?;
        for statement in statements(migration.sql) {
            sqlx::query(statement).execute(&mut *tx).await.map_err(failed)?;
        }
        sqlx::query("INSERT INTO schema_migrations (version, description) VALUES (?, ?)")
            .bind(migration.version)
            .bind(migration.description)
            .execute(&mut *tx)
            .await
            .map_err(failed)?;
        tx.commit().await.map_err(failed)
    }
}

/// Split a migration file into statements, dropping comment-only chunks.
fn statements(sql: &str) -> impl Iterator<Item = &str> {
    sql.split(';').map(str::trim).filter(|chunk| {
        chunk
            .lines()
            .any(|line| !line.trim().is_empty() && !line.trim_start().starts_with("--"))
    })
}

/// Migrations compiled into the binary, oldest first.
pub fn all_embedded_migrations() -> Vec<Migration> {
    vec![Migration {
        version: 1,
        description: "Initial scheduler schema",
        sql: include_str!("../../../migrations/001_initial_schema.sql"),
    }]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::sqlite::create_test_pool;

    #[test]
    fn test_statements_skip_comments() {
        let sql = "-- header\n\nCREATE TABLE a (id TEXT);\n-- trailing\n";
        let parsed: Vec<_> = statements(sql).collect();
        assert_eq!(parsed.len(), 1);
        assert!(parsed[0].ends_with("CREATE TABLE a (id TEXT)"));
    }

    #[tokio::test]
    async fn test_migrations_are_recorded_and_idempotent() {
        let pool = create_test_pool().await.unwrap();
        let migrator = Migrator::new(pool);
        let migrations = all_embedded_migrations();

        assert_eq!(migrator.run(&migrations).await.unwrap(), 1);
        assert_eq!(migrator.current_version().await.unwrap(), 1);
        assert_eq!(migrator.run(&migrations).await.unwrap(), 0);
    }
}
