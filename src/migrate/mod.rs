use anyhow::{Context, Result};
use sqlx::postgres::PgPool;
use sqlx::Row;

/// Embedded SQL migration with version, direction, and content.
struct Migration {
    version: u32,
    up_sql: &'static str,
    down_sql: &'static str,
}

/// All embedded migrations, ordered by version.
static MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        up_sql: include_str!("sql/001_init.up.sql"),
        down_sql: include_str!("sql/001_init.down.sql"),
    },
    Migration {
        version: 2,
        up_sql: include_str!("sql/002_reduction_runs.up.sql"),
        down_sql: include_str!("sql/002_reduction_runs.down.sql"),
    },
    Migration {
        version: 3,
        up_sql: include_str!("sql/003_default_tables.up.sql"),
        down_sql: include_str!("sql/003_default_tables.down.sql"),
    },
];

/// Manages PostgreSQL schema migrations.
///
/// Compatible with golang-migrate's `schema_migrations` table format.
/// Embeds SQL files from `src/migrate/sql/` and applies them in order.
pub trait Migrator: Send {
    /// Applies all pending forward migrations.
    fn up(&self) -> impl std::future::Future<Output = Result<()>> + Send;

    /// Rolls back the last applied migration.
    fn down(&self) -> impl std::future::Future<Output = Result<()>> + Send;

    /// Returns the current migration version and dirty flag.
    fn status(&self) -> impl std::future::Future<Output = Result<(u32, bool)>> + Send;
}

/// PostgreSQL migration runner.
pub struct PgMigrator {
    pool: PgPool,
}

impl PgMigrator {
    /// Creates a new migrator using the given connection pool.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Ensures the schema_migrations tracking table exists.
    async fn ensure_migrations_table(&self) -> Result<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS schema_migrations (
                version bigint NOT NULL PRIMARY KEY,
                dirty boolean NOT NULL
            )",
        )
        .execute(&self.pool)
        .await
        .context("creating schema_migrations table")?;

        Ok(())
    }

    /// Returns the current migration version and dirty state.
    async fn current_version(&self) -> Result<(u32, bool)> {
        let row = sqlx::query("SELECT version, dirty FROM schema_migrations LIMIT 1")
            .fetch_optional(&self.pool)
            .await
            .context("querying migration version")?;

        match row {
            Some(row) => {
                let version: i64 = row.try_get("version").context("reading version")?;
                let dirty: bool = row.try_get("dirty").context("reading dirty flag")?;
                Ok((version as u32, dirty))
            }
            None => Ok((0, false)),
        }
    }

    /// Sets the migration version in the tracking table.
    async fn set_version(&self, version: u32, dirty: bool) -> Result<()> {
        let mut tx = self
            .pool
            .begin()
            .await
            .context("opening version transaction")?;

        // Single-row table, replaced wholesale (matches golang-migrate behavior).
        sqlx::query("TRUNCATE schema_migrations")
            .execute(&mut *tx)
            .await
            .context("truncating schema_migrations")?;

        sqlx::query("INSERT INTO schema_migrations (version, dirty) VALUES ($1, $2)")
            .bind(i64::from(version))
            .bind(dirty)
            .execute(&mut *tx)
            .await
            .context("inserting migration version")?;

        tx.commit().await.context("committing version update")?;

        Ok(())
    }

    /// Splits a SQL string into individual statements and executes each.
    async fn execute_sql(&self, sql: &str) -> Result<()> {
        for statement in split_statements(sql) {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .with_context(|| {
                    let preview: String = statement.chars().take(80).collect();
                    format!("executing migration statement: {preview}...")
                })?;
        }

        Ok(())
    }
}

impl Migrator for PgMigrator {
    async fn up(&self) -> Result<()> {
        self.ensure_migrations_table().await?;

        let (current_version, dirty) = self.current_version().await?;

        if dirty {
            anyhow::bail!(
                "migration version {current_version} is dirty, manual intervention required"
            );
        }

        tracing::info!(current_version, "running migrations");

        let mut applied = 0u32;

        for migration in MIGRATIONS {
            if migration.version <= current_version {
                continue;
            }

            tracing::info!(version = migration.version, "applying migration");

            // Mark as dirty before applying.
            self.set_version(migration.version, true).await?;

            // Execute the migration SQL.
            self.execute_sql(migration.up_sql)
                .await
                .with_context(|| format!("applying migration version {}", migration.version))?;

            // Mark as clean.
            self.set_version(migration.version, false).await?;

            applied += 1;
        }

        if applied == 0 {
            tracing::info!("no pending migrations");
        } else {
            let (final_version, _) = self.current_version().await?;
            tracing::info!(version = final_version, applied, "migrations completed");
        }

        Ok(())
    }

    async fn down(&self) -> Result<()> {
        self.ensure_migrations_table().await?;

        let (current_version, _) = self.current_version().await?;

        if current_version == 0 {
            tracing::info!("no migrations to roll back");
            return Ok(());
        }

        // Find the migration matching current version.
        let migration = MIGRATIONS
            .iter()
            .find(|m| m.version == current_version)
            .with_context(|| format!("migration version {current_version} not found"))?;

        tracing::info!(version = current_version, "rolling back migration");

        // Mark as dirty.
        self.set_version(current_version, true).await?;

        // Execute the down SQL.
        self.execute_sql(migration.down_sql)
            .await
            .with_context(|| format!("rolling back migration version {current_version}"))?;

        // Set version to previous migration.
        let prev_version = MIGRATIONS
            .iter()
            .filter(|m| m.version < current_version)
            .map(|m| m.version)
            .max()
            .unwrap_or(0);

        if prev_version == 0 {
            // No previous version, clear the tracking table.
            sqlx::query("TRUNCATE schema_migrations")
                .execute(&self.pool)
                .await
                .context("truncating schema_migrations after rollback")?;
        } else {
            self.set_version(prev_version, false).await?;
        }

        tracing::info!(version = prev_version, "rollback completed");

        Ok(())
    }

    async fn status(&self) -> Result<(u32, bool)> {
        self.ensure_migrations_table().await?;
        self.current_version().await
    }
}

/// Splits SQL text into individual statements by semicolons.
///
/// Handles empty lines, comments, and whitespace-only segments.
fn split_statements(sql: &str) -> Vec<&str> {
    sql.split(';')
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .collect()
}
