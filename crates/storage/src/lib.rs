use std::{str::FromStr, time::Duration};

use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::{
    migrate::MigrateError,
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous},
    Executor, Sqlite, SqlitePool,
};
use thiserror::Error;

use lavapos_core::ncf::{
    NcfConfig, NcfRange, NewNcfRange, RangeValidationError, SeriesType, UnknownSeriesType,
};

mod ledger;
mod orders;

pub use ledger::{PoolLedger, TxLedger};
pub use orders::{Delivery, OrderError, OrderRepository};

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Top-level database handle that owns the SQLite connection pool.
#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Establishes a new SQLite connection pool for the provided connection string.
    ///
    /// Every pooled connection runs in WAL mode with foreign keys enabled and a
    /// busy timeout, so concurrent writers wait instead of failing fast.
    pub async fn connect(database_url: &str) -> Result<Self, StorageError> {
        let options = SqliteConnectOptions::from_str(database_url)
            .map_err(StorageError::Connect)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .foreign_keys(true)
            .busy_timeout(BUSY_TIMEOUT);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(StorageError::Connect)?;

        Ok(Self { pool })
    }

    /// Applies migrations located under `migrations/`.
    pub async fn run_migrations(&self) -> Result<(), StorageError> {
        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await
            .map_err(StorageError::Migration)?;
        Ok(())
    }

    /// Returns a handle for NCF range administration and allocation.
    pub fn ncf_ranges(&self) -> NcfRangeRepository {
        NcfRangeRepository {
            pool: self.pool.clone(),
        }
    }

    /// Returns a handle for the persisted NCF configuration.
    pub fn ncf_config(&self) -> NcfConfigRepository {
        NcfConfigRepository {
            pool: self.pool.clone(),
        }
    }

    /// Returns a handle to operate on orders.
    pub fn orders(&self) -> OrderRepository {
        OrderRepository::new(self.pool.clone())
    }

    /// Exposes the inner pool when lower level access is required.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

/// General storage level errors.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("failed to connect to sqlite: {0}")]
    Connect(sqlx::Error),
    #[error("failed to run database migrations: {0}")]
    Migration(MigrateError),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

macro_rules! select_ranges {
    ($tail:literal) => {
        concat!(
            "SELECT id, series_type, prefix, series, initial_number, last_number, current_number, \
             is_active, created_at, updated_at FROM ncf_ranges ",
            $tail
        )
    };
}

const RANGE_RETURNING: &str = " RETURNING id, series_type, prefix, series, initial_number, \
     last_number, current_number, is_active, created_at, updated_at";

/// Repository over the `ncf_ranges` table.
///
/// Administrative writes never touch `current_number`; only the ledgers do.
#[derive(Clone)]
pub struct NcfRangeRepository {
    pool: SqlitePool,
}

impl NcfRangeRepository {
    /// Lists all ranges, grouped by series type.
    pub async fn list(&self) -> Result<Vec<NcfRange>, NcfRangeError> {
        let rows = sqlx::query_as::<_, NcfRangeRow>(select_ranges!(
            "ORDER BY series_type ASC, id ASC"
        ))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(NcfRangeRow::into_domain).collect()
    }

    /// Loads a single range.
    pub async fn fetch(&self, id: i64) -> Result<NcfRange, NcfRangeError> {
        sqlx::query_as::<_, NcfRangeRow>(select_ranges!("WHERE id = ?"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(NcfRangeError::NotFound(id))?
            .into_domain()
    }

    /// Stores a new range with `current_number = initial_number`.
    ///
    /// An active range replaces the previously active range of its series type.
    pub async fn create(
        &self,
        range: &NewNcfRange,
        now: DateTime<Utc>,
    ) -> Result<NcfRange, NcfRangeError> {
        range.validate()?;
        let timestamp = to_rfc3339(now);
        let mut tx = self.pool.begin().await?;

        if range.is_active {
            sqlx::query(
                "UPDATE ncf_ranges SET is_active = 0, updated_at = ? \
                 WHERE series_type = ? AND is_active = 1",
            )
            .bind(&timestamp)
            .bind(range.series_type.as_str())
            .execute(&mut *tx)
            .await?;
        }

        let sql = format!(
            "INSERT INTO ncf_ranges \
             (series_type, prefix, series, initial_number, last_number, current_number, is_active, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?){RANGE_RETURNING}"
        );
        let row = sqlx::query_as::<_, NcfRangeRow>(&sql)
            .bind(range.series_type.as_str())
            .bind(&range.prefix)
            .bind(&range.series)
            .bind(range.initial_number)
            .bind(range.last_number)
            .bind(range.initial_number)
            .bind(range.is_active)
            .bind(&timestamp)
            .bind(&timestamp)
            .fetch_one(&mut *tx)
            .await
            .map_err(map_range_write_error)?;

        let created = row.into_domain()?;
        tx.commit().await?;
        Ok(created)
    }

    /// Activates or deactivates a range.
    ///
    /// Activation deactivates whichever range of the same series type was
    /// active, inside the same transaction. Exhausted ranges cannot be activated.
    pub async fn set_active(
        &self,
        id: i64,
        active: bool,
        now: DateTime<Utc>,
    ) -> Result<NcfRange, NcfRangeError> {
        let timestamp = to_rfc3339(now);
        let mut tx = self.pool.begin().await?;

        if active {
            sqlx::query(
                "UPDATE ncf_ranges SET is_active = 0, updated_at = ? \
                 WHERE is_active = 1 AND id != ? \
                   AND series_type = (SELECT series_type FROM ncf_ranges WHERE id = ?)",
            )
            .bind(&timestamp)
            .bind(id)
            .bind(id)
            .execute(&mut *tx)
            .await?;
        }

        let sql =
            format!("UPDATE ncf_ranges SET is_active = ?, updated_at = ? WHERE id = ?{RANGE_RETURNING}");
        let row = sqlx::query_as::<_, NcfRangeRow>(&sql)
            .bind(active)
            .bind(&timestamp)
            .bind(id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(map_range_write_error)?
            .ok_or(NcfRangeError::NotFound(id))?;

        let range = row.into_domain()?;
        if active && range.is_exhausted() {
            tx.rollback().await?;
            return Err(NcfRangeError::Exhausted(id));
        }

        tx.commit().await?;
        Ok(range)
    }

    /// Returns a ledger that runs each allocation step as its own statement on the pool.
    pub fn ledger(&self, now: DateTime<Utc>) -> PoolLedger {
        PoolLedger::new(self.pool.clone(), now)
    }
}

pub(crate) async fn select_active_range<'e, E>(
    executor: E,
    series_type: SeriesType,
) -> Result<Option<NcfRange>, NcfRangeError>
where
    E: Executor<'e, Database = Sqlite>,
{
    let row = sqlx::query_as::<_, NcfRangeRow>(select_ranges!(
        "WHERE series_type = ? AND is_active = 1 ORDER BY id ASC LIMIT 1"
    ))
    .bind(series_type.as_str())
    .fetch_optional(executor)
    .await?;

    row.map(NcfRangeRow::into_domain).transpose()
}

/// Conditional counter update backing [`lavapos_core::ncf::RangeLedger::advance`].
pub(crate) async fn compare_and_advance<'e, E>(
    executor: E,
    range_id: i64,
    expected: i64,
    next: i64,
    now: DateTime<Utc>,
) -> Result<bool, NcfRangeError>
where
    E: Executor<'e, Database = Sqlite>,
{
    let result = sqlx::query(
        "UPDATE ncf_ranges SET current_number = ?, updated_at = ? \
         WHERE id = ? AND current_number = ? AND is_active = 1 AND current_number <= last_number",
    )
    .bind(next)
    .bind(to_rfc3339(now))
    .bind(range_id)
    .bind(expected)
    .execute(executor)
    .await?;

    Ok(result.rows_affected() == 1)
}

fn map_range_write_error(err: sqlx::Error) -> NcfRangeError {
    match err {
        sqlx::Error::Database(db_err) if db_err.code().as_deref() == Some("2067") => {
            NcfRangeError::ActiveConflict
        }
        other => NcfRangeError::Database(other),
    }
}

/// Raw `ncf_ranges` row.
#[derive(Debug, sqlx::FromRow)]
struct NcfRangeRow {
    id: i64,
    series_type: String,
    prefix: String,
    series: String,
    initial_number: i64,
    last_number: i64,
    current_number: i64,
    is_active: bool,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl NcfRangeRow {
    fn into_domain(self) -> Result<NcfRange, NcfRangeError> {
        Ok(NcfRange {
            id: self.id,
            series_type: self.series_type.parse()?,
            prefix: self.prefix,
            series: self.series,
            initial_number: self.initial_number,
            last_number: self.last_number,
            current_number: self.current_number,
            is_active: self.is_active,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

/// Errors raised by range administration and the ledgers.
#[derive(Debug, Error)]
pub enum NcfRangeError {
    #[error("ncf range {0} not found")]
    NotFound(i64),
    #[error("ncf range {0} is exhausted and cannot be activated")]
    Exhausted(i64),
    #[error("another range is already active for this series type")]
    ActiveConflict,
    #[error(transparent)]
    Invalid(#[from] RangeValidationError),
    #[error("stored range is corrupt: {0}")]
    Corrupt(#[from] UnknownSeriesType),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Repository for the single-row `ncf_config` table.
#[derive(Clone)]
pub struct NcfConfigRepository {
    pool: SqlitePool,
}

impl NcfConfigRepository {
    /// Loads the current configuration, falling back to defaults when the row is missing.
    pub async fn fetch(&self) -> Result<NcfConfig, NcfConfigError> {
        let row = sqlx::query_as::<_, NcfConfigRow>(
            "SELECT enabled, default_series_type, low_stock_threshold FROM ncf_config WHERE id = 1",
        )
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => row.into_domain(),
            None => Ok(NcfConfig::default()),
        }
    }

    /// Replaces the configuration.
    pub async fn update(
        &self,
        config: &NcfConfig,
        now: DateTime<Utc>,
    ) -> Result<NcfConfig, NcfConfigError> {
        if config.low_stock_threshold < 0 {
            return Err(NcfConfigError::NegativeThreshold(config.low_stock_threshold));
        }

        let row = sqlx::query_as::<_, NcfConfigRow>(
            "INSERT INTO ncf_config (id, enabled, default_series_type, low_stock_threshold, updated_at) \
             VALUES (1, ?, ?, ?, ?) \
             ON CONFLICT(id) DO UPDATE SET \
                 enabled = excluded.enabled, \
                 default_series_type = excluded.default_series_type, \
                 low_stock_threshold = excluded.low_stock_threshold, \
                 updated_at = excluded.updated_at \
             RETURNING enabled, default_series_type, low_stock_threshold",
        )
        .bind(config.enabled)
        .bind(config.default_series_type.as_str())
        .bind(config.low_stock_threshold)
        .bind(to_rfc3339(now))
        .fetch_one(&self.pool)
        .await?;

        row.into_domain()
    }
}

#[derive(Debug, sqlx::FromRow)]
struct NcfConfigRow {
    enabled: bool,
    default_series_type: String,
    low_stock_threshold: i64,
}

impl NcfConfigRow {
    fn into_domain(self) -> Result<NcfConfig, NcfConfigError> {
        Ok(NcfConfig {
            enabled: self.enabled,
            default_series_type: self.default_series_type.parse()?,
            low_stock_threshold: self.low_stock_threshold,
        })
    }
}

/// Errors that can occur while reading or writing the NCF configuration.
#[derive(Debug, Error)]
pub enum NcfConfigError {
    #[error("low_stock_threshold must not be negative (got {0})")]
    NegativeThreshold(i64),
    #[error("stored config is corrupt: {0}")]
    Corrupt(#[from] UnknownSeriesType),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

pub(crate) fn to_rfc3339(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Millis, true)
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use tempfile::TempDir;

    /// File-backed database in a temporary directory; dropped with the guard.
    pub struct TestDb {
        pub db: Database,
        _dir: TempDir,
    }

    pub async fn setup_db() -> TestDb {
        let dir = TempDir::new().expect("tempdir");
        let url = format!("sqlite://{}", dir.path().join("lavapos.db").display());
        let db = Database::connect(&url).await.expect("connect");
        db.run_migrations().await.expect("migrations");
        TestDb { db, _dir: dir }
    }

    pub fn new_range(series_type: SeriesType, initial: i64, last: i64) -> NewNcfRange {
        NewNcfRange {
            series_type,
            prefix: series_type.as_str().to_string(),
            series: "00000".to_string(),
            initial_number: initial,
            last_number: last,
            is_active: true,
        }
    }

    pub async fn force_current(db: &Database, id: i64, current: i64) {
        sqlx::query("UPDATE ncf_ranges SET current_number = ? WHERE id = ?")
            .bind(current)
            .bind(id)
            .execute(db.pool())
            .await
            .expect("force current");
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;

    #[tokio::test]
    async fn migrations_apply() {
        let ctx = setup_db().await;
        let tables: (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' \
             AND name IN ('ncf_ranges', 'ncf_config', 'orders')",
        )
        .fetch_one(ctx.db.pool())
        .await
        .expect("fetch tables");
        assert_eq!(tables.0, 3, "expected core tables to be created");
    }

    #[tokio::test]
    async fn create_starts_at_initial_number() {
        let ctx = setup_db().await;
        let range = ctx
            .db
            .ncf_ranges()
            .create(&new_range(SeriesType::FinalConsumer, 50, 60), Utc::now())
            .await
            .expect("create");

        assert_eq!(range.current_number, 50);
        assert_eq!(range.remaining(), 11);
        assert!(range.is_active);

        let fetched = ctx.db.ncf_ranges().fetch(range.id).await.expect("fetch");
        assert_eq!(fetched, range);
    }

    #[tokio::test]
    async fn create_rejects_invalid_range() {
        let ctx = setup_db().await;
        let err = ctx
            .db
            .ncf_ranges()
            .create(&new_range(SeriesType::FinalConsumer, 10, 5), Utc::now())
            .await
            .expect_err("inverted bounds");
        assert!(matches!(
            err,
            NcfRangeError::Invalid(RangeValidationError::InvertedBounds { .. })
        ));
        assert!(ctx.db.ncf_ranges().list().await.expect("list").is_empty());
    }

    #[tokio::test]
    async fn keeps_one_active_range_per_series() {
        let ctx = setup_db().await;
        let repo = ctx.db.ncf_ranges();
        let first = repo
            .create(&new_range(SeriesType::TaxCredit, 1, 10), Utc::now())
            .await
            .expect("first");
        let second = repo
            .create(&new_range(SeriesType::TaxCredit, 11, 20), Utc::now())
            .await
            .expect("second");
        let other = repo
            .create(&new_range(SeriesType::FinalConsumer, 1, 10), Utc::now())
            .await
            .expect("other series");

        let ranges = repo.list().await.expect("list");
        let active: Vec<i64> = ranges
            .iter()
            .filter(|range| range.is_active)
            .map(|range| range.id)
            .collect();
        assert_eq!(active.len(), 2);
        assert!(active.contains(&second.id));
        assert!(active.contains(&other.id));

        let reactivated = repo
            .set_active(first.id, true, Utc::now())
            .await
            .expect("reactivate");
        assert!(reactivated.is_active);
        let second = repo.fetch(second.id).await.expect("fetch second");
        assert!(!second.is_active);
        assert!(repo.fetch(other.id).await.expect("fetch other").is_active);
    }

    #[tokio::test]
    async fn exhausted_range_cannot_be_activated() {
        let ctx = setup_db().await;
        let repo = ctx.db.ncf_ranges();
        let exhausted = repo
            .create(&new_range(SeriesType::Government, 1, 1), Utc::now())
            .await
            .expect("create");
        force_current(&ctx.db, exhausted.id, 2).await;
        let replacement = repo
            .create(&new_range(SeriesType::Government, 2, 10), Utc::now())
            .await
            .expect("replacement");

        let err = repo
            .set_active(exhausted.id, true, Utc::now())
            .await
            .expect_err("exhausted");
        assert!(matches!(err, NcfRangeError::Exhausted(id) if id == exhausted.id));
        assert!(repo.fetch(replacement.id).await.expect("fetch").is_active);
    }

    #[tokio::test]
    async fn set_active_reports_missing_range() {
        let ctx = setup_db().await;
        let err = ctx
            .db
            .ncf_ranges()
            .set_active(404, false, Utc::now())
            .await
            .expect_err("missing");
        assert!(matches!(err, NcfRangeError::NotFound(404)));
    }

    #[tokio::test]
    async fn config_defaults_and_updates() {
        let ctx = setup_db().await;
        let repo = ctx.db.ncf_config();
        let config = repo.fetch().await.expect("fetch");
        assert_eq!(config, NcfConfig::default());

        let updated = repo
            .update(
                &NcfConfig {
                    enabled: false,
                    default_series_type: SeriesType::TaxCredit,
                    low_stock_threshold: 5,
                },
                Utc::now(),
            )
            .await
            .expect("update");
        assert!(!updated.enabled);
        assert_eq!(repo.fetch().await.expect("fetch"), updated);

        let err = repo
            .update(
                &NcfConfig {
                    low_stock_threshold: -1,
                    ..updated
                },
                Utc::now(),
            )
            .await
            .expect_err("negative threshold");
        assert!(matches!(err, NcfConfigError::NegativeThreshold(-1)));
    }
}
