use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{SqliteConnection, SqlitePool};

use lavapos_core::ncf::{NcfRange, RangeLedger, SeriesType};

use crate::{compare_and_advance, select_active_range, NcfRangeError};

/// Ledger whose reads and conditional advances run as independent statements on the pool.
///
/// Used for standalone allocations; the compare-and-swap in
/// [`RangeLedger::advance`] is what keeps concurrent callers apart.
/// Advances stamp `updated_at` with the time given at construction.
#[derive(Clone)]
pub struct PoolLedger {
    pool: SqlitePool,
    now: DateTime<Utc>,
}

impl PoolLedger {
    pub fn new(pool: SqlitePool, now: DateTime<Utc>) -> Self {
        Self { pool, now }
    }
}

#[async_trait]
impl RangeLedger for PoolLedger {
    type Error = NcfRangeError;

    async fn active_range(
        &mut self,
        series_type: SeriesType,
    ) -> Result<Option<NcfRange>, Self::Error> {
        select_active_range(&self.pool, series_type).await
    }

    async fn advance(
        &mut self,
        range_id: i64,
        expected: i64,
        next: i64,
    ) -> Result<bool, Self::Error> {
        compare_and_advance(&self.pool, range_id, expected, next, self.now).await
    }
}

/// Ledger bound to the connection of an open transaction.
///
/// The advance only becomes visible when the caller commits, and is discarded
/// with everything else on rollback.
pub struct TxLedger<'t> {
    conn: &'t mut SqliteConnection,
    now: DateTime<Utc>,
}

impl<'t> TxLedger<'t> {
    pub fn new(conn: &'t mut SqliteConnection, now: DateTime<Utc>) -> Self {
        Self { conn, now }
    }
}

#[async_trait]
impl<'t> RangeLedger for TxLedger<'t> {
    type Error = NcfRangeError;

    async fn active_range(
        &mut self,
        series_type: SeriesType,
    ) -> Result<Option<NcfRange>, Self::Error> {
        select_active_range(&mut *self.conn, series_type).await
    }

    async fn advance(
        &mut self,
        range_id: i64,
        expected: i64,
        next: i64,
    ) -> Result<bool, Self::Error> {
        compare_and_advance(&mut *self.conn, range_id, expected, next, self.now).await
    }
}
