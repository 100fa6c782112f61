use chrono::{DateTime, Utc};
use sqlx::{Executor, Sqlite, SqlitePool};
use thiserror::Error;
use uuid::Uuid;

use lavapos_core::ncf::{Allocation, AllocationError, NcfAllocator, SeriesType};
use lavapos_core::order::{NewOrder, Order, OrderStatus, OrderValidationError};

use crate::{to_rfc3339, TxLedger};

const ORDER_COLUMNS: &str = "id, branch_id, customer_name, total_cents, status, ncf, \
     ncf_series_type, created_at, updated_at, delivered_at";

/// Repository for laundry orders and their delivery.
#[derive(Clone)]
pub struct OrderRepository {
    pool: SqlitePool,
}

impl OrderRepository {
    pub(crate) fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Inserts a new order in `RECEIVED` status.
    pub async fn insert(&self, order: &NewOrder, now: DateTime<Utc>) -> Result<Order, OrderError> {
        order.validate()?;
        let timestamp = to_rfc3339(now);
        let sql = format!(
            "INSERT INTO orders (id, branch_id, customer_name, total_cents, status, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?) RETURNING {ORDER_COLUMNS}"
        );
        let row = sqlx::query_as::<_, OrderRow>(&sql)
            .bind(Uuid::new_v4().to_string())
            .bind(order.branch_id.trim())
            .bind(order.customer_name.trim())
            .bind(order.total_cents)
            .bind(OrderStatus::Received.as_str())
            .bind(&timestamp)
            .bind(&timestamp)
            .fetch_one(&self.pool)
            .await?;

        row.into_domain()
    }

    /// Loads an order by id.
    pub async fn fetch(&self, id: &str) -> Result<Order, OrderError> {
        fetch_order(&self.pool, id)
            .await?
            .ok_or(OrderError::NotFound)
    }

    /// Moves an order to `READY` or `CANCELLED`.
    ///
    /// Delivery goes through [`OrderRepository::deliver`] because it may issue an NCF.
    pub async fn update_status(
        &self,
        id: &str,
        next: OrderStatus,
        now: DateTime<Utc>,
    ) -> Result<Order, OrderError> {
        if matches!(next, OrderStatus::Delivered | OrderStatus::Received) {
            return Err(OrderError::UnsupportedStatus(next));
        }

        let sources = OrderStatus::sources_for(next);
        let placeholders = vec!["?"; sources.len()].join(", ");
        let sql = format!(
            "UPDATE orders SET status = ?, updated_at = ? \
             WHERE id = ? AND status IN ({placeholders}) RETURNING {ORDER_COLUMNS}"
        );
        let mut query = sqlx::query_as::<_, OrderRow>(&sql)
            .bind(next.as_str())
            .bind(to_rfc3339(now))
            .bind(id);
        for source in sources {
            query = query.bind(source.as_str());
        }

        match query.fetch_optional(&self.pool).await? {
            Some(row) => row.into_domain(),
            None => Err(self.transition_error(id, next).await),
        }
    }

    /// Marks an order delivered, issuing a receipt number when `series_type` is given.
    ///
    /// The status change and the allocation share one transaction: if no
    /// number can be issued the order keeps its previous status and the range
    /// counter is untouched.
    pub async fn deliver(
        &self,
        allocator: &NcfAllocator,
        id: &str,
        series_type: Option<SeriesType>,
        now: DateTime<Utc>,
    ) -> Result<Delivery, OrderError> {
        let timestamp = to_rfc3339(now);
        let mut tx = self.pool.begin().await?;

        let claimed = sqlx::query(
            "UPDATE orders SET status = ?, delivered_at = ?, updated_at = ? \
             WHERE id = ? AND status IN (?, ?)",
        )
        .bind(OrderStatus::Delivered.as_str())
        .bind(&timestamp)
        .bind(&timestamp)
        .bind(id)
        .bind(OrderStatus::Received.as_str())
        .bind(OrderStatus::Ready.as_str())
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if claimed == 0 {
            tx.rollback().await?;
            return Err(self.transition_error(id, OrderStatus::Delivered).await);
        }

        let allocation = match series_type {
            Some(series_type) => {
                let mut ledger = TxLedger::new(&mut *tx, now);
                match allocator.allocate_next(&mut ledger, series_type).await {
                    Ok(allocation) => Some(allocation),
                    Err(err) => {
                        tx.rollback().await?;
                        return Err(err.into());
                    }
                }
            }
            None => None,
        };

        if let Some(allocation) = &allocation {
            sqlx::query("UPDATE orders SET ncf = ?, ncf_series_type = ? WHERE id = ?")
                .bind(allocation.number.as_str())
                .bind(allocation.series_type.as_str())
                .bind(id)
                .execute(&mut *tx)
                .await?;
        }

        let order = fetch_order(&mut *tx, id)
            .await?
            .ok_or(OrderError::NotFound)?;
        tx.commit().await?;

        Ok(Delivery { order, allocation })
    }

    async fn transition_error(&self, id: &str, next: OrderStatus) -> OrderError {
        match self.fetch(id).await {
            Ok(order) => OrderError::InvalidTransition {
                from: order.status,
                to: next,
            },
            Err(err) => err,
        }
    }
}

async fn fetch_order<'e, E>(executor: E, id: &str) -> Result<Option<Order>, OrderError>
where
    E: Executor<'e, Database = Sqlite>,
{
    let sql = format!("SELECT {ORDER_COLUMNS} FROM orders WHERE id = ?");
    let row = sqlx::query_as::<_, OrderRow>(&sql)
        .bind(id)
        .fetch_optional(executor)
        .await?;

    row.map(OrderRow::into_domain).transpose()
}

/// Outcome of a successful delivery.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub order: Order,
    pub allocation: Option<Allocation>,
}

#[derive(Debug, sqlx::FromRow)]
struct OrderRow {
    id: String,
    branch_id: String,
    customer_name: String,
    total_cents: i64,
    status: String,
    ncf: Option<String>,
    ncf_series_type: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    delivered_at: Option<DateTime<Utc>>,
}

impl OrderRow {
    fn into_domain(self) -> Result<Order, OrderError> {
        let status = OrderStatus::parse(&self.status)
            .ok_or_else(|| OrderError::Corrupt(format!("unknown status {}", self.status)))?;
        let ncf_series_type = self
            .ncf_series_type
            .as_deref()
            .map(str::parse::<SeriesType>)
            .transpose()
            .map_err(|err| OrderError::Corrupt(err.to_string()))?;

        Ok(Order {
            id: self.id,
            branch_id: self.branch_id,
            customer_name: self.customer_name,
            total_cents: self.total_cents,
            status,
            ncf: self.ncf,
            ncf_series_type,
            created_at: self.created_at,
            updated_at: self.updated_at,
            delivered_at: self.delivered_at,
        })
    }
}

/// Errors that can occur while working with orders.
#[derive(Debug, Error)]
pub enum OrderError {
    #[error("order not found")]
    NotFound,
    #[error("order cannot move from {from} to {to}")]
    InvalidTransition { from: OrderStatus, to: OrderStatus },
    #[error("status {0} cannot be set directly")]
    UnsupportedStatus(OrderStatus),
    #[error(transparent)]
    Invalid(#[from] OrderValidationError),
    #[error("failed to issue receipt number: {0}")]
    Allocation(#[from] AllocationError),
    #[error("stored order is corrupt: {0}")]
    Corrupt(String),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}
