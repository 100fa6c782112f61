use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::ncf::SeriesType;

/// Laundry order as tracked through intake and delivery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Order {
    pub id: String,
    pub branch_id: String,
    pub customer_name: String,
    pub total_cents: i64,
    pub status: OrderStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ncf: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ncf_series_type: Option<SeriesType>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delivered_at: Option<DateTime<Utc>>,
}

/// Order status persisted in the database.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    Received,
    Ready,
    Delivered,
    Cancelled,
}

impl OrderStatus {
    /// Returns the canonical database representation for the status.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Received => "RECEIVED",
            Self::Ready => "READY",
            Self::Delivered => "DELIVERED",
            Self::Cancelled => "CANCELLED",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "RECEIVED" => Some(Self::Received),
            "READY" => Some(Self::Ready),
            "DELIVERED" => Some(Self::Delivered),
            "CANCELLED" => Some(Self::Cancelled),
            _ => None,
        }
    }

    /// Statuses an order may be in for a transition to `next` to be legal.
    pub fn sources_for(next: OrderStatus) -> &'static [OrderStatus] {
        match next {
            Self::Ready => &[Self::Received],
            Self::Delivered | Self::Cancelled => &[Self::Received, Self::Ready],
            Self::Received => &[],
        }
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Intake payload for a new order.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct NewOrder {
    pub branch_id: String,
    pub customer_name: String,
    pub total_cents: i64,
}

impl NewOrder {
    pub fn validate(&self) -> Result<(), OrderValidationError> {
        if self.branch_id.trim().is_empty() {
            return Err(OrderValidationError::MissingBranch);
        }
        if self.customer_name.trim().is_empty() {
            return Err(OrderValidationError::MissingCustomer);
        }
        if self.total_cents < 0 {
            return Err(OrderValidationError::NegativeTotal(self.total_cents));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OrderValidationError {
    #[error("branch_id must not be empty")]
    MissingBranch,
    #[error("customer_name must not be empty")]
    MissingCustomer,
    #[error("total_cents must not be negative (got {0})")]
    NegativeTotal(i64),
}
