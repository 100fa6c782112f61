use std::{fmt, str::FromStr};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Digits following the prefix: the series followed by the zero-padded sequence.
pub const SEQUENCE_WIDTH: usize = 8;

/// Largest sequence a range without a series can issue.
pub const MAX_SEQUENCE: i64 = 99_999_999;

/// Largest sequence that fits beside `series` in [`SEQUENCE_WIDTH`] digits.
pub fn sequence_capacity(series: &str) -> i64 {
    let width = SEQUENCE_WIDTH.saturating_sub(series.len());
    10_i64.pow(width as u32) - 1
}

/// Default number of compare-and-swap attempts before an allocation gives up.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 32;

/// Tax document category a range issues receipts for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum SeriesType {
    #[serde(rename = "B01")]
    TaxCredit,
    #[serde(rename = "B02")]
    FinalConsumer,
    #[serde(rename = "B03")]
    DebitNote,
    #[serde(rename = "B04")]
    CreditNote,
    #[serde(rename = "B14")]
    SpecialRegime,
    #[serde(rename = "B15")]
    Government,
    #[serde(rename = "B16")]
    Export,
}

impl SeriesType {
    pub const ALL: [SeriesType; 7] = [
        Self::TaxCredit,
        Self::FinalConsumer,
        Self::DebitNote,
        Self::CreditNote,
        Self::SpecialRegime,
        Self::Government,
        Self::Export,
    ];

    /// Returns the DGII code used for storage and on the wire.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::TaxCredit => "B01",
            Self::FinalConsumer => "B02",
            Self::DebitNote => "B03",
            Self::CreditNote => "B04",
            Self::SpecialRegime => "B14",
            Self::Government => "B15",
            Self::Export => "B16",
        }
    }

    pub fn description(self) -> &'static str {
        match self {
            Self::TaxCredit => "tax credit",
            Self::FinalConsumer => "final consumer",
            Self::DebitNote => "debit note",
            Self::CreditNote => "credit note",
            Self::SpecialRegime => "special regime",
            Self::Government => "government",
            Self::Export => "export",
        }
    }
}

impl fmt::Display for SeriesType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SeriesType {
    type Err = UnknownSeriesType;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let code = value.trim();
        Self::ALL
            .into_iter()
            .find(|series| series.as_str().eq_ignore_ascii_case(code))
            .ok_or_else(|| UnknownSeriesType(value.to_string()))
    }
}

/// Raised when a string does not name a supported series type.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown NCF series type: {0}")]
pub struct UnknownSeriesType(pub String);

/// Administratively provisioned block of receipt numbers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NcfRange {
    pub id: i64,
    pub series_type: SeriesType,
    pub prefix: String,
    pub series: String,
    pub initial_number: i64,
    pub last_number: i64,
    pub current_number: i64,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl NcfRange {
    /// Returns `true` once every number in the block has been issued.
    pub fn is_exhausted(&self) -> bool {
        self.current_number > self.last_number
    }

    /// Numbers still available for issuance.
    pub fn remaining(&self) -> i64 {
        (self.last_number - self.current_number + 1).max(0)
    }

    pub fn state(&self) -> RangeState {
        if self.is_exhausted() {
            RangeState::Exhausted
        } else if self.is_active {
            RangeState::Active
        } else {
            RangeState::Inactive
        }
    }

    /// Formats the number the next allocation would issue, if any.
    pub fn peek(&self) -> Option<ReceiptNumber> {
        if self.is_exhausted() {
            return None;
        }
        ReceiptNumber::compose(&self.prefix, &self.series, self.current_number).ok()
    }
}

/// Lifecycle state derived from a range row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RangeState {
    Active,
    Inactive,
    Exhausted,
}

/// Input for provisioning a new range.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct NewNcfRange {
    pub series_type: SeriesType,
    pub prefix: String,
    #[serde(default)]
    pub series: String,
    pub initial_number: i64,
    pub last_number: i64,
    #[serde(default = "default_active")]
    pub is_active: bool,
}

fn default_active() -> bool {
    true
}

impl NewNcfRange {
    /// Checks the structural constraints a range must satisfy before it is stored.
    pub fn validate(&self) -> Result<(), RangeValidationError> {
        let prefix_ok = !self.prefix.is_empty()
            && self.prefix.len() <= 4
            && self.prefix.chars().all(|c| c.is_ascii_alphanumeric());
        if !prefix_ok {
            return Err(RangeValidationError::InvalidPrefix(self.prefix.clone()));
        }

        if self.series.len() >= SEQUENCE_WIDTH || !self.series.chars().all(|c| c.is_ascii_digit()) {
            return Err(RangeValidationError::InvalidSeries(self.series.clone()));
        }

        if self.initial_number < 1 {
            return Err(RangeValidationError::NonPositiveStart(self.initial_number));
        }

        if self.initial_number > self.last_number {
            return Err(RangeValidationError::InvertedBounds {
                initial: self.initial_number,
                last: self.last_number,
            });
        }

        if self.last_number > sequence_capacity(&self.series) {
            return Err(RangeValidationError::SequenceTooWide {
                last: self.last_number,
                series: self.series.clone(),
            });
        }

        Ok(())
    }
}

/// Reasons a new range is rejected.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RangeValidationError {
    #[error("prefix must be 1-4 ASCII alphanumeric characters (got {0:?})")]
    InvalidPrefix(String),
    #[error("series must be at most 7 ASCII digits (got {0:?})")]
    InvalidSeries(String),
    #[error("initial_number must be positive (got {0})")]
    NonPositiveStart(i64),
    #[error("initial_number {initial} exceeds last_number {last}")]
    InvertedBounds { initial: i64, last: i64 },
    #[error("last_number {last} does not fit beside series {series:?} in 8 digits")]
    SequenceTooWide { last: i64, series: String },
}

/// Fully formatted tax receipt number, e.g. `B0200000133`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ReceiptNumber(String);

impl ReceiptNumber {
    /// Renders `prefix || series || sequence`, padding the sequence so that
    /// series and sequence together span [`SEQUENCE_WIDTH`] digits.
    pub fn compose(prefix: &str, series: &str, sequence: i64) -> Result<Self, ComposeError> {
        if series.len() >= SEQUENCE_WIDTH {
            return Err(ComposeError::SeriesTooLong(series.to_string()));
        }
        if !(0..=sequence_capacity(series)).contains(&sequence) {
            return Err(ComposeError::SequenceTooWide(sequence));
        }
        Ok(Self(format!(
            "{prefix}{series}{sequence:0>width$}",
            width = SEQUENCE_WIDTH - series.len()
        )))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for ReceiptNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ComposeError {
    #[error("series {0:?} leaves no digits for the sequence")]
    SeriesTooLong(String),
    #[error("sequence {0} does not fit beside the series in 8 digits")]
    SequenceTooWide(i64),
}

/// Persisted NCF behaviour for order delivery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NcfConfig {
    pub enabled: bool,
    pub default_series_type: SeriesType,
    #[serde(default = "NcfConfig::default_low_stock_threshold")]
    pub low_stock_threshold: i64,
}

impl NcfConfig {
    fn default_low_stock_threshold() -> i64 {
        100
    }

    /// Returns `true` when an allocation leaving `remaining` numbers deserves a warning.
    pub fn is_low_stock(&self, remaining: i64) -> bool {
        remaining <= self.low_stock_threshold
    }
}

impl Default for NcfConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            default_series_type: SeriesType::FinalConsumer,
            low_stock_threshold: Self::default_low_stock_threshold(),
        }
    }
}

/// Storage primitives the allocator needs.
///
/// `advance` must be a conditional write: it only moves `current_number` from
/// `expected` to `next` when the stored value still equals `expected`, the
/// range is still active and not exhausted, and reports whether it applied.
#[async_trait]
pub trait RangeLedger: Send {
    type Error: std::error::Error + Send + Sync + 'static;

    /// Returns the active range for the series type, if one exists.
    async fn active_range(&mut self, series_type: SeriesType)
        -> Result<Option<NcfRange>, Self::Error>;

    /// Compare-and-swap of the range counter.
    async fn advance(&mut self, range_id: i64, expected: i64, next: i64)
        -> Result<bool, Self::Error>;
}

/// Result of a successful allocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Allocation {
    pub number: ReceiptNumber,
    pub series_type: SeriesType,
    pub range_id: i64,
    pub sequence: i64,
    pub remaining: i64,
    #[serde(skip)]
    pub attempts: u32,
}

/// Failures surfaced by [`NcfAllocator::allocate_next`].
#[derive(Debug, Error)]
pub enum AllocationError {
    #[error("no tax receipt series configured for {series_type}")]
    NoActiveRange { series_type: SeriesType },
    #[error("range {range_id} for {series_type} is exhausted, create a new range")]
    RangeExhausted {
        series_type: SeriesType,
        range_id: i64,
    },
    #[error("could not reserve a receipt number for {series_type} after {attempts} attempts")]
    AllocationFailed {
        series_type: SeriesType,
        attempts: u32,
    },
    #[error("range {range_id} holds an unprintable sequence: {source}")]
    Malformed {
        range_id: i64,
        #[source]
        source: ComposeError,
    },
    #[error("range ledger failure: {0}")]
    Ledger(#[source] Box<dyn std::error::Error + Send + Sync + 'static>),
}

impl AllocationError {
    /// Short machine readable code, used for problem types and metric labels.
    pub fn code(&self) -> &'static str {
        match self {
            Self::NoActiveRange { .. } => "no_active_range",
            Self::RangeExhausted { .. } => "range_exhausted",
            Self::AllocationFailed { .. } => "allocation_failed",
            Self::Malformed { .. } => "malformed_range",
            Self::Ledger(_) => "ledger_error",
        }
    }
}

/// Issues receipt numbers through a [`RangeLedger`] using optimistic concurrency.
#[derive(Debug, Clone, Copy)]
pub struct NcfAllocator {
    max_attempts: u32,
}

impl Default for NcfAllocator {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ATTEMPTS)
    }
}

impl NcfAllocator {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Issues the next receipt number for `series_type` and advances its range by one.
    ///
    /// The counter only moves through [`RangeLedger::advance`]; a lost race
    /// re-reads the range and tries again. Failure paths never write.
    pub async fn allocate_next<L>(
        &self,
        ledger: &mut L,
        series_type: SeriesType,
    ) -> Result<Allocation, AllocationError>
    where
        L: RangeLedger + ?Sized,
    {
        for attempt in 1..=self.max_attempts {
            let range = ledger
                .active_range(series_type)
                .await
                .map_err(|err| AllocationError::Ledger(Box::new(err)))?
                .ok_or(AllocationError::NoActiveRange { series_type })?;

            if range.is_exhausted() {
                return Err(AllocationError::RangeExhausted {
                    series_type,
                    range_id: range.id,
                });
            }

            let issued = range.current_number;
            let number = ReceiptNumber::compose(&range.prefix, &range.series, issued).map_err(
                |source| AllocationError::Malformed {
                    range_id: range.id,
                    source,
                },
            )?;

            let applied = ledger
                .advance(range.id, issued, issued + 1)
                .await
                .map_err(|err| AllocationError::Ledger(Box::new(err)))?;

            if applied {
                return Ok(Allocation {
                    number,
                    series_type,
                    range_id: range.id,
                    sequence: issued,
                    remaining: range.last_number - issued,
                    attempts: attempt,
                });
            }
        }

        Err(AllocationError::AllocationFailed {
            series_type,
            attempts: self.max_attempts,
        })
    }
}
