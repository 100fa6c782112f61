use std::time::Instant;

use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::StatusCode,
    Json,
};
use metrics::{counter, gauge, histogram};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use lavapos_core::ncf::{
    Allocation, AllocationError, NcfConfig, NcfRange, NewNcfRange, RangeState, ReceiptNumber,
    SeriesType,
};

use crate::problem::ProblemResponse;
use crate::router::AppState;

/// Range as exposed by the admin API, with derived capacity fields.
#[derive(Debug, Serialize)]
pub struct RangeView {
    #[serde(flatten)]
    range: NcfRange,
    remaining: i64,
    state: RangeState,
    #[serde(skip_serializing_if = "Option::is_none")]
    next_ncf: Option<ReceiptNumber>,
}

impl From<NcfRange> for RangeView {
    fn from(range: NcfRange) -> Self {
        Self {
            remaining: range.remaining(),
            state: range.state(),
            next_ncf: range.peek(),
            range,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct ActivationRequest {
    active: bool,
}

#[derive(Debug, Deserialize)]
pub struct AllocateRequest {
    series_type: SeriesType,
}

#[derive(Debug, Serialize)]
pub struct AllocationView {
    ncf: ReceiptNumber,
    series_type: SeriesType,
    range_id: i64,
    sequence: i64,
    remaining: i64,
}

impl From<Allocation> for AllocationView {
    fn from(allocation: Allocation) -> Self {
        Self {
            ncf: allocation.number,
            series_type: allocation.series_type,
            range_id: allocation.range_id,
            sequence: allocation.sequence,
            remaining: allocation.remaining,
        }
    }
}

pub async fn list_ranges(
    State(state): State<AppState>,
) -> Result<Json<Vec<RangeView>>, ProblemResponse> {
    let ranges = state.storage().ncf_ranges().list().await?;
    Ok(Json(ranges.into_iter().map(RangeView::from).collect()))
}

pub async fn create_range(
    State(state): State<AppState>,
    payload: Result<Json<NewNcfRange>, JsonRejection>,
) -> Result<(StatusCode, Json<RangeView>), ProblemResponse> {
    let Json(request) = payload?;
    let range = state
        .storage()
        .ncf_ranges()
        .create(&request, state.now())
        .await?;

    info!(
        stage = "ncf",
        range_id = range.id,
        series_type = %range.series_type,
        initial_number = range.initial_number,
        last_number = range.last_number,
        active = range.is_active,
        "ncf range created"
    );
    if range.is_active {
        record_remaining(range.series_type, range.remaining());
    }

    Ok((StatusCode::CREATED, Json(range.into())))
}

pub async fn set_activation(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    payload: Result<Json<ActivationRequest>, JsonRejection>,
) -> Result<Json<RangeView>, ProblemResponse> {
    let Json(request) = payload?;
    let range = state
        .storage()
        .ncf_ranges()
        .set_active(id, request.active, state.now())
        .await?;

    info!(
        stage = "ncf",
        range_id = range.id,
        series_type = %range.series_type,
        active = range.is_active,
        "ncf range activation changed"
    );
    if range.is_active {
        record_remaining(range.series_type, range.remaining());
    }

    Ok(Json(range.into()))
}

pub async fn get_config(State(state): State<AppState>) -> Result<Json<NcfConfig>, ProblemResponse> {
    Ok(Json(state.storage().ncf_config().fetch().await?))
}

pub async fn put_config(
    State(state): State<AppState>,
    payload: Result<Json<NcfConfig>, JsonRejection>,
) -> Result<Json<NcfConfig>, ProblemResponse> {
    let Json(config) = payload?;
    let updated = state
        .storage()
        .ncf_config()
        .update(&config, state.now())
        .await?;

    info!(
        stage = "ncf",
        enabled = updated.enabled,
        default_series_type = %updated.default_series_type,
        low_stock_threshold = updated.low_stock_threshold,
        "ncf config updated"
    );
    Ok(Json(updated))
}

pub async fn allocate(
    State(state): State<AppState>,
    payload: Result<Json<AllocateRequest>, JsonRejection>,
) -> Result<Json<AllocationView>, ProblemResponse> {
    let Json(request) = payload?;
    let series_type = request.series_type;
    let config = match state.storage().ncf_config().fetch().await {
        Ok(config) => config,
        Err(err) => {
            warn!(stage = "ncf", error = %err, "ncf config unreadable, using defaults for alerts");
            NcfConfig::default()
        }
    };
    let start = Instant::now();

    let mut ledger = state.storage().ncf_ranges().ledger(state.now());
    let result = state
        .allocator()
        .allocate_next(&mut ledger, series_type)
        .await;
    histogram!("ncf_allocation_seconds").record(start.elapsed().as_secs_f64());

    let allocation = result.map_err(|err| allocation_failed(series_type, err))?;
    record_allocation(&allocation, &config);

    Ok(Json(allocation.into()))
}

/// Counts a failed allocation and logs it before it is turned into a response.
pub(crate) fn allocation_failed(series_type: SeriesType, err: AllocationError) -> AllocationError {
    counter!(
        "ncf_allocations_total",
        "series_type" => series_type.as_str(),
        "result" => err.code()
    )
    .increment(1);
    warn!(stage = "ncf", series_type = %series_type, reason = err.code(), error = %err, "ncf allocation failed");
    err
}

/// Emits metrics and logs for an issued receipt number.
pub(crate) fn record_allocation(allocation: &Allocation, config: &NcfConfig) {
    let series_type = allocation.series_type;
    counter!(
        "ncf_allocations_total",
        "series_type" => series_type.as_str(),
        "result" => "issued"
    )
    .increment(1);
    if allocation.attempts > 1 {
        counter!("ncf_cas_conflicts_total").increment(u64::from(allocation.attempts - 1));
    }
    record_remaining(series_type, allocation.remaining);

    info!(
        stage = "ncf",
        series_type = %series_type,
        range_id = allocation.range_id,
        ncf = %allocation.number,
        remaining = allocation.remaining,
        attempts = allocation.attempts,
        "ncf issued"
    );

    if config.is_low_stock(allocation.remaining) {
        warn!(
            stage = "ncf",
            series_type = %series_type,
            range_id = allocation.range_id,
            remaining = allocation.remaining,
            threshold = config.low_stock_threshold,
            "ncf range running low, provision a new range"
        );
    }
}

fn record_remaining(series_type: SeriesType, remaining: i64) {
    gauge!("ncf_range_remaining", "series_type" => series_type.as_str()).set(remaining as f64);
}
