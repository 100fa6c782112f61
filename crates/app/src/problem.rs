use axum::{
    extract::rejection::JsonRejection,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use tracing::error;

use lavapos_core::ncf::AllocationError;
use lavapos_storage::{NcfConfigError, NcfRangeError, OrderError};

#[derive(Debug, Serialize)]
struct ProblemDetails {
    #[serde(rename = "type")]
    problem_type: &'static str,
    title: &'static str,
    detail: String,
}

/// RFC 7807 error body returned by every handler.
#[derive(Debug)]
pub struct ProblemResponse {
    status: StatusCode,
    body: ProblemDetails,
}

impl ProblemResponse {
    pub fn new<S: Into<String>>(status: StatusCode, problem_type: &'static str, detail: S) -> Self {
        Self {
            status,
            body: ProblemDetails {
                problem_type,
                title: status.canonical_reason().unwrap_or("error"),
                detail: detail.into(),
            },
        }
    }

    /// Logs the underlying failure and returns an opaque 500.
    pub fn internal(problem_type: &'static str, err: &dyn std::error::Error) -> Self {
        error!(stage = "api", problem_type, error = %err, "request failed");
        Self::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            problem_type,
            "internal error, see server logs",
        )
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }
}

impl IntoResponse for ProblemResponse {
    fn into_response(self) -> Response {
        let mut response = Json(self.body).into_response();
        *response.status_mut() = self.status;
        response.headers_mut().insert(
            axum::http::header::CONTENT_TYPE,
            axum::http::HeaderValue::from_static("application/problem+json"),
        );
        response
    }
}

impl From<JsonRejection> for ProblemResponse {
    fn from(rejection: JsonRejection) -> Self {
        Self::new(rejection.status(), "invalid_body", rejection.body_text())
    }
}

impl From<AllocationError> for ProblemResponse {
    fn from(err: AllocationError) -> Self {
        match &err {
            AllocationError::NoActiveRange { series_type } => Self::new(
                StatusCode::CONFLICT,
                "no_active_range",
                format!(
                    "no tax receipt series configured for {series_type} ({})",
                    series_type.description()
                ),
            ),
            AllocationError::RangeExhausted { series_type, .. } => Self::new(
                StatusCode::CONFLICT,
                "range_exhausted",
                format!("{series_type} range exhausted, create a new range"),
            ),
            AllocationError::AllocationFailed { .. } => {
                Self::new(StatusCode::SERVICE_UNAVAILABLE, "allocation_failed", err.to_string())
            }
            AllocationError::Malformed { .. } | AllocationError::Ledger(_) => {
                Self::internal(err.code(), &err)
            }
        }
    }
}

impl From<NcfRangeError> for ProblemResponse {
    fn from(err: NcfRangeError) -> Self {
        match &err {
            NcfRangeError::NotFound(_) => {
                Self::new(StatusCode::NOT_FOUND, "range_not_found", err.to_string())
            }
            NcfRangeError::Exhausted(_) => {
                Self::new(StatusCode::CONFLICT, "range_exhausted", err.to_string())
            }
            NcfRangeError::ActiveConflict => {
                Self::new(StatusCode::CONFLICT, "active_range_conflict", err.to_string())
            }
            NcfRangeError::Invalid(_) => Self::new(
                StatusCode::UNPROCESSABLE_ENTITY,
                "invalid_range",
                err.to_string(),
            ),
            NcfRangeError::Corrupt(_) | NcfRangeError::Database(_) => {
                Self::internal("storage_error", &err)
            }
        }
    }
}

impl From<NcfConfigError> for ProblemResponse {
    fn from(err: NcfConfigError) -> Self {
        match &err {
            NcfConfigError::NegativeThreshold(_) => Self::new(
                StatusCode::UNPROCESSABLE_ENTITY,
                "invalid_config",
                err.to_string(),
            ),
            NcfConfigError::Corrupt(_) | NcfConfigError::Database(_) => {
                Self::internal("storage_error", &err)
            }
        }
    }
}

impl From<OrderError> for ProblemResponse {
    fn from(err: OrderError) -> Self {
        match err {
            OrderError::NotFound => {
                Self::new(StatusCode::NOT_FOUND, "order_not_found", "order not found")
            }
            OrderError::InvalidTransition { .. } => {
                Self::new(StatusCode::CONFLICT, "invalid_transition", err.to_string())
            }
            OrderError::UnsupportedStatus(_) | OrderError::Invalid(_) => Self::new(
                StatusCode::UNPROCESSABLE_ENTITY,
                "invalid_order",
                err.to_string(),
            ),
            OrderError::Allocation(inner) => inner.into(),
            OrderError::Corrupt(_) | OrderError::Database(_) => {
                Self::internal("storage_error", &err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lavapos_core::ncf::SeriesType;

    #[test]
    fn allocation_errors_map_to_conflicts() {
        let problem: ProblemResponse = AllocationError::RangeExhausted {
            series_type: SeriesType::FinalConsumer,
            range_id: 3,
        }
        .into();
        assert_eq!(problem.status(), StatusCode::CONFLICT);
        assert_eq!(problem.body.problem_type, "range_exhausted");
        assert!(problem.body.detail.contains("create a new range"));

        let problem: ProblemResponse = AllocationError::NoActiveRange {
            series_type: SeriesType::Government,
        }
        .into();
        assert_eq!(problem.body.problem_type, "no_active_range");
        assert_eq!(
            problem.body.detail,
            "no tax receipt series configured for B15 (government)"
        );

        let problem: ProblemResponse = AllocationError::AllocationFailed {
            series_type: SeriesType::Government,
            attempts: 4,
        }
        .into();
        assert_eq!(problem.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[test]
    fn order_allocation_failures_use_allocation_mapping() {
        let problem: ProblemResponse = OrderError::Allocation(AllocationError::NoActiveRange {
            series_type: SeriesType::TaxCredit,
        })
        .into();
        assert_eq!(problem.status(), StatusCode::CONFLICT);
        assert_eq!(problem.body.problem_type, "no_active_range");
    }
}
