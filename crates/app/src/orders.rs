use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::StatusCode,
    Json,
};
use metrics::counter;
use serde::Deserialize;
use tracing::info;

use lavapos_core::{
    ncf::SeriesType,
    order::{NewOrder, Order, OrderStatus},
};
use lavapos_storage::OrderError;

use crate::ncf::{allocation_failed, record_allocation};
use crate::problem::ProblemResponse;
use crate::router::AppState;

#[derive(Debug, Deserialize)]
pub struct StatusRequest {
    status: OrderStatus,
}

#[derive(Debug, Default, Deserialize)]
pub struct DeliverRequest {
    #[serde(default)]
    series_type: Option<SeriesType>,
}

pub async fn create_order(
    State(state): State<AppState>,
    payload: Result<Json<NewOrder>, JsonRejection>,
) -> Result<(StatusCode, Json<Order>), ProblemResponse> {
    let Json(request) = payload?;
    let order = state.storage().orders().insert(&request, state.now()).await?;
    info!(
        stage = "orders",
        order_id = %order.id,
        branch_id = %order.branch_id,
        "order received"
    );
    Ok((StatusCode::CREATED, Json(order)))
}

pub async fn get_order(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Order>, ProblemResponse> {
    Ok(Json(state.storage().orders().fetch(&id).await?))
}

pub async fn update_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
    payload: Result<Json<StatusRequest>, JsonRejection>,
) -> Result<Json<Order>, ProblemResponse> {
    let Json(request) = payload?;
    let order = state
        .storage()
        .orders()
        .update_status(&id, request.status, state.now())
        .await?;
    info!(
        stage = "orders",
        order_id = %order.id,
        status = %order.status,
        "order status changed"
    );
    Ok(Json(order))
}

/// Marks an order delivered, issuing an NCF in the same transaction when issuance is enabled.
pub async fn deliver(
    State(state): State<AppState>,
    Path(id): Path<String>,
    payload: Result<Json<DeliverRequest>, JsonRejection>,
) -> Result<Json<Order>, ProblemResponse> {
    let request = match payload {
        Ok(Json(request)) => request,
        Err(JsonRejection::MissingJsonContentType(_)) => DeliverRequest::default(),
        Err(rejection) => return Err(rejection.into()),
    };

    let config = state.storage().ncf_config().fetch().await?;
    let series_type = config
        .enabled
        .then(|| request.series_type.unwrap_or(config.default_series_type));

    let delivery = match state
        .storage()
        .orders()
        .deliver(state.allocator(), &id, series_type, state.now())
        .await
    {
        Ok(delivery) => delivery,
        Err(OrderError::Allocation(err)) => {
            let series_type = series_type.unwrap_or(config.default_series_type);
            return Err(allocation_failed(series_type, err).into());
        }
        Err(err) => return Err(err.into()),
    };

    let issued = match &delivery.allocation {
        Some(allocation) => {
            record_allocation(allocation, &config);
            "issued"
        }
        None => "none",
    };
    counter!("orders_delivered_total", "ncf" => issued).increment(1);
    info!(
        stage = "orders",
        order_id = %delivery.order.id,
        ncf = delivery.order.ncf.as_deref().unwrap_or("-"),
        "order delivered"
    );

    Ok(Json(delivery.order))
}

#[cfg(test)]
mod tests {
    use axum::http::Method;
    use serde_json::{json, Value};

    use crate::router::test_support::*;

    use super::*;

    async fn create_range(state: &AppState, series_type: &str, initial: i64, last: i64) -> Value {
        let response = send(
            state,
            Method::POST,
            "/ncf/ranges",
            Some(json!({
                "series_type": series_type,
                "prefix": series_type,
                "series": "00000",
                "initial_number": initial,
                "last_number": last
            })),
        )
        .await;
        assert_eq!(response.status(), StatusCode::CREATED);
        read_json(response).await
    }

    async fn intake_order(state: &AppState) -> Value {
        let response = send(
            state,
            Method::POST,
            "/orders",
            Some(json!({
                "branch_id": "centro",
                "customer_name": "Ana Perez",
                "total_cents": 45_000
            })),
        )
        .await;
        assert_eq!(response.status(), StatusCode::CREATED);
        read_json(response).await
    }

    #[tokio::test]
    async fn delivery_issues_default_series_ncf() {
        let app = setup_app().await;
        create_range(&app.state, "B02", 1, 10).await;
        let order = intake_order(&app.state).await;
        assert_eq!(order["status"], "RECEIVED");
        assert!(order.get("ncf").is_none());

        let uri = format!("/orders/{}/deliver", order["id"].as_str().expect("id"));
        let response = send(&app.state, Method::POST, &uri, None).await;
        assert_eq!(response.status(), StatusCode::OK);
        let delivered = read_json(response).await;
        assert_eq!(delivered["status"], "DELIVERED");
        assert_eq!(delivered["ncf"], "B0200000001");
        assert_eq!(delivered["ncf_series_type"], "B02");
        assert_eq!(delivered["delivered_at"], FIXED_NOW);

        let response = send(&app.state, Method::POST, &uri, None).await;
        assert_eq!(response.status(), StatusCode::CONFLICT);
        let body = read_json(response).await;
        assert_eq!(body["type"], "invalid_transition");

        let response = send(&app.state, Method::GET, "/ncf/ranges", None).await;
        let ranges = read_json(response).await;
        assert_eq!(ranges[0]["current_number"], 2);
    }

    #[tokio::test]
    async fn delivery_uses_requested_series() {
        let app = setup_app().await;
        create_range(&app.state, "B01", 5, 10).await;
        let order = intake_order(&app.state).await;

        let uri = format!("/orders/{}/deliver", order["id"].as_str().expect("id"));
        let response = send(
            &app.state,
            Method::POST,
            &uri,
            Some(json!({ "series_type": "B01" })),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
        let delivered = read_json(response).await;
        assert_eq!(delivered["ncf"], "B0100000005");
    }

    #[tokio::test]
    async fn exhausted_range_keeps_order_undelivered() {
        let app = setup_app().await;
        create_range(&app.state, "B02", 1, 1).await;
        let first = intake_order(&app.state).await;
        let second = intake_order(&app.state).await;

        let uri = format!("/orders/{}/deliver", first["id"].as_str().expect("id"));
        let response = send(&app.state, Method::POST, &uri, None).await;
        assert_eq!(response.status(), StatusCode::OK);

        let id = second["id"].as_str().expect("id");
        let uri = format!("/orders/{id}/deliver");
        let response = send(&app.state, Method::POST, &uri, None).await;
        assert_eq!(response.status(), StatusCode::CONFLICT);
        let body = read_json(response).await;
        assert_eq!(body["type"], "range_exhausted");

        let response = send(&app.state, Method::GET, &format!("/orders/{id}"), None).await;
        let order = read_json(response).await;
        assert_eq!(order["status"], "RECEIVED");
        assert!(order.get("ncf").is_none());
        assert!(order.get("delivered_at").is_none());
    }

    #[tokio::test]
    async fn disabled_issuance_delivers_without_ncf() {
        let app = setup_app().await;
        let response = send(
            &app.state,
            Method::PUT,
            "/ncf/config",
            Some(json!({
                "enabled": false,
                "default_series_type": "B02",
                "low_stock_threshold": 100
            })),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
        let order = intake_order(&app.state).await;

        let uri = format!("/orders/{}/deliver", order["id"].as_str().expect("id"));
        let response = send(&app.state, Method::POST, &uri, None).await;
        assert_eq!(response.status(), StatusCode::OK);
        let delivered = read_json(response).await;
        assert_eq!(delivered["status"], "DELIVERED");
        assert!(delivered.get("ncf").is_none());
    }

    #[tokio::test]
    async fn status_updates_follow_lifecycle() {
        let app = setup_app().await;
        let order = intake_order(&app.state).await;
        let id = order["id"].as_str().expect("id");
        let uri = format!("/orders/{id}/status");

        let response = send(&app.state, Method::PUT, &uri, Some(json!({ "status": "READY" }))).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(read_json(response).await["status"], "READY");

        let response = send(
            &app.state,
            Method::PUT,
            &uri,
            Some(json!({ "status": "DELIVERED" })),
        )
        .await;
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);

        let response = send(
            &app.state,
            Method::PUT,
            &uri,
            Some(json!({ "status": "CANCELLED" })),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);

        let response = send(&app.state, Method::PUT, &uri, Some(json!({ "status": "READY" }))).await;
        assert_eq!(response.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn unknown_order_is_not_found() {
        let app = setup_app().await;
        let response = send(&app.state, Method::GET, "/orders/missing", None).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = send(&app.state, Method::POST, "/orders/missing/deliver", None).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn rejects_blank_customer() {
        let app = setup_app().await;
        let response = send(
            &app.state,
            Method::POST,
            "/orders",
            Some(json!({ "branch_id": "centro", "customer_name": " ", "total_cents": 100 })),
        )
        .await;
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(read_json(response).await["type"], "invalid_order");
    }
}
