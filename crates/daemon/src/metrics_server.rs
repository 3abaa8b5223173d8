//! Status HTTP server for reelrelay
//!
//! Exposes the pipeline status as JSON for operators and monitoring tools.

use axum::{extract::State, routing::get, Json, Router};
use std::net::SocketAddr;
use thiserror::Error;

use crate::metrics::{current_snapshot, SharedStatus, StatusSnapshot};
use crate::shutdown::Shutdown;

/// Errors that can occur when running the status server
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Invalid bind address {0}")]
    InvalidAddress(String),

    #[error("Failed to bind to address: {0}")]
    BindError(#[from] std::io::Error),
}

/// Handler for GET /status
async fn get_status(State(status): State<SharedStatus>) -> Json<StatusSnapshot> {
    Json(current_snapshot(&status).await)
}

/// Creates the axum Router with the status endpoint
pub fn create_status_router(status: SharedStatus) -> Router {
    Router::new()
        .route("/status", get(get_status))
        .with_state(status)
}

/// Runs the status server on `bind` until shutdown is requested
pub async fn run_status_server(
    status: SharedStatus,
    bind: &str,
    shutdown: Shutdown,
) -> Result<(), ServerError> {
    let addr: SocketAddr = bind
        .parse()
        .map_err(|_| ServerError::InvalidAddress(bind.to_string()))?;

    let app = create_status_router(status);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "Status endpoint listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            while shutdown.sleep(crate::shutdown::SLEEP_SLICE).await {}
        })
        .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::{new_shared_status, Counters, SystemMetrics};
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    #[tokio::test]
    async fn test_get_status_returns_json() {
        let status = new_shared_status();
        {
            let mut snapshot = status.write().await;
            snapshot.state = "normalizing".to_string();
            snapshot.counters = Counters {
                iterations: 12,
                delivered: 7,
                rejected: 20,
                retrieval_failures: 3,
                normalization_failures: 1,
                delivery_failures: 0,
            };
            snapshot.consecutive_failures = 1;
            snapshot.backoff_secs = 120;
            snapshot.last_delivered_id = Some("abc123".to_string());
            snapshot.system = SystemMetrics {
                cpu_usage_percent: 85.2,
                mem_usage_percent: 42.1,
                load_avg_1: 3.5,
                load_avg_5: 2.8,
                load_avg_15: 2.2,
            };
        }

        let app = create_status_router(status);

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/status")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);

        let content_type = response
            .headers()
            .get("content-type")
            .expect("should have content-type header");
        assert!(content_type.to_str().unwrap().contains("application/json"));

        let body = response.into_body().collect().await.unwrap().to_bytes();
        let snapshot: StatusSnapshot =
            serde_json::from_slice(&body).expect("should deserialize to StatusSnapshot");

        assert_eq!(snapshot.state, "normalizing");
        assert_eq!(snapshot.counters.delivered, 7);
        assert_eq!(snapshot.backoff_secs, 120);
        assert_eq!(snapshot.last_delivered_id.as_deref(), Some("abc123"));
    }

    #[tokio::test]
    async fn test_status_json_field_names() {
        let app = create_status_router(new_shared_status());

        let response = app
            .oneshot(Request::builder().uri("/status").body(Body::empty()).unwrap())
            .await
            .unwrap();

        let body = response.into_body().collect().await.unwrap().to_bytes();
        let json_str = String::from_utf8(body.to_vec()).unwrap();

        for field in [
            "state",
            "uptime_secs",
            "iterations",
            "retrieval_failures",
            "normalization_failures",
            "delivery_failures",
            "consecutive_failures",
            "backoff_secs",
            "last_delivered_id",
            "seen_ids",
            "cpu_usage_percent",
            "load_avg_1",
        ] {
            assert!(json_str.contains(field), "missing field {}", field);
        }
    }

    #[tokio::test]
    async fn test_unknown_route_is_404() {
        let app = create_status_router(new_shared_status());

        let response = app
            .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_invalid_bind_address() {
        let result = run_status_server(new_shared_status(), "not-an-addr", Shutdown::never()).await;
        assert!(matches!(result, Err(ServerError::InvalidAddress(_))));
    }
}
