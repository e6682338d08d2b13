//! REST API over the rate snapshot
//!
//! Read endpoints always answer from the last durable snapshot; upstream
//! outages never surface here while any snapshot exists.

use std::sync::Arc;
use serde::Serialize;
use serde_json::json;
use warp::http::StatusCode;
use warp::{Filter, Rejection, Reply};

use crate::clock::Clock;
use crate::refresh::{RefreshCoordinator, RefreshOutcome, SourceStatistics};
use crate::sources::SourceName;

/// API error types
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
}

impl ApiError {
    fn not_found(message: String) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message,
        }
    }
}

impl warp::reject::Reject for ApiError {}

/// API server for rate endpoints
pub struct RatesApiServer {
    coordinator: Arc<RefreshCoordinator>,
    port: u16,
}

impl RatesApiServer {
    pub fn new(coordinator: Arc<RefreshCoordinator>, port: u16) -> Self {
        Self { coordinator, port }
    }

    /// Start the rates API server
    pub async fn start(&self) {
        let routes = routes(self.coordinator.clone());

        tracing::info!("Starting Rates API server on port {}", self.port);
        warp::serve(routes)
            .run(([127, 0, 0, 1], self.port))
            .await;
    }
}

/// Every endpoint, with CORS and JSON rejections applied
pub fn routes(
    coordinator: Arc<RefreshCoordinator>,
) -> impl Filter<Extract = (impl Reply,), Error = std::convert::Infallible> + Clone {
    // Health check endpoint
    let health = warp::path("health")
        .and(warp::get())
        .and(with_coordinator(coordinator.clone()))
        .map(|coordinator: Arc<RefreshCoordinator>| {
            warp::reply::json(&json!({
                "status": "ok",
                "service": "rates-aggregator",
                "timestamp": coordinator.clock().now(),
                "refreshState": coordinator.state(),
            }))
        });

    let all_rates = warp::path!("api" / "v1" / "rates")
        .and(warp::get())
        .and(with_coordinator(coordinator.clone()))
        .and_then(get_rates);

    let source_rates = warp::path!("api" / "v1" / "rates" / String)
        .and(warp::get())
        .and(with_coordinator(coordinator.clone()))
        .and_then(get_source_rates);

    let refresh = warp::path!("api" / "v1" / "refresh")
        .and(warp::post())
        .and(with_coordinator(coordinator.clone()))
        .and_then(post_refresh);

    let sources = warp::path!("api" / "v1" / "sources")
        .and(warp::get())
        .and(with_coordinator(coordinator))
        .and_then(get_sources);

    let cors = warp::cors()
        .allow_any_origin()
        .allow_headers(vec!["content-type", "authorization"])
        .allow_methods(vec!["GET", "POST", "OPTIONS"]);

    health
        .or(all_rates)
        .or(source_rates)
        .or(refresh)
        .or(sources)
        .with(cors)
        .recover(handle_rejection)
}

// Helper function to inject the coordinator
fn with_coordinator(
    coordinator: Arc<RefreshCoordinator>,
) -> impl Filter<Extract = (Arc<RefreshCoordinator>,), Error = std::convert::Infallible> + Clone {
    warp::any().map(move || coordinator.clone())
}

/// Full snapshot document
async fn get_rates(coordinator: Arc<RefreshCoordinator>) -> Result<impl Reply, Rejection> {
    let snapshot = coordinator.snapshot();
    Ok(warp::reply::json(&*snapshot))
}

/// One source's records
async fn get_source_rates(
    source: String,
    coordinator: Arc<RefreshCoordinator>,
) -> Result<impl Reply, Rejection> {
    let snapshot = coordinator.snapshot();
    match snapshot.source(&source) {
        Some(records) => Ok(warp::reply::json(records)),
        None => Err(warp::reject::custom(ApiError::not_found(format!(
            "Unknown source: {}",
            source
        )))),
    }
}

async fn post_refresh(coordinator: Arc<RefreshCoordinator>) -> Result<impl Reply, Rejection> {
    let (body, status) = match coordinator.refresh_now().await {
        RefreshOutcome::Completed(report) => (json!({ "outcome": "completed", "report": report }), StatusCode::OK),
        RefreshOutcome::Skipped(reason) => (json!({ "outcome": "skipped", "reason": reason }), StatusCode::CONFLICT),
        RefreshOutcome::Failed(error) => (
            json!({ "outcome": "failed", "error": error }),
            StatusCode::INTERNAL_SERVER_ERROR,
        ),
    };
    Ok(warp::reply::with_status(warp::reply::json(&body), status))
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SourceStatus {
    source: SourceName,
    #[serde(flatten)]
    statistics: SourceStatistics,
    success_rate: f64,
}

/// Fetch statistics per bound source
async fn get_sources(coordinator: Arc<RefreshCoordinator>) -> Result<impl Reply, Rejection> {
    let sources: Vec<SourceStatus> = coordinator
        .source_statistics()
        .into_iter()
        .map(|(source, statistics)| SourceStatus {
            source,
            success_rate: statistics.success_rate(),
            statistics,
        })
        .collect();

    Ok(warp::reply::json(&json!({
        "sources": sources,
        "unbound": coordinator.unbound_sources(),
        "refreshState": coordinator.state(),
        "lastSuccess": coordinator.last_success(),
    })))
}

/// Handle API errors
async fn handle_rejection(err: Rejection) -> Result<impl Reply, std::convert::Infallible> {
    let code;
    let message;

    if err.is_not_found() {
        code = StatusCode::NOT_FOUND;
        message = "Endpoint not found";
    } else if let Some(api_error) = err.find::<ApiError>() {
        code = api_error.status;
        message = api_error.message.as_str();
    } else if err.find::<warp::reject::MethodNotAllowed>().is_some() {
        code = StatusCode::METHOD_NOT_ALLOWED;
        message = "Method not allowed";
    } else {
        tracing::error!("Unhandled rejection: {:?}", err);
        code = StatusCode::INTERNAL_SERVER_ERROR;
        message = "Internal server error";
    }

    let json = warp::reply::json(&json!({
        "error": message,
        "code": code.as_u16()
    }));

    Ok(warp::reply::with_status(json, code))
}
