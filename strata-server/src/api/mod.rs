//! HTTP API endpoints

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use strata_core::replica::{ChannelManager, ChannelStats, ReceiverStats, ReplicaReceiver};
use strata_core::storage::{EngineStats, StorageEngine};
use strata_core::timeutil;
use strata_core::{MetricList, StrataError};
use tower_http::compression::CompressionLayer;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::error;

/// Application state
#[derive(Clone)]
pub struct AppState {
    pub broker: Arc<ChannelManager>,
    pub storage: Option<Arc<StorageEngine>>,
    pub receiver: Option<Arc<ReplicaReceiver>>,
}

/// Create the API router
pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // Health check
        .route("/health", get(health))
        .route("/ping", get(ping))

        // Write endpoint
        .route("/write", post(write))

        // Storage
        .route("/flush", post(flush))

        // Stats
        .route("/stats", get(stats))

        .layer(cors)
        .layer(CompressionLayer::new())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ============================================================================
// Request/Response types
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct WriteParams {
    db: Option<String>,
    database: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

#[derive(Debug, Serialize)]
pub struct StatsResponse {
    pub channels: Vec<ChannelStats>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub receiver: Option<ReceiverStats>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub storage: Option<EngineStats>,
}

#[derive(Debug, Serialize)]
pub struct FlushResponse {
    pub files: usize,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

fn api_error(err: StrataError) -> ApiError {
    let status = match &err {
        StrataError::ChannelFull { .. } => StatusCode::SERVICE_UNAVAILABLE,
        StrataError::DatabaseNotFound(_) | StrataError::ShardNotFound { .. } => {
            StatusCode::NOT_FOUND
        }
        StrataError::InvalidMetric(_) => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(ErrorResponse { error: err.to_string() }))
}

// ============================================================================
// Handlers
// ============================================================================

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: strata_core::VERSION.to_string(),
    })
}

async fn ping() -> &'static str {
    "pong"
}

async fn write(
    State(state): State<AppState>,
    Query(params): Query<WriteParams>,
    Json(mut metrics): Json<MetricList>,
) -> Result<StatusCode, ApiError> {
    let db = params.db.or(params.database).unwrap_or_else(|| "default".to_string());
    metrics.fill_timestamps(timeutil::now());
    state.broker.write(&db, &metrics).map_err(api_error)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn flush(State(state): State<AppState>) -> Result<Json<FlushResponse>, ApiError> {
    let engine = state.storage.ok_or_else(|| {
        (
            StatusCode::NOT_FOUND,
            Json(ErrorResponse {
                error: "storage role disabled".into(),
            }),
        )
    })?;

    let files = tokio::task::spawn_blocking(move || engine.flush_all())
        .await
        .map_err(|e| {
            error!("flush task failed: {}", e);
            api_error(StrataError::Internal(e.to_string()))
        })?
        .map_err(api_error)?;
    Ok(Json(FlushResponse { files }))
}

async fn stats(State(state): State<AppState>) -> Json<StatsResponse> {
    Json(StatsResponse {
        channels: state.broker.stats(),
        receiver: state.receiver.as_ref().map(|r| r.stats()),
        storage: state.storage.as_ref().map(|s| s.stats()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use strata_core::replica::{ChannelConfig, StreamSenderFactory};
    use strata_core::storage::StorageConfig;
    use tempfile::TempDir;
    use tokio_util::sync::CancellationToken;
    use tower::ServiceExt;

    fn state(storage_dir: Option<&TempDir>) -> AppState {
        let broker = ChannelManager::new(
            &CancellationToken::new(),
            ChannelConfig::default(),
            Arc::new(StreamSenderFactory),
        );
        broker.register_database("db", 1).unwrap();
        let storage = storage_dir.map(|dir| {
            Arc::new(
                StorageEngine::new(StorageConfig {
                    data_dir: dir.path().to_path_buf(),
                    ..Default::default()
                })
                .unwrap(),
            )
        });
        AppState {
            broker: Arc::new(broker),
            storage,
            receiver: None,
        }
    }

    fn write_request(db: &str, body: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(format!("/write?db={}", db))
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    const CPU: &str = r#"{"metrics":[{"name":"cpu","timestamp":1000,"tags":{"host":"a"},
        "simple_fields":[{"name":"usage","field_type":"Last","value":1.5}]}]}"#;

    #[tokio::test]
    async fn test_health() {
        let app = create_router(state(None));
        let response = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["status"], "ok");
    }

    #[tokio::test]
    async fn test_write_status_codes() {
        let state = state(None);
        let app = create_router(state.clone());

        let response = app.clone().oneshot(write_request("db", CPU)).await.unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);

        let response = app.clone().oneshot(write_request("missing", CPU)).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let no_fields = r#"{"metrics":[{"name":"cpu","timestamp":1}]}"#;
        let response = app.clone().oneshot(write_request("db", no_fields)).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = app.oneshot(Request::builder().uri("/stats").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["channels"][0]["written"], 1);
        assert!(json.get("storage").is_none());

        state.broker.shutdown().await;
    }

    #[test]
    fn test_error_status() {
        let full = StrataError::ChannelFull {
            database: "db".into(),
            shard_id: 0,
        };
        assert_eq!(api_error(full).0, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(
            api_error(StrataError::DatabaseNotFound("db".into())).0,
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            api_error(StrataError::InvalidMetric("bad".into())).0,
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            api_error(StrataError::Transport("down".into())).0,
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[tokio::test]
    async fn test_flush() {
        let app = create_router(state(None));
        let response = app
            .oneshot(Request::builder().method("POST").uri("/flush").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let temp_dir = TempDir::new().unwrap();
        let state = state(Some(&temp_dir));
        let engine = state.storage.clone().unwrap();
        engine
            .write(
                "db",
                0,
                &serde_json::from_str::<MetricList>(CPU).unwrap().metrics,
            )
            .unwrap();

        let app = create_router(state);
        let response = app
            .oneshot(Request::builder().method("POST").uri("/flush").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["files"], 1);
    }
}
