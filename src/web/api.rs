use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::error;

use super::AppState;
use crate::error::PipelineError;
use crate::features::canonical_ticker;

const MAX_PREDICTIONS: i64 = 500;

fn internal_error(e: PipelineError) -> Response {
    error!("API request failed: {}", e);
    (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({ "error": e.to_string() }))).into_response()
}

fn bad_request(message: &str) -> Response {
    (StatusCode::BAD_REQUEST, Json(json!({ "error": message }))).into_response()
}

// === Status ===

pub async fn get_status(State(state): State<AppState>) -> impl IntoResponse {
    match state.status(Utc::now().date_naive()).await {
        Ok(view) => Json(view).into_response(),
        Err(e) => internal_error(e),
    }
}

// === Predictions ===

#[derive(Debug, Deserialize)]
pub struct PredictionQuery {
    pub ticker: Option<String>,
    #[serde(default)]
    pub min_confidence: f64,
    pub limit: Option<i64>,
}

pub async fn get_predictions(
    State(state): State<AppState>,
    Query(query): Query<PredictionQuery>,
) -> impl IntoResponse {
    if !(0.0..=1.0).contains(&query.min_confidence) {
        return bad_request("min_confidence must be between 0 and 1");
    }
    let limit = query.limit.unwrap_or(100).clamp(1, MAX_PREDICTIONS);
    let ticker = query.ticker.as_deref().map(canonical_ticker);

    match state.predictions(ticker.as_deref(), query.min_confidence, limit).await {
        Ok(predictions) => Json(json!({
            "count": predictions.len(),
            "predictions": predictions,
        }))
        .into_response(),
        Err(e) => internal_error(e),
    }
}

// === Feedback ===

#[derive(Debug, Deserialize)]
pub struct FeedbackQuery {
    pub days: Option<i64>,
}

pub async fn get_feedback(
    State(state): State<AppState>,
    Query(query): Query<FeedbackQuery>,
) -> impl IntoResponse {
    let days = query.days.unwrap_or(state.settings.feedback.lookback_days);
    if days < 0 {
        return bad_request("days must not be negative");
    }
    match state.feedback_view(Utc::now().date_naive(), days).await {
        Ok(view) => Json(view).into_response(),
        Err(e) => internal_error(e),
    }
}

// === Health Check ===

#[derive(Serialize)]
pub struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

pub async fn health_check() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;
    use crate::database::Database;
    use crate::test_support::{promoted_model_id, store_prediction, trading_days};
    use crate::types::Direction;
    use crate::web::router;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use serde_json::Value;
    use tower::ServiceExt;

    async fn get(state: AppState, uri: &str) -> (StatusCode, Value) {
        let response = router(state)
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    async fn seeded() -> (Database, tempfile::TempDir, AppState) {
        let db = Database::in_memory().await.unwrap();
        let dir = tempfile::tempdir().unwrap();
        let mut settings = Settings::default();
        settings.paths.models_dir = dir.path().to_path_buf();
        let state = AppState::new(&db, settings);

        let model_id = promoted_model_id(&state.registry, "v1-test").await;
        let days = trading_days(2);
        store_prediction(&state.predictions, "ABC", days[0], &model_id, Direction::Up, 0.9).await;
        store_prediction(&state.predictions, "ABC", days[1], &model_id, Direction::Down, 0.45).await;
        store_prediction(&state.predictions, "XYZ", days[1], &model_id, Direction::Up, 0.6).await;
        (db, dir, state)
    }

    #[tokio::test]
    async fn test_health() {
        let db = Database::in_memory().await.unwrap();
        let (status, body) = get(AppState::new(&db, Settings::default()), "/api/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn test_predictions_filters() {
        let (_db, _dir, state) = seeded().await;

        let (status, body) = get(state.clone(), "/api/predictions").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["count"], 3);

        let (_, body) = get(state.clone(), "/api/predictions?ticker=abc").await;
        assert_eq!(body["count"], 2);
        assert_eq!(body["predictions"][0]["as_of"], "2024-01-02");

        let (_, body) = get(state.clone(), "/api/predictions?min_confidence=0.5&limit=1").await;
        assert_eq!(body["count"], 1);
        assert_eq!(body["predictions"][0]["ticker"], "ABC");

        let (status, _) = get(state, "/api/predictions?min_confidence=2").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_status_reports_baseline_and_models() {
        let (_db, _dir, state) = seeded().await;
        let (status, body) = get(state, "/api/status").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["snapshot"]["version"], 0);
        assert_eq!(body["promoted_models"].as_array().unwrap().len(), 1);
        assert_eq!(body["open_signals"].as_array().unwrap().len(), 0);
        assert_eq!(body["accuracy"]["total"], 0);
    }

    #[tokio::test]
    async fn test_feedback_view_and_bad_days() {
        let (_db, _dir, state) = seeded().await;
        let (status, body) = get(state.clone(), "/api/feedback?days=7").await;
        assert_eq!(status, StatusCode::OK);
        assert!(body["metrics"].as_array().unwrap().is_empty());
        assert!(body["accuracy"]["accuracy"].is_null());

        let (status, _) = get(state, "/api/feedback?days=-1").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_writes_are_not_routed() {
        let db = Database::in_memory().await.unwrap();
        let response = router(AppState::new(&db, Settings::default()))
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/predictions")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
    }
}
