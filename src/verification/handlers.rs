use axum::{extract::State, http::StatusCode, routing::post, Json, Router};
use tracing::{instrument, warn};

use super::dto::{RunRequest, MAX_BATCH_SIZE, MAX_WORKERS};
use super::scheduler::{run_invocation, worker_ids, InvocationSummary};
use crate::state::AppState;

pub fn run_routes() -> Router<AppState> {
    Router::new().route("/verification/run", post(run_verification))
}

/// POST /verification/run: one scheduled invocation, returns aggregate counts.
#[instrument(skip(state))]
pub async fn run_verification(
    State(state): State<AppState>,
    body: Option<Json<RunRequest>>,
) -> Result<Json<InvocationSummary>, (StatusCode, String)> {
    let req = body.map(|Json(b)| b).unwrap_or_default();
    let cfg = &state.config.verify;

    let batch_size = req.batch_size.unwrap_or(cfg.batch_size);
    if batch_size == 0 || batch_size > MAX_BATCH_SIZE {
        warn!(batch_size, "rejected batch size");
        return Err((
            StatusCode::BAD_REQUEST,
            format!("batch_size must be within 1..={MAX_BATCH_SIZE}"),
        ));
    }

    let ids = match req.worker_id.map(|w| w.trim().to_string()) {
        Some(w) if w.is_empty() => {
            return Err((StatusCode::BAD_REQUEST, "worker_id must not be empty".into()));
        }
        Some(w) => vec![w],
        None => {
            let workers = req.workers.unwrap_or(cfg.workers);
            if workers == 0 || workers > MAX_WORKERS {
                return Err((
                    StatusCode::BAD_REQUEST,
                    format!("workers must be within 1..={MAX_WORKERS}"),
                ));
            }
            worker_ids(&cfg.worker_prefix, workers)
        }
    };

    Ok(Json(run_invocation(&state, &ids, batch_size).await))
}
