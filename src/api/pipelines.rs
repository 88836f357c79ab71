use axum::extract::State;
use axum::routing::post;
use axum::{Json, Router};

use crate::pipeline::PipelineDefinition;

use super::{Api, AppError};

pub(super) fn router() -> Router<Api> {
    Router::new().route("/", post(create))
}

/// Create the stage jobs for a pipeline and kick off its execution. Any
/// failure while setting a stage up invalidates the whole request;
/// already-created stage jobs remain queryable.
async fn create(
    State(api): State<Api>,
    Json(def): Json<PipelineDefinition>,
) -> Result<Json<Vec<u64>>, AppError> {
    let ids = api.pipeline.create(def).await.map_err(AppError::invalid)?;
    Ok(Json(ids))
}
