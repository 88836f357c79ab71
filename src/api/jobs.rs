use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tracing::error;

use crate::error::Error;
use crate::job::artifacts::ArtifactInfo;
use crate::job::state::ALLOWED_VERBS;
use crate::job::{state, Job, JobProperties};

use super::{default_limit, Api, AppError, ListResponse};

pub(super) fn router() -> Router<Api> {
    Router::new()
        .route("/", post(create).get(list))
        .route("/:id/properties", put(put_properties))
        .route("/:id/", get(get_job))
        .route("/:id/script/", put(put_script).get(get_script))
        .route("/:id/state/", put(put_state).get(get_state))
        .route("/:id/log/", get(get_log))
        .route("/:id/artifacts/", get(list_artifacts))
        .route("/:id/artifacts/data", get(artifacts_data))
}

#[derive(Debug, Serialize)]
struct CreatedJob {
    id: u64,
}

fn job_location(id: u64) -> (axum::http::HeaderName, String) {
    (header::LOCATION, format!("/jobs/{id}"))
}

async fn create(State(api): State<Api>) -> Result<Response, AppError> {
    let id = api.jobs.create()?;
    Ok((StatusCode::CREATED, [job_location(id)], Json(CreatedJob { id })).into_response())
}

async fn put_properties(
    State(api): State<Api>,
    Path(id): Path<u64>,
    Json(props): Json<JobProperties>,
) -> Result<Response, AppError> {
    let job = api.jobs.bind_image(id, &props).await?;
    Ok(([job_location(id)], Json(job)).into_response())
}

async fn get_job(State(api): State<Api>, Path(id): Path<u64>) -> Result<Response, AppError> {
    let job = api.jobs.get(id).await?;
    Ok(([job_location(id)], Json(job)).into_response())
}

async fn put_script(
    State(api): State<Api>,
    Path(id): Path<u64>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, AppError> {
    let client_etag = headers.get(header::ETAG).and_then(|value| value.to_str().ok());
    let (job, etag) = api.jobs.put_script(id, body, client_etag).await?;
    Ok(([job_location(id), (header::ETAG, etag)], Json(job)).into_response())
}

async fn get_script(State(api): State<Api>, Path(id): Path<u64>) -> Result<Response, AppError> {
    let script = api.jobs.get_script(id).await?;
    Ok((
        [(header::LOCATION, format!("/jobs/{id}/script/"))],
        script,
    )
        .into_response())
}

async fn get_state(State(api): State<Api>, Path(id): Path<u64>) -> Result<String, AppError> {
    Ok(api.jobs.state(id).await?)
}

#[derive(Debug, Deserialize)]
struct StateParams {
    state: String,
}

/// Request a transition. `start` also launches the job's child; the
/// launch runs detached from this request and completion is recorded by
/// the runner.
async fn put_state(
    State(api): State<Api>,
    Path(id): Path<u64>,
    Query(params): Query<StateParams>,
) -> Result<String, AppError> {
    if !ALLOWED_VERBS.contains(&params.state.as_str()) {
        return Err(Error::invalid(format!(
            "Unknown state '{}', allowed states: {}",
            params.state,
            ALLOWED_VERBS.join(", ")
        ))
        .into());
    }

    let label = api.jobs.set_state(id, &params.state).await?;

    if params.state == state::START_VERB {
        // the persisted label is not rolled back on a failed launch
        let child = api.runner.launch(id).await.map_err(AppError::internal)?;
        let runner = api.runner.clone();
        tokio::spawn(async move {
            if let Err(err) = runner.wait(id, child).await {
                error!("failed to record completion of job {}: {}", id, err);
            }
        });
    }

    Ok(label)
}

async fn get_log(State(api): State<Api>, Path(id): Path<u64>) -> Result<String, AppError> {
    Ok(api.jobs.get_log(id).await?)
}

async fn list_artifacts(
    State(api): State<Api>,
    Path(id): Path<u64>,
) -> Result<Json<Vec<ArtifactInfo>>, AppError> {
    Ok(Json(api.artifacts.list(id).await?))
}

async fn artifacts_data(
    State(api): State<Api>,
    Path(id): Path<u64>,
) -> Result<Response, AppError> {
    let archive = api.artifacts.archive(id).await?;
    Ok((
        [
            (header::CONTENT_TYPE, "application/zip".to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"job_{id}_artifacts.zip\""),
            ),
        ],
        archive,
    )
        .into_response())
}

#[derive(Debug, Deserialize)]
struct JobListParams {
    #[serde(default)]
    skip: usize,
    #[serde(default = "default_limit")]
    limit: usize,
    #[serde(default)]
    state: String,
}

async fn list(
    State(api): State<Api>,
    Query(params): Query<JobListParams>,
) -> Result<Json<ListResponse<Job>>, AppError> {
    if params.limit == 0 {
        return Err(Error::invalid("limit must be greater than zero").into());
    }
    let jobs = api.jobs.list(&params.state).await?;
    let total = jobs.len();
    let items = jobs
        .into_iter()
        .skip(params.skip)
        .take(params.limit)
        .collect();
    Ok(Json(ListResponse {
        total,
        skip: params.skip,
        limit: params.limit,
        items,
    }))
}
