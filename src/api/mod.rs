use std::net::SocketAddr;
use std::ops::Deref;
use std::sync::Arc;

use anyhow::Result;
use axum::extract::Request;
use axum::http::{header, HeaderValue, Method, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tower_http::cors::{AllowHeaders, AllowOrigin, CorsLayer};
use tracing::info;

use crate::config::NodeConfig;
use crate::error::Error;
use crate::images::Images;
use crate::job::artifacts::Artifacts;
use crate::job::runner::Runner;
use crate::job::Jobs;
use crate::pipeline::Pipeline;
use crate::store::Store;

mod images;
mod jobs;
mod pipelines;

/// Media types the API can produce.
const SUPPORTED_MEDIA_TYPES: [&str; 1] = ["application/json"];

/// Shared state behind every route handler.
#[derive(Debug, Clone)]
pub struct Api(Arc<Inner>);

impl Deref for Api {
    type Target = Inner;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

#[derive(Debug)]
pub struct Inner {
    pub(crate) images: Images,
    pub(crate) jobs: Jobs,
    pub(crate) runner: Runner,
    pub(crate) artifacts: Artifacts,
    pub(crate) pipeline: Pipeline,
}

impl Api {
    pub fn new(store: Store, cfg: &NodeConfig) -> Self {
        let images = Images::new(store.clone());
        let jobs = Jobs::new(store.clone());
        let runner = Runner::new(store.clone(), cfg.runtime.clone());
        let artifacts = Artifacts::new(store);
        let pipeline = Pipeline::new(jobs.clone(), runner.clone(), artifacts.clone());
        Self(Arc::new(Inner {
            images,
            jobs,
            runner,
            artifacts,
            pipeline,
        }))
    }

    pub fn router(&self) -> Router {
        let cors = CorsLayer::new()
            .allow_headers(AllowHeaders::mirror_request())
            .allow_methods([Method::GET, Method::PUT, Method::POST, Method::DELETE])
            .allow_origin(AllowOrigin::mirror_request());

        Router::new()
            .nest("/images/", images::router())
            .nest("/jobs/", jobs::router())
            .nest("/pipelines/", pipelines::router())
            .layer(middleware::from_fn(validate_accept))
            .layer(cors)
            .with_state(self.clone())
    }

    pub async fn serve(&self, addr: SocketAddr) -> Result<()> {
        let listener = TcpListener::bind(addr).await?;
        info!("api listening at http://{}", listener.local_addr()?);
        axum::serve(listener, self.router().into_make_service()).await?;
        Ok(())
    }
}

/// Reject requests that can only accept media types the API never
/// produces.
async fn validate_accept(req: Request, next: Next) -> Response {
    let accept = req
        .headers()
        .get(header::ACCEPT)
        .and_then(|value| value.to_str().ok())
        .unwrap_or("*/*");
    if accept.contains("*/*") || SUPPORTED_MEDIA_TYPES.iter().any(|media| accept.contains(media)) {
        return next.run(req).await;
    }
    (
        StatusCode::NOT_ACCEPTABLE,
        Json(Detail {
            detail: format!("Supported media types: {SUPPORTED_MEDIA_TYPES:?}"),
        }),
    )
        .into_response()
}

/// Error payload carried by every non-success response.
#[derive(Debug, Serialize)]
pub(crate) struct Detail {
    pub detail: String,
}

/// Pagination window over a listing.
#[derive(Debug, Deserialize)]
pub(crate) struct ListParams {
    #[serde(default)]
    pub skip: usize,
    #[serde(default = "default_limit")]
    pub limit: usize,
}

pub(crate) fn default_limit() -> usize {
    10
}

#[derive(Debug, Serialize)]
pub(crate) struct ListResponse<T> {
    pub total: usize,
    pub skip: usize,
    pub limit: usize,
    pub items: Vec<T>,
}

/// Wraps core errors so handlers can use `?`; the response status comes
/// from the error kind, never from matching on messages.
#[derive(Debug)]
pub(crate) struct AppError(Error);

impl From<Error> for AppError {
    fn from(err: Error) -> Self {
        Self(err)
    }
}

impl AppError {
    /// Force an error to surface as a 500 regardless of its kind. Used
    /// where a launch failure must not read as a client error.
    pub(crate) fn internal(err: Error) -> Self {
        Self(Error::internal(err.to_string()))
    }

    /// Force an error to surface as a 400. Used by endpoints whose whole
    /// request is invalidated by any setup failure.
    pub(crate) fn invalid(err: Error) -> Self {
        Self(Error::invalid(err.to_string()))
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let detail = self.0.to_string();
        let status = match &self.0 {
            Error::Invalid(_) => StatusCode::BAD_REQUEST,
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::Conflict(_) => StatusCode::CONFLICT,
            Error::PreconditionFailed => StatusCode::PRECONDITION_FAILED,
            Error::PreconditionRequired { current } => {
                let mut res =
                    (StatusCode::PRECONDITION_REQUIRED, Json(Detail { detail })).into_response();
                if let Ok(value) = HeaderValue::from_str(current) {
                    res.headers_mut().insert(header::ETAG, value);
                }
                return res;
            }
            Error::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(Detail { detail })).into_response()
    }
}
