use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use bytes::Bytes;

use crate::error::Error;
use crate::images::ImageInfo;

use super::{Api, AppError, ListParams, ListResponse};

pub(super) fn router() -> Router<Api> {
    Router::new()
        .route("/:name/raw", get(get_raw).put(put_raw))
        .route("/:name/properties", get(properties))
        .route("/:name/", get(redirect_to_properties).delete(delete_image))
        .route("/", get(list))
}

fn properties_location(name: &str) -> String {
    format!("/images/{name}/properties")
}

async fn put_raw(
    State(api): State<Api>,
    Path(name): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, AppError> {
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok());
    if content_type != Some("application/octet-stream") {
        return Err(Error::invalid("File must be of type application/octet-stream").into());
    }
    let client_etag = headers.get(header::ETAG).and_then(|value| value.to_str().ok());

    let etag = api.images.put(&name, body, client_etag).await?;
    Ok((
        StatusCode::CREATED,
        [
            (header::LOCATION, properties_location(&name)),
            (header::ETAG, etag),
        ],
    )
        .into_response())
}

async fn get_raw(State(api): State<Api>, Path(name): Path<String>) -> Result<Response, AppError> {
    let bytes = api.images.get(&name).await?;
    Ok((
        [
            (header::CONTENT_TYPE, "application/octet-stream".to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{name}.sif\""),
            ),
        ],
        bytes,
    )
        .into_response())
}

async fn properties(
    State(api): State<Api>,
    Path(name): Path<String>,
) -> Result<Json<ImageInfo>, AppError> {
    Ok(Json(api.images.properties(&name).await?))
}

async fn redirect_to_properties(Path(name): Path<String>) -> Response {
    (
        StatusCode::SEE_OTHER,
        [(header::LOCATION, properties_location(&name))],
    )
        .into_response()
}

async fn delete_image(
    State(api): State<Api>,
    Path(name): Path<String>,
) -> Result<StatusCode, AppError> {
    api.images.delete(&name).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn list(
    State(api): State<Api>,
    Query(params): Query<ListParams>,
) -> Result<Json<ListResponse<ImageInfo>>, AppError> {
    if params.limit == 0 {
        return Err(Error::invalid("limit must be greater than zero").into());
    }
    let (total, items) = api.images.list(params.skip, params.limit).await?;
    Ok(Json(ListResponse {
        total,
        skip: params.skip,
        limit: params.limit,
        items,
    }))
}

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    use super::*;
    use crate::digest;
    use crate::test_utils::{body_bytes, body_json, test_api};

    fn put_request(name: &str, body: &'static str, etag: Option<&str>) -> Request<Body> {
        let mut builder = Request::builder()
            .method("PUT")
            .uri(format!("/images/{name}/raw"))
            .header(header::CONTENT_TYPE, "application/octet-stream");
        if let Some(etag) = etag {
            builder = builder.header(header::ETAG, etag);
        }
        builder.body(Body::from(body)).unwrap()
    }

    #[tokio::test]
    async fn test_upload_then_properties() {
        let (_dir, api) = test_api();
        let router = api.router();

        let res = router
            .clone()
            .oneshot(put_request("alpine", "hello", None))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::CREATED);
        assert_eq!(
            res.headers().get(header::LOCATION).unwrap(),
            "/images/alpine/properties"
        );

        let res = router
            .clone()
            .oneshot(
                Request::builder()
                    .uri("/images/alpine/properties")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        let json = body_json(res).await;
        assert_eq!(json["name"], "alpine");
        assert_eq!(json["size"], 5);
        assert_eq!(json["type"], "apptainer");
        assert_eq!(json["status"], "available");
    }

    #[tokio::test]
    async fn test_upload_precondition_flow() {
        let (_dir, api) = test_api();
        let router = api.router();
        let etag = digest::etag(b"hello");

        router
            .clone()
            .oneshot(put_request("alpine", "hello", None))
            .await
            .unwrap();

        // replacing without the etag names the current one
        let res = router
            .clone()
            .oneshot(put_request("alpine", "hi", None))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::PRECONDITION_REQUIRED);
        assert_eq!(res.headers().get(header::ETAG).unwrap(), etag.as_str());

        let res = router
            .clone()
            .oneshot(put_request("alpine", "hi", Some("wrong")))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::PRECONDITION_FAILED);

        let res = router
            .clone()
            .oneshot(put_request("alpine", "hi", Some(&etag)))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::CREATED);

        let res = router
            .clone()
            .oneshot(
                Request::builder()
                    .uri("/images/alpine/properties")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(body_json(res).await["size"], 2);
    }

    #[tokio::test]
    async fn test_upload_rejects_wrong_content_type() {
        let (_dir, api) = test_api();
        let res = api
            .router()
            .oneshot(
                Request::builder()
                    .method("PUT")
                    .uri("/images/alpine/raw")
                    .header(header::CONTENT_TYPE, "text/plain")
                    .body(Body::from("hello"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);
        assert!(body_json(res).await["detail"].is_string());
    }

    #[tokio::test]
    async fn test_raw_roundtrip_and_redirect() {
        let (_dir, api) = test_api();
        let router = api.router();

        router
            .clone()
            .oneshot(put_request("alpine", "hello", None))
            .await
            .unwrap();

        let res = router
            .clone()
            .oneshot(
                Request::builder()
                    .uri("/images/alpine/raw")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        assert_eq!(&body_bytes(res).await[..], b"hello");

        let res = router
            .clone()
            .oneshot(
                Request::builder()
                    .uri("/images/alpine/")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::SEE_OTHER);
        assert_eq!(
            res.headers().get(header::LOCATION).unwrap(),
            "/images/alpine/properties"
        );
    }

    #[tokio::test]
    async fn test_delete_and_list() {
        let (_dir, api) = test_api();
        let router = api.router();

        for name in ["alpha", "bravo"] {
            router
                .clone()
                .oneshot(put_request(name, "x", None))
                .await
                .unwrap();
        }

        let res = router
            .clone()
            .oneshot(
                Request::builder()
                    .uri("/images/?skip=0&limit=1")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let json = body_json(res).await;
        assert_eq!(json["total"], 2);
        assert_eq!(json["items"][0]["name"], "alpha");
        assert_eq!(json["items"].as_array().unwrap().len(), 1);

        let res = router
            .clone()
            .oneshot(
                Request::builder()
                    .method("DELETE")
                    .uri("/images/alpha/")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::NO_CONTENT);

        let res = router
            .clone()
            .oneshot(
                Request::builder()
                    .method("DELETE")
                    .uri("/images/alpha/")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::NOT_FOUND);
    }
}
