use crate::errors::ServiceError;
use async_trait::async_trait;
use axum::{
    extract::{
        rejection::{JsonRejection, PathRejection, QueryRejection},
        FromRequest, FromRequestParts, Path, Query, Request,
    },
    http::{request::Parts, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::{de::DeserializeOwned, Deserialize, Serialize};

/// Standard success response
pub fn success_response<T: Serialize>(data: T) -> Response {
    (StatusCode::OK, Json(data)).into_response()
}

/// Standard created response
pub fn created_response<T: Serialize>(data: T) -> Response {
    (StatusCode::CREATED, Json(data)).into_response()
}

/// Standard no content response
pub fn no_content_response() -> Response {
    StatusCode::NO_CONTENT.into_response()
}

/// `Json` whose rejections use the API error body.
#[derive(Debug, Clone, Copy, Default)]
pub struct ApiJson<T>(pub T);

#[async_trait]
impl<S, T> FromRequest<S> for ApiJson<T>
where
    S: Send + Sync,
    T: DeserializeOwned,
{
    type Rejection = ServiceError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        match Json::<T>::from_request(req, state).await {
            Ok(Json(value)) => Ok(Self(value)),
            Err(rejection) => Err(json_rejection(rejection)),
        }
    }
}

fn json_rejection(rejection: JsonRejection) -> ServiceError {
    ServiceError::InvalidInput(rejection.body_text())
}

/// `Query` whose rejections use the API error body.
#[derive(Debug, Clone, Copy, Default)]
pub struct ApiQuery<T>(pub T);

#[async_trait]
impl<S, T> FromRequestParts<S> for ApiQuery<T>
where
    S: Send + Sync,
    T: DeserializeOwned,
{
    type Rejection = ServiceError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        Query::<T>::from_request_parts(parts, state)
            .await
            .map(|Query(value)| Self(value))
            .map_err(|rejection: QueryRejection| ServiceError::InvalidInput(rejection.body_text()))
    }
}

/// `Path` whose rejections use the API error body.
#[derive(Debug, Clone, Copy)]
pub struct ApiPath<T>(pub T);

#[async_trait]
impl<S, T> FromRequestParts<S> for ApiPath<T>
where
    S: Send + Sync,
    T: DeserializeOwned + Send,
{
    type Rejection = ServiceError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        Path::<T>::from_request_parts(parts, state)
            .await
            .map(|Path(value)| Self(value))
            .map_err(|rejection: PathRejection| ServiceError::InvalidInput(rejection.body_text()))
    }
}

/// `?unmask=true` on card reads.
#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct UnmaskParams {
    #[serde(default)]
    pub unmask: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{body::Body, routing::post, Router};
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    #[derive(Deserialize, Serialize)]
    struct Echo {
        value: u32,
    }

    async fn echo(ApiJson(body): ApiJson<Echo>) -> Response {
        success_response(body)
    }

    #[tokio::test]
    async fn malformed_json_is_a_validation_error() {
        let app = Router::new().route("/", post(echo));
        let response = app
            .oneshot(
                axum::http::Request::post("/")
                    .header("content-type", "application/json")
                    .body(Body::from("{\"value\": \"x\"}"))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["errorCode"], "VALIDATION_ERROR");
    }

    #[test]
    fn unmask_defaults_to_false() {
        let uri: axum::http::Uri = "/cards".parse().unwrap();
        let Query(params) = Query::<UnmaskParams>::try_from_uri(&uri).unwrap();
        assert!(!params.unmask);

        let uri: axum::http::Uri = "/cards?unmask=true".parse().unwrap();
        let Query(params) = Query::<UnmaskParams>::try_from_uri(&uri).unwrap();
        assert!(params.unmask);
    }
}
