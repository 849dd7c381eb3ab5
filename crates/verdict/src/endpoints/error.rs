use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use sentry::integrations::anyhow::capture_anyhow;
use serde::{Deserialize, Serialize};
use verdict_cache::CacheError;

use crate::service::ClassifyFailure;

#[derive(Debug)]
pub struct ResponseError {
    status: StatusCode,
    err: anyhow::Error,
}

impl From<(StatusCode, &'static str)> for ResponseError {
    fn from((status, msg): (StatusCode, &'static str)) -> Self {
        Self {
            status,
            err: anyhow::anyhow!(msg),
        }
    }
}

impl From<CacheError<ClassifyFailure>> for ResponseError {
    fn from(err: CacheError<ClassifyFailure>) -> Self {
        match err {
            CacheError::Producer(failure) => Self {
                status: failure.status(),
                err: failure.into(),
            },
            CacheError::Interrupted => Self {
                status: StatusCode::INTERNAL_SERVER_ERROR,
                err: anyhow::Error::new(CacheError::<ClassifyFailure>::Interrupted)
                    .context("failed to classify resource"),
            },
        }
    }
}

impl IntoResponse for ResponseError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            capture_anyhow(&self.err);
        }
        (self.status, Json(ApiErrorResponse::from(self.err))).into_response()
    }
}

/// The body of an error response.
#[derive(Serialize, Deserialize, Default, Debug, PartialEq)]
pub struct ApiErrorResponse {
    pub detail: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub causes: Option<Vec<String>>,
}

impl From<anyhow::Error> for ApiErrorResponse {
    fn from(err: anyhow::Error) -> Self {
        let mut chain = err.chain().map(|err| err.to_string());
        let detail = chain.next();
        let causes: Vec<_> = chain.collect();
        let causes = (!causes.is_empty()).then_some(causes);

        ApiErrorResponse { detail, causes }
    }
}
