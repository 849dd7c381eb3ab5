use axum::Json;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use serde::Deserialize;

use crate::classifier::Classification;
use crate::service::ClassifyService;

use super::ResponseError;

/// Query parameters of a classification request.
#[derive(Debug, Deserialize)]
pub struct ClassifyQuery {
    /// Locator of the resource to classify.
    #[serde(default)]
    pub url: String,
}

pub async fn classify_resource(
    State(service): State<ClassifyService>,
    Query(query): Query<ClassifyQuery>,
) -> Result<Json<Classification>, ResponseError> {
    let url = query.url.trim();
    if url.is_empty() {
        return Err((StatusCode::BAD_REQUEST, "url parameter is empty").into());
    }

    sentry::configure_scope(|scope| scope.set_tag("request.url", url));
    let classification = service.classify(url.to_owned()).await?;
    Ok(Json(classification))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use reqwest::Url;
    use verdict_cache::{CacheConfig, TokioClock};
    use verdict_test::{FixtureServer, Server};

    use crate::config::{ClassifierConfig, Config};
    use crate::endpoints::create_app;

    use super::*;

    fn server(fixtures: &FixtureServer) -> Server {
        let config = Config {
            cache: CacheConfig::default(),
            classifier: ClassifierConfig {
                url: fixtures.url("classify").to_string(),
                ..Default::default()
            },
            ..Default::default()
        };
        let service = ClassifyService::create(&config, Arc::new(TokioClock::current())).unwrap();
        Server::new(create_app(service))
    }

    fn classify_url(server: &Server, resource: &str) -> Url {
        let mut url = server.url("/");
        url.query_pairs_mut().append_pair("url", resource);
        url
    }

    #[tokio::test]
    async fn test_classify_endpoint() {
        verdict_test::setup();
        let fixtures = FixtureServer::new();
        let server = server(&fixtures);

        let url = classify_url(&server, fixtures.url("images/explicit").as_str());
        let response = reqwest::get(url).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = response.text().await.unwrap();
        insta::assert_snapshot!(body, @r#"{"data":{"drawings":2.0,"hentai":3.0,"neutral":5.0,"porn":80.0,"sexy":10.0,"is_nsfw":true}}"#);
    }

    #[tokio::test]
    async fn test_missing_url() {
        verdict_test::setup();
        let fixtures = FixtureServer::new();
        let server = server(&fixtures);

        for url in [server.url("/"), classify_url(&server, "  ")] {
            let response = reqwest::get(url).await.unwrap();
            assert_eq!(response.status(), StatusCode::BAD_REQUEST);

            let body = response.text().await.unwrap();
            insta::assert_snapshot!(body, @r#"{"detail":"url parameter is empty"}"#);
        }
    }

    #[tokio::test]
    async fn test_unreachable_resource() {
        verdict_test::setup();
        let fixtures = FixtureServer::new();
        let server = server(&fixtures);

        let url = classify_url(&server, fixtures.url("respond_statuscode/403").as_str());
        let response = reqwest::get(url).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);

        let body = response.text().await.unwrap();
        insta::assert_snapshot!(body, @r#"{"detail":"failed to download resource","causes":["resource responded with status 403 Forbidden"]}"#);
    }

    #[tokio::test]
    async fn test_model_rejects_resource() {
        verdict_test::setup();
        let fixtures = FixtureServer::new();
        let server = server(&fixtures);

        let url = classify_url(&server, fixtures.url("bytes/64").as_str());
        let response = reqwest::get(url).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);

        let body = response.text().await.unwrap();
        insta::assert_snapshot!(body, @r#"{"detail":"failed to classify resource","causes":["model server responded with status 422 Unprocessable Entity"]}"#);
    }

    #[tokio::test]
    async fn test_healthcheck() {
        verdict_test::setup();
        let fixtures = FixtureServer::new();
        let server = server(&fixtures);

        let response = reqwest::get(server.url("/healthcheck")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.text().await.unwrap(), "ok");
    }
}
