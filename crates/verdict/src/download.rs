//! Fetching the resources that are classified.

use std::time::Instant;

use bytes::{Bytes, BytesMut};
use futures::TryStreamExt;
use reqwest::{StatusCode, Url, header};
use thiserror::Error;

use verdict_cache::metric;

use crate::config::DownloadConfig;

const USER_AGENT: &str = concat!("verdict/", env!("CARGO_PKG_VERSION"));

/// An error fetching a resource.
#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("invalid resource url `{0}`")]
    InvalidUrl(String),
    #[error("resource responded with status {0}")]
    Status(StatusCode),
    #[error("resource is larger than {limit} bytes")]
    TooLarge { limit: u64 },
    #[error("failed to fetch resource")]
    Transport(#[source] reqwest::Error),
}

impl DownloadError {
    /// Whether the resource itself is the problem, rather than the way to it.
    pub fn is_client_error(&self) -> bool {
        !matches!(self, Self::Transport(_))
    }
}

/// Downloads resources over HTTP(S), refusing anything above the configured size.
#[derive(Debug)]
pub struct Downloader {
    client: reqwest::Client,
    config: DownloadConfig,
}

impl Downloader {
    pub fn new(config: DownloadConfig) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .gzip(true)
            .connect_timeout(config.connect_timeout)
            .timeout(config.timeout)
            .user_agent(USER_AGENT)
            .build()?;
        Ok(Self { client, config })
    }

    /// Fetches the resource at `url` into memory.
    pub async fn download(&self, url: &str) -> Result<Bytes, DownloadError> {
        let parsed = Url::parse(url).map_err(|_| DownloadError::InvalidUrl(url.to_owned()))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(DownloadError::InvalidUrl(url.to_owned()));
        }

        let start = Instant::now();
        tracing::debug!("Fetching resource from `{}`", parsed);

        let mut builder = self.client.get(parsed);
        if let Some(headers) = self.config.headers_for(url) {
            for (key, value) in headers {
                if let Ok(key) = header::HeaderName::from_bytes(key.as_bytes()) {
                    builder = builder.header(key, value.as_str());
                }
            }
        }

        let response = builder.send().await.map_err(DownloadError::Transport)?;
        let status = response.status();
        if status != StatusCode::OK {
            tracing::debug!(%status, "Unexpected status fetching resource");
            return Err(DownloadError::Status(status));
        }

        let limit = self.config.max_size_bytes();
        if response.content_length().is_some_and(|len| len > limit) {
            metric!(counter("download.too_large") += 1);
            return Err(DownloadError::TooLarge { limit });
        }

        // The declared length is not trusted, nor always present.
        let mut body = BytesMut::new();
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.try_next().await.map_err(DownloadError::Transport)? {
            if (body.len() + chunk.len()) as u64 > limit {
                metric!(counter("download.too_large") += 1);
                return Err(DownloadError::TooLarge { limit });
            }
            body.extend_from_slice(&chunk);
        }

        metric!(timer("download.duration") = start.elapsed());
        metric!(counter("download.bytes") += body.len() as i64);
        Ok(body.freeze())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;

    fn downloader(max_size_mb: u64) -> Downloader {
        Downloader::new(DownloadConfig {
            max_size_mb,
            ..Default::default()
        })
        .unwrap()
    }

    #[tokio::test]
    async fn test_download_resource() {
        verdict_test::setup();
        let server = verdict_test::FixtureServer::new();

        let body = downloader(1)
            .download(server.url("images/neutral").as_str())
            .await
            .unwrap();
        assert_eq!(body, verdict_test::NEUTRAL_SCORES.as_bytes());
        assert_eq!(server.accesses(), 1);
    }

    #[tokio::test]
    async fn test_download_missing() {
        verdict_test::setup();
        let server = verdict_test::FixtureServer::new();

        let result = downloader(1)
            .download(server.url("images/i-do-not-exist").as_str())
            .await;
        assert!(matches!(
            result,
            Err(DownloadError::Status(StatusCode::NOT_FOUND))
        ));
    }

    #[tokio::test]
    async fn test_download_declared_too_large() {
        verdict_test::setup();
        let server = verdict_test::FixtureServer::new();

        let result = downloader(1)
            .download(server.url("bytes/1000001").as_str())
            .await;
        assert!(matches!(
            result,
            Err(DownloadError::TooLarge { limit: 1_000_000 })
        ));

        let body = downloader(1)
            .download(server.url("bytes/1000000").as_str())
            .await
            .unwrap();
        assert_eq!(body.len(), 1_000_000);
    }

    #[tokio::test]
    async fn test_download_streamed_too_large() {
        verdict_test::setup();
        let server = verdict_test::FixtureServer::new();

        let result = downloader(1)
            .download(server.url("chunked/2000000").as_str())
            .await;
        assert!(matches!(result, Err(DownloadError::TooLarge { .. })));

        let body = downloader(1)
            .download(server.url("chunked/4096").as_str())
            .await
            .unwrap();
        assert_eq!(body.len(), 4096);
    }

    #[tokio::test]
    async fn test_invalid_url() {
        let downloader = downloader(1);

        for url in ["not a url", "ftp://example.com/image.png", "/relative.png"] {
            let result = downloader.download(url).await;
            assert!(
                matches!(&result, Err(DownloadError::InvalidUrl(u)) if u == url),
                "{url}: {result:?}"
            );
        }
    }

    #[tokio::test]
    async fn test_custom_headers() {
        verdict_test::setup();
        let server = verdict_test::FixtureServer::new();

        let mut custom_headers = BTreeMap::new();
        custom_headers.insert(
            "echo_header".to_owned(),
            BTreeMap::from([("x-resource-token".to_owned(), "secret".to_owned())]),
        );
        let downloader = Downloader::new(DownloadConfig {
            custom_headers,
            ..Default::default()
        })
        .unwrap();

        let body = downloader
            .download(server.url("echo_header/x-resource-token").as_str())
            .await
            .unwrap();
        assert_eq!(body, "secret");

        // the fixture server rejects requests without the header
        let result = self::downloader(1)
            .download(server.url("echo_header/x-resource-token").as_str())
            .await;
        assert!(matches!(
            result,
            Err(DownloadError::Status(StatusCode::BAD_REQUEST))
        ));
    }

    #[tokio::test]
    async fn test_connection_refused() {
        verdict_test::setup();
        let server = verdict_test::FixtureServer::new();
        let url = server.url("images/neutral");
        drop(server);
        tokio::task::yield_now().await;

        let result = downloader(1).download(url.as_str()).await;
        let error = result.unwrap_err();
        assert!(!error.is_client_error(), "{error:?}");
    }
}
