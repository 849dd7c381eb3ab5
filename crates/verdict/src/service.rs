//! Classification of remote resources, coalesced and cached per locator.
//!
//! Every request for a locator that is already being classified waits for that classification
//! instead of downloading the resource again. Finished classifications are kept for the
//! configured time-to-live.

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::http::StatusCode;
use futures::future::{BoxFuture, FutureExt};
use thiserror::Error;
use verdict_cache::{
    CacheConfig, CacheError, CacheKey, Clock, Coalesced, KeyError, Producer, metric,
    with_coalescing_cache,
};

use crate::classifier::{Classification, ClassifyError, Classifier, RemoteClassifier};
use crate::config::{Config, Thresholds};
use crate::download::{DownloadError, Downloader};

/// Why a resource could not be classified.
///
/// Every caller waiting for the same locator receives a clone of the same failure.
#[derive(Clone, Debug, Error)]
pub enum ClassifyFailure {
    #[error("failed to download resource")]
    Download(#[source] Arc<DownloadError>),
    #[error("failed to classify resource")]
    Classify(#[source] Arc<ClassifyError>),
}

impl ClassifyFailure {
    /// The HTTP status this failure is reported with.
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Download(err) if err.is_client_error() => StatusCode::UNPROCESSABLE_ENTITY,
            Self::Download(_) | Self::Classify(_) => StatusCode::BAD_GATEWAY,
        }
    }
}

impl From<DownloadError> for ClassifyFailure {
    fn from(err: DownloadError) -> Self {
        Self::Download(Arc::new(err))
    }
}

impl From<ClassifyError> for ClassifyFailure {
    fn from(err: ClassifyError) -> Self {
        Self::Classify(Arc::new(err))
    }
}

/// Downloads a resource and derives its [`Classification`].
#[derive(Debug)]
pub struct ClassifyProducer {
    downloader: Arc<Downloader>,
    classifier: Arc<dyn Classifier>,
    thresholds: Thresholds,
}

impl ClassifyProducer {
    pub fn new(
        downloader: Downloader,
        classifier: Arc<dyn Classifier>,
        thresholds: Thresholds,
    ) -> Self {
        Self {
            downloader: Arc::new(downloader),
            classifier,
            thresholds,
        }
    }
}

impl Producer for ClassifyProducer {
    type Args = String;
    type Output = Classification;
    type Error = ClassifyFailure;

    fn cache_key(&self, url: &String) -> Result<CacheKey, KeyError> {
        Ok(CacheKey::builder().arg(url)?.build())
    }

    fn produce(&self, url: String) -> BoxFuture<'static, Result<Classification, ClassifyFailure>> {
        let downloader = Arc::clone(&self.downloader);
        let classifier = Arc::clone(&self.classifier);
        let thresholds = self.thresholds;

        async move {
            let resource = downloader.download(&url).await?;
            tracing::debug!(%url, size = resource.len(), "Downloaded resource");

            let scores = classifier.classify(resource).await?;
            let classification = Classification::new(scores, &thresholds);

            let is_nsfw = if classification.data.is_nsfw { "true" } else { "false" };
            metric!(counter("classify.verdict") += 1, "is_nsfw" => is_nsfw);
            tracing::debug!(%url, is_nsfw, "Classified resource");

            Ok(classification)
        }
        .boxed()
    }
}

/// The state shared by all request handlers.
#[derive(Clone, Debug)]
pub struct ClassifyService {
    inner: Coalesced<ClassifyProducer>,
}

impl ClassifyService {
    /// Creates the service described by `config`.
    pub fn create(config: &Config, clock: Arc<dyn Clock>) -> Result<Self> {
        let downloader =
            Downloader::new(config.download.clone()).context("failed to create http client")?;
        let classifier = RemoteClassifier::new(&config.classifier)
            .context("failed to create model client")?;
        let producer = ClassifyProducer::new(downloader, Arc::new(classifier), config.thresholds);

        Ok(Self::new(producer, config.cache.clone(), clock))
    }

    pub fn new(producer: ClassifyProducer, cache: CacheConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: with_coalescing_cache(cache, clock)(producer),
        }
    }

    /// Classifies the resource at `url`, or returns an earlier or concurrent classification.
    pub async fn classify(&self, url: String) -> Result<Classification, CacheError<ClassifyFailure>> {
        self.inner.call(url).await
    }
}
