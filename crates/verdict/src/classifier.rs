use std::fmt;

use bytes::Bytes;
use futures::future::{BoxFuture, FutureExt};
use reqwest::{StatusCode, header};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::{ClassifierConfig, Thresholds};

/// Category scores of a resource, in percent.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Scores {
    pub drawings: f64,
    pub hentai: f64,
    pub neutral: f64,
    pub porn: f64,
    pub sexy: f64,
}

impl Scores {
    /// Derives the verdict for these scores.
    ///
    /// A clearly neutral resource is never flagged, even if other categories score high as well.
    pub fn is_nsfw(&self, thresholds: &Thresholds) -> bool {
        if self.neutral >= thresholds.neutral {
            false
        } else if self.sexy + self.porn + self.hentai >= thresholds.explicit {
            true
        } else {
            // neither drawings nor anything inconclusive is flagged
            false
        }
    }
}

/// The scores of a resource together with the derived verdict.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ClassificationData {
    #[serde(flatten)]
    pub scores: Scores,
    pub is_nsfw: bool,
}

/// The response body of a classification.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Classification {
    pub data: ClassificationData,
}

impl Classification {
    pub fn new(scores: Scores, thresholds: &Thresholds) -> Self {
        let is_nsfw = scores.is_nsfw(thresholds);
        Self {
            data: ClassificationData { scores, is_nsfw },
        }
    }
}

/// An error computing scores for a resource.
#[derive(Debug, Error)]
pub enum ClassifyError {
    #[error("failed to reach the model server")]
    Transport(#[source] reqwest::Error),
    #[error("model server responded with status {0}")]
    Status(StatusCode),
    #[error("model server sent an invalid response")]
    InvalidResponse(#[source] reqwest::Error),
}

/// Computes category scores for raw resources.
pub trait Classifier: fmt::Debug + Send + Sync + 'static {
    fn classify(&self, resource: Bytes) -> BoxFuture<'_, Result<Scores, ClassifyError>>;
}

/// A [`Classifier`] backed by a model server.
///
/// The resource is posted as the request body, and the server responds with [`Scores`] as JSON.
#[derive(Debug)]
pub struct RemoteClassifier {
    client: reqwest::Client,
    url: String,
}

impl RemoteClassifier {
    pub fn new(config: &ClassifierConfig) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().timeout(config.timeout).build()?;
        Ok(Self {
            client,
            url: config.url.clone(),
        })
    }
}

impl Classifier for RemoteClassifier {
    fn classify(&self, resource: Bytes) -> BoxFuture<'_, Result<Scores, ClassifyError>> {
        async move {
            let response = self
                .client
                .post(&self.url)
                .header(header::CONTENT_TYPE, "application/octet-stream")
                .body(resource)
                .send()
                .await
                .map_err(ClassifyError::Transport)?;

            let status = response.status();
            if !status.is_success() {
                return Err(ClassifyError::Status(status));
            }

            response
                .json::<Scores>()
                .await
                .map_err(ClassifyError::InvalidResponse)
        }
        .boxed()
    }
}
