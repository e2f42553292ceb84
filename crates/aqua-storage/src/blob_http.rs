use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use reqwest::{StatusCode, Url};
use serde::Deserialize;
use tokio::sync::Semaphore;
use tracing::{info_span, Instrument};

use crate::{BlobStore, HttpClientConfig, StoreError};

#[derive(Debug, Deserialize)]
struct ObjectMetadata {
    #[serde(rename = "downloadTokens", default)]
    download_tokens: Option<String>,
}

/// Object-store client speaking the `/v0/b/{bucket}/o/{path}` download-token
/// protocol. Requests are bounded by a semaphore and a per-request timeout;
/// nothing is retried.
#[derive(Debug)]
pub struct HttpBlobStore {
    client: reqwest::Client,
    base_url: Url,
    bucket: String,
    limit: Arc<Semaphore>,
}

impl HttpBlobStore {
    pub fn new(
        base_url: &str,
        bucket: impl Into<String>,
        config: HttpClientConfig,
    ) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        let base_url =
            Url::parse(base_url).with_context(|| format!("parsing blob base url {base_url}"))?;

        Ok(Self {
            client,
            base_url,
            bucket: bucket.into(),
            limit: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
        })
    }

    fn bucket_url(&self, tail: &[&str]) -> Result<Url, StoreError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| StoreError::Message(format!("blob base url {} cannot hold a path", self.base_url)))?
            .pop_if_empty()
            .extend(["v0", "b", self.bucket.as_str(), "o"])
            .extend(tail);
        Ok(url)
    }

    /// Metadata URL for `path`; the whole path is one encoded segment.
    pub fn object_url(&self, path: &str) -> Result<Url, StoreError> {
        self.bucket_url(&[path])
    }

    fn upload_url(&self, path: &str) -> Result<Url, StoreError> {
        let mut url = self.bucket_url(&[])?;
        url.query_pairs_mut().append_pair("name", path);
        Ok(url)
    }

    async fn permit(&self) -> Result<tokio::sync::SemaphorePermit<'_>, StoreError> {
        self.limit
            .acquire()
            .await
            .map_err(|_| StoreError::Message("blob client is shut down".to_string()))
    }
}

#[async_trait]
impl BlobStore for HttpBlobStore {
    async fn resolve_url(&self, path: &str) -> Result<String, StoreError> {
        let _permit = self.permit().await?;
        let url = self.object_url(path)?;
        let span = info_span!("blob_resolve", path);

        async {
            let resp = self.client.get(url.clone()).send().await?;
            let status = resp.status();
            if status == StatusCode::NOT_FOUND {
                return Err(StoreError::BlobNotFound(path.to_string()));
            }
            if !status.is_success() {
                return Err(StoreError::HttpStatus {
                    status: status.as_u16(),
                    url: url.to_string(),
                });
            }

            let meta: ObjectMetadata = resp.json().await?;
            let token = meta
                .download_tokens
                .as_deref()
                .and_then(|tokens| tokens.split(',').map(str::trim).find(|t| !t.is_empty()))
                .ok_or_else(|| StoreError::Message(format!("no download token for {path}")))?;

            let mut download = url;
            download
                .query_pairs_mut()
                .append_pair("alt", "media")
                .append_pair("token", token);
            Ok(download.to_string())
        }
        .instrument(span)
        .await
    }

    async fn put(&self, path: &str, bytes: Vec<u8>, content_type: &str) -> Result<(), StoreError> {
        let _permit = self.permit().await?;
        let url = self.upload_url(path)?;
        let span = info_span!("blob_put", path, bytes = bytes.len());

        async {
            let resp = self
                .client
                .post(url.clone())
                .header(CONTENT_TYPE, content_type)
                .body(bytes)
                .send()
                .await?;
            let status = resp.status();
            if !status.is_success() {
                return Err(StoreError::HttpStatus {
                    status: status.as_u16(),
                    url: url.to_string(),
                });
            }
            Ok(())
        }
        .instrument(span)
        .await
    }
}
