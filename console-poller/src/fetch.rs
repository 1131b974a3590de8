//! Fetch capabilities consumed by poller streams
//!
//! A stream knows nothing about transport; it hands its resource key to a
//! [`Fetcher`] and receives either a typed payload or a [`FetchError`].

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;
use url::Url;

use crate::error::{FetchError, PollerError, Result};

/// Resolves a resource key to a fresh payload
#[async_trait]
pub trait Fetcher<T>: Send + Sync {
    /// Fetch the current state of the resource identified by `key`.
    async fn fetch(&self, key: &str) -> std::result::Result<T, FetchError>;
}

/// Adapter turning an async closure into a [`Fetcher`]
pub struct FnFetcher<F> {
    f: F,
}

/// Wrap an async closure `Fn(String) -> Future<Output = Result<T, FetchError>>`.
///
/// ```rust,ignore
/// let fetcher = fetch_fn(|key| async move {
///     Ok::<_, FetchError>(format!("payload for {key}"))
/// });
/// ```
pub fn fetch_fn<F>(f: F) -> FnFetcher<F> {
    FnFetcher { f }
}

#[async_trait]
impl<T, F, Fut> Fetcher<T> for FnFetcher<F>
where
    T: Send + 'static,
    F: Fn(String) -> Fut + Send + Sync,
    Fut: Future<Output = std::result::Result<T, FetchError>> + Send + 'static,
{
    async fn fetch(&self, key: &str) -> std::result::Result<T, FetchError> {
        (self.f)(key.to_string()).await
    }
}

#[async_trait]
impl<T, F> Fetcher<T> for Arc<F>
where
    T: Send + 'static,
    F: Fetcher<T> + ?Sized,
{
    async fn fetch(&self, key: &str) -> std::result::Result<T, FetchError> {
        (**self).fetch(key).await
    }
}

/// JSON-over-HTTP fetch capability for the console's REST API
///
/// Resource keys are resolved relative to the base URL, so a key may carry a
/// query string (`adapters?expanded=all`). Non-success statuses become
/// [`FetchError::Status`]; bodies are decoded into `T` with serde.
pub struct HttpFetcher<T> {
    client: reqwest::Client,
    base_url: Url,
    _payload: PhantomData<fn() -> T>,
}

impl<T> HttpFetcher<T> {
    /// Create a fetcher rooted at `base_url` (e.g. `http://localhost/iaf/api/`).
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| PollerError::HttpClient(e.to_string()))?;
        Self::with_client(client, base_url)
    }

    /// Use a pre-configured client, e.g. one carrying authentication headers.
    pub fn with_client(client: reqwest::Client, base_url: &str) -> Result<Self> {
        let mut base_url = Url::parse(base_url)
            .map_err(|e| PollerError::Configuration(format!("Invalid base URL {base_url}: {e}")))?;
        // Keys are joined relative to the last path segment
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }

        Ok(Self {
            client,
            base_url,
            _payload: PhantomData,
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Resolve a resource key against the base URL.
    pub fn resolve(&self, key: &str) -> std::result::Result<Url, FetchError> {
        self.base_url
            .join(key.trim_start_matches('/'))
            .map_err(|e| FetchError::InvalidKey(format!("{key}: {e}")))
    }
}

#[async_trait]
impl<T> Fetcher<T> for HttpFetcher<T>
where
    T: DeserializeOwned + Send + 'static,
{
    async fn fetch(&self, key: &str) -> std::result::Result<T, FetchError> {
        let url = self.resolve(key)?;
        tracing::trace!(%url, "Polling resource");

        let response = self.client.get(url.clone()).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status {
                status: status.as_u16(),
                url: url.to_string(),
            });
        }

        let body = response.bytes().await?;
        serde_json::from_slice(&body).map_err(|e| FetchError::Decode(e.to_string()))
    }
}
