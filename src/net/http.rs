use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use futures_util::StreamExt;
use tokio::fs::File;
use tokio::io::AsyncWriteExt;

use super::RetryPolicy;
use crate::cancellation::CancellationToken;
use crate::error::{Error, Result};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct HttpClientOptions {
    pub name: String,
    pub base_url: Option<String>,
    pub user_agent: String,
    pub retry: bool,
    pub retry_policy: RetryPolicy,
}

impl HttpClientOptions {
    pub fn new(name: impl Into<String>, user_agent: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            base_url: None,
            user_agent: user_agent.into(),
            retry: false,
            retry_policy: RetryPolicy::transient(),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = Some(base_url.into());
        self
    }

    pub fn with_retry(mut self, retry: bool) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }
}

/// How a streaming download ended. An abort is a clean early exit, not a
/// failure; callers that need to distinguish must match on this.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadOutcome {
    Completed,
    Aborted,
}

/// Named wrapper around a [`reqwest::Client`] with optional transparent
/// retries and a streaming download primitive.
pub struct HttpClient {
    name: String,
    base_url: Option<String>,
    retry: Option<RetryPolicy>,
    client: reqwest::Client,
    request_seq: AtomicU64,
}

impl HttpClient {
    pub fn new(options: HttpClientOptions) -> Result<Self> {
        let client = reqwest::Client::builder()
            .use_rustls_tls()
            .connect_timeout(CONNECT_TIMEOUT)
            .user_agent(options.user_agent)
            .build()?;

        Ok(Self {
            name: options.name,
            base_url: options.base_url,
            retry: options.retry.then_some(options.retry_policy),
            client,
            request_seq: AtomicU64::new(0),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn resolve_url(&self, url: &str) -> String {
        match &self.base_url {
            Some(base) if !url.starts_with("http://") && !url.starts_with("https://") => {
                format!(
                    "{}/{}",
                    base.trim_end_matches('/'),
                    url.trim_start_matches('/')
                )
            }
            _ => url.to_string(),
        }
    }

    pub async fn get(&self, url: &str) -> Result<reqwest::Response> {
        self.request(reqwest::Method::GET, url).await
    }

    pub async fn request(
        &self,
        method: reqwest::Method,
        url: &str,
    ) -> Result<reqwest::Response> {
        let request_url = self.resolve_url(url);
        // Request ids exist for log correlation only
        let request_id = self.request_seq.fetch_add(1, Ordering::Relaxed) + 1;

        log::debug!(
            "{}#{request_id}: {method} {request_url} (retry: {})",
            self.name,
            self.retry.is_some()
        );

        let send = || {
            self.client
                .request(method.clone(), &request_url)
                .header(reqwest::header::ACCEPT, "application/json")
                .send()
        };

        let response = match &self.retry {
            Some(policy) => policy.run(send).await?,
            None => send().await?,
        };

        log::debug!("{}#{request_id}: {} {request_url}", self.name, response.status());

        Ok(response)
    }

    pub async fn get_json<T>(&self, url: &str) -> Result<T>
    where
        T: serde::de::DeserializeOwned,
    {
        let response = self.get(url).await?;
        if !response.status().is_success() {
            return Err(Error::Status {
                status: response.status(),
                url: response.url().to_string(),
            });
        }

        Ok(response.json().await?)
    }

    /// Cheap reachability probe; any error counts as offline.
    pub async fn probe(&self, url: &str) -> bool {
        match self.get(url).await {
            Ok(response) => response.status().is_success(),
            Err(_) => false,
        }
    }

    /// Streams `response` to `destination`, reporting rounded percentages
    /// after each chunk when the total size is known from `content-length`.
    ///
    /// Cancelling `token` removes the partial file and returns
    /// [`DownloadOutcome::Aborted`]. Stream and IO errors also remove the
    /// partial file but surface as failures.
    pub async fn download_with_progress<F>(
        &self,
        response: reqwest::Response,
        destination: &Path,
        token: &CancellationToken,
        on_progress: F,
    ) -> Result<DownloadOutcome>
    where
        F: FnMut(u8),
    {
        if !response.status().is_success() {
            return Err(Error::Status {
                status: response.status(),
                url: response.url().to_string(),
            });
        }

        let result = self
            .stream_to_file(response, destination, token, on_progress)
            .await;

        if result.is_err() {
            let _ = tokio::fs::remove_file(destination).await;
        }

        result
    }

    async fn stream_to_file<F>(
        &self,
        response: reqwest::Response,
        destination: &Path,
        token: &CancellationToken,
        mut on_progress: F,
    ) -> Result<DownloadOutcome>
    where
        F: FnMut(u8),
    {
        let total = response.content_length().unwrap_or(0);

        if let Some(parent) = destination.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let mut file = File::create(destination).await?;
        let mut stream = response.bytes_stream();
        let mut downloaded = 0u64;

        loop {
            let next = tokio::select! {
                biased;
                _ = token.cancelled() => {
                    drop(file);
                    let _ = tokio::fs::remove_file(destination).await;
                    log::debug!(
                        "{}: download to {} aborted after {downloaded} bytes",
                        self.name,
                        destination.display()
                    );
                    return Ok(DownloadOutcome::Aborted);
                }
                next = stream.next() => next,
            };

            let Some(chunk) = next else { break };
            let chunk = chunk?;

            file.write_all(&chunk).await?;
            downloaded += chunk.len() as u64;

            if total > 0 {
                let percent = ((downloaded as f64 / total as f64) * 100.0).round() as u8;
                on_progress(percent.min(100));
            }
        }

        file.flush().await?;

        Ok(DownloadOutcome::Completed)
    }
}
