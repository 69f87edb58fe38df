//! Release metadata from the GitHub REST API.

use std::future::Future;

use serde::Deserialize;

use crate::error::{Error, Result};
use crate::net::{HttpClient, HttpClientOptions};

const API_BASE_URL: &str = "https://api.github.com";

#[derive(Debug, Clone, Deserialize)]
pub struct ReleaseAsset {
    pub name: String,
    pub browser_download_url: String,
    #[serde(default)]
    pub size: u64,
    /// `sha256:<hex>` when the registry recorded one.
    #[serde(default)]
    pub digest: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Release {
    pub tag_name: String,
    #[serde(default)]
    pub prerelease: bool,
    #[serde(default)]
    pub assets: Vec<ReleaseAsset>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Commit {
    pub sha: String,
    pub commit: CommitDetails,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CommitDetails {
    pub message: String,
}

/// Read-only source of release metadata. Fetched fresh on every call.
pub trait ReleaseSource: Send + Sync {
    fn releases(
        &self,
        owner: &str,
        repo: &str,
    ) -> impl Future<Output = Result<Vec<Release>>> + Send;

    fn latest_release(
        &self,
        owner: &str,
        repo: &str,
    ) -> impl Future<Output = Result<Option<Release>>> + Send;

    /// Commits newer than `sha`, newest first.
    fn commits_since(
        &self,
        owner: &str,
        repo: &str,
        sha: &str,
    ) -> impl Future<Output = Result<Vec<Commit>>> + Send;
}

pub struct GithubClient {
    http: HttpClient,
}

impl GithubClient {
    pub fn new(user_agent: &str) -> Result<Self> {
        let http = HttpClient::new(
            HttpClientOptions::new("GitHub", user_agent)
                .with_base_url(API_BASE_URL)
                .with_retry(true),
        )?;

        Ok(Self { http })
    }
}

impl ReleaseSource for GithubClient {
    fn releases(
        &self,
        owner: &str,
        repo: &str,
    ) -> impl Future<Output = Result<Vec<Release>>> + Send {
        async move {
            self.http
                .get_json(&format!("repos/{owner}/{repo}/releases"))
                .await
        }
    }

    fn latest_release(
        &self,
        owner: &str,
        repo: &str,
    ) -> impl Future<Output = Result<Option<Release>>> + Send {
        async move {
            let response = self
                .http
                .get(&format!("repos/{owner}/{repo}/releases/latest"))
                .await?;

            if response.status() == reqwest::StatusCode::NOT_FOUND {
                return Ok(None);
            }
            if !response.status().is_success() {
                return Err(Error::Status {
                    status: response.status(),
                    url: response.url().to_string(),
                });
            }

            Ok(Some(response.json().await?))
        }
    }

    fn commits_since(
        &self,
        owner: &str,
        repo: &str,
        sha: &str,
    ) -> impl Future<Output = Result<Vec<Commit>>> + Send {
        async move {
            let commits: Vec<Commit> = self
                .http
                .get_json(&format!("repos/{owner}/{repo}/commits"))
                .await?;

            Ok(commits
                .into_iter()
                .take_while(|commit| commit.sha != sha)
                .collect())
        }
    }
}
