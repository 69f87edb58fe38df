//! Video thumbnail prefetch for completion toasts.

use std::path::{Path, PathBuf};

use crate::cancellation::CancellationToken;
use crate::error::{Error, Result};
use crate::net::HttpClient;

const THUMBNAIL_URL_BASE: &str = "https://i.ytimg.com/vi";

/// Downloads video thumbnails into a cache directory so the notification
/// layer can attach them to completion toasts.
pub struct ThumbnailCache {
    http: HttpClient,
    cache_dir: PathBuf,
}

impl ThumbnailCache {
    pub fn new(http: HttpClient, cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            http,
            cache_dir: cache_dir.into(),
        }
    }

    /// Path to the cached thumbnail for `video_id`, fetching it on a miss.
    pub async fn fetch(&self, video_id: &str) -> Result<PathBuf> {
        let path = self.cache_dir.join(format!("{video_id}.jpg"));
        if file_exists(&path).await {
            log::debug!("found existing thumbnail at {}", path.display());
            return Ok(path);
        }

        tokio::fs::create_dir_all(&self.cache_dir).await?;

        let url = format!("{THUMBNAIL_URL_BASE}/{video_id}/maxresdefault.jpg");
        let response = self.http.get(&url).await?;
        if !response.status().is_success() {
            return Err(Error::Status {
                status: response.status(),
                url,
            });
        }

        self.http
            .download_with_progress(response, &path, &CancellationToken::none(), |_| {})
            .await?;

        log::debug!("wrote thumbnail to {}", path.display());

        Ok(path)
    }
}

async fn file_exists(path: &Path) -> bool {
    tokio::fs::metadata(path).await.is_ok()
}
