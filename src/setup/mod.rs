//! Downloads and installs the third-party tools the app drives: the media
//! tool itself and the ffmpeg build it needs.

use std::path::Path;
use std::process::Stdio;

use tokio::process::Command;

use crate::cancellation::CancellationToken;
use crate::error::{Error, Result};
use crate::events::{EventBus, SetupEvent};
use crate::github::ReleaseSource;
use crate::net::{DownloadOutcome, HttpClient};

const TOOL_REPO: (&str, &str) = ("yt-dlp", "yt-dlp");
const FFMPEG_REPO: (&str, &str) = ("yt-dlp", "FFmpeg-Builds");

const TOOL_NAME: &str = "yt-dlp";
const FFMPEG_NAME: &str = "ffmpeg";

fn tool_asset_name() -> &'static str {
    match std::env::consts::OS {
        "windows" => "yt-dlp.exe",
        "macos" => "yt-dlp_macos",
        _ => "yt-dlp",
    }
}

fn ffmpeg_asset_fragment() -> Option<&'static str> {
    match std::env::consts::OS {
        "windows" => Some("win64-gpl.zip"),
        "linux" => Some("linux64-gpl.tar.xz"),
        _ => None,
    }
}

fn ffmpeg_binaries() -> [&'static str; 2] {
    if cfg!(windows) {
        ["ffmpeg.exe", "ffprobe.exe"]
    } else {
        ["ffmpeg", "ffprobe"]
    }
}

/// How an install attempt ended. `Unavailable` and `Aborted` are not errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetupOutcome {
    Installed,
    /// The download URL could not be resolved or fetched.
    Unavailable,
    Aborted,
}

pub struct BinaryDownloader<R: ReleaseSource> {
    http: HttpClient,
    releases: R,
    events: EventBus,
}

impl<R: ReleaseSource> BinaryDownloader<R> {
    pub fn new(http: HttpClient, releases: R, events: EventBus) -> Self {
        Self {
            http,
            releases,
            events,
        }
    }

    /// Installs the media tool binary at `destination`.
    pub async fn install_media_tool(
        &self,
        destination: &Path,
        token: &CancellationToken,
    ) -> Result<SetupOutcome> {
        let Some(url) = self
            .resolve_asset_url(TOOL_REPO, |name| name == tool_asset_name())
            .await
        else {
            self.events.emit(SetupEvent::Unavailable { tool: TOOL_NAME });
            return Ok(SetupOutcome::Unavailable);
        };

        let response = self.http.get(&url).await?;
        if !response.status().is_success() {
            log::warn!("media tool download failed: HTTP {}", response.status());
            self.events.emit(SetupEvent::Unavailable { tool: TOOL_NAME });
            return Ok(SetupOutcome::Unavailable);
        }

        let temp = std::env::temp_dir().join(format!("_{}", tool_asset_name()));
        let events = self.events.clone();
        let outcome = self
            .http
            .download_with_progress(response, &temp, token, move |percent| {
                events.emit(SetupEvent::Progress {
                    tool: TOOL_NAME,
                    percent,
                });
            })
            .await?;

        if outcome == DownloadOutcome::Aborted {
            return Ok(SetupOutcome::Aborted);
        }

        if let Some(parent) = destination.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        move_file(&temp, destination).await?;

        #[cfg(unix)]
        make_executable(destination).await?;

        log::info!("installed media tool at {}", destination.display());

        Ok(SetupOutcome::Installed)
    }

    /// Downloads the ffmpeg release archive and extracts the binaries into
    /// `destination_dir` through the external archiver, replacing existing
    /// files. The temp archive is removed on every path.
    pub async fn install_ffmpeg(
        &self,
        destination_dir: &Path,
        archiver: &Path,
        token: &CancellationToken,
    ) -> Result<SetupOutcome> {
        let Some(fragment) = ffmpeg_asset_fragment() else {
            log::warn!("no ffmpeg build published for this platform");
            self.events
                .emit(SetupEvent::Unavailable { tool: FFMPEG_NAME });
            return Ok(SetupOutcome::Unavailable);
        };

        let Some(url) = self
            .resolve_asset_url(FFMPEG_REPO, |name| name.contains(fragment))
            .await
        else {
            self.events
                .emit(SetupEvent::Unavailable { tool: FFMPEG_NAME });
            return Ok(SetupOutcome::Unavailable);
        };

        let response = self.http.get(&url).await?;
        if !response.status().is_success() {
            log::warn!("ffmpeg download failed: HTTP {}", response.status());
            self.events
                .emit(SetupEvent::Unavailable { tool: FFMPEG_NAME });
            return Ok(SetupOutcome::Unavailable);
        }

        let temp = std::env::temp_dir().join("_ffmpeg-release.archive");
        let events = self.events.clone();
        let outcome = self
            .http
            .download_with_progress(response, &temp, token, move |percent| {
                events.emit(SetupEvent::Progress {
                    tool: FFMPEG_NAME,
                    percent,
                });
            })
            .await?;

        if outcome == DownloadOutcome::Aborted {
            return Ok(SetupOutcome::Aborted);
        }
        if token.is_cancelled() {
            let _ = tokio::fs::remove_file(&temp).await;
            return Ok(SetupOutcome::Aborted);
        }

        self.events.emit(SetupEvent::Extracting { tool: FFMPEG_NAME });
        tokio::fs::create_dir_all(destination_dir).await?;

        let result = self.extract(archiver, &temp, destination_dir).await;

        self.events.emit(SetupEvent::CleaningUp { tool: FFMPEG_NAME });
        let _ = tokio::fs::remove_file(&temp).await;

        result?;
        log::info!("installed ffmpeg into {}", destination_dir.display());

        Ok(SetupOutcome::Installed)
    }

    async fn extract(&self, archiver: &Path, archive: &Path, destination: &Path) -> Result<()> {
        let mut command = Command::new(archiver);
        command
            .arg("e")
            .arg(archive)
            .arg("-r")
            .arg(format!("-o{}", destination.display()))
            .arg("-aoa")
            .args(ffmpeg_binaries())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped());

        let output = command.output().await.map_err(|err| Error::Process {
            context: format!("failed to spawn archiver {}: {err}", archiver.display()),
            exit_code: None,
        })?;

        if !output.status.success() {
            return Err(Error::Process {
                context: format!(
                    "archiver failed to extract {}: {}",
                    archive.display(),
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
                exit_code: output.status.code(),
            });
        }

        Ok(())
    }

    async fn resolve_asset_url(
        &self,
        (owner, repo): (&str, &str),
        matches: impl Fn(&str) -> bool,
    ) -> Option<String> {
        let release = match self.releases.latest_release(owner, repo).await {
            Ok(Some(release)) => release,
            Ok(None) => {
                log::error!("could not retrieve latest release for {owner}/{repo}");
                return None;
            }
            Err(err) => {
                log::error!("failed to fetch latest release for {owner}/{repo}: {err}");
                return None;
            }
        };

        let asset = release.assets.iter().find(|asset| matches(&asset.name));
        if asset.is_none() {
            log::error!("no matching asset in the latest {owner}/{repo} release");
        }

        asset.map(|asset| asset.browser_download_url.clone())
    }
}

/// Rename, falling back to copy-and-delete across filesystems.
async fn move_file(from: &Path, to: &Path) -> Result<()> {
    if tokio::fs::rename(from, to).await.is_ok() {
        return Ok(());
    }

    tokio::fs::copy(from, to).await?;
    tokio::fs::remove_file(from).await?;
    Ok(())
}

#[cfg(unix)]
async fn make_executable(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;

    let mut permissions = tokio::fs::metadata(path).await?.permissions();
    permissions.set_mode(0o755);
    tokio::fs::set_permissions(path, permissions).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::github::{Commit, Release, ReleaseAsset};
    use crate::net::HttpClientOptions;
    use std::future::Future;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    struct FakeReleases {
        latest: Option<Release>,
    }

    impl ReleaseSource for FakeReleases {
        fn releases(
            &self,
            _owner: &str,
            _repo: &str,
        ) -> impl Future<Output = crate::Result<Vec<Release>>> + Send {
            async move { Ok(self.latest.clone().into_iter().collect()) }
        }

        fn latest_release(
            &self,
            _owner: &str,
            _repo: &str,
        ) -> impl Future<Output = crate::Result<Option<Release>>> + Send {
            async move { Ok(self.latest.clone()) }
        }

        fn commits_since(
            &self,
            _owner: &str,
            _repo: &str,
            _sha: &str,
        ) -> impl Future<Output = crate::Result<Vec<Commit>>> + Send {
            async move { Ok(Vec::new()) }
        }
    }

    fn test_http() -> HttpClient {
        HttpClient::new(HttpClientOptions::new("setup-test", "mediagrab-tests"))
            .expect("client builds")
    }

    async fn serve_bytes(body: Vec<u8>) -> (String, Arc<AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("local addr");
        let served = Arc::new(AtomicUsize::new(0));

        let counter = served.clone();
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                let mut request = [0u8; 4096];
                let _ = socket.read(&mut request).await;
                let header = format!(
                    "HTTP/1.1 200 OK\r\ncontent-length: {}\r\nconnection: close\r\n\r\n",
                    body.len()
                );
                let _ = socket.write_all(header.as_bytes()).await;
                let _ = socket.write_all(&body).await;
                counter.fetch_add(1, Ordering::SeqCst);
                let _ = socket.shutdown().await;
            }
        });

        (format!("http://{addr}/asset"), served)
    }

    fn release_with_asset(name: &str, url: &str) -> Release {
        Release {
            tag_name: "v1.0.0".to_string(),
            prerelease: false,
            assets: vec![ReleaseAsset {
                name: name.to_string(),
                browser_download_url: url.to_string(),
                size: 0,
                digest: None,
            }],
        }
    }

    #[tokio::test]
    async fn missing_release_is_reported_unavailable_not_an_error() {
        let downloader =
            BinaryDownloader::new(test_http(), FakeReleases { latest: None }, EventBus::default());

        let dir = tempfile::tempdir().expect("tempdir");
        let outcome = downloader
            .install_media_tool(&dir.path().join("yt-dlp"), &CancellationToken::none())
            .await
            .expect("not a hard error");

        assert_eq!(outcome, SetupOutcome::Unavailable);
    }

    #[tokio::test]
    async fn release_without_a_matching_asset_is_unavailable() {
        let release = release_with_asset("something-else.tar.gz", "http://127.0.0.1:1/nope");
        let downloader = BinaryDownloader::new(
            test_http(),
            FakeReleases {
                latest: Some(release),
            },
            EventBus::default(),
        );

        let dir = tempfile::tempdir().expect("tempdir");
        let outcome = downloader
            .install_media_tool(&dir.path().join("yt-dlp"), &CancellationToken::none())
            .await
            .expect("not a hard error");

        assert_eq!(outcome, SetupOutcome::Unavailable);
    }

    #[tokio::test]
    async fn media_tool_lands_at_the_destination() {
        let body = b"#!/bin/sh\nexit 0\n".to_vec();
        let (url, _) = serve_bytes(body.clone()).await;
        let release = release_with_asset(tool_asset_name(), &url);

        let downloader = BinaryDownloader::new(
            test_http(),
            FakeReleases {
                latest: Some(release),
            },
            EventBus::default(),
        );

        let dir = tempfile::tempdir().expect("tempdir");
        let destination = dir.path().join("bin").join("yt-dlp");
        let outcome = downloader
            .install_media_tool(&destination, &CancellationToken::none())
            .await
            .expect("install succeeds");

        assert_eq!(outcome, SetupOutcome::Installed);
        assert_eq!(std::fs::read(&destination).expect("file exists"), body);
    }

    #[tokio::test]
    async fn pre_cancelled_token_skips_extraction_entirely() {
        let (url, _) = serve_bytes(b"not really an archive".to_vec()).await;
        let fragment = match ffmpeg_asset_fragment() {
            Some(fragment) => fragment,
            None => return,
        };
        let release = release_with_asset(&format!("ffmpeg-{fragment}"), &url);

        let downloader = BinaryDownloader::new(
            test_http(),
            FakeReleases {
                latest: Some(release),
            },
            EventBus::default(),
        );

        let dir = tempfile::tempdir().expect("tempdir");
        let outcome = downloader
            .install_ffmpeg(
                dir.path(),
                Path::new("/nonexistent/archiver"),
                &CancellationToken::already_cancelled(),
            )
            .await
            .expect("abort is clean");

        assert_eq!(outcome, SetupOutcome::Aborted);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn archiver_failure_is_a_hard_process_error() {
        let (url, _) = serve_bytes(b"not really an archive".to_vec()).await;
        let Some(fragment) = ffmpeg_asset_fragment() else {
            return;
        };
        let release = release_with_asset(&format!("ffmpeg-{fragment}"), &url);

        let downloader = BinaryDownloader::new(
            test_http(),
            FakeReleases {
                latest: Some(release),
            },
            EventBus::default(),
        );

        let dir = tempfile::tempdir().expect("tempdir");
        let result = downloader
            .install_ffmpeg(
                dir.path(),
                Path::new("/bin/false"),
                &CancellationToken::none(),
            )
            .await;

        assert!(matches!(result, Err(Error::Process { .. })));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn archiver_success_completes_the_install() {
        let (url, _) = serve_bytes(b"archive bytes".to_vec()).await;
        let Some(fragment) = ffmpeg_asset_fragment() else {
            return;
        };
        let release = release_with_asset(&format!("ffmpeg-{fragment}"), &url);

        let downloader = BinaryDownloader::new(
            test_http(),
            FakeReleases {
                latest: Some(release),
            },
            EventBus::default(),
        );

        let dir = tempfile::tempdir().expect("tempdir");
        let outcome = downloader
            .install_ffmpeg(
                dir.path(),
                Path::new("/bin/true"),
                &CancellationToken::none(),
            )
            .await
            .expect("install succeeds");

        assert_eq!(outcome, SetupOutcome::Installed);
    }
}
