//! Self-update pipeline: poll releases, download the installer, verify it,
//! run it.

mod verify;

pub use verify::{InstallerVerification, parse_checksum_text, parse_digest, verify_installer};

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Mutex, MutexGuard, PoisonError};

use semver::Version;

use crate::cancellation::CancellationTokenSource;
use crate::error::{Error, Result};
use crate::events::{EventBus, UpdateEvent};
use crate::github::{Commit, Release, ReleaseAsset, ReleaseSource};
use crate::net::{DownloadOutcome, HttpClient, HttpClientOptions};

#[derive(Debug, Clone)]
pub struct UpdaterConfig {
    pub repo_owner: String,
    pub repo_name: String,
    /// Version of the running build, compared against release tags.
    pub current_version: Version,
    /// Commit the running build was made from, for changelog context.
    pub build_sha: Option<String>,
    /// Exact asset name of the platform installer.
    pub installer_asset: String,
    pub user_agent: String,
}

#[derive(Default)]
struct UpdaterState {
    pending: Option<Release>,
    commits: Vec<Commit>,
    source: Option<CancellationTokenSource>,
}

pub struct UpdateOrchestrator<R: ReleaseSource> {
    http: HttpClient,
    releases: R,
    events: EventBus,
    config: UpdaterConfig,
    state: Mutex<UpdaterState>,
}

impl<R: ReleaseSource> UpdateOrchestrator<R> {
    pub fn new(config: UpdaterConfig, releases: R, events: EventBus) -> Result<Self> {
        let http = HttpClient::new(
            HttpClientOptions::new("Updater", config.user_agent.as_str()).with_retry(true),
        )?;

        Ok(Self {
            http,
            releases,
            events,
            config,
            state: Mutex::new(UpdaterState::default()),
        })
    }

    fn lock(&self) -> MutexGuard<'_, UpdaterState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn has_new_release(&self) -> bool {
        self.lock().pending.is_some()
    }

    pub fn pending_release(&self) -> Option<Release> {
        self.lock().pending.clone()
    }

    /// Commits newer than the running build, recorded by the last check.
    pub fn commits_since_build(&self) -> Vec<Commit> {
        self.lock().commits.clone()
    }

    fn tag_version(tag: &str) -> Option<Version> {
        Version::parse(tag.trim_start_matches('v')).ok()
    }

    /// Fetches the release feed and records the first stable release newer
    /// than the running version. Returns whether one was found.
    pub async fn check_for_updates(&self, manual: bool) -> Result<bool> {
        log::info!("checking for updates (manual: {manual})");
        self.events.emit(UpdateEvent::Checking);

        let releases = self
            .releases
            .releases(&self.config.repo_owner, &self.config.repo_name)
            .await?;

        let newer = releases.iter().filter(|release| !release.prerelease).find(
            |release| match Self::tag_version(&release.tag_name) {
                Some(version) => version > self.config.current_version,
                None => false,
            },
        );

        let Some(release) = newer else {
            log::info!("no new releases found");
            self.events.emit(UpdateEvent::UpToDate);
            return Ok(false);
        };

        log::info!("found new release {}", release.tag_name);

        let commits = match &self.config.build_sha {
            Some(sha) => self
                .releases
                .commits_since(&self.config.repo_owner, &self.config.repo_name, sha)
                .await
                .unwrap_or_else(|err| {
                    log::warn!("failed to fetch commits since build: {err}");
                    Vec::new()
                }),
            None => Vec::new(),
        };

        {
            let mut state = self.lock();
            state.pending = Some(release.clone());
            state.commits = commits;
        }

        self.events.emit(UpdateEvent::Outdated {
            tag: release.tag_name.clone(),
        });

        Ok(true)
    }

    /// Downloads the pending installer, verifies its integrity and spawns it
    /// detached. Cancellation at any step is a clean, non-error exit. The
    /// installer is never executed without a verified SHA-256.
    pub async fn start_update(&self) -> Result<()> {
        let (release, token) = {
            let mut state = self.lock();
            let Some(release) = state.pending.clone() else {
                return Err(Error::NotFound(
                    "no pending release to install".to_string(),
                ));
            };

            if let Some(stale) = state.source.take() {
                stale.dispose();
            }
            let source = CancellationTokenSource::new();
            let token = source.token()?;
            state.source = Some(source);

            (release, token)
        };

        let asset = release
            .assets
            .iter()
            .find(|asset| asset.name == self.config.installer_asset)
            .ok_or_else(|| {
                Error::NotFound(format!(
                    "release {} has no installer asset named {}",
                    release.tag_name, self.config.installer_asset
                ))
            })?;

        let expected_sha256 = self.resolve_expected_hash(&release, asset).await?;

        log::info!("downloading installer from {}", asset.browser_download_url);

        let response = self.http.get(&asset.browser_download_url).await?;
        let temp = std::env::temp_dir().join(&self.config.installer_asset);

        let events = self.events.clone();
        let outcome = self
            .http
            .download_with_progress(response, &temp, &token, move |percent| {
                events.emit(UpdateEvent::Step {
                    message: format!("Downloading installer... ({percent}%)"),
                });
            })
            .await?;

        if outcome == DownloadOutcome::Aborted || token.is_cancelled() {
            log::info!("update cancelled before installation");
            self.events.emit(UpdateEvent::Cancelled);
            let _ = tokio::fs::remove_file(&temp).await;
            return Ok(());
        }

        let verification = InstallerVerification {
            expected_sha256,
            declared_size: asset.size,
        };
        if let Err(err) = verify_installer(&temp, &verification).await {
            let _ = tokio::fs::remove_file(&temp).await;
            log::error!("installer failed verification: {err}");
            return Err(err);
        }

        self.events.emit(UpdateEvent::Step {
            message: "Running setup...".to_string(),
        });
        log::info!("spawning installer at {}", temp.display());

        self.spawn_installer(&temp)?;
        self.events.emit(UpdateEvent::InstallerLaunched);

        Ok(())
    }

    /// Resolution order: sidecar `<asset>.sha256` text, then the asset's own
    /// digest field. No hash means no update.
    async fn resolve_expected_hash(
        &self,
        release: &Release,
        asset: &ReleaseAsset,
    ) -> Result<String> {
        let sidecar_name = format!("{}.sha256", asset.name);
        if let Some(sidecar) = release
            .assets
            .iter()
            .find(|candidate| candidate.name == sidecar_name)
        {
            let response = self.http.get(&sidecar.browser_download_url).await?;
            if response.status().is_success() {
                let text = response.text().await?;
                if let Some(hash) = parse_checksum_text(&text) {
                    return Ok(hash);
                }
                log::warn!("checksum asset {sidecar_name} contained no SHA-256 token");
            } else {
                log::warn!(
                    "checksum asset {sidecar_name} fetch failed: HTTP {}",
                    response.status()
                );
            }
        }

        if let Some(hash) = asset.digest.as_deref().and_then(parse_digest) {
            return Ok(hash);
        }

        Err(Error::NotFound(format!(
            "no trusted SHA-256 found for {}; refusing to run an installer that cannot be verified",
            asset.name
        )))
    }

    fn spawn_installer(&self, path: &Path) -> Result<()> {
        let mut command = std::process::Command::new(path);
        command
            .args(["/UPDATE", "/SILENT"])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());

        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            // Detach from our process group so it survives host exit
            command.process_group(0);
        }

        command.spawn().map_err(|err| Error::Process {
            context: format!("failed to spawn installer {}: {err}", path.display()),
            exit_code: None,
        })?;

        Ok(())
    }

    /// Aborts any in-flight installer download. Safe no-op when idle.
    pub fn cancel_update(&self) {
        let state = self.lock();
        if let Some(source) = &state.source {
            let _ = source.cancel("Update cancelled");
        }
    }

    /// Fixed temp location the installer is downloaded to.
    pub fn installer_temp_path(&self) -> PathBuf {
        std::env::temp_dir().join(&self.config.installer_asset)
    }
}
