//! Typed configuration with synchronous reads and persisted async writes.

use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock};

use serde::{Deserialize, Serialize};

use crate::error::Result;

#[cfg(windows)]
const EXE_SUFFIX: &str = ".exe";
#[cfg(not(windows))]
const EXE_SUFFIX: &str = "";

/// Per-user data directory for managed binaries and caches.
pub fn default_data_dir() -> PathBuf {
    let base = if cfg!(windows) {
        std::env::var_os("APPDATA").map(PathBuf::from)
    } else if cfg!(target_os = "macos") {
        std::env::var_os("HOME").map(|home| PathBuf::from(home).join("Library/Application Support"))
    } else {
        std::env::var_os("XDG_DATA_HOME")
            .map(PathBuf::from)
            .or_else(|| {
                std::env::var_os("HOME").map(|home| PathBuf::from(home).join(".local/share"))
            })
    };

    base.unwrap_or_else(|| PathBuf::from(".")).join("mediagrab")
}

fn default_download_dir() -> PathBuf {
    std::env::var_os("HOME")
        .or_else(|| std::env::var_os("USERPROFILE"))
        .map(|home| PathBuf::from(home).join("Downloads"))
        .unwrap_or_else(|| PathBuf::from("."))
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Where finished media lands.
    pub download_dir: PathBuf,
    /// Output template handed to the media tool via `-o`.
    pub filename_template: String,
    /// Path to the media-fetching tool binary.
    pub tool_path: PathBuf,
    /// Path to the ffmpeg binary handed to the tool.
    pub ffmpeg_path: PathBuf,
    /// Path to the archive-extraction helper used during setup.
    pub archiver_path: PathBuf,
    /// Cookie file forwarded to the tool when set.
    pub cookie_file: Option<PathBuf>,
    /// Download single videos instead of whole playlists.
    pub skip_playlists: bool,
    /// Show a toast when a download finishes.
    pub completion_toast: bool,
}

impl Default for Settings {
    fn default() -> Self {
        let bin_dir = default_data_dir().join("bin");

        Self {
            download_dir: default_download_dir(),
            filename_template: "%(title)s.%(ext)s".to_string(),
            tool_path: bin_dir.join(format!("yt-dlp{EXE_SUFFIX}")),
            ffmpeg_path: bin_dir.join(format!("ffmpeg{EXE_SUFFIX}")),
            archiver_path: bin_dir.join(format!("7za{EXE_SUFFIX}")),
            cookie_file: None,
            skip_playlists: false,
            completion_toast: true,
        }
    }
}

/// Reads are snapshots of the in-memory state; writes mutate it and persist
/// the whole document to disk as JSON.
pub struct SettingsStore {
    path: Option<PathBuf>,
    state: RwLock<Settings>,
}

impl SettingsStore {
    /// Loads settings from `path`, falling back to defaults when the file
    /// does not exist yet.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let settings = match std::fs::read_to_string(&path) {
            Ok(text) => serde_json::from_str(&text)?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Settings::default(),
            Err(err) => return Err(err.into()),
        };

        Ok(Self {
            path: Some(path),
            state: RwLock::new(settings),
        })
    }

    /// In-memory store that never touches disk.
    pub fn ephemeral(settings: Settings) -> Self {
        Self {
            path: None,
            state: RwLock::new(settings),
        }
    }

    pub fn get(&self) -> Settings {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub async fn update(&self, apply: impl FnOnce(&mut Settings)) -> Result<()> {
        let snapshot = {
            let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
            apply(&mut state);
            state.clone()
        };

        if let Some(path) = &self.path {
            self.persist(path, &snapshot).await?;
        }

        Ok(())
    }

    async fn persist(&self, path: &Path, settings: &Settings) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        tokio::fs::write(path, serde_json::to_string_pretty(settings)?).await?;
        Ok(())
    }
}
