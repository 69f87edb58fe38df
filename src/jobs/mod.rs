//! Single-flight download queue driving the external media tool.

pub mod parse;
pub mod session;
pub mod thumbnails;

use std::collections::VecDeque;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::Utc;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};

use crate::cancellation::CancellationToken;
use crate::error::{Error, Result};
use crate::events::{EventBus, JobEvent};
use crate::process::{ProcessTree, kill_tree};
use crate::settings::{Settings, SettingsStore};
use self::parse::{parse_progress, youtube_video_id};
use self::session::{DownloadSession, JobId, JobState};
use self::thumbnails::ThumbnailCache;

/// Builds the media-tool invocation for a session from current settings.
pub(crate) fn build_tool_command(
    settings: &Settings,
    session: &DownloadSession,
) -> (PathBuf, Vec<String>) {
    let mut url = session.url.clone();
    if settings.skip_playlists {
        if let Some(id) = youtube_video_id(&url) {
            url = format!("https://www.youtube.com/watch?v={id}");
        }
    }

    let output_template = settings.download_dir.join(&settings.filename_template);

    let mut args = Vec::new();
    if session.audio_only {
        args.extend([
            "-x".to_string(),
            "--audio-format".to_string(),
            "mp3".to_string(),
        ]);
    }
    args.push(url);
    args.push("-o".to_string());
    args.push(output_template.to_string_lossy().into_owned());
    args.push("--ffmpeg-location".to_string());
    args.push(settings.ffmpeg_path.to_string_lossy().into_owned());
    if let Some(cookies) = &settings.cookie_file {
        args.push("--cookies".to_string());
        args.push(cookies.to_string_lossy().into_owned());
    }
    if settings.skip_playlists {
        args.push("--no-playlist".to_string());
    }

    (settings.tool_path.clone(), args)
}

struct ActiveJob {
    session: DownloadSession,
    token: CancellationToken,
}

#[derive(Default)]
struct QueueState {
    pending: VecDeque<DownloadSession>,
    active: Option<ActiveJob>,
}

struct QueueInner {
    settings: Arc<SettingsStore>,
    events: EventBus,
    process_tree: Arc<dyn ProcessTree>,
    thumbnails: Option<Arc<ThumbnailCache>>,
    state: Mutex<QueueState>,
    next_id: AtomicU64,
}

impl QueueInner {
    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Dequeues and spawns the head job unless one is already running.
    /// Spawn failures mark the job failed and move on to the next.
    fn start_next(inner: &Arc<Self>) {
        loop {
            let mut state = inner.lock();
            if state.active.is_some() {
                return;
            }
            let Some(mut session) = state.pending.pop_front() else {
                return;
            };

            let settings = inner.settings.get();
            let (program, args) = build_tool_command(&settings, &session);

            log::info!("starting job {}: {}", session.id, program.display());

            let spawned = Command::new(&program)
                .args(&args)
                .stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .spawn();

            match spawned {
                Ok(child) => {
                    session.state = JobState::Running;
                    session.started_at = Some(Utc::now());

                    let token = CancellationToken::new();
                    state.active = Some(ActiveJob {
                        session: session.clone(),
                        token: token.clone(),
                    });
                    drop(state);

                    inner.events.emit(JobEvent::Started {
                        session: session.clone(),
                    });

                    Self::maybe_prefetch_thumbnail(inner, &settings, &session);

                    let watcher = Arc::clone(inner);
                    tokio::spawn(async move {
                        Self::watch(watcher, child, token).await;
                    });
                    return;
                }
                Err(err) => {
                    drop(state);
                    log::error!(
                        "failed to spawn {} for job {}: {err}",
                        program.display(),
                        session.id
                    );
                    session.state = JobState::Failed;
                    session.finished_at = Some(Utc::now());
                    inner.events.emit(JobEvent::Finished { session });
                }
            }
        }
    }

    fn maybe_prefetch_thumbnail(inner: &Arc<Self>, settings: &Settings, session: &DownloadSession) {
        if !settings.completion_toast {
            return;
        }
        let Some(thumbnails) = &inner.thumbnails else {
            return;
        };
        let Some(video_id) = youtube_video_id(&session.url) else {
            return;
        };

        let cache = Arc::clone(thumbnails);
        let video_id = video_id.to_string();
        tokio::spawn(async move {
            if let Err(err) = cache.fetch(&video_id).await {
                log::debug!("thumbnail prefetch failed: {err}");
            }
        });
    }

    /// Forwards output lines, tracks progress and finalises the session once
    /// the process is gone. Runs on its own task, one per job.
    async fn watch(inner: Arc<Self>, mut child: Child, token: CancellationToken) {
        let id = match inner.lock().active.as_ref() {
            Some(active) => active.session.id,
            None => return,
        };

        let stdout: Box<dyn AsyncRead + Unpin + Send> = match child.stdout.take() {
            Some(stream) => Box::new(stream),
            None => Box::new(tokio::io::empty()),
        };
        let stderr: Box<dyn AsyncRead + Unpin + Send> = match child.stderr.take() {
            Some(stream) => Box::new(stream),
            None => Box::new(tokio::io::empty()),
        };

        let mut stdout_lines = BufReader::new(stdout).lines();
        let mut stderr_lines = BufReader::new(stderr).lines();
        let mut stdout_done = false;
        let mut stderr_done = false;
        let mut cancelled = false;

        // Drain both streams to EOF so progress lines emitted just before
        // exit are never lost
        while !(stdout_done && stderr_done) {
            tokio::select! {
                _ = token.cancelled(), if !cancelled => {
                    cancelled = true;
                    if let Some(pid) = child.id() {
                        kill_tree(pid, inner.process_tree.as_ref());
                    }
                    let _ = child.start_kill();
                }
                line = stdout_lines.next_line(), if !stdout_done => {
                    match line {
                        Ok(Some(line)) => Self::handle_line(&inner, id, &line),
                        _ => stdout_done = true,
                    }
                }
                line = stderr_lines.next_line(), if !stderr_done => {
                    match line {
                        Ok(Some(line)) => Self::handle_line(&inner, id, &line),
                        _ => stderr_done = true,
                    }
                }
            }
        }

        let status = child.wait().await;

        let mut session = match inner.lock().active.take() {
            Some(active) => active.session,
            None => return,
        };

        session.state = if cancelled {
            JobState::Cancelled
        } else {
            match &status {
                Ok(status) if status.success() => JobState::Succeeded,
                _ => JobState::Failed,
            }
        };
        session.finished_at = Some(Utc::now());

        match (&status, session.state) {
            (_, JobState::Cancelled) => log::info!("job {id} cancelled"),
            (Ok(status), JobState::Failed) => {
                log::warn!("job {id} failed with exit code {:?}", status.code());
            }
            (Err(err), _) => log::warn!("job {id} failed: {err}"),
            _ => log::info!("job {id} succeeded"),
        }

        if cancelled {
            inner.events.emit(JobEvent::Cancelled { id });
        }
        inner.events.emit(JobEvent::Finished { session });

        Self::start_next(&inner);
    }

    fn handle_line(inner: &Arc<Self>, id: JobId, raw: &str) {
        let line = raw.trim();
        if line.is_empty() {
            return;
        }

        inner.events.emit(JobEvent::Output {
            id,
            line: line.to_string(),
        });

        if let Some(percent) = parse_progress(line) {
            let stored = {
                let mut state = inner.lock();
                state
                    .active
                    .as_mut()
                    .and_then(|active| active.session.apply_progress(percent))
            };
            if let Some(percent) = stored {
                inner.events.emit(JobEvent::Progress { id, percent });
            }
        }
    }
}

/// FIFO queue of download jobs with at most one running at a time.
pub struct DownloadQueue {
    inner: Arc<QueueInner>,
}

impl DownloadQueue {
    pub fn new(
        settings: Arc<SettingsStore>,
        events: EventBus,
        process_tree: Arc<dyn ProcessTree>,
        thumbnails: Option<ThumbnailCache>,
    ) -> Self {
        Self {
            inner: Arc::new(QueueInner {
                settings,
                events,
                process_tree,
                thumbnails: thumbnails.map(Arc::new),
                state: Mutex::new(QueueState::default()),
                next_id: AtomicU64::new(0),
            }),
        }
    }

    /// Appends a job and starts it immediately when the queue is idle.
    pub fn enqueue(&self, url: impl Into<String>, audio_only: bool) -> JobId {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let session = DownloadSession::new(id, url.into(), audio_only);

        log::info!("queued job {id} for {}", session.url);
        self.inner.events.emit(JobEvent::Queued {
            session: session.clone(),
        });
        self.inner.lock().pending.push_back(session);

        QueueInner::start_next(&self.inner);
        id
    }

    pub fn is_busy(&self) -> bool {
        self.inner.lock().active.is_some()
    }

    pub fn active_session(&self) -> Option<DownloadSession> {
        self.inner
            .lock()
            .active
            .as_ref()
            .map(|active| active.session.clone())
    }

    pub fn queued_sessions(&self) -> Vec<DownloadSession> {
        self.inner.lock().pending.iter().cloned().collect()
    }

    /// Kills the active job's whole process tree. No-op when idle.
    pub fn cancel_active(&self) {
        let active = {
            let state = self.inner.lock();
            state
                .active
                .as_ref()
                .map(|active| (active.session.id, active.token.clone()))
        };

        if let Some((id, token)) = active {
            log::info!("cancelling job {id}");
            token.cancel("Download cancelled");
        }
    }

    /// Runs the media tool's own self-update (`-U`) and waits for it.
    pub async fn update_tool(&self) -> Result<()> {
        let tool = self.inner.settings.get().tool_path;

        self.inner.events.emit(JobEvent::ToolUpdating);
        log::info!("updating media tool at {}", tool.display());

        let status = Command::new(&tool)
            .arg("-U")
            .stdin(Stdio::null())
            .status()
            .await
            .map_err(|err| Error::Process {
                context: format!("failed to run {}: {err}", tool.display()),
                exit_code: None,
            })?;

        if !status.success() {
            log::warn!("media tool self-update exited with {:?}", status.code());
        }
        self.inner.events.emit(JobEvent::ToolUpdated);

        Ok(())
    }
}
