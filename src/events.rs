//! One-way event transport towards the notification/UI layer.

use tokio::sync::broadcast;

use crate::jobs::session::{DownloadSession, JobId};

/// Lifecycle notifications for queued download jobs.
#[derive(Debug, Clone)]
pub enum JobEvent {
    Queued { session: DownloadSession },
    Started { session: DownloadSession },
    /// A raw output line from the media tool, forwarded verbatim.
    Output { id: JobId, line: String },
    Progress { id: JobId, percent: u8 },
    Cancelled { id: JobId },
    /// Emitted exactly once per session, after every other event of that job.
    Finished { session: DownloadSession },
    ToolUpdating,
    ToolUpdated,
}

/// Notifications from the third-party binary installer.
#[derive(Debug, Clone)]
pub enum SetupEvent {
    Progress { tool: &'static str, percent: u8 },
    Extracting { tool: &'static str },
    CleaningUp { tool: &'static str },
    Unavailable { tool: &'static str },
}

/// Notifications from the self-update pipeline.
#[derive(Debug, Clone)]
pub enum UpdateEvent {
    Checking,
    UpToDate,
    Outdated { tag: String },
    Step { message: String },
    Cancelled,
    /// The installer process has spawned; the host should exit now.
    InstallerLaunched,
}

#[derive(Debug, Clone)]
pub enum AppEvent {
    Job(JobEvent),
    Setup(SetupEvent),
    Update(UpdateEvent),
}

impl From<JobEvent> for AppEvent {
    fn from(event: JobEvent) -> Self {
        Self::Job(event)
    }
}

impl From<SetupEvent> for AppEvent {
    fn from(event: SetupEvent) -> Self {
        Self::Setup(event)
    }
}

impl From<UpdateEvent> for AppEvent {
    fn from(event: UpdateEvent) -> Self {
        Self::Update(event)
    }
}

/// Broadcast fan-out for app events. Emitting with no subscribers is fine.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<AppEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AppEvent> {
        self.sender.subscribe()
    }

    pub fn emit(&self, event: impl Into<AppEvent>) {
        // Nobody listening is not an error
        let _ = self.sender.send(event.into());
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
