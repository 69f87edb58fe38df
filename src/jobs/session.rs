use chrono::{DateTime, Utc};

pub type JobId = u64;

/// `Queued → Running → {Succeeded | Failed | Cancelled}`; terminal states are
/// final.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Queued,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Cancelled)
    }
}

/// One queued-and-run invocation of the media tool.
#[derive(Debug, Clone)]
pub struct DownloadSession {
    pub id: JobId,
    pub url: String,
    pub audio_only: bool,
    /// Percentage in [0, 100], non-decreasing while running.
    pub progress: u8,
    pub state: JobState,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl DownloadSession {
    pub(crate) fn new(id: JobId, url: String, audio_only: bool) -> Self {
        Self {
            id,
            url,
            audio_only,
            progress: 0,
            state: JobState::Queued,
            started_at: None,
            finished_at: None,
        }
    }

    /// Clamps a parsed percentage to [0, 100] and stores it when it advances
    /// past the current value. Returns the stored value when it did.
    pub(crate) fn apply_progress(&mut self, percent: f64) -> Option<u8> {
        let clamped = percent.clamp(0.0, 100.0).round() as u8;
        if clamped > self.progress {
            self.progress = clamped;
            Some(clamped)
        } else {
            None
        }
    }
}
