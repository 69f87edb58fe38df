use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::task::AbortHandle;

use super::{CancellationToken, TokenOptions};
use crate::error::{Error, Result};

/// Owner of a cancellable scope: hands out the token, cancels it (optionally
/// on a delay) and refuses further use once disposed.
pub struct CancellationTokenSource {
    token: CancellationToken,
    disposed: AtomicBool,
    delayed: Mutex<Option<AbortHandle>>,
}

impl CancellationTokenSource {
    pub fn new() -> Self {
        Self::with_options(TokenOptions::default())
    }

    pub fn with_options(options: TokenOptions) -> Self {
        Self {
            token: CancellationToken::with_options(options),
            disposed: AtomicBool::new(false),
            delayed: Mutex::new(None),
        }
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self::with_options(TokenOptions {
            timeout: Some(timeout),
            ..TokenOptions::default()
        })
    }

    /// Source whose token cancels as soon as any of `tokens` cancels.
    pub fn linked(tokens: &[CancellationToken]) -> Self {
        let source = Self::new();

        for token in tokens {
            if token.is_cancelled() {
                source.token.cancel("Linked token was already cancelled");
                break;
            }

            let forward = source.token.clone();
            let _ = token.register(move |cancelled| {
                forward.cancel(format!(
                    "Linked token cancelled: {}",
                    cancelled.reason().unwrap_or_default()
                ));
            });
        }

        source
    }

    fn ensure_usable(&self) -> Result<()> {
        if self.disposed.load(Ordering::SeqCst) {
            Err(Error::Disposed)
        } else {
            Ok(())
        }
    }

    pub fn token(&self) -> Result<CancellationToken> {
        self.ensure_usable()?;
        Ok(self.token.clone())
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn cancel(&self, reason: impl Into<String>) -> Result<()> {
        self.ensure_usable()?;
        self.token.cancel(reason);
        Ok(())
    }

    /// Schedules a cancel after `delay`; disposing first suppresses it.
    pub fn cancel_after(&self, delay: Duration, reason: impl Into<String>) -> Result<()> {
        self.ensure_usable()?;

        let handle = Handle::try_current().map_err(|_| {
            Error::Process {
                context: "cancel_after requires a running async runtime".to_string(),
                exit_code: None,
            }
        })?;

        let reason = reason.into();
        let token = self.token.clone();
        let task = handle.spawn(async move {
            tokio::time::sleep(delay).await;
            if !token.is_cancelled() {
                token.cancel(reason);
            }
        });

        let mut delayed = self
            .delayed
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(previous) = delayed.replace(task.abort_handle()) {
            previous.abort();
        }

        Ok(())
    }

    /// Idempotent; cancels the token with a "disposed" reason and detaches it.
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }

        let mut delayed = self
            .delayed
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(task) = delayed.take() {
            task.abort();
        }
        drop(delayed);

        self.token.dispose();
    }
}

impl Default for CancellationTokenSource {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for CancellationTokenSource {
    fn drop(&mut self) {
        self.dispose();
    }
}
