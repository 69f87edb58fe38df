use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, LazyLock, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::AbortHandle;

use crate::error::CancelledError;

const DEFAULT_REASON: &str = "Operation was cancelled";
const PARENT_REASON: &str = "Parent token cancelled";

type AsyncCallbackFuture = Pin<Box<dyn Future<Output = crate::Result<()>> + Send>>;

/// Observers are a tagged variant: sync callbacks run inline during cancel,
/// async callbacks are spawned and their failure is logged, never propagated.
enum Callback {
    Sync(Box<dyn FnOnce(&CancellationToken) + Send>),
    Async(Box<dyn FnOnce(CancellationToken) -> AsyncCallbackFuture + Send>),
}

struct Entry {
    id: u64,
    callback: Callback,
}

struct State {
    cancelled: bool,
    reason: Option<String>,
    timed_out: bool,
    cancelled_at: Option<DateTime<Utc>>,
    callbacks: Vec<Entry>,
    next_callback_id: u64,
    children: Vec<Weak<Inner>>,
    timeout: Option<AbortHandle>,
}

pub(crate) struct Inner {
    state: Mutex<State>,
    // Back-reference only used for detachment; the parent owns the
    // forward child set used for cascade-cancel.
    parent: Weak<Inner>,
    changed: watch::Sender<bool>,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[derive(Default)]
pub struct TokenOptions {
    pub timeout: Option<Duration>,
    pub parent: Option<CancellationToken>,
}

/// Handle to a cancellable scope of work.
#[derive(Clone)]
pub struct CancellationToken {
    inner: Arc<Inner>,
}

static NONE: LazyLock<CancellationToken> = LazyLock::new(CancellationToken::new);
static CANCELLED: LazyLock<CancellationToken> = LazyLock::new(|| {
    let token = CancellationToken::new();
    token.cancel("Pre-cancelled token");
    token
});

impl CancellationToken {
    pub fn new() -> Self {
        Self::with_options(TokenOptions::default())
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self::with_options(TokenOptions {
            timeout: Some(timeout),
            ..TokenOptions::default()
        })
    }

    pub fn with_options(options: TokenOptions) -> Self {
        let (changed, _) = watch::channel(false);
        let token = Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    cancelled: false,
                    reason: None,
                    timed_out: false,
                    cancelled_at: None,
                    callbacks: Vec::new(),
                    next_callback_id: 1,
                    children: Vec::new(),
                    timeout: None,
                }),
                parent: options
                    .parent
                    .as_ref()
                    .map(|parent| Arc::downgrade(&parent.inner))
                    .unwrap_or_default(),
                changed,
            }),
        };

        if let Some(parent) = &options.parent {
            let mut parent_state = parent.inner.lock();
            if parent_state.cancelled {
                let reason = parent_state
                    .reason
                    .clone()
                    .unwrap_or_else(|| DEFAULT_REASON.to_string());
                drop(parent_state);
                token.cancel(reason);
            } else {
                parent_state.children.push(Arc::downgrade(&token.inner));
            }
        }

        if let Some(timeout) = options.timeout {
            token.arm_timeout(timeout);
        }

        token
    }

    /// Shared token that is never cancelled. Callers must not cancel it.
    pub fn none() -> Self {
        NONE.clone()
    }

    /// Shared token that was cancelled at process startup.
    pub fn already_cancelled() -> Self {
        CANCELLED.clone()
    }

    /// Derives a child token that cancels when `self` cancels.
    pub fn child(&self) -> Self {
        Self::with_options(TokenOptions {
            parent: Some(self.clone()),
            ..TokenOptions::default()
        })
    }

    /// Combines tokens into one that cancels as soon as any input cancels,
    /// with the reason attributing the input that cancelled first.
    pub fn link(tokens: &[CancellationToken]) -> Self {
        if tokens.is_empty() {
            return Self::none();
        }
        if tokens.len() == 1 {
            return tokens[0].clone();
        }

        let derived = Self::new();
        for token in tokens {
            if token.is_cancelled() {
                derived.cancel(format!(
                    "Linked token cancelled: {}",
                    token.reason().unwrap_or_else(|| DEFAULT_REASON.to_string())
                ));
                break;
            }

            let forward = derived.clone();
            let _ = token.register(move |cancelled| {
                forward.cancel(format!(
                    "Linked token cancelled: {}",
                    cancelled
                        .reason()
                        .unwrap_or_else(|| DEFAULT_REASON.to_string())
                ));
            });
        }

        derived
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.lock().cancelled
    }

    pub fn reason(&self) -> Option<String> {
        self.inner.lock().reason.clone()
    }

    pub fn cancelled_at(&self) -> Option<DateTime<Utc>> {
        self.inner.lock().cancelled_at
    }

    pub fn timed_out(&self) -> bool {
        self.inner.lock().timed_out
    }

    pub fn has_parent(&self) -> bool {
        self.inner.parent.upgrade().is_some()
    }

    pub fn child_count(&self) -> usize {
        self.inner
            .lock()
            .children
            .iter()
            .filter(|child| child.strong_count() > 0)
            .count()
    }

    pub fn callback_count(&self) -> usize {
        self.inner.lock().callbacks.len()
    }

    /// Errors with a [`CancelledError`] when cancellation has been requested.
    pub fn check(&self) -> Result<(), CancelledError> {
        let state = self.inner.lock();
        if state.cancelled {
            Err(Self::error_from(&state))
        } else {
            Ok(())
        }
    }

    fn error_from(state: &State) -> CancelledError {
        CancelledError {
            reason: state
                .reason
                .clone()
                .unwrap_or_else(|| DEFAULT_REASON.to_string()),
            timed_out: state.timed_out,
        }
    }

    pub fn cancel(&self, reason: impl Into<String>) {
        self.cancel_internal(reason.into(), false);
    }

    fn cancel_internal(&self, reason: String, timed_out: bool) {
        let (children, callbacks) = {
            let mut state = self.inner.lock();
            if state.cancelled {
                return;
            }

            state.cancelled = true;
            state.reason = Some(reason);
            state.timed_out = timed_out;
            state.cancelled_at = Some(Utc::now());
            if let Some(timer) = state.timeout.take() {
                timer.abort();
            }

            // Snapshots: callback dispatch below may re-enter this token
            (
                std::mem::take(&mut state.children),
                std::mem::take(&mut state.callbacks),
            )
        };

        // Children first, depth-first
        for child in children {
            if let Some(inner) = child.upgrade() {
                Self { inner }.cancel_internal(PARENT_REASON.to_string(), false);
            }
        }

        let _ = self.inner.changed.send(true);

        for entry in callbacks {
            match entry.callback {
                Callback::Sync(callback) => callback(self),
                Callback::Async(callback) => {
                    let future = callback(self.clone());
                    match Handle::try_current() {
                        Ok(handle) => {
                            handle.spawn(async move {
                                if let Err(err) = future.await {
                                    log::warn!("async cancellation callback failed: {err}");
                                }
                            });
                        }
                        Err(_) => {
                            log::warn!("dropping async cancellation callback: no runtime");
                        }
                    }
                }
            }
        }
    }

    /// Registers a callback to run exactly once, on cancellation. When the
    /// token is already cancelled the callback is scheduled on the runtime
    /// rather than invoked synchronously.
    pub fn register<F>(&self, callback: F) -> Registration
    where
        F: FnOnce(&CancellationToken) + Send + 'static,
    {
        let mut state = self.inner.lock();
        if state.cancelled {
            drop(state);
            let token = self.clone();
            match Handle::try_current() {
                Ok(handle) => {
                    handle.spawn(async move { callback(&token) });
                }
                Err(_) => callback(&token),
            }
            return Registration::detached();
        }

        let id = state.next_callback_id;
        state.next_callback_id += 1;
        state.callbacks.push(Entry {
            id,
            callback: Callback::Sync(Box::new(callback)),
        });

        Registration {
            inner: Arc::downgrade(&self.inner),
            id,
        }
    }

    /// Like [`register`](Self::register) for async callbacks; the callback's
    /// error is logged and never propagated.
    pub fn register_async<F, Fut>(&self, callback: F) -> Registration
    where
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = crate::Result<()>> + Send + 'static,
    {
        let boxed: Box<dyn FnOnce(CancellationToken) -> AsyncCallbackFuture + Send> =
            Box::new(move |token| Box::pin(callback(token)));

        let mut state = self.inner.lock();
        if state.cancelled {
            drop(state);
            let future = boxed(self.clone());
            match Handle::try_current() {
                Ok(handle) => {
                    handle.spawn(async move {
                        if let Err(err) = future.await {
                            log::warn!("async cancellation callback failed: {err}");
                        }
                    });
                }
                Err(_) => log::warn!("dropping async cancellation callback: no runtime"),
            }
            return Registration::detached();
        }

        let id = state.next_callback_id;
        state.next_callback_id += 1;
        state.callbacks.push(Entry {
            id,
            callback: Callback::Async(boxed),
        });

        Registration {
            inner: Arc::downgrade(&self.inner),
            id,
        }
    }

    /// Resolves once cancellation is requested.
    pub async fn cancelled(&self) {
        let mut receiver = self.inner.changed.subscribe();
        let _ = receiver.wait_for(|cancelled| *cancelled).await;
    }

    /// Runs `future` to completion unless this token cancels first.
    pub async fn race<F: Future>(&self, future: F) -> Result<F::Output, CancelledError> {
        self.check()?;

        tokio::select! {
            _ = self.cancelled() => Err(Self::error_from(&self.inner.lock())),
            output = future => Ok(output),
        }
    }

    /// Cancellable sleep.
    pub async fn delay(&self, duration: Duration) -> Result<(), CancelledError> {
        self.race(tokio::time::sleep(duration)).await
    }

    /// Cancels with a "disposed" reason and detaches from the parent so the
    /// parent no longer holds a child reference.
    pub fn dispose(&self) {
        self.cancel("Token disposed");

        if let Some(parent) = self.inner.parent.upgrade() {
            let target = Arc::downgrade(&self.inner);
            parent
                .lock()
                .children
                .retain(|child| !child.ptr_eq(&target));
        }
    }

    fn arm_timeout(&self, timeout: Duration) {
        let Ok(handle) = Handle::try_current() else {
            log::warn!("cancellation timeout ignored: no runtime");
            return;
        };

        let weak = Arc::downgrade(&self.inner);
        let task = handle.spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(inner) = weak.upgrade() {
                CancellationToken { inner }.cancel_internal(
                    format!("Operation timed out after {}ms", timeout.as_millis()),
                    true,
                );
            }
        });

        self.inner.lock().timeout = Some(task.abort_handle());
    }
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CancellationToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.lock();
        f.debug_struct("CancellationToken")
            .field("cancelled", &state.cancelled)
            .field("reason", &state.reason)
            .field("cancelled_at", &state.cancelled_at)
            .finish()
    }
}

/// Handle to a registered cancellation callback. Dropping it keeps the
/// callback registered; call [`unregister`](Self::unregister) to remove it.
pub struct Registration {
    inner: Weak<Inner>,
    id: u64,
}

impl Registration {
    fn detached() -> Self {
        Self {
            inner: Weak::new(),
            id: 0,
        }
    }

    pub fn unregister(self) {
        if let Some(inner) = self.inner.upgrade() {
            inner.lock().callbacks.retain(|entry| entry.id != self.id);
        }
    }
}
