//! Cooperative cancellation for in-flight calls
//!
//! Every call owns one [`CancellationToken`]. Transport signals, deadlines,
//! middleware timeouts and handlers all converge on it; the first reason wins
//! and the transition is one-way. Handlers observe it by polling
//! [`CancellationToken::is_cancelled`], awaiting
//! [`CancellationToken::cancelled`], or registering cleanup callbacks.

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::task::AbortHandle;
use tonic::Code;

use crate::status::is_cancellation_error;

/// Why a call was cancelled
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CancelReason {
    /// The client or transport cancelled the call
    Transport,
    /// The transport reported a cancellation-related error
    TransportError(String),
    /// The call deadline expired
    DeadlineExceeded,
    /// A middleware timeout fired
    Timeout,
    /// Application code asked for cancellation
    Requested(String),
}

impl fmt::Display for CancelReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CancelReason::Transport => write!(f, "cancelled by transport"),
            CancelReason::TransportError(msg) => write!(f, "transport error: {}", msg),
            CancelReason::DeadlineExceeded => write!(f, "deadline exceeded"),
            CancelReason::Timeout => write!(f, "request timed out"),
            CancelReason::Requested(msg) => write!(f, "cancelled: {}", msg),
        }
    }
}

type Cleanup = Box<dyn FnOnce() + Send>;

#[derive(Default)]
struct TokenState {
    reason: Option<CancelReason>,
    cleanups: Vec<Cleanup>,
}

struct TokenInner {
    signal: tokio_util::sync::CancellationToken,
    state: Mutex<TokenState>,
}

/// One-way cancellation flag with ordered cleanup callbacks
#[derive(Clone)]
pub struct CancellationToken {
    inner: Arc<TokenInner>,
}

impl CancellationToken {
    /// Create an active token
    pub fn new() -> Self {
        Self {
            inner: Arc::new(TokenInner {
                signal: tokio_util::sync::CancellationToken::new(),
                state: Mutex::new(TokenState::default()),
            }),
        }
    }

    /// Cancel the token
    ///
    /// Returns `true` if this call performed the transition. Cleanup callbacks
    /// run once, in registration order, on the caller's thread.
    pub fn cancel(&self, reason: CancelReason) -> bool {
        let cleanups = {
            let mut state = self.lock();
            if state.reason.is_some() {
                return false;
            }
            state.reason = Some(reason);
            std::mem::take(&mut state.cleanups)
        };

        self.inner.signal.cancel();
        for cleanup in cleanups {
            cleanup();
        }
        true
    }

    /// Whether the token has been cancelled
    pub fn is_cancelled(&self) -> bool {
        self.lock().reason.is_some()
    }

    /// The reason of the first cancellation
    pub fn reason(&self) -> Option<CancelReason> {
        self.lock().reason.clone()
    }

    /// Register a cleanup callback
    ///
    /// Runs immediately if the token is already cancelled.
    pub fn on_cancel<F>(&self, cleanup: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let mut state = self.lock();
        if state.reason.is_some() {
            drop(state);
            cleanup();
        } else {
            state.cleanups.push(Box::new(cleanup));
        }
    }

    /// Wait until the token is cancelled
    pub async fn cancelled(&self) {
        self.inner.signal.cancelled().await;
    }

    /// A tokio-util token that fires together with this one
    pub fn signal(&self) -> tokio_util::sync::CancellationToken {
        self.inner.signal.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, TokenState> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for CancellationToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancellationToken")
            .field("reason", &self.reason())
            .finish()
    }
}

/// Lifecycle state reported by the transport for one call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// Call in progress
    Active,
    /// Client or transport cancelled the call
    Cancelled,
    /// Transport error
    Error {
        /// gRPC code attached to the error
        code: Code,
        /// Error message
        message: String,
    },
    /// Call finished normally
    Closed,
}

/// Per-call channel through which the transport reports its events
///
/// Stored in the request extensions by
/// [`TransportSignalLayer`](crate::grpc::TransportSignalLayer) or by the
/// embedding transport. Terminal events (`Cancelled`, `Closed`) are sticky,
/// so a bridge attached late still observes them.
#[derive(Debug, Clone)]
pub struct CallSignals {
    sender: Arc<watch::Sender<TransportEvent>>,
}

impl CallSignals {
    /// New signals in the `Active` state
    pub fn new() -> Self {
        let (sender, _) = watch::channel(TransportEvent::Active);
        Self {
            sender: Arc::new(sender),
        }
    }

    /// Report a client cancellation
    pub fn cancel(&self) {
        self.emit(TransportEvent::Cancelled);
    }

    /// Report a transport error
    pub fn error(&self, code: Code, message: impl Into<String>) {
        self.emit(TransportEvent::Error {
            code,
            message: message.into(),
        });
    }

    /// Report normal completion
    pub fn close(&self) {
        self.emit(TransportEvent::Closed);
    }

    /// Current state
    pub fn current(&self) -> TransportEvent {
        self.sender.borrow().clone()
    }

    fn emit(&self, event: TransportEvent) {
        self.sender.send_if_modified(|state| {
            if matches!(state, TransportEvent::Cancelled | TransportEvent::Closed) {
                return false;
            }
            *state = event;
            true
        });
    }

    fn subscribe(&self) -> watch::Receiver<TransportEvent> {
        self.sender.subscribe()
    }
}

impl Default for CallSignals {
    fn default() -> Self {
        Self::new()
    }
}

/// Absolute deadline supplied by the transport
///
/// `None` marks an explicitly infinite deadline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallDeadline(pub Option<DateTime<Utc>>);

enum Applied {
    Continue,
    Stop,
}

fn apply_event(token: &CancellationToken, event: &TransportEvent) -> Applied {
    match event {
        TransportEvent::Active => Applied::Continue,
        TransportEvent::Cancelled => {
            token.cancel(CancelReason::Transport);
            Applied::Stop
        }
        TransportEvent::Error { code, message } => {
            if is_cancellation_error(*code, message) {
                token.cancel(CancelReason::TransportError(message.clone()));
                Applied::Stop
            } else {
                tracing::debug!(code = ?code, error = %message, "transport error does not cancel call");
                Applied::Continue
            }
        }
        TransportEvent::Closed => Applied::Stop,
    }
}

/// Wires transport signals and the call deadline into a token
///
/// Dropping the returned guard stops the deadline timer and the signal
/// listener.
pub struct CancellationBridge {
    tasks: Vec<AbortHandle>,
}

impl CancellationBridge {
    /// Attach a token to the call's deadline and transport signals
    ///
    /// Must be called from within a tokio runtime when a future deadline or
    /// signals are supplied.
    pub fn attach(
        token: &CancellationToken,
        deadline: Option<DateTime<Utc>>,
        signals: Option<&CallSignals>,
    ) -> Self {
        let mut tasks = Vec::new();

        if let Some(deadline) = deadline {
            match (deadline - Utc::now()).to_std() {
                Ok(remaining) if !remaining.is_zero() => {
                    let timer_token = token.clone();
                    let timer = tokio::spawn(async move {
                        tokio::time::sleep(remaining).await;
                        timer_token.cancel(CancelReason::DeadlineExceeded);
                    })
                    .abort_handle();
                    let clear = timer.clone();
                    token.on_cancel(move || clear.abort());
                    tasks.push(timer);
                }
                _ => {
                    tracing::debug!(deadline = %deadline, "deadline already elapsed");
                    token.cancel(CancelReason::DeadlineExceeded);
                }
            }
        }

        if let Some(signals) = signals {
            let mut events = signals.subscribe();
            let initial = events.borrow_and_update().clone();
            if let Applied::Continue = apply_event(token, &initial) {
                if !token.is_cancelled() {
                    let listener_token = token.clone();
                    let listener = tokio::spawn(async move {
                        loop {
                            tokio::select! {
                                changed = events.changed() => {
                                    if changed.is_err() {
                                        break;
                                    }
                                    let event = events.borrow_and_update().clone();
                                    if let Applied::Stop = apply_event(&listener_token, &event) {
                                        break;
                                    }
                                }
                                _ = listener_token.cancelled() => break,
                            }
                        }
                    })
                    .abort_handle();
                    tasks.push(listener);
                }
            }
        }

        Self { tasks }
    }

    /// A bridge with nothing attached
    pub fn detached() -> Self {
        Self { tasks: Vec::new() }
    }

    #[cfg(test)]
    fn is_idle(&self) -> bool {
        self.tasks.iter().all(AbortHandle::is_finished)
    }
}

impl Drop for CancellationBridge {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

/// Cancels the token if dropped while still armed
///
/// Held across an invocation; when tonic drops the call future because the
/// client went away, the token observes a transport cancellation.
pub struct CancelOnDrop {
    token: Option<CancellationToken>,
}

impl CancelOnDrop {
    /// Arm a guard for `token`
    pub fn new(token: CancellationToken) -> Self {
        Self { token: Some(token) }
    }

    /// Disarm after the invocation completed
    pub fn disarm(mut self) {
        self.token = None;
    }
}

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        if let Some(token) = self.token.take() {
            if token.cancel(CancelReason::Transport) {
                tracing::debug!("call dropped before completion");
            }
        }
    }
}
