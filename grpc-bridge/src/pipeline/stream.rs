//! Response streams that keep their call alive

use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Instant;

use futures::Stream;
use tonic::Status;

use crate::cancellation::CancelOnDrop;
use crate::context::ContextScope;
use crate::pipeline::{CompletionHook, MessageStream};

/// Resources held until a call finishes
pub(crate) struct CallCompletion {
    scope: Option<ContextScope>,
    guard: Option<CancelOnDrop>,
    started: Instant,
    hook: Option<CompletionHook>,
}

impl CallCompletion {
    pub(crate) fn new(scope: ContextScope, started: Instant, hook: Option<CompletionHook>) -> Self {
        let guard = CancelOnDrop::new(scope.context().cancellation().clone());
        Self {
            scope: Some(scope),
            guard: Some(guard),
            started,
            hook,
        }
    }

    /// Completion for a call whose context could not be established
    pub(crate) fn detached(started: Instant) -> Self {
        Self {
            scope: None,
            guard: None,
            started,
            hook: None,
        }
    }

    /// Normal completion: disarm the guard, release the bridge, run the hook
    pub(crate) fn finish(mut self) {
        if let Some(guard) = self.guard.take() {
            guard.disarm();
        }
        if let Some(scope) = self.scope.take() {
            let elapsed = self.started.elapsed();
            tracing::trace!(
                trace_id = %scope.context().trace_id(),
                elapsed_ms = elapsed.as_millis() as u64,
                "call completed"
            );
            if let Some(hook) = &self.hook {
                hook(scope.context(), elapsed);
            }
        }
    }
}

/// Wraps a handler's response stream
///
/// The call completes when the stream ends or yields an error; the server
/// stops polling after an error status. Dropping it earlier (the client went
/// away) cancels the call's token.
pub(crate) struct ContextStream<T> {
    inner: MessageStream<T>,
    completion: Option<CallCompletion>,
}

impl<T> ContextStream<T> {
    pub(crate) fn new(inner: MessageStream<T>, completion: CallCompletion) -> Self {
        Self {
            inner,
            completion: Some(completion),
        }
    }
}

impl<T> Stream for ContextStream<T> {
    type Item = Result<T, Status>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        let polled = this.inner.as_mut().poll_next(cx);
        if let Poll::Ready(None | Some(Err(_))) = &polled {
            if let Some(completion) = this.completion.take() {
                completion.finish();
            }
        }
        polled
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.inner.size_hint()
    }
}
