//! Completion handle of a single in-flight request.
//!
//! An [`IoCompletion`] is created when a request is queued, marked admitted
//! when the fair queue dispatches it, and consumed by exactly one of
//! [`IoCompletion::complete`] or [`IoCompletion::fail`]. Both release the
//! reserved ticket before resolving the caller's [`IoFuture`].

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use tokio::sync::oneshot;
use tracing::{trace, warn};

use crate::error::{IoQueueError, IoQueueResult};
use crate::io_queue::IoQueueShared;
use crate::request::IoRequestId;
use crate::ticket::FairQueueTicket;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CompletionState {
    Created,
    Admitted,
}

struct Pending {
    queue: Arc<IoQueueShared>,
    promise: oneshot::Sender<IoQueueResult<usize>>,
}

/// Handle through which the backend reports the outcome of one request.
pub struct IoCompletion {
    id: IoRequestId,
    ticket: FairQueueTicket,
    state: CompletionState,
    pending: Option<Pending>,
}

impl IoCompletion {
    pub(crate) fn new(
        queue: Arc<IoQueueShared>,
        id: IoRequestId,
        ticket: FairQueueTicket,
    ) -> (Self, IoFuture) {
        let (promise, rx) = oneshot::channel();
        let completion = Self {
            id,
            ticket,
            state: CompletionState::Created,
            pending: Some(Pending { queue, promise }),
        };
        (completion, IoFuture::pending(rx))
    }

    /// From here on the ticket counts as reserved and must be released.
    pub(crate) fn mark_admitted(&mut self) {
        self.state = CompletionState::Admitted;
    }

    /// Request id, for tracing.
    pub fn id(&self) -> IoRequestId {
        self.id
    }

    /// The reserved ticket.
    pub fn ticket(&self) -> FairQueueTicket {
        self.ticket
    }

    /// Device id of the owning queue.
    pub fn dev_id(&self) -> u64 {
        self.pending.as_ref().map(|p| p.queue.dev_id()).unwrap_or_default()
    }

    /// Reports success with the number of bytes transferred.
    pub fn complete(mut self, transferred: usize) {
        trace!("dev {} : req {} complete", self.dev_id(), self.id);
        self.finish(Ok(transferred));
    }

    /// Reports failure.
    pub fn fail(mut self, err: IoQueueError) {
        trace!("dev {} : req {} error: {}", self.dev_id(), self.id, err);
        self.finish(Err(err));
    }

    fn finish(&mut self, result: IoQueueResult<usize>) {
        let Some(pending) = self.pending.take() else {
            return;
        };
        if self.state == CompletionState::Admitted {
            pending.queue.notify_requests_finished(self.ticket);
        }
        // the caller may have stopped waiting
        let _ = pending.promise.send(result);
    }
}

impl Drop for IoCompletion {
    fn drop(&mut self) {
        if self.pending.is_some() {
            if self.state == CompletionState::Admitted {
                warn!(
                    "dev {} : req {} dropped by the backend without completion",
                    self.dev_id(),
                    self.id
                );
            }
            self.finish(Err(IoQueueError::RequestAbandoned));
        }
    }
}

impl std::fmt::Debug for IoCompletion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IoCompletion")
            .field("id", &self.id)
            .field("ticket", &self.ticket)
            .field("state", &self.state)
            .finish()
    }
}

enum FutureState {
    Failed(Option<IoQueueError>),
    Pending(oneshot::Receiver<IoQueueResult<usize>>),
}

/// Resolves to the number of bytes transferred by a queued request.
pub struct IoFuture {
    state: FutureState,
}

impl IoFuture {
    fn pending(rx: oneshot::Receiver<IoQueueResult<usize>>) -> Self {
        Self {
            state: FutureState::Pending(rx),
        }
    }

    /// A future that is already failed with `err`.
    pub fn failed(err: IoQueueError) -> Self {
        Self {
            state: FutureState::Failed(Some(err)),
        }
    }
}

impl Future for IoFuture {
    type Output = IoQueueResult<usize>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match &mut self.get_mut().state {
            FutureState::Failed(err) => {
                Poll::Ready(Err(err.take().unwrap_or(IoQueueError::RequestAbandoned)))
            }
            FutureState::Pending(rx) => Pin::new(rx)
                .poll(cx)
                .map(|res| res.unwrap_or(Err(IoQueueError::RequestAbandoned))),
        }
    }
}

impl std::fmt::Debug for IoFuture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = match self.state {
            FutureState::Failed(_) => "failed",
            FutureState::Pending(_) => "pending",
        };
        f.debug_struct("IoFuture").field("state", &state).finish()
    }
}
