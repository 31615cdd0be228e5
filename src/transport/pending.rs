use std::collections::HashMap;

use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::{InvocationId, Result, WireValue};

/// Where the outcome of one outbound call goes.
pub(super) enum Waiter {
    /// `invoke`: exactly one result or error.
    Single(oneshot::Sender<Result<WireValue>>),
    /// `stream`: items until the completion, which may carry one error.
    ///
    /// Unbounded: a consumer that stops polling holds back only its own
    /// items, never the shared reader.
    Stream(mpsc::UnboundedSender<Result<WireValue>>),
}

/// A registered call that has not completed yet.
pub(super) struct PendingCall {
    // ---
    pub(super) waiter: Waiter,
    /// Cancels the call's upload streams.
    pub(super) uploads: CancellationToken,
}

impl PendingCall {
    /// Deliver the final outcome and stop the call's uploads.
    ///
    /// For a stream waiter a successful completion just ends the stream; an
    /// error is delivered as its last item.
    pub(super) fn resolve(self, outcome: Result<WireValue>) {
        // ---
        self.uploads.cancel();
        match self.waiter {
            // Receiver gone means the caller stopped waiting.
            Waiter::Single(tx) => {
                let _ = tx.send(outcome);
            }
            Waiter::Stream(tx) => {
                if let Err(err) = outcome {
                    let _ = tx.send(Err(err));
                }
            }
        }
    }
}

/// Tracks outbound calls waiting for completions.
///
/// Maps invocation ids to the caller's waiter. Every entry leaves the table
/// exactly once: resolved by the reader, removed by a dropped caller, or
/// drained when the connection closes.
pub(super) struct PendingCalls {
    // ---
    calls: HashMap<InvocationId, PendingCall>,
}

impl PendingCalls {
    // ---

    /// Create an empty table.
    pub fn new() -> Self {
        // ---
        Self {
            calls: HashMap::new(),
        }
    }

    /// Register a call awaiting one result.
    pub fn register_single(
        &mut self,
        invocation_id: InvocationId,
        uploads: CancellationToken,
    ) -> oneshot::Receiver<Result<WireValue>> {
        // ---
        let (tx, rx) = oneshot::channel();
        self.calls.insert(
            invocation_id,
            PendingCall {
                waiter: Waiter::Single(tx),
                uploads,
            },
        );
        rx
    }

    /// Register a call awaiting a stream of items.
    pub fn register_stream(
        &mut self,
        invocation_id: InvocationId,
        uploads: CancellationToken,
    ) -> mpsc::UnboundedReceiver<Result<WireValue>> {
        // ---
        let (tx, rx) = mpsc::unbounded_channel();
        self.calls.insert(
            invocation_id,
            PendingCall {
                waiter: Waiter::Stream(tx),
                uploads,
            },
        );
        rx
    }

    /// Item sender for a pending stream call.
    ///
    /// `None` if the id is unknown or belongs to a single-result call.
    pub fn stream_sender(
        &self,
        invocation_id: &InvocationId,
    ) -> Option<mpsc::UnboundedSender<Result<WireValue>>> {
        // ---
        match self.calls.get(invocation_id) {
            Some(PendingCall {
                waiter: Waiter::Stream(tx),
                ..
            }) => Some(tx.clone()),
            _ => None,
        }
    }

    /// Remove a call, handing it to the caller for resolution.
    pub fn take(&mut self, invocation_id: &InvocationId) -> Option<PendingCall> {
        // ---
        self.calls.remove(invocation_id)
    }

    /// Remove every call (connection shutdown).
    pub fn drain(&mut self) -> Vec<PendingCall> {
        // ---
        self.calls.drain().map(|(_, call)| call).collect()
    }

    /// Get the number of pending calls.
    pub fn len(&self) -> usize {
        // ---
        self.calls.len()
    }
}
