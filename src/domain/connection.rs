// src/domain/connection.rs

//! Connection-layer abstractions consumed by the hub core.
//!
//! The core composes outbound calls and routes inbound invocations, but it
//! does not own a socket, a codec or the table correlating completions with
//! waiting callers. Those belong to the connection layer, which the core sees
//! only through [`HubConnection`].
//!
//! Implementations must ensure that:
//! - every frame they emit goes through one ordered writer ([`FrameWriter`]),
//!   because the underlying connection is not concurrently writable;
//! - every invocation id they mint is eventually resolved exactly once (a
//!   result, a terminated item stream, or an error);
//! - upload stream ids are allocated before the parent invocation is written.
//!
//! [`MemoryConnection`](crate::MemoryConnection) is the reference
//! implementation of these semantics.

use std::sync::Arc;

use futures::stream::BoxStream;
use tokio::runtime::Handle;
use tokio::sync::mpsc;

use crate::upload::UploadStreams;
use crate::{
    // ---
    Completion,
    ConnectionId,
    HubMessage,
    Invocation,
    Result,
    RpcError,
    WireValue,
};

/// Lazily produced sequence of wire values (download or upload stream).
pub type WireStream = BoxStream<'static, Result<WireValue>>;

/// Receiver for every inbound invocation, already framed but not yet
/// argument-decoded.
pub type InvocationReceiver = mpsc::UnboundedReceiver<Invocation>;

/// The single ordered writer of a connection.
///
/// Cloning is cheap; every clone feeds the same FIFO queue, so frames from
/// concurrently draining upload streams and control-plane messages are
/// serialized in the order the queue accepts them. `write` suspends while the
/// queue is full.
#[derive(Clone, Debug)]
pub struct FrameWriter {
    tx: mpsc::Sender<HubMessage>,
}

impl FrameWriter {
    /// Wrap the sending half of a frame queue.
    pub fn new(tx: mpsc::Sender<HubMessage>) -> Self {
        Self { tx }
    }

    /// Create a bounded frame queue and its writer.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<HubMessage>) {
        // ---
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }

    /// Hand one frame to the writer, waiting for queue space.
    ///
    /// # Errors
    ///
    /// Returns [`RpcError::ConnectionClosed`] if the receiving side is gone.
    pub async fn write(&self, frame: HubMessage) -> Result<()> {
        // ---
        self.tx
            .send(frame)
            .await
            .map_err(|_| RpcError::ConnectionClosed)
    }

    /// Queue a frame without awaiting, for use from `Drop`.
    ///
    /// If the queue is full the frame is sent from a spawned task when a
    /// runtime is available; otherwise it is discarded.
    pub fn write_detached(&self, frame: HubMessage) {
        // ---
        match self.tx.try_send(frame) {
            Ok(()) | Err(mpsc::error::TrySendError::Closed(_)) => {}
            Err(mpsc::error::TrySendError::Full(frame)) => {
                if let Ok(handle) = Handle::try_current() {
                    let tx = self.tx.clone();
                    handle.spawn(async move {
                        let _ = tx.send(frame).await;
                    });
                }
            }
        }
    }

    /// Whether the receiving side has gone away.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Abstract primitives the hub core is built on.
///
/// One primitive per call shape, plus delivery of locally produced
/// completions and the inbound invocation sequence. Arguments reach the
/// connection already marshalled; upload streams reach it lazily marshalled
/// and unallocated.
///
/// # Notes
///
/// This trait uses `async_trait`; consumers should treat the methods as
/// normal `async fn`s.
#[async_trait::async_trait]
pub trait HubConnection: Send + Sync {
    // ---
    /// Identifier of this connection instance.
    fn connection_id(&self) -> &ConnectionId;

    /// Fire-and-forget dispatch. Resolves once the invocation frame has been
    /// accepted by the writer; upload streams keep draining afterwards.
    async fn send(
        &self,
        target: &str,
        arguments: Vec<WireValue>,
        uploads: UploadStreams,
    ) -> Result<()>;

    /// Invoke and await exactly one result.
    ///
    /// Dropping the returned future before it resolves cancels the call's
    /// upload streams and emits `CancelInvocation`.
    async fn invoke(
        &self,
        target: &str,
        arguments: Vec<WireValue>,
        uploads: UploadStreams,
    ) -> Result<WireValue>;

    /// Invoke and receive a lazy stream of items terminated by the
    /// invocation's completion.
    ///
    /// Dropping the returned stream before its end cancels the call.
    async fn stream(
        &self,
        target: &str,
        arguments: Vec<WireValue>,
        uploads: UploadStreams,
    ) -> Result<WireStream>;

    /// Write a completion for an inbound invocation.
    async fn complete(&self, completion: Completion) -> Result<()>;

    /// Take the inbound invocation sequence.
    ///
    /// # Errors
    ///
    /// There is a single consumer per connection; a second call returns
    /// [`RpcError::InvalidState`].
    fn take_invocations(&self) -> Result<InvocationReceiver>;

    /// Close the connection, failing every pending call.
    async fn close(&self) -> Result<()>;
}

/// Shared connection pointer.
///
/// An `Arc<dyn HubConnection>`: cheap to clone, every clone drives the same
/// underlying connection.
pub type ConnectionPtr = Arc<dyn HubConnection>;
