//! Upload stream multiplexer.
//!
//! A single invocation may carry several client-to-server streams. Each one
//! is marshalled lazily (an item is serialized only when the source yields
//! it), bound to its own stream id, and drained by its own task into the
//! connection's single [`FrameWriter`]. Streams progress independently: a
//! slow source only delays its own items, a failing source terminates only
//! its own stream id.
//!
//! Termination is signalled for each stream id exactly once:
//! - exhausted source: void [`Completion`]
//! - failed source or unmarshallable item: error [`Completion`]
//! - parent cancelled: no further frames; the parent's `CancelInvocation`
//!   tells the peer
//!
//! Ordering holds within a stream (source order) but not across streams.

use std::collections::HashMap;
use std::fmt;

use futures::stream::{Stream, StreamExt};
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::marshal::to_wire;
use crate::{
    // ---
    log_debug,
    log_warn,
    Completion,
    FrameWriter,
    HubMessage,
    IdAllocator,
    RpcError,
    StreamId,
    WireStream,
};

/// Lifecycle of one upload stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadState {
    /// Bound to a stream id, drain task not yet running.
    Pending,
    /// Draining items into the writer.
    Active,
    /// Source exhausted and completion written.
    Completed,
    /// Source failed (or the writer went away); error completion written
    /// when possible.
    Failed,
    /// Parent invocation was cancelled.
    Cancelled,
}

impl UploadState {
    /// Whether the stream has reached a terminal state.
    pub fn is_terminal(self) -> bool {
        !matches!(self, UploadState::Pending | UploadState::Active)
    }
}

/// Ordered set of upload streams for one outbound call.
///
/// The order in which streams are added is the order of their ids in the
/// invocation's `streamIds`.
#[derive(Default)]
pub struct UploadStreams {
    sources: Vec<WireStream>,
}

impl UploadStreams {
    /// An empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an infallible typed source.
    pub fn with<S, T>(mut self, source: S) -> Self
    where
        S: Stream<Item = T> + Send + 'static,
        T: Serialize + Send + 'static,
    {
        // ---
        let wire = source
            .enumerate()
            .map(|(index, item)| to_wire(index, &item));
        self.sources.push(wire.boxed());
        self
    }

    /// Add a typed source whose items may fail.
    ///
    /// The first `Err` terminates this stream with an error completion
    /// carrying the error's message.
    pub fn with_fallible<S, T, E>(mut self, source: S) -> Self
    where
        S: Stream<Item = std::result::Result<T, E>> + Send + 'static,
        T: Serialize + Send + 'static,
        E: fmt::Display + Send + 'static,
    {
        // ---
        let wire = source.enumerate().map(|(index, item)| match item {
            Ok(value) => to_wire(index, &value),
            Err(err) => Err(RpcError::UploadSource(err.to_string())),
        });
        self.sources.push(wire.boxed());
        self
    }

    /// Add an already-marshalled source.
    pub fn with_wire(mut self, source: WireStream) -> Self {
        self.sources.push(source);
        self
    }

    /// Number of streams in the set.
    pub fn len(&self) -> usize {
        self.sources.len()
    }

    /// Whether the set is empty.
    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }
}

impl fmt::Debug for UploadStreams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UploadStreams")
            .field("len", &self.sources.len())
            .finish()
    }
}

/// Upload streams bound to their stream ids, ready to drain.
pub struct UploadMultiplexer {
    uploads: Vec<(StreamId, WireStream)>,
}

impl UploadMultiplexer {
    /// Allocate one stream id per source.
    ///
    /// Must happen before the parent invocation is written so the peer knows
    /// how many streams to expect.
    pub fn bind(streams: UploadStreams, ids: &IdAllocator) -> Self {
        // ---
        let uploads = streams
            .sources
            .into_iter()
            .map(|source| (ids.next_id(), source))
            .collect();
        Self { uploads }
    }

    /// Stream ids in stream order, for the invocation's `streamIds`.
    pub fn stream_ids(&self) -> Vec<StreamId> {
        self.uploads.iter().map(|(id, _)| id.clone()).collect()
    }

    /// Whether there is nothing to drain.
    pub fn is_empty(&self) -> bool {
        self.uploads.is_empty()
    }

    /// Spawn one drain task per stream.
    ///
    /// Cancelling `cancel` stops every stream that has not yet terminated.
    pub fn start(self, writer: FrameWriter, cancel: CancellationToken) -> UploadSet {
        // ---
        let mut streams = Vec::with_capacity(self.uploads.len());

        for (stream_id, source) in self.uploads {
            let (state_tx, state_rx) = watch::channel(UploadState::Pending);
            let task = tokio::spawn(drain(
                stream_id.clone(),
                source,
                writer.clone(),
                cancel.clone(),
                state_tx,
            ));
            streams.push(UploadHandle {
                stream_id,
                state: state_rx,
                task,
            });
        }

        UploadSet { streams, cancel }
    }
}

struct UploadHandle {
    stream_id: StreamId,
    state: watch::Receiver<UploadState>,
    task: JoinHandle<UploadState>,
}

/// Running upload streams of one invocation.
///
/// Dropping the set does not stop the streams; they run until they
/// terminate or the cancellation token fires.
pub struct UploadSet {
    streams: Vec<UploadHandle>,
    cancel: CancellationToken,
}

impl UploadSet {
    /// Stream ids in stream order.
    pub fn stream_ids(&self) -> Vec<StreamId> {
        self.streams.iter().map(|s| s.stream_id.clone()).collect()
    }

    /// Current state of one stream.
    pub fn state(&self, stream_id: &StreamId) -> Option<UploadState> {
        self.streams
            .iter()
            .find(|s| &s.stream_id == stream_id)
            .map(|s| *s.state.borrow())
    }

    /// Cancel every stream that is still running.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Wait for every stream to terminate.
    pub async fn join(self) -> HashMap<StreamId, UploadState> {
        // ---
        let mut states = HashMap::with_capacity(self.streams.len());
        for stream in self.streams {
            let state = stream.task.await.unwrap_or(UploadState::Failed);
            states.insert(stream.stream_id, state);
        }
        states
    }
}

async fn drain(
    stream_id: StreamId,
    mut source: WireStream,
    writer: FrameWriter,
    cancel: CancellationToken,
    state: watch::Sender<UploadState>,
) -> UploadState {
    // ---
    state.send_replace(UploadState::Active);

    let outcome = loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => break UploadState::Cancelled,
            next = source.next() => next,
        };

        let frame = match next {
            Some(Ok(item)) => HubMessage::StreamItem {
                invocation_id: stream_id.clone(),
                item,
            },
            Some(Err(err)) => {
                log_warn!("upload stream {stream_id} failed: {err}");
                let completion = Completion::error(stream_id.clone(), err.to_string());
                // Best effort; a closed writer leaves nothing to signal.
                let _ = writer.write(completion.into()).await;
                break UploadState::Failed;
            }
            None => {
                let completion = Completion::void(stream_id.clone());
                match writer.write(completion.into()).await {
                    Ok(()) => break UploadState::Completed,
                    Err(_) => break UploadState::Failed,
                }
            }
        };

        let written = tokio::select! {
            biased;
            _ = cancel.cancelled() => break UploadState::Cancelled,
            written = writer.write(frame) => written,
        };

        if written.is_err() {
            log_debug!("upload stream {stream_id}: writer closed");
            break UploadState::Failed;
        }
    };

    log_debug!("upload stream {stream_id} finished: {outcome:?}");
    state.send_replace(outcome);
    outcome
}
