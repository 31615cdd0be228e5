//! In-memory hub connection.
//!
//! This module provides a pure in-process implementation of the
//! [`HubConnection`] trait. It is intended primarily for testing, local
//! execution, and as a reference for connection semantics.
//!
//! ## Reference Semantics
//!
//! - Ids are minted from one per-connection counter; the invocation id is
//!   allocated before any of its upload stream ids.
//! - A call is registered in the pending table before its frame is written,
//!   so a completion can never overtake its own registration.
//! - Every registered call is resolved exactly once: by its completion, by an
//!   inbound `CancelInvocation`, by the caller going away, or by shutdown.
//! - All outbound frames go through one [`FrameWriter`].
//!
//! ## Non-Goals
//!
//! No byte framing, handshake or reconnection. Frames travel as
//! [`HubMessage`] values over tokio channels.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use futures::stream::{Stream, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_util::sync::CancellationToken;

use super::pending::PendingCalls;
use crate::lock::lock_ignore_poison;
use crate::upload::{UploadMultiplexer, UploadSet, UploadState, UploadStreams};
use crate::{
    // ---
    log_debug,
    log_info,
    log_trace,
    log_warn,
    Completion,
    ConnectionId,
    FrameWriter,
    HubConfig,
    HubConnection,
    HubMessage,
    IdAllocator,
    Invocation,
    InvocationId,
    InvocationReceiver,
    Result,
    RpcError,
    StreamId,
    WireStream,
    WireValue,
};

/// Error text returned for server-to-client streaming invocations.
pub const STREAMING_NOT_SUPPORTED: &str = "Streaming hub methods are not supported by this client.";

/// State shared between the connection handle, its reader task and the
/// guards of in-flight calls.
struct Shared {
    // ---
    connection_id: ConnectionId,
    writer: FrameWriter,
    ids: IdAllocator,
    pending: Mutex<PendingCalls>,
    shutdown: CancellationToken,
}

impl Shared {
    fn ensure_open(&self) -> Result<()> {
        // ---
        if self.shutdown.is_cancelled() {
            return Err(RpcError::ConnectionClosed);
        }
        Ok(())
    }

    /// Fail every pending call. Runs after `shutdown` is cancelled, so no
    /// call registered later can slip past.
    fn fail_all(&self) {
        // ---
        let calls = lock_ignore_poison(&self.pending).drain();
        if !calls.is_empty() {
            log_debug!("{}: failing {} pending call(s)", self.connection_id, calls.len());
        }
        for call in calls {
            call.resolve(Err(RpcError::ConnectionClosed));
        }
    }
}

/// Frames exchanged with a [`MemoryConnection`] by a scripted peer.
///
/// # ⚠️  Testing Only
///
/// Lets a test play the server by hand: read what the connection wrote and
/// feed it arbitrary frames.
pub struct RawPeer {
    // ---
    /// Frames written by the connection, in writer order.
    pub from_connection: mpsc::Receiver<HubMessage>,
    /// Frames delivered to the connection's reader.
    pub to_connection: mpsc::Sender<HubMessage>,
}

impl RawPeer {
    /// Next frame written by the connection.
    pub async fn recv(&mut self) -> Option<HubMessage> {
        self.from_connection.recv().await
    }

    /// Deliver a frame to the connection.
    pub async fn send(&self, frame: impl Into<HubMessage>) -> Result<()> {
        // ---
        self.to_connection
            .send(frame.into())
            .await
            .map_err(|_| RpcError::ConnectionClosed)
    }
}

/// In-process hub connection.
///
/// Owns the pending-call table and the single ordered writer. One reader task
/// consumes inbound frames: completions and stream items resolve pending
/// calls, invocations are forwarded to [`HubConnection::take_invocations`].
///
/// The reader never waits on a caller. Each download stream queues its own
/// items, so an undrained stream does not hold up sibling calls.
pub struct MemoryConnection {
    // ---
    shared: Arc<Shared>,
    invocations: Mutex<Option<InvocationReceiver>>,
    _reader: JoinHandle<()>,
}

impl MemoryConnection {
    /// Build a connection over an existing frame channel pair.
    ///
    /// The outbound channel's capacity bounds the writer queue. Must be called
    /// from within a Tokio runtime.
    pub fn from_channels(
        outbound: mpsc::Sender<HubMessage>,
        inbound: mpsc::Receiver<HubMessage>,
    ) -> Arc<Self> {
        // ---
        let connection_id = ConnectionId::generate();
        log_debug!("{connection_id}: create memory connection");

        let shared = Arc::new(Shared {
            connection_id,
            writer: FrameWriter::new(outbound),
            ids: IdAllocator::new(),
            pending: Mutex::new(PendingCalls::new()),
            shutdown: CancellationToken::new(),
        });

        let (invocations_tx, invocations_rx) = mpsc::unbounded_channel();
        let reader = tokio::spawn(run_reader(shared.clone(), inbound, invocations_tx));

        Arc::new(Self {
            shared,
            invocations: Mutex::new(Some(invocations_rx)),
            _reader: reader,
        })
    }

    /// Two connections wired to each other.
    pub fn pair(config: HubConfig) -> (Arc<Self>, Arc<Self>) {
        // ---
        let (a_tx, b_rx) = mpsc::channel(config.writer_capacity.max(1));
        let (b_tx, a_rx) = mpsc::channel(config.writer_capacity.max(1));
        (
            Self::from_channels(a_tx, a_rx),
            Self::from_channels(b_tx, b_rx),
        )
    }

    /// A connection whose far end is driven by hand.
    pub fn with_peer(config: HubConfig) -> (Arc<Self>, RawPeer) {
        // ---
        let (out_tx, out_rx) = mpsc::channel(config.writer_capacity.max(1));
        let (in_tx, in_rx) = mpsc::channel(config.writer_capacity.max(1));
        let connection = Self::from_channels(out_tx, in_rx);
        let peer = RawPeer {
            from_connection: out_rx,
            to_connection: in_tx,
        };
        (connection, peer)
    }

    /// Number of outbound calls still waiting for a completion.
    pub fn pending_calls(&self) -> usize {
        lock_ignore_poison(&self.shared.pending).len()
    }

    /// Whether the connection has shut down.
    pub fn is_closed(&self) -> bool {
        self.shared.shutdown.is_cancelled()
    }

    /// Allocate the call's id and stream ids, then register it.
    ///
    /// `register` runs under the pending-table lock and returns the caller's
    /// end of the waiter.
    fn open_call<W>(
        &self,
        uploads: UploadStreams,
        register: impl FnOnce(&mut PendingCalls, InvocationId, CancellationToken) -> W,
    ) -> Result<(OpenCall, W)> {
        // ---
        let shared = &self.shared;
        shared.ensure_open()?;

        let invocation_id = shared.ids.next_id();
        let multiplexer = UploadMultiplexer::bind(uploads, &shared.ids);
        let uploads = shared.shutdown.child_token();

        let waiter = register(
            &mut lock_ignore_poison(&shared.pending),
            invocation_id.clone(),
            uploads.clone(),
        );

        let guard = CallGuard {
            shared: shared.clone(),
            invocation_id: invocation_id.clone(),
            uploads,
        };

        // A close racing the registration has already drained the table.
        shared.ensure_open()?;

        let call = OpenCall {
            invocation_id,
            multiplexer: Some(multiplexer),
            guard,
        };
        Ok((call, waiter))
    }
}

struct OpenCall {
    invocation_id: InvocationId,
    multiplexer: Option<UploadMultiplexer>,
    guard: CallGuard,
}

impl OpenCall {
    /// Write the invocation frame, then start draining uploads.
    async fn transmit(
        &mut self,
        shared: &Shared,
        target: &str,
        arguments: Vec<WireValue>,
        streaming: bool,
    ) -> Result<()> {
        // ---
        let stream_ids = self
            .multiplexer
            .as_ref()
            .map(UploadMultiplexer::stream_ids)
            .unwrap_or_default();
        let invocation = Invocation::new(
            target,
            Some(self.invocation_id.clone()),
            arguments,
            stream_ids,
        );

        log_trace!(
            "{}: {} '{target}' as {}",
            shared.connection_id,
            if streaming { "stream" } else { "invoke" },
            self.invocation_id
        );

        let frame = if streaming {
            HubMessage::StreamInvocation(invocation)
        } else {
            HubMessage::Invocation(invocation)
        };
        shared.writer.write(frame).await?;

        if let Some(multiplexer) = self.multiplexer.take() {
            if !multiplexer.is_empty() {
                let set = multiplexer.start(shared.writer.clone(), self.guard.uploads.clone());
                watch_uploads(shared.connection_id.clone(), set);
            }
        }
        Ok(())
    }
}

/// Cancels an outbound call whose caller went away.
///
/// Always stops the call's uploads. If the call is still pending, removes it
/// and tells the peer with `CancelInvocation`.
struct CallGuard {
    // ---
    shared: Arc<Shared>,
    invocation_id: InvocationId,
    uploads: CancellationToken,
}

impl Drop for CallGuard {
    fn drop(&mut self) {
        // ---
        self.uploads.cancel();

        let abandoned = lock_ignore_poison(&self.shared.pending)
            .take(&self.invocation_id)
            .is_some();

        if abandoned {
            log_debug!(
                "{}: cancelling abandoned call {}",
                self.shared.connection_id,
                self.invocation_id
            );
            self.shared.writer.write_detached(HubMessage::CancelInvocation {
                invocation_id: self.invocation_id.clone(),
            });
        }
    }
}

/// Download stream of one `stream` call.
///
/// Dropping it before the terminal frame cancels the call.
struct DownloadStream {
    inner: UnboundedReceiverStream<Result<WireValue>>,
    _guard: CallGuard,
}

impl Stream for DownloadStream {
    type Item = Result<WireValue>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }
}

#[async_trait::async_trait]
impl HubConnection for MemoryConnection {
    // ---
    fn connection_id(&self) -> &ConnectionId {
        &self.shared.connection_id
    }

    async fn send(
        &self,
        target: &str,
        arguments: Vec<WireValue>,
        uploads: UploadStreams,
    ) -> Result<()> {
        // ---
        let shared = &self.shared;
        shared.ensure_open()?;

        let multiplexer = UploadMultiplexer::bind(uploads, &shared.ids);
        let invocation = Invocation::new(target, None, arguments, multiplexer.stream_ids());

        log_trace!("{}: send '{target}'", shared.connection_id);
        shared.writer.write(HubMessage::Invocation(invocation)).await?;

        if !multiplexer.is_empty() {
            let set = multiplexer.start(shared.writer.clone(), shared.shutdown.child_token());
            watch_uploads(shared.connection_id.clone(), set);
        }
        Ok(())
    }

    async fn invoke(
        &self,
        target: &str,
        arguments: Vec<WireValue>,
        uploads: UploadStreams,
    ) -> Result<WireValue> {
        // ---
        let (mut call, rx) = self.open_call(uploads, |pending, id, token| {
            pending.register_single(id, token)
        })?;

        call.transmit(&self.shared, target, arguments, false).await?;

        // The guard stays alive until here so dropping this future cancels.
        let outcome = rx.await.unwrap_or(Err(RpcError::ConnectionClosed));
        drop(call);
        outcome
    }

    async fn stream(
        &self,
        target: &str,
        arguments: Vec<WireValue>,
        uploads: UploadStreams,
    ) -> Result<WireStream> {
        // ---
        let (mut call, rx) = self.open_call(uploads, |pending, id, token| {
            pending.register_stream(id, token)
        })?;

        call.transmit(&self.shared, target, arguments, true).await?;

        Ok(DownloadStream {
            inner: UnboundedReceiverStream::new(rx),
            _guard: call.guard,
        }
        .boxed())
    }

    async fn complete(&self, completion: Completion) -> Result<()> {
        // ---
        self.shared.ensure_open()?;
        log_trace!(
            "{}: complete {}",
            self.shared.connection_id,
            completion.invocation_id()
        );
        self.shared.writer.write(completion.into()).await
    }

    fn take_invocations(&self) -> Result<InvocationReceiver> {
        // ---
        lock_ignore_poison(&self.invocations)
            .take()
            .ok_or_else(|| RpcError::InvalidState("inbound invocations already taken".into()))
    }

    async fn close(&self) -> Result<()> {
        // ---
        let shared = &self.shared;
        if shared.shutdown.is_cancelled() {
            return Ok(());
        }

        log_info!("{}: closing connection", shared.connection_id);

        // Best effort; the peer may already be gone.
        let _ = shared.writer.write(HubMessage::Close { error: None }).await;
        shared.shutdown.cancel();
        shared.fail_all();
        Ok(())
    }
}

impl Drop for MemoryConnection {
    fn drop(&mut self) {
        self.shared.shutdown.cancel();
    }
}

async fn run_reader(
    shared: Arc<Shared>,
    mut inbound: mpsc::Receiver<HubMessage>,
    invocations: mpsc::UnboundedSender<Invocation>,
) {
    // ---
    let _id = shared.connection_id.clone();

    loop {
        let frame = tokio::select! {
            biased;
            _ = shared.shutdown.cancelled() => break,
            frame = inbound.recv() => match frame {
                Some(frame) => frame,
                None => {
                    log_debug!("{_id}: inbound channel closed");
                    break;
                }
            },
        };

        log_trace!("{_id}: inbound frame type {}", frame.type_code());

        match frame {
            HubMessage::Invocation(invocation) => {
                if invocations.send(invocation).is_err() {
                    log_debug!("{_id}: no invocation consumer, dropping invocation");
                }
            }

            HubMessage::StreamInvocation(invocation) => {
                log_warn!(
                    "{_id}: rejecting streaming invocation of '{}'",
                    invocation.target()
                );
                if let Some(invocation_id) = invocation.invocation_id() {
                    let completion = Completion::error(invocation_id.clone(), STREAMING_NOT_SUPPORTED);
                    shared.writer.write_detached(completion.into());
                }
            }

            HubMessage::StreamItem {
                invocation_id,
                item,
            } => {
                let sender = lock_ignore_poison(&shared.pending).stream_sender(&invocation_id);
                let Some(sender) = sender else {
                    log_debug!("{_id}: stream item for unknown call {invocation_id}");
                    continue;
                };
                // Err means the consumer dropped; its guard cancels the call.
                let _ = sender.send(Ok(item));
            }

            HubMessage::Completion(completion) => {
                let call = lock_ignore_poison(&shared.pending).take(completion.invocation_id());
                let Some(call) = call else {
                    log_debug!(
                        "{_id}: completion for unknown call {}",
                        completion.invocation_id()
                    );
                    continue;
                };
                call.resolve(completion.into_result());
            }

            HubMessage::CancelInvocation { invocation_id } => {
                let call = lock_ignore_poison(&shared.pending).take(&invocation_id);
                if let Some(call) = call {
                    log_debug!("{_id}: peer cancelled call {invocation_id}");
                    call.resolve(Err(RpcError::Cancelled));
                }
            }

            HubMessage::Close { error } => {
                if let Some(_reason) = error {
                    log_warn!("{_id}: peer closed the connection: {_reason}");
                } else {
                    log_info!("{_id}: peer closed the connection");
                }
                break;
            }
        }
    }

    shared.shutdown.cancel();
    shared.fail_all();
    log_debug!("{_id}: reader stopped");
}

/// Wait for a call's upload streams to settle and log the ones that did not
/// complete.
fn watch_uploads(
    _connection_id: ConnectionId,
    set: UploadSet,
) -> JoinHandle<HashMap<StreamId, UploadState>> {
    // ---
    tokio::spawn(async move {
        let states = set.join().await;
        for (_stream_id, _state) in &states {
            if *_state == UploadState::Completed {
                log_trace!("{_connection_id}: upload {_stream_id} completed");
            } else {
                log_debug!("{_connection_id}: upload {_stream_id} ended {_state:?}");
            }
        }
        states
    })
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use serde_json::json;
    use std::time::Duration;
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(2);

    #[tokio::test]
    async fn test_invoke_resolves_on_completion() {
        // ---
        let (connection, mut peer) = MemoryConnection::with_peer(HubConfig::default());

        let invoker = connection.clone();
        let call = tokio::spawn(async move {
            invoker
                .invoke("Add", vec![json!(2), json!(3)], UploadStreams::new())
                .await
        });

        let frame = timeout(WAIT, peer.recv()).await.unwrap().unwrap();
        let HubMessage::Invocation(invocation) = frame else {
            panic!("expected invocation, got {frame:?}");
        };
        assert_eq!(invocation.target(), "Add");
        assert_eq!(invocation.arguments(), &[json!(2), json!(3)]);

        let id = invocation.invocation_id().unwrap().clone();
        peer.send(Completion::value(id, json!(5))).await.unwrap();

        let result = timeout(WAIT, call).await.unwrap().unwrap().unwrap();
        assert_eq!(result, json!(5));
        assert_eq!(connection.pending_calls(), 0);
    }

    #[tokio::test]
    async fn test_take_invocations_once() {
        // ---
        let (connection, _peer) = MemoryConnection::with_peer(HubConfig::default());
        assert!(connection.take_invocations().is_ok());
        assert!(matches!(
            connection.take_invocations(),
            Err(RpcError::InvalidState(_))
        ));
    }

    #[tokio::test]
    async fn test_closed_connection_rejects_calls() {
        // ---
        let (connection, mut peer) = MemoryConnection::with_peer(HubConfig::default());
        connection.close().await.unwrap();

        let frame = timeout(WAIT, peer.recv()).await.unwrap().unwrap();
        assert_eq!(frame, HubMessage::Close { error: None });

        let err = connection
            .invoke("Echo", vec![], UploadStreams::new())
            .await
            .unwrap_err();
        assert!(matches!(err, RpcError::ConnectionClosed));
        assert!(connection.is_closed());
    }

    #[tokio::test]
    async fn test_streaming_invocation_is_rejected() {
        // ---
        let (_connection, mut peer) = MemoryConnection::with_peer(HubConfig::default());

        let invocation = Invocation::new("Counter", Some("9".into()), vec![], vec![]);
        peer.send(HubMessage::StreamInvocation(invocation)).await.unwrap();

        let frame = timeout(WAIT, peer.recv()).await.unwrap().unwrap();
        assert_eq!(
            frame,
            HubMessage::Completion(Completion::error("9".into(), STREAMING_NOT_SUPPORTED))
        );
    }

    #[tokio::test]
    async fn test_watch_uploads_reports_final_states() {
        // ---
        let (writer, _frames) = FrameWriter::channel(16);
        let ids = IdAllocator::new();

        let uploads = UploadStreams::new()
            .with(futures::stream::iter(vec![1, 2]))
            .with_fallible(futures::stream::iter(vec![Err::<i32, _>("source gone")]));
        let set = UploadMultiplexer::bind(uploads, &ids).start(writer, CancellationToken::new());

        let states = timeout(WAIT, watch_uploads(ConnectionId::generate(), set))
            .await
            .unwrap()
            .unwrap();

        assert_eq!(states.len(), 2);
        assert_eq!(states[&StreamId::from("1")], UploadState::Completed);
        assert_eq!(states[&StreamId::from("2")], UploadState::Failed);
    }

    #[tokio::test]
    async fn test_watch_uploads_sees_cancelled_call() {
        // ---
        let (writer, _frames) = FrameWriter::channel(16);
        let ids = IdAllocator::new();
        let cancel = CancellationToken::new();

        let (_source_tx, source_rx) = mpsc::channel::<i32>(1);
        let uploads = UploadStreams::new().with(tokio_stream::wrappers::ReceiverStream::new(source_rx));
        let set = UploadMultiplexer::bind(uploads, &ids).start(writer, cancel.clone());
        let watcher = watch_uploads(ConnectionId::generate(), set);

        cancel.cancel();

        let states = timeout(WAIT, watcher).await.unwrap().unwrap();
        assert_eq!(states[&StreamId::from("1")], UploadState::Cancelled);
    }
}
