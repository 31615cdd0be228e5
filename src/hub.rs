//! Hub client.
//!
//! Composes outbound calls on top of a [`HubConnection`] and owns the
//! dispatcher for inbound invocations. One client per connection.

use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use futures::stream::{Stream, StreamExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::time;

use crate::dispatch::{validate_target, Dispatcher, HandlerSubscription, ResultHandlerRegistry};
use crate::marshal::{from_wire, FromArguments, HubArgs};
use crate::upload::UploadStreams;
use crate::{
    // ---
    log_debug,
    ConnectionId,
    ConnectionPtr,
    Result,
    RpcError,
    WireStream,
    WireValue,
};

/// Client side of a hub connection.
///
/// Cheap to clone; clones share the connection and the handler
/// subscriptions. Dropping the last clone stops inbound routing but does not
/// close the connection; call [`close`](Self::close) for that.
///
/// # Examples
///
/// ```no_run
/// use hub_rpc::{HubClientBuilder, HubConfig, MemoryConnection};
///
/// # async fn example() -> hub_rpc::Result<()> {
/// let (client_side, server_side) = MemoryConnection::pair(HubConfig::default());
///
/// let server = HubClientBuilder::new(server_side).build()?;
/// let _add = server.on_with_result("Add", |(a, b): (i64, i64)| async move { Ok(a + b) })?;
///
/// let client = HubClientBuilder::new(client_side).build()?;
/// let sum: i64 = client.invoke("Add", (2, 3)).await?;
/// assert_eq!(sum, 5);
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct HubClient {
    inner: Arc<Inner>,
}

struct Inner {
    // ---
    connection: ConnectionPtr,
    dispatcher: Dispatcher,
    invocation_timeout: Option<Duration>,
}

impl HubClient {
    /// Create a client over `connection` (internal use by `HubClientBuilder`).
    pub(crate) fn new(connection: ConnectionPtr, invocation_timeout: Option<Duration>) -> Result<Self> {
        // ---
        let dispatcher = Dispatcher::start(connection.clone())?;
        log_debug!("{}: hub client started", connection.connection_id());

        Ok(Self {
            inner: Arc::new(Inner {
                connection,
                dispatcher,
                invocation_timeout,
            }),
        })
    }

    /// Identifier of the underlying connection.
    pub fn connection_id(&self) -> &ConnectionId {
        self.inner.connection.connection_id()
    }

    /// The underlying connection.
    pub fn connection(&self) -> &ConnectionPtr {
        &self.inner.connection
    }

    /// Result-handler slots of this client.
    pub fn registry(&self) -> &ResultHandlerRegistry {
        self.inner.dispatcher.registry()
    }

    /// Invoke `target` without expecting a result.
    ///
    /// Resolves once the invocation has been handed to the writer.
    pub async fn send(&self, target: &str, args: impl HubArgs) -> Result<()> {
        self.send_with_streams(target, args, UploadStreams::new()).await
    }

    /// [`send`](Self::send) with upload streams.
    pub async fn send_with_streams(
        &self,
        target: &str,
        args: impl HubArgs,
        uploads: UploadStreams,
    ) -> Result<()> {
        // ---
        let arguments = prepare(target, args)?;
        self.inner.connection.send(target, arguments, uploads).await
    }

    /// Invoke `target` and wait for its result.
    ///
    /// # Errors
    ///
    /// Returns [`RpcError::Timeout`] if the configured invocation timeout
    /// expires (the call is cancelled), [`RpcError::Remote`] if the peer
    /// completed it with an error, [`RpcError::Decode`] (index 0) if the
    /// result does not decode as `R`, or the marshalling error of the first
    /// argument that failed to convert.
    pub async fn invoke<R>(&self, target: &str, args: impl HubArgs) -> Result<R>
    where
        R: DeserializeOwned,
    {
        self.invoke_with_streams(target, args, UploadStreams::new()).await
    }

    /// [`invoke`](Self::invoke) with upload streams.
    pub async fn invoke_with_streams<R>(
        &self,
        target: &str,
        args: impl HubArgs,
        uploads: UploadStreams,
    ) -> Result<R>
    where
        R: DeserializeOwned,
    {
        // ---
        let arguments = prepare(target, args)?;
        let call = self.inner.connection.invoke(target, arguments, uploads);
        let value = with_deadline(self.inner.invocation_timeout, call).await?;
        from_wire(0, value)
    }

    /// Invoke `target` with a deadline for this call only.
    ///
    /// Overrides the configured invocation timeout.
    pub async fn invoke_with_timeout<R>(
        &self,
        target: &str,
        args: impl HubArgs,
        timeout: Duration,
    ) -> Result<R>
    where
        R: DeserializeOwned,
    {
        // ---
        let arguments = prepare(target, args)?;
        let call = self
            .inner
            .connection
            .invoke(target, arguments, UploadStreams::new());
        let value = with_deadline(Some(timeout), call).await?;
        from_wire(0, value)
    }

    /// Invoke a streaming method and receive its items.
    ///
    /// Items are decoded as they are polled. Dropping the stream before it
    /// ends cancels the call.
    pub async fn stream<R>(&self, target: &str, args: impl HubArgs) -> Result<HubStream<R>>
    where
        R: DeserializeOwned,
    {
        self.stream_with_streams(target, args, UploadStreams::new()).await
    }

    /// [`stream`](Self::stream) with upload streams.
    pub async fn stream_with_streams<R>(
        &self,
        target: &str,
        args: impl HubArgs,
        uploads: UploadStreams,
    ) -> Result<HubStream<R>>
    where
        R: DeserializeOwned,
    {
        // ---
        let arguments = prepare(target, args)?;
        let items = self.inner.connection.stream(target, arguments, uploads).await?;
        Ok(HubStream::new(items))
    }

    /// Subscribe a handler for `target`.
    ///
    /// Any number of plain handlers may share a target; each receives every
    /// invocation. Decode and callback failures are logged and the
    /// subscription keeps running.
    pub fn on<A, F, Fut>(&self, target: &str, callback: F) -> Result<HandlerSubscription>
    where
        A: FromArguments + Send + 'static,
        F: Fn(A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.inner.dispatcher.on(target, callback)
    }

    /// Subscribe the result-returning handler for `target`.
    ///
    /// Its outcome is reported to the peer as the invocation's completion.
    ///
    /// # Errors
    ///
    /// Returns [`RpcError::HandlerConflict`] if another result handler is
    /// subscribed for `target`.
    pub fn on_with_result<A, R, F, Fut>(&self, target: &str, callback: F) -> Result<HandlerSubscription>
    where
        A: FromArguments + Send + 'static,
        R: Serialize + Send + 'static,
        F: Fn(A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R>> + Send + 'static,
    {
        self.inner.dispatcher.on_with_result(target, callback)
    }

    /// Close the underlying connection. Pending calls fail with
    /// [`RpcError::ConnectionClosed`].
    pub async fn close(&self) -> Result<()> {
        self.inner.connection.close().await
    }
}

fn prepare(target: &str, args: impl HubArgs) -> Result<Vec<WireValue>> {
    // ---
    validate_target(target)?;
    args.into_arguments()
}

async fn with_deadline<F>(limit: Option<Duration>, call: F) -> Result<WireValue>
where
    F: Future<Output = Result<WireValue>>,
{
    // ---
    match limit {
        Some(limit) => time::timeout(limit, call)
            .await
            .map_err(|_| RpcError::Timeout)?,
        None => call.await,
    }
}

/// Typed download stream returned by [`HubClient::stream`].
///
/// An item that fails to decode is yielded as an `Err` and the stream
/// continues. A remote error arrives as the last item.
pub struct HubStream<R> {
    // ---
    items: WireStream,
    index: usize,
    _marker: PhantomData<fn() -> R>,
}

impl<R> HubStream<R> {
    fn new(items: WireStream) -> Self {
        Self {
            items,
            index: 0,
            _marker: PhantomData,
        }
    }
}

impl<R: DeserializeOwned> Stream for HubStream<R> {
    type Item = Result<R>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        // ---
        let next = match self.items.poll_next_unpin(cx) {
            Poll::Ready(next) => next,
            Poll::Pending => return Poll::Pending,
        };

        Poll::Ready(next.map(|item| {
            let index = self.index;
            self.index += 1;
            item.and_then(|value| from_wire(index, value))
        }))
    }
}
