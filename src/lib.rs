//! Hub-protocol RPC correlation and streaming.
//!
//! This library implements the client half of a SignalR-style hub protocol
//! over one persistent connection: invoking named remote methods with typed
//! positional arguments, streaming values to the peer while invoking,
//! receiving streams of results back, and answering invocations the peer
//! makes on locally registered handlers.
//!
//! The physical transport, handshake and byte framing live behind the
//! [`HubConnection`] trait. [`MemoryConnection`] is the in-process reference
//! implementation.
//!

// Import all sub modules once...
mod dispatch;
mod domain;
mod hub;
mod hub_builder;
mod hub_config;
mod lock;
mod macros;
mod marshal;
mod transport;
mod upload;

mod error;

pub(crate) use macros::{log_debug, log_error, log_info, log_trace, log_warn};

// Re-export main types
pub use hub::{HubClient, HubStream};
pub use hub_builder::HubClientBuilder;

pub use hub_config::{
    //
    HubConfig,
    DEFAULT_INVOCATION_TIMEOUT,
    DEFAULT_WRITER_CAPACITY,
};

pub use dispatch::{
    //
    Admission,
    HandlerSubscription,
    ResultHandlerRegistry,
    NO_RESULT_HANDLER,
};

pub use error::{Result, RpcError};
pub use marshal::{from_wire, to_wire, FromArguments, HubArgs};
pub use upload::{UploadMultiplexer, UploadSet, UploadState, UploadStreams};

pub use transport::{MemoryConnection, RawPeer, STREAMING_NOT_SUPPORTED};

// --- public re-exports
pub use domain::{
    //
    Completion,
    ConnectionId,
    ConnectionPtr,
    FrameWriter,
    HubConnection,
    HubMessage,
    IdAllocator,
    Invocation,
    InvocationId,
    InvocationReceiver,
    StreamId,
    WireStream,
    WireValue,
};
