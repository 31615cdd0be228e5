//! Domain layer public interface.
//!
//! Message model and connection abstractions shared by the hub core and the
//! connection layer. They make no reference to a concrete transport or codec.
//!
//! All domain consumers must import symbols via this module, not by
//! referencing individual files directly.

mod connection;
mod message;

// --- Connection domain re-exports ---

pub use connection::{
    //
    ConnectionPtr,
    FrameWriter,
    HubConnection,
    InvocationReceiver,
    WireStream,
};

// --- Message domain re-exports ---

pub use message::{
    //
    Completion,
    ConnectionId,
    HubMessage,
    IdAllocator,
    Invocation,
    InvocationId,
    StreamId,
    WireValue,
};
