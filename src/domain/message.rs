// src/domain/message.rs

//! Hub protocol message model.
//!
//! These types are the boundary between the correlation core and the
//! connection layer. They carry already-framed protocol messages: target
//! names, invocation ids and argument values are extracted, but arguments are
//! still opaque [`WireValue`]s that only the marshaller interprets.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use uuid::Uuid;

/// Wire-neutral serialized value exchanged with the codec.
///
/// The core never inspects its structure; it is produced and consumed only
/// by [`crate::marshal`].
pub type WireValue = serde_json::Value;

/// Identifier correlating an invocation with its stream items and completion.
///
/// Upload streams are keyed by the same kind of identifier: on the wire a
/// stream item or stream completion names its stream id in the
/// `invocationId` slot.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InvocationId(String);

/// Identifier of one upload stream attached to an invocation.
pub type StreamId = InvocationId;

impl InvocationId {
    /// Borrow the id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for InvocationId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for InvocationId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl fmt::Display for InvocationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Per-connection id allocator.
///
/// Invocation ids and stream ids come from the same counter so the two can
/// never collide on one connection. Ids start at `"1"`.
#[derive(Debug, Default)]
pub struct IdAllocator {
    next: AtomicU64,
}

impl IdAllocator {
    /// Create an allocator whose first id is `"1"`.
    pub fn new() -> Self {
        Self::default()
    }

    /// Mint the next id.
    pub fn next_id(&self) -> InvocationId {
        // ---
        let value = self.next.fetch_add(1, Ordering::Relaxed) + 1;
        InvocationId(value.to_string())
    }
}

/// Unique identifier of one connection instance, used in log lines.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectionId(String);

impl ConnectionId {
    /// Generate a new random connection id.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Borrow the id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One remote procedure call message.
///
/// `invocation_id` is present iff the sender expects a completion (or stream
/// items) back. Once built an invocation is never modified; consumers move
/// the arguments out with [`Invocation::into_parts`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Invocation {
    // ---
    #[serde(default, skip_serializing_if = "Option::is_none")]
    invocation_id: Option<InvocationId>,

    target: String,

    #[serde(default)]
    arguments: Vec<WireValue>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    stream_ids: Vec<StreamId>,
}

impl Invocation {
    /// Build an invocation.
    pub fn new(
        target: impl Into<String>,
        invocation_id: Option<InvocationId>,
        arguments: Vec<WireValue>,
        stream_ids: Vec<StreamId>,
    ) -> Self {
        // ---
        Self {
            invocation_id,
            target: target.into(),
            arguments,
            stream_ids,
        }
    }

    /// Target method name.
    pub fn target(&self) -> &str {
        &self.target
    }

    /// Correlation id, if the sender expects a completion.
    pub fn invocation_id(&self) -> Option<&InvocationId> {
        self.invocation_id.as_ref()
    }

    /// Positional arguments in caller order.
    pub fn arguments(&self) -> &[WireValue] {
        &self.arguments
    }

    /// Ids of the upload streams announced with this invocation.
    pub fn stream_ids(&self) -> &[StreamId] {
        &self.stream_ids
    }

    /// Consume the invocation, yielding its id and arguments.
    pub fn into_parts(self) -> (Option<InvocationId>, Vec<WireValue>) {
        (self.invocation_id, self.arguments)
    }
}

/// Terminal message for an invocation or an upload stream.
///
/// Carries either a result, an error, or neither (a void completion).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Completion {
    // ---
    invocation_id: InvocationId,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    result: Option<WireValue>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl Completion {
    /// Completion without a result value.
    pub fn void(invocation_id: InvocationId) -> Self {
        Self {
            invocation_id,
            result: None,
            error: None,
        }
    }

    /// Successful completion carrying `result`.
    pub fn value(invocation_id: InvocationId, result: WireValue) -> Self {
        Self {
            invocation_id,
            result: Some(result),
            error: None,
        }
    }

    /// Failed completion carrying an error message.
    pub fn error(invocation_id: InvocationId, message: impl Into<String>) -> Self {
        Self {
            invocation_id,
            result: None,
            error: Some(message.into()),
        }
    }

    /// Id of the invocation (or upload stream) this completes.
    pub fn invocation_id(&self) -> &InvocationId {
        &self.invocation_id
    }

    /// Result value, if any.
    pub fn result(&self) -> Option<&WireValue> {
        self.result.as_ref()
    }

    /// Error message, if the completion reports a failure.
    pub fn error_message(&self) -> Option<&str> {
        self.error.as_deref()
    }

    /// Whether this completion reports a failure.
    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    /// Convert into the caller-facing outcome.
    ///
    /// A void completion yields [`WireValue::Null`]; an error completion
    /// yields [`RpcError::Remote`](crate::RpcError::Remote).
    pub fn into_result(self) -> crate::Result<WireValue> {
        // ---
        match self.error {
            Some(message) => Err(crate::RpcError::Remote(message)),
            None => Ok(self.result.unwrap_or(WireValue::Null)),
        }
    }
}

/// A framed hub protocol message.
///
/// This is what travels through the single ordered writer of a connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum HubMessage {
    /// Invocation expecting at most one completion.
    Invocation(Invocation),

    /// One item of a download stream, or of an upload stream keyed by its
    /// stream id.
    #[serde(rename_all = "camelCase")]
    StreamItem {
        /// Invocation or stream id the item belongs to.
        invocation_id: InvocationId,
        /// Item payload.
        item: WireValue,
    },

    /// Terminal message for an invocation or upload stream.
    Completion(Completion),

    /// Invocation expecting a stream of items followed by a completion.
    StreamInvocation(Invocation),

    /// Request to stop a pending invocation.
    #[serde(rename_all = "camelCase")]
    CancelInvocation {
        /// Invocation to cancel.
        invocation_id: InvocationId,
    },

    /// The peer is closing the connection.
    Close {
        /// Optional reason for closing.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
}

impl HubMessage {
    /// Numeric message type used by the hub protocol.
    pub fn type_code(&self) -> u8 {
        // ---
        match self {
            HubMessage::Invocation(_) => 1,
            HubMessage::StreamItem { .. } => 2,
            HubMessage::Completion(_) => 3,
            HubMessage::StreamInvocation(_) => 4,
            HubMessage::CancelInvocation { .. } => 5,
            HubMessage::Close { .. } => 7,
        }
    }
}

impl From<Completion> for HubMessage {
    fn from(completion: Completion) -> Self {
        HubMessage::Completion(completion)
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use serde_json::json;

    #[test]
    fn test_ids_are_sequential_from_one() {
        // ---
        let ids = IdAllocator::new();
        assert_eq!(ids.next_id().as_str(), "1");
        assert_eq!(ids.next_id().as_str(), "2");
        assert_eq!(ids.next_id().as_str(), "3");
    }

    #[test]
    fn test_connection_id_is_uuid() {
        // ---
        let a = ConnectionId::generate();
        let b = ConnectionId::generate();
        assert_ne!(a, b);
        assert_eq!(a.as_str().len(), 36);
    }

    #[test]
    fn test_invocation_json_shape() {
        // ---
        let invocation = Invocation::new(
            "Echo",
            Some("1".into()),
            vec![json!("hi")],
            vec!["2".into()],
        );

        let value = serde_json::to_value(HubMessage::Invocation(invocation)).unwrap();
        assert_eq!(
            value,
            json!({
                "type": "Invocation",
                "invocationId": "1",
                "target": "Echo",
                "arguments": ["hi"],
                "streamIds": ["2"],
            })
        );
    }

    #[test]
    fn test_fire_and_forget_omits_id() {
        // ---
        let invocation = Invocation::new("Notify", None, vec![], vec![]);
        let value = serde_json::to_value(&invocation).unwrap();
        assert_eq!(value, json!({ "target": "Notify", "arguments": [] }));
    }

    #[test]
    fn test_completion_outcomes() {
        // ---
        let ok = Completion::value("1".into(), json!("hi"));
        assert_eq!(
            serde_json::to_value(&ok).unwrap(),
            json!({ "invocationId": "1", "result": "hi" })
        );
        assert_eq!(ok.into_result().unwrap(), json!("hi"));

        let void = Completion::void("2".into());
        assert_eq!(void.clone().into_result().unwrap(), WireValue::Null);

        let failed = Completion::error("3".into(), "boom");
        assert!(failed.is_error());
        assert!(matches!(
            failed.into_result(),
            Err(crate::RpcError::Remote(message)) if message == "boom"
        ));
    }

    #[test]
    fn test_type_codes() {
        // ---
        let cancel = HubMessage::CancelInvocation {
            invocation_id: "4".into(),
        };
        assert_eq!(cancel.type_code(), 5);
        assert_eq!(HubMessage::Close { error: None }.type_code(), 7);
        assert_eq!(HubMessage::from(Completion::void("1".into())).type_code(), 3);
    }
}
