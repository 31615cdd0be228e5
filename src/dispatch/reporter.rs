//! Result reporter.
//!
//! Turns one inbound invocation plus a callback into exactly one completion.
//! Every way the callback can fail (argument decoding, an `Err` return, an
//! unserializable result, a panic) collapses into an error completion, so a
//! remote caller waiting on the invocation id is always answered. Invocations
//! without an id are fire-and-forget and produce no completion.

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;

use futures::FutureExt;
use serde::Serialize;

use crate::marshal::FromArguments;
use crate::{
    // ---
    log_debug,
    log_error,
    log_warn,
    Completion,
    ConnectionPtr,
    Invocation,
    InvocationId,
    Result,
    RpcError,
    WireValue,
};

/// Error text sent when an invocation expects a result but no
/// result-returning handler is subscribed for its target.
pub const NO_RESULT_HANDLER: &str = "Client didn't provide a result.";

/// Decode `arguments`, run `callback` and marshal its result.
pub(crate) async fn execute<A, R, F, Fut>(arguments: Vec<WireValue>, callback: &F) -> Result<WireValue>
where
    A: FromArguments,
    R: Serialize,
    F: Fn(A) -> Fut,
    Fut: Future<Output = Result<R>>,
{
    // ---
    let args = A::from_arguments(arguments)?;

    let outcome = AssertUnwindSafe(async { callback(args).await })
        .catch_unwind()
        .await
        .map_err(|payload| RpcError::Handler(panic_message(payload)))?;

    let result = outcome?;
    Ok(serde_json::to_value(&result)?)
}

/// Run the callback for `invocation` and report its outcome.
///
/// Called exactly once per routed invocation.
pub(crate) async fn handle_invocation<A, R, F, Fut>(
    connection: &ConnectionPtr,
    invocation: Invocation,
    callback: &F,
) where
    A: FromArguments,
    R: Serialize,
    F: Fn(A) -> Fut,
    Fut: Future<Output = Result<R>>,
{
    // ---
    let _target = invocation.target().to_string();
    let (invocation_id, arguments) = invocation.into_parts();
    let outcome = execute(arguments, callback).await;

    let Some(invocation_id) = invocation_id else {
        if let Err(_err) = outcome {
            log_warn!("handler for '{_target}' failed on fire-and-forget invocation: {_err}");
        }
        return;
    };

    let completion = match outcome {
        Ok(value) => Completion::value(invocation_id, value),
        Err(err) => {
            log_debug!("handler for '{_target}' failed: {err}");
            Completion::error(invocation_id, err.to_string())
        }
    };

    deliver(connection, completion).await;
}

/// Answer an invocation that no result handler accepted.
pub(crate) async fn report_missing_handler(connection: &ConnectionPtr, invocation_id: InvocationId) {
    // ---
    deliver(connection, Completion::error(invocation_id, NO_RESULT_HANDLER)).await;
}

async fn deliver(connection: &ConnectionPtr, completion: Completion) {
    // ---
    let _invocation_id = completion.invocation_id().clone();
    if let Err(_err) = connection.complete(completion).await {
        log_error!("failed to deliver completion {_invocation_id}: {_err}");
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    // ---
    let detail = if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    };
    format!("handler panicked: {detail}")
}
