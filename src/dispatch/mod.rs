//! Inbound invocation dispatch.
//!
//! One router task drains the connection's invocation sequence and fans each
//! invocation out to every subscription whose target matches exactly. Each
//! subscription owns an unbounded queue and a task that runs its callback
//! sequentially, so arrival order is preserved per subscription and a slow
//! handler never stalls the reader or its siblings.
//!
//! An invocation that carries an id but reaches no result-returning handler
//! is answered with a [`NO_RESULT_HANDLER`] error completion, which keeps
//! the remote caller from waiting forever.

mod registry;
mod reporter;

use std::future::Future;
use std::sync::{Arc, Mutex, Weak};

use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::lock::lock_ignore_poison;
use crate::marshal::FromArguments;
use crate::{
    // ---
    log_debug,
    log_trace,
    log_warn,
    ConnectionPtr,
    Invocation,
    InvocationReceiver,
    Result,
    RpcError,
};

pub use registry::{Admission, ResultHandlerRegistry};
pub use reporter::NO_RESULT_HANDLER;

struct Route {
    // ---
    id: u64,
    target: String,
    expects_result: bool,
    tx: mpsc::UnboundedSender<Invocation>,
}

#[derive(Default)]
struct DispatchTable {
    // ---
    routes: Vec<Route>,
    next_id: u64,
}

impl DispatchTable {
    fn insert(&mut self, target: &str, expects_result: bool) -> (u64, mpsc::UnboundedReceiver<Invocation>) {
        // ---
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.next_id;
        self.next_id += 1;
        self.routes.push(Route {
            id,
            target: target.to_string(),
            expects_result,
            tx,
        });
        (id, rx)
    }

    fn remove(&mut self, id: u64) {
        self.routes.retain(|route| route.id != id);
    }
}

/// Routes inbound invocations to subscribed handlers.
pub(crate) struct Dispatcher {
    // ---
    connection: ConnectionPtr,
    registry: Arc<ResultHandlerRegistry>,
    table: Arc<Mutex<DispatchTable>>,
    router: JoinHandle<()>,
}

impl Dispatcher {
    /// Take the connection's invocation sequence and start routing it.
    ///
    /// Must be called from within a Tokio runtime.
    pub(crate) fn start(connection: ConnectionPtr) -> Result<Self> {
        // ---
        let invocations = connection.take_invocations()?;
        let table = Arc::new(Mutex::new(DispatchTable::default()));

        let router = tokio::spawn(run_router(
            invocations,
            Arc::downgrade(&table),
            connection.clone(),
        ));

        Ok(Self {
            connection,
            registry: Arc::new(ResultHandlerRegistry::new()),
            table,
            router,
        })
    }

    pub(crate) fn registry(&self) -> &Arc<ResultHandlerRegistry> {
        &self.registry
    }

    /// Subscribe a plain handler. Any number may share a target.
    pub(crate) fn on<A, F, Fut>(&self, target: &str, callback: F) -> Result<HandlerSubscription>
    where
        A: FromArguments + Send + 'static,
        F: Fn(A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        // ---
        validate_target(target)?;

        let (route_id, mut rx) = lock_ignore_poison(&self.table).insert(target, false);
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let _target = target.to_string();

        let task = tokio::spawn(async move {
            // ---
            loop {
                let invocation = tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    next = rx.recv() => match next {
                        Some(invocation) => invocation,
                        None => break,
                    },
                };

                let (_, arguments) = invocation.into_parts();
                tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    outcome = reporter::execute(arguments, &callback) => {
                        if let Err(_err) = outcome {
                            log_warn!("handler for '{_target}' failed: {_err}");
                        }
                    }
                }
            }
        });

        log_debug!("subscribed handler for '{target}'");

        Ok(HandlerSubscription {
            target: target.to_string(),
            lease: SubscriptionLease {
                table: Arc::downgrade(&self.table),
                route_id,
                admission: None,
            },
            cancel,
            task: Some(task),
        })
    }

    /// Subscribe the single result-returning handler for `target`.
    ///
    /// # Errors
    ///
    /// Returns [`RpcError::HandlerConflict`] if one is already subscribed;
    /// the existing handler is left untouched.
    pub(crate) fn on_with_result<A, R, F, Fut>(
        &self,
        target: &str,
        callback: F,
    ) -> Result<HandlerSubscription>
    where
        A: FromArguments + Send + 'static,
        R: Serialize + Send + 'static,
        F: Fn(A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R>> + Send + 'static,
    {
        // ---
        validate_target(target)?;

        let admission = self.registry.admit(target)?;
        let (route_id, mut rx) = lock_ignore_poison(&self.table).insert(target, true);
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let connection = self.connection.clone();

        let task = tokio::spawn(async move {
            // ---
            loop {
                let invocation = tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    next = rx.recv() => match next {
                        Some(invocation) => invocation,
                        None => break,
                    },
                };

                let invocation_id = invocation.invocation_id().cloned();
                tokio::select! {
                    biased;
                    _ = token.cancelled() => {
                        if let Some(invocation_id) = invocation_id {
                            reporter::report_missing_handler(&connection, invocation_id).await;
                        }
                        break;
                    }
                    _ = reporter::handle_invocation(&connection, invocation, &callback) => {}
                }
            }

            // Answer whatever was routed here before the subscription ended.
            rx.close();
            while let Ok(invocation) = rx.try_recv() {
                if let Some(invocation_id) = invocation.invocation_id().cloned() {
                    reporter::report_missing_handler(&connection, invocation_id).await;
                }
            }
        });

        log_debug!("subscribed result handler for '{target}'");

        Ok(HandlerSubscription {
            target: target.to_string(),
            lease: SubscriptionLease {
                table: Arc::downgrade(&self.table),
                route_id,
                admission: Some((self.registry.clone(), admission)),
            },
            cancel,
            task: Some(task),
        })
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.router.abort();
    }
}

pub(crate) fn validate_target(target: &str) -> Result<()> {
    // ---
    if target.is_empty() {
        return Err(RpcError::InvalidTarget);
    }
    Ok(())
}

async fn run_router(
    mut invocations: InvocationReceiver,
    table: Weak<Mutex<DispatchTable>>,
    connection: ConnectionPtr,
) {
    // ---
    while let Some(invocation) = invocations.recv().await {
        let Some(table) = table.upgrade() else {
            break;
        };
        route(&table, &connection, invocation);
    }
    log_debug!("invocation router for {} stopped", connection.connection_id());
}

fn route(table: &Mutex<DispatchTable>, connection: &ConnectionPtr, invocation: Invocation) {
    // ---
    let mut answered = false;
    let mut delivered = 0usize;

    {
        let mut table = lock_ignore_poison(table);
        table.routes.retain(|route| {
            if route.target != invocation.target() {
                return true;
            }
            match route.tx.send(invocation.clone()) {
                Ok(()) => {
                    delivered += 1;
                    answered |= route.expects_result;
                    true
                }
                // Subscription task is gone.
                Err(_) => false,
            }
        });
    }

    log_trace!("routed '{}' to {delivered} handler(s)", invocation.target());

    if answered {
        return;
    }

    if let Some(invocation_id) = invocation.invocation_id().cloned() {
        log_debug!(
            "no result handler for '{}', answering {invocation_id} with an error",
            invocation.target()
        );
        let connection = connection.clone();
        tokio::spawn(async move {
            reporter::report_missing_handler(&connection, invocation_id).await;
        });
    } else if delivered == 0 {
        log_debug!("no handler for '{}', dropping invocation", invocation.target());
    }
}

/// Owned claim on a route and, for result handlers, a registry slot.
///
/// Releasing is idempotent: the route is removed first so no new invocation
/// is queued, then the registry slot is freed.
struct SubscriptionLease {
    // ---
    table: Weak<Mutex<DispatchTable>>,
    route_id: u64,
    admission: Option<(Arc<ResultHandlerRegistry>, Admission)>,
}

impl SubscriptionLease {
    fn release(&self) {
        // ---
        if let Some(table) = self.table.upgrade() {
            lock_ignore_poison(&table).remove(self.route_id);
        }
        if let Some((registry, admission)) = &self.admission {
            registry.release(admission);
        }
    }
}

/// Handle to an active handler subscription.
///
/// Dropping the handle unsubscribes. Invocations already queued for a result
/// handler are answered with an error completion rather than left pending.
pub struct HandlerSubscription {
    // ---
    target: String,
    lease: SubscriptionLease,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl HandlerSubscription {
    /// Target this subscription listens on.
    pub fn target(&self) -> &str {
        &self.target
    }

    /// Whether this subscription holds the target's result-handler slot.
    pub fn is_result_handler(&self) -> bool {
        self.lease.admission.is_some()
    }

    /// Unsubscribe and wait until the handler task has finished.
    ///
    /// Once this returns the callback will not run again and, for a result
    /// handler, the target's slot is free for a new registration.
    pub async fn unsubscribe(mut self) {
        // ---
        self.lease.release();
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
        log_debug!("unsubscribed handler for '{}'", self.target);
    }
}

impl std::fmt::Debug for HandlerSubscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerSubscription")
            .field("target", &self.target)
            .field("result_handler", &self.is_result_handler())
            .finish()
    }
}

impl Drop for HandlerSubscription {
    fn drop(&mut self) {
        // ---
        self.lease.release();
        self.cancel.cancel();
    }
}
