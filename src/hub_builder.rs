//! Hub client builder.
//!
//! Fluent configuration of a [`HubClient`] over an existing connection.

use std::time::Duration;

use crate::{
    // ---
    ConnectionPtr,
    HubClient,
    HubConfig,
    Result,
    DEFAULT_INVOCATION_TIMEOUT,
};

/// Builder for [`HubClient`] instances.
///
/// Queue sizes belong to the connection and are fixed when it is created;
/// the builder only carries client-side settings.
///
/// # Examples
///
/// ```no_run
/// use hub_rpc::{HubClientBuilder, HubConfig, MemoryConnection};
/// use std::time::Duration;
///
/// # async fn example() -> hub_rpc::Result<()> {
/// let (connection, _peer) = MemoryConnection::with_peer(HubConfig::default());
///
/// let client = HubClientBuilder::new(connection)
///     .invocation_timeout(Duration::from_secs(5))
///     .build()?;
/// # Ok(())
/// # }
/// ```
pub struct HubClientBuilder {
    // ---
    connection: ConnectionPtr,

    // Invocation timeout (optional, default: 30s)
    invocation_timeout: Option<Duration>,
    wait_forever: bool,
}

impl HubClientBuilder {
    /// Create a new builder over `connection`.
    pub fn new(connection: ConnectionPtr) -> Self {
        // ---
        Self {
            connection,
            invocation_timeout: None,
            wait_forever: false,
        }
    }

    /// Set how long `invoke` waits for a completion.
    ///
    /// Default: 30s.
    pub fn invocation_timeout(mut self, timeout: Duration) -> Self {
        self.invocation_timeout = Some(timeout);
        self.wait_forever = false;
        self
    }

    /// Let `invoke` wait until the completion arrives or the connection
    /// closes.
    pub fn no_invocation_timeout(mut self) -> Self {
        self.invocation_timeout = None;
        self.wait_forever = true;
        self
    }

    /// Take client-side settings from `config`.
    pub fn config(self, config: &HubConfig) -> Self {
        // ---
        match config.invocation_timeout {
            Some(timeout) => self.invocation_timeout(timeout),
            None => self.no_invocation_timeout(),
        }
    }

    /// Build the client (consumes self).
    ///
    /// Takes the connection's inbound invocations and starts routing them,
    /// so it must run inside a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`RpcError::InvalidState`](crate::RpcError::InvalidState) if
    /// another client already owns the connection's invocations.
    pub fn build(self) -> Result<HubClient> {
        // ---
        let invocation_timeout = if self.wait_forever {
            None
        } else {
            Some(self.invocation_timeout.unwrap_or(DEFAULT_INVOCATION_TIMEOUT))
        };

        HubClient::new(self.connection, invocation_timeout)
    }
}
