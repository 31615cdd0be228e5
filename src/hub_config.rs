//! Public, transport-agnostic hub configuration.
//!
//! Nothing here describes a socket or a codec. Connection implementations
//! read the writer capacity; the client reads the invocation timeout.

use std::time::Duration;

/// Default time to wait for an invocation's completion.
pub const DEFAULT_INVOCATION_TIMEOUT: Duration = Duration::from_secs(30);

/// Default capacity of the single ordered frame writer.
pub const DEFAULT_WRITER_CAPACITY: usize = 64;

/// Hub client and connection configuration.
///
/// # Example
///
/// ```
/// use hub_rpc::HubConfig;
/// use std::time::Duration;
///
/// let config = HubConfig::default()
///     .with_invocation_timeout(Duration::from_secs(5))
///     .with_writer_capacity(8);
/// assert_eq!(config.writer_capacity, 8);
/// ```
#[derive(Debug, Clone)]
pub struct HubConfig {
    // ---
    /// How long `invoke` waits for its completion.
    ///
    /// `None` waits until the completion arrives or the connection closes.
    /// Streams are never timed out.
    ///
    /// Default: 30 seconds
    pub invocation_timeout: Option<Duration>,

    /// Number of frames the writer queue holds before writers suspend.
    ///
    /// Default: 64
    pub writer_capacity: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            invocation_timeout: Some(DEFAULT_INVOCATION_TIMEOUT),
            writer_capacity: DEFAULT_WRITER_CAPACITY,
        }
    }
}

impl HubConfig {
    /// Set the invocation timeout.
    pub fn with_invocation_timeout(mut self, timeout: Duration) -> Self {
        self.invocation_timeout = Some(timeout);
        self
    }

    /// Wait for completions without a deadline.
    pub fn without_invocation_timeout(mut self) -> Self {
        self.invocation_timeout = None;
        self
    }

    /// Set the writer queue capacity (minimum 1).
    pub fn with_writer_capacity(mut self, capacity: usize) -> Self {
        self.writer_capacity = capacity.max(1);
        self
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    #[test]
    fn test_defaults() {
        // ---
        let config = HubConfig::default();
        assert_eq!(config.invocation_timeout, Some(Duration::from_secs(30)));
        assert_eq!(config.writer_capacity, 64);
    }

    #[test]
    fn test_zero_sizes_are_clamped() {
        // ---
        let config = HubConfig::default()
            .with_writer_capacity(0)
            .without_invocation_timeout();
        assert_eq!(config.writer_capacity, 1);
        assert!(config.invocation_timeout.is_none());
    }
}
