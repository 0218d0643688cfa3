//! Runtime configuration.

use std::time::Duration;

/// Configuration for a [`FlowNode`](crate::FlowNode).
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use flowspan::RuntimeConfig;
///
/// let config = RuntimeConfig {
///     internal_error_retry_budget: 5,
///     shutdown_timeout: Duration::from_secs(10),
///     ..Default::default()
/// };
/// ```
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Application identifier stamped into session-initiating messages.
    pub app_name: String,

    /// Platform version stamped into session-initiating messages.
    pub platform_version: u32,

    /// How many times an internal failure is retried from the last committed
    /// checkpoint before the flow is hospitalised.
    ///
    /// Default: 3.
    pub internal_error_retry_budget: u32,

    /// Transitions kept per flow in the history interceptor's ring.
    ///
    /// Default: 32.
    pub history_capacity: usize,

    /// Maximum time to wait for fibers to drain during shutdown.
    ///
    /// After this timeout the node stops without waiting further; flows
    /// resume from their last committed checkpoints on the next start.
    /// Default: 30 seconds.
    pub shutdown_timeout: Duration,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            app_name: "flowspan".into(),
            platform_version: 1,
            internal_error_retry_budget: 3,
            history_capacity: 32,
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = RuntimeConfig::default();

        assert_eq!(config.app_name, "flowspan");
        assert_eq!(config.platform_version, 1);
        assert_eq!(config.internal_error_retry_budget, 3);
        assert_eq!(config.history_capacity, 32);
        assert_eq!(config.shutdown_timeout, Duration::from_secs(30));
    }
}
