//! Context configuration.

use std::time::Duration;

/// How a context runs provider handlers.
///
/// With [`DispatchPolicy::Serial`] every handler runs on the context's
/// dispatch task, in arrival order. A handler that performs a nested blocking
/// call through the same context then deadlocks: the reply it waits for can
/// only be delivered by the dispatch task it is occupying.
/// [`DispatchPolicy::Concurrent`] runs each handler on its own task, bounded
/// by `max_in_flight`, which makes nested calls safe. Initiations waiting for
/// a free slot never hold up the dispatch task, and a handler blocked on a
/// nested call gives its slot back until the reply arrives. Continuation
/// messages (acks, updates, replies, notifies) and PUBSUB stages are always
/// handled in order by the dispatch task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DispatchPolicy {
    /// Every handler runs on the dispatch task.
    #[default]
    Serial,
    /// Handlers run on their own tasks, at most `max_in_flight` at a time.
    Concurrent { max_in_flight: usize },
}

/// Settings of the `maltcp` transport.
#[derive(Debug, Clone)]
pub struct TcpConfig {
    /// Maximum time to establish an outbound connection.
    pub connect_timeout: Duration,
    /// Largest accepted frame, in bytes.
    pub max_frame_length: usize,
}

impl Default for TcpConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            max_frame_length: 16 * 1024 * 1024, // 16 MB
        }
    }
}

/// Top-level configuration of a [`Context`](crate::Context).
#[derive(Debug, Clone)]
pub struct ContextConfig {
    /// Capacity of the bounded channel between transports and the dispatch task.
    pub inbound_channel_capacity: usize,
    /// Handler execution policy.
    pub dispatch: DispatchPolicy,
    pub tcp: TcpConfig,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            inbound_channel_capacity: 1024,
            dispatch: DispatchPolicy::Serial,
            tcp: TcpConfig::default(),
        }
    }
}

impl ContextConfig {
    /// Default configuration with concurrent handler dispatch.
    #[must_use]
    pub fn concurrent(max_in_flight: usize) -> Self {
        Self {
            dispatch: DispatchPolicy::Concurrent { max_in_flight },
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn context_config_defaults() {
        let config = ContextConfig::default();
        assert_eq!(config.inbound_channel_capacity, 1024);
        assert_eq!(config.dispatch, DispatchPolicy::Serial);
        assert_eq!(config.tcp.connect_timeout, Duration::from_secs(5));
        assert_eq!(config.tcp.max_frame_length, 16 * 1024 * 1024);
    }

    #[test]
    fn concurrent_config_keeps_other_defaults() {
        let config = ContextConfig::concurrent(8);
        assert_eq!(config.dispatch, DispatchPolicy::Concurrent { max_in_flight: 8 });
        assert_eq!(config.inbound_channel_capacity, 1024);
    }
}
