use std::time::Duration;

use quorum_transport::{QuorumTransportError, TransportConfig};

/// Configuration for a [`MeshNode`](crate::MeshNode).
///
/// ```rust
/// use std::time::Duration;
/// use quorum_protocol::MeshConfig;
///
/// let config = MeshConfig::new()
///     .required_connections(3)
///     .admission_timeout(Duration::from_secs(5));
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone)]
pub struct MeshConfig {
    /// Distinct connectors that must prove a direct link to a newbie.
    pub(crate) required_connections: usize,
    /// Concurrent onboarding exchanges this node will take part in.
    pub(crate) admission_slots: usize,
    /// Lifetime of every candidate record.
    pub(crate) admission_timeout: Duration,
    /// Connector proofs a gateway keeps per newbie.
    pub(crate) max_connectors: usize,
    /// Per-peer outbound queue capacity.
    pub(crate) outbound_queue: usize,
    pub(crate) replay_buckets: usize,
    pub(crate) replay_bucket_size: usize,
    /// Handler workers draining the inbox.
    pub(crate) workers: usize,
    pub(crate) inbox_capacity: usize,
    /// Start admitted instead of seeking a quorum.
    pub(crate) founder: bool,
    pub(crate) transport: TransportConfig,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl MeshConfig {
    /// Create a new config with defaults.
    ///
    /// If `QUORUM_REQUIRED_CONNECTIONS` is set to a number, it replaces the
    /// default quorum of 2. `max_connectors` follows it at twice the quorum.
    pub fn new() -> Self {
        let required_connections = std::env::var("QUORUM_REQUIRED_CONNECTIONS")
            .ok()
            .and_then(|s| s.parse::<usize>().ok())
            .unwrap_or(2);

        let workers = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);

        Self {
            required_connections,
            admission_slots: 8,
            admission_timeout: Duration::from_secs(10),
            max_connectors: required_connections.saturating_mul(2),
            outbound_queue: 256,
            replay_buckets: 10,
            replay_bucket_size: 5000,
            workers,
            inbox_capacity: 1024,
            founder: false,
            transport: TransportConfig::new(),
        }
    }

    /// Set the admission quorum (default: 2). Also resets `max_connectors`
    /// to twice the new quorum.
    pub fn required_connections(mut self, count: usize) -> Self {
        self.required_connections = count;
        self.max_connectors = count.saturating_mul(2);
        self
    }

    pub fn admission_slots(mut self, slots: usize) -> Self {
        self.admission_slots = slots;
        self
    }

    pub fn admission_timeout(mut self, timeout: Duration) -> Self {
        self.admission_timeout = timeout;
        self
    }

    pub fn max_connectors(mut self, count: usize) -> Self {
        self.max_connectors = count;
        self
    }

    pub fn outbound_queue(mut self, capacity: usize) -> Self {
        self.outbound_queue = capacity;
        self
    }

    /// Size the replay cache: `buckets × bucket_size` nonces.
    pub fn replay_cache(mut self, buckets: usize, bucket_size: usize) -> Self {
        self.replay_buckets = buckets;
        self.replay_bucket_size = bucket_size;
        self
    }

    pub fn workers(mut self, count: usize) -> Self {
        self.workers = count;
        self
    }

    pub fn inbox_capacity(mut self, capacity: usize) -> Self {
        self.inbox_capacity = capacity;
        self
    }

    /// Bootstrap node: admitted from the start.
    pub fn founder(mut self, founder: bool) -> Self {
        self.founder = founder;
        self
    }

    pub fn transport(mut self, transport: TransportConfig) -> Self {
        self.transport = transport;
        self
    }

    /// Reject values the mesh cannot run with.
    pub fn validate(&self) -> Result<(), QuorumTransportError> {
        let checks = [
            (self.required_connections, "required_connections"),
            (self.admission_slots, "admission_slots"),
            (self.outbound_queue, "outbound_queue"),
            (self.replay_buckets, "replay_buckets"),
            (self.replay_bucket_size, "replay_bucket_size"),
            (self.workers, "workers"),
            (self.inbox_capacity, "inbox_capacity"),
        ];
        for (value, name) in checks {
            if value == 0 {
                return Err(QuorumTransportError::Config(format!(
                    "{name} must be at least 1"
                )));
            }
        }
        if self.max_connectors < self.required_connections {
            return Err(QuorumTransportError::Config(format!(
                "max_connectors ({}) is below required_connections ({})",
                self.max_connectors, self.required_connections
            )));
        }
        self.transport.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = MeshConfig::new().required_connections(2);
        assert_eq!(config.max_connectors, 4);
        assert_eq!(config.admission_slots, 8);
        assert_eq!(config.admission_timeout, Duration::from_secs(10));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn zero_quorum_is_rejected() {
        let config = MeshConfig::new().required_connections(0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn zero_buckets_are_rejected() {
        assert!(MeshConfig::new().replay_cache(0, 10).validate().is_err());
        assert!(MeshConfig::new().replay_cache(10, 0).validate().is_err());
    }

    #[test]
    fn connector_cap_below_quorum_is_rejected() {
        let config = MeshConfig::new().required_connections(3).max_connectors(2);
        assert!(config.validate().is_err());
    }

    #[test]
    fn zero_queue_is_rejected() {
        assert!(MeshConfig::new().outbound_queue(0).validate().is_err());
    }
}
