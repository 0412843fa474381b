use std::time::Duration;

/// Configuration for a [`Transport`](crate::Transport).
///
/// All fields have sensible defaults. Use the builder pattern:
///
/// ```rust
/// use std::time::Duration;
/// use quorum_transport::TransportConfig;
///
/// let config = TransportConfig::new()
///     .handshake_timeout(Duration::from_secs(2))
///     .max_frame_len(16 * 1024);
/// ```
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Deadline for the key exchange on a fresh stream.
    pub(crate) handshake_timeout: Duration,
    /// Deadline for the TCP dial in [`Transport::attach`](crate::Transport::attach).
    pub(crate) connect_timeout: Duration,
    /// Largest frame accepted or produced, prefix excluded. Never above `u16::MAX`.
    pub(crate) max_frame_len: usize,
    /// Channel buffer between a link's reader task and the dispatcher.
    pub(crate) inbound_buffer: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl TransportConfig {
    /// Create a new config with defaults.
    ///
    /// If `QUORUM_HANDSHAKE_TIMEOUT_MS` is set to a number, it replaces the
    /// default handshake timeout. This can be overridden with
    /// [`.handshake_timeout()`](Self::handshake_timeout).
    pub fn new() -> Self {
        let handshake_timeout = std::env::var("QUORUM_HANDSHAKE_TIMEOUT_MS")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .map(Duration::from_millis)
            .unwrap_or(Duration::from_secs(5));

        Self {
            handshake_timeout,
            connect_timeout: Duration::from_secs(10),
            max_frame_len: u16::MAX as usize,
            inbound_buffer: 256,
        }
    }

    /// Set the handshake deadline (default: 5 s).
    pub fn handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    /// Set the TCP connect deadline (default: 10 s).
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set the maximum frame size (default and ceiling: 65 535 bytes).
    pub fn max_frame_len(mut self, bytes: usize) -> Self {
        self.max_frame_len = bytes.min(u16::MAX as usize);
        self
    }

    /// Set the per-link inbound buffer (default: 256 frames).
    pub fn inbound_buffer(mut self, capacity: usize) -> Self {
        self.inbound_buffer = capacity;
        self
    }

    /// Largest plaintext that fits in one frame under this config.
    pub fn max_payload_len(&self) -> usize {
        self.max_frame_len.saturating_sub(crate::FRAME_OVERHEAD)
    }

    /// Reject values the transport cannot run with.
    pub fn validate(&self) -> Result<(), crate::QuorumTransportError> {
        if self.max_frame_len <= crate::FRAME_OVERHEAD {
            return Err(crate::QuorumTransportError::Config(format!(
                "max_frame_len must exceed the {}-byte frame overhead",
                crate::FRAME_OVERHEAD
            )));
        }
        if self.inbound_buffer == 0 {
            return Err(crate::QuorumTransportError::Config(
                "inbound_buffer must be at least 1".into(),
            ));
        }
        Ok(())
    }
}
