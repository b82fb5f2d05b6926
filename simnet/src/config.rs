//! # Simulation Configuration
//!
//! | Setting | Field | Default | Effect |
//! |---------|-------|---------|--------|
//! | Per-write cap | `max_write_size` | [`USER_MAX_PAYLOAD`] | `write()` accepts at most this many bytes per call |
//! | Message limit | `max_message_size` | [`MAX_MESSAGE`] | dispatcher rejects larger sends with `MessageTooLong` |
//! | Network name | `network_name` | `"simnet"` | the `network()` string of every [`SimAddr`](crate::SimAddr) |
//!
//! ```rust
//! use simnet::SimNetConfig;
//!
//! let config = SimNetConfig::small_frames(16);
//! assert_eq!(config.max_write_size, 16);
//! assert!(config.validate().is_ok());
//! ```

use crate::error::{SimNetError, SimNetResult};

/// Maximum number of bytes accepted by a single `write()` call.
///
/// Larger payloads are not rejected: `write()` reports how many bytes it took
/// and the caller loops, exactly as with a kernel socket buffer.
pub const USER_MAX_PAYLOAD: usize = 1_200_000;

/// Maximum size of a single message accepted by the dispatcher.
///
/// Deliberately below common transport-layer record limits so that a client
/// speaking a different framing fails loudly instead of allocating garbage.
pub const MAX_MESSAGE: usize = 1_310_720 - 80;

/// Default `network()` string reported by simulated addresses.
pub const DEFAULT_NETWORK_NAME: &str = "simnet";

/// Configuration for a simulated network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimNetConfig {
    /// Maximum bytes accepted by one `write()` call.
    pub max_write_size: usize,
    /// Maximum message size enforced by the dispatcher.
    pub max_message_size: usize,
    /// Network name reported by every simulated address.
    pub network_name: String,
}

impl Default for SimNetConfig {
    fn default() -> Self {
        Self {
            max_write_size: USER_MAX_PAYLOAD,
            max_message_size: MAX_MESSAGE,
            network_name: DEFAULT_NETWORK_NAME.to_string(),
        }
    }
}

impl SimNetConfig {
    /// Configuration with a small per-write cap, so chunked writes can be
    /// exercised without megabyte buffers.
    pub fn small_frames(max_write_size: usize) -> Self {
        Self {
            max_write_size,
            ..Self::default()
        }
    }

    /// Override the network name.
    pub fn with_network_name(mut self, name: impl Into<String>) -> Self {
        self.network_name = name.into();
        self
    }

    /// Override the dispatcher's message size limit.
    pub fn with_max_message_size(mut self, max: usize) -> Self {
        self.max_message_size = max;
        self
    }

    /// Check that the limits are consistent.
    pub fn validate(&self) -> SimNetResult<()> {
        if self.max_write_size == 0 {
            return Err(SimNetError::InvalidConfig(
                "max_write_size must be non-zero".to_string(),
            ));
        }
        if self.max_write_size > self.max_message_size {
            return Err(SimNetError::InvalidConfig(format!(
                "max_write_size ({}) exceeds max_message_size ({})",
                self.max_write_size, self.max_message_size
            )));
        }
        if self.network_name.is_empty() {
            return Err(SimNetError::InvalidConfig(
                "network_name must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}
