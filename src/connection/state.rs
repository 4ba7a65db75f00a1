/*!
 * Connection State
 */

use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle of the channel to the privileged helper
///
/// ```text
/// Disconnected --connect--> Connecting --handshake ok--> Connected
/// Connected --interrupted--> Invalidated --auto reconnect--> Connecting
/// any --shutdown--> Disconnected
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Invalidated,
}

impl ConnectionState {
    #[inline]
    pub fn is_connected(self) -> bool {
        matches!(self, Self::Connected)
    }

    /// States a caller-triggered `connect` may recover from
    #[inline]
    pub fn can_reconnect(self) -> bool {
        matches!(self, Self::Invalidated | Self::Disconnected)
    }
}

impl Default for ConnectionState {
    fn default() -> Self {
        Self::Disconnected
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Invalidated => "invalidated",
        };
        f.write_str(name)
    }
}
