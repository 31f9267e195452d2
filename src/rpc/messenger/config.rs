use std::time::Duration;

use bon::Builder;

use crate::rpc::context::UserCredentials;

/// Bytes of every response frame reserved for the header, error status and payload.
pub const SIDECAR_HEADROOM: usize = 64 * 1024;

/// Configuration for a [`Messenger`](super::Messenger).
#[derive(Debug, Clone, Builder)]
pub struct MessengerConfig {
    /// Largest frame accepted or produced, in bytes.
    #[builder(default = 8 * 1024 * 1024)]
    pub max_message_size: usize,

    /// Timeout for establishing outbound connections.
    #[builder(default = Duration::from_secs(15))]
    pub connect_timeout: Duration,

    /// Credentials presented on outbound connections.
    #[builder(default = UserCredentials::current())]
    pub credentials: UserCredentials,
}

impl MessengerConfig {
    /// Total sidecar bytes a single response may carry.
    pub fn sidecar_budget(&self) -> usize {
        self.max_message_size.saturating_sub(SIDECAR_HEADROOM)
    }
}

impl Default for MessengerConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}
