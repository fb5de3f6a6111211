pub mod client;
pub mod command;
pub mod connection;
pub mod error;
pub mod extensions;
pub mod listener;
pub mod session;
pub mod state;
pub mod traits;

use serde::Deserialize;

pub use command::{Command, MailParameters};
pub use state::State;

/// Server-side timeouts, per RFC 5321 section 4.5.3.2.
#[derive(Clone, Copy, Debug, Deserialize)]
pub struct SmtpServerTimeouts {
    /// Timeout waiting for the next command.
    #[serde(default = "default_command_secs")]
    pub command_secs: u64,
    /// Timeout waiting for the next block of message data.
    #[serde(default = "default_data_block_secs")]
    pub data_block_secs: u64,
    /// Maximum lifetime of a single connection.
    #[serde(default = "default_connection_secs")]
    pub connection_secs: u64,
}

const fn default_command_secs() -> u64 {
    300
}

const fn default_data_block_secs() -> u64 {
    180
}

const fn default_connection_secs() -> u64 {
    3600
}

impl Default for SmtpServerTimeouts {
    fn default() -> Self {
        Self {
            command_secs: default_command_secs(),
            data_block_secs: default_data_block_secs(),
            connection_secs: default_connection_secs(),
        }
    }
}
