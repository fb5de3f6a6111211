//! Outbound delivery: MX resolution, connection caching, and the SMTP
//! client transaction engine.

pub mod dns;
pub mod engine;
pub mod error;
pub mod pool;
pub mod transaction;

pub use dns::{DnsConfig, DnsError, DnsResolver, MailServer};
pub use engine::{DeliveryConfig, DeliveryEngine, DeliveryPolicy};
pub use error::{DeliveryError, PermanentError, SystemError, TemporaryError};
pub use pool::{ConnectionPool, PooledConnection};
pub use transaction::{TlsPolicy, Transaction};

use serde::Deserialize;

/// Per-step deadlines for outbound SMTP operations, in seconds.
#[derive(Debug, Clone, Deserialize)]
pub struct SmtpTimeouts {
    #[serde(default = "default_greeting_secs")]
    pub greeting_secs: u64,
    #[serde(default = "default_ehlo_secs")]
    pub ehlo_secs: u64,
    #[serde(default = "default_starttls_secs")]
    pub starttls_secs: u64,
    #[serde(default = "default_mail_from_secs")]
    pub mail_from_secs: u64,
    #[serde(default = "default_rcpt_to_secs")]
    pub rcpt_to_secs: u64,
    #[serde(default = "default_data_secs")]
    pub data_secs: u64,
    #[serde(default = "default_quit_secs")]
    pub quit_secs: u64,
}

const fn default_greeting_secs() -> u64 {
    30
}

const fn default_ehlo_secs() -> u64 {
    30
}

const fn default_starttls_secs() -> u64 {
    30
}

const fn default_mail_from_secs() -> u64 {
    30
}

const fn default_rcpt_to_secs() -> u64 {
    30
}

const fn default_data_secs() -> u64 {
    120
}

const fn default_quit_secs() -> u64 {
    10
}

impl Default for SmtpTimeouts {
    fn default() -> Self {
        Self {
            greeting_secs: default_greeting_secs(),
            ehlo_secs: default_ehlo_secs(),
            starttls_secs: default_starttls_secs(),
            mail_from_secs: default_mail_from_secs(),
            rcpt_to_secs: default_rcpt_to_secs(),
            data_secs: default_data_secs(),
            quit_secs: default_quit_secs(),
        }
    }
}
