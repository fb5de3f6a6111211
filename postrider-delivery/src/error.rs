//! Typed errors for the delivery path.
//!
//! Failures are classified so the caller can decide what to do next:
//! permanent failures (5xx) must not be retried, temporary failures (4xx,
//! transport) may be retried by an external scheduler, and system errors
//! indicate internal problems.

use postrider_smtp::client::ClientError;
use thiserror::Error;

use crate::dns::DnsError;

/// Top-level delivery error type.
#[derive(Debug, Error)]
pub enum DeliveryError {
    /// Permanent failure that should not be retried (5xx SMTP codes).
    #[error("Permanent failure: {0}")]
    Permanent(#[from] PermanentError),

    /// Temporary failure that can be retried (4xx SMTP codes, transport).
    #[error("Temporary failure: {0}")]
    Temporary(#[from] TemporaryError),

    /// Internal error.
    #[error("System error: {0}")]
    System(#[from] SystemError),
}

/// Permanent errors that should not be retried.
#[derive(Debug, Error)]
pub enum PermanentError {
    /// Recipient address was rejected by the server.
    #[error("Invalid recipient: {0}")]
    InvalidRecipient(String),

    /// Domain does not exist.
    #[error("Domain not found: {0}")]
    DomainNotFound(String),

    /// Message was rejected by the server.
    #[error("Message rejected: {0}")]
    MessageRejected(String),

    /// No mail servers found for the domain (no MX, A, or AAAA records).
    #[error("No mail servers available for domain: {0}")]
    NoMailServers(String),

    /// Message size exceeds the limit the server advertised.
    #[error("Message too large: {0}")]
    MessageTooLarge(String),

    /// TLS is required by policy but could not be negotiated.
    #[error("TLS required: {0}")]
    TlsRequired(String),

    /// The server violated the protocol in a way that makes the session
    /// untrustworthy, e.g. re-advertising STARTTLS inside TLS (RFC 3207).
    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),
}

/// Temporary errors worth retrying later.
#[derive(Debug, Error)]
pub enum TemporaryError {
    /// Failed to establish a connection to the mail server.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Server rejected the connection or is temporarily unavailable.
    #[error("Server busy: {0}")]
    ServerBusy(String),

    /// DNS lookup failed (transient network issue).
    #[error("DNS lookup failed: {0}")]
    DnsLookupFailed(String),

    /// A protocol step exceeded its deadline.
    #[error("Timed out: {0}")]
    Timeout(String),

    /// Server returned a 4xx failure code.
    #[error("Temporary SMTP error: {0}")]
    SmtpTemporary(String),

    /// TLS handshake failed.
    #[error("TLS handshake failed: {0}")]
    TlsHandshakeFailed(String),
}

/// Internal errors that indicate a bug or bad input, not a peer problem.
#[derive(Debug, Error)]
pub enum SystemError {
    /// The message handed to the engine is unusable (no recipients, etc.).
    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    /// Invalid configuration.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Other internal errors.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl DeliveryError {
    /// Returns `true` if this error is temporary and should be retried.
    #[must_use]
    pub const fn is_temporary(&self) -> bool {
        matches!(self, Self::Temporary(_))
    }

    /// Returns `true` if this error is permanent and should not be retried.
    #[must_use]
    pub const fn is_permanent(&self) -> bool {
        matches!(self, Self::Permanent(_))
    }

    /// Returns `true` if this is a system error.
    #[must_use]
    pub const fn is_system(&self) -> bool {
        matches!(self, Self::System(_))
    }
}

impl From<DnsError> for DeliveryError {
    fn from(error: DnsError) -> Self {
        match error {
            DnsError::NoMailServers(domain) => {
                Self::Permanent(PermanentError::NoMailServers(domain))
            }
            DnsError::DomainNotFound(domain) => {
                Self::Permanent(PermanentError::DomainNotFound(domain))
            }
            DnsError::Timeout(msg) => Self::Temporary(TemporaryError::Timeout(msg)),
            DnsError::LookupFailed(err) => {
                Self::Temporary(TemporaryError::DnsLookupFailed(err.to_string()))
            }
        }
    }
}

/// Classifies client errors by SMTP response code range: 4xx is temporary,
/// 5xx is permanent, transport failures are temporary, parse failures are
/// internal.
impl From<ClientError> for DeliveryError {
    fn from(error: ClientError) -> Self {
        match error {
            ClientError::SmtpError { code, message } if (400..500).contains(&code) => {
                Self::Temporary(TemporaryError::SmtpTemporary(format!("{code} {message}")))
            }

            ClientError::SmtpError { code, message } if (500..600).contains(&code) => {
                Self::Permanent(PermanentError::MessageRejected(format!("{code} {message}")))
            }

            ClientError::SmtpError { code, message } => Self::System(SystemError::Internal(
                format!("Unexpected SMTP response: {code} {message}"),
            )),

            ClientError::Io(e) => {
                Self::Temporary(TemporaryError::ConnectionFailed(format!("I/O error: {e}")))
            }

            ClientError::ConnectionClosed => Self::Temporary(TemporaryError::ConnectionFailed(
                "Connection closed unexpectedly".to_string(),
            )),

            ClientError::TlsError(msg) => Self::Temporary(TemporaryError::TlsHandshakeFailed(msg)),

            ClientError::ParseError(msg) => Self::System(SystemError::Internal(format!(
                "SMTP protocol parse error: {msg}"
            ))),

            ClientError::Utf8Error(e) => {
                Self::System(SystemError::Internal(format!("UTF-8 decoding error: {e}")))
            }
        }
    }
}
