use std::fmt::Debug;

use async_trait::async_trait;

/// Resolves hostnames presented in HELO/EHLO.
///
/// A host that fails to resolve is refused service before any mail
/// transaction can begin.
#[async_trait]
pub trait HostResolver: Debug + Send + Sync {
    /// Whether the hostname resolves to at least one address.
    async fn resolves(&self, host: &str) -> bool;
}

/// Accepts every hostname without looking it up.
#[derive(Debug, Default, Clone, Copy)]
pub struct TrustingResolver;

#[async_trait]
impl HostResolver for TrustingResolver {
    async fn resolves(&self, _host: &str) -> bool {
        true
    }
}

/// Validates mailbox addresses for RCPT TO and VRFY.
#[async_trait]
pub trait AddressValidator: Debug + Send + Sync {
    /// Whether mail for this mailbox should be accepted.
    async fn validate(&self, mailbox: &str) -> bool;
}

/// Accepts every mailbox.
#[derive(Debug, Default, Clone, Copy)]
pub struct AcceptAllValidator;

#[async_trait]
impl AddressValidator for AcceptAllValidator {
    async fn validate(&self, _mailbox: &str) -> bool {
        true
    }
}
