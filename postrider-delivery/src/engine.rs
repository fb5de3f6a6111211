//! The delivery engine: resolves destinations and drives transactions.
//!
//! One engine instance owns one connection cache; engines are process-local
//! and never shared across workers.

use std::sync::Arc;

use ahash::AHashMap;
use mailparse::{MailAddr, MailAddrList};
use serde::Deserialize;
use tracing::{info, warn};

use crate::{
    SmtpTimeouts,
    dns::{DnsResolver, MailServer},
    error::{DeliveryError, PermanentError, SystemError, TemporaryError},
    pool::ConnectionPool,
    transaction::{TlsPolicy, Transaction},
};
use postrider_common::envelope::Envelope;

/// How recipients of one destination are mapped onto SMTP transactions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DeliveryPolicy {
    /// One MAIL FROM/DATA transaction serves every recipient that resolved
    /// to the same destination.
    #[default]
    Grouped,
    /// A full transaction per recipient.
    PerRecipient,
}

/// Configuration for the delivery engine.
#[derive(Debug, Clone, Deserialize)]
pub struct DeliveryConfig {
    /// Hostname announced in EHLO.
    #[serde(default = "default_helo_host")]
    pub helo_host: String,

    #[serde(default)]
    pub policy: DeliveryPolicy,

    #[serde(default)]
    pub tls: TlsPolicy,

    /// Accept invalid TLS certificates. Testing only.
    #[serde(default)]
    pub accept_invalid_certs: bool,

    /// Fixed relay host (`host` or `host:port`) overriding MX resolution.
    #[serde(default)]
    pub relay_host: Option<String>,

    /// Reuse connections across transactions to the same destination.
    #[serde(default = "default_reuse_connections")]
    pub reuse_connections: bool,

    #[serde(default)]
    pub timeouts: SmtpTimeouts,
}

fn default_helo_host() -> String {
    "localhost".to_string()
}

const fn default_reuse_connections() -> bool {
    true
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            helo_host: default_helo_host(),
            policy: DeliveryPolicy::default(),
            tls: TlsPolicy::default(),
            accept_invalid_certs: false,
            relay_host: None,
            reuse_connections: default_reuse_connections(),
            timeouts: SmtpTimeouts::default(),
        }
    }
}

/// Relays messages to their recipient mail exchangers or a fixed relay host.
pub struct DeliveryEngine {
    config: DeliveryConfig,
    resolver: Arc<DnsResolver>,
    pool: ConnectionPool,
}

impl DeliveryEngine {
    #[must_use]
    pub fn new(config: DeliveryConfig, resolver: Arc<DnsResolver>) -> Self {
        // Grouped recipients ride one connection per destination
        let reuse = config.reuse_connections || config.policy == DeliveryPolicy::Grouped;
        let pool = ConnectionPool::new(reuse, config.accept_invalid_certs);

        Self {
            config,
            resolver,
            pool,
        }
    }

    /// Delivers one message to every recipient in its envelope, grouping
    /// recipients by destination domain.
    ///
    /// # Errors
    ///
    /// Returns the first classified failure. Retry and bounce handling
    /// belong to the caller.
    pub async fn deliver(&mut self, envelope: &Envelope, body: &[u8]) -> Result<(), DeliveryError> {
        let sender = envelope.sender().map(smtp_address).unwrap_or_default();
        let recipients = envelope
            .recipients()
            .map(recipient_addresses)
            .unwrap_or_default();

        if recipients.is_empty() {
            return Err(SystemError::InvalidMessage("no recipients".to_string()).into());
        }

        // Upstream identity attributes, propagated when the next hop
        // advertises the corresponding extension
        let forwarded = ForwardedIdentity {
            xclient: map_to_attrs(&envelope.xclient),
            xforward: map_to_attrs(&envelope.xforward),
        };

        let mut by_domain: AHashMap<String, Vec<String>> = AHashMap::new();
        for recipient in recipients {
            let Some((_, domain)) = recipient.split_once('@') else {
                return Err(PermanentError::InvalidRecipient(format!(
                    "{recipient} has no domain part"
                ))
                .into());
            };
            by_domain
                .entry(domain.to_ascii_lowercase())
                .or_default()
                .push(recipient);
        }

        for (domain, recipients) in &by_domain {
            let servers = self.servers_for(domain).await?;
            self.deliver_with_policy(&sender, &servers, recipients, body, &forwarded)
                .await?;
            info!(
                domain,
                recipients = recipients.len(),
                bytes = body.len(),
                "Delivered"
            );
        }

        Ok(())
    }

    /// Delivers one message to an explicit destination list, bypassing MX
    /// resolution and the relay host. Servers are tried in the given order.
    ///
    /// # Errors
    ///
    /// Returns the first classified failure.
    pub async fn deliver_to(
        &mut self,
        servers: &[MailServer],
        envelope: &Envelope,
        body: &[u8],
    ) -> Result<(), DeliveryError> {
        let sender = envelope.sender().map(smtp_address).unwrap_or_default();
        let recipients = envelope
            .recipients()
            .map(recipient_addresses)
            .unwrap_or_default();

        if recipients.is_empty() {
            return Err(SystemError::InvalidMessage("no recipients".to_string()).into());
        }

        let forwarded = ForwardedIdentity {
            xclient: map_to_attrs(&envelope.xclient),
            xforward: map_to_attrs(&envelope.xforward),
        };

        self.deliver_with_policy(&sender, servers, &recipients, body, &forwarded)
            .await
    }

    async fn deliver_with_policy(
        &mut self,
        sender: &str,
        servers: &[MailServer],
        recipients: &[String],
        body: &[u8],
        forwarded: &ForwardedIdentity,
    ) -> Result<(), DeliveryError> {
        match self.config.policy {
            DeliveryPolicy::Grouped => {
                self.attempt_servers(sender, servers, recipients, body, forwarded)
                    .await
            }
            DeliveryPolicy::PerRecipient => {
                for recipient in recipients {
                    self.attempt_servers(
                        sender,
                        servers,
                        std::slice::from_ref(recipient),
                        body,
                        forwarded,
                    )
                    .await?;
                }
                Ok(())
            }
        }
    }

    /// The destination list for a domain: the configured relay host if any,
    /// otherwise MX records in ascending preference order.
    async fn servers_for(&self, domain: &str) -> Result<Vec<MailServer>, DeliveryError> {
        if let Some(relay) = &self.config.relay_host {
            let (host, port) = match relay.split_once(':') {
                Some((host, port)) => (
                    host,
                    port.parse().map_err(|_| {
                        SystemError::Configuration(format!("Invalid relay host port: {relay}"))
                    })?,
                ),
                None => (relay.as_str(), 25),
            };
            return Ok(vec![MailServer::new(host.to_string(), 0, port)]);
        }

        Ok(self.resolver.mail_servers(domain).await?.as_ref().clone())
    }

    /// Tries each destination in order. Connect failures fall through to the
    /// next server; once a transaction has started, its outcome is final.
    async fn attempt_servers(
        &mut self,
        sender: &str,
        servers: &[MailServer],
        recipients: &[String],
        body: &[u8],
        forwarded: &ForwardedIdentity,
    ) -> Result<(), DeliveryError> {
        let mut transaction =
            Transaction::new(&self.config.helo_host, self.config.tls, &self.config.timeouts);
        if !forwarded.xclient.is_empty() {
            transaction = transaction.with_xclient(&forwarded.xclient);
        }
        if !forwarded.xforward.is_empty() {
            transaction = transaction.with_xforward(&forwarded.xforward);
        }

        let mut last_error = None;

        for server in servers {
            let mut connection = match self.pool.acquire(&server.host, server.port).await {
                Ok(connection) => connection,
                Err(err) => {
                    warn!("Connect to {} failed: {err}", server.address());
                    last_error = Some(err);
                    continue;
                }
            };

            return match transaction.run(&mut connection, sender, recipients, body).await {
                Ok(()) => {
                    if self.config.reuse_connections {
                        self.pool.release(&server.host, server.port, connection);
                    } else {
                        transaction.quit(&mut connection).await;
                    }
                    Ok(())
                }
                // Drop the connection; it may be mid-transaction
                Err(err) => Err(err),
            };
        }

        Err(last_error.unwrap_or_else(|| {
            TemporaryError::ConnectionFailed("No mail servers to try".to_string()).into()
        }))
    }
}

/// Upstream client identity carried over from the inbound session.
struct ForwardedIdentity {
    xclient: Vec<(String, String)>,
    xforward: Vec<(String, String)>,
}

fn map_to_attrs(map: &ahash::AHashMap<String, String>) -> Vec<(String, String)> {
    let mut attrs: Vec<(String, String)> = map
        .iter()
        .map(|(name, value)| (name.clone(), value.clone()))
        .collect();
    attrs.sort();
    attrs
}

/// The bare `local@domain` form used on the wire, without display names.
fn smtp_address(address: &MailAddr) -> String {
    match address {
        MailAddr::Single(info) => info.addr.clone(),
        MailAddr::Group(group) => group
            .addrs
            .first()
            .map(|info| info.addr.clone())
            .unwrap_or_default(),
    }
}

fn recipient_addresses(list: &MailAddrList) -> Vec<String> {
    list.iter()
        .flat_map(|address| match address {
            MailAddr::Single(info) => vec![info.addr.clone()],
            MailAddr::Group(group) => group.addrs.iter().map(|info| info.addr.clone()).collect(),
        })
        .collect()
}
