//! The outbound SMTP transaction engine.
//!
//! Drives one delivery over an established connection: greeting, EHLO and
//! capability parsing, STARTTLS policy, XCLIENT/XFORWARD propagation, then
//! MAIL FROM, RCPT TO, DATA and the message body. Every protocol step runs
//! under its own deadline. Unexpected response codes abort the transaction
//! with the full server message attached.

use std::{future::Future, time::Duration};

use postrider_smtp::client::{Response, ServerCapabilities, SmtpClient};
use tracing::{debug, info, warn};

use crate::{
    SmtpTimeouts,
    error::{DeliveryError, PermanentError, TemporaryError},
    pool::PooledConnection,
};

/// Total EHLO rounds allowed per connection: the initial greeting, one after
/// STARTTLS, and one after an XCLIENT that reset the session. A server that
/// demands more is misbehaving.
const MAX_EHLO_ROUNDS: u8 = 3;

/// When to negotiate TLS on an outbound connection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TlsPolicy {
    /// Never send STARTTLS.
    Disabled,
    /// Upgrade when the server offers STARTTLS; deliver in plaintext when it
    /// does not or rejects the attempt (RFC 3207 section 4).
    #[default]
    Opportunistic,
    /// Fail the delivery if TLS cannot be negotiated.
    Required,
}

/// One outbound delivery attempt over one connection.
pub struct Transaction<'a> {
    helo_host: &'a str,
    tls: TlsPolicy,
    xclient: Option<&'a [(String, String)]>,
    xforward: Option<&'a [(String, String)]>,
    timeouts: &'a SmtpTimeouts,
}

impl<'a> Transaction<'a> {
    #[must_use]
    pub const fn new(helo_host: &'a str, tls: TlsPolicy, timeouts: &'a SmtpTimeouts) -> Self {
        Self {
            helo_host,
            tls,
            xclient: None,
            xforward: None,
            timeouts,
        }
    }

    /// Sets the XCLIENT attributes to forward, typically the upstream
    /// client's identity when relaying through a front end.
    #[must_use]
    pub const fn with_xclient(mut self, attrs: &'a [(String, String)]) -> Self {
        self.xclient = Some(attrs);
        self
    }

    /// Sets the XFORWARD attributes to forward.
    #[must_use]
    pub const fn with_xforward(mut self, attrs: &'a [(String, String)]) -> Self {
        self.xforward = Some(attrs);
        self
    }

    /// Runs the full transaction: handshake (skipped on a reused
    /// connection), size precheck, MAIL FROM, RCPT TO per recipient, DATA,
    /// and the body.
    ///
    /// Does not send QUIT; the caller decides whether the connection goes
    /// back to the pool or is torn down.
    ///
    /// # Errors
    ///
    /// Returns a classified `DeliveryError`; on any error the connection
    /// must be dropped, not reused.
    pub async fn run(
        &self,
        connection: &mut PooledConnection,
        sender: &str,
        recipients: &[String],
        body: &[u8],
    ) -> Result<(), DeliveryError> {
        if !connection.handshaked {
            self.handshake(connection).await?;
        }

        if !connection.capabilities.accepts_size(body.len()) {
            return Err(PermanentError::MessageTooLarge(format!(
                "message is {} bytes, server limit is {:?}",
                body.len(),
                connection.capabilities.size
            ))
            .into());
        }

        self.send_mail_from(connection, sender, body.len()).await?;
        self.send_rcpt_to(connection, recipients).await?;
        self.send_message_data(connection, body).await?;

        debug!(
            server = connection.client.server_domain(),
            recipients = recipients.len(),
            bytes = body.len(),
            "Delivery transaction complete"
        );

        Ok(())
    }

    /// Sends QUIT, best effort. A failure here does not undo the delivery.
    pub async fn quit(&self, connection: &mut PooledConnection) {
        let deadline = Duration::from_secs(self.timeouts.quit_secs);
        if let Err(e) = tokio::time::timeout(deadline, connection.client.quit()).await {
            warn!(
                server = connection.client.server_domain(),
                "QUIT after delivery did not complete: {e}"
            );
        }
    }

    /// Greeting, EHLO, STARTTLS policy, XCLIENT, XFORWARD.
    async fn handshake(&self, connection: &mut PooledConnection) -> Result<(), DeliveryError> {
        let mut rounds = 0u8;

        let greeting = self
            .step(
                self.timeouts.greeting_secs,
                "greeting",
                connection.client.read_greeting(),
            )
            .await?;

        if !greeting.is_success() {
            return Err(TemporaryError::ServerBusy(format!(
                "Server rejected connection: {}",
                greeting.message()
            ))
            .into());
        }

        connection.capabilities = self.ehlo(&mut connection.client, &mut rounds).await?;

        self.negotiate_tls(connection, &mut rounds).await?;
        self.send_xclient(connection, &mut rounds).await?;
        self.send_xforward(connection).await?;

        connection.handshaked = true;
        Ok(())
    }

    /// One EHLO round, bounded by `MAX_EHLO_ROUNDS` per connection.
    ///
    /// A server that rejects EHLO outright gets one HELO retry (RFC 5321
    /// section 2.2.1); such a session carries no extensions.
    async fn ehlo(
        &self,
        client: &mut SmtpClient,
        rounds: &mut u8,
    ) -> Result<ServerCapabilities, DeliveryError> {
        if *rounds >= MAX_EHLO_ROUNDS {
            return Err(PermanentError::ProtocolViolation(format!(
                "server demanded more than {MAX_EHLO_ROUNDS} EHLO rounds"
            ))
            .into());
        }
        *rounds += 1;

        let response = self
            .step(self.timeouts.ehlo_secs, "EHLO", client.ehlo(self.helo_host))
            .await?;

        if response.is_success() {
            return Ok(ServerCapabilities::from_ehlo(&response));
        }

        debug!(
            server = client.server_domain(),
            code = response.code,
            "EHLO rejected, retrying with HELO"
        );

        let fallback = self
            .step(self.timeouts.ehlo_secs, "HELO", client.helo(self.helo_host))
            .await?;

        if !fallback.is_success() {
            return Err(reject("HELO", &fallback));
        }

        Ok(ServerCapabilities::default())
    }

    /// Negotiates STARTTLS according to the configured policy.
    ///
    /// After a successful upgrade EHLO is re-run over the encrypted channel;
    /// a server that still advertises STARTTLS there violates RFC 3207 and
    /// the session is not trusted.
    async fn negotiate_tls(
        &self,
        connection: &mut PooledConnection,
        rounds: &mut u8,
    ) -> Result<(), DeliveryError> {
        if connection.client.is_tls() || self.tls == TlsPolicy::Disabled {
            return Ok(());
        }

        if !connection.capabilities.starttls {
            return match self.tls {
                TlsPolicy::Required => Err(PermanentError::TlsRequired(format!(
                    "{} does not offer STARTTLS",
                    connection.client.server_domain()
                ))
                .into()),
                _ => Ok(()),
            };
        }

        let deadline = Duration::from_secs(self.timeouts.starttls_secs);
        let upgraded = tokio::time::timeout(deadline, connection.client.starttls()).await;

        let response = match upgraded {
            Ok(Ok(response)) if response.is_success() => response,
            Ok(Ok(response)) => {
                // Server advertised STARTTLS but refused it
                if self.tls == TlsPolicy::Required {
                    return Err(PermanentError::TlsRequired(format!(
                        "Server rejected STARTTLS: {}",
                        response.message()
                    ))
                    .into());
                }
                info!(
                    server = connection.client.server_domain(),
                    response = %response.message(),
                    "STARTTLS rejected, continuing in plaintext"
                );
                return Ok(());
            }
            Ok(Err(e)) => {
                // Handshake failure leaves the stream unusable either way
                return if self.tls == TlsPolicy::Required {
                    Err(PermanentError::TlsRequired(format!("STARTTLS failed: {e}")).into())
                } else {
                    Err(TemporaryError::TlsHandshakeFailed(e.to_string()).into())
                };
            }
            Err(_) => {
                return Err(TemporaryError::Timeout(format!(
                    "STARTTLS timed out after {}s",
                    self.timeouts.starttls_secs
                ))
                .into());
            }
        };

        debug!(
            server = connection.client.server_domain(),
            response = %response.message(),
            "TLS negotiated, repeating EHLO over the encrypted channel"
        );

        connection.capabilities = self.ehlo(&mut connection.client, rounds).await?;

        if connection.capabilities.starttls {
            return Err(PermanentError::ProtocolViolation(
                "server re-advertised STARTTLS inside an encrypted session".to_string(),
            )
            .into());
        }

        Ok(())
    }

    /// Sends XCLIENT once per connection when the server supports it.
    /// A 220 means the server reset the session, so EHLO is re-run.
    async fn send_xclient(
        &self,
        connection: &mut PooledConnection,
        rounds: &mut u8,
    ) -> Result<(), DeliveryError> {
        let Some(attrs) = self.xclient else {
            return Ok(());
        };

        if connection.xclient_sent || !connection.capabilities.supports_xclient() {
            return Ok(());
        }

        let supported: Vec<(String, String)> = attrs
            .iter()
            .filter(|(name, _)| {
                connection
                    .capabilities
                    .xclient
                    .iter()
                    .any(|accepted| accepted.eq_ignore_ascii_case(name))
            })
            .cloned()
            .collect();

        if supported.is_empty() {
            return Ok(());
        }

        let response = self
            .step(
                self.timeouts.ehlo_secs,
                "XCLIENT",
                connection.client.xclient(&supported),
            )
            .await?;
        connection.xclient_sent = true;

        if response.code == 220 {
            connection.capabilities = self.ehlo(&mut connection.client, rounds).await?;
        } else if response.is_error() {
            return Err(reject("XCLIENT", &response));
        }

        Ok(())
    }

    async fn send_xforward(&self, connection: &mut PooledConnection) -> Result<(), DeliveryError> {
        let Some(attrs) = self.xforward else {
            return Ok(());
        };

        if !connection.capabilities.supports_xforward() {
            return Ok(());
        }

        let supported: Vec<(String, String)> = attrs
            .iter()
            .filter(|(name, _)| {
                connection
                    .capabilities
                    .xforward
                    .iter()
                    .any(|accepted| accepted.eq_ignore_ascii_case(name))
            })
            .cloned()
            .collect();

        if supported.is_empty() {
            return Ok(());
        }

        let responses = self
            .step(
                self.timeouts.ehlo_secs,
                "XFORWARD",
                connection.client.xforward(&supported),
            )
            .await?;

        if let Some(response) = responses.iter().find(|r| !r.is_success()) {
            return Err(reject("XFORWARD", response));
        }

        Ok(())
    }

    async fn send_mail_from(
        &self,
        connection: &mut PooledConnection,
        sender: &str,
        body_len: usize,
    ) -> Result<(), DeliveryError> {
        let size = connection.capabilities.size.map(|_| body_len);
        let response = self
            .step(
                self.timeouts.mail_from_secs,
                "MAIL FROM",
                connection.client.mail_from(sender, size),
            )
            .await?;

        if !response.is_success() {
            return Err(reject("MAIL FROM", &response));
        }

        Ok(())
    }

    async fn send_rcpt_to(
        &self,
        connection: &mut PooledConnection,
        recipients: &[String],
    ) -> Result<(), DeliveryError> {
        for recipient in recipients {
            let response = self
                .step(
                    self.timeouts.rcpt_to_secs,
                    "RCPT TO",
                    connection.client.rcpt_to(recipient),
                )
                .await?;

            if !response.is_success() {
                let message = format!(
                    "Server rejected RCPT TO {recipient}: {}",
                    response.message()
                );
                return if response.is_permanent_error() {
                    Err(PermanentError::InvalidRecipient(message).into())
                } else {
                    Err(TemporaryError::SmtpTemporary(message).into())
                };
            }
        }

        Ok(())
    }

    async fn send_message_data(
        &self,
        connection: &mut PooledConnection,
        body: &[u8],
    ) -> Result<(), DeliveryError> {
        let response = self
            .step(self.timeouts.data_secs, "DATA", connection.client.data())
            .await?;

        if !(300..400).contains(&response.code) {
            return Err(reject("DATA", &response));
        }

        let response = self
            .step(
                self.timeouts.data_secs,
                "message data",
                connection.client.send_data(body),
            )
            .await?;

        if !response.is_success() {
            return Err(reject("message data", &response));
        }

        Ok(())
    }

    /// Runs one protocol step under its deadline.
    async fn step<T>(
        &self,
        secs: u64,
        what: &str,
        operation: impl Future<Output = postrider_smtp::client::Result<T>>,
    ) -> Result<T, DeliveryError> {
        match tokio::time::timeout(Duration::from_secs(secs), operation).await {
            Ok(result) => result.map_err(DeliveryError::from),
            Err(_) => Err(TemporaryError::Timeout(format!("{what} timed out after {secs}s")).into()),
        }
    }
}

/// Maps an unexpected response to a classified error carrying the full
/// server message.
fn reject(what: &str, response: &Response) -> DeliveryError {
    let message = format!("Server rejected {what}: {}", response.message());
    if response.is_permanent_error() {
        PermanentError::MessageRejected(message).into()
    } else {
        TemporaryError::SmtpTemporary(message).into()
    }
}
