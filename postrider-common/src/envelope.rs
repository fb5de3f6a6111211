use std::net::SocketAddr;

use ahash::AHashMap;
use chrono::{DateTime, Utc};
use mailparse::{MailAddr, MailAddrList};

/// Out-of-band transaction metadata for one message.
///
/// Built up over the lifetime of an inbound session and handed to the mail
/// queue once the message body is complete. The session retains no reference
/// to it afterwards.
#[derive(Default, Debug, Clone)]
pub struct Envelope {
    pub helo_host: Option<String>,
    pub client_addr: Option<SocketAddr>,
    pub connect_time: Option<DateTime<Utc>>,
    pub helo_time: Option<DateTime<Utc>>,
    pub data_time: Option<DateTime<Utc>>,
    sender: Option<MailAddr>,
    /// Raw ESMTP parameter string given on MAIL FROM, if any.
    pub sender_options: Option<String>,
    recipients: Option<MailAddrList>,
    pub xforward: AHashMap<String, String>,
    pub xclient: AHashMap<String, String>,
    pub data_len: usize,
}

impl Envelope {
    /// Builds the envelope for a freshly accepted connection.
    #[must_use]
    pub fn connected(peer: SocketAddr) -> Self {
        Self {
            client_addr: Some(peer),
            connect_time: Some(Utc::now()),
            ..Self::default()
        }
    }

    /// Returns a reference to the [`Envelope`] sender for this message
    #[inline]
    #[must_use]
    pub const fn sender(&self) -> Option<&MailAddr> {
        self.sender.as_ref()
    }

    /// Returns a mutable reference to the [`Envelope`] sender for this message
    #[inline]
    pub const fn sender_mut(&mut self) -> &mut Option<MailAddr> {
        &mut self.sender
    }

    /// Returns a reference to the [`Envelope`] recipients for this message
    #[inline]
    #[must_use]
    pub const fn recipients(&self) -> Option<&MailAddrList> {
        self.recipients.as_ref()
    }

    /// Returns a mutable reference to the [`Envelope`] recipients for this message
    #[inline]
    pub const fn recipients_mut(&mut self) -> &mut Option<MailAddrList> {
        &mut self.recipients
    }

    #[must_use]
    pub fn recipient_count(&self) -> usize {
        self.recipients.as_ref().map_or(0, |rcpts| rcpts.len())
    }

    /// Clears per-message state after a completed transaction or RSET.
    ///
    /// The greeting context (helo host, client address, connect/helo times)
    /// survives; the session returns to the post-HELO state.
    pub fn reset_transaction(&mut self) {
        self.sender = None;
        self.sender_options = None;
        self.recipients = None;
        self.data_time = None;
        self.data_len = 0;
    }

    /// Clears everything negotiated before a TLS upgrade.
    ///
    /// Capabilities and identities exchanged in plaintext must not survive
    /// across the upgrade boundary; only the connection facts remain.
    pub fn reset_session(&mut self) {
        let client_addr = self.client_addr;
        let connect_time = self.connect_time;

        *self = Self {
            client_addr,
            connect_time,
            ..Self::default()
        };
    }
}

#[cfg(test)]
mod test {
    use super::Envelope;

    #[test]
    fn connected_records_the_peer() {
        let addr = "192.0.2.1:2525".parse().unwrap();
        let envelope = Envelope::connected(addr);

        assert_eq!(envelope.client_addr, Some(addr));
        assert!(envelope.connect_time.is_some());
        assert!(envelope.sender().is_none());
        assert!(envelope.recipients().is_none());
    }

    #[test]
    fn transaction_reset_preserves_greeting() {
        let mut envelope = Envelope {
            helo_host: Some("client.example.com".to_string()),
            ..Envelope::default()
        };
        envelope
            .sender_mut()
            .replace(mailparse::addrparse("a@x.com").unwrap().remove(0));
        envelope
            .recipients_mut()
            .replace(mailparse::addrparse("b@y.com").unwrap());
        envelope.data_len = 42;

        envelope.reset_transaction();

        assert_eq!(envelope.helo_host.as_deref(), Some("client.example.com"));
        assert!(envelope.sender().is_none());
        assert!(envelope.recipients().is_none());
        assert_eq!(envelope.data_len, 0);
    }

    #[test]
    fn session_reset_discards_identity() {
        let addr = "192.0.2.1:2525".parse().unwrap();
        let mut envelope = Envelope {
            helo_host: Some("client.example.com".to_string()),
            client_addr: Some(addr),
            ..Envelope::default()
        };
        envelope
            .xforward
            .insert("ADDR".to_string(), "192.0.2.7".to_string());

        envelope.reset_session();

        assert!(envelope.helo_host.is_none());
        assert!(envelope.xforward.is_empty());
        assert_eq!(envelope.client_addr, Some(addr));
    }
}
