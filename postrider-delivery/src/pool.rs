//! Outbound connection cache.
//!
//! Connections are keyed by `host:port` and private to one delivery engine
//! instance; nothing is shared across workers. A cached connection is probed
//! for liveness before reuse and carries the capabilities negotiated on it,
//! so the transaction engine can skip the greeting and EHLO steps.

use ahash::AHashMap;
use postrider_smtp::client::{ServerCapabilities, SmtpClient};
use tracing::debug;

use crate::error::{DeliveryError, TemporaryError};

/// A connection handed out by the pool, with its negotiation state.
pub struct PooledConnection {
    pub client: SmtpClient,
    /// Capabilities from the most recent EHLO on this connection.
    pub capabilities: ServerCapabilities,
    /// Whether greeting and EHLO have already been performed.
    pub handshaked: bool,
    /// Whether XCLIENT has been sent on this connection. A 220 to XCLIENT
    /// re-runs EHLO; the latch stops that from looping.
    pub xclient_sent: bool,
}

/// A cache of live outbound connections keyed by `host:port`.
pub struct ConnectionPool {
    connections: AHashMap<String, PooledConnection>,
    reuse: bool,
    accept_invalid_certs: bool,
}

impl ConnectionPool {
    #[must_use]
    pub fn new(reuse: bool, accept_invalid_certs: bool) -> Self {
        Self {
            connections: AHashMap::new(),
            reuse,
            accept_invalid_certs,
        }
    }

    /// Returns a connection to `host:port`, reusing a cached one when it is
    /// still alive, otherwise establishing a fresh connection.
    ///
    /// A reused connection comes back with `handshaked` set so the caller
    /// skips the greeting and EHLO steps.
    ///
    /// # Errors
    ///
    /// Returns a temporary error if a fresh connection cannot be established.
    pub async fn acquire(&mut self, host: &str, port: u16) -> Result<PooledConnection, DeliveryError> {
        let key = format!("{host}:{port}");

        if self.reuse
            && let Some(cached) = self.connections.remove(&key)
        {
            if cached.client.is_alive() {
                debug!("Reusing cached connection to {key}");
                return Ok(cached);
            }
            debug!("Cached connection to {key} is dead, reconnecting");
        }

        let client = SmtpClient::connect(&key, host.to_string())
            .await
            .map_err(|e| {
                TemporaryError::ConnectionFailed(format!("Failed to connect to {key}: {e}"))
            })?
            .accept_invalid_certs(self.accept_invalid_certs);

        Ok(PooledConnection {
            client,
            capabilities: ServerCapabilities::default(),
            handshaked: false,
            xclient_sent: false,
        })
    }

    /// Returns a connection to the cache after a cleanly completed
    /// transaction. Callers must not release a connection that is
    /// mid-transaction; a failed transaction drops its connection instead.
    pub fn release(&mut self, host: &str, port: u16, connection: PooledConnection) {
        if self.reuse {
            self.connections
                .insert(format!("{host}:{port}"), connection);
        }
    }

    /// Number of cached connections.
    #[must_use]
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}
