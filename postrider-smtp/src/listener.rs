use std::net::SocketAddr;

use futures_util::future::join_all;
use postrider_common::{Signal, error::ListenerError, internal, tracing};
use tokio::net::TcpListener;

use crate::session::{Session, SessionConfig};

/// Accepts inbound connections and runs one [`Session`] per peer.
pub struct Listener {
    socket: SocketAddr,
    session_config: SessionConfig,
}

impl Listener {
    #[must_use]
    pub const fn new(socket: SocketAddr, session_config: SessionConfig) -> Self {
        Self {
            socket,
            session_config,
        }
    }

    /// Serve until a shutdown signal arrives, then wait for the remaining
    /// sessions to finish.
    ///
    /// # Errors
    /// Returns `ListenerError` if binding or accepting fails, or if the TLS
    /// material named in the configuration is missing.
    pub async fn serve(
        &self,
        mut shutdown: tokio::sync::broadcast::Receiver<Signal>,
    ) -> Result<(), ListenerError> {
        internal!("Serving SMTP on {}", self.socket);

        self.check_tls_material()?;

        let listener =
            TcpListener::bind(self.socket)
                .await
                .map_err(|source| ListenerError::BindFailed {
                    address: self.socket.to_string(),
                    source,
                })?;

        let mut sessions = Vec::default();

        loop {
            tokio::select! {
                sig = shutdown.recv() => {
                    if matches!(sig, Ok(Signal::Shutdown)) {
                        internal!(
                            level = INFO,
                            "SMTP listener {} received shutdown signal, finishing sessions ...",
                            self.socket
                        );
                        join_all(sessions).await;
                        break;
                    }
                }

                connection = listener.accept() => {
                    let (stream, peer) = connection?;
                    tracing::debug!("Connection received on {} from {peer}", self.socket);

                    let session = Session::create(stream, peer, self.session_config.clone());
                    let signal = shutdown.resubscribe();

                    sessions.push(tokio::spawn(async move {
                        if let Err(err) = session.run(signal).await {
                            internal!(level = ERROR, "Error: {err}");
                        }
                    }));
                }
            }
        }

        Ok(())
    }

    /// Refuse to serve with a TLS configuration pointing at missing files;
    /// failing at STARTTLS time would be much harder to diagnose.
    fn check_tls_material(&self) -> Result<(), ListenerError> {
        let Some(tls) = self
            .session_config
            .extensions
            .iter()
            .find_map(|ext| match ext {
                crate::extensions::Extension::Starttls(context) => Some(context),
                _ => None,
            })
        else {
            return Ok(());
        };

        if !tls.certificate.try_exists().unwrap_or(false) {
            return Err(ListenerError::Configuration(format!(
                "Unable to find TLS certificate {}",
                tls.certificate.display()
            )));
        }

        if !tls.key.try_exists().unwrap_or(false) {
            return Err(ListenerError::Configuration(format!(
                "Unable to find TLS key {}",
                tls.key.display()
            )));
        }

        Ok(())
    }
}
