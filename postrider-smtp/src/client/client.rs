//! SMTP client implementation with support for TLS and STARTTLS.

use std::io;
use std::sync::Arc;

use postrider_common::{tracing, xtext};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::{ClientConfig, RootCertStore};

use super::error::{ClientError, Result};
use super::response::Response;

/// Initial size of the read buffer for SMTP responses.
const BUFFER_SIZE: usize = 8192;

/// Maximum size of the read buffer to prevent unbounded growth (1MB).
const MAX_BUFFER_SIZE: usize = 1024 * 1024;

/// Maximum length of a single command line sent to a server, from RFC 5321
/// section 4.5.3.1.4. XFORWARD attribute sets are split to stay under it.
const MAX_COMMAND_LEN: usize = 512;

/// An SMTP client connection that can be either plain TCP or TLS-wrapped.
enum ClientConnection {
    Plain(TcpStream),
    Tls(Box<tokio_rustls::client::TlsStream<TcpStream>>),
}

impl ClientConnection {
    /// Sends data over the connection.
    async fn send(&mut self, data: &[u8]) -> Result<()> {
        match self {
            Self::Plain(stream) => stream.write_all(data).await?,
            Self::Tls(stream) => stream.write_all(data).await?,
        }
        Ok(())
    }

    /// Reads data from the connection into the provided buffer.
    ///
    /// An empty read means the peer closed the connection.
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let n = match self {
            Self::Plain(stream) => stream.read(buf).await?,
            Self::Tls(stream) => stream.read(buf).await?,
        };
        if n == 0 {
            return Err(ClientError::ConnectionClosed);
        }
        Ok(n)
    }

    fn tcp_stream(&self) -> &TcpStream {
        match self {
            Self::Plain(stream) => stream,
            Self::Tls(stream) => stream.get_ref().0,
        }
    }

    /// Upgrades a plain connection to TLS.
    async fn upgrade_to_tls(self, domain: &str, accept_invalid_certs: bool) -> Result<Self> {
        match self {
            Self::Plain(stream) => {
                let mut root_store = RootCertStore::empty();

                let certs = rustls_native_certs::load_native_certs();
                for cert in certs.certs {
                    root_store.add(cert).map_err(|e| {
                        ClientError::TlsError(format!("Failed to add certificate: {e}"))
                    })?;
                }
                if !certs.errors.is_empty() {
                    tracing::warn!(?certs.errors, "Some certificates could not be loaded");
                }

                let mut config = ClientConfig::builder()
                    .with_root_certificates(root_store)
                    .with_no_client_auth();

                // For testing with self-signed certificates only
                if accept_invalid_certs {
                    config
                        .dangerous()
                        .set_certificate_verifier(Arc::new(NoVerifier));
                }

                let connector = TlsConnector::from(Arc::new(config));
                let server_name = ServerName::try_from(domain.to_string())
                    .map_err(|e| ClientError::TlsError(format!("Invalid domain: {e}")))?;

                let tls_stream = connector
                    .connect(server_name, stream)
                    .await
                    .map_err(|e| ClientError::TlsError(e.to_string()))?;

                Ok(Self::Tls(Box::new(tls_stream)))
            }
            Self::Tls(_) => Err(ClientError::TlsError(
                "Connection is already TLS".to_string(),
            )),
        }
    }
}

/// A certificate verifier that accepts all certificates (for testing only).
#[derive(Debug)]
struct NoVerifier;

impl tokio_rustls::rustls::client::danger::ServerCertVerifier for NoVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &tokio_rustls::rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[tokio_rustls::rustls::pki_types::CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: tokio_rustls::rustls::pki_types::UnixTime,
    ) -> std::result::Result<
        tokio_rustls::rustls::client::danger::ServerCertVerified,
        tokio_rustls::rustls::Error,
    > {
        Ok(tokio_rustls::rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &tokio_rustls::rustls::pki_types::CertificateDer<'_>,
        _dss: &tokio_rustls::rustls::DigitallySignedStruct,
    ) -> std::result::Result<
        tokio_rustls::rustls::client::danger::HandshakeSignatureValid,
        tokio_rustls::rustls::Error,
    > {
        Ok(tokio_rustls::rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &tokio_rustls::rustls::pki_types::CertificateDer<'_>,
        _dss: &tokio_rustls::rustls::DigitallySignedStruct,
    ) -> std::result::Result<
        tokio_rustls::rustls::client::danger::HandshakeSignatureValid,
        tokio_rustls::rustls::Error,
    > {
        Ok(tokio_rustls::rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<tokio_rustls::rustls::SignatureScheme> {
        vec![
            tokio_rustls::rustls::SignatureScheme::RSA_PKCS1_SHA256,
            tokio_rustls::rustls::SignatureScheme::ECDSA_NISTP256_SHA256,
            tokio_rustls::rustls::SignatureScheme::ED25519,
        ]
    }
}

/// An SMTP client for sending commands and receiving responses.
pub struct SmtpClient {
    connection: Option<ClientConnection>,
    buffer: Vec<u8>,
    buffer_pos: usize,
    server_domain: String,
    accept_invalid_certs: bool,
}

impl SmtpClient {
    /// Creates a new SMTP client by connecting to the specified address.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection fails.
    pub async fn connect(addr: &str, server_domain: String) -> Result<Self> {
        let stream = TcpStream::connect(addr).await.map_err(ClientError::Io)?;

        Ok(Self {
            connection: Some(ClientConnection::Plain(stream)),
            buffer: vec![0u8; BUFFER_SIZE],
            buffer_pos: 0,
            server_domain,
            accept_invalid_certs: false,
        })
    }

    /// Sets whether to accept invalid TLS certificates.
    ///
    /// This is for testing with self-signed certificates. Default is `false`.
    #[must_use]
    pub const fn accept_invalid_certs(mut self, accept: bool) -> Self {
        self.accept_invalid_certs = accept;
        self
    }

    /// The domain this client was told it is talking to.
    #[must_use]
    pub fn server_domain(&self) -> &str {
        &self.server_domain
    }

    /// Whether the connection has been upgraded to TLS.
    #[must_use]
    pub const fn is_tls(&self) -> bool {
        matches!(self.connection, Some(ClientConnection::Tls(_)))
    }

    /// Cheap liveness probe for pooled connections.
    ///
    /// Returns `false` if the peer has closed the socket, or if it sent
    /// unsolicited data (most likely a 421 goodbye) that makes the pooled
    /// session unusable anyway.
    #[must_use]
    pub fn is_alive(&self) -> bool {
        let Some(connection) = self.connection.as_ref() else {
            return false;
        };

        let mut probe = [0u8; 1];
        match connection.tcp_stream().try_read(&mut probe) {
            Ok(_) => false,
            Err(e) => e.kind() == io::ErrorKind::WouldBlock,
        }
    }

    /// Reads the initial server greeting (220 response).
    ///
    /// # Errors
    ///
    /// Returns an error if reading fails or the greeting is invalid.
    pub async fn read_greeting(&mut self) -> Result<Response> {
        self.read_response().await
    }

    /// Sends a command to the server.
    ///
    /// # Errors
    ///
    /// Returns an error if sending fails.
    pub async fn send_command(&mut self, command: &str) -> Result<()> {
        let data = format!("{command}\r\n");
        self.connection
            .as_mut()
            .ok_or(ClientError::ConnectionClosed)?
            .send(data.as_bytes())
            .await?;
        Ok(())
    }

    /// Sends a raw command and reads the response.
    ///
    /// # Errors
    ///
    /// Returns an error if sending or reading fails.
    pub async fn command(&mut self, command: &str) -> Result<Response> {
        self.send_command(command).await?;
        self.read_response().await
    }

    /// Sends EHLO with the specified domain.
    ///
    /// # Errors
    ///
    /// Returns an error if the command fails.
    pub async fn ehlo(&mut self, domain: &str) -> Result<Response> {
        self.command(&format!("EHLO {domain}")).await
    }

    /// Sends HELO with the specified domain.
    ///
    /// # Errors
    ///
    /// Returns an error if the command fails.
    pub async fn helo(&mut self, domain: &str) -> Result<Response> {
        self.command(&format!("HELO {domain}")).await
    }

    /// Sends MAIL FROM, with the SIZE parameter if given (RFC 1870).
    ///
    /// # Errors
    ///
    /// Returns an error if the command fails.
    pub async fn mail_from(&mut self, from: &str, size: Option<usize>) -> Result<Response> {
        let cmd = if let Some(sz) = size {
            format!("MAIL FROM:<{from}> SIZE={sz}")
        } else {
            format!("MAIL FROM:<{from}>")
        };
        self.command(&cmd).await
    }

    /// Sends RCPT TO.
    ///
    /// # Errors
    ///
    /// Returns an error if the command fails.
    pub async fn rcpt_to(&mut self, to: &str) -> Result<Response> {
        self.command(&format!("RCPT TO:<{to}>")).await
    }

    /// Sends DATA.
    ///
    /// # Errors
    ///
    /// Returns an error if the command fails.
    pub async fn data(&mut self) -> Result<Response> {
        self.command("DATA").await
    }

    /// Sends the message data followed by a dot on its own line.
    ///
    /// # Errors
    ///
    /// Returns an error if sending fails.
    pub async fn send_data(&mut self, data: &[u8]) -> Result<Response> {
        let connection = self
            .connection
            .as_mut()
            .ok_or(ClientError::ConnectionClosed)?;

        // Ensure the data ends with CRLF before the end-of-data marker; a
        // trailing bare LF is replaced, not appended to
        if data.ends_with(b"\r\n") {
            connection.send(data).await?;
        } else if data.ends_with(b"\n") {
            connection.send(&data[..data.len() - 1]).await?;
            connection.send(b"\r\n").await?;
        } else {
            connection.send(data).await?;
            connection.send(b"\r\n").await?;
        }

        connection.send(b".\r\n").await?;

        self.read_response().await
    }

    /// Sends NOOP.
    ///
    /// # Errors
    ///
    /// Returns an error if the command fails.
    pub async fn noop(&mut self) -> Result<Response> {
        self.command("NOOP").await
    }

    /// Sends QUIT.
    ///
    /// # Errors
    ///
    /// Returns an error if the command fails.
    pub async fn quit(&mut self) -> Result<Response> {
        self.command("QUIT").await
    }

    /// Sends RSET to reset the transaction.
    ///
    /// # Errors
    ///
    /// Returns an error if the command fails.
    pub async fn rset(&mut self) -> Result<Response> {
        self.command("RSET").await
    }

    /// Sends STARTTLS and upgrades the connection to TLS on a 220.
    ///
    /// # Errors
    ///
    /// Returns an error if STARTTLS fails or the TLS upgrade fails.
    pub async fn starttls(&mut self) -> Result<Response> {
        let response = self.command("STARTTLS").await?;

        if response.is_success() {
            let domain = self.server_domain.clone();
            let accept_invalid = self.accept_invalid_certs;

            if let Some(old_connection) = self.connection.take() {
                self.connection =
                    Some(old_connection.upgrade_to_tls(&domain, accept_invalid).await?);
                self.buffer_pos = 0;
            } else {
                return Err(ClientError::ConnectionClosed);
            }
        }

        Ok(response)
    }

    /// Sends XCLIENT with the given attributes, values xtext-encoded.
    ///
    /// A 220 in reply means the server reset the session and expects a new
    /// EHLO; the caller is responsible for re-greeting.
    ///
    /// # Errors
    ///
    /// Returns an error if the command fails.
    pub async fn xclient(&mut self, attrs: &[(String, String)]) -> Result<Response> {
        let mut command = String::from("XCLIENT");
        for (name, value) in attrs {
            command.push(' ');
            command.push_str(&name.to_ascii_uppercase());
            command.push('=');
            command.push_str(&xtext::encode(value));
        }
        self.command(&command).await
    }

    /// Sends the given XFORWARD attributes, splitting them over as many
    /// commands as needed to stay within the command line limit.
    ///
    /// # Errors
    ///
    /// Returns an error if any of the commands fails.
    pub async fn xforward(&mut self, attrs: &[(String, String)]) -> Result<Vec<Response>> {
        const VERB: &str = "XFORWARD";

        let mut responses = Vec::new();
        let mut command = String::from(VERB);

        for (name, value) in attrs {
            let token = format!(" {}={}", name.to_ascii_uppercase(), xtext::encode(value));

            if command.len() + token.len() + 2 > MAX_COMMAND_LEN && command.len() > VERB.len() {
                responses.push(self.command(&command).await?);
                command = String::from(VERB);
            }

            command.push_str(&token);
        }

        if command.len() > VERB.len() {
            responses.push(self.command(&command).await?);
        }

        Ok(responses)
    }

    /// Reads a complete SMTP response from the server.
    ///
    /// # Errors
    ///
    /// Returns an error if reading fails or the response is malformed.
    pub async fn read_response(&mut self) -> Result<Response> {
        loop {
            if let Some((response, consumed)) =
                Response::parse_response(&self.buffer[..self.buffer_pos])?
            {
                self.buffer.copy_within(consumed..self.buffer_pos, 0);
                self.buffer_pos -= consumed;

                return Ok(response);
            }

            // Need more data
            if self.buffer_pos >= self.buffer.len() {
                let new_size = self.buffer.len() * 2;
                if new_size > MAX_BUFFER_SIZE {
                    return Err(ClientError::ParseError(format!(
                        "Response too large (exceeds {MAX_BUFFER_SIZE} bytes)"
                    )));
                }
                self.buffer.resize(new_size, 0);
            }

            let connection = self
                .connection
                .as_mut()
                .ok_or(ClientError::ConnectionClosed)?;
            let n = connection.read(&mut self.buffer[self.buffer_pos..]).await?;
            self.buffer_pos += n;
        }
    }
}
