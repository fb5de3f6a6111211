//! Configurable mock SMTP server for delivery tests.
//!
//! Scripts per-verb responses, records every command it receives, and can
//! inject failures: dropped connections, hangs on a chosen command, and
//! delayed responses. Optionally terminates STARTTLS with a self-signed
//! certificate so the upgrade path can be exercised end to end.
#![allow(dead_code)] // shared test utility, not every test uses every knob

use std::{
    fmt::Write as _,
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::Duration,
};

use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    net::{TcpListener, TcpStream},
    sync::RwLock,
    time::timeout,
};
use tokio_rustls::{TlsAcceptor, rustls::ServerConfig};

/// A command the mock server received.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SmtpCommand {
    Ehlo(String),
    Helo(String),
    MailFrom(String),
    RcptTo(String),
    Data,
    MessageContent(Vec<u8>),
    Quit,
    StartTls,
    XClient(String),
    XForward(String),
    Other(String),
}

/// A scripted single-line response.
#[derive(Debug, Clone)]
pub struct SmtpResponse {
    pub code: u16,
    pub message: String,
}

impl SmtpResponse {
    fn new(code: u16, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    fn to_bytes(&self) -> Vec<u8> {
        format!("{} {}\r\n", self.code, self.message).into_bytes()
    }
}

#[derive(Clone)]
struct EhloResponse {
    code: u16,
    capabilities: Vec<String>,
}

impl EhloResponse {
    fn to_bytes(&self) -> Vec<u8> {
        let mut response = String::new();
        let last = self.capabilities.len().saturating_sub(1);

        for (i, capability) in self.capabilities.iter().enumerate() {
            let separator = if i < last { '-' } else { ' ' };
            let _ = writeln!(&mut response, "{}{}{}\r", self.code, separator, capability);
        }

        response.into_bytes()
    }
}

#[derive(Clone)]
struct MockServerConfig {
    greeting: SmtpResponse,
    ehlo: EhloResponse,
    /// Capabilities advertised by EHLO after a TLS upgrade. Defaults to the
    /// plaintext list minus STARTTLS.
    tls_ehlo: Option<EhloResponse>,
    mail_from: SmtpResponse,
    rcpt_to: SmtpResponse,
    data: SmtpResponse,
    data_end: SmtpResponse,
    quit: SmtpResponse,
    starttls: Option<SmtpResponse>,
    xclient: SmtpResponse,
    xforward: SmtpResponse,
    tls: Option<TlsAcceptor>,

    // Failure injection
    connection_delay: Option<Duration>,
    response_delay: Option<Duration>,
    drop_after_commands: Option<usize>,
    hang_on_command: Option<usize>,
}

impl Default for MockServerConfig {
    fn default() -> Self {
        Self {
            greeting: SmtpResponse::new(220, "Mock SMTP Server"),
            ehlo: EhloResponse {
                code: 250,
                capabilities: vec!["localhost".to_string(), "SIZE 10000".to_string()],
            },
            tls_ehlo: None,
            mail_from: SmtpResponse::new(250, "OK"),
            rcpt_to: SmtpResponse::new(250, "OK"),
            data: SmtpResponse::new(354, "Start mail input; end with <CRLF>.<CRLF>"),
            data_end: SmtpResponse::new(250, "OK: Message accepted"),
            quit: SmtpResponse::new(221, "Bye"),
            starttls: None,
            xclient: SmtpResponse::new(220, "Mock SMTP Server"),
            xforward: SmtpResponse::new(250, "OK"),
            tls: None,
            connection_delay: None,
            response_delay: None,
            drop_after_commands: None,
            hang_on_command: None,
        }
    }
}

enum LoopExit {
    Closed,
    StartTls,
}

/// Incremental line assembly over any stream type, so the same command loop
/// serves both the plaintext and post-upgrade phases.
#[derive(Default)]
struct LineReader {
    buffer: Vec<u8>,
}

impl LineReader {
    async fn next_line<S: AsyncRead + Unpin>(
        &mut self,
        stream: &mut S,
    ) -> std::io::Result<Option<String>> {
        loop {
            if let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') {
                let line: Vec<u8> = self.buffer.drain(..=pos).collect();
                return Ok(Some(
                    String::from_utf8_lossy(&line).trim_end().to_string(),
                ));
            }

            let mut chunk = [0u8; 1024];
            let n = stream.read(&mut chunk).await?;
            if n == 0 {
                return Ok(None);
            }
            self.buffer.extend_from_slice(&chunk[..n]);
        }
    }
}

/// The mock server handle. Dropping it does not stop the listener; call
/// [`MockSmtpServer::shutdown`].
pub struct MockSmtpServer {
    addr: SocketAddr,
    commands_received: Arc<RwLock<Vec<SmtpCommand>>>,
    shutdown: Arc<AtomicBool>,
    command_count: Arc<AtomicUsize>,
}

impl MockSmtpServer {
    #[must_use]
    pub fn builder() -> MockSmtpServerBuilder {
        MockSmtpServerBuilder::new()
    }

    #[must_use]
    pub const fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Every command received so far, in order.
    pub async fn commands(&self) -> Vec<SmtpCommand> {
        self.commands_received.read().await.clone()
    }

    #[must_use]
    pub fn command_count(&self) -> usize {
        self.command_count.load(Ordering::Relaxed)
    }

    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
    }

    async fn handle_client(
        mut stream: TcpStream,
        config: Arc<MockServerConfig>,
        commands: Arc<RwLock<Vec<SmtpCommand>>>,
        command_count: Arc<AtomicUsize>,
    ) -> Result<(), Box<dyn std::error::Error>> {
        if let Some(delay) = config.connection_delay {
            tokio::time::sleep(delay).await;
        }

        stream.write_all(&config.greeting.to_bytes()).await?;
        stream.flush().await?;

        let mut seen = 0usize;
        let exit = Self::command_loop(
            &mut stream,
            false,
            &config,
            &commands,
            &command_count,
            &mut seen,
        )
        .await?;

        if let LoopExit::StartTls = exit {
            let acceptor = config
                .tls
                .clone()
                .ok_or("STARTTLS accepted without a TLS acceptor")?;
            let mut tls_stream = acceptor.accept(stream).await?;
            Self::command_loop(
                &mut tls_stream,
                true,
                &config,
                &commands,
                &command_count,
                &mut seen,
            )
            .await?;
        }

        Ok(())
    }

    #[allow(clippy::too_many_lines)]
    async fn command_loop<S: AsyncRead + AsyncWrite + Unpin>(
        stream: &mut S,
        tls_active: bool,
        config: &MockServerConfig,
        commands: &RwLock<Vec<SmtpCommand>>,
        command_count: &AtomicUsize,
        seen: &mut usize,
    ) -> Result<LoopExit, Box<dyn std::error::Error>> {
        let mut lines = LineReader::default();

        loop {
            if let Some(drop_after) = config.drop_after_commands
                && *seen >= drop_after
            {
                // Silently close the connection
                return Ok(LoopExit::Closed);
            }

            if let Some(hang_on) = config.hang_on_command
                && *seen == hang_on
            {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                return Ok(LoopExit::Closed);
            }

            let Ok(read) = timeout(Duration::from_secs(10), lines.next_line(stream)).await else {
                return Ok(LoopExit::Closed);
            };
            let Some(line) = read? else {
                return Ok(LoopExit::Closed);
            };

            *seen += 1;
            command_count.fetch_add(1, Ordering::Relaxed);

            let (verb, rest) = line.split_once(' ').unwrap_or((line.as_str(), ""));

            let (response, command) = match verb.to_uppercase().as_str() {
                "EHLO" => {
                    let ehlo = if tls_active {
                        config.tls_ehlo.clone().unwrap_or_else(|| EhloResponse {
                            code: config.ehlo.code,
                            capabilities: config
                                .ehlo
                                .capabilities
                                .iter()
                                .filter(|c| !c.eq_ignore_ascii_case("STARTTLS"))
                                .cloned()
                                .collect(),
                        })
                    } else {
                        config.ehlo.clone()
                    };
                    (ehlo.to_bytes(), SmtpCommand::Ehlo(rest.to_string()))
                }
                "HELO" => (
                    SmtpResponse::new(250, "Hello").to_bytes(),
                    SmtpCommand::Helo(rest.to_string()),
                ),
                "MAIL" => (
                    config.mail_from.to_bytes(),
                    SmtpCommand::MailFrom(rest.to_string()),
                ),
                "RCPT" => (
                    config.rcpt_to.to_bytes(),
                    SmtpCommand::RcptTo(rest.to_string()),
                ),
                "DATA" => (config.data.to_bytes(), SmtpCommand::Data),
                "QUIT" => {
                    commands.write().await.push(SmtpCommand::Quit);
                    stream.write_all(&config.quit.to_bytes()).await?;
                    stream.flush().await?;
                    return Ok(LoopExit::Closed);
                }
                "STARTTLS" => {
                    let response = config.starttls.clone().unwrap_or_else(|| {
                        SmtpResponse::new(502, "Command not implemented")
                    });
                    commands.write().await.push(SmtpCommand::StartTls);
                    stream.write_all(&response.to_bytes()).await?;
                    stream.flush().await?;

                    if (200..300).contains(&response.code) && config.tls.is_some() {
                        return Ok(LoopExit::StartTls);
                    }
                    continue;
                }
                "XCLIENT" => (
                    config.xclient.to_bytes(),
                    SmtpCommand::XClient(rest.to_string()),
                ),
                "XFORWARD" => (
                    config.xforward.to_bytes(),
                    SmtpCommand::XForward(rest.to_string()),
                ),
                _ => (
                    SmtpResponse::new(500, "Unknown command").to_bytes(),
                    SmtpCommand::Other(line.clone()),
                ),
            };

            commands.write().await.push(command.clone());

            if command == SmtpCommand::Data && config.data.code == 354 {
                stream.write_all(&response).await?;
                stream.flush().await?;

                let mut content = Vec::new();
                loop {
                    let Some(data_line) = lines.next_line(stream).await? else {
                        return Ok(LoopExit::Closed);
                    };
                    if data_line == "." {
                        break;
                    }
                    content.extend_from_slice(data_line.as_bytes());
                    content.extend_from_slice(b"\r\n");
                }

                commands
                    .write()
                    .await
                    .push(SmtpCommand::MessageContent(content));

                if let Some(delay) = config.response_delay {
                    tokio::time::sleep(delay).await;
                }
                stream.write_all(&config.data_end.to_bytes()).await?;
                stream.flush().await?;
                continue;
            }

            if let Some(delay) = config.response_delay {
                tokio::time::sleep(delay).await;
            }

            stream.write_all(&response).await?;
            stream.flush().await?;
        }
    }
}

/// Builder for a [`MockSmtpServer`].
pub struct MockSmtpServerBuilder {
    config: MockServerConfig,
}

impl MockSmtpServerBuilder {
    fn new() -> Self {
        Self {
            config: MockServerConfig::default(),
        }
    }

    #[must_use]
    pub fn with_greeting(mut self, code: u16, message: impl Into<String>) -> Self {
        self.config.greeting = SmtpResponse::new(code, message);
        self
    }

    #[must_use]
    pub fn with_ehlo_response(mut self, code: u16, capabilities: Vec<String>) -> Self {
        self.config.ehlo = EhloResponse { code, capabilities };
        self
    }

    /// Capabilities advertised by EHLO inside TLS. Without this, the
    /// plaintext list minus STARTTLS is reused.
    #[must_use]
    pub fn with_tls_ehlo_response(mut self, code: u16, capabilities: Vec<String>) -> Self {
        self.config.tls_ehlo = Some(EhloResponse { code, capabilities });
        self
    }

    #[must_use]
    pub fn with_mail_from_response(mut self, code: u16, message: impl Into<String>) -> Self {
        self.config.mail_from = SmtpResponse::new(code, message);
        self
    }

    #[must_use]
    pub fn with_rcpt_to_response(mut self, code: u16, message: impl Into<String>) -> Self {
        self.config.rcpt_to = SmtpResponse::new(code, message);
        self
    }

    #[must_use]
    pub fn with_data_response(mut self, code: u16, message: impl Into<String>) -> Self {
        self.config.data = SmtpResponse::new(code, message);
        self
    }

    #[must_use]
    pub fn with_data_end_response(mut self, code: u16, message: impl Into<String>) -> Self {
        self.config.data_end = SmtpResponse::new(code, message);
        self
    }

    #[must_use]
    pub fn with_xclient_response(mut self, code: u16, message: impl Into<String>) -> Self {
        self.config.xclient = SmtpResponse::new(code, message);
        self
    }

    #[must_use]
    pub fn with_xforward_response(mut self, code: u16, message: impl Into<String>) -> Self {
        self.config.xforward = SmtpResponse::new(code, message);
        self
    }

    /// Sets the STARTTLS response. A 2xx code also requires
    /// [`Self::with_tls`] so the server can complete the handshake.
    #[must_use]
    pub fn with_starttls_response(mut self, code: u16, message: impl Into<String>) -> Self {
        self.config.starttls = Some(SmtpResponse::new(code, message));
        self
    }

    /// Terminates STARTTLS with the given PEM certificate and key.
    ///
    /// # Panics
    ///
    /// Panics if the PEM material cannot be parsed; test fixtures only.
    #[must_use]
    pub fn with_tls(mut self, cert_pem: &[u8], key_pem: &[u8]) -> Self {
        let certs = rustls_pemfile::certs(&mut &cert_pem[..])
            .collect::<Result<Vec<_>, _>>()
            .expect("invalid test certificate");
        let key = rustls_pemfile::private_key(&mut &key_pem[..])
            .expect("invalid test key")
            .expect("no test key found");

        let server_config = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .expect("test TLS config");

        self.config.tls = Some(TlsAcceptor::from(Arc::new(server_config)));
        self
    }

    #[must_use]
    pub const fn with_connection_delay(mut self, delay: Duration) -> Self {
        self.config.connection_delay = Some(delay);
        self
    }

    #[must_use]
    pub const fn with_response_delay(mut self, delay: Duration) -> Self {
        self.config.response_delay = Some(delay);
        self
    }

    /// Drops the connection after N commands.
    #[must_use]
    pub const fn with_network_error_after_commands(mut self, count: usize) -> Self {
        self.config.drop_after_commands = Some(count);
        self
    }

    /// Hangs on the Nth command (0-indexed).
    #[must_use]
    pub const fn with_hang_on_command(mut self, command_index: usize) -> Self {
        self.config.hang_on_command = Some(command_index);
        self
    }

    /// Binds a random loopback port and starts serving.
    ///
    /// # Errors
    ///
    /// Returns an error if the listener cannot bind.
    pub async fn build(self) -> Result<MockSmtpServer, std::io::Error> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;

        let config = Arc::new(self.config);
        let commands = Arc::new(RwLock::new(Vec::new()));
        let shutdown = Arc::new(AtomicBool::new(false));
        let command_count = Arc::new(AtomicUsize::new(0));

        let accept_config = Arc::clone(&config);
        let accept_commands = Arc::clone(&commands);
        let accept_shutdown = Arc::clone(&shutdown);
        let accept_count = Arc::clone(&command_count);

        tokio::spawn(async move {
            loop {
                if accept_shutdown.load(Ordering::Relaxed) {
                    break;
                }

                // Bounded accept so the shutdown flag is rechecked
                let accepted = timeout(Duration::from_millis(100), listener.accept()).await;

                if let Ok(Ok((stream, _peer))) = accepted {
                    let config = Arc::clone(&accept_config);
                    let commands = Arc::clone(&accept_commands);
                    let count = Arc::clone(&accept_count);

                    tokio::spawn(async move {
                        if let Err(e) =
                            MockSmtpServer::handle_client(stream, config, commands, count).await
                        {
                            tracing::debug!("Mock server client error: {e}");
                        }
                    });
                }
            }
        });

        Ok(MockSmtpServer {
            addr,
            commands_received: commands,
            shutdown,
            command_count,
        })
    }
}
