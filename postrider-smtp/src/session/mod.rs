use std::{net::SocketAddr, path::PathBuf, sync::Arc};

use postrider_common::{
    Signal, backpressure::BackpressureSignal, envelope::Envelope, error::SessionError, internal,
    outgoing, status::Status, tracing,
};
use postrider_spool::MailQueue;
use serde::Deserialize;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::{
    SmtpServerTimeouts, State,
    connection::Connection,
    extensions::Extension,
    traits::{AcceptAllValidator, AddressValidator, HostResolver, TrustingResolver},
};

mod handlers;
mod io;

/// What the connection should do after a reply has been written.
#[derive(PartialEq, Eq, Debug)]
pub enum Event {
    ConnectionClose,
    ConnectionKeepAlive,
    /// A 220 to STARTTLS has been sent; perform the in-place upgrade.
    UpgradeTls,
}

/// Reply lines to write, followed by what to do with the connection.
pub type Reply = (Vec<String>, Event);

#[derive(Clone, Debug, Deserialize)]
pub struct TlsContext {
    pub certificate: PathBuf,
    pub key: PathBuf,
}

/// Default maximum command line length, from RFC 5321 section 4.5.3.1.4
/// (512 octets) plus the margin Postfix allows for vendor extensions.
pub const DEFAULT_MAX_COMMAND_LINE: usize = 552;

#[derive(Clone, Debug)]
pub struct SessionConfig {
    pub extensions: Vec<Extension>,
    pub banner: String,
    pub max_command_line: usize,
    pub crlf_relaxed: bool,
    pub timeouts: SmtpServerTimeouts,
    pub queue: Option<Arc<dyn MailQueue>>,
    pub resolver: Arc<dyn HostResolver>,
    pub validator: Arc<dyn AddressValidator>,
    pub backpressure: Option<Arc<BackpressureSignal>>,
}

impl SessionConfig {
    /// Create a new `SessionConfig` builder
    #[must_use]
    pub fn builder() -> SessionConfigBuilder {
        SessionConfigBuilder::default()
    }
}

/// Builder for `SessionConfig`
#[derive(Debug)]
pub struct SessionConfigBuilder {
    extensions: Vec<Extension>,
    banner: String,
    max_command_line: usize,
    crlf_relaxed: bool,
    timeouts: SmtpServerTimeouts,
    queue: Option<Arc<dyn MailQueue>>,
    resolver: Arc<dyn HostResolver>,
    validator: Arc<dyn AddressValidator>,
    backpressure: Option<Arc<BackpressureSignal>>,
}

impl Default for SessionConfigBuilder {
    fn default() -> Self {
        Self {
            extensions: Vec::new(),
            banner: String::new(),
            max_command_line: DEFAULT_MAX_COMMAND_LINE,
            crlf_relaxed: false,
            timeouts: SmtpServerTimeouts::default(),
            queue: None,
            resolver: Arc::new(TrustingResolver),
            validator: Arc::new(AcceptAllValidator),
            backpressure: None,
        }
    }
}

impl SessionConfigBuilder {
    /// Set the extensions advertised by this session
    #[must_use]
    pub fn with_extensions(mut self, extensions: Vec<Extension>) -> Self {
        self.extensions = extensions;
        self
    }

    /// Set the server banner hostname
    #[must_use]
    pub fn with_banner(mut self, banner: String) -> Self {
        self.banner = banner;
        self
    }

    /// Set the maximum accepted command line length
    #[must_use]
    pub const fn with_max_command_line(mut self, max_command_line: usize) -> Self {
        self.max_command_line = max_command_line;
        self
    }

    /// Accept bare LF line endings in addition to CRLF
    #[must_use]
    pub const fn with_crlf_relaxed(mut self, crlf_relaxed: bool) -> Self {
        self.crlf_relaxed = crlf_relaxed;
        self
    }

    /// Set the timeout configuration for this session
    #[must_use]
    pub const fn with_timeouts(mut self, timeouts: SmtpServerTimeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    /// Set the mail queue accepted messages are handed to
    #[must_use]
    pub fn with_queue(mut self, queue: Option<Arc<dyn MailQueue>>) -> Self {
        self.queue = queue;
        self
    }

    /// Set the resolver used to check HELO/EHLO hostnames
    #[must_use]
    pub fn with_resolver(mut self, resolver: Arc<dyn HostResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    /// Set the validator consulted for MAIL, RCPT, and VRFY addresses
    #[must_use]
    pub fn with_validator(mut self, validator: Arc<dyn AddressValidator>) -> Self {
        self.validator = validator;
        self
    }

    /// Set the backpressure signal consulted before accepting new mail
    #[must_use]
    pub fn with_backpressure(mut self, backpressure: Option<Arc<BackpressureSignal>>) -> Self {
        self.backpressure = backpressure;
        self
    }

    /// Build the final `SessionConfig`
    #[must_use]
    pub fn build(self) -> SessionConfig {
        SessionConfig {
            extensions: self.extensions,
            banner: self.banner,
            max_command_line: self.max_command_line,
            crlf_relaxed: self.crlf_relaxed,
            timeouts: self.timeouts,
            queue: self.queue,
            resolver: self.resolver,
            validator: self.validator,
            backpressure: self.backpressure,
        }
    }
}

pub struct Session<Stream: AsyncRead + AsyncWrite + Unpin + Send + Sync> {
    peer: SocketAddr,
    pub(super) state: State,
    pub(super) envelope: Envelope,
    /// Command line assembly buffer
    pub(super) line: Vec<u8>,
    /// Message data accumulated between DATA and the end-of-data marker
    pub(super) message: Vec<u8>,
    pub(super) extensions: Vec<Extension>,
    pub(super) banner: Arc<str>,
    pub(super) tls_context: Option<TlsContext>,
    pub(super) queue: Option<Arc<dyn MailQueue>>,
    pub(super) resolver: Arc<dyn HostResolver>,
    pub(super) validator: Arc<dyn AddressValidator>,
    pub(super) backpressure: Option<Arc<BackpressureSignal>>,
    pub(super) connection: Connection<Stream>,
    /// Maximum message size in bytes as advertised via SIZE (RFC 1870).
    ///
    /// A value of 0 means no limit. Validated at two points: against the
    /// declared SIZE parameter on MAIL FROM, and against the actual bytes
    /// received during data reception. Both reject with 552.
    pub(super) max_message_size: usize,
    pub(super) max_command_line: usize,
    pub(super) crlf_relaxed: bool,
    timeouts: SmtpServerTimeouts,
    start_time: std::time::Instant,
}

impl<Stream: AsyncRead + AsyncWrite + Unpin + Send + Sync> Session<Stream> {
    pub(crate) fn create(stream: Stream, peer: SocketAddr, config: SessionConfig) -> Self {
        tracing::debug!("Extensions: {:?}", config.extensions);

        let max_message_size = config
            .extensions
            .iter()
            .find_map(|ext| match ext {
                Extension::Size(size) => Some(*size),
                _ => None,
            })
            .unwrap_or(0);

        let tls_context = config.extensions.iter().find_map(|ext| match ext {
            Extension::Starttls(context) => Some(context.clone()),
            _ => None,
        });

        Self {
            peer,
            state: State::default(),
            envelope: Envelope::connected(peer),
            line: Vec::new(),
            message: Vec::new(),
            connection: Connection::plain(stream),
            extensions: config.extensions,
            tls_context,
            queue: config.queue,
            resolver: config.resolver,
            validator: config.validator,
            backpressure: config.backpressure,
            banner: if config.banner.is_empty() {
                std::env::var("HOSTNAME")
                    .unwrap_or_else(|_| "localhost".to_string())
                    .into()
            } else {
                config.banner.into()
            },
            max_message_size,
            max_command_line: config.max_command_line,
            crlf_relaxed: config.crlf_relaxed,
            timeouts: config.timeouts,
            start_time: std::time::Instant::now(),
        }
    }

    /// Timeout for the next read, based on RFC 5321 recommendations:
    /// message data blocks get their own (shorter) limit.
    const fn get_timeout_secs(&self) -> u64 {
        match &self.state {
            State::Reading(_) => self.timeouts.data_block_secs,
            _ => self.timeouts.command_secs,
        }
    }

    pub(crate) async fn run(
        mut self,
        mut signal: tokio::sync::broadcast::Receiver<Signal>,
    ) -> Result<(), SessionError> {
        internal!("Connected");

        let banner = format!("{} {} ESMTP", Status::ServiceReady, self.banner);
        outgoing!("{banner}");
        self.connection
            .send(&banner)
            .await
            .map_err(|err| SessionError::Protocol(format!("Failed to send banner: {err}")))?;

        let result = loop {
            let connection_duration = self.start_time.elapsed();
            let max_duration = std::time::Duration::from_secs(self.timeouts.connection_secs);
            if connection_duration >= max_duration {
                tracing::warn!(
                    peer = ?self.peer,
                    duration_secs = connection_duration.as_secs(),
                    max_secs = self.timeouts.connection_secs,
                    "Connection exceeded maximum lifetime, closing"
                );
                break Err(SessionError::Timeout(self.timeouts.connection_secs));
            }

            let timeout_secs = self.get_timeout_secs();
            let timeout = std::time::Duration::from_secs(timeout_secs);

            let event = tokio::select! {
                _ = signal.recv() => {
                    let goodbye = format!("{} Server shutting down", Status::Unavailable);
                    outgoing!("{goodbye}");
                    let _ = self.connection.send(&goodbye).await;
                    break Ok(());
                }
                result = tokio::time::timeout(timeout, self.receive()) => {
                    match result {
                        Ok(event) => event?,
                        Err(_) => {
                            tracing::warn!(
                                peer = ?self.peer,
                                state = ?self.state,
                                timeout_secs,
                                "Client connection timed out"
                            );
                            break Err(SessionError::Timeout(timeout_secs));
                        }
                    }
                }
            };

            match event {
                Event::ConnectionKeepAlive => {}
                Event::ConnectionClose => break Ok(()),
                Event::UpgradeTls => {
                    let Some(tls_context) = self.tls_context.clone() else {
                        break Err(SessionError::Protocol(
                            "TLS upgrade requested without TLS configuration".to_string(),
                        ));
                    };

                    let (connection, info) = self
                        .connection
                        .upgrade(&tls_context)
                        .await
                        .map_err(|e| SessionError::Protocol(e.to_string()))?;
                    self.connection = connection;

                    // RFC 3207: everything learnt before the handshake is
                    // discarded, the client must greet again
                    self.envelope.reset_session();
                    self.state = State::default();
                    self.line.clear();
                    self.message.clear();

                    internal!(
                        level = DEBUG,
                        "Connection upgraded to {} with {}",
                        info.proto(),
                        info.cipher()
                    );
                }
            }
        };

        internal!("Connection closed");
        result
    }
}

#[cfg(test)]
mod test {
    use std::{io::Cursor, sync::Arc};

    use async_trait::async_trait;
    use postrider_common::{backpressure::BackpressureSignal, status::Status};
    use postrider_spool::{MailQueue, TestQueue};

    use super::{Event, Session, SessionConfig, SessionConfigBuilder};
    use crate::{State, extensions::Extension, traits::AddressValidator, traits::HostResolver};

    #[derive(Debug)]
    struct FakeResolver {
        allow: bool,
    }

    #[async_trait]
    impl HostResolver for FakeResolver {
        async fn resolves(&self, _host: &str) -> bool {
            self.allow
        }
    }

    #[derive(Debug)]
    struct RejectingValidator;

    #[async_trait]
    impl AddressValidator for RejectingValidator {
        async fn validate(&self, mailbox: &str) -> bool {
            !mailbox.contains("bad")
        }
    }

    fn session(builder: SessionConfigBuilder) -> Session<Cursor<Vec<u8>>> {
        Session::create(
            Cursor::default(),
            "[::]:25".parse().unwrap(),
            builder.with_banner("testing".to_string()).build(),
        )
    }

    fn config() -> SessionConfigBuilder {
        SessionConfig::builder()
    }

    async fn greet(session: &mut Session<Cursor<Vec<u8>>>) {
        let (replies, event) = session.handle_command(b"EHLO client.example.com").await;
        assert_eq!(event, Event::ConnectionKeepAlive);
        assert!(replies.last().unwrap().starts_with("250 "));
    }

    #[tokio::test]
    async fn ehlo_advertises_extensions() {
        let mut session = session(
            config().with_extensions(vec![Extension::Size(1000), Extension::EightBitMime]),
        );

        let (replies, event) = session.handle_command(b"EHLO client.example.com").await;
        assert_eq!(event, Event::ConnectionKeepAlive);
        assert_eq!(
            replies,
            vec![
                "250-testing says hello to client.example.com".to_string(),
                "250-SIZE 1000".to_string(),
                "250 8BITMIME".to_string(),
            ]
        );
        assert!(matches!(session.state, State::Ehlo(_)));
    }

    #[tokio::test]
    async fn unresolvable_helo_refused() {
        let mut session = session(config().with_resolver(Arc::new(FakeResolver { allow: false })));

        let (replies, event) = session.handle_command(b"EHLO ghost.invalid").await;
        assert_eq!(event, Event::ConnectionClose);
        assert!(replies[0].starts_with(&Status::ParameterNotImplemented.to_string()));
        assert!(replies[0].contains("ghost.invalid"));
    }

    #[tokio::test]
    async fn mail_before_greeting_closes() {
        let mut session = session(config());

        let (replies, event) = session.handle_command(b"MAIL FROM:<a@x.com>").await;
        assert_eq!(event, Event::ConnectionClose);
        assert!(replies[0].starts_with("503 "));
    }

    #[tokio::test]
    async fn full_transaction_enqueues() {
        let queue = Arc::new(TestQueue::new());
        let mut session = session(config().with_queue(Some(queue.clone())));

        greet(&mut session).await;

        let (replies, _) = session.handle_command(b"MAIL FROM:<a@x.com>").await;
        assert!(replies[0].starts_with("250 "));

        let (replies, _) = session.handle_command(b"RCPT TO:<b@y.com>").await;
        assert!(replies[0].starts_with("250 "));

        let (replies, _) = session.handle_command(b"DATA").await;
        assert!(replies[0].starts_with("354 "));
        assert!(matches!(session.state, State::Reading(_)));

        let event = session
            .ingest(b"Subject: hi\r\n\r\nbody\r\n.\r\n")
            .await
            .unwrap();
        assert_eq!(event, Event::ConnectionKeepAlive);

        // Back to the greeted state, ready for the next transaction
        assert!(matches!(session.state, State::Ehlo(_)));
        assert_eq!(queue.count(postrider_spool::INBOUND).await, 1);

        let stored = queue.messages(postrider_spool::INBOUND);
        assert_eq!(stored[0].body, b"Subject: hi\r\n\r\nbody\r\n");
        assert_eq!(stored[0].envelope.recipient_count(), 1);
    }

    #[tokio::test]
    async fn enqueue_failure_is_temporary() {
        let queue = Arc::new(TestQueue::new());
        queue.fail_next_enqueues(true);
        let mut session = session(config().with_queue(Some(queue.clone())));

        greet(&mut session).await;
        session.handle_command(b"MAIL FROM:<a@x.com>").await;
        session.handle_command(b"RCPT TO:<b@y.com>").await;
        session.handle_command(b"DATA").await;

        let event = session.ingest(b"body\r\n.\r\n").await.unwrap();
        assert_eq!(event, Event::ConnectionKeepAlive);
        assert_eq!(queue.count(postrider_spool::INBOUND).await, 0);

        // The 451 leaves the session usable for a retry
        let (replies, _) = session.handle_command(b"MAIL FROM:<a@x.com>").await;
        assert!(replies[0].starts_with("250 "));
    }

    #[tokio::test]
    async fn backpressure_refuses_mail() {
        let signal = Arc::new(BackpressureSignal::new());
        signal.sample(101, 100, 50);

        let mut session = session(config().with_backpressure(Some(signal)));
        greet(&mut session).await;

        let (replies, event) = session.handle_command(b"MAIL FROM:<a@x.com>").await;
        assert_eq!(event, Event::ConnectionClose);
        assert!(replies[0].starts_with("452 "));
    }

    #[tokio::test]
    async fn declared_size_over_limit() {
        let mut session = session(config().with_extensions(vec![Extension::Size(1000)]));
        greet(&mut session).await;

        let (replies, event) = session
            .handle_command(b"MAIL FROM:<a@x.com> SIZE=2000")
            .await;
        assert_eq!(event, Event::ConnectionKeepAlive);
        assert!(replies[0].starts_with("552 "));

        // The transaction never started
        let (replies, event) = session.handle_command(b"RCPT TO:<b@y.com>").await;
        assert_eq!(event, Event::ConnectionClose);
        assert!(replies[0].starts_with("503 "));
    }

    #[tokio::test]
    async fn body_over_limit_closes() {
        let mut session = session(config().with_extensions(vec![Extension::Size(16)]));
        greet(&mut session).await;
        session.handle_command(b"MAIL FROM:<a@x.com>").await;
        session.handle_command(b"RCPT TO:<b@y.com>").await;
        session.handle_command(b"DATA").await;

        let event = session
            .ingest(b"0123456789abcdef0123456789abcdef")
            .await
            .unwrap();
        assert_eq!(event, Event::ConnectionClose);
    }

    #[tokio::test]
    async fn body_exactly_at_limit_is_accepted() {
        let queue = Arc::new(TestQueue::new());
        let mut session = session(
            config()
                .with_extensions(vec![Extension::Size(16)])
                .with_queue(Some(queue.clone())),
        );
        greet(&mut session).await;
        session.handle_command(b"MAIL FROM:<a@x.com>").await;
        session.handle_command(b"RCPT TO:<b@y.com>").await;
        session.handle_command(b"DATA").await;

        // 16 bytes of body, terminator on top; the marker never counts
        let event = session.ingest(b"0123456789abcd\r\n.\r\n").await.unwrap();
        assert_eq!(event, Event::ConnectionKeepAlive);
        assert_eq!(queue.count(postrider_spool::INBOUND).await, 1);
        assert_eq!(
            queue.messages(postrider_spool::INBOUND)[0].body,
            b"0123456789abcd\r\n"
        );
    }

    #[tokio::test]
    async fn body_one_byte_over_limit_closes() {
        let queue = Arc::new(TestQueue::new());
        let mut session = session(
            config()
                .with_extensions(vec![Extension::Size(16)])
                .with_queue(Some(queue.clone())),
        );
        greet(&mut session).await;
        session.handle_command(b"MAIL FROM:<a@x.com>").await;
        session.handle_command(b"RCPT TO:<b@y.com>").await;
        session.handle_command(b"DATA").await;

        let event = session.ingest(b"0123456789abcde\r\n.\r\n").await.unwrap();
        assert_eq!(event, Event::ConnectionClose);
        assert_eq!(queue.count(postrider_spool::INBOUND).await, 0);
    }

    #[tokio::test]
    async fn oversized_command_line_closes() {
        let mut session = session(config().with_max_command_line(32));

        let long = format!("EHLO {}\r\n", "x".repeat(64));
        let event = session.ingest(long.as_bytes()).await.unwrap();
        assert_eq!(event, Event::ConnectionClose);
    }

    #[tokio::test]
    async fn oversized_unterminated_line_closes() {
        let mut session = session(config().with_max_command_line(32));

        // No line terminator yet, but already too long to ever be valid
        let event = session.ingest(&[b'x'; 64]).await.unwrap();
        assert_eq!(event, Event::ConnectionClose);
    }

    #[tokio::test]
    async fn lf_relaxed_mode() {
        let queue = Arc::new(TestQueue::new());
        let mut session = session(config().with_crlf_relaxed(true).with_queue(Some(queue.clone())));

        let event = session.ingest(b"EHLO client.example.com\n").await.unwrap();
        assert_eq!(event, Event::ConnectionKeepAlive);
        assert!(matches!(session.state, State::Ehlo(_)));

        session.ingest(b"MAIL FROM:<a@x.com>\n").await.unwrap();
        session.ingest(b"RCPT TO:<b@y.com>\n").await.unwrap();
        session.ingest(b"DATA\n").await.unwrap();
        let event = session.ingest(b"body\n.\n").await.unwrap();
        assert_eq!(event, Event::ConnectionKeepAlive);
        assert_eq!(queue.count(postrider_spool::INBOUND).await, 1);
    }

    #[tokio::test]
    async fn pipelined_data_after_command() {
        let queue = Arc::new(TestQueue::new());
        let mut session = session(config().with_queue(Some(queue.clone())));

        greet(&mut session).await;
        session.handle_command(b"MAIL FROM:<a@x.com>").await;
        session.handle_command(b"RCPT TO:<b@y.com>").await;

        // DATA and the body arrive in one chunk
        let event = session
            .ingest(b"DATA\r\nbody\r\n.\r\n")
            .await
            .unwrap();
        assert_eq!(event, Event::ConnectionKeepAlive);
        assert_eq!(queue.count(postrider_spool::INBOUND).await, 1);
    }

    #[tokio::test]
    async fn rejected_recipient() {
        let mut session = session(config().with_validator(Arc::new(RejectingValidator)));
        greet(&mut session).await;
        session.handle_command(b"MAIL FROM:<a@x.com>").await;

        let (replies, event) = session.handle_command(b"RCPT TO:<bad@y.com>").await;
        assert_eq!(event, Event::ConnectionKeepAlive);
        assert!(replies[0].starts_with("550 "));
        assert_eq!(session.envelope.recipient_count(), 0);

        let (replies, _) = session.handle_command(b"RCPT TO:<good@y.com>").await;
        assert!(replies[0].starts_with("250 "));
        assert_eq!(session.envelope.recipient_count(), 1);
    }

    #[tokio::test]
    async fn vrfy_consults_validator() {
        let mut session = session(config().with_validator(Arc::new(RejectingValidator)));
        greet(&mut session).await;

        let (replies, _) = session.handle_command(b"VRFY good@y.com").await;
        assert!(replies[0].starts_with("250 "));

        let (replies, _) = session.handle_command(b"VRFY bad@y.com").await;
        assert!(replies[0].starts_with("550 "));
    }

    #[tokio::test]
    async fn unsupported_verbs_get_502() {
        let mut session = session(config());
        greet(&mut session).await;

        for verb in ["EXPN a", "HELP", "TURN", "ETRN node"] {
            let (replies, event) = session.handle_command(verb.as_bytes()).await;
            assert_eq!(event, Event::ConnectionKeepAlive, "{verb}");
            assert!(replies[0].starts_with("502 "), "{verb} -> {}", replies[0]);
        }
    }

    #[tokio::test]
    async fn starttls_without_tls_config() {
        let mut session = session(config());
        greet(&mut session).await;

        let (replies, event) = session.handle_command(b"STARTTLS").await;
        assert_eq!(event, Event::ConnectionKeepAlive);
        assert!(replies[0].starts_with("502 "));
    }

    #[tokio::test]
    async fn xforward_records_upstream_client() {
        let mut session = session(config().with_extensions(vec![Extension::XForward]));
        greet(&mut session).await;

        let (replies, event) = session
            .handle_command(b"XFORWARD NAME=orig.example.com ADDR=192.0.2.9 IDENT=[UNAVAILABLE]")
            .await;
        assert_eq!(event, Event::ConnectionKeepAlive);
        assert!(replies[0].starts_with("250 "));
        assert_eq!(
            session.envelope.xforward.get("NAME").map(String::as_str),
            Some("orig.example.com")
        );
        // Placeholder attributes are not recorded
        assert!(!session.envelope.xforward.contains_key("IDENT"));
    }

    #[tokio::test]
    async fn xforward_not_offered() {
        let mut session = session(config());
        greet(&mut session).await;

        let (replies, _) = session.handle_command(b"XFORWARD NAME=a").await;
        assert!(replies[0].starts_with("502 "));
    }

    #[tokio::test]
    async fn xclient_restarts_session() {
        let mut session = session(config().with_extensions(vec![Extension::XClient]));
        greet(&mut session).await;

        let (replies, event) = session
            .handle_command(b"XCLIENT NAME=spike.porcupine.org ADDR=168.100.189.2 HELO=spike")
            .await;
        assert_eq!(event, Event::ConnectionKeepAlive);
        assert!(replies[0].starts_with("220 "));
        assert!(matches!(session.state, State::Connect(_)));
        assert_eq!(
            session.envelope.xclient.get("ADDR").map(String::as_str),
            Some("168.100.189.2")
        );
        assert_eq!(session.envelope.helo_host.as_deref(), Some("spike"));
    }

    #[tokio::test]
    async fn xclient_mid_transaction_closes() {
        let mut session = session(config().with_extensions(vec![Extension::XClient]));
        greet(&mut session).await;
        session.handle_command(b"MAIL FROM:<a@x.com>").await;

        let (replies, event) = session.handle_command(b"XCLIENT NAME=a").await;
        assert_eq!(event, Event::ConnectionClose);
        assert!(replies[0].starts_with("503 "));
    }

    #[tokio::test]
    async fn rset_abandons_transaction() {
        let mut session = session(config());
        greet(&mut session).await;
        session.handle_command(b"MAIL FROM:<a@x.com>").await;
        session.handle_command(b"RCPT TO:<b@y.com>").await;

        let (replies, _) = session.handle_command(b"RSET").await;
        assert!(replies[0].starts_with("250 "));
        assert!(matches!(session.state, State::Ehlo(_)));
        assert_eq!(session.envelope.recipient_count(), 0);

        // DATA now has no transaction to complete
        let (replies, event) = session.handle_command(b"DATA").await;
        assert_eq!(event, Event::ConnectionClose);
        assert!(replies[0].starts_with("503 "));
    }

    #[tokio::test]
    async fn noop_before_greeting_closes() {
        let mut session = session(config());

        let (replies, event) = session.handle_command(b"NOOP").await;
        assert_eq!(event, Event::ConnectionClose);
        assert!(replies[0].starts_with("503 "));
    }

    #[tokio::test]
    async fn rset_before_greeting_closes() {
        let mut session = session(config());

        let (replies, event) = session.handle_command(b"RSET").await;
        assert_eq!(event, Event::ConnectionClose);
        assert!(replies[0].starts_with("503 "));
    }

    #[tokio::test]
    async fn noop_after_greeting_is_ok() {
        let mut session = session(config());
        greet(&mut session).await;

        let (replies, event) = session.handle_command(b"NOOP").await;
        assert_eq!(event, Event::ConnectionKeepAlive);
        assert!(replies[0].starts_with("250 "));
        assert!(matches!(session.state, State::Ehlo(_)));
    }

    #[tokio::test]
    async fn quit_says_goodbye() {
        let mut session = session(config());

        let (replies, event) = session.handle_command(b"QUIT").await;
        assert_eq!(event, Event::ConnectionClose);
        assert!(replies[0].starts_with("221 "));
    }
}
