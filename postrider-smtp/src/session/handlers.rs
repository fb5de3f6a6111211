use mailparse::{MailAddr, MailAddrList};
use postrider_common::{incoming, internal, status::Status};
use tokio::io::{AsyncRead, AsyncWrite};

use super::{Event, Reply, Session};
use crate::{
    State,
    command::{Command, HeloVariant, MailParameters},
    extensions::Extension,
    state,
};

/// Postfix's placeholder for attributes the upstream could not determine.
const UNAVAILABLE: &str = "[UNAVAILABLE]";

impl<Stream: AsyncRead + AsyncWrite + Unpin + Send + Sync> Session<Stream> {
    /// Parse one command line and produce the reply for it, updating the
    /// session state and envelope along the way.
    pub(super) async fn handle_command(&mut self, raw: &[u8]) -> Reply {
        let command = Command::try_from(raw).unwrap_or_else(|e| e);

        incoming!("{command}");

        match command {
            Command::Invalid(_) => (
                vec![format!(
                    "{} Syntax error, command unrecognized",
                    Status::SyntaxError
                )],
                Event::ConnectionKeepAlive,
            ),
            Command::Malformed(reason) => (
                vec![format!("{} {reason}", Status::ParameterError)],
                Event::ConnectionKeepAlive,
            ),
            Command::Unsupported(verb) => (
                vec![format!(
                    "{} Command {verb} not implemented",
                    Status::NotImplemented
                )],
                Event::ConnectionKeepAlive,
            ),
            // NOOP and RSET only mean something after a greeting
            Command::Noop if self.state.greeted() => (
                vec![format!("{} Ok", Status::Ok)],
                Event::ConnectionKeepAlive,
            ),
            Command::Noop => self.sequence_error(),
            Command::Rset if self.state.greeted() => {
                self.envelope.reset_transaction();
                self.message.clear();
                self.state = std::mem::take(&mut self.state).reset();
                (
                    vec![format!("{} Ok", Status::Ok)],
                    Event::ConnectionKeepAlive,
                )
            }
            Command::Rset => self.sequence_error(),
            Command::Vrfy(mailbox) => {
                if self.validator.validate(&mailbox).await {
                    (
                        vec![format!("{} {mailbox}", Status::Ok)],
                        Event::ConnectionKeepAlive,
                    )
                } else {
                    (
                        vec![format!("{} Mailbox {mailbox} unavailable", Status::Error)],
                        Event::ConnectionKeepAlive,
                    )
                }
            }
            Command::Quit => {
                self.state = std::mem::take(&mut self.state)
                    .transition(Command::Quit, &mut self.envelope);
                (
                    vec![format!("{} Bye", Status::GoodBye)],
                    Event::ConnectionClose,
                )
            }
            Command::Helo(variant) => self.handle_helo(variant).await,
            Command::MailFrom(sender, params) => self.handle_mail(sender, params).await,
            Command::RcptTo(recipients) => self.handle_rcpt(recipients).await,
            Command::Data => {
                self.state =
                    std::mem::take(&mut self.state).transition(Command::Data, &mut self.envelope);

                if matches!(self.state, State::Reading(_)) {
                    (
                        vec![format!(
                            "{} End data with <CR><LF>.<CR><LF>",
                            Status::StartMailInput
                        )],
                        Event::ConnectionKeepAlive,
                    )
                } else {
                    self.sequence_error()
                }
            }
            Command::StartTls => self.handle_starttls(),
            Command::XForward(attrs) => self.handle_xforward(attrs),
            Command::XClient(attrs) => self.handle_xclient(attrs),
        }
    }

    async fn handle_helo(&mut self, variant: HeloVariant) -> Reply {
        let host = variant.host().to_string();

        if !self.resolver.resolves(&host).await {
            self.state = State::Reject(state::Reject);
            return (
                vec![format!(
                    "{} Cannot resolve hostname {host}",
                    Status::ParameterNotImplemented
                )],
                Event::ConnectionClose,
            );
        }

        self.state =
            std::mem::take(&mut self.state).transition(Command::Helo(variant), &mut self.envelope);

        match &self.state {
            State::Ehlo(_) => (self.ehlo_reply(&host), Event::ConnectionKeepAlive),
            State::Helo(_) => (
                vec![format!(
                    "{} {} says hello to {host}",
                    Status::Ok,
                    self.banner
                )],
                Event::ConnectionKeepAlive,
            ),
            _ => self.sequence_error(),
        }
    }

    /// The multiline EHLO greeting: banner first, one line per extension.
    fn ehlo_reply(&self, host: &str) -> Vec<String> {
        let mut lines = vec![format!("{} says hello to {host}", self.banner)];

        for extension in &self.extensions {
            // RFC 3207: STARTTLS must not be offered inside TLS
            if matches!(extension, Extension::Starttls(_)) && self.connection.is_tls() {
                continue;
            }
            lines.push(extension.to_string());
        }

        let last = lines.len() - 1;
        lines
            .into_iter()
            .enumerate()
            .map(|(idx, line)| {
                if idx == last {
                    format!("{} {line}", Status::Ok)
                } else {
                    format!("{}-{line}", Status::Ok)
                }
            })
            .collect()
    }

    async fn handle_mail(
        &mut self,
        sender: Option<MailAddr>,
        params: MailParameters,
    ) -> Reply {
        if self.backpressure_engaged() {
            self.state = State::Reject(state::Reject);
            return (
                vec![format!(
                    "{} Insufficient system storage",
                    Status::InsufficientStorage
                )],
                Event::ConnectionClose,
            );
        }

        // RFC 1870: reject the declared size up front, before any data
        if self.max_message_size > 0
            && let Some(declared) = params.size()
            && declared > self.max_message_size
        {
            return (
                vec![format!(
                    "{} Declared message size {declared} bytes exceeds maximum allowed size {} bytes",
                    Status::ExceededStorage,
                    self.max_message_size
                )],
                Event::ConnectionKeepAlive,
            );
        }

        if let Some(MailAddr::Single(single)) = sender.as_ref()
            && !self.validator.validate(&single.addr).await
        {
            return (
                vec![format!(
                    "{} Sender address {} rejected",
                    Status::Error,
                    single.addr
                )],
                Event::ConnectionKeepAlive,
            );
        }

        self.state = std::mem::take(&mut self.state)
            .transition(Command::MailFrom(sender, params), &mut self.envelope);

        if matches!(self.state, State::MailFrom(_)) {
            (
                vec![format!("{} Ok", Status::Ok)],
                Event::ConnectionKeepAlive,
            )
        } else {
            self.sequence_error()
        }
    }

    async fn handle_rcpt(&mut self, recipients: MailAddrList) -> Reply {
        if self.backpressure_engaged() {
            self.state = State::Reject(state::Reject);
            return (
                vec![format!(
                    "{} Insufficient system storage",
                    Status::InsufficientStorage
                )],
                Event::ConnectionClose,
            );
        }

        for mailbox in mailboxes(&recipients) {
            if !self.validator.validate(&mailbox).await {
                return (
                    vec![format!(
                        "{} Recipient address {mailbox} rejected",
                        Status::Error
                    )],
                    Event::ConnectionKeepAlive,
                );
            }
        }

        self.state = std::mem::take(&mut self.state)
            .transition(Command::RcptTo(recipients), &mut self.envelope);

        if matches!(self.state, State::RcptTo(_)) {
            (
                vec![format!("{} Ok", Status::Ok)],
                Event::ConnectionKeepAlive,
            )
        } else {
            self.sequence_error()
        }
    }

    fn handle_starttls(&mut self) -> Reply {
        if self.connection.is_tls() {
            self.state = State::Invalid(state::Invalid {
                reason: "TLS already active".to_string(),
            });
            return self.sequence_error();
        }

        if self.tls_context.is_none() {
            return (
                vec![format!(
                    "{} Command STARTTLS not implemented",
                    Status::NotImplemented
                )],
                Event::ConnectionKeepAlive,
            );
        }

        self.state =
            std::mem::take(&mut self.state).transition(Command::StartTls, &mut self.envelope);

        if matches!(self.state, State::StartTls(_)) {
            (
                vec![format!("{} Ready to begin TLS", Status::ServiceReady)],
                Event::UpgradeTls,
            )
        } else {
            self.sequence_error()
        }
    }

    fn handle_xforward(&mut self, attrs: Vec<(String, String)>) -> Reply {
        if !self
            .extensions
            .iter()
            .any(|e| matches!(e, Extension::XForward))
        {
            return (
                vec![format!(
                    "{} Command XFORWARD not implemented",
                    Status::NotImplemented
                )],
                Event::ConnectionKeepAlive,
            );
        }

        if self.state.in_transaction() {
            self.state = State::Invalid(state::Invalid {
                reason: "XFORWARD not allowed during mail transaction".to_string(),
            });
            return self.sequence_error();
        }

        for (name, value) in attrs {
            if value != UNAVAILABLE {
                self.envelope.xforward.insert(name, value);
            }
        }

        (
            vec![format!("{} Ok", Status::Ok)],
            Event::ConnectionKeepAlive,
        )
    }

    /// XCLIENT replaces the session's notion of the connecting client and
    /// restarts the exchange with a fresh greeting banner.
    fn handle_xclient(&mut self, attrs: Vec<(String, String)>) -> Reply {
        if !self
            .extensions
            .iter()
            .any(|e| matches!(e, Extension::XClient))
        {
            return (
                vec![format!(
                    "{} Command XCLIENT not implemented",
                    Status::NotImplemented
                )],
                Event::ConnectionKeepAlive,
            );
        }

        if self.state.in_transaction() {
            self.state = State::Invalid(state::Invalid {
                reason: "XCLIENT not allowed during mail transaction".to_string(),
            });
            return self.sequence_error();
        }

        self.envelope.reset_session();

        for (name, value) in attrs {
            if value == UNAVAILABLE {
                continue;
            }
            if name == "HELO" {
                self.envelope.helo_host = Some(value.clone());
            }
            self.envelope.xclient.insert(name, value);
        }

        self.state = State::default();

        (
            vec![format!("{} {} ESMTP", Status::ServiceReady, self.banner)],
            Event::ConnectionKeepAlive,
        )
    }

    /// Hand the completed message to the queue and return to the greeted
    /// state for the next transaction.
    pub(super) async fn finish_message(&mut self) -> Reply {
        let message = std::mem::take(&mut self.message);
        self.envelope.data_len = message.len();

        let reply = if let Some(queue) = self.queue.as_ref() {
            match queue
                .enqueue(postrider_spool::INBOUND, &self.envelope, &message)
                .await
            {
                Ok(()) => format!("{} Ok: queued {} bytes", Status::Ok, message.len()),
                Err(err) => {
                    internal!(level = ERROR, "Failed to enqueue message: {err}");
                    format!(
                        "{} Requested action aborted, try again later",
                        Status::ActionUnavailable
                    )
                }
            }
        } else {
            format!("{} Ok", Status::Ok)
        };

        self.envelope.reset_transaction();
        self.state = std::mem::take(&mut self.state).finish_data();

        (vec![reply], Event::ConnectionKeepAlive)
    }

    fn backpressure_engaged(&self) -> bool {
        self.backpressure
            .as_ref()
            .is_some_and(|signal| signal.engaged())
    }

    /// A 503 reply; sequence violations terminate the session.
    fn sequence_error(&mut self) -> Reply {
        let reason = match &self.state {
            State::Invalid(invalid) => invalid.reason.clone(),
            other => format!("Invalid command sequence from {other}"),
        };

        (
            vec![format!("{} {reason}", Status::InvalidCommandSequence)],
            Event::ConnectionClose,
        )
    }
}

/// Flattens an address list into bare mailbox strings.
fn mailboxes(list: &MailAddrList) -> Vec<String> {
    let mut out = Vec::new();
    for addr in list.iter() {
        match addr {
            MailAddr::Single(single) => out.push(single.addr.clone()),
            MailAddr::Group(group) => {
                out.extend(group.addrs.iter().map(|single| single.addr.clone()));
            }
        }
    }
    out
}
