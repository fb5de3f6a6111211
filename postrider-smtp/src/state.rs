use core::fmt::{self, Display, Formatter};

use chrono::Utc;
use postrider_common::envelope::Envelope;
use serde::{Deserialize, Serialize};

use crate::command::{Command, HeloVariant};

/// Sealed trait to prevent external state implementations
mod sealed {
    pub trait Sealed {}
}

/// Marker trait for valid session states
pub trait SmtpState: sealed::Sealed + core::fmt::Debug {}

// ============================================================================
// State Definitions
// ============================================================================

/// Initial connection state, also re-entered after a TLS upgrade or XCLIENT
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Connect;

/// After a successful EHLO command (extended SMTP)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ehlo {
    pub id: String,
}

/// After a successful HELO command (basic SMTP)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Helo {
    pub id: String,
}

/// STARTTLS accepted, the session is about to upgrade in place
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartTls;

/// After MAIL FROM (beginning of a mail transaction)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MailFrom {
    pub extended: bool,
    pub id: String,
}

/// After RCPT TO (at least one recipient accepted)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RcptTo {
    pub extended: bool,
    pub id: String,
}

/// Reading message data until the end-of-data marker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reading {
    pub extended: bool,
    pub id: String,
}

/// Client issued QUIT
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Quit;

/// Invalid command sequence
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Invalid {
    pub reason: String,
}

/// Connection rejected by validation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reject;

/// Connection closing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Close;

impl sealed::Sealed for Connect {}
impl sealed::Sealed for Ehlo {}
impl sealed::Sealed for Helo {}
impl sealed::Sealed for StartTls {}
impl sealed::Sealed for MailFrom {}
impl sealed::Sealed for RcptTo {}
impl sealed::Sealed for Reading {}
impl sealed::Sealed for Quit {}
impl sealed::Sealed for Invalid {}
impl sealed::Sealed for Reject {}
impl sealed::Sealed for Close {}

impl SmtpState for Connect {}
impl SmtpState for Ehlo {}
impl SmtpState for Helo {}
impl SmtpState for StartTls {}
impl SmtpState for MailFrom {}
impl SmtpState for RcptTo {}
impl SmtpState for Reading {}
impl SmtpState for Quit {}
impl SmtpState for Invalid {}
impl SmtpState for Reject {}
impl SmtpState for Close {}

// ============================================================================
// State Enum for Dynamic Dispatch
// ============================================================================

/// Type-safe state enum that wraps all possible states
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum State {
    Connect(Connect),
    Ehlo(Ehlo),
    Helo(Helo),
    StartTls(StartTls),
    MailFrom(MailFrom),
    RcptTo(RcptTo),
    Reading(Reading),
    Quit(Quit),
    Invalid(Invalid),
    Reject(Reject),
    Close(Close),
}

impl Default for State {
    fn default() -> Self {
        Self::Connect(Connect)
    }
}

impl Display for State {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> Result<(), fmt::Error> {
        fmt.write_str(match self {
            Self::Reading(_) => "",
            Self::Connect(_) => "Connect",
            Self::Close(_) => "Close",
            Self::Ehlo(_) => "EHLO",
            Self::Helo(_) => "HELO",
            Self::StartTls(_) => "STARTTLS",
            Self::MailFrom(_) => "MAIL",
            Self::RcptTo(_) => "RCPT",
            Self::Quit(_) => "QUIT",
            Self::Invalid(_) => "INVALID",
            Self::Reject(_) => "Rejected",
        })
    }
}

// ============================================================================
// Transition Methods
// ============================================================================

impl State {
    /// Transition from the current state based on a received command.
    ///
    /// This only sequences the verbs that move a transaction forward; verbs
    /// that leave the state alone (NOOP, VRFY, XFORWARD) or that reset it
    /// (RSET, XCLIENT, the TLS upgrade) are handled by the session around it.
    #[must_use]
    pub fn transition(self, command: Command, envelope: &mut Envelope) -> Self {
        match (self, command) {
            (Self::Connect(_), Command::Helo(variant)) => {
                envelope.helo_host = Some(variant.host().to_string());
                envelope.helo_time = Some(Utc::now());

                match variant {
                    HeloVariant::Ehlo(id) => Self::Ehlo(Ehlo { id }),
                    HeloVariant::Helo(id) => Self::Helo(Helo { id }),
                }
            }

            // A repeated EHLO/HELO restarts the exchange
            (Self::Ehlo(_) | Self::Helo(_), Command::Helo(variant)) => {
                envelope.reset_transaction();
                Self::default().transition(Command::Helo(variant), envelope)
            }

            (Self::Ehlo(_), Command::StartTls) => Self::StartTls(StartTls),
            (Self::Helo(_), Command::StartTls) => Self::Invalid(Invalid {
                reason: "STARTTLS requires EHLO".to_string(),
            }),
            (Self::MailFrom(_) | Self::RcptTo(_), Command::StartTls) => Self::Invalid(Invalid {
                reason: "STARTTLS not allowed during mail transaction".to_string(),
            }),

            (Self::Ehlo(Ehlo { id }), Command::MailFrom(sender, params)) => {
                envelope.sender_mut().clone_from(&sender);
                if !params.is_empty() {
                    envelope.sender_options = Some(params.to_string());
                }
                Self::MailFrom(MailFrom { extended: true, id })
            }
            (Self::Helo(Helo { id }), Command::MailFrom(sender, params)) => {
                envelope.sender_mut().clone_from(&sender);
                if !params.is_empty() {
                    envelope.sender_options = Some(params.to_string());
                }
                Self::MailFrom(MailFrom {
                    extended: false,
                    id,
                })
            }

            // Recipient collection accumulates until DATA
            (
                Self::MailFrom(MailFrom { extended, id }) | Self::RcptTo(RcptTo { extended, id }),
                Command::RcptTo(recipients),
            ) => {
                if let Some(rcpts) = envelope.recipients_mut() {
                    rcpts.extend_from_slice(&recipients[..]);
                } else {
                    *envelope.recipients_mut() = Some(recipients);
                }
                Self::RcptTo(RcptTo { extended, id })
            }

            // DATA requires at least one accepted recipient
            (Self::RcptTo(RcptTo { extended, id }), Command::Data) => {
                envelope.data_time = Some(Utc::now());
                Self::Reading(Reading { extended, id })
            }

            (_, Command::Quit) => Self::Quit(Quit),

            (Self::Invalid(state), _) => Self::Invalid(state),
            (state, _) => Self::Invalid(Invalid {
                reason: format!("Invalid command sequence from {state}"),
            }),
        }
    }

    /// The end-of-data marker completes the transaction and returns the
    /// session to the greeted state, ready for the next MAIL FROM.
    #[must_use]
    pub fn finish_data(self) -> Self {
        match self {
            Self::Reading(Reading { extended: true, id }) => Self::Ehlo(Ehlo { id }),
            Self::Reading(Reading {
                extended: false,
                id,
            }) => Self::Helo(Helo { id }),
            state => state,
        }
    }

    /// RSET abandons any transaction in progress and returns to the greeted
    /// state. Before a greeting it is a no-op.
    #[must_use]
    pub fn reset(self) -> Self {
        match self {
            Self::MailFrom(MailFrom { extended: true, id })
            | Self::RcptTo(RcptTo { extended: true, id })
            | Self::Reading(Reading { extended: true, id }) => Self::Ehlo(Ehlo { id }),
            Self::MailFrom(MailFrom {
                extended: false,
                id,
            })
            | Self::RcptTo(RcptTo {
                extended: false,
                id,
            })
            | Self::Reading(Reading {
                extended: false,
                id,
            }) => Self::Helo(Helo { id }),
            state => state,
        }
    }

    /// Check if this state represents an error condition
    #[must_use]
    pub const fn is_error(&self) -> bool {
        matches!(self, Self::Invalid(_) | Self::Reject(_))
    }

    /// Check if this state should close the connection
    #[must_use]
    pub const fn should_close(&self) -> bool {
        matches!(
            self,
            Self::Quit(_) | Self::Close(_) | Self::Reject(_) | Self::Invalid(_)
        )
    }

    /// Check if a mail transaction is in progress
    #[must_use]
    pub const fn in_transaction(&self) -> bool {
        matches!(self, Self::MailFrom(_) | Self::RcptTo(_) | Self::Reading(_))
    }

    /// Check if the peer has completed a HELO or EHLO greeting
    #[must_use]
    pub const fn greeted(&self) -> bool {
        matches!(
            self,
            Self::Ehlo(_) | Self::Helo(_) | Self::MailFrom(_) | Self::RcptTo(_)
        )
    }

    /// Check if the peer has been greeted with EHLO (extended mode)
    #[must_use]
    pub const fn is_extended(&self) -> bool {
        matches!(
            self,
            Self::Ehlo(_)
                | Self::StartTls(_)
                | Self::MailFrom(MailFrom { extended: true, .. })
                | Self::RcptTo(RcptTo { extended: true, .. })
                | Self::Reading(Reading { extended: true, .. })
        )
    }
}

// ============================================================================
// Tests
// ============================================================================
