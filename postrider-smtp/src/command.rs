use core::fmt::{self, Display, Formatter};
use std::borrow::Cow;

use ahash::AHashMap;
use mailparse::{MailAddr, MailAddrList};
use phf::{phf_map, phf_set};
use postrider_common::xtext;

/// ESMTP parameters for the MAIL FROM command (RFC 5321 Section 3.3).
///
/// Common parameters include:
/// - SIZE: Message size in bytes (RFC 1870)
/// - BODY: 7BIT or 8BITMIME (RFC 6152)
/// - RET / ENVID: DSN (RFC 3461)
/// - SMTPUTF8: UTF-8 support (RFC 6531)
#[derive(PartialEq, Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct MailParameters {
    params: AHashMap<Cow<'static, str>, Option<String>>,
}

/// Perfect hash map of known ESMTP parameters for O(1) lookup
static KNOWN_PARAMS: phf::Map<&'static str, &'static str> = phf_map! {
    "SIZE" => "SIZE",
    "BODY" => "BODY",
    "AUTH" => "AUTH",
    "RET" => "RET",
    "ENVID" => "ENVID",
    "SMTPUTF8" => "SMTPUTF8",
};

/// Attributes a peer may set via XFORWARD (Postfix forwarding extension).
static XFORWARD_ATTRS: phf::Set<&'static str> = phf_set! {
    "NAME", "ADDR", "PORT", "PROTO", "HELO", "IDENT", "SOURCE",
};

/// Attributes a peer may set via XCLIENT (Postfix client override extension).
static XCLIENT_ATTRS: phf::Set<&'static str> = phf_set! {
    "NAME", "ADDR", "PROTO", "HELO",
};

/// Verbs we recognise but do not implement (RFC 5321 Section 4.2.4).
static UNSUPPORTED_VERBS: phf::Set<&'static str> = phf_set! {
    "EXPN", "SAML", "SOML", "SEND", "HELP", "TURN", "ETRN",
};

/// Normalize a parameter key, reusing static strings for known parameters.
fn normalize_key(key: &str) -> Cow<'static, str> {
    let upper = key.to_ascii_uppercase();

    KNOWN_PARAMS
        .get(&upper)
        .map_or(Cow::Owned(upper), |&s| Cow::Borrowed(s))
}

impl MailParameters {
    #[must_use]
    pub fn new() -> Self {
        Self {
            params: AHashMap::new(),
        }
    }

    /// Parses ESMTP parameter tokens in the form `KEY=VALUE` or `FLAG`.
    /// Keys are normalized to uppercase for case-insensitive matching.
    ///
    /// # Errors
    ///
    /// Returns an error if a parameter appears multiple times, or if the
    /// SIZE parameter has a non-numeric or zero value.
    pub fn from_params_str(params_str: &str) -> Result<Self, String> {
        let mut params = Self::new();

        for token in params_str.split_whitespace() {
            let (key, value) = token
                .split_once('=')
                .map_or((token, None), |(k, v)| (k, Some(v)));

            let key = normalize_key(key);
            if params.params.contains_key(&key) {
                return Err(format!("Duplicate parameter '{key}' not allowed"));
            }

            if key == "SIZE" {
                match value.and_then(|v| v.parse::<usize>().ok()) {
                    Some(0) => return Err(String::from("SIZE=0 is not allowed")),
                    Some(_) => {}
                    None => {
                        return Err(format!(
                            "Invalid SIZE value: {}",
                            value.unwrap_or_default()
                        ));
                    }
                }
            }

            params.params.insert(key, value.map(str::to_string));
        }

        Ok(params)
    }

    /// Adds a parameter with a value.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        self.params.insert(normalize_key(&key), Some(value.into()));
    }

    /// Gets a parameter value by key (case-insensitive).
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.params.get(normalize_key(key).as_ref())?.as_deref()
    }

    /// Checks if a parameter exists (case-insensitive).
    #[must_use]
    pub fn has(&self, key: &str) -> bool {
        self.params.contains_key(normalize_key(key).as_ref())
    }

    /// Gets the SIZE parameter value, if present.
    #[must_use]
    pub fn size(&self) -> Option<usize> {
        self.get("SIZE")?.parse().ok()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }
}

impl Display for MailParameters {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (k, v) in &self.params {
            if !first {
                f.write_str(" ")?;
            }
            first = false;

            match v {
                None => f.write_str(k)?,
                Some(val) => write!(f, "{k}={val}")?,
            }
        }
        Ok(())
    }
}

#[derive(PartialEq, PartialOrd, Eq, Hash, Debug)]
pub enum HeloVariant {
    Ehlo(String),
    Helo(String),
}

impl HeloVariant {
    #[must_use]
    pub fn host(&self) -> &str {
        match self {
            Self::Ehlo(host) | Self::Helo(host) => host,
        }
    }
}

impl Display for HeloVariant {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Ehlo(_) => "EHLO",
            Self::Helo(_) => "HELO",
        })
    }
}

#[derive(PartialEq, Debug)]
pub enum Command {
    Helo(HeloVariant),
    /// A `None` sender is the null reverse-path from
    /// [RFC-5321](https://www.ietf.org/rfc/rfc5321.txt). The second field
    /// carries the ESMTP parameters.
    MailFrom(Option<MailAddr>, MailParameters),
    RcptTo(MailAddrList),
    Data,
    Rset,
    Noop,
    Quit,
    Vrfy(String),
    StartTls,
    /// XFORWARD attributes, names uppercased and values xtext-decoded.
    XForward(Vec<(String, String)>),
    /// XCLIENT attributes, names uppercased and values xtext-decoded.
    XClient(Vec<(String, String)>),
    /// A verb we recognise but deliberately do not serve.
    Unsupported(String),
    /// Unparseable input, answered with a 500.
    Invalid(String),
    /// Recognised verb with bad arguments, answered with a 501.
    Malformed(String),
}

/// Parses `NAME=VALUE` attribute pairs for XFORWARD/XCLIENT, checking each
/// name against the verb's allow-list and xtext-decoding each value.
fn parse_attributes(
    verb: &'static str,
    allowed: &phf::Set<&'static str>,
    rest: &str,
) -> Result<Vec<(String, String)>, Command> {
    let mut attrs = Vec::new();

    for token in rest.split_whitespace() {
        let Some((name, value)) = token.split_once('=') else {
            return Err(Command::Malformed(format!(
                "{verb} attribute '{token}' is not NAME=VALUE"
            )));
        };

        let name = name.to_ascii_uppercase();
        if !allowed.contains(name.as_str()) {
            return Err(Command::Malformed(format!(
                "{verb} attribute '{name}' not supported"
            )));
        }

        attrs.push((name, xtext::decode(value)));
    }

    if attrs.is_empty() {
        return Err(Command::Malformed(format!("{verb} requires attributes")));
    }

    Ok(attrs)
}

impl Command {
    #[must_use]
    pub fn inner(&self) -> Cow<'_, str> {
        match self {
            Self::MailFrom(from, _) => from.as_ref().map_or_else(
                || Cow::Borrowed(""),
                |f| match f {
                    MailAddr::Group(_) => Cow::Borrowed(""),
                    MailAddr::Single(s) => Cow::Owned(s.to_string()),
                },
            ),
            Self::RcptTo(to) => Cow::Owned(to.to_string()),
            Self::Vrfy(mailbox) => Cow::Borrowed(mailbox.as_str()),
            Self::Unsupported(verb) => Cow::Borrowed(verb.as_str()),
            Self::Invalid(command) | Self::Malformed(command) => Cow::Borrowed(command.as_str()),
            Self::Helo(HeloVariant::Ehlo(id) | HeloVariant::Helo(id)) => Cow::Borrowed(id.as_str()),
            _ => Cow::Borrowed(""),
        }
    }

    /// The SIZE parameter from a MAIL FROM command, if present (RFC 1870).
    #[must_use]
    pub fn size(&self) -> Option<usize> {
        match self {
            Self::MailFrom(_, params) => params.size(),
            _ => None,
        }
    }
}

impl Display for Command {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::Helo(v) => fmt.write_fmt(format_args!("{} {}", v, self.inner())),
            Self::MailFrom(s, params) => {
                let addr = s.as_ref().map_or_else(String::new, |f| match f {
                    MailAddr::Group(_) => String::new(),
                    MailAddr::Single(s) => s.to_string(),
                });
                if params.is_empty() {
                    fmt.write_fmt(format_args!("MAIL FROM:{addr}"))
                } else {
                    fmt.write_fmt(format_args!("MAIL FROM:{addr} {params}"))
                }
            }
            Self::RcptTo(rcpt) => fmt.write_fmt(format_args!("RCPT TO:{rcpt}")),
            Self::Data => fmt.write_str("DATA"),
            Self::Rset => fmt.write_str("RSET"),
            Self::Noop => fmt.write_str("NOOP"),
            Self::Quit => fmt.write_str("QUIT"),
            Self::Vrfy(mailbox) => fmt.write_fmt(format_args!("VRFY {mailbox}")),
            Self::StartTls => fmt.write_str("STARTTLS"),
            Self::XForward(attrs) | Self::XClient(attrs) => {
                fmt.write_str(if matches!(self, Self::XForward(_)) {
                    "XFORWARD"
                } else {
                    "XCLIENT"
                })?;
                for (name, value) in attrs {
                    fmt.write_fmt(format_args!(" {name}={value}"))?;
                }
                Ok(())
            }
            Self::Unsupported(verb) => fmt.write_str(verb),
            Self::Invalid(s) | Self::Malformed(s) => fmt.write_str(s),
        }
    }
}

impl TryFrom<&str> for Command {
    type Error = Self;

    fn try_from(command: &str) -> Result<Self, Self::Error> {
        let trimmed = command.trim();

        // Case-insensitive prefix matching without allocating for the verb.
        // Matching on bytes keeps arbitrary (multibyte) input from landing a
        // slice on a non-character boundary; once an ASCII prefix has
        // matched, slicing the str past it is boundary-safe.
        fn verb_is(line: &str, verb: &[u8]) -> bool {
            line.len() >= verb.len() && line.as_bytes()[..verb.len()].eq_ignore_ascii_case(verb)
        }

        if verb_is(trimmed, b"MAIL FROM:") {
            if trimmed.len() < 11 {
                return Err(Self::Malformed(command.to_owned()));
            }

            // Format: MAIL FROM:<addr> [param1=value1] [param2=value2] ...
            let rest = trimmed[10..].trim();
            let (addr, params) = rest
                .split_once(char::is_whitespace)
                .map_or((rest, None), |(a, p)| (a, Some(p)));

            let mail_params = match params {
                Some(params) => MailParameters::from_params_str(params).map_err(Self::Malformed)?,
                None => MailParameters::new(),
            };

            // mailparse does not accept the null reverse-path itself
            if addr == "<>" {
                return Ok(Self::MailFrom(None, mail_params));
            }

            mailparse::addrparse(addr).map_or_else(
                |err| Err(Self::Malformed(err.to_string())),
                |from| {
                    Ok(Self::MailFrom(
                        if from.is_empty() {
                            None
                        } else {
                            Some(from[0].clone())
                        },
                        mail_params,
                    ))
                },
            )
        } else if verb_is(trimmed, b"RCPT TO:") {
            if trimmed.len() < 9 {
                return Err(Self::Malformed(command.to_owned()));
            }

            mailparse::addrparse(trimmed[8..].trim()).map_or_else(
                |e| Err(Self::Malformed(e.to_string())),
                |to| Ok(Self::RcptTo(to)),
            )
        } else if verb_is(trimmed, b"XFORWARD") {
            parse_attributes("XFORWARD", &XFORWARD_ATTRS, &trimmed[8..])
                .map_or_else(Err, |attrs| Ok(Self::XForward(attrs)))
        } else if verb_is(trimmed, b"XCLIENT") {
            parse_attributes("XCLIENT", &XCLIENT_ATTRS, &trimmed[7..])
                .map_or_else(Err, |attrs| Ok(Self::XClient(attrs)))
        } else if trimmed.len() >= 4 {
            if verb_is(trimmed, b"EHLO") || verb_is(trimmed, b"HELO") {
                match trimmed.split_once(' ') {
                    None => Err(Self::Malformed(format!("Expected hostname in {trimmed}"))),
                    Some((cmd, host)) if cmd.eq_ignore_ascii_case("HELO") => {
                        Ok(Self::Helo(HeloVariant::Helo(host.trim().to_string())))
                    }
                    Some((_, host)) => Ok(Self::Helo(HeloVariant::Ehlo(host.trim().to_string()))),
                }
            } else if verb_is(trimmed, b"VRFY") {
                match trimmed.split_once(' ') {
                    None => Err(Self::Malformed(format!("Expected mailbox in {trimmed}"))),
                    Some((_, mailbox)) => Ok(Self::Vrfy(mailbox.trim().to_string())),
                }
            } else if trimmed.eq_ignore_ascii_case("DATA") {
                Ok(Self::Data)
            } else if trimmed.eq_ignore_ascii_case("QUIT") {
                Ok(Self::Quit)
            } else if verb_is(trimmed, b"STARTTLS") {
                Ok(Self::StartTls)
            } else if trimmed.eq_ignore_ascii_case("RSET") {
                Ok(Self::Rset)
            } else if verb_is(trimmed, b"NOOP") {
                Ok(Self::Noop)
            } else {
                let verb = trimmed
                    .split_whitespace()
                    .next()
                    .unwrap_or(trimmed)
                    .to_ascii_uppercase();
                if UNSUPPORTED_VERBS.contains(verb.as_str()) {
                    Ok(Self::Unsupported(verb))
                } else {
                    Err(Self::Invalid(command.to_owned()))
                }
            }
        } else {
            Err(Self::Invalid(command.to_owned()))
        }
    }
}

impl TryFrom<&[u8]> for Command {
    type Error = Self;

    fn try_from(command: &[u8]) -> Result<Self, Self::Error> {
        std::str::from_utf8(command).map_or_else(
            |_| Err(Self::Invalid("Unable to interpret command".to_string())),
            Self::try_from,
        )
    }
}

impl TryFrom<String> for Command {
    type Error = Self;

    fn try_from(command: String) -> Result<Self, Self::Error> {
        Self::try_from(command.as_str())
    }
}
