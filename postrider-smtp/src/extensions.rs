use core::fmt::{self, Display};

use serde::Deserialize;

use crate::session::TlsContext;

/// Protocol extensions advertised in the EHLO response.
#[derive(Debug, Deserialize, Clone)]
#[serde(rename_all = "lowercase")]
pub enum Extension {
    /// STARTTLS extension (RFC 3207), allows upgrading the connection to TLS.
    Starttls(TlsContext),

    /// SIZE extension (RFC 1870), message size declaration and enforcement.
    ///
    /// The server advertises its maximum message size as `SIZE <max_bytes>`
    /// and validates at two points: the SIZE parameter on MAIL FROM, and the
    /// actual byte count while reading message data. Both reject with 552.
    /// A value of 0 advertises no limit.
    Size(usize),

    /// 8BITMIME extension (RFC 6152).
    #[serde(rename = "8bitmime")]
    EightBitMime,

    /// XCLIENT extension (Postfix), lets a trusted upstream proxy replace
    /// the session's notion of the connecting client.
    XClient,

    /// XFORWARD extension (Postfix), lets a trusted upstream relay record
    /// the original client's identity on the envelope.
    XForward,
}

impl Display for Extension {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> Result<(), fmt::Error> {
        match self {
            Self::Starttls(_) => fmt.write_str("STARTTLS"),
            Self::Size(max) => {
                if *max == 0 {
                    fmt.write_str("SIZE")
                } else {
                    write!(fmt, "SIZE {max}")
                }
            }
            Self::EightBitMime => fmt.write_str("8BITMIME"),
            Self::XClient => fmt.write_str("XCLIENT NAME ADDR PROTO HELO"),
            Self::XForward => fmt.write_str("XFORWARD NAME ADDR PORT PROTO HELO IDENT SOURCE"),
        }
    }
}
