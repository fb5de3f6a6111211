//! SMTP response parsing and representation.

use super::error::{ClientError, Result};

/// Represents a single line in an SMTP response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseLine {
    /// The SMTP status code (e.g., 220, 250, 550).
    pub code: u16,
    /// Whether this is the last line in a multi-line response.
    pub is_last: bool,
    /// The message text following the status code.
    pub message: String,
}

/// Represents a complete SMTP response, which may be multi-line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    /// The SMTP status code.
    pub code: u16,
    /// All message lines in the response.
    pub lines: Vec<String>,
}

impl Response {
    /// Creates a new `Response`.
    #[must_use]
    pub const fn new(code: u16, lines: Vec<String>) -> Self {
        Self { code, lines }
    }

    /// The complete message with lines joined by newlines.
    #[must_use]
    pub fn message(&self) -> String {
        self.lines.join("\n")
    }

    /// Returns `true` if this response indicates success (2xx code).
    #[must_use]
    pub const fn is_success(&self) -> bool {
        self.code >= 200 && self.code < 300
    }

    /// Returns `true` if this response indicates a temporary error (4xx code).
    #[must_use]
    pub const fn is_temporary_error(&self) -> bool {
        self.code >= 400 && self.code < 500
    }

    /// Returns `true` if this response indicates a permanent error (5xx code).
    #[must_use]
    pub const fn is_permanent_error(&self) -> bool {
        self.code >= 500 && self.code < 600
    }

    /// Returns `true` if this response indicates any error (4xx or 5xx code).
    #[must_use]
    pub const fn is_error(&self) -> bool {
        self.is_temporary_error() || self.is_permanent_error()
    }

    /// Parses a single response line: a three digit code, then either a
    /// space (final line) or a hyphen (continuation line).
    ///
    /// # Errors
    ///
    /// Returns `ClientError::ParseError` if the line doesn't match SMTP format.
    pub fn parse_line(line: &str) -> Result<ResponseLine> {
        if line.len() < 3 {
            return Err(ClientError::ParseError(format!(
                "Response line too short: '{line}'"
            )));
        }

        // `get` instead of indexing: a multibyte character straddling the
        // cut would otherwise panic on the slice.
        let code = line
            .get(..3)
            .and_then(|code_str| code_str.parse::<u16>().ok())
            .ok_or_else(|| ClientError::ParseError(format!("Invalid status code: '{line}'")))?;

        let is_last = match line.chars().nth(3) {
            Some(' ') | None => true,
            Some('-') => false,
            Some(c) => {
                return Err(ClientError::ParseError(format!(
                    "Invalid separator character: '{c}'"
                )));
            }
        };

        let message = line.get(4..).unwrap_or_default().to_string();

        Ok(ResponseLine {
            code,
            is_last,
            message,
        })
    }

    /// Parses a complete, possibly multi-line response from a buffer.
    ///
    /// Returns the parsed `Response` and the number of bytes consumed, or
    /// `None` if the buffer doesn't hold a complete response yet.
    ///
    /// # Errors
    ///
    /// Returns `ClientError::ParseError` if the response is malformed, or if
    /// a continuation line carries a different status code than the first.
    pub fn parse_response(buffer: &[u8]) -> Result<Option<(Self, usize)>> {
        let text = std::str::from_utf8(buffer)?;
        let mut lines = Vec::new();
        let mut consumed = 0;
        let mut first_code = None;

        while let Some(end) = text[consumed..].find('\n') {
            let raw = &text[consumed..consumed + end];
            consumed += end + 1;
            let raw = raw.strip_suffix('\r').unwrap_or(raw);

            if raw.is_empty() {
                continue;
            }

            let line = Self::parse_line(raw)?;

            match first_code {
                Some(code) if line.code != code => {
                    return Err(ClientError::ParseError(format!(
                        "Status code mismatch in multi-line response: expected {code}, got {}",
                        line.code
                    )));
                }
                None => first_code = Some(line.code),
                Some(_) => {}
            }

            lines.push(line.message);

            if line.is_last {
                return Ok(Some((Self::new(line.code, lines), consumed)));
            }
        }

        // Need more data
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_single_line() {
        let line = ResponseLine {
            code: 220,
            is_last: true,
            message: "mail.example.com ESMTP".to_string(),
        };
        assert_eq!(
            Response::parse_line("220 mail.example.com ESMTP").unwrap(),
            line
        );
    }

    #[test]
    fn parse_multi_line_indicator() {
        let line = ResponseLine {
            code: 250,
            is_last: false,
            message: "mail.example.com".to_string(),
        };
        assert_eq!(Response::parse_line("250-mail.example.com").unwrap(), line);
    }

    #[test]
    fn parse_multibyte_garbage_is_an_error() {
        assert!(Response::parse_line("25€ nope").is_err());
        assert!(Response::parse_line("€€€").is_err());
    }

    #[test]
    fn parse_complete_response() {
        let data = b"250 OK\r\n";
        let (response, consumed) = Response::parse_response(data).unwrap().unwrap();
        assert_eq!(response.code, 250);
        assert_eq!(response.lines, vec!["OK"]);
        assert_eq!(consumed, 8);
    }

    #[test]
    fn parse_multi_line_response() {
        let data = b"250-mail.example.com\r\n250-SIZE 10000000\r\n250 8BITMIME\r\n";
        let (response, consumed) = Response::parse_response(data).unwrap().unwrap();
        assert_eq!(response.code, 250);
        assert_eq!(
            response.lines,
            vec!["mail.example.com", "SIZE 10000000", "8BITMIME"]
        );
        assert_eq!(consumed, data.len());
    }

    #[test]
    fn parse_incomplete_response() {
        let data = b"250-mail.example.com\r\n250-SIZE";
        let result = Response::parse_response(data).unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn code_mismatch_is_fatal() {
        let data = b"250-mail.example.com\r\n550 rejected\r\n";
        assert!(Response::parse_response(data).is_err());
    }

    #[test]
    fn classification() {
        let response = Response::new(250, vec!["OK".to_string()]);
        assert!(response.is_success());
        assert!(!response.is_error());

        let response = Response::new(451, vec!["busy".to_string()]);
        assert!(response.is_temporary_error());
        assert!(response.is_error());

        let response = Response::new(550, vec!["Error".to_string()]);
        assert!(response.is_permanent_error());
        assert!(response.is_error());
        assert!(!response.is_success());
    }
}
