//! The capability model built from a server's EHLO response.

use super::response::Response;

/// Extensions a server advertised in its EHLO response.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ServerCapabilities {
    /// Advertised maximum message size. `Some(0)` means the server
    /// advertised SIZE without a limit; `None` means SIZE was absent.
    pub size: Option<usize>,
    pub starttls: bool,
    pub eight_bit_mime: bool,
    pub pipelining: bool,
    /// XCLIENT attribute names the server accepts, empty when unsupported.
    pub xclient: Vec<String>,
    /// XFORWARD attribute names the server accepts, empty when unsupported.
    pub xforward: Vec<String>,
}

impl ServerCapabilities {
    /// Builds the capability set from a 250 EHLO response. The first line
    /// is the server greeting and carries no capability.
    #[must_use]
    pub fn from_ehlo(response: &Response) -> Self {
        let mut capabilities = Self::default();

        for line in response.lines.iter().skip(1) {
            let mut words = line.split_whitespace();
            let Some(keyword) = words.next() else {
                continue;
            };

            match keyword.to_ascii_uppercase().as_str() {
                "SIZE" => {
                    capabilities.size =
                        Some(words.next().and_then(|w| w.parse().ok()).unwrap_or(0));
                }
                "STARTTLS" => capabilities.starttls = true,
                "8BITMIME" => capabilities.eight_bit_mime = true,
                "PIPELINING" => capabilities.pipelining = true,
                "XCLIENT" => {
                    capabilities.xclient = words.map(str::to_uppercase).collect();
                }
                "XFORWARD" => {
                    capabilities.xforward = words.map(str::to_uppercase).collect();
                }
                _ => {}
            }
        }

        capabilities
    }

    #[must_use]
    pub fn supports_xclient(&self) -> bool {
        !self.xclient.is_empty()
    }

    #[must_use]
    pub fn supports_xforward(&self) -> bool {
        !self.xforward.is_empty()
    }

    /// Whether a message of `size` bytes fits the advertised limit.
    #[must_use]
    pub fn accepts_size(&self, size: usize) -> bool {
        match self.size {
            Some(max) if max > 0 => size <= max,
            _ => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ehlo(lines: &[&str]) -> Response {
        Response::new(250, lines.iter().map(ToString::to_string).collect())
    }

    #[test]
    fn parses_common_capabilities() {
        let caps = ServerCapabilities::from_ehlo(&ehlo(&[
            "mail.example.com says hello",
            "SIZE 10485760",
            "STARTTLS",
            "8BITMIME",
            "PIPELINING",
        ]));

        assert_eq!(caps.size, Some(10_485_760));
        assert!(caps.starttls);
        assert!(caps.eight_bit_mime);
        assert!(caps.pipelining);
        assert!(!caps.supports_xclient());
    }

    #[test]
    fn parses_vendor_extensions() {
        let caps = ServerCapabilities::from_ehlo(&ehlo(&[
            "relay.example.com",
            "XCLIENT NAME ADDR PROTO HELO",
            "XFORWARD NAME ADDR PORT PROTO",
        ]));

        assert_eq!(caps.xclient, vec!["NAME", "ADDR", "PROTO", "HELO"]);
        assert_eq!(caps.xforward, vec!["NAME", "ADDR", "PORT", "PROTO"]);
        assert!(caps.supports_xclient());
        assert!(caps.supports_xforward());
    }

    #[test]
    fn greeting_line_is_not_a_capability() {
        // A greeting that happens to start with a keyword-looking word
        let caps = ServerCapabilities::from_ehlo(&ehlo(&["STARTTLS.example.com greets you"]));
        assert!(!caps.starttls);
    }

    #[test]
    fn size_limits() {
        let unlimited = ServerCapabilities::from_ehlo(&ehlo(&["x", "SIZE"]));
        assert_eq!(unlimited.size, Some(0));
        assert!(unlimited.accepts_size(usize::MAX));

        let limited = ServerCapabilities::from_ehlo(&ehlo(&["x", "SIZE 100"]));
        assert!(limited.accepts_size(100));
        assert!(!limited.accepts_size(101));

        let absent = ServerCapabilities::from_ehlo(&ehlo(&["x"]));
        assert_eq!(absent.size, None);
        assert!(absent.accepts_size(usize::MAX));
    }
}
