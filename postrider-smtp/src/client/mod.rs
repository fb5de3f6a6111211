//! Outbound SMTP client: connection handling, response parsing, and the
//! capability model for what a server advertised at EHLO time.

mod capabilities;
#[allow(clippy::module_inception)]
mod client;
mod error;
mod response;

pub use capabilities::ServerCapabilities;
pub use client::SmtpClient;
pub use error::{ClientError, Result};
pub use response::{Response, ResponseLine};
