//! Daemon configuration, deserialized from TOML.

use std::{
    net::SocketAddr,
    path::{Path, PathBuf},
};

use anyhow::Context;
use postrider_delivery::{DeliveryConfig, DnsConfig};
use postrider_smtp::{
    SmtpServerTimeouts,
    extensions::Extension,
    session::{DEFAULT_MAX_COMMAND_LINE, TlsContext},
};
use postrider_supervisor::{SamplerConfig, SupervisorConfig};
use serde::Deserialize;

/// Top-level daemon configuration. Every section and every field has a
/// default, so an empty file is a valid (if not very useful) configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub supervisor: SupervisorConfig,

    #[serde(default)]
    pub backpressure: SamplerConfig,

    #[serde(default)]
    pub delivery: DeliveryConfig,

    #[serde(default)]
    pub dns: DnsConfig,

    #[serde(default)]
    pub privileges: Privileges,
}

/// Inbound SMTP listener configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Addresses each worker listens on.
    #[serde(default = "default_listen")]
    pub listen: Vec<SocketAddr>,

    /// Hostname announced in the greeting banner and EHLO reply.
    #[serde(default)]
    pub banner: String,

    /// Maximum accepted command line length in bytes.
    #[serde(default = "default_max_command_line")]
    pub max_command_line: usize,

    /// Maximum message size advertised via SIZE. Zero means unlimited.
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,

    /// Accept bare LF line endings in addition to CRLF.
    #[serde(default)]
    pub crlf_relaxed: bool,

    /// Offer XCLIENT to connecting clients.
    #[serde(default)]
    pub xclient: bool,

    /// Offer XFORWARD to connecting clients.
    #[serde(default)]
    pub xforward: bool,

    /// TLS material for STARTTLS. Omitting this disables the extension.
    #[serde(default)]
    pub tls: Option<TlsContext>,

    #[serde(default)]
    pub timeouts: SmtpServerTimeouts,
}

fn default_listen() -> Vec<SocketAddr> {
    vec![SocketAddr::new(
        std::net::IpAddr::V6(std::net::Ipv6Addr::UNSPECIFIED),
        25,
    )]
}

const fn default_max_command_line() -> usize {
    DEFAULT_MAX_COMMAND_LINE
}

const fn default_max_message_size() -> usize {
    15 * 1024 * 1024
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            banner: String::new(),
            max_command_line: default_max_command_line(),
            max_message_size: default_max_message_size(),
            crlf_relaxed: false,
            xclient: false,
            xforward: false,
            tls: None,
            timeouts: SmtpServerTimeouts::default(),
        }
    }
}

impl ServerConfig {
    /// The extension set sessions advertise, derived from this section.
    #[must_use]
    pub fn extensions(&self) -> Vec<Extension> {
        let mut extensions = vec![
            Extension::Size(self.max_message_size),
            Extension::EightBitMime,
        ];

        if let Some(tls) = &self.tls {
            extensions.push(Extension::Starttls(tls.clone()));
        }
        if self.xclient {
            extensions.push(Extension::XClient);
        }
        if self.xforward {
            extensions.push(Extension::XForward);
        }

        extensions
    }
}

/// Ids workers switch to after spawning, before serving.
#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct Privileges {
    pub uid: Option<u32>,
    pub gid: Option<u32>,
}

impl Config {
    /// Parses the configuration at `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or is not valid TOML.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config from {}", path.display()))?;

        toml::from_str(&content)
            .with_context(|| format!("Failed to parse config {}", path.display()))
    }
}

/// Locates the configuration file:
/// 1. the `POSTRIDER_CONFIG` environment variable
/// 2. `./postrider.toml`
/// 3. `/etc/postrider/postrider.toml`
///
/// # Errors
///
/// Returns an error if the environment variable points at a missing file,
/// or if no candidate exists.
pub fn find_config_file() -> anyhow::Result<PathBuf> {
    if let Ok(env_path) = std::env::var("POSTRIDER_CONFIG") {
        let path = PathBuf::from(env_path);
        if path.exists() {
            return Ok(path);
        }
        anyhow::bail!(
            "POSTRIDER_CONFIG points to non-existent file: {}",
            path.display()
        );
    }

    let candidates = [
        PathBuf::from("./postrider.toml"),
        PathBuf::from("/etc/postrider/postrider.toml"),
    ];

    for path in &candidates {
        if path.exists() {
            return Ok(path.clone());
        }
    }

    anyhow::bail!(
        "No configuration file found. Tried the POSTRIDER_CONFIG environment \
         variable, ./postrider.toml, and /etc/postrider/postrider.toml"
    )
}
