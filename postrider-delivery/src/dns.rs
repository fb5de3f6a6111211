//! MX resolution for outbound delivery.
//!
//! Looks up MX records with A/AAAA fallback per RFC 5321 section 5.1 and
//! caches results by the DNS record TTL, bounded by configurable limits.
//! The cache is a `DashMap` so concurrent deliveries never contend on a lock.

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use async_trait::async_trait;
use dashmap::DashMap;
use hickory_resolver::{
    TokioResolver,
    config::{ResolverConfig, ResolverOpts},
    name_server::TokioConnectionProvider,
};
use postrider_smtp::traits::HostResolver;
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, warn};

/// Errors that can occur during DNS resolution.
#[derive(Debug, Error)]
pub enum DnsError {
    /// No MX, A, or AAAA records found for the domain.
    #[error("No mail servers found for domain: {0}")]
    NoMailServers(String),

    /// DNS query failed due to network or resolver issues.
    #[error("DNS lookup failed: {0}")]
    LookupFailed(#[from] hickory_resolver::ResolveError),

    /// Domain does not exist (NXDOMAIN).
    #[error("Domain does not exist: {0}")]
    DomainNotFound(String),

    /// DNS query timed out.
    #[error("DNS query timed out for domain: {0}")]
    Timeout(String),
}

impl DnsError {
    /// Returns `true` if this error is temporary and should be retried.
    #[must_use]
    pub const fn is_temporary(&self) -> bool {
        matches!(self, Self::Timeout(_) | Self::LookupFailed(_))
    }
}

/// Configuration for the DNS resolver.
#[derive(Debug, Clone, Deserialize)]
pub struct DnsConfig {
    /// DNS query timeout in seconds.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Cache TTL override in seconds. When unset the DNS record's own TTL
    /// is used, bounded by the min/max below.
    #[serde(default)]
    pub cache_ttl_secs: Option<u64>,

    /// Minimum cache TTL in seconds.
    #[serde(default = "default_min_cache_ttl_secs")]
    pub min_cache_ttl_secs: u64,

    /// Maximum cache TTL in seconds.
    #[serde(default = "default_max_cache_ttl_secs")]
    pub max_cache_ttl_secs: u64,
}

const fn default_timeout_secs() -> u64 {
    5
}

const fn default_min_cache_ttl_secs() -> u64 {
    60
}

const fn default_max_cache_ttl_secs() -> u64 {
    3600
}

impl Default for DnsConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout_secs(),
            cache_ttl_secs: None,
            min_cache_ttl_secs: default_min_cache_ttl_secs(),
            max_cache_ttl_secs: default_max_cache_ttl_secs(),
        }
    }
}

/// A mail server target with its MX preference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MailServer {
    /// The hostname or IP address of the mail server.
    pub host: String,
    /// MX preference (lower value tried first). 0 for A/AAAA fallback.
    pub preference: u16,
    /// Port number, 25 unless overridden.
    pub port: u16,
}

impl MailServer {
    #[must_use]
    pub const fn new(host: String, preference: u16, port: u16) -> Self {
        Self {
            host,
            preference,
            port,
        }
    }

    /// The full address as `host:port`.
    #[must_use]
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Cached lookup result with its expiry.
#[derive(Debug, Clone)]
struct CachedResult {
    servers: Arc<Vec<MailServer>>,
    expires_at: Instant,
}

/// DNS resolver for mail delivery with a TTL-bounded cache.
#[derive(Debug)]
pub struct DnsResolver {
    resolver: TokioResolver,
    cache: DashMap<String, CachedResult>,
    config: DnsConfig,
}

impl DnsResolver {
    /// Creates a resolver from the system DNS configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the system DNS configuration cannot be loaded.
    pub fn new(config: DnsConfig) -> Result<Self, DnsError> {
        let mut opts = ResolverOpts::default();
        opts.timeout = Duration::from_secs(config.timeout_secs);

        let resolver = TokioResolver::builder(TokioConnectionProvider::default())?
            .with_options(opts)
            .build();

        Ok(Self {
            resolver,
            cache: DashMap::new(),
            config,
        })
    }

    /// Creates a resolver with an explicit upstream configuration.
    #[must_use]
    pub fn with_resolver_config(
        resolver_config: ResolverConfig,
        opts: ResolverOpts,
        config: DnsConfig,
    ) -> Self {
        let resolver =
            TokioResolver::builder_with_config(resolver_config, TokioConnectionProvider::default())
                .with_options(opts)
                .build();

        Self {
            resolver,
            cache: DashMap::new(),
            config,
        }
    }

    /// Resolves the mail servers for a domain, sorted ascending by
    /// MX preference, falling back to A/AAAA records (implicit MX with
    /// preference 0) when the domain has no MX records.
    ///
    /// # Errors
    ///
    /// Returns `DnsError` if the domain does not exist, has no usable
    /// records, or the query fails.
    pub async fn mail_servers(&self, domain: &str) -> Result<Arc<Vec<MailServer>>, DnsError> {
        if let Some(cached) = self.cache.get(domain)
            && cached.expires_at > Instant::now()
        {
            debug!("Cache hit for {domain}, {} server(s)", cached.servers.len());
            return Ok(Arc::clone(&cached.servers));
        }

        let (servers, dns_ttl) = self.mail_servers_uncached(domain).await?;
        let servers = Arc::new(servers);

        let cache_ttl = self.config.cache_ttl_secs.unwrap_or_else(|| {
            u64::from(dns_ttl).clamp(
                self.config.min_cache_ttl_secs,
                self.config.max_cache_ttl_secs,
            )
        });

        self.cache.insert(
            domain.to_string(),
            CachedResult {
                servers: Arc::clone(&servers),
                expires_at: Instant::now() + Duration::from_secs(cache_ttl),
            },
        );

        debug!(
            "Cached {} server(s) for {domain}, DNS TTL {dns_ttl}s, cache TTL {cache_ttl}s",
            servers.len()
        );
        Ok(servers)
    }

    async fn mail_servers_uncached(
        &self,
        domain: &str,
    ) -> Result<(Vec<MailServer>, u32), DnsError> {
        match self.resolver.mx_lookup(domain).await {
            Ok(mx_lookup) => {
                let min_ttl = mx_lookup
                    .as_lookup()
                    .records()
                    .iter()
                    .map(hickory_resolver::proto::rr::Record::ttl)
                    .min()
                    .unwrap_or(300);

                let mut servers: Vec<MailServer> = mx_lookup
                    .iter()
                    .map(|mx| {
                        let host = mx.exchange().to_utf8().trim_end_matches('.').to_string();
                        let preference = mx.preference();
                        debug!("Found MX record: {host} (preference: {preference})");
                        MailServer::new(host, preference, 25)
                    })
                    .collect();

                if servers.is_empty() {
                    return self.fallback_to_a_aaaa(domain).await;
                }

                servers.sort_by_key(|s| s.preference);
                Ok((servers, min_ttl))
            }
            Err(err) if err.is_no_records_found() => {
                debug!("No MX records for {domain}, falling back to A/AAAA");
                self.fallback_to_a_aaaa(domain).await
            }
            Err(err) => {
                warn!("MX lookup failed for {domain}: {err}");
                Err(DnsError::LookupFailed(err))
            }
        }
    }

    /// A/AAAA fallback when no MX records exist (RFC 5321 section 5.1).
    async fn fallback_to_a_aaaa(&self, domain: &str) -> Result<(Vec<MailServer>, u32), DnsError> {
        match self.resolver.lookup_ip(domain).await {
            Ok(ip_lookup) => {
                let min_ttl = ip_lookup
                    .as_lookup()
                    .records()
                    .iter()
                    .map(hickory_resolver::proto::rr::Record::ttl)
                    .min()
                    .unwrap_or(300);

                let servers: Vec<MailServer> = ip_lookup
                    .iter()
                    .map(|ip| MailServer::new(ip.to_string(), 0, 25))
                    .collect();

                if servers.is_empty() {
                    Err(DnsError::NoMailServers(domain.to_string()))
                } else {
                    Ok((servers, min_ttl))
                }
            }
            Err(err) if err.is_no_records_found() => {
                Err(DnsError::NoMailServers(domain.to_string()))
            }
            Err(err) => {
                warn!("A/AAAA lookup failed for {domain}: {err}");
                Err(DnsError::LookupFailed(err))
            }
        }
    }

    /// Checks that a hostname exists in DNS at all.
    ///
    /// # Errors
    ///
    /// Returns `DnsError::DomainNotFound` if the name has no records.
    pub async fn validate_host(&self, host: &str) -> Result<(), DnsError> {
        match self.resolver.lookup_ip(host).await {
            Ok(_) => Ok(()),
            Err(err) if err.is_no_records_found() || err.is_nx_domain() => {
                Err(DnsError::DomainNotFound(host.to_string()))
            }
            Err(err) => Err(DnsError::LookupFailed(err)),
        }
    }
}

#[async_trait]
impl HostResolver for DnsResolver {
    async fn resolves(&self, host: &str) -> bool {
        self.validate_host(host).await.is_ok()
    }
}
