//! Layered configuration: an INI-shaped file with a `[Proxy]` section,
//! defaults for every key, then environment overrides, then validation.
//! File and env layers fill in a `Config`, then a single validation pass
//! rejects anything inconsistent before the proxy starts.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use crate::error::{ProxyError, Result};

const ENV_PREFIX: &str = "DNSFB_";

const DEFAULT_CDN_SUFFIXES: &[&str] = &[
    "cloudfront.net",
    "fastly.com",
    "amazonaws.com",
    "akamai.net",
    "cloudflare.com",
    "jsdelivr.net",
    "unpkg.com",
];

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResolverEndpoint {
    pub host: String,
    pub port: u16,
    pub name: String,
}

impl ResolverEndpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        let host = host.into();
        let name = format!("{host}:{port}");
        ResolverEndpoint { host, port, name }
    }

    pub fn socket_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .map_err(|_| ProxyError::ConfigError(format!("invalid resolver address: {}", self.name)))
    }

    /// Parses a `host[:port]` entry, defaulting to port 53 when omitted.
    fn parse(entry: &str) -> Result<Self> {
        let entry = entry.trim();
        if entry.is_empty() {
            return Err(ProxyError::ConfigError("empty resolver entry".to_string()));
        }
        match entry.rsplit_once(':') {
            Some((host, port)) => {
                let port = port.parse::<u16>().map_err(|_| {
                    ProxyError::ConfigError(format!("invalid port in resolver entry: {entry}"))
                })?;
                Ok(ResolverEndpoint::new(host, port))
            }
            None => Ok(ResolverEndpoint::new(entry, 53)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub listen_address: String,
    pub dns_port: u16,
    pub primary: ResolverEndpoint,
    pub fallbacks: Vec<ResolverEndpoint>,
    pub buffer_size: usize,
    pub primary_timeout: Duration,
    pub fallback_timeout: Duration,
    pub health_check_interval: Duration,
    pub health_check_domains: Vec<String>,
    pub max_workers: usize,
    pub intelligent_caching: bool,
    pub max_domain_cache: usize,
    pub fallback_threshold: u32,
    pub bypass_duration: Duration,
    pub enable_query_deduplication: bool,
    pub structured_logging: bool,
    pub log_file: Option<String>,
    pub pid_file: String,
    pub event_sink_path: Option<String>,

    pub dedupe_wait_timeout: Duration,
    pub dedupe_grace: Duration,
    pub cdn_bypass_suffixes: Vec<String>,
    pub probe_backoff_ceiling: Duration,
    pub shutdown_drain_grace: Duration,
    pub tcp_idle_timeout: Duration,
    pub min_queries_before_bypass: u64,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            listen_address: "0.0.0.0".to_string(),
            dns_port: 53,
            primary: ResolverEndpoint::new("127.0.0.1", 53),
            fallbacks: vec![
                ResolverEndpoint::new("1.1.1.1", 53),
                ResolverEndpoint::new("8.8.8.8", 53),
            ],
            buffer_size: 4096,
            primary_timeout: Duration::from_millis(1500),
            fallback_timeout: Duration::from_millis(3000),
            health_check_interval: Duration::from_secs(10),
            health_check_domains: vec!["example.com".to_string(), "google.com".to_string()],
            max_workers: 50,
            intelligent_caching: true,
            max_domain_cache: 1000,
            fallback_threshold: 3,
            bypass_duration: Duration::from_secs(3600),
            enable_query_deduplication: true,
            structured_logging: false,
            log_file: None,
            pid_file: "/var/run/dnsward.pid".to_string(),
            event_sink_path: None,
            dedupe_wait_timeout: Duration::from_secs(5),
            dedupe_grace: Duration::from_secs(1),
            cdn_bypass_suffixes: DEFAULT_CDN_SUFFIXES.iter().map(|s| s.to_string()).collect(),
            probe_backoff_ceiling: Duration::from_secs(30),
            shutdown_drain_grace: Duration::from_secs(10),
            tcp_idle_timeout: Duration::from_secs(5),
            min_queries_before_bypass: 5,
        }
    }
}

impl Config {
    /// Loads the layered configuration: file (if given) → environment
    /// overrides → validation. A missing file path is not an error; the
    /// proxy can run entirely off defaults and environment variables.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = Self::default();
        if let Some(path) = path {
            let contents = std::fs::read_to_string(path)
                .map_err(|e| ProxyError::ConfigError(format!("reading {}: {e}", path.display())))?;
            config.apply_ini(&contents)?;
        }
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Parses the `[Proxy]` section of an INI-shaped file into flat
    /// key=value pairs and applies each key this proxy understands.
    /// Unknown keys are ignored so newer dashboards can add settings the
    /// core doesn't read without breaking parsing.
    fn apply_ini(&mut self, contents: &str) -> Result<()> {
        let mut values = HashMap::new();
        let mut in_proxy_section = false;

        for line in contents.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
                continue;
            }
            if let Some(section) = line.strip_prefix('[').and_then(|s| s.strip_suffix(']')) {
                in_proxy_section = section.eq_ignore_ascii_case("Proxy");
                continue;
            }
            if !in_proxy_section {
                continue;
            }
            if let Some((key, value)) = line.split_once('=') {
                values.insert(key.trim().to_ascii_lowercase(), value.trim().to_string());
            }
        }

        self.apply_values(&values)
    }

    fn apply_env(&mut self) -> Result<()> {
        let mut values = HashMap::new();
        for (key, value) in std::env::vars() {
            if let Some(suffix) = key.strip_prefix(ENV_PREFIX) {
                values.insert(suffix.to_ascii_lowercase(), value);
            }
        }
        self.apply_values(&values)
    }

    fn apply_values(&mut self, values: &HashMap<String, String>) -> Result<()> {
        if let Some(v) = values.get("primary_dns") {
            self.primary = ResolverEndpoint::parse(v)?;
        }
        if let Some(v) = values.get("fallback_dns_servers") {
            self.fallbacks = v
                .split(',')
                .filter(|s| !s.trim().is_empty())
                .map(ResolverEndpoint::parse)
                .collect::<Result<Vec<_>>>()?;
        }
        if let Some(v) = values.get("listen_address") {
            self.listen_address = v.clone();
        }
        if let Some(v) = values.get("dns_port") {
            self.dns_port = parse_field(v, "dns_port")?;
        }
        if let Some(v) = values.get("health_check_interval") {
            self.health_check_interval = Duration::from_secs(parse_field(v, "health_check_interval")?);
        }
        if let Some(v) = values.get("health_check_domains") {
            self.health_check_domains = v
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }
        if let Some(v) = values.get("log_file") {
            self.log_file = Some(v.clone());
        }
        if let Some(v) = values.get("pid_file") {
            self.pid_file = v.clone();
        }
        if let Some(v) = values.get("buffer_size") {
            self.buffer_size = parse_field(v, "buffer_size")?;
        }
        if let Some(v) = values.get("max_workers") {
            self.max_workers = parse_field(v, "max_workers")?;
        }
        if let Some(v) = values.get("unbound_timeout") {
            self.primary_timeout = Duration::from_millis(parse_field::<u64>(v, "unbound_timeout")? * 1000);
        }
        if let Some(v) = values.get("fallback_timeout") {
            self.fallback_timeout = Duration::from_millis(parse_field::<u64>(v, "fallback_timeout")? * 1000);
        }
        if let Some(v) = values.get("intelligent_caching") {
            self.intelligent_caching = parse_bool(v, self.intelligent_caching);
        }
        if let Some(v) = values.get("max_domain_cache") {
            self.max_domain_cache = parse_field(v, "max_domain_cache")?;
        }
        if let Some(v) = values.get("fallback_threshold") {
            self.fallback_threshold = parse_field(v, "fallback_threshold")?;
        }
        if let Some(v) = values.get("bypass_duration") {
            self.bypass_duration = Duration::from_secs(parse_field(v, "bypass_duration")?);
        }
        if let Some(v) = values.get("enable_query_deduplication") {
            self.enable_query_deduplication = parse_bool(v, self.enable_query_deduplication);
        }
        if let Some(v) = values.get("structured_logging") {
            self.structured_logging = parse_bool(v, self.structured_logging);
        }
        if let Some(v) = values.get("event_sink_path") {
            self.event_sink_path = Some(v.clone());
        }
        if let Some(v) = values.get("dedupe_wait_timeout") {
            self.dedupe_wait_timeout = Duration::from_secs(parse_field(v, "dedupe_wait_timeout")?);
        }
        if let Some(v) = values.get("dedupe_grace") {
            self.dedupe_grace = Duration::from_secs(parse_field(v, "dedupe_grace")?);
        }
        if let Some(v) = values.get("min_queries_before_bypass") {
            self.min_queries_before_bypass = parse_field(v, "min_queries_before_bypass")?;
        }
        if let Some(v) = values.get("probe_backoff_ceiling") {
            self.probe_backoff_ceiling = Duration::from_secs(parse_field(v, "probe_backoff_ceiling")?);
        }
        if let Some(v) = values.get("shutdown_drain_grace") {
            self.shutdown_drain_grace = Duration::from_secs(parse_field(v, "shutdown_drain_grace")?);
        }
        if let Some(v) = values.get("tcp_idle_timeout") {
            self.tcp_idle_timeout = Duration::from_secs(parse_field(v, "tcp_idle_timeout")?);
        }
        if let Some(v) = values.get("cdn_bypass_suffixes") {
            self.cdn_bypass_suffixes = v
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.buffer_size == 0 {
            return Err(ProxyError::ConfigError("buffer_size must be greater than 0".to_string()));
        }
        if self.max_workers == 0 {
            return Err(ProxyError::ConfigError("max_workers must be greater than 0".to_string()));
        }
        if self.health_check_domains.is_empty() {
            return Err(ProxyError::ConfigError(
                "health_check_domains must contain at least one domain".to_string(),
            ));
        }
        self.primary.socket_addr()?;
        for fallback in &self.fallbacks {
            fallback.socket_addr()?;
        }
        format!("{}:{}", self.listen_address, self.dns_port)
            .parse::<SocketAddr>()
            .map_err(|_| {
                ProxyError::ConfigError(format!(
                    "invalid listen address: {}:{}",
                    self.listen_address, self.dns_port
                ))
            })?;
        if self.fallback_threshold == 0 {
            return Err(ProxyError::ConfigError(
                "fallback_threshold must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }

    /// All resolvers in selection order: primary first, then fallbacks.
    pub fn resolver_chain(&self) -> Vec<ResolverEndpoint> {
        std::iter::once(self.primary.clone())
            .chain(self.fallbacks.iter().cloned())
            .collect()
    }
}

fn parse_field<T: std::str::FromStr>(value: &str, field: &str) -> Result<T> {
    value
        .trim()
        .parse::<T>()
        .map_err(|_| ProxyError::ConfigError(format!("invalid value for {field}: {value}")))
}

fn parse_bool(s: &str, default: bool) -> bool {
    match s.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => true,
        "false" | "0" | "no" | "off" => false,
        _ => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn rejects_zero_buffer_size() {
        let config = Config {
            buffer_size: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn parses_ini_proxy_section() {
        let ini = "\
[Proxy]
primary_dns = 10.0.0.1:5353
fallback_dns_servers = 1.1.1.1, 9.9.9.9:53
dns_port = 5300
intelligent_caching = false
";
        let mut config = Config::default();
        config.apply_ini(ini).unwrap();
        assert_eq!(config.primary.host, "10.0.0.1");
        assert_eq!(config.primary.port, 5353);
        assert_eq!(config.fallbacks.len(), 2);
        assert_eq!(config.dns_port, 5300);
        assert!(!config.intelligent_caching);
    }

    #[test]
    fn ignores_keys_outside_proxy_section() {
        let ini = "[Other]\ndns_port = 9999\n";
        let mut config = Config::default();
        config.apply_ini(ini).unwrap();
        assert_eq!(config.dns_port, 53);
    }

    #[test]
    fn resolver_endpoint_defaults_to_port_53() {
        let endpoint = ResolverEndpoint::parse("9.9.9.9").unwrap();
        assert_eq!(endpoint.port, 53);
    }

    #[test]
    fn resolver_chain_puts_primary_first() {
        let config = Config::default();
        let chain = config.resolver_chain();
        assert_eq!(chain[0], config.primary);
        assert_eq!(chain.len(), 1 + config.fallbacks.len());
    }
}
