use crate::error::{Result, TollgateError};
use std::env;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use url::Url;

const DEFAULT_PORT_PROXY: u16 = 31280;
const DEFAULT_PORT_PROBES: u16 = 31281;
const DEFAULT_BIND_HOST: &str = "0.0.0.0";
const DEFAULT_SHUTDOWN_TIMEOUT: &str = "5s";
const DEFAULT_READINESS_URL: &str = "https://cloudflare.com/cdn-cgi/trace";
const DEFAULT_READINESS_TIMEOUT: &str = "5s";

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    /// Proxy listener configuration
    pub proxy: ProxyServerConfig,
    /// Probe listener configuration
    pub probes: ProbeServerConfig,
    /// Bound on the graceful shutdown of both listeners
    pub shutdown_timeout: Duration,
    /// Logging configuration
    pub log: LogConfig,
}

#[derive(Debug, Clone)]
pub struct ProxyServerConfig {
    /// Port for the proxy listener (default: 31280)
    pub port: u16,
    /// Host to bind to (default: 0.0.0.0)
    pub host: IpAddr,
    /// The single accepted username/password pair
    pub credentials: Credentials,
}

#[derive(Debug, Clone)]
pub struct ProbeServerConfig {
    /// Port for the probe listener (default: 31281)
    pub port: u16,
    /// Host to bind to (default: 0.0.0.0)
    pub host: IpAddr,
    /// Target of the readiness GET
    pub readiness_url: Url,
    /// Bound on a single readiness GET
    pub readiness_timeout: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Pretty,
}

#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Verbose (debug level) logging
    pub debug: bool,
    /// Output format (json, pretty)
    pub format: LogFormat,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            debug: false,
            format: LogFormat::Json,
        }
    }
}

/// Static proxy credentials, immutable after startup
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let host = parse_host(&get_env_or("BIND_HOST", DEFAULT_BIND_HOST))?;

        let proxy_port = parse_port("PORT_PROXY", DEFAULT_PORT_PROXY)?;
        let probes_port = parse_port("PORT_PROBES", DEFAULT_PORT_PROBES)?;
        if proxy_port == probes_port {
            return Err(TollgateError::InvalidConfig(format!(
                "PORT_PROXY and PORT_PROBES must differ (both are {})",
                proxy_port
            )));
        }

        let readiness_url = parse_readiness_url(&get_env_or("READINESS_URL", DEFAULT_READINESS_URL))?;

        Ok(Config {
            proxy: ProxyServerConfig {
                port: proxy_port,
                host,
                credentials: Credentials {
                    username: require_env("USERNAME")?,
                    password: require_env("PASSWORD")?,
                },
            },
            probes: ProbeServerConfig {
                port: probes_port,
                host,
                readiness_url,
                readiness_timeout: parse_duration_env("READINESS_TIMEOUT", DEFAULT_READINESS_TIMEOUT)?,
            },
            shutdown_timeout: parse_duration_env("SHUTDOWN_TIMEOUT", DEFAULT_SHUTDOWN_TIMEOUT)?,
            log: LogConfig {
                debug: parse_bool("DEBUG", &get_env_or("DEBUG", "false"))?,
                format: parse_log_format(&get_env_or("LOG_FORMAT", "json"))?,
            },
        })
    }

    /// Get the proxy listener address
    pub fn proxy_addr(&self) -> SocketAddr {
        SocketAddr::new(self.proxy.host, self.proxy.port)
    }

    /// Get the probe listener address
    pub fn probes_addr(&self) -> SocketAddr {
        SocketAddr::new(self.probes.host, self.probes.port)
    }
}

fn parse_host(raw: &str) -> Result<IpAddr> {
    raw.parse().map_err(|_| {
        TollgateError::InvalidConfig(format!("BIND_HOST must be an IP address, got {:?}", raw))
    })
}

fn parse_port(key: &str, default: u16) -> Result<u16> {
    get_env_or(key, &default.to_string())
        .parse()
        .map_err(|_| TollgateError::InvalidConfig(format!("{} must be a valid port number", key)))
}

fn parse_readiness_url(raw: &str) -> Result<Url> {
    let url = Url::parse(raw).map_err(|e| {
        TollgateError::InvalidConfig(format!("READINESS_URL must be a valid URL: {}", e))
    })?;

    match url.scheme() {
        "http" | "https" => Ok(url),
        other => Err(TollgateError::InvalidConfig(format!(
            "READINESS_URL has unsupported scheme: {}",
            other
        ))),
    }
}

fn parse_log_format(raw: &str) -> Result<LogFormat> {
    match raw.to_lowercase().as_str() {
        "json" => Ok(LogFormat::Json),
        "pretty" | "text" => Ok(LogFormat::Pretty),
        other => Err(TollgateError::InvalidConfig(format!(
            "LOG_FORMAT must be json or pretty, got {:?}",
            other
        ))),
    }
}

fn parse_duration_env(key: &str, default: &str) -> Result<Duration> {
    let raw = get_env_or(key, default);
    parse_duration(&raw)
        .map_err(|reason| TollgateError::InvalidConfig(format!("{} is invalid: {}", key, reason)))
}

/// Parse a boolean the way `strconv.ParseBool`-style configs spell them
pub fn parse_bool(key: &str, raw: &str) -> Result<bool> {
    match raw {
        "1" | "t" | "T" | "TRUE" | "true" | "True" => Ok(true),
        "0" | "f" | "F" | "FALSE" | "false" | "False" => Ok(false),
        _ => Err(TollgateError::InvalidConfig(format!(
            "{} must be a boolean, got {:?}",
            key, raw
        ))),
    }
}

/// Parse a duration such as `300ms`, `5s` or `1m30s`.
///
/// Accepts a sequence of decimal numbers, each followed by one of the units
/// `ns`, `us` (or `µs`), `ms`, `s`, `m`, `h`. A bare `0` is also accepted.
/// Negative durations are rejected.
pub fn parse_duration(raw: &str) -> std::result::Result<Duration, String> {
    let s = raw.trim();
    if s == "0" || s == "+0" {
        return Ok(Duration::ZERO);
    }
    if s.starts_with('-') {
        return Err(format!("negative duration {:?}", raw));
    }
    let s = s.strip_prefix('+').unwrap_or(s);
    if s.is_empty() {
        return Err(format!("invalid duration {:?}", raw));
    }

    let mut rest = s;
    let mut nanos = 0f64;
    while !rest.is_empty() {
        let num_end = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(rest.len());
        let (number, tail) = rest.split_at(num_end);
        if number.is_empty() || number == "." {
            return Err(format!("invalid duration {:?}", raw));
        }
        let value: f64 = number
            .parse()
            .map_err(|_| format!("invalid duration {:?}", raw))?;

        let unit_end = tail
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(tail.len());
        let (unit, next) = tail.split_at(unit_end);
        let scale = match unit {
            "ns" => 1.0,
            "us" | "µs" | "μs" => 1e3,
            "ms" => 1e6,
            "s" => 1e9,
            "m" => 60e9,
            "h" => 3600e9,
            "" => return Err(format!("missing unit in duration {:?}", raw)),
            other => return Err(format!("unknown unit {:?} in duration {:?}", other, raw)),
        };

        nanos += value * scale;
        rest = next;
    }

    if !nanos.is_finite() || nanos > u64::MAX as f64 {
        return Err(format!("duration {:?} is out of range", raw));
    }
    Ok(Duration::from_nanos(nanos.round() as u64))
}

/// Get environment variable with a default value; empty counts as unset
fn get_env_or(key: &str, default: &str) -> String {
    env::var(key)
        .ok()
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| default.to_string())
}

/// Get a required, non-empty environment variable
fn require_env(key: &str) -> Result<String> {
    env::var(key)
        .ok()
        .filter(|value| !value.is_empty())
        .ok_or_else(|| TollgateError::MissingEnvVar(key.to_string()))
}
