//! Configuration parsing and management

use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};
use crate::tls::KeyPolicy;

/// Main configuration structure
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Hosts (and their subdomains) that go through the upstream
    #[serde(default)]
    pub blocked: Vec<String>,

    /// Proxy settings
    #[serde(default)]
    pub proxy: ProxyConfig,

    /// Certificate settings for TLS interception
    #[serde(default)]
    pub tls: TlsConfig,

    /// Logging settings
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// When the upstream transport is used
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Mode {
    /// Everything goes through the upstream
    Always,
    /// Only blocked hosts go through the upstream; the rest go direct
    #[default]
    BlockedOnly,
}

/// Proxy-specific configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProxyConfig {
    /// Address to bind the proxy server
    #[serde(default = "default_bind_address")]
    pub bind_address: String,

    #[serde(default)]
    pub mode: Mode,

    /// Upstream URL: `ssh://`, `socks5://` or an `http(s)://` relay endpoint.
    /// Absent means every request goes direct.
    #[serde(default)]
    pub remote: Option<String>,

    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Proxy auto-config file served at `/pac`
    #[serde(default)]
    pub pac_file: Option<String>,

    /// SSH private key for an `ssh://` remote
    #[serde(default)]
    pub private_key: Option<String>,

    /// Path to PEM CA cert to trust for upstream TLS (testing only)
    #[serde(default)]
    pub upstream_tls_ca: Option<String>,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            mode: Mode::default(),
            remote: None,
            connect_timeout_secs: default_connect_timeout(),
            pac_file: None,
            private_key: None,
            upstream_tls_ca: None,
        }
    }
}

fn default_bind_address() -> String {
    "127.0.0.1:1315".to_string()
}

fn default_connect_timeout() -> u64 {
    10
}

/// Certificate authority and leaf certificate store
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TlsConfig {
    /// Path to CA certificate for interception
    pub ca_cert: Option<String>,

    /// Path to CA private key for interception
    pub ca_key: Option<String>,

    /// Directory for minted leaf certificates; in memory only when absent
    pub certs_dir: Option<String>,

    #[serde(default)]
    pub key_policy: KeyPolicy,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoggingConfig {
    /// Log level (error, warn, info, debug, trace)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// JSONL file with one entry per finished session
    #[serde(default)]
    pub audit_log: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            audit_log: None,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            Error::config(format!(
                "Failed to read config file '{}': {}",
                path.as_ref().display(),
                e
            ))
        })?;

        Self::parse(&content)
    }

    /// Parse configuration from a TOML string
    pub fn parse(content: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(content).map_err(|e| Error::config(format!("Invalid TOML: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Check settings that depend on each other
    pub fn validate(&self) -> Result<()> {
        if self.proxy.connect_timeout_secs == 0 {
            return Err(Error::config("connect_timeout_secs must be positive"));
        }

        match self.proxy.remote.as_deref() {
            None => {
                if self.proxy.mode == Mode::Always {
                    return Err(Error::config("mode = \"always\" requires a remote"));
                }
            }
            Some(remote) => {
                let url = url::Url::parse(remote)
                    .map_err(|e| Error::config(format!("Invalid remote '{}': {}", remote, e)))?;
                match url.scheme() {
                    "ssh" | "socks5" | "socks5h" => {}
                    "http" | "https" => {
                        if self.tls.ca_cert.is_none() || self.tls.ca_key.is_none() {
                            return Err(Error::config(
                                "a relay remote needs [tls] ca_cert and ca_key to intercept CONNECT",
                            ));
                        }
                    }
                    other => {
                        return Err(Error::config(format!(
                            "Unsupported remote scheme '{}': expected ssh, socks5, http or https",
                            other
                        )))
                    }
                }
                if url.host_str().is_none() {
                    return Err(Error::config(format!("Remote '{}' has no host", remote)));
                }
            }
        }

        if self.tls.ca_cert.is_some() != self.tls.ca_key.is_some() {
            return Err(Error::config(
                "[tls] ca_cert and ca_key must be set together",
            ));
        }

        Ok(())
    }

    /// Create a minimal configuration with just the essentials
    pub fn minimal(bind_address: String) -> Self {
        Self {
            proxy: ProxyConfig {
                bind_address,
                ..ProxyConfig::default()
            },
            ..Self::default()
        }
    }

    /// Paths with `$VAR` / `${VAR}` expanded.
    pub fn path(value: &str) -> Result<PathBuf> {
        expand_env(value).map(PathBuf::from)
    }
}

impl ProxyConfig {
    pub fn connect_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.connect_timeout_secs)
    }
}

/// Expand `$VAR` and `${VAR}` references. An unset variable is an error.
pub fn expand_env(value: &str) -> Result<String> {
    let mut out = String::with_capacity(value.len());
    let mut rest = value;

    while let Some(pos) = rest.find('$') {
        out.push_str(&rest[..pos]);
        let after = &rest[pos + 1..];

        let (name, consumed) = if let Some(braced) = after.strip_prefix('{') {
            let end = braced
                .find('}')
                .ok_or_else(|| Error::config(format!("Unclosed '${{' in '{}'", value)))?;
            (&braced[..end], end + 2)
        } else {
            let end = after
                .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
                .unwrap_or(after.len());
            (&after[..end], end)
        };

        if name.is_empty() {
            out.push('$');
        } else {
            let var = std::env::var(name).map_err(|_| {
                Error::config(format!(
                    "Environment variable '{}' referenced in '{}' is not set",
                    name, value
                ))
            })?;
            out.push_str(&var);
        }
        rest = &after[consumed..];
    }

    out.push_str(rest);
    Ok(out)
}
