//! Backend configuration.
//!
//! All tunables are plain serde fields with defaults, so a JSON document
//! only has to name what it changes:
//!
//! ```json
//! { "proxy": { "host": "gw.local" }, "dirCacheTtlSec": 10 }
//! ```

use crate::ftp::error::{FtpError, FtpResult};
use crate::ftp::types::DEFAULT_FTP_PORT;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// FTP proxy that accepts `USER user@host` logins.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProxyConfig {
    pub host: String,
    #[serde(default = "default_proxy_port")]
    pub port: u16,
}

fn default_proxy_port() -> u16 {
    DEFAULT_FTP_PORT
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FtpVfsConfig {
    #[serde(default)]
    pub proxy: Option<ProxyConfig>,
    /// How long a directory listing may be served from cache.
    #[serde(default = "default_dir_cache_ttl")]
    pub dir_cache_ttl_sec: u64,
    /// Pool entries used more recently than this are never reaped.
    #[serde(default = "default_min_lifetime")]
    pub min_connection_lifetime_sec: u64,
    /// Period of the background reaper.
    #[serde(default = "default_reap_interval")]
    pub reap_interval_sec: u64,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_sec: u64,
    #[serde(default = "default_data_timeout")]
    pub data_timeout_sec: u64,
    /// Interactive prompt attempts before giving up with `LoginFailed`.
    #[serde(default = "default_login_attempts")]
    pub max_login_attempts: u32,
    #[serde(default = "default_symlink_depth")]
    pub max_symlink_depth: u32,
    /// Longest control-channel line accepted from the server.
    #[serde(default = "default_max_line")]
    pub max_response_line_bytes: usize,
    #[serde(default = "default_anonymous_user")]
    pub anonymous_user: String,
    #[serde(default = "default_anonymous_password")]
    pub anonymous_password: String,
}

fn default_dir_cache_ttl() -> u64 {
    30
}
fn default_min_lifetime() -> u64 {
    30
}
fn default_reap_interval() -> u64 {
    15
}
fn default_connect_timeout() -> u64 {
    15
}
fn default_data_timeout() -> u64 {
    30
}
fn default_login_attempts() -> u32 {
    3
}
fn default_symlink_depth() -> u32 {
    8
}
fn default_max_line() -> usize {
    4096
}
fn default_anonymous_user() -> String {
    "anonymous".into()
}
fn default_anonymous_password() -> String {
    "anonymous@".into()
}

impl Default for FtpVfsConfig {
    fn default() -> Self {
        Self {
            proxy: None,
            dir_cache_ttl_sec: default_dir_cache_ttl(),
            min_connection_lifetime_sec: default_min_lifetime(),
            reap_interval_sec: default_reap_interval(),
            connect_timeout_sec: default_connect_timeout(),
            data_timeout_sec: default_data_timeout(),
            max_login_attempts: default_login_attempts(),
            max_symlink_depth: default_symlink_depth(),
            max_response_line_bytes: default_max_line(),
            anonymous_user: default_anonymous_user(),
            anonymous_password: default_anonymous_password(),
        }
    }
}

impl FtpVfsConfig {
    pub fn from_json_str(json: &str) -> FtpResult<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| FtpError::bad_parameters(format!("Invalid FTP config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> FtpResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            FtpError::bad_parameters(format!("Cannot read {}: {}", path.display(), e))
        })?;
        Self::from_json_str(&text)
    }

    pub fn validate(&self) -> FtpResult<()> {
        if let Some(proxy) = &self.proxy {
            if proxy.host.trim().is_empty() {
                return Err(FtpError::bad_parameters("Proxy host must not be empty"));
            }
        }
        if self.reap_interval_sec == 0 {
            return Err(FtpError::bad_parameters("reapIntervalSec must be > 0"));
        }
        if self.max_login_attempts == 0 {
            return Err(FtpError::bad_parameters("maxLoginAttempts must be >= 1"));
        }
        if self.max_response_line_bytes < 4 {
            return Err(FtpError::bad_parameters("maxResponseLineBytes too small"));
        }
        Ok(())
    }

    pub fn dir_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.dir_cache_ttl_sec)
    }

    pub fn min_connection_lifetime(&self) -> Duration {
        Duration::from_secs(self.min_connection_lifetime_sec)
    }

    pub fn reap_interval(&self) -> Duration {
        Duration::from_secs(self.reap_interval_sec)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_sec)
    }

    pub fn data_timeout(&self) -> Duration {
        Duration::from_secs(self.data_timeout_sec)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ftp::error::FtpErrorKind;

    #[test]
    fn test_defaults() {
        let c = FtpVfsConfig::default();
        assert_eq!(c.dir_cache_ttl(), Duration::from_secs(30));
        assert_eq!(c.min_connection_lifetime(), Duration::from_secs(30));
        assert_eq!(c.reap_interval(), Duration::from_secs(15));
        assert_eq!(c.max_symlink_depth, 8);
        assert!(c.proxy.is_none());
        assert!(c.validate().is_ok());
    }

    #[test]
    fn test_partial_json() {
        let c = FtpVfsConfig::from_json_str(r#"{"proxy":{"host":"gw.local"},"dirCacheTtlSec":5}"#)
            .unwrap();
        assert_eq!(c.dir_cache_ttl_sec, 5);
        assert_eq!(c.proxy.as_ref().map(|p| p.port), Some(21));
        assert_eq!(c.max_login_attempts, 3);
    }

    #[test]
    fn test_rejects_empty_proxy_host() {
        let err = FtpVfsConfig::from_json_str(r#"{"proxy":{"host":" "}}"#).unwrap_err();
        assert_eq!(err.kind, FtpErrorKind::BadParameters);
    }

    #[test]
    fn test_rejects_malformed_json() {
        assert!(FtpVfsConfig::from_json_str("{not json").is_err());
    }
}
