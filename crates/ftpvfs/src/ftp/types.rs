//! Shared types for the FTP backend.

use crate::ftp::error::{FtpError, FtpResult};
use chrono::{DateTime, Utc};
use percent_encoding::percent_decode_str;
use serde::{Deserialize, Serialize};
use std::fmt;
use url::Url;

pub const DEFAULT_FTP_PORT: u16 = 21;

// ─── Connection identity ─────────────────────────────────────────────

/// The key of a connection pool: two requests share connections only if
/// all four fields match. An absent user/password (`None`) is a different
/// key from an empty one (`Some("")`).
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionIdentity {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl ConnectionIdentity {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            username: None,
            password: None,
        }
    }

    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.username = Some(user.into());
        self
    }

    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }
}

impl fmt::Debug for ConnectionIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionIdentity")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .finish()
    }
}

impl fmt::Display for ConnectionIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.username {
            Some(user) => write!(f, "{}@{}:{}", user, self.host, self.port),
            None => write!(f, "{}:{}", self.host, self.port),
        }
    }
}

// ─── URI ─────────────────────────────────────────────────────────────

/// An `ftp://` location: the identity to talk to plus an absolute,
/// percent-decoded path without a trailing slash (root is `/`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FtpUri {
    pub identity: ConnectionIdentity,
    pub path: String,
}

impl FtpUri {
    pub fn new(identity: ConnectionIdentity, path: &str) -> Self {
        Self {
            identity,
            path: normalize_path(path),
        }
    }

    /// Parse `ftp://[user[:password]@]host[:port]/path`.
    pub fn parse(s: &str) -> FtpResult<Self> {
        let url = Url::parse(s)
            .map_err(|e| FtpError::bad_parameters(format!("Invalid URI '{}': {}", s, e)))?;
        if url.scheme() != "ftp" {
            return Err(FtpError::bad_parameters(format!(
                "Unsupported scheme '{}'",
                url.scheme()
            )));
        }
        let host = url
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| FtpError::bad_parameters(format!("URI '{}' has no host", s)))?;

        let (username, password) = match raw_userinfo(s) {
            Some(info) => match info.split_once(':') {
                Some((user, pass)) => (Some(decode(user)), Some(decode(pass))),
                None => (Some(decode(info)), None),
            },
            None => (None, None),
        };
        let identity = ConnectionIdentity {
            host: host.to_string(),
            port: url.port_or_known_default().unwrap_or(DEFAULT_FTP_PORT),
            username,
            password,
        };
        Ok(Self::new(identity, &decode(url.path())))
    }

    pub fn is_root(&self) -> bool {
        self.path == "/"
    }

    /// Final path component; empty for the root.
    pub fn name(&self) -> &str {
        match self.path.rfind('/') {
            Some(pos) => &self.path[pos + 1..],
            None => &self.path,
        }
    }

    /// Directory containing this location; the root is its own parent.
    pub fn parent(&self) -> FtpUri {
        let parent = match self.path.rfind('/') {
            Some(0) | None => "/",
            Some(pos) => &self.path[..pos],
        };
        self.with_path(parent)
    }

    pub fn join(&self, name: &str) -> FtpUri {
        if self.is_root() {
            self.with_path(&format!("/{}", name))
        } else {
            self.with_path(&format!("{}/{}", self.path, name))
        }
    }

    pub fn with_path(&self, path: &str) -> FtpUri {
        FtpUri::new(self.identity.clone(), path)
    }

    /// Resolve a symlink target found in this directory's listing.
    /// Absolute targets replace the path, relative ones are joined, and
    /// `.` / `..` components are folded.
    pub fn resolve(&self, target: &str) -> FtpUri {
        let joined = if target.starts_with('/') {
            target.to_string()
        } else {
            format!("{}/{}", self.path, target)
        };
        let mut parts: Vec<&str> = Vec::new();
        for part in joined.split('/') {
            match part {
                "" | "." => {}
                ".." => {
                    parts.pop();
                }
                other => parts.push(other),
            }
        }
        self.with_path(&format!("/{}", parts.join("/")))
    }
}

impl fmt::Display for FtpUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ftp://{}{}", self.identity, self.path)
    }
}

/// The `user[:password]` part of the authority exactly as written, or `None`
/// when the URI has no `@`. `Url` normalises `ftp://:@host` to `ftp://host`,
/// so the raw text is consulted.
fn raw_userinfo(s: &str) -> Option<&str> {
    let rest = &s[s.find("://")? + 3..];
    let authority = match rest.find(|c| matches!(c, '/' | '?' | '#')) {
        Some(end) => &rest[..end],
        None => rest,
    };
    authority.rfind('@').map(|at| &authority[..at])
}

fn decode(s: &str) -> String {
    percent_decode_str(s).decode_utf8_lossy().into_owned()
}

fn normalize_path(path: &str) -> String {
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() {
        "/".to_string()
    } else if trimmed.starts_with('/') {
        trimmed.to_string()
    } else {
        format!("/{}", trimmed)
    }
}

// ─── File info ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum FileKind {
    Regular,
    Directory,
    Symlink,
    Unknown,
}

/// Metadata for one remote entry, as far as the listing revealed it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FileInfo {
    pub name: String,
    pub kind: FileKind,
    pub size: Option<u64>,
    pub modified: Option<DateTime<Utc>>,
    /// Unix permission bits (`0o755` style).
    pub permissions: Option<u32>,
    pub owner: Option<String>,
    pub group: Option<String>,
    /// Set when the entry is a symlink, even after it was followed.
    pub symlink_target: Option<String>,
}

impl FileInfo {
    pub fn new(name: impl Into<String>, kind: FileKind) -> Self {
        Self {
            name: name.into(),
            kind,
            size: None,
            modified: None,
            permissions: None,
            owner: None,
            group: None,
            symlink_target: None,
        }
    }

    pub fn directory(name: impl Into<String>) -> Self {
        Self::new(name, FileKind::Directory)
    }

    pub fn is_directory(&self) -> bool {
        self.kind == FileKind::Directory
    }

    pub fn is_symlink(&self) -> bool {
        self.symlink_target.is_some()
    }
}

/// Requested metadata changes. Only `name` is supported by FTP.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileInfoUpdate {
    pub name: Option<String>,
    pub permissions: Option<u32>,
    pub modified: Option<DateTime<Utc>>,
    pub owner: Option<String>,
    pub group: Option<String>,
}

// ─── Handles ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum AccessMode {
    Read,
    Write,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum SeekWhence {
    Start,
    Current,
    End,
}

// ─── Server dialect ──────────────────────────────────────────────────

/// Server family, derived once per identity from the SYST reply.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum ServerDialect {
    Unix,
    WindowsNt,
    NetWare,
    MacOs,
    Unknown,
}

impl ServerDialect {
    pub fn from_system_type(syst: &str) -> Self {
        let upper = syst.trim().to_ascii_uppercase();
        if upper.starts_with("UNIX") {
            Self::Unix
        } else if upper.starts_with("WINDOWS_NT") {
            Self::WindowsNt
        } else if upper.starts_with("NETWARE") {
            Self::NetWare
        } else if upper.starts_with("MACOS") {
            Self::MacOs
        } else {
            Self::Unknown
        }
    }

    /// LIST argument forms to probe, best first. Bare `LIST` is the
    /// final fallback and is not part of this list.
    pub fn list_candidates(&self) -> &'static [&'static str] {
        match self {
            Self::MacOs => &["LIST -a"],
            _ => &["LIST -aL", "LIST -a", "LIST -L"],
        }
    }
}

impl Default for ServerDialect {
    fn default() -> Self {
        Self::Unknown
    }
}

// ─── FTP Response ────────────────────────────────────────────────────

/// The terminal line of a reply: `DDD message`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FtpResponse {
    pub code: u16,
    pub message: String,
}

impl FtpResponse {
    /// Whether this is a positive-preliminary reply (1xx).
    pub fn is_preliminary(&self) -> bool {
        (100..200).contains(&self.code)
    }

    /// Whether this is a positive-completion reply (2xx).
    pub fn is_completion(&self) -> bool {
        (200..300).contains(&self.code)
    }

    /// Whether this is a positive-intermediate reply (3xx).
    pub fn is_intermediate(&self) -> bool {
        (300..400).contains(&self.code)
    }

    pub fn is_failure(&self) -> bool {
        self.code >= 400
    }
}

impl fmt::Display for FtpResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.code, self.message)
    }
}

// ─── Credentials ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum CredentialOrigin {
    /// Embedded in the request URI.
    Request,
    /// A previous successful login for the same identity.
    Cache,
    SecretStore,
    Interactive,
    /// Fallback when nobody can be asked.
    Anonymous,
}

#[derive(Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Credential {
    pub username: String,
    pub password: String,
    pub origin: CredentialOrigin,
    /// Save to the secret store after a successful login.
    #[serde(default)]
    pub persist: bool,
}

impl Credential {
    pub fn new(
        username: impl Into<String>,
        password: impl Into<String>,
        origin: CredentialOrigin,
    ) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
            origin,
            persist: false,
        }
    }

    pub fn persisted(mut self) -> Self {
        self.persist = true;
        self
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("username", &self.username)
            .field("origin", &self.origin)
            .field("persist", &self.persist)
            .finish()
    }
}
