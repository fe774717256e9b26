//! Error taxonomy for the FTP backend.
//!
//! Every failure surfaced by this crate carries one of a small, closed set of
//! kinds so callers can react without knowing server dialects. The raw reply
//! code and text are kept alongside for diagnostics.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Categorised FTP error.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FtpError {
    pub kind: FtpErrorKind,
    pub message: String,
    /// FTP reply code that triggered the error, if any.
    pub code: Option<u16>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum FtpErrorKind {
    /// Socket, connect or DNS failure. The connection is discarded.
    Transport,
    /// Malformed or unexpected server output.
    ProtocolError,
    /// Credentials rejected.
    LoginFailed,
    /// Permission denied by the server.
    AccessDenied,
    NotFound,
    /// Quota or disk full.
    NoSpace,
    /// File name not allowed.
    BadFile,
    BadParameters,
    /// Aborted by the caller or declined at the credential prompt.
    Cancelled,
    NotSupported,
    AlreadyExists,
    NotADirectory,
    IsADirectory,
    DirectoryNotEmpty,
    /// Symlink chain too long.
    TooManyLinks,
    /// Operation spans two different connection identities.
    NotSameFileSystem,
    /// Write attempted on a handle opened for reading.
    ReadOnly,
    /// Server-side failure (5xx) with no more specific meaning.
    Internal,
}

pub type FtpResult<T> = Result<T, FtpError>;

// ── Construction helpers ─────────────────────────────────────────────

impl FtpError {
    pub fn new(kind: FtpErrorKind, msg: impl Into<String>) -> Self {
        Self {
            kind,
            message: msg.into(),
            code: None,
        }
    }

    pub fn with_code(mut self, code: u16) -> Self {
        self.code = Some(code);
        self
    }

    // ── Convenience constructors ─────────────────────────────────

    pub fn transport(msg: impl Into<String>) -> Self {
        Self::new(FtpErrorKind::Transport, msg)
    }

    pub fn protocol_error(msg: impl Into<String>) -> Self {
        Self::new(FtpErrorKind::ProtocolError, msg)
    }

    pub fn login_failed(msg: impl Into<String>) -> Self {
        Self::new(FtpErrorKind::LoginFailed, msg)
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::new(FtpErrorKind::NotFound, msg)
    }

    pub fn bad_parameters(msg: impl Into<String>) -> Self {
        Self::new(FtpErrorKind::BadParameters, msg)
    }

    pub fn cancelled() -> Self {
        Self::new(FtpErrorKind::Cancelled, "Operation cancelled")
    }

    pub fn unsupported(msg: impl Into<String>) -> Self {
        Self::new(FtpErrorKind::NotSupported, msg)
    }

    pub fn already_exists(msg: impl Into<String>) -> Self {
        Self::new(FtpErrorKind::AlreadyExists, msg)
    }

    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::new(FtpErrorKind::Transport, msg)
    }

    /// Build the error for a reply that `classify_reply` rejected.
    ///
    /// `on_550` is the kind the current command wants a bare 550 to mean.
    pub fn from_reply(code: u16, text: &str, on_550: FtpErrorKind) -> Self {
        let kind = classify_reply(code, on_550).unwrap_or(FtpErrorKind::ProtocolError);
        Self {
            kind,
            message: text.to_string(),
            code: Some(code),
        }
    }

    /// Whether a connection that produced this error must be destroyed
    /// instead of going back to the spare list.
    pub fn discards_connection(&self) -> bool {
        matches!(
            self.kind,
            FtpErrorKind::Transport | FtpErrorKind::ProtocolError | FtpErrorKind::Cancelled
        )
    }

    pub fn is(&self, kind: FtpErrorKind) -> bool {
        self.kind == kind
    }
}

/// Map a reply code onto the taxonomy. `None` means the reply is a success.
pub fn classify_reply(code: u16, on_550: FtpErrorKind) -> Option<FtpErrorKind> {
    let kind = match code {
        331 | 332 | 530 | 532 => FtpErrorKind::LoginFailed,
        100..=399 => return None,
        421 | 426 => FtpErrorKind::Transport,
        425 => FtpErrorKind::AccessDenied,
        450 | 451 | 551 => FtpErrorKind::NotFound,
        452 | 552 => FtpErrorKind::NoSpace,
        501 | 504 => FtpErrorKind::BadParameters,
        550 => on_550,
        553 => FtpErrorKind::BadFile,
        400..=499 => FtpErrorKind::ProtocolError,
        500..=599 => FtpErrorKind::Internal,
        _ => FtpErrorKind::ProtocolError,
    };
    Some(kind)
}

impl fmt::Display for FtpErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl fmt::Display for FtpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(code) = self.code {
            write!(f, "[FTP {} {}] {}", self.kind, code, self.message)
        } else {
            write!(f, "[FTP {}] {}", self.kind, self.message)
        }
    }
}

impl std::error::Error for FtpError {}

impl From<std::io::Error> for FtpError {
    fn from(e: std::io::Error) -> Self {
        if e.kind() == std::io::ErrorKind::TimedOut {
            Self::timeout(format!("I/O timeout: {}", e))
        } else {
            Self::transport(e.to_string())
        }
    }
}

impl From<FtpError> for String {
    fn from(e: FtpError) -> String {
        e.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_success_codes_map_to_none() {
        for code in [150, 200, 226, 227, 250, 257, 350] {
            assert_eq!(classify_reply(code, FtpErrorKind::NotFound), None, "{}", code);
        }
    }

    #[test]
    fn test_login_codes() {
        for code in [331, 332, 530, 532] {
            assert_eq!(
                classify_reply(code, FtpErrorKind::NotFound),
                Some(FtpErrorKind::LoginFailed)
            );
        }
    }

    #[test]
    fn test_550_uses_override() {
        assert_eq!(
            classify_reply(550, FtpErrorKind::NotFound),
            Some(FtpErrorKind::NotFound)
        );
        assert_eq!(
            classify_reply(550, FtpErrorKind::AlreadyExists),
            Some(FtpErrorKind::AlreadyExists)
        );
        assert_eq!(
            classify_reply(550, FtpErrorKind::NotADirectory),
            Some(FtpErrorKind::NotADirectory)
        );
    }

    #[test]
    fn test_capacity_and_generic_codes() {
        let k = |c| classify_reply(c, FtpErrorKind::NotFound);
        assert_eq!(k(452), Some(FtpErrorKind::NoSpace));
        assert_eq!(k(552), Some(FtpErrorKind::NoSpace));
        assert_eq!(k(425), Some(FtpErrorKind::AccessDenied));
        assert_eq!(k(451), Some(FtpErrorKind::NotFound));
        assert_eq!(k(553), Some(FtpErrorKind::BadFile));
        assert_eq!(k(504), Some(FtpErrorKind::BadParameters));
        assert_eq!(k(421), Some(FtpErrorKind::Transport));
        assert_eq!(k(499), Some(FtpErrorKind::ProtocolError));
        assert_eq!(k(502), Some(FtpErrorKind::Internal));
    }

    #[test]
    fn test_from_reply_keeps_code_and_text() {
        let e = FtpError::from_reply(452, "452 Insufficient storage", FtpErrorKind::NotFound);
        assert_eq!(e.kind, FtpErrorKind::NoSpace);
        assert_eq!(e.code, Some(452));
        assert!(e.to_string().contains("NoSpace 452"));
        assert!(!e.discards_connection());
    }

    #[test]
    fn test_io_error_is_transport() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset");
        let e: FtpError = io.into();
        assert_eq!(e.kind, FtpErrorKind::Transport);
        assert!(e.discards_connection());
    }
}
