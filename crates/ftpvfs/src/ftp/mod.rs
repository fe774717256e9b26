//! # ftpvfs: FTP backend for a virtual filesystem
//!
//! RFC 959 client core with the pieces a VFS backend needs:
//! - **RFC 959**: control channel, PASV, REST, LIST/RETR/STOR, RNFR/RNTO
//! - **RFC 2228**: `AUTH GSSAPI` / `ADAT` and `MIC`/`ENC` protected commands
//!
//! Architecture:
//! - `types`: identities, URIs, file info, modes, server dialects
//! - `error`: error taxonomy and reply-code mapping
//! - `config`: tunables (proxy, cache TTL, reaper timings)
//! - `protocol`: command/response engine over the control socket
//! - `security`: optional GSSAPI security layer
//! - `credentials`: credential resolver boundary
//! - `connection`: one control connection: connect, login, path commands
//! - `transfer`: PASV data channel, REST, LIST form fallback
//! - `parser`: Unix / Windows / NetWare LIST parsing
//! - `cache`: TTL directory-listing cache
//! - `pool`: per-identity connection pools, login sequence, reaper
//! - `handle`: open file handles (read/write/seek/tell/close)
//! - `directory`: listings, directory handles, file info
//! - `file_ops`: open/create, mkdir, rmdir, rename, delete
//! - `client`: `FtpVfs`, the client context owned by the caller

pub mod types;
pub mod error;
pub mod config;
pub mod protocol;
pub mod security;
pub mod credentials;
pub mod connection;
pub mod transfer;
pub mod parser;
pub mod cache;
pub mod pool;
pub mod handle;
pub mod directory;
pub mod file_ops;
pub mod client;

// Re-exports for lib.rs consumers
pub use types::*;
pub use error::{FtpError, FtpErrorKind, FtpResult};
pub use config::{FtpVfsConfig, ProxyConfig};
pub use credentials::{CredentialResolver, NonInteractive, PromptResponse};
pub use security::{ContextStep, ProtectionLevel, SecurityContext, SecurityProvider};
pub use handle::FileHandle;
pub use directory::DirectoryHandle;
pub use pool::{ConnectionPool, MonitorHandle, PoolStats, ReapReport};
pub use client::FtpVfs;
pub use tokio_util::sync::CancellationToken;
