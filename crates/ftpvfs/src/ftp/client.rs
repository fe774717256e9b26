//! `FtpVfs`: the backend context a caller creates once and shares.
//!
//! Owns the connection pool. Operations are spread over `directory.rs`
//! and `file_ops.rs` as further `impl FtpVfs` blocks; each one checks a
//! connection out, runs, and releases it before returning.

use crate::ftp::config::FtpVfsConfig;
use crate::ftp::connection::FtpConnection;
use crate::ftp::credentials::CredentialResolver;
use crate::ftp::error::{FtpError, FtpResult};
use crate::ftp::pool::{ConnectionPool, MonitorHandle, PoolStats};
use crate::ftp::security::SecurityProvider;
use crate::ftp::types::FtpUri;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[derive(Clone)]
pub struct FtpVfs {
    pub(crate) pool: Arc<ConnectionPool>,
}

impl FtpVfs {
    pub fn new(config: FtpVfsConfig, credentials: Arc<dyn CredentialResolver>) -> FtpResult<Self> {
        config.validate()?;
        Ok(Self {
            pool: ConnectionPool::new(Arc::new(config), credentials, None),
        })
    }

    /// Like [`FtpVfs::new`], trying GSSAPI before any password login.
    pub fn with_security(
        config: FtpVfsConfig,
        credentials: Arc<dyn CredentialResolver>,
        provider: Arc<dyn SecurityProvider>,
    ) -> FtpResult<Self> {
        config.validate()?;
        Ok(Self {
            pool: ConnectionPool::new(Arc::new(config), credentials, Some(provider)),
        })
    }

    pub fn config(&self) -> &FtpVfsConfig {
        self.pool.config()
    }

    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    pub fn stats(&self) -> PoolStats {
        self.pool.stats()
    }

    /// Close all idle connections and stop the reaper.
    pub async fn shutdown(&self) {
        self.pool.shutdown().await;
    }

    /// Release `conn` according to `result` and pass the result on.
    pub(crate) fn finish<T>(&self, conn: FtpConnection, result: FtpResult<T>) -> FtpResult<T> {
        let had_error = result
            .as_ref()
            .err()
            .map_or(false, FtpError::discards_connection);
        self.pool.release(conn, had_error);
        result
    }

    // ─── Same filesystem ─────────────────────────────────────────

    /// Two locations are on the same filesystem when they share a
    /// connection identity.
    pub fn check_same_fs(&self, a: &FtpUri, b: &FtpUri) -> bool {
        a.identity == b.identity
    }

    // ─── Monitors ────────────────────────────────────────────────

    /// Register interest in a directory. No change events are produced;
    /// the registration keeps the pool entry (and its caches) alive.
    pub async fn monitor_add(
        &self,
        uri: &FtpUri,
        cancel: &CancellationToken,
    ) -> FtpResult<MonitorHandle> {
        let info = self.get_file_info(uri, true, cancel).await?;
        if !info.is_directory() {
            return Err(FtpError::unsupported(format!(
                "Only directories can be monitored: {}",
                uri
            )));
        }
        self.pool.subscribe(&uri.identity);
        log::debug!("monitor added for {}", uri);
        Ok(MonitorHandle {
            identity: uri.identity.clone(),
            path: uri.path.clone(),
        })
    }

    pub fn monitor_cancel(&self, handle: MonitorHandle) {
        log::debug!("monitor cancelled for {}", handle.path);
        self.pool.unsubscribe(&handle.identity);
    }
}
