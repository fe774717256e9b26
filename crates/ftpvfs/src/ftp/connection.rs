//! One FTP control connection.
//!
//! Lifecycle: `connect()` → optional GSSAPI negotiation → `login()` →
//! `after_login()` (TYPE I, SYST once per identity, Windows dir style) →
//! any number of operations → back to the pool or `close()`.
//!
//! A connection is owned by exactly one operation at a time and never
//! trusts the server-side working directory: path commands always `CWD`
//! to the absolute parent first.

use crate::ftp::config::FtpVfsConfig;
use crate::ftp::error::{FtpError, FtpErrorKind, FtpResult};
use crate::ftp::pool::PoolEntry;
use crate::ftp::protocol::{cancellable, FtpCodec};
use crate::ftp::security::{self, SecurityProvider};
use crate::ftp::transfer::{DataChannel, TransferState};
use crate::ftp::types::{Credential, FtpResponse, ServerDialect, DEFAULT_FTP_PORT};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

pub struct FtpConnection {
    pub id: String,
    pub(crate) codec: FtpCodec,
    entry: Arc<PoolEntry>,
    pub(crate) config: Arc<FtpVfsConfig>,
    peer_ip: IpAddr,
    /// Resume offset for the next transfer, and position of the current one.
    pub(crate) offset: u64,
    pub(crate) data: Option<DataChannel>,
    pub(crate) transfer: TransferState,
    pub(crate) cancel: CancellationToken,
}

impl FtpConnection {
    /// Open the control socket (directly or via the proxy) and read the
    /// greeting.
    pub async fn connect(
        entry: Arc<PoolEntry>,
        config: Arc<FtpVfsConfig>,
        cancel: CancellationToken,
    ) -> FtpResult<Self> {
        let (host, port) = match &config.proxy {
            Some(proxy) => (proxy.host.clone(), proxy.port),
            None => (entry.identity.host.clone(), entry.identity.port),
        };

        let ip = match entry.cached_ip() {
            Some(ip) => ip,
            None => {
                let ip = cancellable(&cancel, resolve(&host, port)).await?;
                entry.store_ip(ip);
                ip
            }
        };

        let addr = SocketAddr::new(ip, port);
        let tcp = cancellable(&cancel, async {
            timeout(config.connect_timeout(), TcpStream::connect(addr))
                .await
                .map_err(|_| FtpError::timeout(format!("TCP connect to {} timed out", addr)))?
                .map_err(|e| FtpError::transport(format!("TCP connect to {}: {}", addr, e)))
        })
        .await?;
        tcp.set_nodelay(true).ok();

        let mut conn = Self {
            id: Uuid::new_v4().to_string(),
            codec: FtpCodec::from_tcp(tcp, config.max_response_line_bytes),
            entry,
            config,
            peer_ip: ip,
            offset: 0,
            data: None,
            transfer: TransferState::Idle,
            cancel,
        };

        let banner = conn.read_reply(FtpErrorKind::NotFound).await?;
        let banner = if banner.is_preliminary() {
            // 120: service ready in nnn minutes
            conn.read_reply(FtpErrorKind::NotFound).await?
        } else {
            banner
        };
        log::debug!("[{}] connected to {} ({}): {}", conn.id, host, addr, banner);
        Ok(conn)
    }

    pub fn entry(&self) -> &Arc<PoolEntry> {
        &self.entry
    }

    pub fn peer_ip(&self) -> IpAddr {
        self.peer_ip
    }

    pub fn dialect(&self) -> ServerDialect {
        self.entry.dialect()
    }

    pub fn is_protected(&self) -> bool {
        self.codec.is_protected()
    }

    pub fn last_response(&self) -> Option<&FtpResponse> {
        self.codec.last_response()
    }

    /// Prepare a spare for a new owner.
    pub(crate) fn reset_for_reuse(&mut self, cancel: CancellationToken) {
        self.offset = 0;
        self.transfer = TransferState::Idle;
        self.cancel = cancel;
    }

    // ─── Commands ────────────────────────────────────────────────

    /// Send a command; failure replies become errors, 550 means `NotFound`.
    pub async fn command(&mut self, cmd: &str) -> FtpResult<FtpResponse> {
        self.command_550(cmd, FtpErrorKind::NotFound).await
    }

    /// Send a command with a context-specific meaning for 550.
    pub async fn command_550(&mut self, cmd: &str, on_550: FtpErrorKind) -> FtpResult<FtpResponse> {
        let token = self.cancel.clone();
        cancellable(&token, self.codec.command(cmd, on_550)).await
    }

    /// Send a command and return the reply whatever its code.
    pub async fn execute(&mut self, cmd: &str) -> FtpResult<FtpResponse> {
        let token = self.cancel.clone();
        cancellable(&token, self.codec.execute(cmd)).await
    }

    pub(crate) async fn read_reply(&mut self, on_550: FtpErrorKind) -> FtpResult<FtpResponse> {
        let token = self.cancel.clone();
        cancellable(&token, self.codec.expect_reply(on_550)).await
    }

    pub async fn cwd(&mut self, path: &str, on_550: FtpErrorKind) -> FtpResult<()> {
        self.command_550(&format!("CWD {}", path), on_550).await?;
        Ok(())
    }

    /// `CWD <parent>` then `<verb> <name>` for an absolute `path`.
    pub async fn path_command(
        &mut self,
        verb: &str,
        path: &str,
        on_550: FtpErrorKind,
    ) -> FtpResult<FtpResponse> {
        let (parent, name) = split_path(path)?;
        self.cwd(parent, FtpErrorKind::NotFound).await?;
        self.command_550(&format!("{} {}", verb, name), on_550).await
    }

    /// Cheap liveness check used before handing out a spare.
    pub async fn probe(&mut self) -> FtpResult<()> {
        self.command("PWD").await?;
        Ok(())
    }

    // ─── Login ───────────────────────────────────────────────────

    /// Try the GSSAPI security layer. See [`security::negotiate`].
    pub async fn negotiate_security(&mut self, provider: &dyn SecurityProvider) -> FtpResult<()> {
        let token = self.cancel.clone();
        let host = self.entry.identity.host.clone();
        let peer = self.peer_ip;
        cancellable(&token, security::negotiate(&mut self.codec, provider, &host, peer)).await
    }

    /// `USER` / `PASS`. Through a proxy the user becomes `user@host`.
    pub async fn login(&mut self, credential: &Credential) -> FtpResult<()> {
        let user = match &self.config.proxy {
            Some(_) => {
                let identity = &self.entry.identity;
                if identity.port == DEFAULT_FTP_PORT {
                    format!("{}@{}", credential.username, identity.host)
                } else {
                    format!("{}@{}:{}", credential.username, identity.host, identity.port)
                }
            }
            None => credential.username.clone(),
        };

        let resp = self.execute(&format!("USER {}", user)).await?;
        let resp = match resp.code {
            200..=299 => return Ok(()),
            331 => self.execute(&format!("PASS {}", credential.password)).await?,
            _ => resp,
        };
        if resp.is_completion() {
            log::debug!("[{}] logged in as {}", self.id, credential.username);
            return Ok(());
        }
        let err = FtpError::from_reply(resp.code, &resp.to_string(), FtpErrorKind::LoginFailed);
        match err.kind {
            FtpErrorKind::Transport => Err(err),
            _ => Err(FtpError::login_failed(resp.to_string()).with_code(resp.code)),
        }
    }

    /// Session setup after a successful login. `SYST` is only sent when
    /// the pool entry does not know the server yet.
    pub async fn after_login(&mut self) -> FtpResult<()> {
        self.command("TYPE I").await?;

        let dialect = if self.entry.system_type().is_some() {
            self.entry.dialect()
        } else {
            let syst = match self.command("SYST").await {
                Ok(resp) => resp.message,
                Err(e) if e.discards_connection() => return Err(e),
                Err(e) => {
                    log::debug!("[{}] SYST failed: {}", self.id, e);
                    String::new()
                }
            };
            let dialect = ServerDialect::from_system_type(&syst);
            log::debug!("[{}] system type {:?} -> {:?}", self.id, syst, dialect);
            self.entry.set_system_type(syst, dialect);
            dialect
        };

        if dialect == ServerDialect::WindowsNt {
            self.unix_dirstyle().await?;
        }
        Ok(())
    }

    /// IIS toggles between MS-DOS and Unix listings with `SITE DIRSTYLE`;
    /// if the reply says MS-DOS style "is on" we toggled the wrong way.
    async fn unix_dirstyle(&mut self) -> FtpResult<()> {
        match self.command("SITE DIRSTYLE").await {
            Ok(resp) if resp.message.contains("is on") => {
                self.command("SITE DIRSTYLE").await.map(|_| ()).or_else(soft)
            }
            Ok(_) => Ok(()),
            Err(e) => soft(e),
        }
    }

    // ─── Teardown ────────────────────────────────────────────────

    /// Say goodbye without waiting long for the answer, then drop.
    pub async fn close(mut self) {
        self.data = None;
        let quit = async {
            self.codec.send_command("QUIT").await?;
            self.codec.read_response().await
        };
        let _ = timeout(Duration::from_secs(1), quit).await;
        let _ = self.codec.shutdown().await;
        log::debug!("[{}] closed", self.id);
    }
}

/// Errors that leave the connection usable are ignored.
fn soft(e: FtpError) -> FtpResult<()> {
    if e.discards_connection() {
        Err(e)
    } else {
        Ok(())
    }
}

async fn resolve(host: &str, port: u16) -> FtpResult<IpAddr> {
    let mut addrs = tokio::net::lookup_host((host, port))
        .await
        .map_err(|e| FtpError::transport(format!("Cannot resolve {}: {}", host, e)))?;
    addrs
        .next()
        .map(|a| a.ip())
        .ok_or_else(|| FtpError::transport(format!("No address for {}", host)))
}

/// Split an absolute path into (parent, name); the root has no name.
pub(crate) fn split_path(path: &str) -> FtpResult<(&str, &str)> {
    let trimmed = path.trim_end_matches('/');
    match trimmed.rfind('/') {
        Some(pos) if pos + 1 < trimmed.len() => {
            let parent = if pos == 0 { "/" } else { &trimmed[..pos] };
            Ok((parent, &trimmed[pos + 1..]))
        }
        _ => Err(FtpError::bad_parameters(format!(
            "'{}' does not name a file",
            path
        ))),
    }
}
