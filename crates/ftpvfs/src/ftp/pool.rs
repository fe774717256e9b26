//! Connection pool: one entry per [`ConnectionIdentity`], each holding
//! spare logged-in connections, the server's system type, the last good
//! credential and the directory-listing cache.
//!
//! Locking: the registry lock is taken before an entry lock, never the
//! other way round, and neither is held across an `.await`.

use crate::ftp::cache::DirListingCache;
use crate::ftp::config::FtpVfsConfig;
use crate::ftp::connection::FtpConnection;
use crate::ftp::credentials::{CredentialResolver, PromptResponse};
use crate::ftp::error::{FtpError, FtpErrorKind, FtpResult};
use crate::ftp::protocol::cancellable;
use crate::ftp::security::SecurityProvider;
use crate::ftp::types::*;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::net::IpAddr;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tokio::time::{self, Duration, Instant};
use tokio_util::sync::CancellationToken;

// ─── Pool entry ──────────────────────────────────────────────────────

pub(crate) struct EntryState {
    ip: Option<IpAddr>,
    system_type: Option<String>,
    dialect: ServerDialect,
    credential: Option<(String, String)>,
    list_command: Option<String>,
    spares: VecDeque<FtpConnection>,
    checked_out: usize,
    /// Acquires still probing a spare or logging in (possibly waiting on
    /// a prompt). The entry must outlive them.
    pending: usize,
    subscribers: usize,
    last_used: Instant,
    dircache: DirListingCache,
}

/// Shared per-identity state. Connections keep a handle to their entry.
pub struct PoolEntry {
    pub identity: ConnectionIdentity,
    state: Mutex<EntryState>,
}

impl PoolEntry {
    fn new(identity: ConnectionIdentity, cache_ttl: Duration) -> Self {
        Self {
            identity,
            state: Mutex::new(EntryState {
                ip: None,
                system_type: None,
                dialect: ServerDialect::Unknown,
                credential: None,
                list_command: None,
                spares: VecDeque::new(),
                checked_out: 0,
                pending: 0,
                subscribers: 0,
                last_used: Instant::now(),
                dircache: DirListingCache::new(cache_ttl),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, EntryState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn cached_ip(&self) -> Option<IpAddr> {
        self.lock().ip
    }

    pub(crate) fn store_ip(&self, ip: IpAddr) {
        self.lock().ip = Some(ip);
    }

    pub fn system_type(&self) -> Option<String> {
        self.lock().system_type.clone()
    }

    pub fn dialect(&self) -> ServerDialect {
        self.lock().dialect
    }

    pub(crate) fn set_system_type(&self, syst: String, dialect: ServerDialect) {
        let mut st = self.lock();
        st.system_type = Some(syst);
        st.dialect = dialect;
    }

    pub fn list_command(&self) -> Option<String> {
        self.lock().list_command.clone()
    }

    pub(crate) fn remember_list_command(&self, cmd: &str) {
        self.lock().list_command = Some(cmd.to_string());
    }

    fn cached_credential(&self) -> Option<(String, String)> {
        self.lock().credential.clone()
    }

    // ─── Listing cache ───────────────────────────────────────────

    pub fn cached_listing(&self, path: &str) -> Option<String> {
        self.lock().dircache.get(path)
    }

    pub fn store_listing(&self, path: &str, text: String) {
        self.lock().dircache.put(path, text);
    }

    pub fn invalidate_listing(&self, path: &str) {
        self.lock().dircache.invalidate(path);
    }

    /// Forget the listing of the directory containing `path`.
    pub fn invalidate_parent(&self, path: &str) {
        self.lock().dircache.invalidate_parent(path);
    }
}

/// Marks an acquire in progress on an entry until it either checks a
/// connection out or is dropped (error or cancellation).
struct PendingCheckout {
    entry: Arc<PoolEntry>,
    done: bool,
}

impl PendingCheckout {
    /// Count the acquire as checked out, atomically with leaving pending.
    fn complete(mut self) {
        let mut st = self.entry.lock();
        st.pending = st.pending.saturating_sub(1);
        st.checked_out += 1;
        st.last_used = Instant::now();
        self.done = true;
    }
}

impl Drop for PendingCheckout {
    fn drop(&mut self) {
        if !self.done {
            let mut st = self.entry.lock();
            st.pending = st.pending.saturating_sub(1);
            st.last_used = Instant::now();
        }
    }
}

// ─── Stats / monitors ────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PoolStats {
    pub entries: usize,
    pub spare_connections: usize,
    pub checked_out: usize,
    pub subscribers: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReapReport {
    pub closed_connections: usize,
    pub removed_entries: usize,
    /// Some entry still needs another sweep later.
    pub keep_watching: bool,
}

/// A directory monitor registration. Only keeps the pool entry alive.
#[derive(Debug)]
pub struct MonitorHandle {
    pub(crate) identity: ConnectionIdentity,
    pub path: String,
}

// ─── Pool ────────────────────────────────────────────────────────────

struct Registry {
    entries: HashMap<ConnectionIdentity, Arc<PoolEntry>>,
    reaper: Option<tokio::task::JoinHandle<()>>,
}

pub struct ConnectionPool {
    config: Arc<FtpVfsConfig>,
    credentials: Arc<dyn CredentialResolver>,
    security: Option<Arc<dyn SecurityProvider>>,
    registry: Mutex<Registry>,
}

impl ConnectionPool {
    pub fn new(
        config: Arc<FtpVfsConfig>,
        credentials: Arc<dyn CredentialResolver>,
        security: Option<Arc<dyn SecurityProvider>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            credentials,
            security,
            registry: Mutex::new(Registry {
                entries: HashMap::new(),
                reaper: None,
            }),
        })
    }

    pub fn config(&self) -> &Arc<FtpVfsConfig> {
        &self.config
    }

    fn registry(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// The entry for `identity`, created on first use. Looking an entry up
    /// counts as use, so the reaper leaves it alone for a while.
    pub fn entry(&self, identity: &ConnectionIdentity) -> Arc<PoolEntry> {
        self.entry_with(identity, |_| {})
    }

    /// Look up or create the entry and run `f` on its state while the
    /// registry lock is still held, so no sweep can slip in between.
    fn entry_with(
        &self,
        identity: &ConnectionIdentity,
        f: impl FnOnce(&mut EntryState),
    ) -> Arc<PoolEntry> {
        let mut reg = self.registry();
        let ttl = self.config.dir_cache_ttl();
        let entry = reg
            .entries
            .entry(identity.clone())
            .or_insert_with(|| {
                log::debug!("FTP pool: new entry for {}", identity);
                Arc::new(PoolEntry::new(identity.clone(), ttl))
            })
            .clone();
        let mut st = entry.lock();
        st.last_used = Instant::now();
        f(&mut st);
        drop(st);
        entry
    }

    // ─── Checkout ────────────────────────────────────────────────

    /// Hand out a logged-in connection for `identity`: a probed spare if
    /// one is alive, a fresh connection otherwise.
    pub async fn acquire(
        self: &Arc<Self>,
        identity: &ConnectionIdentity,
        cancel: &CancellationToken,
    ) -> FtpResult<FtpConnection> {
        let entry = self.entry_with(identity, |st| st.pending += 1);
        let pending = PendingCheckout {
            entry: entry.clone(),
            done: false,
        };

        let mut conn = None;
        loop {
            let spare = entry.lock().spares.pop_front();
            let Some(mut spare) = spare else { break };
            spare.reset_for_reuse(cancel.clone());
            match spare.probe().await {
                Ok(()) => {
                    log::trace!("FTP pool: reusing [{}] for {}", spare.id, identity);
                    conn = Some(spare);
                    break;
                }
                Err(e) if e.is(FtpErrorKind::Cancelled) => return Err(e),
                Err(e) => log::debug!("FTP pool: spare [{}] is dead: {}", spare.id, e),
            }
        }

        let conn = match conn {
            Some(conn) => conn,
            None => self.create_connection(&entry, cancel).await?,
        };

        pending.complete();
        Ok(conn)
    }

    /// Return a connection. Errored connections and ones with a data
    /// channel still open are closed instead of kept.
    pub fn release(self: &Arc<Self>, mut conn: FtpConnection, had_error: bool) {
        let entry = conn.entry().clone();
        let destroy = had_error || conn.has_data_channel();
        let doomed = {
            let mut st = entry.lock();
            st.checked_out = st.checked_out.saturating_sub(1);
            st.last_used = Instant::now();
            if destroy {
                Some(conn)
            } else {
                conn.reset_for_reuse(CancellationToken::new());
                st.spares.push_front(conn);
                None
            }
        };
        if let Some(conn) = doomed {
            log::debug!("FTP pool: dropping [{}] for {}", conn.id, entry.identity);
        }
        self.ensure_reaper();
    }

    // ─── Connection setup ────────────────────────────────────────

    async fn create_connection(
        &self,
        entry: &Arc<PoolEntry>,
        cancel: &CancellationToken,
    ) -> FtpResult<FtpConnection> {
        let mut conn =
            FtpConnection::connect(entry.clone(), self.config.clone(), cancel.clone()).await?;

        let mut logged_in = false;
        if let Some(provider) = &self.security {
            match conn.negotiate_security(provider.as_ref()).await {
                Ok(()) => logged_in = true,
                Err(e) if e.is(FtpErrorKind::LoginFailed) => {
                    log::debug!("FTP pool: GSSAPI declined by {}: {}", entry.identity, e);
                }
                Err(e) if e.is(FtpErrorKind::Cancelled) => return Err(e),
                Err(e) => {
                    log::warn!("FTP pool: GSSAPI failed for {}, reconnecting: {}", entry.identity, e);
                    conn = FtpConnection::connect(entry.clone(), self.config.clone(), cancel.clone())
                        .await?;
                }
            }
        }

        if !logged_in {
            self.login(&mut conn, entry, cancel).await?;
        }
        conn.after_login().await?;
        log::info!("FTP pool: connection [{}] ready for {}", conn.id, entry.identity);
        Ok(conn)
    }

    /// Credential sources in order: request, entry cache, resolver cache,
    /// secret store, prompt loop. Anonymous when nobody can be asked.
    async fn login(
        &self,
        conn: &mut FtpConnection,
        entry: &PoolEntry,
        cancel: &CancellationToken,
    ) -> FtpResult<()> {
        let identity = &entry.identity;

        if let Some(credential) = self.request_credential(identity) {
            conn.login(&credential).await?;
            return self.remember(entry, &credential).await;
        }

        let mut previous_failed = false;
        if let Some((user, password)) = entry.cached_credential() {
            let credential = Credential::new(user, password, CredentialOrigin::Cache);
            match conn.login(&credential).await {
                Ok(()) => return Ok(()),
                Err(e) if e.is(FtpErrorKind::LoginFailed) => {
                    log::debug!("FTP pool: cached credential for {} rejected", identity);
                    entry.lock().credential = None;
                    previous_failed = true;
                }
                Err(e) => return Err(e),
            }
        }

        let remembered = cancellable(cancel, async {
            Ok(self.credentials.lookup_cached(identity).await)
        })
        .await?;
        let stored = match remembered {
            Some(c) => Some(c),
            None => {
                cancellable(cancel, async {
                    Ok(self.credentials.query_secret_store(identity).await)
                })
                .await?
            }
        };
        if let Some(credential) = stored {
            match conn.login(&credential).await {
                Ok(()) => return self.remember(entry, &credential).await,
                Err(e) if e.is(FtpErrorKind::LoginFailed) => previous_failed = true,
                Err(e) => return Err(e),
            }
        }

        for _ in 0..self.config.max_login_attempts {
            let answer = cancellable(cancel, async {
                Ok(self.credentials.prompt_user(identity, previous_failed).await)
            })
            .await?;
            match answer {
                PromptResponse::Provided(credential) => match conn.login(&credential).await {
                    Ok(()) => return self.remember(entry, &credential).await,
                    Err(e) if e.is(FtpErrorKind::LoginFailed) => previous_failed = true,
                    Err(e) => return Err(e),
                },
                PromptResponse::Cancelled => return Err(FtpError::cancelled()),
                PromptResponse::Unavailable => {
                    let credential = Credential::new(
                        self.config.anonymous_user.clone(),
                        self.config.anonymous_password.clone(),
                        CredentialOrigin::Anonymous,
                    );
                    conn.login(&credential).await?;
                    return self.remember(entry, &credential).await;
                }
            }
        }

        Err(FtpError::login_failed(format!(
            "Login to {} failed after {} attempts",
            identity, self.config.max_login_attempts
        )))
    }

    /// A complete credential carried by the request itself.
    fn request_credential(&self, identity: &ConnectionIdentity) -> Option<Credential> {
        match (&identity.username, &identity.password) {
            (Some(user), Some(password)) => {
                Some(Credential::new(user, password, CredentialOrigin::Request))
            }
            (Some(user), None) if user == &self.config.anonymous_user || user == "ftp" => {
                Some(Credential::new(
                    user,
                    self.config.anonymous_password.clone(),
                    CredentialOrigin::Anonymous,
                ))
            }
            _ => None,
        }
    }

    async fn remember(&self, entry: &PoolEntry, credential: &Credential) -> FtpResult<()> {
        if credential.persist && credential.origin == CredentialOrigin::Interactive {
            if let Err(e) = self.credentials.save_credential(&entry.identity, credential).await {
                log::warn!("FTP pool: could not save credential for {}: {}", entry.identity, e);
            }
        }
        entry.lock().credential = Some((credential.username.clone(), credential.password.clone()));
        Ok(())
    }

    // ─── Monitors ────────────────────────────────────────────────

    pub(crate) fn subscribe(&self, identity: &ConnectionIdentity) {
        self.entry_with(identity, |st| st.subscribers += 1);
    }

    pub(crate) fn unsubscribe(self: &Arc<Self>, identity: &ConnectionIdentity) {
        let entry = self.registry().entries.get(identity).cloned();
        if let Some(entry) = entry {
            let mut st = entry.lock();
            st.subscribers = st.subscribers.saturating_sub(1);
            st.last_used = Instant::now();
        }
        self.ensure_reaper();
    }

    // ─── Reaping ─────────────────────────────────────────────────

    fn ensure_reaper(self: &Arc<Self>) {
        let mut reg = self.registry();
        if reg.reaper.as_ref().map_or(false, |h| !h.is_finished()) {
            return;
        }
        let handle = match tokio::runtime::Handle::try_current() {
            Ok(handle) => handle,
            Err(_) => {
                log::warn!("FTP pool: no runtime, idle connections will not be reaped");
                return;
            }
        };
        reg.reaper = Some(handle.spawn(reaper_loop(
            Arc::downgrade(self),
            self.config.reap_interval(),
        )));
    }

    /// Sweep once as if the clock read `now`. Entries unused for at least
    /// the minimum lifetime lose their spares, and are dropped entirely
    /// when nothing is checked out and nobody is subscribed.
    pub async fn reap_idle(&self, now: Instant) -> ReapReport {
        let (report, doomed) = self.sweep(now);
        for conn in doomed {
            conn.close().await;
        }
        if report.closed_connections > 0 || report.removed_entries > 0 {
            log::info!(
                "FTP pool: reaped {} idle connections, {} entries",
                report.closed_connections,
                report.removed_entries
            );
        }
        report
    }

    fn sweep(&self, now: Instant) -> (ReapReport, Vec<FtpConnection>) {
        let min_lifetime = self.config.min_connection_lifetime();
        let mut report = ReapReport::default();
        let mut doomed = Vec::new();

        let mut reg = self.registry();
        reg.entries.retain(|_, entry| {
            let mut st = entry.lock();
            let idle = st.checked_out == 0 && st.pending == 0 && st.subscribers == 0;
            if now.saturating_duration_since(st.last_used) < min_lifetime {
                if !st.spares.is_empty() || idle {
                    report.keep_watching = true;
                }
                return true;
            }
            report.closed_connections += st.spares.len();
            doomed.extend(st.spares.drain(..));
            if idle {
                report.removed_entries += 1;
                false
            } else {
                true
            }
        });
        if !report.keep_watching {
            reg.reaper = None;
        }
        (report, doomed)
    }

    // ─── Introspection / teardown ────────────────────────────────

    pub fn stats(&self) -> PoolStats {
        let reg = self.registry();
        let mut stats = PoolStats {
            entries: reg.entries.len(),
            ..PoolStats::default()
        };
        for entry in reg.entries.values() {
            let st = entry.lock();
            stats.spare_connections += st.spares.len();
            stats.checked_out += st.checked_out;
            stats.subscribers += st.subscribers;
        }
        stats
    }

    /// Stop the reaper and close every spare connection.
    pub async fn shutdown(&self) {
        let doomed: Vec<FtpConnection> = {
            let mut reg = self.registry();
            if let Some(reaper) = reg.reaper.take() {
                reaper.abort();
            }
            let mut doomed = Vec::new();
            reg.entries.retain(|_, entry| {
                let mut st = entry.lock();
                doomed.extend(st.spares.drain(..));
                st.checked_out > 0 || st.pending > 0 || st.subscribers > 0
            });
            doomed
        };
        let n = doomed.len();
        for conn in doomed {
            conn.close().await;
        }
        log::info!("FTP pool: shut down, closed {} connections", n);
    }
}

impl Drop for ConnectionPool {
    fn drop(&mut self) {
        // Spares hold their entry; break the cycle.
        let mut reg = self.registry();
        if let Some(reaper) = reg.reaper.take() {
            reaper.abort();
        }
        for entry in reg.entries.values() {
            entry.lock().spares.clear();
        }
    }
}

async fn reaper_loop(pool: Weak<ConnectionPool>, interval: Duration) {
    let mut ticker = time::interval_at(Instant::now() + interval, interval);
    loop {
        ticker.tick().await;
        let Some(pool) = pool.upgrade() else { return };
        let report = pool.reap_idle(Instant::now()).await;
        if !report.keep_watching {
            log::trace!("FTP pool: reaper idle, stopping");
            return;
        }
    }
}
