//! Open file handles.
//!
//! A handle owns one checked-out connection with a running `RETR` or
//! `STOR`. Seeking ends that transfer and starts a new one with `REST`.

use crate::ftp::connection::FtpConnection;
use crate::ftp::error::{FtpError, FtpErrorKind, FtpResult};
use crate::ftp::pool::ConnectionPool;
use crate::ftp::types::{AccessMode, FtpUri, SeekWhence};
use std::sync::Arc;

pub struct FileHandle {
    pool: Arc<ConnectionPool>,
    conn: Option<FtpConnection>,
    uri: FtpUri,
    mode: AccessMode,
    /// Permissions to apply with `SITE CHMOD` once the upload is closed.
    chmod_on_close: Option<u32>,
    /// A failure left the connection in an unknown state.
    poisoned: bool,
}

impl FileHandle {
    pub(crate) fn new(
        pool: Arc<ConnectionPool>,
        conn: FtpConnection,
        uri: FtpUri,
        mode: AccessMode,
    ) -> Self {
        Self {
            pool,
            conn: Some(conn),
            uri,
            mode,
            chmod_on_close: None,
            poisoned: false,
        }
    }

    pub(crate) fn set_chmod_on_close(&mut self, permissions: Option<u32>) {
        self.chmod_on_close = permissions;
    }

    pub fn uri(&self) -> &FtpUri {
        &self.uri
    }

    pub fn mode(&self) -> AccessMode {
        self.mode
    }

    fn conn(&mut self) -> FtpResult<&mut FtpConnection> {
        self.conn
            .as_mut()
            .ok_or_else(|| FtpError::new(FtpErrorKind::Internal, "Handle already closed"))
    }

    fn note(&mut self, e: &FtpError) {
        if e.discards_connection() {
            self.poisoned = true;
        }
    }

    /// Read up to `buf.len()` bytes; `Ok(0)` means end of file.
    pub async fn read(&mut self, buf: &mut [u8]) -> FtpResult<usize> {
        if self.mode != AccessMode::Read {
            return Err(FtpError::bad_parameters("Handle is not open for reading"));
        }
        let result = self.conn()?.read_data(buf).await;
        if let Err(e) = &result {
            self.note(e);
        }
        result
    }

    /// Write all of `buf`.
    pub async fn write(&mut self, buf: &[u8]) -> FtpResult<usize> {
        if self.mode != AccessMode::Write {
            return Err(FtpError::new(
                FtpErrorKind::ReadOnly,
                "Handle is not open for writing",
            ));
        }
        let result = self.conn()?.write_data(buf).await;
        if let Err(e) = &result {
            self.note(e);
        }
        result
    }

    /// Restart the transfer at a new position. Seeking from the end is not
    /// possible without knowing the size, so it is refused.
    pub async fn seek(&mut self, whence: SeekWhence, offset: i64) -> FtpResult<u64> {
        let (verb, on_550) = match self.mode {
            AccessMode::Read => ("RETR", FtpErrorKind::NotFound),
            AccessMode::Write => ("STOR", FtpErrorKind::AccessDenied),
        };
        let path = self.uri.path.clone();
        let conn = self.conn()?;

        let target = match whence {
            SeekWhence::Start => offset,
            SeekWhence::Current => (conn.offset as i64).saturating_add(offset),
            SeekWhence::End => {
                return Err(FtpError::unsupported("Seeking from the end is not supported"))
            }
        };
        if target < 0 {
            return Err(FtpError::bad_parameters(format!(
                "Seek to negative offset {}",
                target
            )));
        }

        if let Err(e) = conn.end_transfer().await {
            log::debug!("[{}] ending transfer for seek: {}", conn.id, e);
            if e.discards_connection() {
                self.poisoned = true;
                return Err(e);
            }
        }

        let previous = conn.offset;
        conn.offset = target as u64;
        match conn.start_path_transfer(verb, &path, on_550).await {
            Ok(()) => Ok(target as u64),
            Err(e) => {
                conn.offset = previous;
                self.note(&e);
                Err(e)
            }
        }
    }

    pub fn tell(&self) -> u64 {
        self.conn.as_ref().map_or(0, |c| c.offset)
    }

    /// Finish the transfer and give the connection back to the pool.
    pub async fn close(mut self) -> FtpResult<()> {
        let Some(mut conn) = self.conn.take() else {
            return Ok(());
        };

        let mut result = conn.end_transfer().await;
        if result.is_ok() {
            if let Some(mode) = self.chmod_on_close {
                let cmd = format!("SITE CHMOD {:o}", mode);
                if let Err(e) = conn.path_command(&cmd, &self.uri.path, FtpErrorKind::NotFound).await {
                    log::debug!("[{}] {} failed: {}", conn.id, cmd, e);
                    if e.discards_connection() {
                        result = Err(e);
                    }
                }
            }
        }
        if self.mode == AccessMode::Write {
            conn.entry().invalidate_parent(&self.uri.path);
        }

        let had_error = self.poisoned
            || result.as_ref().err().map_or(false, FtpError::discards_connection);
        self.pool.release(conn, had_error);
        result
    }
}

impl Drop for FileHandle {
    fn drop(&mut self) {
        // Not closed: the transfer state is unknown, so the connection goes.
        if let Some(conn) = self.conn.take() {
            log::debug!("[{}] handle for {} dropped without close", conn.id, self.uri);
            self.pool.release(conn, true);
        }
    }
}
