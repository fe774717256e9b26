//! File-level operations: open, create, mkdir, rmdir, rename, delete,
//! set_file_info.
//!
//! Every mutation drops the cached listing of the directory it touched.

use crate::ftp::client::FtpVfs;
use crate::ftp::connection::FtpConnection;
use crate::ftp::error::{FtpError, FtpErrorKind, FtpResult};
use crate::ftp::handle::FileHandle;
use crate::ftp::parser::parse_listing;
use crate::ftp::types::*;
use tokio_util::sync::CancellationToken;

impl FtpVfs {
    // ─── OPEN / CREATE ───────────────────────────────────────────

    /// Open a file for streaming. Read opens start a `RETR`, write opens a
    /// `STOR` that replaces the remote file.
    pub async fn open(
        &self,
        uri: &FtpUri,
        mode: AccessMode,
        cancel: &CancellationToken,
    ) -> FtpResult<FileHandle> {
        if uri.is_root() {
            return Err(FtpError::new(
                FtpErrorKind::IsADirectory,
                format!("Cannot open {} as a file", uri),
            ));
        }
        let (verb, on_550) = match mode {
            AccessMode::Read => ("RETR", FtpErrorKind::NotFound),
            AccessMode::Write => ("STOR", FtpErrorKind::AccessDenied),
        };
        if mode == AccessMode::Write {
            self.pool.entry(&uri.identity).invalidate_parent(&uri.path);
        }

        let mut conn = self.pool.acquire(&uri.identity, cancel).await?;
        match conn.start_path_transfer(verb, &uri.path, on_550).await {
            Ok(()) => {
                log::debug!("[{}] opened {} for {:?}", conn.id, uri, mode);
                Ok(FileHandle::new(self.pool.clone(), conn, uri.clone(), mode))
            }
            Err(e) => self.finish(conn, Err(e)),
        }
    }

    /// Create (or truncate) a file and open it for writing. `permissions`
    /// are applied when the handle is closed.
    pub async fn create(
        &self,
        uri: &FtpUri,
        exclusive: bool,
        permissions: Option<u32>,
        cancel: &CancellationToken,
    ) -> FtpResult<FileHandle> {
        if exclusive {
            self.ensure_absent(uri, cancel).await?;
        }
        let mut handle = self.open(uri, AccessMode::Write, cancel).await?;
        handle.set_chmod_on_close(permissions);
        Ok(handle)
    }

    async fn ensure_absent(&self, uri: &FtpUri, cancel: &CancellationToken) -> FtpResult<()> {
        match self.get_file_info(uri, false, cancel).await {
            Ok(_) => Err(FtpError::already_exists(format!("{} already exists", uri))),
            Err(e) if e.is(FtpErrorKind::NotFound) => Ok(()),
            Err(e) => Err(e),
        }
    }

    // ─── MKD ─────────────────────────────────────────────────────

    pub async fn make_directory(
        &self,
        uri: &FtpUri,
        permissions: Option<u32>,
        cancel: &CancellationToken,
    ) -> FtpResult<()> {
        if uri.is_root() {
            return Err(FtpError::already_exists("The root directory always exists"));
        }
        let mut conn = self.pool.acquire(&uri.identity, cancel).await?;
        let result = mkdir_on(&mut conn, uri, permissions).await;
        conn.entry().invalidate_parent(&uri.path);
        self.finish(conn, result)
    }

    // ─── RMD ─────────────────────────────────────────────────────

    pub async fn remove_directory(&self, uri: &FtpUri, cancel: &CancellationToken) -> FtpResult<()> {
        if uri.is_root() {
            return Err(FtpError::new(
                FtpErrorKind::AccessDenied,
                "Cannot remove the root directory",
            ));
        }
        let mut conn = self.pool.acquire(&uri.identity, cancel).await?;
        let result = rmdir_on(&mut conn, uri).await;
        let entry = conn.entry().clone();
        entry.invalidate_parent(&uri.path);
        entry.invalidate_listing(&uri.path);
        self.finish(conn, result)
    }

    // ─── RNFR / RNTO ─────────────────────────────────────────────

    pub async fn rename(
        &self,
        from: &FtpUri,
        to: &FtpUri,
        force_replace: bool,
        cancel: &CancellationToken,
    ) -> FtpResult<()> {
        if !self.check_same_fs(from, to) {
            return Err(FtpError::new(
                FtpErrorKind::NotSameFileSystem,
                format!("Cannot rename {} to {}", from, to),
            ));
        }
        if from.is_root() || to.is_root() {
            return Err(FtpError::bad_parameters("Cannot rename the root directory"));
        }
        if !force_replace {
            self.ensure_absent(to, cancel).await?;
        }

        let mut conn = self.pool.acquire(&from.identity, cancel).await?;
        let result = async {
            conn.path_command("RNFR", &from.path, FtpErrorKind::NotFound).await?;
            conn.command_550(&format!("RNTO {}", to.path), FtpErrorKind::AccessDenied)
                .await?;
            Ok::<(), FtpError>(())
        }
        .await;

        let entry = conn.entry().clone();
        entry.invalidate_parent(&from.path);
        entry.invalidate_parent(&to.path);
        entry.invalidate_listing(&from.path);
        self.finish(conn, result)
    }

    // ─── DELE ────────────────────────────────────────────────────

    pub async fn delete(&self, uri: &FtpUri, cancel: &CancellationToken) -> FtpResult<()> {
        let mut conn = self.pool.acquire(&uri.identity, cancel).await?;
        let result = conn
            .path_command("DELE", &uri.path, FtpErrorKind::NotFound)
            .await
            .map(|_| ());
        conn.entry().invalidate_parent(&uri.path);
        self.finish(conn, result)
    }

    // ─── SETATTR ─────────────────────────────────────────────────

    /// Only renaming within the same directory is possible over FTP.
    pub async fn set_file_info(
        &self,
        uri: &FtpUri,
        update: &FileInfoUpdate,
        cancel: &CancellationToken,
    ) -> FtpResult<()> {
        if update.permissions.is_some()
            || update.modified.is_some()
            || update.owner.is_some()
            || update.group.is_some()
        {
            return Err(FtpError::unsupported(
                "Only the name can be changed over FTP",
            ));
        }
        let Some(name) = &update.name else {
            return Ok(());
        };
        if name.is_empty() || name.contains('/') {
            return Err(FtpError::bad_parameters(format!("Invalid file name '{}'", name)));
        }
        let target = uri.parent().join(name);
        self.rename(uri, &target, false, cancel).await
    }
}

async fn mkdir_on(
    conn: &mut FtpConnection,
    uri: &FtpUri,
    permissions: Option<u32>,
) -> FtpResult<()> {
    match conn.cwd(&uri.path, FtpErrorKind::NotFound).await {
        Ok(()) => {
            return Err(FtpError::already_exists(format!("{} already exists", uri)));
        }
        Err(e) if e.discards_connection() => return Err(e),
        Err(_) => {}
    }

    if let Err(e) = conn.path_command("MKD", &uri.path, FtpErrorKind::AccessDenied).await {
        if e.code != Some(550) {
            return Err(e);
        }
        // A bare 550 may mean "exists" as a file; the parent listing tells.
        let parent = uri.parent();
        return match conn.list_raw(&parent.path).await {
            Ok(text) if parse_listing(&text, conn.dialect()).iter().any(|i| i.name == uri.name()) => {
                Err(FtpError::already_exists(format!("{} already exists", uri)))
            }
            Err(le) if le.discards_connection() => Err(le),
            _ => Err(e),
        };
    }

    if let Some(mode) = permissions {
        let cmd = format!("SITE CHMOD {:o}", mode);
        if let Err(e) = conn.path_command(&cmd, &uri.path, FtpErrorKind::NotFound).await {
            log::debug!("[{}] {} failed: {}", conn.id, cmd, e);
            if e.discards_connection() {
                return Err(e);
            }
        }
    }
    Ok(())
}

async fn rmdir_on(conn: &mut FtpConnection, uri: &FtpUri) -> FtpResult<()> {
    let err = match conn.path_command("RMD", &uri.path, FtpErrorKind::AccessDenied).await {
        Ok(_) => return Ok(()),
        Err(e) if e.code != Some(550) => return Err(e),
        Err(e) => e,
    };

    // Work out what the bare 550 meant.
    let parent = uri.parent();
    let siblings = match conn.list_raw(&parent.path).await {
        Ok(text) => parse_listing(&text, conn.dialect()),
        Err(le) if le.discards_connection() => return Err(le),
        Err(_) => return Err(FtpError::not_found(format!("No such directory: {}", uri))),
    };
    match siblings.iter().find(|i| i.name == uri.name()) {
        None => {
            // Hidden from the listing; it may still be a directory.
            match conn.list_raw(&uri.path).await {
                Ok(text) if !parse_listing(&text, conn.dialect()).is_empty() => Err(
                    FtpError::new(FtpErrorKind::DirectoryNotEmpty, format!("{} is not empty", uri)),
                ),
                Ok(_) => Err(err),
                Err(le) if le.discards_connection() => Err(le),
                Err(_) => Err(FtpError::not_found(format!("No such directory: {}", uri))),
            }
        }
        Some(info) if info.kind == FileKind::Regular => Err(FtpError::new(
            FtpErrorKind::NotADirectory,
            format!("{} is not a directory", uri),
        )),
        Some(_) => match conn.list_raw(&uri.path).await {
            Ok(text) if !parse_listing(&text, conn.dialect()).is_empty() => Err(FtpError::new(
                FtpErrorKind::DirectoryNotEmpty,
                format!("{} is not empty", uri),
            )),
            Err(le) if le.discards_connection() => Err(le),
            _ => Err(err),
        },
    }
}
