//! Directory operations: listings, directory handles, file info and
//! symlink following.

use crate::ftp::client::FtpVfs;
use crate::ftp::error::{FtpError, FtpErrorKind, FtpResult};
use crate::ftp::parser::parse_listing;
use crate::ftp::types::*;
use std::collections::VecDeque;
use tokio_util::sync::CancellationToken;

/// Entries of one directory, handed out one at a time.
#[derive(Debug, Clone, Default)]
pub struct DirectoryHandle {
    entries: VecDeque<FileInfo>,
}

impl DirectoryHandle {
    pub fn new(entries: Vec<FileInfo>) -> Self {
        Self {
            entries: entries.into(),
        }
    }

    /// `None` once every entry has been returned.
    pub fn next_entry(&mut self) -> Option<FileInfo> {
        self.entries.pop_front()
    }

    pub fn remaining(&self) -> usize {
        self.entries.len()
    }
}

impl Iterator for DirectoryHandle {
    type Item = FileInfo;

    fn next(&mut self) -> Option<FileInfo> {
        self.next_entry()
    }
}

impl FtpVfs {
    // ─── LIST ────────────────────────────────────────────────────

    /// Raw listing text for a directory, from the cache when fresh.
    pub(crate) async fn fetch_listing(
        &self,
        uri: &FtpUri,
        cancel: &CancellationToken,
    ) -> FtpResult<String> {
        let entry = self.pool.entry(&uri.identity);
        if let Some(text) = entry.cached_listing(&uri.path) {
            log::trace!("dircache hit for {}", uri);
            return Ok(text);
        }

        let mut conn = self.pool.acquire(&uri.identity, cancel).await?;
        let result = conn.list_raw(&uri.path).await;
        let text = self.finish(conn, result)?;
        entry.store_listing(&uri.path, text.clone());
        Ok(text)
    }

    /// Parsed entries of the directory at `uri`, without `.` and `..`.
    pub async fn list_directory(
        &self,
        uri: &FtpUri,
        cancel: &CancellationToken,
    ) -> FtpResult<Vec<FileInfo>> {
        let text = self.fetch_listing(uri, cancel).await?;
        let dialect = self.pool.entry(&uri.identity).dialect();
        Ok(parse_listing(&text, dialect))
    }

    /// Open a directory for iteration. With `follow_links`, symlink
    /// entries are replaced by what they point to where that resolves.
    pub async fn open_directory(
        &self,
        uri: &FtpUri,
        follow_links: bool,
        cancel: &CancellationToken,
    ) -> FtpResult<DirectoryHandle> {
        let mut entries = self.list_directory(uri, cancel).await?;
        if follow_links {
            for info in entries.iter_mut().filter(|i| i.kind == FileKind::Symlink) {
                match self.follow_symlink(uri, info.clone(), cancel).await {
                    Ok(resolved) => *info = resolved,
                    Err(e) if e.is(FtpErrorKind::Cancelled) => return Err(e),
                    Err(e) => log::debug!("cannot resolve {} in {}: {}", info.name, uri, e),
                }
            }
        }
        Ok(DirectoryHandle::new(entries))
    }

    // ─── File info ───────────────────────────────────────────────

    pub async fn get_file_info(
        &self,
        uri: &FtpUri,
        follow_links: bool,
        cancel: &CancellationToken,
    ) -> FtpResult<FileInfo> {
        if uri.is_root() {
            // Make sure the server is known before anyone parses listings.
            if self.pool.entry(&uri.identity).system_type().is_none() {
                let conn = self.pool.acquire(&uri.identity, cancel).await?;
                self.pool.release(conn, false);
            }
            return Ok(FileInfo::directory("/"));
        }

        let info = self.lookup(uri, cancel).await?;
        if follow_links && info.kind == FileKind::Symlink {
            return self.follow_symlink(&uri.parent(), info, cancel).await;
        }
        Ok(info)
    }

    /// Find `uri` in its parent's listing. Directories some servers hide
    /// from listings are found by changing into them.
    async fn lookup(&self, uri: &FtpUri, cancel: &CancellationToken) -> FtpResult<FileInfo> {
        let parent = uri.parent();
        let name = uri.name();
        let listing = match self.list_directory(&parent, cancel).await {
            Ok(entries) => entries,
            Err(e) if e.is(FtpErrorKind::NotADirectory) => {
                return Err(FtpError::not_found(format!("No such file: {}", uri)));
            }
            Err(e) => return Err(e),
        };
        if let Some(info) = listing.into_iter().find(|i| i.name == name) {
            return Ok(info);
        }

        let mut conn = self.pool.acquire(&uri.identity, cancel).await?;
        let result = conn.cwd(&uri.path, FtpErrorKind::NotFound).await;
        match self.finish(conn, result) {
            Ok(()) => Ok(FileInfo::directory(name)),
            Err(e) if e.is(FtpErrorKind::NotFound) => {
                Err(FtpError::not_found(format!("No such file: {}", uri)))
            }
            Err(e) => Err(e),
        }
    }

    /// Chase `link` (an entry of directory `dir`) to its final target.
    /// The result keeps the link's name and target, and takes everything
    /// else from what the chain ends at.
    pub(crate) async fn follow_symlink(
        &self,
        dir: &FtpUri,
        link: FileInfo,
        cancel: &CancellationToken,
    ) -> FtpResult<FileInfo> {
        let max = self.config().max_symlink_depth;
        let mut dir = dir.clone();
        let mut current = link.clone();
        let mut hops = 0;

        while current.kind == FileKind::Symlink {
            hops += 1;
            if hops > max {
                return Err(FtpError::new(
                    FtpErrorKind::TooManyLinks,
                    format!("More than {} levels of symlinks at {}", max, dir.join(&link.name)),
                ));
            }
            let target = current.symlink_target.clone().ok_or_else(|| {
                FtpError::protocol_error(format!("Symlink {} has no target", current.name))
            })?;

            let target_uri = if target.starts_with("ftp://") {
                let uri = FtpUri::parse(&target)?;
                if uri.identity.host != dir.identity.host || uri.identity.port != dir.identity.port {
                    return Err(FtpError::new(
                        FtpErrorKind::NotSameFileSystem,
                        format!("Symlink points to another server: {}", target),
                    ));
                }
                dir.with_path(&uri.path)
            } else {
                dir.resolve(&target)
            };

            if target_uri.is_root() {
                current = FileInfo::directory("/");
                break;
            }
            current = self.lookup(&target_uri, cancel).await?;
            dir = target_uri.parent();
        }

        let mut resolved = current;
        resolved.name = link.name;
        resolved.symlink_target = link.symlink_target;
        Ok(resolved)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_directory_handle_drains_in_order() {
        let mut handle = DirectoryHandle::new(vec![
            FileInfo::directory("a"),
            FileInfo::new("b", FileKind::Regular),
        ]);
        assert_eq!(handle.remaining(), 2);
        assert_eq!(handle.next_entry().unwrap().name, "a");
        assert_eq!(handle.next_entry().unwrap().name, "b");
        assert!(handle.next_entry().is_none());
    }

    #[test]
    fn test_directory_handle_iterates() {
        let handle = DirectoryHandle::new(vec![FileInfo::directory("x")]);
        let names: Vec<String> = handle.map(|i| i.name).collect();
        assert_eq!(names, vec!["x"]);
    }
}
