//! # ftpvfs: FTP virtual-filesystem backend
//!
//! Speaks the FTP wire protocol directly over tokio sockets and exposes
//! file-system style operations to a dispatch layer:
//!   • Pooled control connections keyed by (host, port, user, password)
//!   • Plain, anonymous and GSSAPI-protected logins
//!   • PASV data channels with REST resume and seek
//!   • Directory listings with a short-lived per-identity cache
//!   • Pluggable credential resolution (cache, secret store, prompt)
//!   • Background reaping of idle connections and pool entries

pub mod ftp;
