//! Passive-mode data channel (RFC 959 §3.2, §4.1.3).
//!
//! A transfer is: `PASV` → connect to the advertised address → `REST n`
//! when resuming → the transfer command → a preliminary reply. Ending a
//! transfer closes the data socket and reads the final reply, keeping the
//! control channel in step.

use crate::ftp::connection::{split_path, FtpConnection};
use crate::ftp::error::{FtpError, FtpErrorKind, FtpResult};
use crate::ftp::protocol::cancellable;
use crate::ftp::types::AccessMode;
use lazy_static::lazy_static;
use regex::Regex;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufWriter};
use tokio::net::TcpStream;
use tokio::time::timeout;

lazy_static! {
    static ref PASV_ADDR: Regex =
        Regex::new(r"(\d{1,3}),(\d{1,3}),(\d{1,3}),(\d{1,3}),(\d{1,3}),(\d{1,3})").unwrap();
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferState {
    Idle,
    Active(AccessMode),
    /// A data-channel read or write failed; the connection is not reused.
    Error,
}

pub(crate) struct DataChannel {
    stream: BufWriter<TcpStream>,
    direction: AccessMode,
    /// The server already sent the final reply with the preliminary one.
    completed: bool,
}

/// Parse the host/port tuple out of a `227 Entering Passive Mode (...)`
/// reply.
pub fn parse_pasv_reply(message: &str) -> FtpResult<SocketAddr> {
    let caps = PASV_ADDR
        .captures(message)
        .ok_or_else(|| FtpError::protocol_error(format!("Cannot parse PASV reply: {}", message)))?;
    let mut parts = [0u8; 6];
    for (i, part) in parts.iter_mut().enumerate() {
        *part = caps[i + 1]
            .parse()
            .map_err(|_| FtpError::protocol_error(format!("Bad PASV octet in: {}", message)))?;
    }
    let ip = Ipv4Addr::new(parts[0], parts[1], parts[2], parts[3]);
    let port = (parts[4] as u16) << 8 | parts[5] as u16;
    Ok(SocketAddr::new(IpAddr::V4(ip), port))
}

impl FtpConnection {
    pub fn has_data_channel(&self) -> bool {
        self.data.is_some()
    }

    pub fn transfer_state(&self) -> TransferState {
        self.transfer
    }

    async fn open_passive(&mut self) -> FtpResult<TcpStream> {
        let resp = self.command("PASV").await?;
        let mut addr = parse_pasv_reply(&resp.message)?;
        if addr.ip().is_unspecified() {
            addr.set_ip(self.peer_ip());
        }
        log::trace!("[{}] data channel -> {}", self.id, addr);

        let token = self.cancel.clone();
        let data_timeout = self.config.data_timeout();
        let stream = cancellable(&token, async {
            timeout(data_timeout, TcpStream::connect(addr))
                .await
                .map_err(|_| FtpError::timeout(format!("Data connect to {} timed out", addr)))?
                .map_err(|e| FtpError::transport(format!("Data connect to {}: {}", addr, e)))
        })
        .await?;
        stream.set_nodelay(true).ok();
        Ok(stream)
    }

    /// Open a data channel and issue `cmd` on it, resuming from the
    /// connection's offset.
    pub async fn start_transfer(&mut self, cmd: &str, on_550: FtpErrorKind) -> FtpResult<()> {
        if self.data.is_some() {
            return Err(FtpError::new(
                FtpErrorKind::Internal,
                "A transfer is already in progress",
            ));
        }
        let direction = if cmd.starts_with("STOR") || cmd.starts_with("APPE") {
            AccessMode::Write
        } else {
            AccessMode::Read
        };

        let stream = self.open_passive().await?;
        if self.offset != 0 {
            self.command(&format!("REST {}", self.offset)).await?;
        }
        // On failure `stream` is dropped here, closing the data socket.
        let resp = self.command_550(cmd, on_550).await?;

        self.data = Some(DataChannel {
            stream: BufWriter::new(stream),
            direction,
            completed: resp.is_completion(),
        });
        self.transfer = TransferState::Active(direction);
        Ok(())
    }

    /// `RETR`/`STOR` style command on an absolute path.
    pub async fn start_path_transfer(
        &mut self,
        verb: &str,
        path: &str,
        on_550: FtpErrorKind,
    ) -> FtpResult<()> {
        let (parent, name) = split_path(path)?;
        self.cwd(parent, FtpErrorKind::NotFound).await?;
        self.start_transfer(&format!("{} {}", verb, name), on_550).await
    }

    /// Close the data channel and collect the final reply. A no-op when no
    /// transfer is running.
    pub async fn end_transfer(&mut self) -> FtpResult<()> {
        let Some(mut data) = self.data.take() else {
            return Ok(());
        };

        let token = self.cancel.clone();
        let mut result = Ok(());
        if data.direction == AccessMode::Write {
            result = cancellable(&token, async {
                data.stream.flush().await?;
                data.stream.shutdown().await?;
                Ok::<(), FtpError>(())
            })
            .await;
        }
        let completed = data.completed;
        let direction = data.direction;
        drop(data);

        if !completed {
            let reply = match self.read_reply(FtpErrorKind::NotFound).await {
                // we closed a download early; the control channel is fine
                Err(e) if direction == AccessMode::Read && matches!(e.code, Some(426) | Some(451)) => {
                    log::debug!("[{}] download cut short: {}", self.id, e);
                    Ok(())
                }
                other => other.map(|_| ()),
            };
            if result.is_ok() {
                result = reply;
            }
        }

        self.transfer = match &result {
            Ok(()) => TransferState::Idle,
            Err(_) => TransferState::Error,
        };
        result
    }

    /// Read from the data channel; `Ok(0)` at end of file.
    pub async fn read_data(&mut self, buf: &mut [u8]) -> FtpResult<usize> {
        let token = self.cancel.clone();
        let data = self
            .data
            .as_mut()
            .ok_or_else(|| FtpError::bad_parameters("No transfer in progress"))?;
        let result = cancellable(&token, async {
            Ok::<usize, FtpError>(data.stream.get_mut().read(buf).await?)
        })
        .await;
        match result {
            Ok(n) => {
                self.offset += n as u64;
                Ok(n)
            }
            Err(e) => {
                self.transfer = TransferState::Error;
                Err(e)
            }
        }
    }

    pub async fn write_data(&mut self, buf: &[u8]) -> FtpResult<usize> {
        let token = self.cancel.clone();
        let data = self
            .data
            .as_mut()
            .ok_or_else(|| FtpError::bad_parameters("No transfer in progress"))?;
        let result = cancellable(&token, async {
            data.stream.write_all(buf).await?;
            Ok::<usize, FtpError>(buf.len())
        })
        .await;
        match result {
            Ok(n) => {
                self.offset += n as u64;
                Ok(n)
            }
            Err(e) => {
                self.transfer = TransferState::Error;
                Err(e)
            }
        }
    }

    /// Drain the data channel to its end.
    pub async fn read_all_data(&mut self) -> FtpResult<Vec<u8>> {
        let mut out = Vec::new();
        let mut buf = vec![0u8; 16 * 1024];
        loop {
            let n = self.read_data(&mut buf).await?;
            if n == 0 {
                break;
            }
            out.extend_from_slice(&buf[..n]);
        }
        Ok(out)
    }

    // ─── Listings ────────────────────────────────────────────────

    /// Start a listing of the current directory. The first accepted LIST
    /// form is remembered on the pool entry for later connections.
    pub async fn start_listing(&mut self) -> FtpResult<()> {
        self.offset = 0;
        if let Some(cmd) = self.entry().list_command() {
            return self.start_transfer(&cmd, FtpErrorKind::NotFound).await;
        }

        for candidate in self.dialect().list_candidates() {
            match self.start_transfer(candidate, FtpErrorKind::NotFound).await {
                Ok(()) => {
                    self.entry().remember_list_command(candidate);
                    return Ok(());
                }
                Err(e) if e.is(FtpErrorKind::BadParameters) => {
                    log::debug!("[{}] server rejected '{}', trying next form", self.id, candidate);
                }
                Err(e) => return Err(e),
            }
        }

        self.start_transfer("LIST", FtpErrorKind::NotFound).await?;
        self.entry().remember_list_command("LIST");
        Ok(())
    }

    /// Raw listing text of the directory at `path`.
    pub async fn list_raw(&mut self, path: &str) -> FtpResult<String> {
        self.cwd(path, FtpErrorKind::NotADirectory).await?;
        self.start_listing().await?;
        let bytes = match self.read_all_data().await {
            Ok(bytes) => bytes,
            Err(e) => {
                self.data = None;
                return Err(e);
            }
        };
        self.end_transfer().await?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }
}
