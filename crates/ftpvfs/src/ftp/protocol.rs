//! Low-level FTP command/response codec (RFC 959 §4).
//!
//! Handles:
//! - Sending commands terminated with `\r\n`, sealed when a security
//!   layer is active
//! - Reading replies: lines are consumed until one of the form
//!   `DDD text` arrives; continuation and junk lines are dropped
//! - Mapping reply codes onto [`FtpErrorKind`]

use crate::ftp::error::{classify_reply, FtpError, FtpErrorKind, FtpResult};
use crate::ftp::security::SecurityLayer;
use crate::ftp::types::FtpResponse;
use std::collections::VecDeque;
use std::future::Future;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// The FTP command/response codec operating on split halves.
pub struct FtpCodec {
    reader: BufReader<BoxedReader>,
    writer: BoxedWriter,
    security: Option<SecurityLayer>,
    /// Lines already unsealed but not yet consumed.
    pending: VecDeque<String>,
    max_line: usize,
    last: Option<FtpResponse>,
}

impl FtpCodec {
    /// Create a codec from a plain TCP stream.
    pub fn from_tcp(stream: TcpStream, max_line: usize) -> Self {
        let (rd, wr) = stream.into_split();
        Self::from_halves(Box::new(rd), Box::new(wr), max_line)
    }

    /// Create a codec from any duplex stream.
    pub fn from_stream<S>(stream: S, max_line: usize) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (rd, wr) = tokio::io::split(stream);
        Self::from_halves(Box::new(rd), Box::new(wr), max_line)
    }

    fn from_halves(reader: BoxedReader, writer: BoxedWriter, max_line: usize) -> Self {
        Self {
            reader: BufReader::new(reader),
            writer,
            security: None,
            pending: VecDeque::new(),
            max_line,
            last: None,
        }
    }

    // ─── Security layer ──────────────────────────────────────────

    pub fn set_security(&mut self, layer: SecurityLayer) {
        self.security = Some(layer);
    }

    pub fn clear_security(&mut self) -> Option<SecurityLayer> {
        self.security.take()
    }

    pub fn is_protected(&self) -> bool {
        self.security.is_some()
    }

    // ─── Commands ────────────────────────────────────────────────

    /// Send a raw FTP command (the trailing CRLF is added here).
    pub async fn send_command(&mut self, cmd: &str) -> FtpResult<()> {
        let line = match &mut self.security {
            Some(layer) => format!("{}\r\n", layer.wrap_command(cmd)?),
            None => format!("{}\r\n", cmd),
        };
        self.writer.write_all(line.as_bytes()).await?;
        self.writer.flush().await?;
        log::trace!(">>> {}", redact(cmd));
        Ok(())
    }

    /// Read one physical line (without CRLF).
    async fn read_line_raw(&mut self) -> FtpResult<String> {
        let limit = self.max_line as u64 + 2;
        let mut buf = Vec::new();
        let n = (&mut self.reader)
            .take(limit)
            .read_until(b'\n', &mut buf)
            .await?;
        if n == 0 {
            return Err(FtpError::transport("Server closed connection"));
        }
        if buf.last() != Some(&b'\n') {
            if n as u64 >= limit {
                return Err(FtpError::protocol_error(format!(
                    "Response line exceeds {} bytes",
                    self.max_line
                )));
            }
            return Err(FtpError::transport("Server closed connection mid-line"));
        }
        while matches!(buf.last(), Some(b'\n') | Some(b'\r')) {
            buf.pop();
        }
        Ok(String::from_utf8_lossy(&buf).into_owned())
    }

    /// Next logical line, unsealed if the session is protected.
    async fn next_line(&mut self) -> FtpResult<String> {
        loop {
            if let Some(line) = self.pending.pop_front() {
                return Ok(line);
            }
            let raw = self.read_line_raw().await?;
            match &mut self.security {
                Some(layer) => self.pending.extend(layer.unwrap_reply(&raw)?),
                None => return Ok(raw),
            }
        }
    }

    /// Read a complete FTP response.
    ///
    /// Multi-line responses look like:
    /// ```text
    /// 220-Welcome to my FTP server
    /// 220-This is line 2
    /// 220 End of greeting
    /// ```
    /// Only the terminating line is kept.
    pub async fn read_response(&mut self) -> FtpResult<FtpResponse> {
        loop {
            let line = self.next_line().await?;
            if let Some(resp) = parse_terminal_line(&line) {
                log::trace!("<<< {}", resp);
                self.last = Some(resp.clone());
                return Ok(resp);
            }
        }
    }

    /// Send a command and return the response, whatever its code.
    pub async fn execute(&mut self, cmd: &str) -> FtpResult<FtpResponse> {
        self.send_command(cmd).await?;
        self.read_response().await
    }

    /// Send a command and turn failure replies into errors; a 550 becomes
    /// `on_550`.
    pub async fn command(&mut self, cmd: &str, on_550: FtpErrorKind) -> FtpResult<FtpResponse> {
        let resp = self.execute(cmd).await?;
        check_reply(resp, on_550)
    }

    /// Read a reply for an already-sent command and map it like `command`.
    pub async fn expect_reply(&mut self, on_550: FtpErrorKind) -> FtpResult<FtpResponse> {
        let resp = self.read_response().await?;
        check_reply(resp, on_550)
    }

    /// The last reply read on this channel.
    pub fn last_response(&self) -> Option<&FtpResponse> {
        self.last.as_ref()
    }

    /// Close the write half so the server sees EOF.
    pub async fn shutdown(&mut self) -> FtpResult<()> {
        self.writer.shutdown().await?;
        Ok(())
    }
}

fn check_reply(resp: FtpResponse, on_550: FtpErrorKind) -> FtpResult<FtpResponse> {
    match classify_reply(resp.code, on_550) {
        None => Ok(resp),
        Some(kind) => Err(FtpError::new(kind, resp.to_string()).with_code(resp.code)),
    }
}

/// Parse `DDD text` (or a bare `DDD`). Any other shape is not a
/// terminating line.
pub fn parse_terminal_line(line: &str) -> Option<FtpResponse> {
    let bytes = line.as_bytes();
    if bytes.len() < 3 || !bytes[..3].iter().all(u8::is_ascii_digit) {
        return None;
    }
    let message = match bytes.get(3) {
        None => "",
        Some(b' ') => &line[4..],
        Some(_) => return None,
    };
    let code = line[..3].parse::<u16>().ok()?;
    Some(FtpResponse {
        code,
        message: message.to_string(),
    })
}

fn redact(cmd: &str) -> &str {
    if cmd.as_bytes().get(..5).map_or(false, |p| p.eq_ignore_ascii_case(b"PASS ")) {
        "PASS ****"
    } else {
        cmd
    }
}

/// Run `fut` unless `token` fires first, in which case `Cancelled` is
/// returned and `fut` is dropped mid-flight.
pub async fn cancellable<T, F>(token: &CancellationToken, fut: F) -> FtpResult<T>
where
    F: Future<Output = FtpResult<T>>,
{
    tokio::select! {
        biased;
        _ = token.cancelled() => Err(FtpError::cancelled()),
        res = fut => res,
    }
}
