//! Optional GSSAPI security layer (RFC 2228).
//!
//! The actual mechanism is supplied by the caller through
//! [`SecurityProvider`]; this module only knows the FTP side of it:
//! the `AUTH GSSAPI` / `ADAT` token loop during login, and the
//! `MIC` / `ENC` command framing and `631`/`632`/`633` reply framing once
//! the session is protected.

use crate::ftp::error::{FtpError, FtpErrorKind, FtpResult};
use crate::ftp::protocol::FtpCodec;
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use std::net::IpAddr;

/// RFC 2228 protection levels. Commands are always sealed once a context
/// exists; `Private` additionally demands confidentiality.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtectionLevel {
    Clear,
    Safe,
    Private,
}

/// Result of one context-establishment step.
#[derive(Debug, Clone, PartialEq)]
pub enum ContextStep {
    /// Send this token and feed the server's answer into the next step.
    Continue(Vec<u8>),
    /// Context established; a final token may still have to be sent.
    Complete(Option<Vec<u8>>),
}

/// An established (or establishing) security context.
#[async_trait]
pub trait SecurityContext: Send {
    /// Advance context establishment with the server's previous token.
    async fn step(&mut self, input: Option<&[u8]>) -> FtpResult<ContextStep>;

    /// Wrap `plain`; returns the token and whether it was encrypted.
    fn seal(&mut self, plain: &[u8], confidential: bool) -> FtpResult<(Vec<u8>, bool)>;

    /// Unwrap a token; returns the payload and whether it was encrypted.
    fn unseal(&mut self, token: &[u8]) -> FtpResult<(Vec<u8>, bool)>;
}

/// Factory for security contexts, injected into the client context.
pub trait SecurityProvider: Send + Sync {
    /// Start a context for the server `host` reached at `peer`.
    fn initiate(&self, host: &str, peer: IpAddr) -> FtpResult<Box<dyn SecurityContext>>;

    /// Name sent with `USER` once the context is established.
    fn local_user(&self) -> Option<String> {
        std::env::var("USER")
            .or_else(|_| std::env::var("USERNAME"))
            .ok()
    }
}

/// Per-connection wrapper that frames control-channel traffic.
pub struct SecurityLayer {
    context: Box<dyn SecurityContext>,
    level: ProtectionLevel,
}

impl SecurityLayer {
    pub fn new(context: Box<dyn SecurityContext>, level: ProtectionLevel) -> Self {
        Self { context, level }
    }

    pub fn level(&self) -> ProtectionLevel {
        self.level
    }

    /// Turn `cmd` into `MIC <token>` or `ENC <token>`.
    pub fn wrap_command(&mut self, cmd: &str) -> FtpResult<String> {
        let confidential = self.level == ProtectionLevel::Private;
        let plain = format!("{}\r\n", cmd);
        let (token, encrypted) = self.context.seal(plain.as_bytes(), confidential)?;
        if confidential && !encrypted {
            return Err(FtpError::protocol_error(
                "Security context did not encrypt a private command",
            ));
        }
        let verb = if confidential { "ENC" } else { "MIC" };
        Ok(format!("{} {}", verb, STANDARD.encode(token)))
    }

    /// Decode a protected reply line into the plain reply lines it carries.
    /// Lines that are not `63x` replies pass through untouched.
    pub fn unwrap_reply(&mut self, line: &str) -> FtpResult<Vec<String>> {
        let code = line.get(..3).unwrap_or("");
        if !matches!(code, "631" | "632" | "633") {
            return Ok(vec![line.to_string()]);
        }
        let payload = line.get(4..).unwrap_or("").trim();
        let token = STANDARD
            .decode(payload)
            .map_err(|e| FtpError::protocol_error(format!("Bad protected reply: {}", e)))?;
        let (plain, encrypted) = self.context.unseal(&token)?;
        if code == "631" && !encrypted {
            return Err(FtpError::protocol_error(
                "Confidential reply arrived without encryption",
            ));
        }
        let text = String::from_utf8_lossy(&plain);
        Ok(text
            .trim_end_matches('\0')
            .split('\n')
            .map(|l| l.trim_end_matches('\r').to_string())
            .filter(|l| !l.is_empty())
            .collect())
    }
}

// ─── Negotiation ─────────────────────────────────────────────────────

/// Run `AUTH GSSAPI`, the `ADAT` token loop, and the protected `USER`.
///
/// On success the codec is protected and the session is logged in.
/// `LoginFailed` means the server declined GSSAPI but the control
/// connection is still usable for a plain login; any other error leaves
/// the connection in an unknown state.
pub async fn negotiate(
    codec: &mut FtpCodec,
    provider: &dyn SecurityProvider,
    host: &str,
    peer: IpAddr,
) -> FtpResult<()> {
    let auth = codec.execute("AUTH GSSAPI").await?;
    if auth.code != 334 {
        return Err(FtpError::login_failed(format!("AUTH GSSAPI refused: {}", auth)).with_code(auth.code));
    }

    let mut context = provider.initiate(host, peer)?;
    let mut server_token: Option<Vec<u8>> = None;
    loop {
        let step = context.step(server_token.as_deref()).await?;
        let (token, done) = match step {
            ContextStep::Continue(t) => (Some(t), false),
            ContextStep::Complete(t) => (t, true),
        };

        if let Some(token) = token.filter(|t| !t.is_empty()) {
            let resp = codec.execute(&format!("ADAT {}", STANDARD.encode(&token))).await?;
            if resp.code != 235 && resp.code != 335 {
                return Err(FtpError::login_failed(format!("ADAT rejected: {}", resp)).with_code(resp.code));
            }
            server_token = match resp.message.find("ADAT=") {
                Some(pos) => {
                    let encoded = resp.message[pos + 5..].trim();
                    Some(STANDARD.decode(encoded).map_err(|e| {
                        FtpError::protocol_error(format!("Bad ADAT reply token: {}", e))
                    })?)
                }
                None => None,
            };
        } else if !done {
            return Err(FtpError::protocol_error("Security context produced an empty token"));
        }

        if done {
            break;
        }
    }

    codec.set_security(SecurityLayer::new(context, ProtectionLevel::Safe));
    log::debug!("GSSAPI context established with {}", host);

    let user = provider
        .local_user()
        .ok_or_else(|| FtpError::login_failed("No local user name for GSSAPI login"))?;
    let resp = codec.execute(&format!("USER {}", user)).await?;
    if resp.is_completion() {
        return Ok(());
    }
    if resp.code >= 500 {
        codec.clear_security();
        return Err(FtpError::new(
            FtpErrorKind::ProtocolError,
            format!("GSSAPI USER rejected: {}", resp),
        )
        .with_code(resp.code));
    }
    Err(FtpError::login_failed(format!("GSSAPI login incomplete: {}", resp)).with_code(resp.code))
}
