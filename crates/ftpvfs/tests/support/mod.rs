//! In-process FTP server and a recording credential resolver for the
//! integration tests.
//!
//! The server keeps an in-memory tree, speaks enough RFC 959 for the
//! backend (passive mode only) and counts every command verb it sees.

#![allow(dead_code)]

use async_trait::async_trait;
use ftpvfs::ftp::*;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;

// ─── Server state ────────────────────────────────────────────────────

#[derive(Debug, Clone)]
enum Node {
    Dir,
    File(Vec<u8>),
    Link(String),
}

/// How the server answers `AUTH GSSAPI`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GssapiMode {
    /// 502, like any verb the server does not know.
    Unsupported,
    /// 500 to `AUTH`; the session stays usable.
    Refuse,
    /// 334 to `AUTH`, then 535 to every `ADAT`.
    RejectToken,
    /// Close the control connection without answering `AUTH`.
    HangUp,
}

pub struct ServerState {
    nodes: BTreeMap<String, Node>,
    users: HashMap<String, String>,
    counts: HashMap<String, usize>,
    connections: usize,
    user_args: Vec<String>,
    pub gssapi: GssapiMode,
    pub allow_anonymous: bool,
    /// Answer `LIST -x` with 501, like servers without option support.
    pub reject_list_options: bool,
    /// Answer `PWD` with 421 and hang up, so pooled spares look dead.
    pub fail_probe: bool,
    pub system_type: String,
}

impl ServerState {
    fn new() -> Self {
        let mut nodes = BTreeMap::new();
        nodes.insert("/".to_string(), Node::Dir);
        let mut users = HashMap::new();
        users.insert("alice".to_string(), "secret".to_string());
        Self {
            nodes,
            users,
            counts: HashMap::new(),
            connections: 0,
            user_args: Vec::new(),
            gssapi: GssapiMode::Unsupported,
            allow_anonymous: true,
            reject_list_options: false,
            fail_probe: false,
            system_type: "UNIX Type: L8".to_string(),
        }
    }

    pub fn add_dir(&mut self, path: &str) {
        self.nodes.insert(path.to_string(), Node::Dir);
    }

    pub fn add_file(&mut self, path: &str, content: &[u8]) {
        self.nodes.insert(path.to_string(), Node::File(content.to_vec()));
    }

    pub fn add_link(&mut self, path: &str, target: &str) {
        self.nodes.insert(path.to_string(), Node::Link(target.to_string()));
    }

    pub fn add_user(&mut self, user: &str, password: &str) {
        self.users.insert(user.to_string(), password.to_string());
    }

    fn is_dir(&self, path: &str) -> bool {
        matches!(self.nodes.get(path), Some(Node::Dir))
    }

    fn children(&self, dir: &str) -> Vec<(String, Node)> {
        let prefix = if dir == "/" { "/".to_string() } else { format!("{}/", dir) };
        self.nodes
            .iter()
            .filter(|(p, _)| p.as_str() != "/" && p.starts_with(&prefix))
            .filter(|(p, _)| !p[prefix.len()..].contains('/'))
            .map(|(p, n)| (p[prefix.len()..].to_string(), n.clone()))
            .collect()
    }

    fn listing(&self, dir: &str) -> String {
        let mut out = String::from("total 8\r\n");
        for (name, node) in self.children(dir) {
            let line = match node {
                Node::Dir => format!("drwxr-xr-x 2 ftp ftp     4096 Jan  1  2024 {}\r\n", name),
                Node::File(data) => format!(
                    "-rw-r--r-- 1 ftp ftp {:>8} Jan  1  2024 {}\r\n",
                    data.len(),
                    name
                ),
                Node::Link(target) => format!(
                    "lrwxrwxrwx 1 ftp ftp {:>8} Jan  1  2024 {} -> {}\r\n",
                    target.len(),
                    name,
                    target
                ),
            };
            out.push_str(&line);
        }
        out
    }
}

// ─── Server ──────────────────────────────────────────────────────────

pub struct MockServer {
    pub addr: SocketAddr,
    state: Arc<Mutex<ServerState>>,
}

impl MockServer {
    pub async fn start() -> Self {
        Self::start_with(|_| {}).await
    }

    pub async fn start_with(setup: impl FnOnce(&mut ServerState)) -> Self {
        let mut initial = ServerState::new();
        setup(&mut initial);
        let state = Arc::new(Mutex::new(initial));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let shared = state.clone();
        tokio::spawn(async move {
            while let Ok((sock, _)) = listener.accept().await {
                shared.lock().unwrap().connections += 1;
                tokio::spawn(session(sock, shared.clone()));
            }
        });
        Self { addr, state }
    }

    pub fn with_state<R>(&self, f: impl FnOnce(&mut ServerState) -> R) -> R {
        f(&mut self.state.lock().unwrap())
    }

    /// How many times `verb` was received, across all connections.
    pub fn count(&self, verb: &str) -> usize {
        self.state.lock().unwrap().counts.get(verb).copied().unwrap_or(0)
    }

    /// Control connections accepted so far.
    pub fn connections(&self) -> usize {
        self.state.lock().unwrap().connections
    }

    /// Every `USER` argument received, in order.
    pub fn user_args(&self) -> Vec<String> {
        self.state.lock().unwrap().user_args.clone()
    }

    pub fn file(&self, path: &str) -> Option<Vec<u8>> {
        match self.state.lock().unwrap().nodes.get(path) {
            Some(Node::File(data)) => Some(data.clone()),
            _ => None,
        }
    }

    pub fn exists(&self, path: &str) -> bool {
        self.state.lock().unwrap().nodes.contains_key(path)
    }

    pub fn identity(&self) -> ConnectionIdentity {
        ConnectionIdentity::new("127.0.0.1", self.addr.port())
            .with_user("alice")
            .with_password("secret")
    }

    /// Location on this server, logged in as alice.
    pub fn uri(&self, path: &str) -> FtpUri {
        FtpUri::new(self.identity(), path)
    }

    /// Location without credentials; the resolver has to supply them.
    pub fn bare_uri(&self, path: &str) -> FtpUri {
        FtpUri::new(ConnectionIdentity::new("127.0.0.1", self.addr.port()), path)
    }
}

struct Session {
    cwd: String,
    user: Option<String>,
    rest: u64,
    passive: Option<TcpListener>,
    rename_from: Option<String>,
}

async fn reply(wr: &mut OwnedWriteHalf, line: &str) -> std::io::Result<()> {
    wr.write_all(format!("{}\r\n", line).as_bytes()).await
}

fn absolute(cwd: &str, arg: &str) -> String {
    let joined = if arg.starts_with('/') {
        arg.to_string()
    } else {
        format!("{}/{}", cwd, arg)
    };
    let mut parts: Vec<&str> = Vec::new();
    for part in joined.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            other => parts.push(other),
        }
    }
    format!("/{}", parts.join("/"))
}

async fn accept_data(session: &mut Session) -> Option<TcpStream> {
    let listener = session.passive.take()?;
    match tokio::time::timeout(Duration::from_secs(5), listener.accept()).await {
        Ok(Ok((sock, _))) => Some(sock),
        _ => None,
    }
}

async fn session(sock: TcpStream, state: Arc<Mutex<ServerState>>) {
    let (rd, mut wr) = sock.into_split();
    let mut rd = BufReader::new(rd);
    let mut s = Session {
        cwd: "/".to_string(),
        user: None,
        rest: 0,
        passive: None,
        rename_from: None,
    };
    if reply(&mut wr, "220-mock FTP server\r\n220 ready").await.is_err() {
        return;
    }

    let mut buf = String::new();
    loop {
        buf.clear();
        match rd.read_line(&mut buf).await {
            Ok(0) | Err(_) => return,
            Ok(_) => {}
        }
        let line = buf.trim_end().to_string();
        let (verb, arg) = match line.split_once(' ') {
            Some((v, a)) => (v.to_ascii_uppercase(), a.to_string()),
            None => (line.to_ascii_uppercase(), String::new()),
        };
        *state.lock().unwrap().counts.entry(verb.clone()).or_insert(0) += 1;

        match handle(&verb, &arg, &mut s, &state, &mut wr).await {
            Ok(true) => {}
            Ok(false) | Err(_) => return,
        }
    }
}

async fn handle(
    verb: &str,
    arg: &str,
    s: &mut Session,
    state: &Arc<Mutex<ServerState>>,
    wr: &mut OwnedWriteHalf,
) -> std::io::Result<bool> {
    match verb {
        "USER" => {
            state.lock().unwrap().user_args.push(arg.to_string());
            // a proxy login names the target as user@host[:port]
            let user = arg.split('@').next().unwrap_or(arg);
            s.user = Some(user.to_string());
            reply(wr, "331 Password required").await?;
        }
        "PASS" => {
            let ok = {
                let st = state.lock().unwrap();
                match s.user.as_deref() {
                    Some("anonymous") | Some("ftp") => st.allow_anonymous,
                    Some(user) => st.users.get(user).map_or(false, |p| p == arg),
                    None => false,
                }
            };
            if ok {
                reply(wr, "230 Logged in").await?;
            } else {
                reply(wr, "530 Login incorrect").await?;
            }
        }
        "TYPE" => reply(wr, "200 Type set").await?,
        "SYST" => {
            let syst = state.lock().unwrap().system_type.clone();
            reply(wr, &format!("215 {}", syst)).await?;
        }
        "PWD" => {
            if state.lock().unwrap().fail_probe {
                reply(wr, "421 Service not available").await?;
                return Ok(false);
            }
            reply(wr, &format!("257 \"{}\" is current directory", s.cwd)).await?;
        }
        "CWD" => {
            let path = absolute(&s.cwd, arg);
            if state.lock().unwrap().is_dir(&path) {
                s.cwd = path;
                reply(wr, "250 Directory changed").await?;
            } else {
                reply(wr, "550 No such directory").await?;
            }
        }
        "PASV" => {
            let listener = TcpListener::bind("127.0.0.1:0").await?;
            let port = listener.local_addr()?.port();
            s.passive = Some(listener);
            reply(
                wr,
                &format!("227 Entering Passive Mode (127,0,0,1,{},{})", port >> 8, port & 0xff),
            )
            .await?;
        }
        "REST" => match arg.parse::<u64>() {
            Ok(n) => {
                s.rest = n;
                reply(wr, &format!("350 Restarting at {}", n)).await?;
            }
            Err(_) => reply(wr, "501 Bad offset").await?,
        },
        "LIST" => {
            let reject = state.lock().unwrap().reject_list_options;
            if reject && arg.starts_with('-') {
                s.passive = None;
                reply(wr, "501 Unknown option").await?;
                return Ok(true);
            }
            let text = state.lock().unwrap().listing(&s.cwd);
            send_data(s, wr, text.as_bytes()).await?;
        }
        "RETR" => {
            let path = absolute(&s.cwd, arg);
            let data = match state.lock().unwrap().nodes.get(&path) {
                Some(Node::File(data)) => Some(data.clone()),
                _ => None,
            };
            match data {
                Some(data) => {
                    let start = (s.rest as usize).min(data.len());
                    send_data(s, wr, &data[start..]).await?;
                }
                None => {
                    s.passive = None;
                    reply(wr, "550 No such file").await?;
                }
            }
            s.rest = 0;
        }
        "STOR" => {
            let path = absolute(&s.cwd, arg);
            let parent_ok = state.lock().unwrap().is_dir(&absolute(&path, ".."));
            if !parent_ok || state.lock().unwrap().is_dir(&path) {
                s.passive = None;
                reply(wr, "550 Cannot store here").await?;
                return Ok(true);
            }
            reply(wr, "150 Ready for data").await?;
            let Some(mut data_sock) = accept_data(s).await else {
                reply(wr, "425 No data connection").await?;
                return Ok(true);
            };
            let mut received = Vec::new();
            data_sock.read_to_end(&mut received).await?;
            {
                let mut st = state.lock().unwrap();
                let mut content = match st.nodes.get(&path) {
                    Some(Node::File(old)) if s.rest > 0 => old.clone(),
                    _ => Vec::new(),
                };
                content.truncate(s.rest as usize);
                content.extend_from_slice(&received);
                st.nodes.insert(path, Node::File(content));
            }
            s.rest = 0;
            reply(wr, "226 Transfer complete").await?;
        }
        "DELE" => {
            let path = absolute(&s.cwd, arg);
            let removed = {
                let mut st = state.lock().unwrap();
                match st.nodes.get(&path) {
                    Some(Node::File(_)) | Some(Node::Link(_)) => st.nodes.remove(&path).is_some(),
                    _ => false,
                }
            };
            if removed {
                reply(wr, "250 Deleted").await?;
            } else {
                reply(wr, "550 No such file").await?;
            }
        }
        "MKD" => {
            let path = absolute(&s.cwd, arg);
            let created = {
                let mut st = state.lock().unwrap();
                if st.nodes.contains_key(&path) || !st.is_dir(&absolute(&path, "..")) {
                    false
                } else {
                    st.nodes.insert(path.clone(), Node::Dir);
                    true
                }
            };
            if created {
                reply(wr, &format!("257 \"{}\" created", path)).await?;
            } else {
                reply(wr, "550 Cannot create directory").await?;
            }
        }
        "RMD" => {
            let path = absolute(&s.cwd, arg);
            let removed = {
                let mut st = state.lock().unwrap();
                if st.is_dir(&path) && path != "/" && st.children(&path).is_empty() {
                    st.nodes.remove(&path);
                    true
                } else {
                    false
                }
            };
            if removed {
                reply(wr, "250 Removed").await?;
            } else {
                reply(wr, "550 Cannot remove directory").await?;
            }
        }
        "RNFR" => {
            let path = absolute(&s.cwd, arg);
            if state.lock().unwrap().nodes.contains_key(&path) {
                s.rename_from = Some(path);
                reply(wr, "350 Ready for RNTO").await?;
            } else {
                reply(wr, "550 No such file").await?;
            }
        }
        "RNTO" => {
            let Some(from) = s.rename_from.take() else {
                reply(wr, "503 RNFR first").await?;
                return Ok(true);
            };
            let to = absolute(&s.cwd, arg);
            {
                let mut st = state.lock().unwrap();
                let moved: Vec<(String, Node)> = st
                    .nodes
                    .iter()
                    .filter(|(p, _)| **p == from || p.starts_with(&format!("{}/", from)))
                    .map(|(p, n)| (p.clone(), n.clone()))
                    .collect();
                for (old, node) in moved {
                    st.nodes.remove(&old);
                    st.nodes.insert(format!("{}{}", to, &old[from.len()..]), node);
                }
            }
            reply(wr, "250 Renamed").await?;
        }
        "SITE" => reply(wr, "200 SITE command ok").await?,
        "AUTH" => {
            let mode = state.lock().unwrap().gssapi;
            match mode {
                GssapiMode::Unsupported => reply(wr, "502 Command not implemented").await?,
                GssapiMode::Refuse => reply(wr, "500 AUTH not understood").await?,
                GssapiMode::RejectToken => {
                    reply(wr, "334 Using authentication type GSSAPI; ADAT must follow").await?
                }
                GssapiMode::HangUp => return Ok(false),
            }
        }
        "ADAT" => reply(wr, "535 Failed security check").await?,
        "NOOP" => reply(wr, "200 ok").await?,
        "QUIT" => {
            reply(wr, "221 Goodbye").await?;
            return Ok(false);
        }
        _ => reply(wr, "502 Command not implemented").await?,
    }
    Ok(true)
}

/// `150`, push `payload` over the passive connection, close it, `226`.
async fn send_data(s: &mut Session, wr: &mut OwnedWriteHalf, payload: &[u8]) -> std::io::Result<()> {
    reply(wr, "150 Opening data connection").await?;
    let Some(mut data_sock) = accept_data(s).await else {
        return reply(wr, "425 No data connection").await;
    };
    let sent = data_sock.write_all(payload).await;
    let _ = data_sock.shutdown().await;
    drop(data_sock);
    match sent {
        Ok(()) => reply(wr, "226 Transfer complete").await,
        Err(_) => reply(wr, "426 Connection closed; transfer aborted").await,
    }
}

// ─── Credential resolver double ──────────────────────────────────────

/// Answers prompts from a script and records every call.
#[derive(Default)]
pub struct RecordingResolver {
    answers: Mutex<VecDeque<PromptResponse>>,
    secret_store: Mutex<Option<Credential>>,
    prompts: Mutex<Vec<bool>>,
    saved: Mutex<Vec<Credential>>,
    held: bool,
    entered: Notify,
    gate: Notify,
}

impl RecordingResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn answering(answers: Vec<PromptResponse>) -> Self {
        let resolver = Self::default();
        *resolver.answers.lock().unwrap() = answers.into();
        resolver
    }

    pub fn with_secret(self, credential: Credential) -> Self {
        *self.secret_store.lock().unwrap() = Some(credential);
        self
    }

    /// Make every prompt wait for `open_gate` before answering.
    pub fn held(mut self) -> Self {
        self.held = true;
        self
    }

    /// Resolves once a held prompt has started.
    pub async fn prompt_entered(&self) {
        self.entered.notified().await;
    }

    pub fn open_gate(&self) {
        self.gate.notify_one();
    }

    /// The `previous_attempt_failed` flag of every prompt, in order.
    pub fn prompts(&self) -> Vec<bool> {
        self.prompts.lock().unwrap().clone()
    }

    pub fn saved(&self) -> Vec<Credential> {
        self.saved.lock().unwrap().clone()
    }
}

#[async_trait]
impl CredentialResolver for RecordingResolver {
    async fn query_secret_store(&self, _identity: &ConnectionIdentity) -> Option<Credential> {
        self.secret_store.lock().unwrap().clone()
    }

    async fn prompt_user(
        &self,
        _identity: &ConnectionIdentity,
        previous_attempt_failed: bool,
    ) -> PromptResponse {
        self.prompts.lock().unwrap().push(previous_attempt_failed);
        if self.held {
            self.entered.notify_one();
            self.gate.notified().await;
        }
        self.answers
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(PromptResponse::Cancelled)
    }

    async fn save_credential(
        &self,
        _identity: &ConnectionIdentity,
        credential: &Credential,
    ) -> FtpResult<()> {
        self.saved.lock().unwrap().push(credential.clone());
        Ok(())
    }
}

pub fn interactive(user: &str, password: &str) -> Credential {
    Credential::new(user, password, CredentialOrigin::Interactive)
}

pub fn config() -> FtpVfsConfig {
    FtpVfsConfig::default()
}

// ─── Logging ─────────────────────────────────────────────────────────

/// Swallows every record but enables all levels, so `trace!` arguments
/// are evaluated.
struct TraceSink;

impl log::Log for TraceSink {
    fn enabled(&self, _metadata: &log::Metadata) -> bool {
        true
    }

    fn log(&self, record: &log::Record) {
        let _ = format!("{}", record.args());
    }

    fn flush(&self) {}
}

static TRACE_SINK: TraceSink = TraceSink;

pub fn enable_trace_logging() {
    // another test in this binary may have installed it already
    let _ = log::set_logger(&TRACE_SINK);
    log::set_max_level(log::LevelFilter::Trace);
}
