//! rftp daemon: accept loop, per-connection sessions and command dispatch
//!
//! A session is a small state machine. It sits idle waiting for a frame, runs
//! one handler, sends exactly one response, and goes back to idle. QUIT and any
//! communication failure close it without a response. Handler errors that
//! leave the byte stream intact come back to the client as
//! `"Error: <message>"` responses under the request's own command tag.

use std::io;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::fs::{self as afs, File};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn, Instrument};
use uuid::Uuid;

use crate::config::ServerConfig;
use crate::confine::Confinement;
use crate::error::{FtpError, Result};
use crate::locks::{PathGuard, PathLocks};
use crate::protocol::timeouts::Timeouts;
use crate::protocol::{Command, Message, MAX_FRAME_SIZE};
use crate::protocol_core::{drain_raw_body, receive_framed, recv_raw_body, send_framed, send_raw_body};

pub struct Server {
    listener: TcpListener,
    config: ServerConfig,
    confinement: Arc<Confinement>,
    locks: PathLocks,
}

impl Server {
    pub async fn bind(config: ServerConfig) -> anyhow::Result<Self> {
        let confinement = Confinement::new(&config.root)
            .with_context(|| format!("Invalid root directory: {}", config.root.display()))?;
        let listener = TcpListener::bind(&config.bind)
            .await
            .with_context(|| format!("bind {}", config.bind))?;
        Ok(Self {
            listener,
            config,
            confinement: Arc::new(confinement),
            locks: PathLocks::new(),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn root(&self) -> &Path {
        self.confinement.root()
    }

    /// Accept connections forever.
    ///
    /// Sequential mode serves each connection to completion before the next
    /// accept; concurrent mode gives every connection its own task.
    pub async fn run(self) -> anyhow::Result<()> {
        info!(
            bind = %self.local_addr().map(|a| a.to_string()).unwrap_or_else(|_| self.config.bind.clone()),
            root = %self.root().display(),
            concurrent = self.config.concurrent_sessions,
            "rftp daemon listening"
        );
        loop {
            let (stream, peer) = match self.listener.accept().await {
                Ok(conn) => conn,
                Err(e) => {
                    error!("accept error: {}", e);
                    // Back off so fd exhaustion does not turn into a busy loop
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    continue;
                }
            };
            let _ = stream.set_nodelay(true);
            let session = Session::new(
                stream,
                self.confinement.clone(),
                self.locks.clone(),
                self.config.timeouts,
            );
            let span = tracing::info_span!("session", id = %Uuid::new_v4(), %peer);
            if self.config.concurrent_sessions {
                tokio::spawn(session.run().instrument(span));
            } else {
                session.run().instrument(span).await;
            }
        }
    }
}

/// What a handler wants sent back.
enum Outcome {
    Reply(Message),
    /// DOWNLOAD: the header, then exactly `len` raw bytes from `file`
    Stream {
        header: Message,
        file: File,
        len: u64,
        _guard: PathGuard,
    },
    Close,
}

// A LIST reply must fit in one control frame with room for the fixed fields
const MAX_LIST_BYTES: usize = MAX_FRAME_SIZE - 64;

// Room kept for the truncation marker line
const TRUNCATION_RESERVE: usize = 80;

/// Join entries one per line, cutting the listing short with a marker line
/// when it would exceed `budget` bytes.
fn join_listing(entries: &[String], budget: usize) -> String {
    let full: usize = entries.iter().map(|e| e.len() + 1).sum();
    if full <= budget {
        return entries.join("\n");
    }
    let mut out = String::new();
    let mut shown = 0;
    for entry in entries {
        if out.len() + entry.len() + 1 + TRUNCATION_RESERVE > budget {
            break;
        }
        if !out.is_empty() {
            out.push('\n');
        }
        out.push_str(entry);
        shown += 1;
    }
    warn!(shown, total = entries.len(), "listing truncated");
    if !out.is_empty() {
        out.push('\n');
    }
    out.push_str(&format!("... ({} of {} entries shown)", shown, entries.len()));
    out
}

fn missing(kind: &'static str) -> impl FnOnce(io::Error) -> FtpError {
    move |e| match e.kind() {
        io::ErrorKind::NotFound => FtpError::NotFound(kind),
        _ => FtpError::Io(e),
    }
}

/// One client connection and its private working directory.
pub struct Session<S> {
    stream: S,
    confinement: Arc<Confinement>,
    locks: PathLocks,
    timeouts: Timeouts,
    current_dir: PathBuf,
}

impl<S> Session<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn new(stream: S, confinement: Arc<Confinement>, locks: PathLocks, timeouts: Timeouts) -> Self {
        let current_dir = confinement.root().to_path_buf();
        Self {
            stream,
            confinement,
            locks,
            timeouts,
            current_dir,
        }
    }

    /// Serve commands until QUIT, disconnect or a fatal error.
    pub async fn run(mut self) {
        info!("connection opened");
        match self.serve().await {
            Ok(()) => info!("session closed"),
            Err(FtpError::Disconnected) => info!("peer disconnected"),
            Err(e) => warn!("closing connection: {}", e),
        }
        let _ = self.stream.shutdown().await;
    }

    async fn serve(&mut self) -> Result<()> {
        loop {
            let msg = receive_framed(&mut self.stream, self.timeouts.idle_ms, &self.timeouts).await?;
            debug!(
                command = %msg.command,
                argument = %msg.argument,
                data_size = msg.data_size,
                "request"
            );
            if !self.dispatch(msg).await? {
                return Ok(());
            }
        }
    }

    /// Run one command. Returns false once the session should close.
    async fn dispatch(&mut self, msg: Message) -> Result<bool> {
        let command = msg.command;
        let outcome = match command {
            Command::List => self.handle_list().await,
            Command::Cd => self.handle_change_dir(&msg.argument),
            Command::Pwd => Ok(Outcome::Reply(Message::new(
                Command::Pwd,
                self.confinement.display_path(&self.current_dir),
            ))),
            Command::Download => self.handle_download(&msg.argument).await,
            Command::Upload => self.handle_upload(&msg.argument, msg.data_size).await,
            Command::Mkdir => self.handle_make_dir(&msg.argument).await,
            Command::Rmdir => self.handle_remove_dir(&msg.argument).await,
            Command::Delete => self.handle_delete(&msg.argument).await,
            Command::Quit => Ok(Outcome::Close),
        };

        match outcome {
            Ok(Outcome::Reply(resp)) => {
                send_framed(&mut self.stream, &resp, &self.timeouts).await?;
            }
            Ok(Outcome::Stream {
                header,
                mut file,
                len,
                _guard,
            }) => {
                send_framed(&mut self.stream, &header, &self.timeouts).await?;
                // The header promised `len` bytes; anything short of that
                // leaves the client mid-body, so every failure here is fatal
                send_raw_body(&mut file, &mut self.stream, len, &self.timeouts, |_| {})
                    .await
                    .map_err(|e| match e {
                        e if e.is_fatal() => e,
                        other => FtpError::Connection(format!("download aborted mid-body: {}", other)),
                    })?;
                info!(file = %header.argument, bytes = len, "download complete");
            }
            Ok(Outcome::Close) => return Ok(false),
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => {
                warn!(command = %command, argument = %msg.argument, "{}", e);
                send_framed(&mut self.stream, &Message::error(command, &e), &self.timeouts).await?;
            }
        }
        Ok(true)
    }

    async fn handle_list(&mut self) -> Result<Outcome> {
        let mut dirs = Vec::new();
        let mut files = Vec::new();
        match afs::read_dir(&self.current_dir).await {
            Ok(mut rd) => loop {
                match rd.next_entry().await {
                    Ok(Some(entry)) => {
                        let name = entry.file_name().to_string_lossy().into_owned();
                        let is_dir = afs::metadata(entry.path())
                            .await
                            .map(|m| m.is_dir())
                            .unwrap_or(false);
                        if is_dir {
                            dirs.push(format!("{}/", name));
                        } else {
                            files.push(name);
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        warn!("listing cut short: {}", e);
                        break;
                    }
                }
            },
            Err(e) => warn!(dir = %self.current_dir.display(), "cannot list: {}", e),
        }
        dirs.sort();
        files.sort();

        let mut entries = Vec::with_capacity(dirs.len() + files.len() + 1);
        if self.current_dir.as_path() != self.confinement.root() {
            entries.push("../".to_string());
        }
        entries.extend(dirs);
        entries.extend(files);
        let listing = join_listing(&entries, MAX_LIST_BYTES);
        Ok(Outcome::Reply(Message::new(Command::List, listing)))
    }

    fn handle_change_dir(&mut self, path: &str) -> Result<Outcome> {
        let target = self.confinement.resolve_dir(&self.current_dir, path)?;
        self.current_dir = target;
        let shown = self.confinement.display_path(&self.current_dir);
        debug!(cwd = %shown, "changed directory");
        Ok(Outcome::Reply(Message::new(Command::Cd, shown)))
    }

    async fn handle_download(&mut self, name: &str) -> Result<Outcome> {
        let entry = self.confinement.entry(&self.current_dir, name)?;
        let path = self.confinement.ensure_within(&entry)?;
        let guard = self.locks.lock(&path).await;

        let meta = afs::metadata(&path).await.map_err(missing("File"))?;
        if !meta.is_file() {
            return Err(FtpError::NotARegularFile);
        }
        let file = File::open(&path).await.map_err(missing("File"))?;
        let len = file.metadata().await?.len();
        Ok(Outcome::Stream {
            header: Message::new(Command::Download, name).with_data_size(len),
            file,
            len,
            _guard: guard,
        })
    }

    fn upload_target(&self, name: &str) -> Result<PathBuf> {
        let entry = self.confinement.entry(&self.current_dir, name)?;
        let path = self.confinement.ensure_within(&entry)?;
        if path.is_dir() {
            return Err(FtpError::NotARegularFile);
        }
        Ok(path)
    }

    async fn handle_upload(&mut self, name: &str, size: u64) -> Result<Outcome> {
        // The client streams the body right after the request whatever we
        // decide, so a rejection must still consume it
        let path = match self.upload_target(name) {
            Ok(p) => p,
            Err(e) => {
                drain_raw_body(&mut self.stream, size, &self.timeouts).await?;
                return Err(e);
            }
        };
        let _guard = self.locks.lock(&path).await;

        let mut file = match File::create(&path).await {
            Ok(f) => f,
            Err(e) => {
                drain_raw_body(&mut self.stream, size, &self.timeouts).await?;
                return Err(e.into());
            }
        };
        recv_raw_body(&mut self.stream, &mut file, size, &self.timeouts, |_| {}).await?;
        file.sync_all().await?;

        info!(
            file = %self.confinement.display_path(&path),
            bytes = size,
            "upload complete"
        );
        Ok(Outcome::Reply(Message::new(Command::Upload, "File uploaded successfully")))
    }

    async fn handle_make_dir(&mut self, name: &str) -> Result<Outcome> {
        let path = self.confinement.entry(&self.current_dir, name)?;
        let _guard = self.locks.lock(&path).await;

        match afs::symlink_metadata(&path).await {
            Ok(_) => return Err(FtpError::AlreadyExists),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        afs::create_dir(&path).await.map_err(|e| match e.kind() {
            io::ErrorKind::AlreadyExists => FtpError::AlreadyExists,
            _ => FtpError::Io(e),
        })?;
        Ok(Outcome::Reply(Message::new(Command::Mkdir, "Directory created successfully")))
    }

    async fn handle_remove_dir(&mut self, name: &str) -> Result<Outcome> {
        let path = self.confinement.entry(&self.current_dir, name)?;
        let _guard = self.locks.lock(&path).await;

        // symlink_metadata: a link to a directory is not a directory to remove
        let meta = afs::symlink_metadata(&path).await.map_err(missing("Directory"))?;
        if !meta.is_dir() {
            return Err(FtpError::NotADirectory);
        }
        afs::remove_dir_all(&path).await?;
        Ok(Outcome::Reply(Message::new(Command::Rmdir, "Directory removed successfully")))
    }

    async fn handle_delete(&mut self, name: &str) -> Result<Outcome> {
        let path = self.confinement.entry(&self.current_dir, name)?;
        let _guard = self.locks.lock(&path).await;

        let meta = afs::symlink_metadata(&path).await.map_err(missing("File"))?;
        if meta.is_dir() {
            return Err(FtpError::NotARegularFile);
        }
        afs::remove_file(&path).await?;
        Ok(Outcome::Reply(Message::new(Command::Delete, "File deleted successfully")))
    }
}
