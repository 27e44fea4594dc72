//! rftp client: one connection, one method per protocol command
//!
//! Every operation is a single request/response round trip. DOWNLOAD and
//! UPLOAD additionally move a raw body whose length the control message
//! declared. After a fatal error (malformed frame, short read, deadline) the
//! connection is dropped and later calls fail with "not connected"; nothing is
//! retried automatically.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tempfile::NamedTempFile;
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::time::{timeout, Duration};
use tracing::{debug, info, warn};

use crate::config::ClientConfig;
use crate::error::{FtpError, Result};
use crate::progress::{Direction, NoopObserver, TransferObserver, TransferProgress};
use crate::protocol::timeouts::Timeouts;
use crate::protocol::{Command, Message, Response};
use crate::protocol_core::{drain_raw_body, receive_framed, recv_raw_body, send_framed, send_raw_body};

pub struct Client {
    config: ClientConfig,
    stream: Option<TcpStream>,
    observer: Arc<dyn TransferObserver>,
}

/// Check a decoded response against the command that was sent.
fn expect(expected: Command, msg: Message) -> Result<Message> {
    match Response::from(msg) {
        Response::Error { message, .. } => Err(FtpError::Remote(message)),
        Response::Ok(m) if m.command != expected => {
            if m.data_size > 0 {
                // A body we did not ask for may already be on its way
                Err(FtpError::Connection(format!(
                    "unexpected {} response declaring a {}-byte body",
                    m.command, m.data_size
                )))
            } else {
                Err(FtpError::ProtocolViolation {
                    expected,
                    actual: m.command,
                })
            }
        }
        Response::Ok(m) => Ok(m),
    }
}

fn open_part(dir: &Path) -> std::io::Result<(NamedTempFile, File)> {
    let part = tempfile::Builder::new()
        .prefix(".rftp-")
        .suffix(".part")
        .tempfile_in(dir)?;
    let file = File::from_std(part.as_file().try_clone()?);
    Ok((part, file))
}

/// Read a download body into a fresh temp file in `dir`.
async fn receive_to_part(
    stream: &mut TcpStream,
    dir: &Path,
    t: &Timeouts,
    progress: &mut TransferProgress,
    observer: &dyn TransferObserver,
) -> Result<NamedTempFile> {
    let total = progress.total;
    // The header already arrived, so the body must be consumed either way
    let (part, mut file) = match open_part(dir) {
        Ok(opened) => opened,
        Err(e) => {
            drain_raw_body(stream, total, t).await?;
            return Err(e.into());
        }
    };
    recv_raw_body(stream, &mut file, total, t, |n| {
        progress.transferred = n;
        observer.advanced(&*progress);
    })
    .await?;
    Ok(part)
}

impl Client {
    pub fn new(config: ClientConfig) -> Self {
        Self {
            config,
            stream: None,
            observer: Arc::new(NoopObserver),
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn TransferObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    pub async fn connect(&mut self) -> Result<()> {
        let addr = self.config.server.clone();
        let ms = self.config.timeouts.connect_ms;
        let stream = match timeout(Duration::from_millis(ms), TcpStream::connect(&addr)).await {
            Ok(Ok(s)) => s,
            Ok(Err(e)) => return Err(FtpError::Connection(format!("connect {}: {}", addr, e))),
            Err(_) => {
                return Err(FtpError::Connection(format!(
                    "connect {}: timeout ({} ms)",
                    addr, ms
                )))
            }
        };
        let _ = stream.set_nodelay(true);
        info!(server = %addr, "connected");
        self.stream = Some(stream);
        Ok(())
    }

    fn stream(&mut self) -> Result<&mut TcpStream> {
        self.stream
            .as_mut()
            .ok_or_else(|| FtpError::Connection("not connected".to_string()))
    }

    /// Drop the connection when `res` carries a fatal error.
    fn check<T>(&mut self, res: Result<T>) -> Result<T> {
        if let Err(e) = &res {
            if e.is_fatal() && self.stream.take().is_some() {
                warn!("dropping connection: {}", e);
            }
        }
        res
    }

    async fn send(&mut self, msg: &Message) -> Result<()> {
        debug!(command = %msg.command, argument = %msg.argument, "request");
        let t = self.config.timeouts;
        let stream = self.stream()?;
        let res = send_framed(stream, msg, &t).await;
        self.check(res)
    }

    async fn receive(&mut self, expected: Command) -> Result<Message> {
        let t = self.config.timeouts;
        let stream = self.stream()?;
        let res = receive_framed(stream, t.io_ms, &t).await;
        let msg = self.check(res)?;
        let res = expect(expected, msg);
        self.check(res)
    }

    async fn round_trip(&mut self, request: Message) -> Result<Message> {
        let command = request.command;
        self.send(&request).await?;
        self.receive(command).await
    }

    /// Entries of the server's current directory; directories end in `/`.
    pub async fn list_files(&mut self) -> Result<Vec<String>> {
        let resp = self.round_trip(Message::new(Command::List, "")).await?;
        Ok(resp
            .argument
            .split('\n')
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect())
    }

    /// Returns the new working directory as the server displays it.
    pub async fn change_directory(&mut self, path: &str) -> Result<String> {
        Ok(self.round_trip(Message::new(Command::Cd, path)).await?.argument)
    }

    pub async fn print_working_directory(&mut self) -> Result<String> {
        Ok(self.round_trip(Message::new(Command::Pwd, "")).await?.argument)
    }

    pub async fn create_directory(&mut self, name: &str) -> Result<()> {
        self.round_trip(Message::new(Command::Mkdir, name)).await?;
        Ok(())
    }

    pub async fn remove_directory(&mut self, name: &str) -> Result<()> {
        self.round_trip(Message::new(Command::Rmdir, name)).await?;
        Ok(())
    }

    pub async fn delete_file(&mut self, name: &str) -> Result<()> {
        self.round_trip(Message::new(Command::Delete, name)).await?;
        Ok(())
    }

    /// Fetch `name` from the server's working directory into the download
    /// directory. The body lands in a temp file that is only renamed into
    /// place once every declared byte arrived, so a failed transfer leaves
    /// nothing behind.
    pub async fn download_file(&mut self, name: &str) -> Result<PathBuf> {
        let local_name = Path::new(name)
            .file_name()
            .ok_or(FtpError::InvalidName("Cannot be empty"))?;
        let target = self.config.download_dir.join(local_name);

        self.send(&Message::new(Command::Download, name)).await?;
        let header = self.receive(Command::Download).await?;

        let mut progress = TransferProgress {
            direction: Direction::Download,
            name: name.to_string(),
            transferred: 0,
            total: header.data_size,
        };
        self.observer.started(&progress);
        match self.receive_body(&target, &mut progress).await {
            Ok(()) => {
                self.observer.finished(&progress);
                info!(file = %target.display(), bytes = progress.total, "download complete");
                Ok(target)
            }
            Err(e) => {
                self.observer.failed(&progress, &e.to_string());
                Err(e)
            }
        }
    }

    async fn receive_body(&mut self, target: &Path, progress: &mut TransferProgress) -> Result<()> {
        let t = self.config.timeouts;
        let observer = self.observer.clone();
        let dir = self.config.download_dir.clone();
        let stream = self.stream()?;
        let res = receive_to_part(stream, &dir, &t, progress, observer.as_ref()).await;

        // The temp file is deleted on drop when the transfer failed
        let part = self.check(res)?;
        part.persist(target).map_err(|e| FtpError::Io(e.error))?;
        Ok(())
    }

    /// Upload a local file under its own file name.
    pub async fn upload_file(&mut self, local: &Path) -> Result<u64> {
        let name = local
            .file_name()
            .ok_or(FtpError::InvalidName("Cannot be empty"))?
            .to_str()
            .ok_or(FtpError::InvalidName("Must be valid UTF-8"))?
            .to_string();
        self.upload_file_as(local, &name).await
    }

    /// Upload a local file under `remote_name`. The name goes to the server
    /// unchanged, so the server's name rules apply.
    pub async fn upload_file_as(&mut self, local: &Path, remote_name: &str) -> Result<u64> {
        let mut file = File::open(local).await?;
        let meta = file.metadata().await?;
        if !meta.is_file() {
            return Err(FtpError::NotARegularFile);
        }
        let total = meta.len();

        self.send(&Message::new(Command::Upload, remote_name).with_data_size(total))
            .await?;

        let mut progress = TransferProgress {
            direction: Direction::Upload,
            name: remote_name.to_string(),
            transferred: 0,
            total,
        };
        self.observer.started(&progress);

        let t = self.config.timeouts;
        let observer = self.observer.clone();
        let stream = self.stream()?;
        let sent = send_raw_body(&mut file, stream, total, &t, |n| {
            progress.transferred = n;
            observer.advanced(&progress);
        })
        .await
        .map_err(|e| match e {
            e if e.is_fatal() => e,
            // The server is still waiting for the rest of the body
            other => FtpError::Connection(format!("upload aborted mid-body: {}", other)),
        });
        if let Err(e) = self.check(sent) {
            self.observer.failed(&progress, &e.to_string());
            return Err(e);
        }

        match self.receive(Command::Upload).await {
            Ok(_) => {
                self.observer.finished(&progress);
                info!(file = %remote_name, bytes = total, "upload complete");
                Ok(total)
            }
            Err(e) => {
                self.observer.failed(&progress, &e.to_string());
                Err(e)
            }
        }
    }

    /// Send QUIT and close the connection. The server does not answer QUIT.
    pub async fn quit(&mut self) -> Result<()> {
        let res = self.send(&Message::new(Command::Quit, "")).await;
        if let Some(mut stream) = self.stream.take() {
            let _ = stream.shutdown().await;
        }
        res
    }
}
