//! Remote access to a sandbox's shell service: interactive shells and file transfer.

use async_trait::async_trait;
use russh::client::{self, Handle, Msg};
use russh::{Channel, ChannelMsg, Disconnect};
use russh_keys::key::{KeyPair, PublicKey};
use russh_sftp::client::SftpSession;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use crate::config::SshConfig;
use crate::error::RemoteError;
use crate::identity;

/// Terminal geometry in character cells.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PtySize {
    pub cols: u32,
    pub rows: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShellEvent {
    /// Bytes from the shell's output or error stream.
    Output(Vec<u8>),
    /// The shell exited, with its status when the server reported one.
    Exit(Option<u32>),
}

/// One interactive shell inside a sandbox.
#[async_trait]
pub trait ShellSession: Send {
    /// Next output chunk or exit notification; `None` once the channel is gone.
    async fn next_event(&mut self) -> Option<ShellEvent>;

    async fn write(&mut self, data: &[u8]) -> Result<(), RemoteError>;

    async fn resize(&mut self, size: PtySize) -> Result<(), RemoteError>;

    /// End the shell stream and close the underlying connection.
    async fn close(&mut self);
}

#[async_trait]
pub trait RemoteAccess: Send + Sync {
    async fn open_shell(
        &self,
        port: u16,
        size: PtySize,
    ) -> Result<Box<dyn ShellSession>, RemoteError>;

    /// Write `content` to the absolute `path`, creating missing parent directories.
    async fn write_file(&self, port: u16, path: &str, content: &[u8]) -> Result<(), RemoteError>;
}

struct SandboxHostKeys;

#[async_trait]
impl client::Handler for SandboxHostKeys {
    type Error = russh::Error;

    // Sandboxes generate fresh host keys whenever they are recreated.
    async fn check_server_key(
        &mut self,
        _server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        Ok(true)
    }
}

fn classify(port: u16, error: russh::Error) -> RemoteError {
    match error {
        russh::Error::IO(io) if io.kind() == std::io::ErrorKind::ConnectionRefused => {
            RemoteError::ConnectionRefused(port)
        }
        russh::Error::IO(io) => RemoteError::Io(io),
        other => RemoteError::Protocol(other.to_string()),
    }
}

/// [`RemoteAccess`] over SSH, authenticated with one provisioned private key.
pub struct SshRemote {
    host: String,
    user: String,
    key: Arc<KeyPair>,
    connect_timeout: Duration,
    term: String,
}

impl SshRemote {
    pub fn new(host: String, user: String, key: KeyPair, connect_timeout: Duration, term: String) -> Self {
        Self {
            host,
            user,
            key: Arc::new(key),
            connect_timeout,
            term,
        }
    }

    pub fn from_config(config: &SshConfig) -> Result<Self, RemoteError> {
        let key = load_key(&config.private_key_path)?;
        Ok(Self::new(
            config.host.clone(),
            config.user.clone(),
            key,
            config.connect_timeout(),
            config.term.clone(),
        ))
    }

    async fn connect(&self, port: u16) -> Result<Handle<SandboxHostKeys>, RemoteError> {
        let config = Arc::new(client::Config::default());
        let connecting = client::connect(config, (self.host.as_str(), port), SandboxHostKeys);
        let mut handle = tokio::time::timeout(self.connect_timeout, connecting)
            .await
            .map_err(|_| RemoteError::Timeout(port))?
            .map_err(|e| classify(port, e))?;

        let accepted = handle
            .authenticate_publickey(self.user.as_str(), self.key.clone())
            .await
            .map_err(|e| classify(port, e))?;
        if !accepted {
            return Err(RemoteError::AuthRejected(self.user.clone()));
        }
        Ok(handle)
    }
}

pub fn load_key(path: &Path) -> Result<KeyPair, RemoteError> {
    russh_keys::load_secret_key(path, None)
        .map_err(|e| RemoteError::Key(format!("{}: {}", path.display(), e)))
}

#[async_trait]
impl RemoteAccess for SshRemote {
    async fn open_shell(
        &self,
        port: u16,
        size: PtySize,
    ) -> Result<Box<dyn ShellSession>, RemoteError> {
        let handle = self.connect(port).await?;
        let channel = handle
            .channel_open_session()
            .await
            .map_err(|e| classify(port, e))?;
        channel
            .request_pty(false, &self.term, size.cols, size.rows, 0, 0, &[])
            .await
            .map_err(|e| classify(port, e))?;
        channel
            .request_shell(false)
            .await
            .map_err(|e| classify(port, e))?;

        Ok(Box::new(SshShell {
            port,
            handle,
            channel,
        }))
    }

    async fn write_file(&self, port: u16, path: &str, content: &[u8]) -> Result<(), RemoteError> {
        let handle = self.connect(port).await?;
        let channel = handle
            .channel_open_session()
            .await
            .map_err(|e| classify(port, e))?;
        channel
            .request_subsystem(true, "sftp")
            .await
            .map_err(|e| classify(port, e))?;
        let sftp = SftpSession::new(channel.into_stream())
            .await
            .map_err(|e| RemoteError::Protocol(e.to_string()))?;

        for dir in identity::parent_dirs(path) {
            // Existing directories fail here; that is expected.
            if let Err(error) = sftp.create_dir(dir.as_str()).await {
                debug!(dir = %dir, %error, "mkdir skipped");
            }
        }

        let mut file = sftp
            .create(path)
            .await
            .map_err(|e| RemoteError::Protocol(e.to_string()))?;
        file.write_all(content).await?;
        file.shutdown().await?;

        let _ = sftp.close().await;
        let _ = handle
            .disconnect(Disconnect::ByApplication, "", "en")
            .await;
        Ok(())
    }
}

struct SshShell {
    port: u16,
    handle: Handle<SandboxHostKeys>,
    channel: Channel<Msg>,
}

#[async_trait]
impl ShellSession for SshShell {
    async fn next_event(&mut self) -> Option<ShellEvent> {
        loop {
            match self.channel.wait().await? {
                ChannelMsg::Data { data } => return Some(ShellEvent::Output(data.to_vec())),
                ChannelMsg::ExtendedData { data, .. } => {
                    return Some(ShellEvent::Output(data.to_vec()))
                }
                ChannelMsg::ExitStatus { exit_status } => {
                    return Some(ShellEvent::Exit(Some(exit_status)))
                }
                ChannelMsg::Close => return Some(ShellEvent::Exit(None)),
                _ => {}
            }
        }
    }

    async fn write(&mut self, data: &[u8]) -> Result<(), RemoteError> {
        self.channel
            .data(data)
            .await
            .map_err(|e| classify(self.port, e))
    }

    async fn resize(&mut self, size: PtySize) -> Result<(), RemoteError> {
        self.channel
            .window_change(size.cols, size.rows, 0, 0)
            .await
            .map_err(|e| classify(self.port, e))
    }

    async fn close(&mut self) {
        let _ = self.channel.eof().await;
        let _ = self.channel.close().await;
        let _ = self
            .handle
            .disconnect(Disconnect::ByApplication, "", "en")
            .await;
    }
}
