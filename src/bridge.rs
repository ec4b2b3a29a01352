//! Remote shell bridge: relays a browser terminal's WebSocket to a shell inside the sandbox.

use axum::extract::ws::{Message, WebSocket};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::{oneshot, watch};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::StoreError;
use crate::registry::SandboxRegistry;
use crate::remote::{PtySize, RemoteAccess, ShellEvent, ShellSession};
use crate::store::SessionStore;

/// Messages from the browser terminal.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ClientMessage {
    Input { data: String },
    Resize { cols: u32, rows: u32 },
}

/// Messages to the browser terminal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ServerMessage {
    Data { data: String },
    Error { message: String },
    End,
}

struct TerminalEntry {
    generation: Uuid,
    close: oneshot::Sender<()>,
}

/// Open terminals of this process, keyed by the client's terminal id.
#[derive(Default)]
pub struct TerminalTable {
    entries: Mutex<HashMap<String, TerminalEntry>>,
}

impl TerminalTable {
    /// Register a terminal, closing any bridge already registered under the same id.
    ///
    /// The receiver fires when a later connection takes the id over.
    fn register(&self, terminal_id: &str) -> (Uuid, oneshot::Receiver<()>) {
        let generation = Uuid::new_v4();
        let (close, closed) = oneshot::channel();
        let previous = self
            .entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(terminal_id.to_string(), TerminalEntry { generation, close });
        if let Some(previous) = previous {
            info!(terminal_id, "Terminal id reused, closing previous connection");
            let _ = previous.close.send(());
        }
        (generation, closed)
    }

    /// Remove the entry only if it still belongs to `generation`.
    fn remove(&self, terminal_id: &str, generation: Uuid) -> bool {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        if entries
            .get(terminal_id)
            .is_some_and(|entry| entry.generation == generation)
        {
            entries.remove(terminal_id);
            true
        } else {
            false
        }
    }

    pub fn contains(&self, terminal_id: &str) -> bool {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(terminal_id)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Decodes shell output to text without splitting multi-byte characters across messages.
#[derive(Default)]
struct Utf8Chunker {
    pending: Vec<u8>,
}

impl Utf8Chunker {
    fn push(&mut self, bytes: &[u8]) -> String {
        self.pending.extend_from_slice(bytes);
        match std::str::from_utf8(&self.pending) {
            Ok(text) => {
                let text = text.to_string();
                self.pending.clear();
                text
            }
            // Incomplete sequence at the end: hold it back for the next chunk.
            Err(e) if e.error_len().is_none() => {
                let valid = e.valid_up_to();
                let text = String::from_utf8_lossy(&self.pending[..valid]).into_owned();
                self.pending.drain(..valid);
                text
            }
            Err(_) => {
                let text = String::from_utf8_lossy(&self.pending).into_owned();
                self.pending.clear();
                text
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Ending {
    ClientGone,
    ShellExited,
    Replaced,
    ServerShutdown,
}

type Outbound = SplitSink<WebSocket, Message>;

async fn send(sender: &mut Outbound, message: ServerMessage) -> Result<(), axum::Error> {
    let text = serde_json::to_string(&message).unwrap_or_default();
    sender.send(Message::Text(text)).await
}

pub struct ShellBridge {
    registry: Arc<SandboxRegistry>,
    store: SessionStore,
    remote: Arc<dyn RemoteAccess>,
    terminals: Arc<TerminalTable>,
    pty: PtySize,
    shutdown: watch::Sender<bool>,
}

impl ShellBridge {
    pub fn new(
        registry: Arc<SandboxRegistry>,
        store: SessionStore,
        remote: Arc<dyn RemoteAccess>,
        pty: PtySize,
    ) -> Self {
        Self {
            registry,
            store,
            remote,
            terminals: Arc::new(TerminalTable::default()),
            pty,
            shutdown: watch::channel(false).0,
        }
    }

    pub fn terminals(&self) -> &Arc<TerminalTable> {
        &self.terminals
    }

    /// Ask every open terminal to send `end` and detach.
    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
    }

    /// Wait until all terminals have detached, up to `timeout`. Returns whether they did.
    pub async fn drain(&self, timeout: std::time::Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        while !self.terminals.is_empty() {
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        }
        true
    }

    /// Serve one terminal tab until either side goes away.
    pub async fn serve(&self, socket: WebSocket, user_id: String, terminal_id: String) {
        let (mut sender, mut receiver) = socket.split();
        let mut shutdown = self.shutdown.subscribe();

        let sandbox = match self.registry.ensure_sandbox(&user_id).await {
            Ok(sandbox) => sandbox,
            Err(err) => {
                if err.is_creation_race() {
                    warn!(user_id, terminal_id, %err, "Sandbox creation race, client should retry");
                } else {
                    error!(user_id, terminal_id, %err, "Failed to ensure sandbox");
                }
                let _ = send(
                    &mut sender,
                    ServerMessage::Error {
                        message: format!("Sandbox unavailable: {}", err),
                    },
                )
                .await;
                let _ = sender.close().await;
                return;
            }
        };

        let mut shell = match self.remote.open_shell(sandbox.port, self.pty).await {
            Ok(shell) => shell,
            Err(err) => {
                error!(user_id, terminal_id, port = sandbox.port, %err, "Failed to open shell");
                let _ = send(
                    &mut sender,
                    ServerMessage::Error {
                        message: format!("Shell connection error: {}", err),
                    },
                )
                .await;
                let _ = sender.close().await;
                return;
            }
        };

        let (generation, mut replaced) = self.terminals.register(&terminal_id);
        if let Err(err) = self
            .store
            .add_connection(&user_id, &sandbox.session_id, &terminal_id)
            .await
        {
            warn!(user_id, terminal_id, %err, "Failed to record connection");
        }
        info!(user_id, terminal_id, sandbox = %sandbox.name, port = sandbox.port, "Terminal attached");

        let mut decoder = Utf8Chunker::default();
        let ending = loop {
            tokio::select! {
                event = shell.next_event() => match event {
                    Some(ShellEvent::Output(bytes)) => {
                        let data = decoder.push(&bytes);
                        if data.is_empty() {
                            continue;
                        }
                        if send(&mut sender, ServerMessage::Data { data }).await.is_err() {
                            break Ending::ClientGone;
                        }
                    }
                    Some(ShellEvent::Exit(status)) => {
                        debug!(terminal_id, ?status, "Shell exited");
                        break Ending::ShellExited;
                    }
                    None => break Ending::ShellExited,
                },
                message = receiver.next() => match message {
                    Some(Ok(Message::Text(text))) => {
                        if let Err(err) = apply(shell.as_mut(), &text).await {
                            warn!(terminal_id, %err, "Shell write failed");
                            break Ending::ShellExited;
                        }
                    }
                    Some(Ok(Message::Binary(bytes))) => {
                        if let Err(err) = shell.write(&bytes).await {
                            warn!(terminal_id, %err, "Shell write failed");
                            break Ending::ShellExited;
                        }
                    }
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break Ending::ClientGone,
                    Some(Ok(_)) => {}
                },
                _ = &mut replaced => break Ending::Replaced,
                _ = async { shutdown.wait_for(|stopping| *stopping).await.map(|_| ()) } => break Ending::ServerShutdown,
            }
        };

        shell.close().await;
        if let Err(err) = detach(
            &self.terminals,
            &self.store,
            &user_id,
            &sandbox.session_id,
            &terminal_id,
            generation,
        )
        .await
        {
            warn!(user_id, terminal_id, %err, "Failed to clear connection");
        }
        if ending != Ending::ClientGone {
            let _ = send(&mut sender, ServerMessage::End).await;
            let _ = sender.close().await;
        }
        info!(user_id, terminal_id, ?ending, "Terminal detached");
    }
}

/// Drop a bridge's table entry and its connection record.
///
/// Both are left alone when a newer bridge has taken the terminal id over,
/// whatever made this one stop. Returns whether the entry was still ours.
async fn detach(
    terminals: &TerminalTable,
    store: &SessionStore,
    user_id: &str,
    session_id: &str,
    terminal_id: &str,
    generation: Uuid,
) -> Result<bool, StoreError> {
    if !terminals.remove(terminal_id, generation) {
        debug!(terminal_id, "Terminal taken over, keeping its connection record");
        return Ok(false);
    }
    store
        .remove_connection(user_id, session_id, terminal_id)
        .await?;
    Ok(true)
}

/// Apply one client message to the shell; malformed messages are logged and dropped.
async fn apply(
    shell: &mut dyn ShellSession,
    text: &str,
) -> Result<(), crate::error::RemoteError> {
    match serde_json::from_str::<ClientMessage>(text) {
        Ok(ClientMessage::Input { data }) => shell.write(data.as_bytes()).await,
        Ok(ClientMessage::Resize { cols, rows }) if cols > 0 && rows > 0 => {
            shell.resize(PtySize { cols, rows }).await
        }
        Ok(ClientMessage::Resize { cols, rows }) => {
            debug!(cols, rows, "Ignoring empty resize");
            Ok(())
        }
        Err(err) => {
            warn!(%err, "Ignoring malformed terminal message");
            Ok(())
        }
    }
}
