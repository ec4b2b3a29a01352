#![allow(dead_code)]

use async_trait::async_trait;
use labbox::config::Config;
use labbox::error::{RemoteError, RuntimeError};
use labbox::remote::{PtySize, RemoteAccess, ShellEvent, ShellSession};
use labbox::runtime::{ContainerRuntime, ExecOutput, ExecRequest, SandboxSpec, SandboxStatus};
use labbox::state::AppState;
use labbox::store::SessionStore;
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

/// In-memory container runtime.
#[derive(Default)]
pub struct FakeRuntime {
    pub inner: Mutex<RuntimeState>,
}

#[derive(Default)]
pub struct RuntimeState {
    pub containers: HashMap<String, SandboxStatus>,
    pub volumes: HashSet<String>,
    pub execs: Vec<(String, ExecRequest)>,
    pub creates: usize,
    pub removes: usize,
    /// Sandboxes whose next start fails; removal clears the flag.
    pub broken: HashSet<String>,
    /// Removal leaves the container in place.
    pub remove_is_noop: bool,
    /// Another instance creates the sandbox (running, on this port) just before us.
    pub lose_creation_race: Option<u16>,
    /// Output of evaluation script runs.
    pub script_output: ExecOutput,
    pub script_delay: Option<Duration>,
    /// Output of other commands, keyed by program name.
    pub responses: HashMap<String, ExecOutput>,
}

impl FakeRuntime {
    pub fn state(&self) -> std::sync::MutexGuard<'_, RuntimeState> {
        self.inner.lock().unwrap()
    }

    pub fn insert(&self, name: &str, running: bool, port: u16) {
        self.state().containers.insert(
            name.to_string(),
            SandboxStatus {
                name: name.to_string(),
                running,
                port: Some(port),
            },
        );
    }

    pub fn execs(&self) -> Vec<(String, ExecRequest)> {
        self.state().execs.clone()
    }
}

fn is_script_run(request: &ExecRequest) -> bool {
    request
        .env
        .iter()
        .any(|entry| entry.starts_with("TEST_CASE_INDEX="))
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn inspect(&self, name: &str) -> Result<Option<SandboxStatus>, RuntimeError> {
        Ok(self.state().containers.get(name).cloned())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<SandboxStatus>, RuntimeError> {
        Ok(self
            .state()
            .containers
            .values()
            .filter(|status| status.name.starts_with(prefix))
            .cloned()
            .collect())
    }

    async fn start(&self, name: &str) -> Result<(), RuntimeError> {
        let mut state = self.state();
        if state.broken.contains(name) {
            return Err(RuntimeError::Api(format!("cannot start {name}")));
        }
        match state.containers.get_mut(name) {
            Some(status) => {
                status.running = true;
                Ok(())
            }
            None => Err(RuntimeError::NotFound(name.to_string())),
        }
    }

    async fn remove(&self, name: &str) -> Result<(), RuntimeError> {
        let mut state = self.state();
        state.removes += 1;
        if !state.remove_is_noop {
            state.containers.remove(name);
            state.broken.remove(name);
        }
        Ok(())
    }

    async fn ensure_volume(&self, name: &str) -> Result<bool, RuntimeError> {
        Ok(self.state().volumes.insert(name.to_string()))
    }

    async fn create(&self, spec: &SandboxSpec) -> Result<(), RuntimeError> {
        let mut state = self.state();
        if let Some(port) = state.lose_creation_race.take() {
            state.containers.insert(
                spec.name.clone(),
                SandboxStatus {
                    name: spec.name.clone(),
                    running: true,
                    port: Some(port),
                },
            );
            return Err(RuntimeError::NameConflict(spec.name.clone()));
        }
        if state.containers.contains_key(&spec.name) {
            return Err(RuntimeError::NameConflict(spec.name.clone()));
        }
        state.creates += 1;
        state.containers.insert(
            spec.name.clone(),
            SandboxStatus {
                name: spec.name.clone(),
                running: false,
                port: Some(spec.host_port),
            },
        );
        Ok(())
    }

    async fn exec(&self, name: &str, request: ExecRequest) -> Result<ExecOutput, RuntimeError> {
        let script_run = is_script_run(&request);
        let program = request.cmd.first().cloned().unwrap_or_default();
        let (delay, output) = {
            let mut state = self.state();
            if !state.containers.contains_key(name) {
                return Err(RuntimeError::NotFound(name.to_string()));
            }
            state.execs.push((name.to_string(), request));
            if script_run {
                (state.script_delay, state.script_output.clone())
            } else {
                (None, state.responses.get(&program).cloned().unwrap_or_default())
            }
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        Ok(output)
    }
}

/// In-memory shell service: stores pushed files and echoes shell input.
#[derive(Default)]
pub struct FakeRemote {
    pub files: Mutex<HashMap<(u16, String), Vec<u8>>>,
    pub write_attempts: AtomicU32,
    /// Refuse this many writes before accepting.
    pub refuse_writes: AtomicU32,
    pub fail_writes: AtomicBool,
    pub fail_shell: AtomicBool,
    pub resizes: Arc<Mutex<Vec<PtySize>>>,
    pub closed_shells: Arc<AtomicU32>,
}

impl FakeRemote {
    pub fn file(&self, port: u16, path: &str) -> Option<Vec<u8>> {
        self.files
            .lock()
            .unwrap()
            .get(&(port, path.to_string()))
            .cloned()
    }
}

#[async_trait]
impl RemoteAccess for FakeRemote {
    async fn open_shell(
        &self,
        port: u16,
        _size: PtySize,
    ) -> Result<Box<dyn ShellSession>, RemoteError> {
        if self.fail_shell.load(Ordering::SeqCst) {
            return Err(RemoteError::ConnectionRefused(port));
        }
        let (events, receiver) = mpsc::unbounded_channel();
        Ok(Box::new(EchoShell {
            events,
            receiver,
            resizes: self.resizes.clone(),
            closed: self.closed_shells.clone(),
        }))
    }

    async fn write_file(&self, port: u16, path: &str, content: &[u8]) -> Result<(), RemoteError> {
        self.write_attempts.fetch_add(1, Ordering::SeqCst);
        let refused = self
            .refuse_writes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if refused {
            return Err(RemoteError::ConnectionRefused(port));
        }
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(RemoteError::Protocol("permission denied".to_string()));
        }
        self.files
            .lock()
            .unwrap()
            .insert((port, path.to_string()), content.to_vec());
        Ok(())
    }
}

struct EchoShell {
    events: mpsc::UnboundedSender<ShellEvent>,
    receiver: mpsc::UnboundedReceiver<ShellEvent>,
    resizes: Arc<Mutex<Vec<PtySize>>>,
    closed: Arc<AtomicU32>,
}

#[async_trait]
impl ShellSession for EchoShell {
    async fn next_event(&mut self) -> Option<ShellEvent> {
        self.receiver.recv().await
    }

    async fn write(&mut self, data: &[u8]) -> Result<(), RemoteError> {
        if data == b"exit\r" {
            let _ = self.events.send(ShellEvent::Exit(Some(0)));
        } else {
            let _ = self.events.send(ShellEvent::Output(data.to_vec()));
        }
        Ok(())
    }

    async fn resize(&mut self, size: PtySize) -> Result<(), RemoteError> {
        self.resizes.lock().unwrap().push(size);
        Ok(())
    }

    async fn close(&mut self) {
        self.closed.fetch_add(1, Ordering::SeqCst);
    }
}

pub struct Harness {
    pub state: AppState,
    pub runtime: Arc<FakeRuntime>,
    pub remote: Arc<FakeRemote>,
    pub scripts_dir: PathBuf,
}

pub fn test_config() -> Config {
    let scripts_dir = std::env::temp_dir().join(format!("labbox-scripts-{}", uuid::Uuid::new_v4()));
    std::fs::create_dir_all(&scripts_dir).unwrap();
    std::fs::write(
        scripts_dir.join("evaluate_server1.sh"),
        "#!/bin/sh\necho RESULT:PASS:ok\n",
    )
    .unwrap();
    std::fs::write(
        scripts_dir.join("server_evaluator.py"),
        "#!/usr/bin/env python3\nprint('RESULT:PASS:ok')\n",
    )
    .unwrap();

    let mut config = Config::default();
    config.database_url = "sqlite::memory:".to_string();
    config.evaluation.scripts_dir = scripts_dir;
    config.file_sync.retry_delay_ms = 10;
    config
}

pub async fn harness() -> Harness {
    harness_with(test_config()).await
}

pub async fn harness_with(config: Config) -> Harness {
    let scripts_dir = config.evaluation.scripts_dir.clone();
    let store = SessionStore::connect(&config.database_url).await.unwrap();
    let runtime = Arc::new(FakeRuntime::default());
    let remote = Arc::new(FakeRemote::default());
    let state = AppState::new(config, store, runtime.clone(), remote.clone());
    Harness {
        state,
        runtime,
        remote,
        scripts_dir,
    }
}

/// Serve the router on an ephemeral port.
pub async fn spawn_server(state: AppState) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, labbox::http_server::router(state))
            .await
            .unwrap();
    });
    addr
}

/// Poll `check` until it holds or two seconds pass.
pub async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..100 {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}
