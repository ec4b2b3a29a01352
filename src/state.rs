//! Shared application state: every component built once and handed to the handlers.

use std::sync::Arc;

use crate::bridge::ShellBridge;
use crate::config::Config;
use crate::evaluate::Evaluator;
use crate::registry::SandboxRegistry;
use crate::remote::{PtySize, RemoteAccess};
use crate::runtime::ContainerRuntime;
use crate::store::SessionStore;
use crate::sync::FileSync;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub store: SessionStore,
    pub registry: Arc<SandboxRegistry>,
    pub sync: Arc<FileSync>,
    pub evaluator: Arc<Evaluator>,
    pub bridge: Arc<ShellBridge>,
}

impl AppState {
    pub fn new(
        config: Config,
        store: SessionStore,
        runtime: Arc<dyn ContainerRuntime>,
        remote: Arc<dyn RemoteAccess>,
    ) -> Self {
        let registry = Arc::new(SandboxRegistry::new(
            runtime.clone(),
            store.clone(),
            config.sandbox.clone(),
        ));
        let sync = Arc::new(FileSync::new(
            store.clone(),
            remote.clone(),
            runtime.clone(),
            config.ssh.home_dir.clone(),
            config.ssh.user.clone(),
            &config.file_sync,
        ));
        let evaluator = Arc::new(Evaluator::new(
            store.clone(),
            sync.clone(),
            runtime,
            config.evaluation.clone(),
            config.ssh.user.clone(),
        ));
        let bridge = Arc::new(ShellBridge::new(
            registry.clone(),
            store.clone(),
            remote,
            PtySize {
                cols: config.ssh.pty_cols,
                rows: config.ssh.pty_rows,
            },
        ));

        Self {
            config: Arc::new(config),
            store,
            registry,
            sync,
            evaluator,
            bridge,
        }
    }
}
