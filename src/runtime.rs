//! Container runtime access: the sandbox lifecycle and direct exec calls.

use async_trait::async_trait;
use bollard::errors::Error as BollardError;
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::models::{ContainerCreateBody, HostConfig, PortBinding, VolumeCreateOptions};
use bollard::query_parameters::{
    CreateContainerOptionsBuilder, InspectContainerOptions, ListContainersOptionsBuilder,
    RemoveContainerOptionsBuilder, StartContainerOptions,
};
use bollard::container::LogOutput;
use bollard::Docker;
use futures_util::StreamExt;
use std::collections::HashMap;
use tracing::{debug, info};

use crate::error::RuntimeError;

/// Observed state of one sandbox container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxStatus {
    pub name: String,
    pub running: bool,
    /// Host port bound to the sandbox's shell service, if any.
    pub port: Option<u16>,
}

/// Everything needed to create a sandbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxSpec {
    pub name: String,
    pub image: String,
    pub volume_name: String,
    pub volume_mount: String,
    pub shell_port: u16,
    pub host_port: u16,
}

/// A process to run inside a sandbox, outside any interactive shell.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecRequest {
    pub cmd: Vec<String>,
    pub working_dir: Option<String>,
    pub user: Option<String>,
    /// `KEY=VALUE` pairs.
    pub env: Vec<String>,
}

impl ExecRequest {
    pub fn new<I, S>(cmd: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            cmd: cmd.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    /// Run `script` through `sh -c`.
    pub fn shell(script: impl Into<String>) -> Self {
        Self::new(["sh".to_string(), "-c".to_string(), script.into()])
    }

    pub fn working_dir(mut self, dir: impl Into<String>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }

    pub fn env(mut self, key: &str, value: impl std::fmt::Display) -> Self {
        self.env.push(format!("{}={}", key, value));
        self
    }
}

/// Captured output of an exec call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i64,
}

#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Look up a sandbox by name; `None` when it does not exist.
    async fn inspect(&self, name: &str) -> Result<Option<SandboxStatus>, RuntimeError>;

    /// All sandboxes, running or not, whose name starts with `prefix`.
    async fn list(&self, prefix: &str) -> Result<Vec<SandboxStatus>, RuntimeError>;

    async fn start(&self, name: &str) -> Result<(), RuntimeError>;

    /// Force-remove a sandbox. Its volume is kept.
    async fn remove(&self, name: &str) -> Result<(), RuntimeError>;

    /// Create the volume if missing; returns whether it was created.
    async fn ensure_volume(&self, name: &str) -> Result<bool, RuntimeError>;

    /// Create a sandbox without starting it.
    async fn create(&self, spec: &SandboxSpec) -> Result<(), RuntimeError>;

    /// Run a process to completion and collect its output.
    async fn exec(&self, name: &str, request: ExecRequest) -> Result<ExecOutput, RuntimeError>;
}

/// [`ContainerRuntime`] backed by the local Docker daemon.
pub struct DockerRuntime {
    docker: Docker,
    shell_port: u16,
}

impl DockerRuntime {
    pub fn connect(shell_port: u16) -> Result<Self, RuntimeError> {
        let docker = Docker::connect_with_local_defaults().map_err(map_error)?;
        Ok(Self { docker, shell_port })
    }

    fn port_key(&self) -> String {
        format!("{}/tcp", self.shell_port)
    }
}

fn map_error(error: BollardError) -> RuntimeError {
    match error {
        BollardError::DockerResponseServerError {
            status_code: 409,
            message,
        } => RuntimeError::NameConflict(message),
        BollardError::DockerResponseServerError {
            status_code: 404,
            message,
        } => RuntimeError::NotFound(message),
        other => RuntimeError::Api(other.to_string()),
    }
}

fn first_host_port(bindings: Option<&Option<Vec<PortBinding>>>) -> Option<u16> {
    bindings?
        .as_ref()?
        .iter()
        .find_map(|binding| binding.host_port.as_deref()?.parse().ok())
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn inspect(&self, name: &str) -> Result<Option<SandboxStatus>, RuntimeError> {
        let info = match self
            .docker
            .inspect_container(name, None::<InspectContainerOptions>)
            .await
        {
            Ok(info) => info,
            Err(error) => {
                return match map_error(error) {
                    RuntimeError::NotFound(_) => Ok(None),
                    other => Err(other),
                }
            }
        };

        let running = info
            .state
            .as_ref()
            .and_then(|state| state.running)
            .unwrap_or(false);

        // A stopped container has no live port map; fall back to its configured binding.
        let key = self.port_key();
        let port = info
            .network_settings
            .as_ref()
            .and_then(|settings| settings.ports.as_ref())
            .and_then(|ports| first_host_port(ports.get(&key)))
            .or_else(|| {
                info.host_config
                    .as_ref()
                    .and_then(|config| config.port_bindings.as_ref())
                    .and_then(|bindings| first_host_port(bindings.get(&key)))
            });

        Ok(Some(SandboxStatus {
            name: name.to_string(),
            running,
            port,
        }))
    }

    async fn list(&self, prefix: &str) -> Result<Vec<SandboxStatus>, RuntimeError> {
        let summaries = self
            .docker
            .list_containers(Some(ListContainersOptionsBuilder::new().all(true).build()))
            .await
            .map_err(map_error)?;

        let mut statuses = Vec::new();
        for summary in summaries {
            let Some(name) = summary
                .names
                .unwrap_or_default()
                .into_iter()
                .map(|name| name.trim_start_matches('/').to_string())
                .find(|name| name.starts_with(prefix))
            else {
                continue;
            };
            if let Some(status) = self.inspect(&name).await? {
                statuses.push(status);
            }
        }
        Ok(statuses)
    }

    async fn start(&self, name: &str) -> Result<(), RuntimeError> {
        self.docker
            .start_container(name, None::<StartContainerOptions>)
            .await
            .map_err(map_error)
    }

    async fn remove(&self, name: &str) -> Result<(), RuntimeError> {
        match self
            .docker
            .remove_container(
                name,
                Some(RemoveContainerOptionsBuilder::new().force(true).build()),
            )
            .await
        {
            Ok(()) => Ok(()),
            Err(error) => match map_error(error) {
                RuntimeError::NotFound(_) => Ok(()),
                other => Err(other),
            },
        }
    }

    async fn ensure_volume(&self, name: &str) -> Result<bool, RuntimeError> {
        match self.docker.inspect_volume(name).await {
            Ok(_) => return Ok(false),
            Err(error) => match map_error(error) {
                RuntimeError::NotFound(_) => {}
                other => return Err(other),
            },
        }

        self.docker
            .create_volume(VolumeCreateOptions {
                name: Some(name.to_string()),
                ..Default::default()
            })
            .await
            .map_err(map_error)?;
        info!(volume = name, "Created volume");
        Ok(true)
    }

    async fn create(&self, spec: &SandboxSpec) -> Result<(), RuntimeError> {
        let key = format!("{}/tcp", spec.shell_port);
        let port_bindings = HashMap::from([(
            key.clone(),
            Some(vec![PortBinding {
                host_ip: None,
                host_port: Some(spec.host_port.to_string()),
            }]),
        )]);

        let config = ContainerCreateBody {
            image: Some(spec.image.clone()),
            exposed_ports: Some(HashMap::from([(key, HashMap::new())])),
            host_config: Some(HostConfig {
                port_bindings: Some(port_bindings),
                binds: Some(vec![format!("{}:{}", spec.volume_name, spec.volume_mount)]),
                auto_remove: Some(false),
                ..HostConfig::default()
            }),
            ..ContainerCreateBody::default()
        };

        self.docker
            .create_container(
                Some(CreateContainerOptionsBuilder::new().name(&spec.name).build()),
                config,
            )
            .await
            .map_err(map_error)?;
        Ok(())
    }

    async fn exec(&self, name: &str, request: ExecRequest) -> Result<ExecOutput, RuntimeError> {
        debug!(sandbox = name, cmd = ?request.cmd, "Exec");
        let created = self
            .docker
            .create_exec(
                name,
                CreateExecOptions {
                    cmd: Some(request.cmd),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    working_dir: request.working_dir,
                    user: request.user,
                    env: if request.env.is_empty() {
                        None
                    } else {
                        Some(request.env)
                    },
                    ..Default::default()
                },
            )
            .await
            .map_err(map_error)?;

        let mut stdout = String::new();
        let mut stderr = String::new();
        if let StartExecResults::Attached { mut output, .. } = self
            .docker
            .start_exec(&created.id, None)
            .await
            .map_err(map_error)?
        {
            while let Some(chunk) = output.next().await {
                match chunk.map_err(map_error)? {
                    LogOutput::StdErr { message } => {
                        stderr.push_str(&String::from_utf8_lossy(&message))
                    }
                    LogOutput::StdOut { message } | LogOutput::Console { message } => {
                        stdout.push_str(&String::from_utf8_lossy(&message))
                    }
                    LogOutput::StdIn { .. } => {}
                }
            }
        }

        let inspected = self
            .docker
            .inspect_exec(&created.id)
            .await
            .map_err(map_error)?;

        Ok(ExecOutput {
            stdout,
            stderr,
            exit_code: inspected.exit_code.unwrap_or(-1),
        })
    }
}
