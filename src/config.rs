//! Command line and configuration file handling.

use clap::{Parser, Subcommand};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(name = "labbox")]
#[command(about = "Per-student lab sandboxes with a web terminal")]
pub struct Args {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start the HTTP and terminal server
    Serve {
        /// Path to a JSON configuration file
        #[arg(long, short = 'c')]
        config: Option<PathBuf>,

        /// Port to listen on (overrides the configuration file)
        #[arg(long)]
        port: Option<u16>,

        /// Session database URL (overrides the configuration file)
        #[arg(long)]
        database_url: Option<String>,
    },
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub database_url: String,
    pub sandbox: SandboxConfig,
    pub ssh: SshConfig,
    pub file_sync: FileSyncConfig,
    pub evaluation: EvaluationConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            database_url: "sqlite://labbox.sqlite3?mode=rwc".to_string(),
            sandbox: SandboxConfig::default(),
            ssh: SshConfig::default(),
            file_sync: FileSyncConfig::default(),
            evaluation: EvaluationConfig::default(),
        }
    }
}

impl Config {
    /// Load a configuration file; missing sections fall back to defaults.
    pub fn load(path: &Path) -> std::io::Result<Self> {
        let file = std::fs::File::open(path)?;
        let reader = std::io::BufReader::new(file);
        serde_json::from_reader(reader).map_err(|e| e.into())
    }

    /// Apply environment overrides the deployment scripts rely on.
    pub fn apply_env(&mut self) {
        if let Ok(image) = std::env::var("SSH_IMAGE") {
            if !image.is_empty() {
                self.sandbox.image = image;
            }
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_address: String,
    pub port: u16,
    /// User assumed when a request does not name one.
    pub default_user_id: String,
    /// How long shutdown waits for open terminals to detach.
    pub shutdown_grace_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            port: 5001,
            default_user_id: "testuser123".to_string(),
            shutdown_grace_secs: 5,
        }
    }
}

impl ServerConfig {
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    pub image: String,
    pub name_prefix: String,
    pub volume_prefix: String,
    /// Port of the shell service inside the sandbox.
    pub shell_port: u16,
    pub port_range_start: u16,
    pub port_range_len: u16,
    pub volume_mount: String,
    pub max_recreate_attempts: u32,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            image: "lab_ssh_image".to_string(),
            name_prefix: "lab_exam".to_string(),
            volume_prefix: "lab_data".to_string(),
            shell_port: 22,
            port_range_start: 2200,
            port_range_len: 100,
            volume_mount: "/home/labuser/workdir".to_string(),
            max_recreate_attempts: 2,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SshConfig {
    pub host: String,
    pub user: String,
    pub private_key_path: PathBuf,
    pub connect_timeout_secs: u64,
    pub home_dir: String,
    pub pty_cols: u32,
    pub pty_rows: u32,
    pub term: String,
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            user: "labuser".to_string(),
            private_key_path: PathBuf::from("keys/labuser_ed25519"),
            connect_timeout_secs: 10,
            home_dir: "/home/labuser".to_string(),
            pty_cols: 80,
            pty_rows: 24,
            term: "xterm-256color".to_string(),
        }
    }
}

impl SshConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FileSyncConfig {
    pub retry_attempts: u32,
    pub retry_delay_ms: u64,
    /// Suffixes of the files shown in the editor's file list.
    pub listed_extensions: Vec<String>,
}

impl Default for FileSyncConfig {
    fn default() -> Self {
        Self {
            retry_attempts: 5,
            retry_delay_ms: 1000,
            listed_extensions: vec![".c".to_string(), ".py".to_string()],
        }
    }
}

impl FileSyncConfig {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EvaluationConfig {
    /// Trusted local directory the evaluation scripts are loaded from.
    pub scripts_dir: PathBuf,
    /// In-sandbox directory the scripts are copied to, outside the student workspace.
    pub hidden_dir: String,
    /// Scripts that take a fixed source filename and a test-case index.
    pub legacy_scripts: Vec<String>,
    pub legacy_source_name: String,
    /// Build outputs removed from the working directory after every run.
    ///
    /// The legacy source copy is removed separately, and only when it was made.
    pub artifacts: Vec<String>,
    pub timeout_secs: u64,
    pub evaluate_all_test_cases: bool,
}

impl Default for EvaluationConfig {
    fn default() -> Self {
        Self {
            scripts_dir: PathBuf::from("evaluation_scripts"),
            hidden_dir: "/tmp/.eval_scripts".to_string(),
            legacy_scripts: vec!["server_evaluator.py".to_string()],
            legacy_source_name: "server.c".to_string(),
            artifacts: vec![
                "a.out".to_string(),
                "eval.log".to_string(),
            ],
            timeout_secs: 120,
            evaluate_all_test_cases: false,
        }
    }
}

impl EvaluationConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}
