//! Configuration loaded from `~/.taskdeck/config.toml`.
//!
//! Every key is optional. A missing file means defaults; unknown keys are an
//! error so typos do not silently fall back.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::claude::ClaudeOptions;
use crate::session::{ManagerConfig, DEFAULT_SUBSCRIBER_BUFFER};

/// Directory under the home directory holding config and server files.
pub const CONFIG_DIR: &str = ".taskdeck";
const CONFIG_FILE: &str = "config.toml";

/// Default server port.
pub const DEFAULT_PORT: u16 = 58231;

/// Taskdeck configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Agent executable.
    pub agent_command: String,
    /// Extra arguments appended to every agent invocation.
    pub agent_args: Vec<String>,
    /// Flag that disables the agent's interactive permission prompts.
    pub skip_permissions_flag: String,
    /// Flag preceding the resumption token.
    pub resume_flag: String,
    /// Directory of markdown task files.
    pub tasks_dir: PathBuf,
    /// Agent working directory. Defaults to the server's cwd.
    pub working_dir: Option<PathBuf>,
    /// Extra environment for the agent.
    pub env: HashMap<String, String>,
    /// Silence (ms) after which a reply counts as complete. 0 disables.
    pub response_idle_ms: u64,
    /// Events queued per subscriber before it is dropped.
    pub subscriber_buffer: usize,
    /// SSE keep-alive interval.
    pub heartbeat_secs: u64,
    /// Server port.
    pub port: u16,
}

impl Default for Config {
    fn default() -> Self {
        let claude = ClaudeOptions::default();
        Self {
            agent_command: claude.program,
            agent_args: Vec::new(),
            skip_permissions_flag: claude.skip_permissions_flag,
            resume_flag: claude.resume_flag,
            tasks_dir: PathBuf::from("tasks"),
            working_dir: None,
            env: HashMap::new(),
            response_idle_ms: 3000,
            subscriber_buffer: DEFAULT_SUBSCRIBER_BUFFER,
            heartbeat_secs: 15,
            port: DEFAULT_PORT,
        }
    }
}

/// Values given on the command line; they win over the file.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub port: Option<u16>,
    pub tasks_dir: Option<PathBuf>,
    pub working_dir: Option<PathBuf>,
    pub agent_command: Option<String>,
}

impl Config {
    /// Default config file location.
    pub fn default_path() -> Option<PathBuf> {
        dirs::home_dir().map(|home| home.join(CONFIG_DIR).join(CONFIG_FILE))
    }

    /// Load from `path`, or from the default location when `None`.
    ///
    /// A missing file yields the defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => match Self::default_path() {
                Some(p) => p,
                None => return Ok(Self::default()),
            },
        };

        let content = match std::fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "no config file, using defaults");
                return Ok(Self::default());
            }
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to read {}", path.display()))
            }
        };

        Self::parse(&content).with_context(|| format!("Invalid config in {}", path.display()))
    }

    /// Parse TOML text.
    pub fn parse(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Apply command-line overrides.
    #[must_use]
    pub fn with_overrides(mut self, overrides: ConfigOverrides) -> Self {
        if let Some(port) = overrides.port {
            self.port = port;
        }
        if let Some(dir) = overrides.tasks_dir {
            self.tasks_dir = dir;
        }
        if let Some(dir) = overrides.working_dir {
            self.working_dir = Some(dir);
        }
        if let Some(command) = overrides.agent_command {
            self.agent_command = command;
        }
        self
    }

    /// How the agent is launched.
    pub fn claude_options(&self) -> ClaudeOptions {
        ClaudeOptions {
            program: self.agent_command.clone(),
            skip_permissions_flag: self.skip_permissions_flag.clone(),
            resume_flag: self.resume_flag.clone(),
            extra_args: self.agent_args.clone(),
            env: self.env.clone(),
        }
    }

    /// Session manager settings.
    pub fn manager_config(&self) -> Result<ManagerConfig> {
        let working_dir = match &self.working_dir {
            Some(dir) => dir.clone(),
            None => std::env::current_dir().context("Failed to determine working directory")?,
        };
        Ok(ManagerConfig {
            working_dir,
            response_idle: (self.response_idle_ms > 0)
                .then(|| Duration::from_millis(self.response_idle_ms)),
            subscriber_buffer: self.subscriber_buffer,
        })
    }

    /// SSE keep-alive interval (at least one second).
    pub fn heartbeat(&self) -> Duration {
        Duration::from_secs(self.heartbeat_secs.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_file_is_defaults() {
        assert_eq!(Config::parse("").unwrap(), Config::default());
    }

    #[test]
    fn test_parse_keys() {
        let config = Config::parse(
            r#"
            agent_command = "/opt/claude"
            agent_args = ["--model", "opus"]
            tasks_dir = "/srv/tasks"
            response_idle_ms = 0
            port = 9000

            [env]
            ANTHROPIC_LOG = "debug"
            "#,
        )
        .unwrap();

        assert_eq!(config.agent_command, "/opt/claude");
        assert_eq!(config.port, 9000);
        assert_eq!(config.heartbeat_secs, 15);

        let claude = config.claude_options();
        assert_eq!(claude.extra_args, vec!["--model", "opus"]);
        assert_eq!(claude.resume_flag, "--resume");
        assert_eq!(claude.env.get("ANTHROPIC_LOG").map(String::as_str), Some("debug"));

        let manager = config.manager_config().unwrap();
        assert_eq!(manager.response_idle, None);
    }

    #[test]
    fn test_unknown_key_rejected() {
        assert!(Config::parse("agent_comand = \"typo\"").is_err());
    }

    #[test]
    fn test_overrides_win() {
        let config = Config::parse("port = 9000\nworking_dir = \"/a\"")
            .unwrap()
            .with_overrides(ConfigOverrides {
                port: Some(9001),
                working_dir: Some(PathBuf::from("/b")),
                ..ConfigOverrides::default()
            });

        assert_eq!(config.port, 9001);
        assert_eq!(config.manager_config().unwrap().working_dir, PathBuf::from("/b"));
        assert_eq!(
            config.manager_config().unwrap().response_idle,
            Some(Duration::from_secs(3))
        );
    }

    #[test]
    fn test_missing_file_is_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load(Some(&dir.path().join("absent.toml"))).unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_load_reports_path_on_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "port = \"not a number\"").unwrap();

        let err = Config::load(Some(&path)).unwrap_err();
        assert!(format!("{err:#}").contains("config.toml"));
    }
}
