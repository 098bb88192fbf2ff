use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

/// Runtime configuration for Overseer, loaded from `overseer.toml` with
/// environment-variable overrides for secrets (`OVERSEER_GITHUB_TOKEN`,
/// `AGENT_CMD`).
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Repositories the reconciler scans, keyed by slug (`owner/name`).
    #[serde(default)]
    pub repos: Vec<RepoConfig>,

    #[serde(default)]
    pub agent: AgentConfig,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub github: GithubConfig,

    #[serde(default)]
    pub reconcile: ReconcileConfig,

    #[serde(default)]
    pub notify: NotifyConfig,

    #[serde(default)]
    pub pricing: PricingConfig,

    /// Directory for job logs and the default SQLite database.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RepoConfig {
    pub slug: String,
    /// Local checkout the worktrees are created from.
    pub path: PathBuf,
    #[serde(default = "default_branch")]
    pub default_branch: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    /// Agent CLI binary. Overridable via `AGENT_CMD`.
    #[serde(default = "default_agent_cmd")]
    pub cmd: String,
    #[serde(default = "default_true")]
    pub skip_permissions: bool,
    /// Label that, when present on an issue after a clean exit, marks the
    /// job blocked instead of completed.
    #[serde(default = "default_blocked_label")]
    pub blocked_label: String,
    /// Prefix for trigger labels; the full label is `{prefix}{command}`.
    #[serde(default)]
    pub label_prefix: String,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StorageBackend {
    #[default]
    Sqlite,
    Remote,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    #[serde(default)]
    pub backend: StorageBackend,
    /// SQLite database path; defaults to `{data_dir}/overseer.db`.
    #[serde(default)]
    pub sqlite_path: Option<PathBuf>,
    /// Base URL of the remote document store.
    #[serde(default)]
    pub remote_url: Option<String>,
    #[serde(default)]
    pub remote_token: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GithubConfig {
    #[serde(default = "default_github_api")]
    pub api_url: String,
    /// Overridable via `OVERSEER_GITHUB_TOKEN`.
    #[serde(default)]
    pub token: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReconcileConfig {
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    /// Stale-worktree cleanup runs every this many ticks.
    #[serde(default = "default_worktree_ticks")]
    pub worktree_cleanup_ticks: u64,
    /// Expired-session cleanup runs every this many ticks.
    #[serde(default = "default_session_ticks")]
    pub session_cleanup_ticks: u64,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct NotifyConfig {
    /// Webhook URL notifications are POSTed to; none disables them.
    #[serde(default)]
    pub webhook_url: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PricingConfig {
    /// Remote price-sheet URL; unset keeps the built-in rate table.
    #[serde(default)]
    pub url: Option<String>,
    /// Seconds between refreshes of the remote sheet.
    #[serde(default = "default_pricing_refresh_secs")]
    pub refresh_secs: u64,
}

fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("overseer")
}

fn default_branch() -> String {
    "main".to_string()
}

fn default_agent_cmd() -> String {
    "claude".to_string()
}

fn default_blocked_label() -> String {
    "blocked".to_string()
}

fn default_github_api() -> String {
    "https://api.github.com".to_string()
}

fn default_interval_secs() -> u64 {
    60
}

fn default_worktree_ticks() -> u64 {
    30
}

fn default_session_ticks() -> u64 {
    60
}

fn default_pricing_refresh_secs() -> u64 {
    3600
}

fn default_true() -> bool {
    true
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            cmd: default_agent_cmd(),
            skip_permissions: true,
            blocked_label: default_blocked_label(),
            label_prefix: String::new(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::Sqlite,
            sqlite_path: None,
            remote_url: None,
            remote_token: None,
        }
    }
}

impl Default for GithubConfig {
    fn default() -> Self {
        Self {
            api_url: default_github_api(),
            token: None,
        }
    }
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_interval_secs(),
            worktree_cleanup_ticks: default_worktree_ticks(),
            session_cleanup_ticks: default_session_ticks(),
        }
    }
}

impl Default for PricingConfig {
    fn default() -> Self {
        Self {
            url: None,
            refresh_secs: default_pricing_refresh_secs(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            repos: Vec::new(),
            agent: AgentConfig::default(),
            storage: StorageConfig::default(),
            github: GithubConfig::default(),
            reconcile: ReconcileConfig::default(),
            notify: NotifyConfig::default(),
            pricing: PricingConfig::default(),
            data_dir: default_data_dir(),
        }
    }
}

impl Config {
    /// Load config from an explicit path, or `./overseer.toml` when present,
    /// falling back to defaults. Environment overrides are applied last.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let _ = dotenvy::dotenv();

        let mut config = match path {
            Some(p) => Self::from_file(p)?,
            None => {
                let default_path = PathBuf::from("overseer.toml");
                if default_path.exists() {
                    Self::from_file(&default_path)?
                } else {
                    Self::default()
                }
            }
        };

        if let Ok(token) = std::env::var("OVERSEER_GITHUB_TOKEN") {
            config.github.token = Some(token);
        }
        if let Ok(cmd) = std::env::var("AGENT_CMD") {
            config.agent.cmd = cmd;
        }

        Ok(config)
    }

    fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        toml::from_str(&raw)
            .with_context(|| format!("Failed to parse config file {}", path.display()))
    }

    /// Look up a configured repository by slug.
    pub fn repo(&self, slug: &str) -> Option<&RepoConfig> {
        self.repos.iter().find(|r| r.slug == slug)
    }

    /// Map of slug → checkout path, for callers that only need paths.
    pub fn repo_paths(&self) -> HashMap<String, PathBuf> {
        self.repos
            .iter()
            .map(|r| (r.slug.clone(), r.path.clone()))
            .collect()
    }

    /// The trigger label for a command, honoring the configured prefix.
    pub fn trigger_label(&self, command: crate::models::Command) -> String {
        format!("{}{}", self.agent.label_prefix, command.as_str())
    }

    /// Flags passed to every agent CLI invocation.
    pub fn agent_flags(&self) -> Vec<String> {
        let mut flags = Vec::new();
        if self.agent.skip_permissions {
            flags.push("--dangerously-skip-permissions".to_string());
        }
        flags.push("--print".to_string());
        flags.push("--output-format".to_string());
        flags.push("stream-json".to_string());
        flags.push("--verbose".to_string());
        flags
    }

    pub fn sqlite_path(&self) -> PathBuf {
        self.storage
            .sqlite_path
            .clone()
            .unwrap_or_else(|| self.data_dir.join("overseer.db"))
    }

    pub fn log_dir(&self) -> PathBuf {
        self.data_dir.join("logs")
    }

    pub fn ensure_directories(&self) -> Result<()> {
        std::fs::create_dir_all(self.log_dir()).context("Failed to create log directory")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Command;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn test_load_full_config() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("overseer.toml");
        fs::write(
            &path,
            r#"
data_dir = "/var/lib/overseer"

[[repos]]
slug = "acme/widget"
path = "/srv/checkouts/widget"
default_branch = "develop"

[agent]
cmd = "claude"
label_prefix = "agent:"

[storage]
backend = "remote"
remote_url = "https://jobs.example.com"

[reconcile]
interval_secs = 30

[pricing]
url = "https://prices.example.com/rates.json"
refresh_secs = 600
"#,
        )
        .unwrap();

        let config = Config::load(Some(&path)).unwrap();
        assert_eq!(config.repos.len(), 1);
        assert_eq!(config.repos[0].slug, "acme/widget");
        assert_eq!(config.repos[0].default_branch, "develop");
        assert!(matches!(config.storage.backend, StorageBackend::Remote));
        assert_eq!(config.reconcile.interval_secs, 30);
        assert_eq!(config.trigger_label(Command::Plan), "agent:plan");
        assert_eq!(config.log_dir(), PathBuf::from("/var/lib/overseer/logs"));
        assert_eq!(
            config.pricing.url.as_deref(),
            Some("https://prices.example.com/rates.json")
        );
        assert_eq!(config.pricing.refresh_secs, 600);
    }

    #[test]
    fn test_defaults_applied_for_missing_sections() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("overseer.toml");
        fs::write(
            &path,
            r#"
[[repos]]
slug = "acme/widget"
path = "/srv/checkouts/widget"
"#,
        )
        .unwrap();

        let config = Config::load(Some(&path)).unwrap();
        assert_eq!(config.agent.cmd, "claude");
        assert_eq!(config.agent.blocked_label, "blocked");
        assert_eq!(config.reconcile.interval_secs, 60);
        assert_eq!(config.reconcile.worktree_cleanup_ticks, 30);
        assert!(matches!(config.storage.backend, StorageBackend::Sqlite));
        assert_eq!(config.repos[0].default_branch, "main");
        assert!(config.pricing.url.is_none());
        assert_eq!(config.pricing.refresh_secs, 3600);
    }

    #[test]
    fn test_repo_lookup() {
        let mut config = Config::default();
        config.repos.push(RepoConfig {
            slug: "acme/widget".to_string(),
            path: PathBuf::from("/srv/widget"),
            default_branch: "main".to_string(),
        });
        assert!(config.repo("acme/widget").is_some());
        assert!(config.repo("acme/ghost").is_none());
    }

    #[test]
    fn test_agent_flags_include_stream_json() {
        let config = Config::default();
        let flags = config.agent_flags();
        assert!(flags.contains(&"--output-format".to_string()));
        assert!(flags.contains(&"stream-json".to_string()));
        assert!(flags.contains(&"--dangerously-skip-permissions".to_string()));
    }

    #[test]
    fn test_parse_error_names_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("overseer.toml");
        fs::write(&path, "not [valid").unwrap();
        let err = Config::load(Some(&path)).unwrap_err();
        assert!(err.to_string().contains("overseer.toml"));
    }

    #[test]
    fn test_sqlite_path_defaults_under_data_dir() {
        let config = Config {
            data_dir: PathBuf::from("/tmp/ov"),
            ..Config::default()
        };
        assert_eq!(config.sqlite_path(), PathBuf::from("/tmp/ov/overseer.db"));
    }
}
