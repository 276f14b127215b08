use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;

use crate::session::Session;

pub const CONFIG_PATH_ENV: &str = "NODE_AGENT_CONFIG";
pub const DEFAULT_CONFIG_PATH: &str = "config.json";

/// Where an installation gets its distribution archive from.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum InstallSource {
    /// A pre-downloaded archive on the local filesystem.
    Archive {
        path: String,
        #[serde(default)]
        sha256: Option<String>,
        #[serde(default)]
        version: Option<String>,
    },
    /// An external downloader that writes the archive to `{output}`.
    Downloader {
        command: String,
        #[serde(default)]
        args: Vec<String>,
        /// File name of the archive the downloader produces.
        #[serde(default = "default_archive_name")]
        archive_name: String,
        #[serde(default)]
        sha256: Option<String>,
        #[serde(default)]
        version: Option<String>,
    },
}

impl InstallSource {
    pub fn sha256(&self) -> Option<&str> {
        match self {
            InstallSource::Archive { sha256, .. } | InstallSource::Downloader { sha256, .. } => {
                sha256.as_deref()
            }
        }
    }

    pub fn version(&self) -> Option<&str> {
        match self {
            InstallSource::Archive { version, .. } | InstallSource::Downloader { version, .. } => {
                version.as_deref()
            }
        }
    }
}

fn default_archive_name() -> String {
    "server.zip".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InstallerSettings {
    /// Used when a server's own config does not name a source.
    pub default_source: Option<InstallSource>,
    /// Runnable artifact searched for in the extracted tree.
    pub jar_name: String,
    /// Optional asset bundle searched for next to the artifact.
    pub assets_name: String,
    pub max_search_depth: usize,
    pub max_search_entries: usize,
}

impl Default for InstallerSettings {
    fn default() -> Self {
        Self {
            default_source: None,
            jar_name: "HytaleServer.jar".to_string(),
            assets_name: "Assets.zip".to_string(),
            max_search_depth: 8,
            max_search_entries: 50_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub bind_address: String,
    pub database_path: PathBuf,
    pub servers_root: PathBuf,
    pub log_directory: PathBuf,
    /// Cookie carrying the session id on the WebSocket handshake.
    pub session_cookie: String,
    pub stats_interval_secs: u64,
    /// Bounded wait for a ready marker before the launch is declared failed.
    pub startup_timeout_secs: u64,
    /// Time alive after which a server without ready markers counts as online.
    pub startup_grace_secs: u64,
    /// Grace period after the quit command before escalating to signals.
    pub stop_timeout_secs: u64,
    /// systemd unit the agent itself runs as, for journal reads and restarts.
    pub journal_unit: String,
    pub installer: InstallerSettings,
    /// Sessions accepted without a login round-trip (operator tokens).
    pub static_sessions: Vec<Session>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:8080".to_string(),
            database_path: PathBuf::from("/var/lib/game-node-agent/agent.db"),
            servers_root: PathBuf::from("/servers"),
            log_directory: PathBuf::from("/var/log/game-node-agent"),
            session_cookie: "session".to_string(),
            stats_interval_secs: 10,
            startup_timeout_secs: 180,
            startup_grace_secs: 15,
            stop_timeout_secs: 15,
            journal_unit: "game-node-agent.service".to_string(),
            installer: InstallerSettings::default(),
            static_sessions: Vec::new(),
        }
    }
}

impl AgentConfig {
    /// Directory holding one server's config document and install tree.
    pub fn server_dir(&self, server_id: &str) -> PathBuf {
        self.servers_root.join(server_id)
    }
}

pub fn config_path() -> PathBuf {
    std::env::var_os(CONFIG_PATH_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH))
}

pub async fn load_config(path: &Path) -> anyhow::Result<AgentConfig> {
    match tokio::fs::read_to_string(path).await {
        Ok(contents) => {
            let config: AgentConfig = serde_json::from_str(&contents)
                .with_context(|| format!("Failed to parse {}", path.display()))?;
            Ok(config)
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::info!("Config file {} not found, using defaults", path.display());
            Ok(AgentConfig::default())
        }
        Err(e) => Err(e).with_context(|| format!("Failed to read {}", path.display())),
    }
}

/// Write `value` as pretty JSON via temp file, fsync and rename.
pub async fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> std::io::Result<()> {
    let json = serde_json::to_string_pretty(value)?;
    let tmp_path = path.with_extension("json.tmp");
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    let mut file = tokio::fs::File::create(&tmp_path).await?;
    file.write_all(json.as_bytes()).await?;
    file.flush().await?;
    file.sync_all().await?;
    drop(file);

    tokio::fs::rename(&tmp_path, path).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_config_fills_defaults() {
        let cfg: AgentConfig = serde_json::from_str(
            r#"{ "bind_address": "127.0.0.1:9000", "installer": { "jar_name": "server.jar" } }"#,
        )
        .unwrap();
        assert_eq!(cfg.bind_address, "127.0.0.1:9000");
        assert_eq!(cfg.installer.jar_name, "server.jar");
        assert_eq!(cfg.installer.assets_name, "Assets.zip");
        assert_eq!(cfg.stop_timeout_secs, 15);
    }

    #[test]
    fn install_source_is_tagged_by_kind() {
        let source: InstallSource = serde_json::from_str(
            r#"{ "kind": "downloader", "command": "fetch", "args": ["-o", "{output}"] }"#,
        )
        .unwrap();
        match source {
            InstallSource::Downloader {
                archive_name, args, ..
            } => {
                assert_eq!(archive_name, "server.zip");
                assert_eq!(args, vec!["-o", "{output}"]);
            }
            other => panic!("unexpected source {other:?}"),
        }
    }

    #[tokio::test]
    async fn atomic_write_replaces_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("doc.json");
        write_json_atomic(&path, &serde_json::json!({ "a": 1 })).await.unwrap();
        write_json_atomic(&path, &serde_json::json!({ "a": 2 })).await.unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.contains("2"));
        assert!(!path.with_extension("json.tmp").exists());
    }
}
