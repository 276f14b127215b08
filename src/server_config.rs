//! Per-server launch configuration stored as JSON in the server's directory.
//!
//! The document may be hand-edited, so loading goes through an explicit
//! migration step keyed on `schema_version` before strict deserialization.
//! Required fields have no defaults: a document missing them is rejected
//! instead of launching with guessed settings.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::config::{write_json_atomic, InstallSource};
use crate::error::{Error, Result};
use crate::models::Server;

pub const CONFIG_FILE_NAME: &str = "server-config.json";
pub const CURRENT_SCHEMA_VERSION: u32 = 2;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct AuthTokens {
    #[serde(default)]
    pub session_token: Option<String>,
    #[serde(default)]
    pub identity_token: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerConfig {
    pub schema_version: u32,
    /// Program to run, e.g. `java` or an absolute path.
    pub executable: String,
    /// Launch arguments. `{jar}`, `{assets}`, `{server_root}`, `{bind_address}`,
    /// `{port}` and `{max_memory_mb}` are substituted at launch.
    pub args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    pub bind_address: String,
    pub port: u16,
    pub max_memory_mb: u32,
    pub max_players: u32,
    #[serde(default)]
    pub auth: Option<AuthTokens>,
    #[serde(default)]
    pub backup_enabled: bool,
    #[serde(default)]
    pub aot_cache: bool,
    #[serde(default = "default_stop_command")]
    pub stop_command: String,
    /// Console substrings that mark the server as ready.
    #[serde(default = "default_ready_markers")]
    pub ready_markers: Vec<String>,
    /// Console substrings that mean the server waits for interactive login.
    #[serde(default = "default_auth_markers")]
    pub auth_markers: Vec<String>,
    #[serde(default)]
    pub install: Option<InstallSource>,
}

fn default_stop_command() -> String {
    "stop".to_string()
}

fn default_ready_markers() -> Vec<String> {
    vec!["Server started".to_string(), "Done (".to_string()]
}

fn default_auth_markers() -> Vec<String> {
    vec![
        "/auth login".to_string(),
        "Please authenticate".to_string(),
    ]
}

impl ServerConfig {
    /// Initial document written when a server is registered.
    pub fn initial(bind_address: &str, port: u16, max_memory_mb: u32, max_players: u32) -> Self {
        Self {
            schema_version: CURRENT_SCHEMA_VERSION,
            executable: "java".to_string(),
            args: vec![
                "-Xmx{max_memory_mb}M".to_string(),
                "-jar".to_string(),
                "{jar}".to_string(),
                "--assets".to_string(),
                "{assets}".to_string(),
                "--bind".to_string(),
                "{bind_address}:{port}".to_string(),
            ],
            env: BTreeMap::new(),
            bind_address: bind_address.to_string(),
            port,
            max_memory_mb,
            max_players,
            auth: None,
            backup_enabled: false,
            aot_cache: false,
            stop_command: default_stop_command(),
            ready_markers: default_ready_markers(),
            auth_markers: default_auth_markers(),
            install: None,
        }
    }

    /// Fully expanded argument list for a launch of `server`.
    pub fn launch_args(&self, server: &Server) -> Vec<String> {
        let jar = server.jar_path.clone().unwrap_or_default();
        let assets = server.assets_path.clone().unwrap_or_default();
        let root = server.server_root.clone().unwrap_or_default();
        let port = self.port.to_string();
        let memory = self.max_memory_mb.to_string();

        let mut args = Vec::with_capacity(self.args.len() + 6);
        if self.aot_cache {
            let cache = Path::new(&root).join("HytaleServer.aot");
            if cache.exists() {
                args.push(format!("-XX:AOTCache={}", cache.display()));
            }
        }
        args.extend(self.args.iter().map(|arg| {
            arg.replace("{jar}", &jar)
                .replace("{assets}", &assets)
                .replace("{server_root}", &root)
                .replace("{bind_address}", &self.bind_address)
                .replace("{port}", &port)
                .replace("{max_memory_mb}", &memory)
        }));
        if self.backup_enabled {
            args.push("--backup".to_string());
        }
        if let Some(auth) = &self.auth {
            if let Some(token) = &auth.session_token {
                args.push("--session-token".to_string());
                args.push(token.clone());
            }
            if let Some(token) = &auth.identity_token {
                args.push("--identity-token".to_string());
                args.push(token.clone());
            }
        }
        args
    }
}

pub fn validate_server_config(cfg: &ServerConfig) -> std::result::Result<(), String> {
    if cfg.max_memory_mb < 512 || cfg.max_memory_mb > 65536 {
        return Err("max_memory_mb must be between 512 and 65536".to_string());
    }
    if cfg.port < 1024 {
        return Err("port must be between 1024 and 65535".to_string());
    }
    if cfg.max_players == 0 || cfg.max_players > 10_000 {
        return Err("max_players must be between 1 and 10000".to_string());
    }
    if cfg.executable.trim().is_empty() {
        return Err("executable must not be empty".to_string());
    }
    if cfg.executable.contains("..") {
        return Err("executable must not contain '..'".to_string());
    }
    if cfg.args.iter().any(|a| a.contains('\0')) {
        return Err("args must not contain NUL bytes".to_string());
    }
    if cfg.bind_address.trim().is_empty() {
        return Err("bind_address must not be empty".to_string());
    }
    if cfg.stop_command.trim().is_empty() {
        return Err("stop_command must not be empty".to_string());
    }
    Ok(())
}

/// Rewrite a raw document to the current schema. Returns whether anything
/// changed.
pub fn migrate(doc: &mut Value) -> Result<bool> {
    let obj = doc
        .as_object_mut()
        .ok_or_else(|| Error::Config("config document must be a JSON object".to_string()))?;
    let version = obj
        .get("schema_version")
        .and_then(Value::as_u64)
        .unwrap_or(1) as u32;

    if version > CURRENT_SCHEMA_VERSION {
        return Err(Error::Config(format!(
            "schema_version {version} is newer than supported version {CURRENT_SCHEMA_VERSION}"
        )));
    }
    if version == CURRENT_SCHEMA_VERSION {
        return Ok(false);
    }

    // v1 -> v2: field renames from the first document layout.
    rename_field(obj, "java_path", "executable");
    rename_field(obj, "jvm_args", "args");
    rename_field(obj, "memory_mb", "max_memory_mb");
    rename_field(obj, "bind", "bind_address");
    obj.insert(
        "schema_version".to_string(),
        Value::from(CURRENT_SCHEMA_VERSION),
    );
    Ok(true)
}

fn rename_field(obj: &mut Map<String, Value>, old: &str, new: &str) {
    if let Some(value) = obj.remove(old) {
        obj.entry(new.to_string()).or_insert(value);
    }
}

/// Filesystem-backed store of per-server config documents.
#[derive(Debug, Clone)]
pub struct ServerConfigStore {
    servers_root: PathBuf,
}

impl ServerConfigStore {
    pub fn new(servers_root: impl Into<PathBuf>) -> Self {
        Self {
            servers_root: servers_root.into(),
        }
    }

    pub fn path_for(&self, server_id: &str) -> PathBuf {
        self.servers_root.join(server_id).join(CONFIG_FILE_NAME)
    }

    /// Load and migrate a server's config. `Ok(None)` means not configured.
    pub async fn load(&self, server_id: &str) -> Result<Option<ServerConfig>> {
        let path = self.path_for(server_id);
        let contents = match tokio::fs::read_to_string(&path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let mut doc: Value = serde_json::from_str(&contents)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
        let migrated = migrate(&mut doc)?;
        let cfg: ServerConfig = serde_json::from_value(doc)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;

        if migrated {
            tracing::info!(
                "Migrated config for server '{}' to schema version {}",
                server_id,
                CURRENT_SCHEMA_VERSION
            );
            write_json_atomic(&path, &cfg).await?;
        }
        Ok(Some(cfg))
    }

    /// Load a config that must exist and pass validation.
    pub async fn load_required(&self, server_id: &str) -> Result<ServerConfig> {
        let cfg = self.load(server_id).await?.ok_or_else(|| {
            Error::Config(format!("server '{}' is not configured", server_id))
        })?;
        validate_server_config(&cfg).map_err(Error::Config)?;
        Ok(cfg)
    }

    pub async fn save(&self, server_id: &str, cfg: &ServerConfig) -> Result<()> {
        validate_server_config(cfg).map_err(Error::Validation)?;
        write_json_atomic(&self.path_for(server_id), cfg).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn server_with_paths() -> Server {
        let mut server = Server::new("s1".into(), "One".into(), "0.0.0.0".into(), 5520);
        server.jar_path = Some("/srv/s1/server/HytaleServer.jar".into());
        server.assets_path = Some("/srv/s1/server/Assets.zip".into());
        server.server_root = Some("/srv/s1/server".into());
        server
    }

    #[test]
    fn v1_document_is_migrated() {
        let mut doc = serde_json::json!({
            "java_path": "/usr/bin/java",
            "jvm_args": ["-jar", "{jar}"],
            "memory_mb": 2048,
            "bind": "0.0.0.0",
            "port": 5520,
            "max_players": 20
        });
        assert!(migrate(&mut doc).unwrap());
        let cfg: ServerConfig = serde_json::from_value(doc).unwrap();
        assert_eq!(cfg.schema_version, CURRENT_SCHEMA_VERSION);
        assert_eq!(cfg.executable, "/usr/bin/java");
        assert_eq!(cfg.max_memory_mb, 2048);
        assert_eq!(cfg.stop_command, "stop");
    }

    #[test]
    fn current_document_is_untouched_and_future_rejected() {
        let mut doc = serde_json::to_value(ServerConfig::initial("0.0.0.0", 5520, 2048, 20)).unwrap();
        assert!(!migrate(&mut doc).unwrap());

        let mut future = serde_json::json!({ "schema_version": 99 });
        assert!(migrate(&mut future).is_err());
    }

    #[test]
    fn missing_required_field_fails_closed() {
        let mut doc = serde_json::json!({ "schema_version": 2, "executable": "java" });
        migrate(&mut doc).unwrap();
        assert!(serde_json::from_value::<ServerConfig>(doc).is_err());
    }

    #[test]
    fn launch_args_expand_placeholders() {
        let mut cfg = ServerConfig::initial("127.0.0.1", 5520, 4096, 20);
        cfg.backup_enabled = true;
        cfg.auth = Some(AuthTokens {
            session_token: Some("abc".into()),
            identity_token: None,
        });
        let args = cfg.launch_args(&server_with_paths());
        assert_eq!(args[0], "-Xmx4096M");
        assert!(args.contains(&"/srv/s1/server/HytaleServer.jar".to_string()));
        assert!(args.contains(&"127.0.0.1:5520".to_string()));
        assert!(args.contains(&"--backup".to_string()));
        assert_eq!(&args[args.len() - 2..], &["--session-token", "abc"]);
    }

    #[test]
    fn validation_rejects_out_of_range_values() {
        let mut cfg = ServerConfig::initial("0.0.0.0", 5520, 2048, 20);
        assert!(validate_server_config(&cfg).is_ok());
        cfg.port = 80;
        assert!(validate_server_config(&cfg).is_err());
        cfg.port = 5520;
        cfg.max_memory_mb = 128;
        assert!(validate_server_config(&cfg).is_err());
    }

    #[tokio::test]
    async fn absent_document_means_not_configured() {
        let dir = tempfile::tempdir().unwrap();
        let store = ServerConfigStore::new(dir.path());
        assert!(store.load("missing").await.unwrap().is_none());
        assert!(matches!(
            store.load_required("missing").await,
            Err(Error::Config(_))
        ));

        let cfg = ServerConfig::initial("0.0.0.0", 5520, 2048, 20);
        store.save("s1", &cfg).await.unwrap();
        assert_eq!(store.load("s1").await.unwrap(), Some(cfg));
    }
}
