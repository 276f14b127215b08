#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use game_node_agent::config::{AgentConfig, InstallSource};
use game_node_agent::models::{NewServer, Server, ServerStatus};
use game_node_agent::server_config::{ServerConfig, ServerConfigStore};
use game_node_agent::session::{MemorySessionStore, Session};
use game_node_agent::state::AppState;
use game_node_agent::store::Store;

/// Stand-in for a game server: echoes input, exits cleanly on `stop` and
/// with code 3 on `crash`.
pub const FAKE_SERVER: &str = r#"#!/bin/sh
echo "Booting fake server"
echo "Server started"
while IFS= read -r line; do
  case "$line" in
    stop) echo "Stopping"; exit 0 ;;
    crash) echo "SEVERE: fatal error" >&2; exit 3 ;;
    *) echo "got: $line" ;;
  esac
done
"#;

pub fn test_config(root: &Path) -> AgentConfig {
    AgentConfig {
        database_path: root.join("agent.db"),
        servers_root: root.join("servers"),
        log_directory: root.join("logs"),
        stats_interval_secs: 1,
        startup_timeout_secs: 10,
        startup_grace_secs: 1,
        stop_timeout_secs: 5,
        ..AgentConfig::default()
    }
}

pub fn test_state(root: &Path) -> (AppState, Arc<MemorySessionStore>) {
    test_state_with(root, |_| {})
}

pub fn test_state_with<F>(root: &Path, tweak: F) -> (AppState, Arc<MemorySessionStore>)
where
    F: FnOnce(&mut AgentConfig),
{
    let mut config = test_config(root);
    tweak(&mut config);
    let sessions = Arc::new(MemorySessionStore::new("session"));
    let store = Store::open_in_memory().unwrap();
    let state = AppState::new(config, store, sessions.clone());
    (state, sessions)
}

pub fn session(id: &str, username: &str) -> Session {
    Session {
        id: id.to_string(),
        username: username.to_string(),
        expires_at: None,
    }
}

/// Build `<dir>/server.tar.gz` holding `dist/Server/HytaleServer.jar` (the
/// fake server script) and `dist/Assets.zip`.
pub fn build_archive(dir: &Path) -> PathBuf {
    let src = dir.join("archive-src");
    std::fs::create_dir_all(src.join("dist/Server")).unwrap();
    std::fs::write(src.join("dist/Server/HytaleServer.jar"), FAKE_SERVER).unwrap();
    std::fs::write(src.join("dist/Assets.zip"), b"assets").unwrap();
    let archive = dir.join("server.tar.gz");
    let status = std::process::Command::new("tar")
        .arg("-czf")
        .arg(&archive)
        .arg("-C")
        .arg(&src)
        .arg("dist")
        .status()
        .unwrap();
    assert!(status.success());
    archive
}

/// Register a server whose config runs the fake script through `/bin/sh`
/// and installs from `archive`.
pub async fn create_server(state: &AppState, name: &str, archive: Option<&Path>) -> Server {
    let server = state
        .lifecycle
        .create_server(NewServer {
            name: name.to_string(),
            ip: "127.0.0.1".to_string(),
            port: 5520,
            max_players: Some(20),
            max_memory_mb: Some(1024),
        })
        .await
        .unwrap();

    let mut cfg = ServerConfig::initial("127.0.0.1", 5520, 1024, 20);
    cfg.executable = "/bin/sh".to_string();
    cfg.args = vec!["{jar}".to_string()];
    cfg.install = archive.map(|path| InstallSource::Archive {
        path: path.display().to_string(),
        sha256: None,
        version: Some("1.0.0".to_string()),
    });
    ServerConfigStore::new(state.config.servers_root.clone())
        .save(&server.id, &cfg)
        .await
        .unwrap();
    server
}

/// Create and fully install a server from a freshly built archive.
pub async fn installed_server(state: &AppState, dir: &Path, name: &str) -> Server {
    let archive = build_archive(dir);
    let server = create_server(state, name, Some(&archive)).await;
    state
        .installer
        .install_server(&server.id)
        .await
        .unwrap()
        .await
        .unwrap();
    state.store.require_server(&server.id).unwrap()
}

/// Rewrite a server's config in place.
pub async fn configure_server<F>(state: &AppState, id: &str, edit: F)
where
    F: FnOnce(&mut ServerConfig),
{
    let configs = ServerConfigStore::new(state.config.servers_root.clone());
    let mut cfg = configs.load_required(id).await.unwrap();
    edit(&mut cfg);
    configs.save(id, &cfg).await.unwrap();
}

/// Installed server whose process is the given `/bin/sh -c` script instead
/// of the fake server.
pub async fn scripted_server(state: &AppState, dir: &Path, name: &str, script: &str) -> Server {
    let server = installed_server(state, dir, name).await;
    let script = script.to_string();
    configure_server(state, &server.id, move |cfg| {
        cfg.args = vec!["-c".to_string(), script];
    })
    .await;
    server
}

pub async fn wait_for<F>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

pub async fn wait_for_status(state: &AppState, id: &str, status: ServerStatus) -> bool {
    wait_for(Duration::from_secs(10), || {
        state
            .store
            .get_server(id)
            .ok()
            .flatten()
            .is_some_and(|s| s.status == status)
    })
    .await
}

/// `pid` is only ever persisted alongside `starting` or `online`.
pub fn assert_pid_invariant(server: &Server) {
    if server.pid.is_some() {
        assert!(
            matches!(server.status, ServerStatus::Starting | ServerStatus::Online),
            "pid set while {:?}",
            server.status
        );
    }
}
