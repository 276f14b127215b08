//! Lifecycle manager: the single authority over which server processes
//! exist, what status they are in, and the telemetry they produce.
//!
//! Each live server gets one supervisor task that owns the child and waits
//! for its exit, two output pumps (stdout/stderr), a readiness watcher and a
//! stats sampler. Start, stop and command-send on one server id are
//! serialized through a per-server operation lock; different servers never
//! contend.

use std::path::Path;
use std::process::ExitStatus;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use sysinfo::{Pid, ProcessRefreshKind, System};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};

use crate::config::AgentConfig;
use crate::console::{classify_line, parse_player_event, strip_ansi, PlayerPresence};
use crate::error::{Error, Result};
use crate::events::{EventHub, NotificationLevel};
use crate::installer::Installer;
use crate::models::{
    now_ms, ConsoleLog, InstallState, LogLevel, NewServer, Server, ServerStats, ServerStatus,
    ServerSummary,
};
use crate::server_config::{validate_server_config, ServerConfig, ServerConfigStore};
use crate::state::{ServerInstance, ServerLocks};
use crate::store::Store;

const DEFAULT_MAX_MEMORY_MB: u32 = 4096;
const DEFAULT_MAX_PLAYERS: u32 = 100;
const SIGTERM_GRACE: Duration = Duration::from_secs(5);
const KILL_GRACE: Duration = Duration::from_secs(5);
const OUTPUT_DRAIN: Duration = Duration::from_secs(2);

struct Markers {
    ready: Vec<String>,
    auth: Vec<String>,
}

pub struct LifecycleManager {
    config: Arc<AgentConfig>,
    store: Arc<Store>,
    configs: ServerConfigStore,
    events: EventHub,
    installer: Arc<Installer>,
    servers: DashMap<String, Arc<ServerInstance>>,
    locks: ServerLocks,
}

impl LifecycleManager {
    pub fn new(
        config: Arc<AgentConfig>,
        store: Arc<Store>,
        events: EventHub,
        locks: ServerLocks,
        installer: Arc<Installer>,
    ) -> Self {
        let configs = ServerConfigStore::new(config.servers_root.clone());
        Self {
            config,
            store,
            configs,
            events,
            installer,
            servers: DashMap::new(),
            locks,
        }
    }

    fn instance(&self, server_id: &str) -> Option<Arc<ServerInstance>> {
        self.servers.get(server_id).map(|r| r.value().clone())
    }

    fn is_current(&self, instance: &Arc<ServerInstance>) -> bool {
        self.servers
            .get(&instance.id)
            .is_some_and(|r| Arc::ptr_eq(r.value(), instance))
    }

    pub fn is_running(&self, server_id: &str) -> bool {
        self.servers.contains_key(server_id)
    }

    pub fn running_servers(&self) -> Vec<String> {
        self.servers.iter().map(|s| s.key().clone()).collect()
    }

    /// Uptime of a live process.
    pub fn uptime(&self, server_id: &str) -> Option<Duration> {
        self.instance(server_id).map(|i| i.started_at.elapsed())
    }

    pub async fn online_players(&self, server_id: &str) -> Vec<String> {
        match self.instance(server_id) {
            Some(instance) => {
                let mut players: Vec<String> =
                    instance.players.lock().await.iter().cloned().collect();
                players.sort();
                players
            }
            None => Vec::new(),
        }
    }

    // ---- registry ---------------------------------------------------------

    pub async fn create_server(&self, req: NewServer) -> Result<Server> {
        let name = req.name.trim();
        if name.is_empty() {
            return Err(Error::Validation("name must not be empty".to_string()));
        }
        let cfg = ServerConfig::initial(
            &req.ip,
            req.port,
            req.max_memory_mb.unwrap_or(DEFAULT_MAX_MEMORY_MB),
            req.max_players.unwrap_or(DEFAULT_MAX_PLAYERS),
        );
        validate_server_config(&cfg).map_err(Error::Validation)?;

        let server = Server::new(
            uuid::Uuid::new_v4().to_string(),
            name.to_string(),
            req.ip.clone(),
            req.port,
        );
        tokio::fs::create_dir_all(self.config.server_dir(&server.id)).await?;
        self.configs.save(&server.id, &cfg).await?;
        self.store.upsert_server(&server)?;
        tracing::info!("Created server '{}' ({})", server.name, server.id);
        Ok(server)
    }

    pub fn get_server(&self, server_id: &str) -> Result<Server> {
        self.store.require_server(server_id)
    }

    pub fn list_servers(&self) -> Result<Vec<ServerSummary>> {
        self.store.list_servers()
    }

    pub async fn get_config(&self, server_id: &str) -> Result<Option<ServerConfig>> {
        self.store.require_server(server_id)?;
        self.configs.load(server_id).await
    }

    pub async fn update_config(&self, server_id: &str, cfg: ServerConfig) -> Result<()> {
        let lock = self.locks.get(server_id);
        let _guard = lock.lock().await;
        self.store.require_server(server_id)?;
        if self.is_running(server_id) {
            return Err(Error::Conflict(
                "Cannot change configuration while server is running".to_string(),
            ));
        }
        self.configs.save(server_id, &cfg).await
    }

    pub async fn delete_server(&self, server_id: &str) -> Result<()> {
        let lock = self.locks.get(server_id);
        let _guard = lock.lock().await;
        let server = self.store.require_server(server_id)?;
        if self.is_running(server_id) || server.status.implies_process() {
            return Err(Error::Conflict(
                "Server must be stopped before deletion".to_string(),
            ));
        }
        if self.installer.is_installing(server_id) {
            return Err(Error::Conflict(
                "Server cannot be deleted while installing".to_string(),
            ));
        }
        self.store.delete_server(server_id)?;
        match tokio::fs::remove_dir_all(self.config.server_dir(server_id)).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!("Failed to remove directory of '{}': {}", server_id, e),
        }
        drop(_guard);
        self.locks.forget(server_id);
        tracing::info!("Deleted server '{}'", server_id);
        Ok(())
    }

    pub fn recent_logs(&self, server_id: &str, limit: usize) -> Result<Vec<ConsoleLog>> {
        self.store.require_server(server_id)?;
        self.store.recent_logs(server_id, limit)
    }

    pub fn recent_stats(&self, server_id: &str, limit: usize) -> Result<Vec<ServerStats>> {
        self.store.require_server(server_id)?;
        self.store.recent_stats(server_id, limit)
    }

    // ---- lifecycle --------------------------------------------------------

    pub async fn start(self: &Arc<Self>, server_id: &str) -> Result<()> {
        let lock = self.locks.get(server_id);
        let _guard = lock.lock().await;

        if self.is_running(server_id) {
            return Err(Error::Conflict(format!(
                "Server '{}' is already running",
                server_id
            )));
        }
        let server = self.store.require_server(server_id)?;
        if self.installer.is_installing(server_id) {
            return Err(Error::Conflict(format!(
                "Server '{}' is being installed",
                server_id
            )));
        }
        if server.install_state != InstallState::Installed {
            return Err(Error::Conflict(format!(
                "Server '{}' is not installed (install state: {})",
                server_id,
                server.install_state.as_str()
            )));
        }
        if server.status.implies_process() {
            return Err(Error::Conflict(format!(
                "Server '{}' is {}",
                server_id,
                server.status.as_str()
            )));
        }

        let cfg = self.configs.load_required(server_id).await?;
        let root = server
            .server_root
            .clone()
            .ok_or_else(|| Error::Config("install did not record a server root".to_string()))?;

        let mut cmd = tokio::process::Command::new(&cfg.executable);
        cmd.args(cfg.launch_args(&server))
            .envs(&cfg.env)
            .current_dir(&root)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true);

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                let reason = format!("Failed to spawn '{}': {}", cfg.executable, e);
                tracing::error!("Server '{}': {}", server_id, reason);
                self.store.set_last_error(server_id, Some(&reason))?;
                return Err(Error::Process(reason));
            }
        };

        let pid = child
            .id()
            .ok_or_else(|| Error::Process("Failed to get child PID".to_string()))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::Process("Failed to get child stdin".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Process("Failed to get child stdout".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| Error::Process("Failed to get child stderr".to_string()))?;

        let instance = Arc::new(ServerInstance::new(
            server_id.to_string(),
            pid,
            stdin,
            cfg.max_players,
            cfg.stop_command.clone(),
        ));

        let persisted = self
            .store
            .update_status(server_id, ServerStatus::Starting, Some(pid))
            .and_then(|_| self.store.set_last_error(server_id, None));
        if let Err(e) = persisted {
            let _ = child.start_kill();
            return Err(e);
        }
        self.servers.insert(server_id.to_string(), instance.clone());
        self.events.status(server_id, ServerStatus::Starting, None);
        self.append_log(
            server_id,
            LogLevel::Info,
            &format!("Starting server (PID {})", pid),
        );

        let markers = Arc::new(Markers {
            ready: cfg.ready_markers.clone(),
            auth: cfg.auth_markers.clone(),
        });
        tokio::spawn(
            self.clone()
                .supervise(instance, child, stdout, stderr, markers),
        );

        tracing::info!("Started server '{}' with PID {}", server_id, pid);
        Ok(())
    }

    async fn supervise(
        self: Arc<Self>,
        instance: Arc<ServerInstance>,
        mut child: tokio::process::Child,
        stdout: tokio::process::ChildStdout,
        stderr: tokio::process::ChildStderr,
        markers: Arc<Markers>,
    ) {
        let out_task = tokio::spawn(self.clone().pump_output(
            instance.clone(),
            stdout,
            false,
            markers.clone(),
        ));
        let err_task = tokio::spawn(self.clone().pump_output(
            instance.clone(),
            stderr,
            true,
            markers.clone(),
        ));
        let ready_task = tokio::spawn(
            self.clone()
                .watch_readiness(instance.clone(), markers.ready.is_empty()),
        );
        let sampler = tokio::spawn(self.clone().sample_stats(instance.clone()));

        let status = tokio::select! {
            status = child.wait() => status,
            _ = instance.kill.notified() => {
                if let Err(e) = child.start_kill() {
                    tracing::warn!("Failed to kill server '{}': {}", instance.id, e);
                }
                child.wait().await
            }
        };
        let graceful = instance.observe_exit();

        // Let the pumps flush what the process wrote before exiting.
        let _ = tokio::time::timeout(OUTPUT_DRAIN, async {
            let _ = out_task.await;
            let _ = err_task.await;
        })
        .await;
        ready_task.abort();
        sampler.abort();

        self.on_process_exit(&instance, status, graceful).await;
    }

    async fn pump_output<R>(
        self: Arc<Self>,
        instance: Arc<ServerInstance>,
        stream: R,
        from_stderr: bool,
        markers: Arc<Markers>,
    ) where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let mut reader = BufReader::new(stream);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) => break,
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!("Output read error for '{}': {}", instance.id, e);
                    break;
                }
            }
            let line = strip_ansi(String::from_utf8_lossy(&buf).trim_end());
            if line.is_empty() {
                continue;
            }

            let level = classify_line(&line, from_stderr);
            self.append_log(&instance.id, level, &line);
            self.track_players(&instance, &line).await;

            if markers.ready.iter().any(|m| line.contains(m.as_str())) {
                self.mark_online(
                    &instance,
                    &[ServerStatus::Starting, ServerStatus::AuthRequired],
                );
            } else if markers.auth.iter().any(|m| line.contains(m.as_str())) {
                self.mark_auth_required(&instance);
            }
        }
    }

    /// Bounded wait for readiness. Without ready markers a server still
    /// `starting` counts as online once it has survived the grace period; one
    /// waiting for authentication stays there. With markers, a server still
    /// `starting` after the timeout is killed.
    async fn watch_readiness(self: Arc<Self>, instance: Arc<ServerInstance>, grace_mode: bool) {
        if grace_mode {
            tokio::time::sleep(Duration::from_secs(self.config.startup_grace_secs)).await;
            self.mark_online(&instance, &[ServerStatus::Starting]);
            return;
        }

        let timeout = self.config.startup_timeout_secs;
        tokio::time::sleep(Duration::from_secs(timeout)).await;
        if !self.is_current(&instance) || instance.is_stopping() || instance.has_exited() {
            return;
        }
        let still_starting = matches!(
            self.store.get_server(&instance.id),
            Ok(Some(server)) if server.status == ServerStatus::Starting
        );
        if still_starting {
            let reason = format!("Server did not report ready within {}s", timeout);
            tracing::warn!("Server '{}': {}", instance.id, reason);
            *instance.failure.lock().await = Some(reason);
            instance.kill.notify_one();
        }
    }

    fn mark_online(&self, instance: &Arc<ServerInstance>, from: &[ServerStatus]) {
        if !self.is_current(instance) || instance.is_stopping() || instance.has_exited() {
            return;
        }
        match self.store.transition_status(
            &instance.id,
            from,
            ServerStatus::Online,
            Some(instance.pid),
        ) {
            Ok(true) => {
                tracing::info!("Server '{}' is online", instance.id);
                self.events.status(&instance.id, ServerStatus::Online, None);
            }
            Ok(false) => {}
            Err(e) => tracing::error!("Failed to mark '{}' online: {}", instance.id, e),
        }
    }

    fn mark_auth_required(&self, instance: &Arc<ServerInstance>) {
        if !self.is_current(instance) || instance.is_stopping() || instance.has_exited() {
            return;
        }
        match self.store.transition_status(
            &instance.id,
            &[ServerStatus::Starting],
            ServerStatus::AuthRequired,
            None,
        ) {
            Ok(true) => {
                tracing::warn!("Server '{}' is waiting for authentication", instance.id);
                self.events
                    .status(&instance.id, ServerStatus::AuthRequired, None);
                self.events.notify(
                    NotificationLevel::Warning,
                    "Authentication required",
                    "The server is waiting for interactive credentials on its console",
                    Some(&instance.id),
                );
            }
            Ok(false) => {}
            Err(e) => tracing::error!("Failed to mark '{}' auth_required: {}", instance.id, e),
        }
    }

    async fn on_process_exit(
        &self,
        instance: &Arc<ServerInstance>,
        status: std::io::Result<ExitStatus>,
        graceful: bool,
    ) {
        // Idempotent: only the handle that is still registered is torn down.
        let removed = self
            .servers
            .remove_if(&instance.id, |_, v| Arc::ptr_eq(v, instance))
            .is_some();
        if removed {
            let id = instance.id.as_str();
            let exit = describe_exit(&status);
            let prior = self
                .store
                .get_server(id)
                .ok()
                .flatten()
                .map(|s| s.status);

            if graceful {
                if let Err(e) = self.store.update_status(id, ServerStatus::Offline, None) {
                    tracing::error!("Failed to persist offline status for '{}': {}", id, e);
                }
                self.events.status(id, ServerStatus::Offline, None);
                self.append_log(id, LogLevel::Info, &format!("Server stopped ({})", exit));
                tracing::info!("Server '{}' exited ({})", id, exit);
            } else {
                let reason = match instance.failure.lock().await.take() {
                    Some(reason) => format!("{} ({})", reason, exit),
                    None if prior == Some(ServerStatus::Starting) => {
                        format!("Process exited before becoming ready ({})", exit)
                    }
                    None => format!("Process exited unexpectedly ({})", exit),
                };
                if let Err(e) = self.store.record_failure(id, ServerStatus::Offline, &reason) {
                    tracing::error!("Failed to persist crash of '{}': {}", id, e);
                }
                self.events
                    .status(id, ServerStatus::Offline, Some(reason.clone()));
                self.append_log(id, LogLevel::Error, &reason);
                self.events.notify(
                    NotificationLevel::Error,
                    "Server crashed",
                    reason.clone(),
                    Some(id),
                );
                tracing::error!("Server '{}' crashed: {}", id, reason);
            }

            let players: Vec<String> = instance.players.lock().await.drain().collect();
            for player in players {
                self.events.player_leave(id, &player);
            }
        }
        instance.mark_exit_recorded();
    }

    pub async fn stop(&self, server_id: &str) -> Result<()> {
        let lock = self.locks.get(server_id);
        let _guard = lock.lock().await;

        self.store.require_server(server_id)?;
        let instance = self
            .instance(server_id)
            .ok_or_else(|| Error::Conflict(format!("Server '{}' is not running", server_id)))?;

        if !instance.request_stop() {
            return Err(Error::Conflict(format!(
                "Server '{}' has already exited",
                server_id
            )));
        }
        match self.store.transition_status(
            server_id,
            &[
                ServerStatus::Starting,
                ServerStatus::Online,
                ServerStatus::AuthRequired,
            ],
            ServerStatus::Stopping,
            None,
        ) {
            Ok(true) => self.events.status(server_id, ServerStatus::Stopping, None),
            Ok(false) => {}
            Err(e) => {
                tracing::error!("Failed to persist stopping status for '{}': {}", server_id, e)
            }
        }

        {
            let mut stdin = instance.stdin.lock().await;
            if let Some(pipe) = stdin.as_mut() {
                let line = format!("{}\n", instance.stop_command);
                if let Err(e) = pipe.write_all(line.as_bytes()).await {
                    tracing::warn!("Failed to send stop command to '{}': {}", server_id, e);
                }
                let _ = pipe.flush().await;
            }
        }

        let grace = Duration::from_secs(self.config.stop_timeout_secs);
        if !instance.wait_exit(grace).await {
            tracing::warn!(
                "Server '{}' did not exit within {:?}, sending SIGTERM",
                server_id,
                grace
            );
            send_sigterm(instance.pid);

            if !instance.wait_exit(SIGTERM_GRACE).await {
                tracing::warn!("Server '{}' ignored SIGTERM, killing", server_id);
                instance.kill.notify_one();
                if !instance.wait_exit(KILL_GRACE).await {
                    return Err(Error::Process(format!(
                        "Server '{}' did not exit after forced termination",
                        server_id
                    )));
                }
            }
        }

        tracing::info!("Stopped server '{}'", server_id);
        Ok(())
    }

    pub async fn restart(self: &Arc<Self>, server_id: &str) -> Result<()> {
        if let Some(instance) = self.instance(server_id) {
            if instance.has_exited() {
                // Exited on its own; let the supervisor record why first.
                instance.wait_exit(OUTPUT_DRAIN + KILL_GRACE).await;
            } else {
                self.stop(server_id).await?;
            }
        }
        self.start(server_id).await
    }

    /// Stop every live server; used on agent shutdown.
    pub async fn stop_all(&self) {
        for id in self.running_servers() {
            match self.instance(&id) {
                Some(instance) if instance.has_exited() => {
                    instance.wait_exit(OUTPUT_DRAIN).await;
                }
                Some(_) => {
                    if let Err(e) = self.stop(&id).await {
                        tracing::error!("Failed to stop '{}' during shutdown: {}", id, e);
                    }
                }
                None => {}
            }
        }
    }

    pub async fn send_command(&self, server_id: &str, text: &str) -> Result<()> {
        if text.trim().is_empty() {
            return Err(Error::Validation("command must not be empty".to_string()));
        }
        if text.contains(['\n', '\r']) {
            return Err(Error::Validation(
                "command must be a single line".to_string(),
            ));
        }

        let lock = self.locks.get(server_id);
        let _guard = lock.lock().await;

        self.store.require_server(server_id)?;
        let instance = self
            .instance(server_id)
            .ok_or_else(|| Error::Conflict(format!("Server '{}' is not running", server_id)))?;
        if instance.is_stopping() {
            return Err(Error::Conflict(format!(
                "Server '{}' is stopping",
                server_id
            )));
        }
        if instance.has_exited() {
            return Err(Error::Conflict(format!(
                "Server '{}' has already exited",
                server_id
            )));
        }

        {
            let mut stdin = instance.stdin.lock().await;
            let pipe = stdin.as_mut().ok_or_else(|| {
                Error::Conflict(format!("Server '{}' is not accepting input", server_id))
            })?;
            let line = format!("{}\n", text);
            let written = match pipe.write_all(line.as_bytes()).await {
                Ok(()) => pipe.flush().await,
                Err(e) => Err(e),
            };
            if let Err(e) = written {
                *stdin = None;
                return Err(Error::Process(format!(
                    "Failed to write to '{}' console: {}",
                    server_id, e
                )));
            }
        }

        self.append_log(server_id, LogLevel::Info, &format!("> {}", text));
        Ok(())
    }

    // ---- telemetry --------------------------------------------------------

    fn append_log(&self, server_id: &str, level: LogLevel, message: &str) {
        match self.store.insert_log(server_id, level, message) {
            Ok(log) => self.events.log(log),
            Err(e) => tracing::warn!("Failed to persist log line for '{}': {}", server_id, e),
        }
    }

    async fn track_players(&self, instance: &Arc<ServerInstance>, line: &str) {
        let Some(presence) = parse_player_event(line) else {
            return;
        };
        let mut players = instance.players.lock().await;
        match presence {
            PlayerPresence::Joined(name) => {
                if players.insert(name.clone()) {
                    self.events.player_join(&instance.id, &name);
                }
            }
            PlayerPresence::Left(name) => {
                if players.remove(&name) {
                    self.events.player_leave(&instance.id, &name);
                }
            }
        }
    }

    async fn sample_stats(self: Arc<Self>, instance: Arc<ServerInstance>) {
        let pid = Pid::from_u32(instance.pid);
        let mut sys = System::new();
        let period = Duration::from_secs(self.config.stats_interval_secs.max(1));
        let mut ticker = tokio::time::interval(period);
        // First tick is immediate; it primes the CPU counters.
        ticker.tick().await;
        sys.refresh_process(pid);

        loop {
            ticker.tick().await;
            if !sys.refresh_process(pid) {
                break;
            }
            let Some((cpu, memory)) = sys.process(pid).map(|p| (p.cpu_usage(), p.memory())) else {
                break;
            };
            let stats = ServerStats {
                server_id: instance.id.clone(),
                timestamp: now_ms(),
                cpu,
                memory,
                players: instance.players.lock().await.len() as u32,
                max_players: instance.max_players,
            };
            match self.store.insert_stats(&stats) {
                Ok(()) => self.events.stats(stats),
                Err(e) => tracing::warn!("Failed to persist stats for '{}': {}", instance.id, e),
            }
        }
    }

    // ---- recovery ---------------------------------------------------------

    /// Force every persisted in-progress status without a live handle to
    /// `offline`. Run once at startup, before any server is started.
    pub fn reconcile(&self) -> Result<usize> {
        let mut reconciled = 0;
        for ServerSummary { server, .. } in self.store.list_servers()? {
            if !server.status.implies_process() || self.is_running(&server.id) {
                continue;
            }
            if let Some(pid) = server.pid {
                kill_orphaned_process(&server.id, pid, server.server_root.as_deref());
            }
            let reason = format!(
                "Agent restarted while server was {}; marked offline during reconciliation",
                server.status.as_str()
            );
            self.store
                .record_failure(&server.id, ServerStatus::Offline, &reason)?;
            self.events
                .status(&server.id, ServerStatus::Offline, Some(reason));
            tracing::warn!(
                "Reconciled server '{}' from {} to offline",
                server.id,
                server.status.as_str()
            );
            reconciled += 1;
        }
        Ok(reconciled)
    }
}

/// Kill a process left behind by a previous agent instance, but only if it
/// still runs inside the server's root.
fn kill_orphaned_process(server_id: &str, pid: u32, server_root: Option<&str>) -> bool {
    let Some(root) = server_root else {
        return false;
    };
    let pid = Pid::from_u32(pid);
    let mut sys = System::new();
    if !sys.refresh_process_specifics(pid, ProcessRefreshKind::everything()) {
        return false;
    }
    let Some(process) = sys.process(pid) else {
        return false;
    };
    match process.cwd() {
        Some(cwd) if cwd.starts_with(Path::new(root)) => {
            tracing::warn!(
                "Found orphaned process for server '{}' (PID {}), killing it",
                server_id,
                pid
            );
            process.kill()
        }
        _ => false,
    }
}

#[cfg(unix)]
fn send_sigterm(pid: u32) {
    use nix::sys::signal::{self, Signal};
    use nix::unistd::Pid as NixPid;
    if let Err(e) = signal::kill(NixPid::from_raw(pid as i32), Signal::SIGTERM) {
        tracing::warn!("SIGTERM to PID {} failed: {}", pid, e);
    }
}

#[cfg(not(unix))]
fn send_sigterm(_pid: u32) {}

fn describe_exit(status: &std::io::Result<ExitStatus>) -> String {
    match status {
        Ok(status) => {
            if let Some(code) = status.code() {
                return format!("exit code {}", code);
            }
            #[cfg(unix)]
            {
                use std::os::unix::process::ExitStatusExt;
                if let Some(signal) = status.signal() {
                    return format!("terminated by signal {}", signal);
                }
            }
            "unknown exit status".to_string()
        }
        Err(e) => format!("wait failed: {}", e),
    }
}
