use std::collections::HashSet;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::sync::{watch, Mutex, Notify};

use crate::bus::EventBus;
use crate::config::AgentConfig;
use crate::error::Result;
use crate::events::EventHub;
use crate::installer::Installer;
use crate::process::LifecycleManager;
use crate::session::SessionStore;
use crate::store::Store;

const PHASE_RUNNING: u8 = 0;
const PHASE_STOPPING: u8 = 1;
const PHASE_EXITED: u8 = 2;
const PHASE_STOPPED: u8 = 3;

/// Per-server operation locks shared by the lifecycle manager and the
/// installer, so a start and an install of one server never interleave.
#[derive(Clone, Default)]
pub struct ServerLocks {
    locks: Arc<DashMap<String, Arc<Mutex<()>>>>,
}

impl ServerLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, server_id: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(server_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    pub fn forget(&self, server_id: &str) {
        self.locks.remove(server_id);
    }
}

/// Live handle of a running server process. Exists exactly as long as the
/// process does; never persisted.
pub struct ServerInstance {
    pub id: String,
    pub pid: u32,
    pub stdin: Mutex<Option<tokio::process::ChildStdin>>,
    pub started_at: Instant,
    pub max_players: u32,
    pub stop_command: String,
    pub players: Mutex<HashSet<String>>,
    /// Running, stopping, or exited with or without a prior stop request.
    phase: AtomicU8,
    /// Overrides the exit description recorded in `last_error`.
    pub failure: Mutex<Option<String>>,
    /// Asks the supervisor to kill the child.
    pub kill: Notify,
    exit_recorded: watch::Sender<bool>,
}

impl ServerInstance {
    pub fn new(
        id: String,
        pid: u32,
        stdin: tokio::process::ChildStdin,
        max_players: u32,
        stop_command: String,
    ) -> Self {
        let (exit_recorded, _) = watch::channel(false);
        Self {
            id,
            pid,
            stdin: Mutex::new(Some(stdin)),
            started_at: Instant::now(),
            max_players,
            stop_command,
            players: Mutex::new(HashSet::new()),
            phase: AtomicU8::new(PHASE_RUNNING),
            failure: Mutex::new(None),
            kill: Notify::new(),
            exit_recorded,
        }
    }

    pub fn is_stopping(&self) -> bool {
        matches!(
            self.phase.load(Ordering::SeqCst),
            PHASE_STOPPING | PHASE_STOPPED
        )
    }

    /// Whether the child has exited, even if its teardown is still running.
    pub fn has_exited(&self) -> bool {
        self.phase.load(Ordering::SeqCst) >= PHASE_EXITED
    }

    /// Flag a stop. Returns false when the process already exited, in which
    /// case the exit keeps its own classification.
    pub fn request_stop(&self) -> bool {
        match self.phase.compare_exchange(
            PHASE_RUNNING,
            PHASE_STOPPING,
            Ordering::SeqCst,
            Ordering::SeqCst,
        ) {
            Ok(_) => true,
            Err(current) => current == PHASE_STOPPING,
        }
    }

    /// Record that the child exited. Returns whether a stop had been
    /// requested before the exit, i.e. whether the exit is graceful.
    pub(crate) fn observe_exit(&self) -> bool {
        let prior = self
            .phase
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |phase| {
                Some(match phase {
                    PHASE_STOPPING | PHASE_STOPPED => PHASE_STOPPED,
                    _ => PHASE_EXITED,
                })
            })
            .unwrap_or(PHASE_EXITED);
        matches!(prior, PHASE_STOPPING | PHASE_STOPPED)
    }

    pub(crate) fn mark_exit_recorded(&self) {
        self.exit_recorded.send_replace(true);
    }

    /// Wait up to `timeout` for the exit to be recorded. Returns whether it
    /// was.
    pub async fn wait_exit(&self, timeout: Duration) -> bool {
        let mut rx = self.exit_recorded.subscribe();
        let recorded = matches!(
            tokio::time::timeout(timeout, rx.wait_for(|recorded| *recorded)).await,
            Ok(Ok(_))
        );
        recorded
    }
}

/// Everything the process entry point constructs once and hands to the
/// HTTP layer.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AgentConfig>,
    pub store: Arc<Store>,
    pub events: EventHub,
    pub sessions: Arc<dyn SessionStore>,
    pub locks: ServerLocks,
    pub installer: Arc<Installer>,
    pub lifecycle: Arc<LifecycleManager>,
    pub bus: Arc<EventBus>,
}

impl AppState {
    pub fn new(config: AgentConfig, store: Store, sessions: Arc<dyn SessionStore>) -> Self {
        let config = Arc::new(config);
        let store = Arc::new(store);
        let events = EventHub::new();
        let locks = ServerLocks::new();
        let installer = Arc::new(Installer::new(
            config.clone(),
            store.clone(),
            events.clone(),
            locks.clone(),
        ));
        let lifecycle = Arc::new(LifecycleManager::new(
            config.clone(),
            store.clone(),
            events.clone(),
            locks.clone(),
            installer.clone(),
        ));
        let bus = Arc::new(EventBus::new(
            sessions.clone(),
            store.clone(),
            lifecycle.clone(),
            events.clone(),
        ));
        Self {
            config,
            store,
            events,
            sessions,
            locks,
            installer,
            lifecycle,
            bus,
        }
    }

    /// Startup recovery: fail interrupted installs, then force stale
    /// process states offline.
    pub fn recover(&self) -> Result<()> {
        let failed = self.installer.recover_interrupted_installations()?;
        let reconciled = self.lifecycle.reconcile()?;
        if !failed.is_empty() || reconciled > 0 {
            tracing::warn!(
                "Recovery: {} interrupted installation(s) failed, {} server(s) reconciled",
                failed.len(),
                reconciled
            );
        }
        Ok(())
    }
}
