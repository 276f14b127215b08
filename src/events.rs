//! In-process publish/subscribe channels, one per event kind.
//!
//! The lifecycle manager and installer publish; the event bus subscribes.
//! Publishing never blocks and never fails: with no subscriber the event is
//! dropped, and a lagging subscriber loses the oldest events.

use serde::Serialize;
use tokio::sync::broadcast;

use crate::models::{ConsoleLog, InstallProgress, ServerStats, ServerStatus};

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusEvent {
    pub server_id: String,
    pub status: ServerStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

#[derive(Debug, Clone)]
pub struct InstallProgressEvent {
    pub server_id: String,
    pub progress: InstallProgress,
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum NotificationLevel {
    Info,
    Success,
    Warning,
    Error,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    pub level: NotificationLevel,
    pub title: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_id: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayerEvent {
    pub server_id: String,
    pub player: String,
}

#[derive(Clone)]
pub struct EventHub {
    pub status: broadcast::Sender<StatusEvent>,
    pub log: broadcast::Sender<ConsoleLog>,
    pub stats: broadcast::Sender<ServerStats>,
    pub install_progress: broadcast::Sender<InstallProgressEvent>,
    pub notification: broadcast::Sender<Notification>,
    pub player_join: broadcast::Sender<PlayerEvent>,
    pub player_leave: broadcast::Sender<PlayerEvent>,
}

impl EventHub {
    pub fn new() -> Self {
        let (status, _) = broadcast::channel(256);
        let (log, _) = broadcast::channel(1024);
        let (stats, _) = broadcast::channel(256);
        let (install_progress, _) = broadcast::channel(256);
        let (notification, _) = broadcast::channel(64);
        let (player_join, _) = broadcast::channel(128);
        let (player_leave, _) = broadcast::channel(128);
        Self {
            status,
            log,
            stats,
            install_progress,
            notification,
            player_join,
            player_leave,
        }
    }

    pub fn status(&self, server_id: &str, status: ServerStatus, last_error: Option<String>) {
        let _ = self.status.send(StatusEvent {
            server_id: server_id.to_string(),
            status,
            last_error,
        });
    }

    pub fn log(&self, log: ConsoleLog) {
        let _ = self.log.send(log);
    }

    pub fn stats(&self, stats: ServerStats) {
        let _ = self.stats.send(stats);
    }

    pub fn install_progress(&self, server_id: &str, progress: InstallProgress) {
        let _ = self.install_progress.send(InstallProgressEvent {
            server_id: server_id.to_string(),
            progress,
        });
    }

    pub fn notify(
        &self,
        level: NotificationLevel,
        title: impl Into<String>,
        message: impl Into<String>,
        server_id: Option<&str>,
    ) {
        let _ = self.notification.send(Notification {
            level,
            title: title.into(),
            message: message.into(),
            server_id: server_id.map(str::to_string),
        });
    }

    pub fn player_join(&self, server_id: &str, player: &str) {
        let _ = self.player_join.send(PlayerEvent {
            server_id: server_id.to_string(),
            player: player.to_string(),
        });
    }

    pub fn player_leave(&self, server_id: &str, player: &str) {
        let _ = self.player_leave.send(PlayerEvent {
            server_id: server_id.to_string(),
            player: player.to_string(),
        });
    }
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new()
    }
}
