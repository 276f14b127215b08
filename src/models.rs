use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ServerStatus {
    Offline,
    Starting,
    Online,
    Stopping,
    AuthRequired,
}

impl ServerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServerStatus::Offline => "offline",
            ServerStatus::Starting => "starting",
            ServerStatus::Online => "online",
            ServerStatus::Stopping => "stopping",
            ServerStatus::AuthRequired => "auth_required",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "offline" => Some(ServerStatus::Offline),
            "starting" => Some(ServerStatus::Starting),
            "online" => Some(ServerStatus::Online),
            "stopping" => Some(ServerStatus::Stopping),
            "auth_required" => Some(ServerStatus::AuthRequired),
            _ => None,
        }
    }

    /// Whether a persisted row in this status implies a live process.
    pub fn implies_process(&self) -> bool {
        !matches!(self, ServerStatus::Offline)
    }

    /// Whether a persisted `pid` may accompany this status.
    pub fn carries_pid(&self) -> bool {
        matches!(self, ServerStatus::Starting | ServerStatus::Online)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum InstallState {
    NotInstalled,
    Installing,
    Installed,
    Failed,
}

impl InstallState {
    pub fn as_str(&self) -> &'static str {
        match self {
            InstallState::NotInstalled => "not_installed",
            InstallState::Installing => "installing",
            InstallState::Installed => "installed",
            InstallState::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "not_installed" => Some(InstallState::NotInstalled),
            "installing" => Some(InstallState::Installing),
            "installed" => Some(InstallState::Installed),
            "failed" => Some(InstallState::Failed),
            _ => None,
        }
    }
}

/// One managed game-server instance, as persisted.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Server {
    pub id: String,
    pub name: String,
    pub status: ServerStatus,
    pub install_state: InstallState,
    pub pid: Option<u32>,
    pub ip: String,
    pub port: u16,
    pub version: Option<String>,
    pub jar_path: Option<String>,
    pub assets_path: Option<String>,
    pub server_root: Option<String>,
    pub last_error: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl Server {
    pub fn new(id: String, name: String, ip: String, port: u16) -> Self {
        let now = chrono::Utc::now().to_rfc3339();
        Self {
            id,
            name,
            status: ServerStatus::Offline,
            install_state: InstallState::NotInstalled,
            pid: None,
            ip,
            port,
            version: None,
            jar_path: None,
            assets_path: None,
            server_root: None,
            last_error: None,
            created_at: now.clone(),
            updated_at: now,
        }
    }
}

/// Request to register a new server.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewServer {
    pub name: String,
    #[serde(default = "default_ip")]
    pub ip: String,
    pub port: u16,
    #[serde(default)]
    pub max_players: Option<u32>,
    #[serde(default)]
    pub max_memory_mb: Option<u32>,
}

fn default_ip() -> String {
    "0.0.0.0".to_string()
}

/// Row of the "all servers" listing: the server plus its latest stats sample.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerSummary {
    #[serde(flatten)]
    pub server: Server,
    pub latest_stats: Option<ServerStats>,
}

/// Paths resolved by a successful installation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallPaths {
    pub jar_path: String,
    pub assets_path: Option<String>,
    pub server_root: String,
    pub version: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Info,
    Warning,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Info => "info",
            LogLevel::Warning => "warning",
            LogLevel::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "warning" => LogLevel::Warning,
            "error" => LogLevel::Error,
            _ => LogLevel::Info,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ConsoleLog {
    pub id: i64,
    pub server_id: String,
    /// Unix milliseconds.
    pub timestamp: i64,
    pub level: LogLevel,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ServerStats {
    pub server_id: String,
    /// Unix milliseconds.
    pub timestamp: i64,
    /// Percent of one core, as reported by the OS.
    pub cpu: f32,
    /// Resident memory in bytes.
    pub memory: u64,
    pub players: u32,
    pub max_players: u32,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum InstallStage {
    Queued,
    Downloading,
    Extracting,
    Verifying,
    Ready,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InstallProgress {
    pub stage: InstallStage,
    pub progress: u8,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl InstallProgress {
    pub fn new(stage: InstallStage, progress: u8, message: impl Into<String>) -> Self {
        Self {
            stage,
            progress: progress.min(100),
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }
}

pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}
