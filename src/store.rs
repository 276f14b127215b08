//! SQLite-backed persistence for server rows, stats samples and console history.
//!
//! A single connection is shared behind a mutex; every public method is one
//! statement or one transaction, so callers never observe partial writes.
//! The database runs in WAL mode so committed rows survive a crash of the
//! agent.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::error::{Error, Result};
use crate::models::{
    now_ms, ConsoleLog, InstallPaths, InstallState, LogLevel, Server, ServerStats, ServerStatus,
    ServerSummary,
};

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS servers (
        id TEXT PRIMARY KEY,
        name TEXT NOT NULL,
        status TEXT NOT NULL DEFAULT 'offline',
        install_state TEXT NOT NULL DEFAULT 'not_installed',
        pid INTEGER,
        ip TEXT NOT NULL,
        port INTEGER NOT NULL,
        version TEXT,
        jar_path TEXT,
        assets_path TEXT,
        server_root TEXT,
        last_error TEXT,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    );
    CREATE TABLE IF NOT EXISTS server_stats (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        server_id TEXT NOT NULL REFERENCES servers(id) ON DELETE CASCADE,
        timestamp INTEGER NOT NULL,
        cpu REAL NOT NULL,
        memory INTEGER NOT NULL,
        players INTEGER NOT NULL,
        max_players INTEGER NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_server_stats_server
        ON server_stats (server_id, id);
    CREATE TABLE IF NOT EXISTS console_logs (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        server_id TEXT NOT NULL REFERENCES servers(id) ON DELETE CASCADE,
        timestamp INTEGER NOT NULL,
        level TEXT NOT NULL,
        message TEXT NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_console_logs_server
        ON console_logs (server_id, id);
";

const SERVER_COLUMNS: &str = "id, name, status, install_state, pid, ip, port, version, \
     jar_path, assets_path, server_root, last_error, created_at, updated_at";

pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    /// Open (or create) the database file, enable WAL and ensure the schema.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get::<_, String>(0))?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        Self::init(conn)
    }

    /// In-memory database, used by tests.
    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| Error::Process("store mutex poisoned".to_string()))
    }

    pub fn upsert_server(&self, server: &Server) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO servers (id, name, status, install_state, pid, ip, port, version,
                 jar_path, assets_path, server_root, last_error, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)
             ON CONFLICT(id) DO UPDATE SET
                 name = excluded.name,
                 status = excluded.status,
                 install_state = excluded.install_state,
                 pid = excluded.pid,
                 ip = excluded.ip,
                 port = excluded.port,
                 version = excluded.version,
                 jar_path = excluded.jar_path,
                 assets_path = excluded.assets_path,
                 server_root = excluded.server_root,
                 last_error = excluded.last_error,
                 updated_at = excluded.updated_at",
            params![
                server.id,
                server.name,
                server.status.as_str(),
                server.install_state.as_str(),
                server.pid,
                server.ip,
                server.port,
                server.version,
                server.jar_path,
                server.assets_path,
                server.server_root,
                server.last_error,
                server.created_at,
                chrono::Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn get_server(&self, id: &str) -> Result<Option<Server>> {
        let conn = self.conn()?;
        let sql = format!("SELECT {SERVER_COLUMNS} FROM servers WHERE id = ?1");
        let server = conn
            .query_row(&sql, params![id], server_from_row)
            .optional()?;
        Ok(server)
    }

    /// Fetch a server or fail with [`Error::NotFound`].
    pub fn require_server(&self, id: &str) -> Result<Server> {
        self.get_server(id)?
            .ok_or_else(|| Error::NotFound(id.to_string()))
    }

    /// All servers, newest first, each with its most recent stats sample.
    pub fn list_servers(&self) -> Result<Vec<ServerSummary>> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {SERVER_COLUMNS} FROM servers ORDER BY created_at DESC, rowid DESC"
        );
        let mut stmt = conn.prepare(&sql)?;
        let servers = stmt
            .query_map([], server_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let mut latest = conn.prepare(
            "SELECT server_id, timestamp, cpu, memory, players, max_players
             FROM server_stats WHERE server_id = ?1 ORDER BY id DESC LIMIT 1",
        )?;
        let mut out = Vec::with_capacity(servers.len());
        for server in servers {
            let latest_stats = latest
                .query_row(params![server.id], stats_from_row)
                .optional()?;
            out.push(ServerSummary {
                server,
                latest_stats,
            });
        }
        Ok(out)
    }

    /// Set status and persisted pid. The pid is dropped for statuses that may
    /// not carry one.
    pub fn update_status(&self, id: &str, status: ServerStatus, pid: Option<u32>) -> Result<()> {
        let pid = pid.filter(|_| status.carries_pid());
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE servers SET status = ?2, pid = ?3, updated_at = ?4 WHERE id = ?1",
            params![id, status.as_str(), pid, chrono::Utc::now().to_rfc3339()],
        )?;
        ensure_changed(changed, id)
    }

    /// Set status and record `last_error` in one write; the pid is cleared.
    pub fn record_failure(&self, id: &str, status: ServerStatus, reason: &str) -> Result<()> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE servers SET status = ?2, pid = NULL, last_error = ?3, updated_at = ?4
             WHERE id = ?1",
            params![id, status.as_str(), reason, chrono::Utc::now().to_rfc3339()],
        )?;
        ensure_changed(changed, id)
    }

    /// Move to `to` only if the current status is one of `from`. Returns
    /// whether the row changed.
    pub fn transition_status(
        &self,
        id: &str,
        from: &[ServerStatus],
        to: ServerStatus,
        pid: Option<u32>,
    ) -> Result<bool> {
        let pid = pid.filter(|_| to.carries_pid());
        let current = match self.get_server(id)? {
            Some(server) => server.status,
            None => return Err(Error::NotFound(id.to_string())),
        };
        if !from.contains(&current) {
            return Ok(false);
        }
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE servers SET status = ?2, pid = ?3, updated_at = ?4
             WHERE id = ?1 AND status = ?5",
            params![
                id,
                to.as_str(),
                pid,
                chrono::Utc::now().to_rfc3339(),
                current.as_str()
            ],
        )?;
        Ok(changed == 1)
    }

    pub fn set_last_error(&self, id: &str, reason: Option<&str>) -> Result<()> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE servers SET last_error = ?2, updated_at = ?3 WHERE id = ?1",
            params![id, reason, chrono::Utc::now().to_rfc3339()],
        )?;
        ensure_changed(changed, id)
    }

    /// Set install state; `Some(reason)` also records `last_error`.
    pub fn update_install_state(
        &self,
        id: &str,
        state: InstallState,
        reason: Option<&str>,
    ) -> Result<()> {
        let conn = self.conn()?;
        let now = chrono::Utc::now().to_rfc3339();
        let changed = match reason {
            Some(reason) => conn.execute(
                "UPDATE servers SET install_state = ?2, last_error = ?3, updated_at = ?4
                 WHERE id = ?1",
                params![id, state.as_str(), reason, now],
            )?,
            None => conn.execute(
                "UPDATE servers SET install_state = ?2, updated_at = ?3 WHERE id = ?1",
                params![id, state.as_str(), now],
            )?,
        };
        ensure_changed(changed, id)
    }

    /// Persist resolved artifact paths and mark the server installed.
    pub fn mark_installed(&self, id: &str, paths: &InstallPaths) -> Result<()> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE servers SET install_state = 'installed', jar_path = ?2, assets_path = ?3,
                 server_root = ?4, version = COALESCE(?5, version), last_error = NULL,
                 updated_at = ?6
             WHERE id = ?1",
            params![
                id,
                paths.jar_path,
                paths.assets_path,
                paths.server_root,
                paths.version,
                chrono::Utc::now().to_rfc3339()
            ],
        )?;
        ensure_changed(changed, id)
    }

    pub fn insert_stats(&self, stats: &ServerStats) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO server_stats (server_id, timestamp, cpu, memory, players, max_players)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                stats.server_id,
                stats.timestamp,
                stats.cpu as f64,
                stats.memory as i64,
                stats.players,
                stats.max_players
            ],
        )?;
        Ok(())
    }

    /// Most recent `limit` samples, newest first.
    pub fn recent_stats(&self, id: &str, limit: usize) -> Result<Vec<ServerStats>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT server_id, timestamp, cpu, memory, players, max_players
             FROM server_stats WHERE server_id = ?1 ORDER BY id DESC LIMIT ?2",
        )?;
        let rows = stmt
            .query_map(params![id, limit as i64], stats_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn insert_log(&self, id: &str, level: LogLevel, message: &str) -> Result<ConsoleLog> {
        let timestamp = now_ms();
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO console_logs (server_id, timestamp, level, message)
             VALUES (?1, ?2, ?3, ?4)",
            params![id, timestamp, level.as_str(), message],
        )?;
        Ok(ConsoleLog {
            id: conn.last_insert_rowid(),
            server_id: id.to_string(),
            timestamp,
            level,
            message: message.to_string(),
        })
    }

    /// Most recent `limit` console lines in chronological order.
    pub fn recent_logs(&self, id: &str, limit: usize) -> Result<Vec<ConsoleLog>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, server_id, timestamp, level, message FROM (
                 SELECT id, server_id, timestamp, level, message
                 FROM console_logs WHERE server_id = ?1 ORDER BY id DESC LIMIT ?2
             ) ORDER BY id ASC",
        )?;
        let rows = stmt
            .query_map(params![id, limit as i64], |row| {
                let level: String = row.get(3)?;
                Ok(ConsoleLog {
                    id: row.get(0)?,
                    server_id: row.get(1)?,
                    timestamp: row.get(2)?,
                    level: LogLevel::parse(&level),
                    message: row.get(4)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Remove a server and every stats/log row that belongs to it.
    pub fn delete_server(&self, id: &str) -> Result<bool> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM server_stats WHERE server_id = ?1", params![id])?;
        tx.execute("DELETE FROM console_logs WHERE server_id = ?1", params![id])?;
        let removed = tx.execute("DELETE FROM servers WHERE id = ?1", params![id])?;
        tx.commit()?;
        Ok(removed == 1)
    }
}

fn ensure_changed(changed: usize, id: &str) -> Result<()> {
    if changed == 0 {
        return Err(Error::NotFound(id.to_string()));
    }
    Ok(())
}

fn server_from_row(row: &Row<'_>) -> rusqlite::Result<Server> {
    let status: String = row.get(2)?;
    let install_state: String = row.get(3)?;
    Ok(Server {
        id: row.get(0)?,
        name: row.get(1)?,
        status: ServerStatus::parse(&status).unwrap_or(ServerStatus::Offline),
        install_state: InstallState::parse(&install_state).unwrap_or(InstallState::Failed),
        pid: row.get(4)?,
        ip: row.get(5)?,
        port: row.get(6)?,
        version: row.get(7)?,
        jar_path: row.get(8)?,
        assets_path: row.get(9)?,
        server_root: row.get(10)?,
        last_error: row.get(11)?,
        created_at: row.get(12)?,
        updated_at: row.get(13)?,
    })
}

fn stats_from_row(row: &Row<'_>) -> rusqlite::Result<ServerStats> {
    let cpu: f64 = row.get(2)?;
    let memory: i64 = row.get(3)?;
    Ok(ServerStats {
        server_id: row.get(0)?,
        timestamp: row.get(1)?,
        cpu: cpu as f32,
        memory: memory.max(0) as u64,
        players: row.get(4)?,
        max_players: row.get(5)?,
    })
}
