//! Session lookup used to authenticate WebSocket clients and REST calls.
//!
//! The agent never creates sessions on its own; whatever issues them (a login
//! endpoint, an operator token in the config) inserts into a [`SessionStore`]
//! and the event bus only reads.

use axum::http::{header, HeaderMap};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::models::now_ms;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Session {
    pub id: String,
    pub username: String,
    /// Unix milliseconds; `None` never expires.
    #[serde(default)]
    pub expires_at: Option<i64>,
}

impl Session {
    pub fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|at| at <= now_ms())
    }
}

pub trait SessionStore: Send + Sync {
    /// Live session by id. Expired or revoked sessions are `None`.
    fn get_session_by_id(&self, id: &str) -> Option<Session>;

    /// Resolve the session carried by handshake headers.
    fn get_session_from_handshake(&self, headers: &HeaderMap) -> Option<Session>;
}

pub struct MemorySessionStore {
    cookie_name: String,
    sessions: DashMap<String, Session>,
}

impl MemorySessionStore {
    pub fn new(cookie_name: impl Into<String>) -> Self {
        Self {
            cookie_name: cookie_name.into(),
            sessions: DashMap::new(),
        }
    }

    pub fn insert(&self, session: Session) {
        self.sessions.insert(session.id.clone(), session);
    }

    /// Revoke a session. Returns whether it existed.
    pub fn revoke(&self, id: &str) -> bool {
        self.sessions.remove(id).is_some()
    }
}

impl SessionStore for MemorySessionStore {
    fn get_session_by_id(&self, id: &str) -> Option<Session> {
        let session = self.sessions.get(id).map(|s| s.value().clone())?;
        if session.is_expired() {
            self.sessions.remove(id);
            return None;
        }
        Some(session)
    }

    fn get_session_from_handshake(&self, headers: &HeaderMap) -> Option<Session> {
        let id = session_id_from_headers(headers, &self.cookie_name)?;
        self.get_session_by_id(&id)
    }
}

/// Session id from the named cookie, falling back to a bearer token.
pub fn session_id_from_headers(headers: &HeaderMap, cookie_name: &str) -> Option<String> {
    for value in headers.get_all(header::COOKIE) {
        let Ok(value) = value.to_str() else { continue };
        for pair in value.split(';') {
            if let Some((name, val)) = pair.trim().split_once('=') {
                if name == cookie_name && !val.is_empty() {
                    return Some(val.to_string());
                }
            }
        }
    }
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(|token| token.trim().to_string())
        .filter(|token| !token.is_empty())
}
