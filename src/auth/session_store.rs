//! Session storage.
//!
//! The `SessionStore` trait holds two kinds of short-lived records:
//! - `Session`: an authenticated identity bound to an opaque session ID
//! - `PendingAuthRequest`: an AuthnRequest in flight, keyed by RelayState
//!
//! `MemorySessionStore` is the only implementation. Sessions are lost on
//! restart and not shared across processes.

use std::{collections::HashMap, fmt, sync::Arc};

use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use chrono::{DateTime, Utc};
use rand::{RngCore, rngs::OsRng};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::saml::SamlIdentity;

/// Number of random bytes in a session ID.
const SESSION_ID_BYTES: usize = 32;

/// Default upper bound on AuthnRequests awaiting an answer. Anyone can start
/// a login, so the oldest requests are evicted once this many are pending.
pub const MAX_PENDING_REQUESTS: usize = 10_000;

/// Result type for session store operations.
pub type SessionResult<T> = Result<T, SessionError>;

/// Errors that can occur during session operations.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("Session ID already in use")]
    Conflict,

    #[error("Session storage error: {0}")]
    Storage(String),
}

/// Opaque, unguessable session identifier carried in the session cookie.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(String);

impl SessionId {
    /// A fresh identifier from the OS random number generator.
    pub fn generate() -> Self {
        let mut bytes = [0u8; SESSION_ID_BYTES];
        OsRng.fill_bytes(&mut bytes);
        Self(URL_SAFE_NO_PAD.encode(bytes))
    }

    /// Accept a cookie value only if it has the shape of a generated ID.
    pub fn parse(value: &str) -> Option<Self> {
        let bytes = URL_SAFE_NO_PAD.decode(value).ok()?;
        (bytes.len() == SESSION_ID_BYTES).then(|| Self(value.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// An authenticated session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: SessionId,

    /// The identity asserted by the IdP at login.
    pub identity: SamlIdentity,

    /// When the session was created
    pub created_at: DateTime<Utc>,

    /// When the session expires
    pub expires_at: DateTime<Utc>,
}

impl Session {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// An AuthnRequest that has been sent and not yet answered.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingAuthRequest {
    /// RelayState sent with the request; the IdP echoes it back.
    pub relay_state: String,

    /// ID of the AuthnRequest, matched against `InResponseTo`.
    pub request_id: String,

    /// Where to redirect after login completes
    #[serde(default)]
    pub return_to: Option<String>,

    /// When the request was issued
    pub created_at: DateTime<Utc>,
}

impl PendingAuthRequest {
    pub fn is_expired_at(&self, ttl: chrono::Duration, now: DateTime<Utc>) -> bool {
        now - self.created_at > ttl
    }
}

/// What a cleanup sweep removed.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CleanupStats {
    pub sessions: usize,
    pub pending_requests: usize,
}

/// Trait for session storage.
///
/// Implementations must be thread-safe, and each call must be atomic with
/// respect to concurrent calls.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Store a new session. Fails if the ID is already in use.
    async fn create_session(&self, session: Session) -> SessionResult<()>;

    /// Get a session by ID, expired or not.
    async fn get_session(&self, id: &SessionId) -> SessionResult<Option<Session>>;

    /// Delete a session. Returns whether it existed.
    async fn delete_session(&self, id: &SessionId) -> SessionResult<bool>;

    /// Store a pending AuthnRequest.
    async fn store_pending_request(&self, pending: PendingAuthRequest) -> SessionResult<()>;

    /// Get and remove a pending AuthnRequest.
    async fn take_pending_request(
        &self,
        relay_state: &str,
    ) -> SessionResult<Option<PendingAuthRequest>>;

    /// Remove expired sessions and pending requests older than `pending_ttl`.
    async fn cleanup(
        &self,
        now: DateTime<Utc>,
        pending_ttl: chrono::Duration,
    ) -> SessionResult<CleanupStats>;
}

/// Shared session store handle.
pub type SharedSessionStore = Arc<dyn SessionStore>;

// ─────────────────────────────────────────────────────────────────────────────
// Memory Session Store
// ─────────────────────────────────────────────────────────────────────────────

/// In-memory session store.
pub struct MemorySessionStore {
    sessions: RwLock<HashMap<SessionId, Session>>,
    pending: RwLock<HashMap<String, PendingAuthRequest>>,
    pending_capacity: usize,
}

impl Default for MemorySessionStore {
    fn default() -> Self {
        Self::with_pending_capacity(MAX_PENDING_REQUESTS)
    }
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A store that keeps at most `capacity` pending AuthnRequests.
    pub fn with_pending_capacity(capacity: usize) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            pending: RwLock::new(HashMap::new()),
            pending_capacity: capacity.max(1),
        }
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn create_session(&self, session: Session) -> SessionResult<()> {
        let mut sessions = self.sessions.write().await;
        if sessions.contains_key(&session.id) {
            return Err(SessionError::Conflict);
        }
        sessions.insert(session.id.clone(), session);
        Ok(())
    }

    async fn get_session(&self, id: &SessionId) -> SessionResult<Option<Session>> {
        let sessions = self.sessions.read().await;
        Ok(sessions.get(id).cloned())
    }

    async fn delete_session(&self, id: &SessionId) -> SessionResult<bool> {
        let mut sessions = self.sessions.write().await;
        Ok(sessions.remove(id).is_some())
    }

    async fn store_pending_request(&self, pending: PendingAuthRequest) -> SessionResult<()> {
        let mut requests = self.pending.write().await;
        while requests.len() >= self.pending_capacity
            && !requests.contains_key(&pending.relay_state)
        {
            let Some(oldest) = requests
                .values()
                .min_by_key(|p| p.created_at)
                .map(|p| p.relay_state.clone())
            else {
                break;
            };
            requests.remove(&oldest);
            tracing::debug!(
                relay_state = %oldest,
                capacity = self.pending_capacity,
                "Evicted oldest pending AuthnRequest"
            );
        }
        requests.insert(pending.relay_state.clone(), pending);
        Ok(())
    }

    async fn take_pending_request(
        &self,
        relay_state: &str,
    ) -> SessionResult<Option<PendingAuthRequest>> {
        let mut requests = self.pending.write().await;
        Ok(requests.remove(relay_state))
    }

    async fn cleanup(
        &self,
        now: DateTime<Utc>,
        pending_ttl: chrono::Duration,
    ) -> SessionResult<CleanupStats> {
        let sessions = {
            let mut sessions = self.sessions.write().await;
            let before = sessions.len();
            sessions.retain(|_, s| !s.is_expired_at(now));
            before - sessions.len()
        };

        let pending_requests = {
            let mut requests = self.pending.write().await;
            let before = requests.len();
            requests.retain(|_, p| !p.is_expired_at(pending_ttl, now));
            before - requests.len()
        };

        Ok(CleanupStats {
            sessions,
            pending_requests,
        })
    }
}
