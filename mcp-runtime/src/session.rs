use std::collections::{HashMap, HashSet};
use std::fmt;
use std::future::Future;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use patron_core::error::BackendError;
use patron_core::identity::{self, IdentityHints, SessionInput};

/// Sessions idle for longer than this are dropped on the next sweep.
pub const SESSION_TTL_MS: i64 = 30 * 24 * 60 * 60 * 1000;

/// Millisecond wall clock. All cache operations take an explicit `now` so
/// eviction behavior is testable without sleeping.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// A cache key is one of two disjoint namespaces over the same store: the
/// context-derived identity of a conversation, or a normalized email.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CacheKey {
    Context(String),
    Email(String),
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CacheKey::Context(id) => write!(f, "ctx:{id}"),
            CacheKey::Email(email) => write!(f, "email:{email}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionRecord {
    pub session_token: String,
    /// Normalized (trimmed, lower-cased) before storage.
    pub email: String,
    pub updated_at_ms: i64,
}

#[derive(Default)]
struct CacheInner {
    next_id: u64,
    /// Records live here, keyed by an internal id. Both key namespaces point
    /// into this table, so a dual-keyed write is one record, never two copies
    /// that could drift apart.
    records: HashMap<u64, SessionRecord>,
    keys: HashMap<CacheKey, u64>,
}

/// In-memory session cache with lazy TTL eviction. Owned by the server and
/// passed where needed; there is deliberately no process-global instance.
/// The mutex covers every read-modify-write, which is all the coordination
/// concurrent tool calls need.
#[derive(Default)]
pub struct SessionCache {
    inner: Mutex<CacheInner>,
}

impl SessionCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop every record idle past the TTL, and every key pointing at one.
    /// Called opportunistically at the start of cache-touching operations;
    /// there is no background timer.
    pub fn sweep(&self, now_ms: i64) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let CacheInner { records, keys, .. } = &mut *inner;
        records.retain(|_, record| now_ms - record.updated_at_ms <= SESSION_TTL_MS);
        keys.retain(|_, id| records.contains_key(id));
    }

    /// Plain lookup. Does not refresh `updated_at`; deciding that a record
    /// is actually being used is the resolver's call, via `touch`.
    pub fn get(&self, key: &CacheKey) -> Option<SessionRecord> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let id = inner.keys.get(key)?;
        inner.records.get(id).cloned()
    }

    /// Lookup that refreshes `updated_at` in the same critical section and
    /// returns the stored token.
    pub fn touch(&self, key: &CacheKey, now_ms: i64) -> Option<String> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let id = *inner.keys.get(key)?;
        let record = inner.records.get_mut(&id)?;
        record.updated_at_ms = now_ms;
        Some(record.session_token.clone())
    }

    /// Unconditional overwrite under every given key. All keys share one
    /// record. Records left unreachable by the overwrite are dropped.
    pub fn put(&self, cache_keys: impl IntoIterator<Item = CacheKey>, record: SessionRecord) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.next_id += 1;
        let id = inner.next_id;
        inner.records.insert(id, record);
        for key in cache_keys {
            inner.keys.insert(key, id);
        }
        let CacheInner { records, keys, .. } = &mut *inner;
        let live: HashSet<u64> = keys.values().copied().collect();
        records.retain(|record_id, _| live.contains(record_id));
    }

    #[cfg(test)]
    fn record_count(&self) -> usize {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.records.len()
    }
}

/// Request body for the backend's authenticate exchange.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AuthenticateRequest {
    pub email: String,
    pub region: String,
    pub roles: Vec<String>,
    pub tools_used: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AuthenticateResponse {
    pub session_token: String,
    pub email: String,
    #[serde(default)]
    pub user_id: Option<String>,
}

/// The backend collaborator capability the bootstrapper consumes: exchange
/// an identity for a session token. Failures propagate; nothing here retries.
pub trait AuthExchange {
    fn authenticate(
        &self,
        request: &AuthenticateRequest,
    ) -> impl Future<Output = Result<AuthenticateResponse, BackendError>> + Send;
}

/// Session tokens minted by the backend are UUIDs. Explicitly supplied
/// tokens that do not parse are rejected up front so the caller can be told
/// to re-authenticate instead of retrying blindly.
pub fn is_valid_session_token(token: &str) -> bool {
    Uuid::parse_str(token).is_ok()
}

/// Resolves which authenticated session a tool call belongs to, and mints
/// synthetic sessions when the deployment runs without authentication.
#[derive(Default)]
pub struct SessionManager {
    cache: SessionCache,
}

impl SessionManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cache(&self) -> &SessionCache {
        &self.cache
    }

    /// Find an existing session token for this call, or `None`.
    ///
    /// Precedence is fixed: an explicit token (context meta, then context
    /// top level, then tool input) is returned verbatim without touching the
    /// cache; then the context-derived key; then the email key. Cache hits
    /// refresh the record's `updated_at`.
    pub fn resolve(
        &self,
        input: &SessionInput,
        hints: &IdentityHints,
        now_ms: i64,
    ) -> Option<String> {
        if let Some(explicit) = hints
            .session_token
            .clone()
            .or_else(|| input.session_token.clone())
        {
            debug!("session resolved from explicit token");
            return Some(explicit);
        }

        self.cache.sweep(now_ms);

        if let Some(context_id) = &hints.context_id {
            let key = CacheKey::Context(context_id.clone());
            if let Some(token) = self.cache.touch(&key, now_ms) {
                debug!(key = %key, "session resolved from context cache");
                return Some(token);
            }
        }

        if let Some(email) = input.email.as_deref().or(hints.auth_email.as_deref()) {
            let key = CacheKey::Email(identity::normalize_email(email));
            if let Some(token) = self.cache.touch(&key, now_ms) {
                debug!(key = %key, "session resolved from email cache");
                return Some(token);
            }
        }

        None
    }

    /// Store a freshly issued token under both namespaces so either signal
    /// alone resolves it on a later call.
    pub fn remember(
        &self,
        hints: &IdentityHints,
        session_token: &str,
        email: &str,
        now_ms: i64,
    ) {
        self.cache.sweep(now_ms);

        let normalized = identity::normalize_email(email);
        let mut keys = Vec::with_capacity(2);
        if let Some(context_id) = &hints.context_id {
            keys.push(CacheKey::Context(context_id.clone()));
        }
        if !normalized.is_empty() {
            keys.push(CacheKey::Email(normalized.clone()));
        }
        self.cache.put(
            keys,
            SessionRecord {
                session_token: session_token.to_string(),
                email: normalized,
                updated_at_ms: now_ms,
            },
        );
    }

    /// Resolve an existing session, or — only when authentication is off —
    /// bootstrap one: derive an email (explicit signal, else deterministic
    /// synthetic address from the context key, else a one-off guest), run
    /// the backend exchange, cache the result. `Ok(None)` means the caller
    /// must authenticate.
    pub async fn resolve_or_create<B: AuthExchange>(
        &self,
        backend: &B,
        auth_enabled: bool,
        input: &SessionInput,
        hints: &IdentityHints,
        now_ms: i64,
    ) -> Result<Option<String>, BackendError> {
        if let Some(existing) = self.resolve(input, hints, now_ms) {
            return Ok(Some(existing));
        }
        if auth_enabled {
            return Ok(None);
        }

        let context_key = hints.context_id.clone().map(CacheKey::Context);
        let email = input
            .email
            .clone()
            .or_else(|| hints.auth_email.clone())
            .or_else(|| {
                context_key
                    .as_ref()
                    .map(|key| identity::synthetic_email_for_context(&key.to_string()))
            })
            .unwrap_or_else(identity::guest_email);

        let request = AuthenticateRequest {
            email,
            region: input.region.clone().unwrap_or_else(|| "auto".to_string()),
            roles: input.roles.clone(),
            tools_used: input.tools_used.clone(),
        };
        let response = backend.authenticate(&request).await?;

        self.remember(hints, &response.session_token, &response.email, now_ms);
        info!(email = %response.email, "bootstrapped no-auth session");
        Ok(Some(response.session_token))
    }
}
