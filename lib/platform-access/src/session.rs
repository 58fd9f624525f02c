//! Session state for authenticated users.
//!
//! A session has two halves:
//! - [`Session`]: the metadata record (who, since when, until when) used to
//!   bound a browser session's lifetime.
//! - [`SessionStore`]: the string-keyed entries the token components read and
//!   write, chiefly the tokens from the identity provider.
//!
//! Every component that needs session state receives a `&dyn SessionStore`
//! explicitly. There is no process-wide session table.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use keygate_core::UserId;
use rootcause::prelude::Report;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::RwLock;

use crate::error::StoreError;

/// Session key holding the current access token.
pub const ACCESS_TOKEN: &str = "access_token";
/// Session key holding the current refresh token.
pub const REFRESH_TOKEN: &str = "refresh_token";
/// Session key holding the ID token from the last login or refresh.
pub const ID_TOKEN: &str = "id_token";

/// Unique identifier for a session.
///
/// Session IDs are opaque strings generated during session creation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    /// Creates a new session ID from a string.
    #[must_use]
    pub fn new(id: String) -> Self {
        Self(id)
    }

    /// Returns the session ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for SessionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for SessionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Lifetime metadata for an authenticated session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    id: SessionId,
    user_id: UserId,
    created_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
}

impl Session {
    /// Creates a new session for the given user, valid for `duration`.
    #[must_use]
    pub fn new(id: SessionId, user_id: UserId, duration: Duration) -> Self {
        let now = Utc::now();
        Self {
            id,
            user_id,
            created_at: now,
            expires_at: now + duration,
        }
    }

    /// Reconstructs a session from stored fields.
    #[must_use]
    pub fn from_parts(
        id: SessionId,
        user_id: UserId,
        created_at: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            user_id,
            created_at,
            expires_at,
        }
    }

    #[must_use]
    pub fn id(&self) -> &SessionId {
        &self.id
    }

    #[must_use]
    pub fn user_id(&self) -> UserId {
        self.user_id
    }

    #[must_use]
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    #[must_use]
    pub fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }

    /// Returns true if the session has expired.
    #[must_use]
    pub fn is_expired(&self) -> bool {
        Utc::now() >= self.expires_at
    }
}

/// String-valued per-session storage.
///
/// Implementations must make `clear` idempotent.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// The session this store is scoped to.
    fn session_id(&self) -> &SessionId;

    /// Reads an entry.
    async fn get(&self, key: &str) -> Result<Option<String>, Report<StoreError>>;

    /// Writes an entry, replacing any previous value.
    async fn set(&self, key: &str, value: &str) -> Result<(), Report<StoreError>>;

    /// Removes every entry.
    async fn clear(&self) -> Result<(), Report<StoreError>>;
}

/// Snapshot of the tokens held in a session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TokenSet {
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
    pub id_token: Option<String>,
}

impl TokenSet {
    /// Reads all three tokens from `store`.
    pub async fn load(store: &dyn SessionStore) -> Result<Self, Report<StoreError>> {
        Ok(Self {
            access_token: store.get(ACCESS_TOKEN).await?,
            refresh_token: store.get(REFRESH_TOKEN).await?,
            id_token: store.get(ID_TOKEN).await?,
        })
    }

    /// Writes every present token into `store`. Absent tokens are left as they are.
    pub async fn save(&self, store: &dyn SessionStore) -> Result<(), Report<StoreError>> {
        for (key, value) in [
            (ACCESS_TOKEN, &self.access_token),
            (REFRESH_TOKEN, &self.refresh_token),
            (ID_TOKEN, &self.id_token),
        ] {
            if let Some(value) = value {
                store.set(key, value).await?;
            }
        }
        Ok(())
    }
}

/// In-process session store.
#[derive(Debug)]
pub struct MemorySessionStore {
    id: SessionId,
    entries: RwLock<HashMap<String, String>>,
}

impl MemorySessionStore {
    /// Creates an empty store for `id`.
    #[must_use]
    pub fn new(id: impl Into<SessionId>) -> Self {
        Self {
            id: id.into(),
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Creates a store pre-populated with `entries`.
    #[must_use]
    pub fn with_entries<K, V>(id: impl Into<SessionId>, entries: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            id: id.into(),
            entries: RwLock::new(
                entries
                    .into_iter()
                    .map(|(k, v)| (k.into(), v.into()))
                    .collect(),
            ),
        }
    }

    /// Returns true if the store holds no entries.
    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    fn session_id(&self) -> &SessionId {
        &self.id
    }

    async fn get(&self, key: &str) -> Result<Option<String>, Report<StoreError>> {
        Ok(self.entries.read().await.get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), Report<StoreError>> {
        self.entries
            .write()
            .await
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn clear(&self) -> Result<(), Report<StoreError>> {
        self.entries.write().await.clear();
        Ok(())
    }
}
