//! Account lookup used to validate declared chat identities.
//!
//! Registration and profile editing live in the account service; this module
//! only needs to know whether a username exists and to record online status.

use async_trait::async_trait;
use dashmap::DashMap;
use serde::Serialize;

use crate::db::{self, DbPool, StoreError};

/// Online status persisted on the account (matches the `users.status` column).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PresenceStatus {
    Offline = 0,
    Online = 1,
}

impl PresenceStatus {
    pub fn from_i64(value: i64) -> Self {
        match value {
            1 => Self::Online,
            _ => Self::Offline,
        }
    }

    pub fn as_i64(&self) -> i64 {
        *self as i64
    }
}

/// Public profile of an account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProfileInfo {
    pub username: String,
    pub nickname: String,
    pub avatar: String,
    pub status: PresenceStatus,
}

impl ProfileInfo {
    /// Profile with the account service's defaults: nickname falls back to the
    /// username, avatar to the stock image.
    pub fn new(username: &str) -> Self {
        Self {
            username: username.to_string(),
            nickname: username.to_string(),
            avatar: DEFAULT_AVATAR.to_string(),
            status: PresenceStatus::Offline,
        }
    }
}

pub const DEFAULT_AVATAR: &str = "/img/default-avatar.jpg";

/// Credential/profile lookup consumed by the message router and presence announcer.
#[async_trait]
pub trait ProfileResolver: Send + Sync {
    /// Resolve a username to its profile. `Ok(None)` means no such account.
    async fn resolve(&self, username: &str) -> Result<Option<ProfileInfo>, StoreError>;

    /// Record that `username` came online or went offline.
    async fn set_status(&self, username: &str, status: PresenceStatus) -> Result<(), StoreError>;
}

/// Process-local profile table, used by tests and ephemeral deployments.
#[derive(Debug, Default)]
pub struct InMemoryProfiles {
    profiles: DashMap<String, ProfileInfo>,
}

impl InMemoryProfiles {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the table with the given usernames.
    pub fn with_users<I, S>(usernames: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let profiles = Self::new();
        for name in usernames {
            profiles.insert(ProfileInfo::new(name.as_ref()));
        }
        profiles
    }

    pub fn insert(&self, profile: ProfileInfo) {
        self.profiles.insert(profile.username.clone(), profile);
    }

    pub fn status(&self, username: &str) -> Option<PresenceStatus> {
        self.profiles.get(username).map(|entry| entry.status)
    }
}

#[async_trait]
impl ProfileResolver for InMemoryProfiles {
    async fn resolve(&self, username: &str) -> Result<Option<ProfileInfo>, StoreError> {
        Ok(self.profiles.get(username).map(|entry| entry.value().clone()))
    }

    async fn set_status(&self, username: &str, status: PresenceStatus) -> Result<(), StoreError> {
        if let Some(mut entry) = self.profiles.get_mut(username) {
            entry.status = status;
        }
        Ok(())
    }
}

/// Profiles backed by the `users` table.
#[derive(Debug, Clone)]
pub struct SqliteProfiles {
    db: DbPool,
}

impl SqliteProfiles {
    pub fn new(db: DbPool) -> Self {
        Self { db }
    }

    /// Insert an account row. Used for seeding and tests; registration proper is
    /// owned by the account service.
    pub async fn insert_user(&self, username: &str, nickname: Option<&str>) -> Result<(), StoreError> {
        let username = username.to_string();
        let nickname = nickname
            .filter(|n| !n.trim().is_empty())
            .unwrap_or(&username)
            .to_string();
        db::with_conn(&self.db, move |conn| {
            conn.execute(
                "INSERT INTO users (username, nickname, avatar, status, created_at)
                 VALUES (?1, ?2, ?3, 0, ?4)",
                rusqlite::params![username, nickname, DEFAULT_AVATAR, chrono::Utc::now().to_rfc3339()],
            )?;
            Ok(())
        })
        .await
    }
}

#[async_trait]
impl ProfileResolver for SqliteProfiles {
    async fn resolve(&self, username: &str) -> Result<Option<ProfileInfo>, StoreError> {
        let username = username.to_string();
        db::with_conn(&self.db, move |conn| {
            let mut stmt = conn.prepare(
                "SELECT username, nickname, avatar, status FROM users WHERE username = ?1",
            )?;
            let mut rows = stmt.query_map(rusqlite::params![username], |row| {
                let username: String = row.get(0)?;
                let nickname: Option<String> = row.get(1)?;
                let avatar: Option<String> = row.get(2)?;
                Ok(ProfileInfo {
                    nickname: nickname.unwrap_or_else(|| username.clone()),
                    avatar: avatar.unwrap_or_else(|| DEFAULT_AVATAR.to_string()),
                    status: PresenceStatus::from_i64(row.get(3)?),
                    username,
                })
            })?;
            Ok(rows.next().transpose()?)
        })
        .await
    }

    async fn set_status(&self, username: &str, status: PresenceStatus) -> Result<(), StoreError> {
        let username = username.to_string();
        db::with_conn(&self.db, move |conn| {
            match status {
                PresenceStatus::Online => conn.execute(
                    "UPDATE users SET status = ?1, last_login_at = ?2 WHERE username = ?3",
                    rusqlite::params![status.as_i64(), chrono::Utc::now().to_rfc3339(), username],
                )?,
                PresenceStatus::Offline => conn.execute(
                    "UPDATE users SET status = ?1 WHERE username = ?2",
                    rusqlite::params![status.as_i64(), username],
                )?,
            };
            Ok(())
        })
        .await
    }
}
