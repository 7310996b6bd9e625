use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/// User record as held by the persistence store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: i64,                          // unique user ID, immutable
    pub email: String,                    // unique lookup key
    pub username: String,                 // unique lookup key
    #[serde(skip_serializing)]
    pub password_hash: String,            // argon2 digest, not exposed in JSON
    pub full_name: Option<String>,
    pub is_active: bool,                  // false blocks auth and session resolution
    pub theme_preference: ThemePreference,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,       // refreshed on every mutation
}

/// UI theme choice, owned by the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ThemePreference {
    Light,
    Dark,
    System,
}

impl ThemePreference {
    pub fn as_str(&self) -> &'static str {
        match self {
            ThemePreference::Light => "light",
            ThemePreference::Dark => "dark",
            ThemePreference::System => "system",
        }
    }
}

impl std::str::FromStr for ThemePreference {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "light" => Ok(ThemePreference::Light),
            "dark" => Ok(ThemePreference::Dark),
            "system" => Ok(ThemePreference::System),
            other => Err(format!("unknown theme preference: {other}")),
        }
    }
}

/// Fields for a new user row. Activation flag and theme take their defaults
/// at the store (`is_active = true`, `theme_preference = system`).
#[derive(Debug, Clone)]
pub struct NewUser {
    pub email: String,
    pub username: String,
    pub password_hash: String,
    pub full_name: Option<String>,
}

/// Partial update; `None` fields are left unchanged.
#[derive(Debug, Clone, Default)]
pub struct UserPatch {
    pub email: Option<String>,
    pub full_name: Option<String>,
    pub password_hash: Option<String>,
    pub theme_preference: Option<ThemePreference>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UniqueField {
    Email,
    Username,
}

impl std::fmt::Display for UniqueField {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UniqueField::Email => write!(f, "email"),
            UniqueField::Username => write!(f, "username"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("unique constraint violated on {0}")]
    UniqueViolation(UniqueField),

    #[error("user not found")]
    NotFound,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Persistence collaborator contract. The unique constraints behind `insert`
/// and `update` are the final authority on email/username uniqueness; any
/// pre-checks in callers are advisory.
#[async_trait]
pub trait UserStore: Send + Sync {
    async fn find_by_id(&self, id: i64) -> Result<Option<User>, StoreError>;
    async fn find_by_email(&self, email: &str) -> Result<Option<User>, StoreError>;
    async fn find_by_username(&self, username: &str) -> Result<Option<User>, StoreError>;
    async fn insert(&self, new: NewUser) -> Result<User, StoreError>;
    async fn update(&self, id: i64, patch: UserPatch) -> Result<User, StoreError>;
}
