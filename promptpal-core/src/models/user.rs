use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: i64,
    pub name: String,
    /// Wallet address, stored lower-cased.
    pub addr: String,
    pub email: String,
    pub level: i16,
    pub created_at: DateTime<Utc>,
}

/// Seed data for an operator account.
#[derive(Debug, Clone, Deserialize)]
pub struct NewUser {
    pub name: String,
    pub addr: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub level: i16,
}

impl NewUser {
    pub fn into_user(self, id: i64, now: DateTime<Utc>) -> User {
        User {
            id,
            name: self.name,
            addr: self.addr.to_lowercase(),
            email: self.email,
            level: self.level,
            created_at: now,
        }
    }
}
