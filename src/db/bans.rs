//! Repository for banned IPs.

use super::DbError;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use sqlx::SqlitePool;

/// A banned IP address.
///
/// `expires_at` of `None` means the ban is permanent.
#[derive(Debug, Clone, Serialize)]
pub struct Ban {
    pub ip: String,
    pub reason: String,
    pub banned_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl Ban {
    /// Check if this ban has expired as of `now`.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|expires| expires < now)
    }
}

/// Serialize an instant as an RFC 3339 UTC string.
///
/// Second precision with a `Z` suffix, so stored values are fixed-width and
/// lexicographic comparison matches chronological order.
fn to_db_time(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Secs, true)
}

fn from_db_time(s: &str) -> Result<DateTime<Utc>, DbError> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|_| DbError::InvalidTimestamp(s.to_string()))
}

type BanRow = (String, String, String, Option<String>);

fn ban_from_row(row: BanRow) -> Result<Ban, DbError> {
    let (ip, reason, banned_at, expires_at) = row;
    Ok(Ban {
        ip,
        reason,
        banned_at: from_db_time(&banned_at)?,
        expires_at: expires_at.as_deref().map(from_db_time).transpose()?,
    })
}

/// Repository for ban operations.
pub struct BanRepository<'a> {
    pool: &'a SqlitePool,
}

impl<'a> BanRepository<'a> {
    /// Create a new ban repository.
    pub fn new(pool: &'a SqlitePool) -> Self {
        Self { pool }
    }

    /// Insert a ban, replacing any existing ban for the same IP.
    pub async fn upsert(&self, ban: &Ban) -> Result<(), DbError> {
        sqlx::query(
            r#"
            INSERT INTO banned_ips (ip, reason, banned_at, expires_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(ip) DO UPDATE SET
                reason = excluded.reason,
                banned_at = excluded.banned_at,
                expires_at = excluded.expires_at
            "#,
        )
        .bind(&ban.ip)
        .bind(&ban.reason)
        .bind(to_db_time(ban.banned_at))
        .bind(ban.expires_at.map(to_db_time))
        .execute(self.pool)
        .await?;

        Ok(())
    }

    /// Remove a ban. Returns `false` if the IP was not banned.
    pub async fn delete(&self, ip: &str) -> Result<bool, DbError> {
        let result = sqlx::query("DELETE FROM banned_ips WHERE ip = ?")
            .bind(ip)
            .execute(self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Look up a single ban by IP.
    pub async fn get(&self, ip: &str) -> Result<Option<Ban>, DbError> {
        let row = sqlx::query_as::<_, BanRow>(
            "SELECT ip, reason, banned_at, expires_at FROM banned_ips WHERE ip = ?",
        )
        .bind(ip)
        .fetch_optional(self.pool)
        .await?;

        row.map(ban_from_row).transpose()
    }

    /// List all bans, most recent first. Used for startup hydration and
    /// operator listing.
    pub async fn list(&self) -> Result<Vec<Ban>, DbError> {
        let rows = sqlx::query_as::<_, BanRow>(
            "SELECT ip, reason, banned_at, expires_at FROM banned_ips ORDER BY banned_at DESC",
        )
        .fetch_all(self.pool)
        .await?;

        rows.into_iter().map(ban_from_row).collect()
    }

    /// Remove all bans that expired strictly before `now`.
    /// Returns the number of rows removed. Permanent bans are never touched.
    pub async fn delete_expired(&self, now: DateTime<Utc>) -> Result<u64, DbError> {
        let result =
            sqlx::query("DELETE FROM banned_ips WHERE expires_at IS NOT NULL AND expires_at < ?")
                .bind(to_db_time(now))
                .execute(self.pool)
                .await?;

        Ok(result.rows_affected())
    }
}
