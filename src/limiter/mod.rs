//! Request-rate policing engine.
//!
//! Ingests request events on behalf of client applications and answers
//! with an escalating enforcement decision per source IP:
//!
//! ```text
//! ALLOW ──▶ FLAG ──▶ THROTTLE ──▶ BAN
//! ```
//!
//! An IP under its request budget is allowed. The first over-limit event
//! ever flags the IP (a one-time warning). Further over-limit events are
//! throttled, and enough throttles inside the throttle window escalate to
//! an automatic, expiring ban.

mod cleanup;
mod engine;
mod window;

pub use cleanup::spawn_cleanup_task;
pub use engine::{Limiter, LimiterStats};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Reason attached to FLAG decisions.
pub(crate) const REASON_SUSPICIOUS: &str = "suspicious activity detected";
/// Reason attached to THROTTLE decisions.
pub(crate) const REASON_THROTTLED: &str = "rate limit exceeded";
/// Reason attached to ladder-produced BAN decisions.
pub(crate) const REASON_AUTO_BAN: &str = "auto-ban: repeated throttling";

/// Enforcement action for an IP.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Action {
    Allow,
    Flag,
    Throttle,
    Ban,
}

impl Action {
    /// Wire name of this action.
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Allow => "ALLOW",
            Action::Flag => "FLAG",
            Action::Throttle => "THROTTLE",
            Action::Ban => "BAN",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// The result of inspecting or logging a request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Decision {
    pub action: Action,
    pub ip: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Seconds the caller should wait before retrying; set on THROTTLE.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<u64>,
}

impl Decision {
    pub(crate) fn allow(ip: String) -> Self {
        Self {
            action: Action::Allow,
            ip,
            reason: None,
            retry_after: None,
        }
    }

    pub(crate) fn flag(ip: String) -> Self {
        Self {
            action: Action::Flag,
            ip,
            reason: Some(REASON_SUSPICIOUS.to_string()),
            retry_after: None,
        }
    }

    pub(crate) fn throttle(ip: String, retry_after: u64) -> Self {
        Self {
            action: Action::Throttle,
            ip,
            reason: Some(REASON_THROTTLED.to_string()),
            retry_after: Some(retry_after),
        }
    }

    pub(crate) fn ban(ip: String, reason: &str) -> Self {
        Self {
            action: Action::Ban,
            ip,
            reason: Some(reason.to_string()),
            retry_after: None,
        }
    }
}

/// A single request event observed on behalf of a client application.
#[derive(Debug, Clone, Serialize)]
pub struct RequestLog {
    pub time: DateTime<Utc>,
    pub ip: String,
    pub method: String,
    pub path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
}
