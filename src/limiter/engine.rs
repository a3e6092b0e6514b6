//! Decision engine: per-IP counters, the escalation ladder, and the ban
//! mirror.
//!
//! # Architecture
//!
//! All mutable state lives behind a single mutex. The ladder's
//! read-modify-write spans three maps (`requests`, `flagged`, `throttles`)
//! that must observe a consistent view, and critical sections are pure
//! in-memory work, so one engine-level lock beats finer-grained locking
//! here.
//!
//! Ban writes are write-through: the durable store first, then the
//! mirror, so the mirror never reports a ban the store lost. The mirror
//! is authoritative for reads; the store is authoritative across
//! restarts. Expired mirror entries are removed lazily at the next read.

use super::window::SlidingWindow;
use super::{Action, Decision, REASON_AUTO_BAN, RequestLog};
use crate::config::LimitsConfig;
use crate::db::{Ban, Database, DbError};
use crate::metrics;
use crate::notify::Notifier;
use chrono::{DateTime, TimeDelta, Utc};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Counts reported by [`Limiter::stats`].
#[derive(Debug, Clone, Copy, Serialize)]
pub struct LimiterStats {
    pub active_bans: usize,
    pub flagged_ips: usize,
    pub tracked_ips: usize,
    pub recent_requests: usize,
}

/// Mutable engine state guarded by the engine mutex.
#[derive(Default)]
struct EngineState {
    /// Request events per IP within the request window.
    requests: HashMap<String, SlidingWindow>,
    /// IPs that have exceeded the request limit at least once, with the
    /// instant they were first flagged. Never shrinks for the process
    /// lifetime: a flagged IP skips the one-time warning on later bursts.
    flagged: HashMap<String, DateTime<Utc>>,
    /// Throttle events per IP within the throttle window.
    throttles: HashMap<String, SlidingWindow>,
    /// Message events per user within the message window.
    messages: HashMap<String, SlidingWindow>,
    /// In-memory mirror of the banned-IP table.
    banned: HashMap<String, Ban>,
    /// Most recent request events, capped at `in_memory_log_limit`.
    recent: VecDeque<RequestLog>,
    /// Subscriber callback URLs, deduplicated.
    callbacks: Vec<String>,
}

/// Thread-safe rate policing engine.
///
/// Shared as `Arc<Limiter>` between the HTTP handlers and the cleanup
/// task.
pub struct Limiter {
    limits: LimitsConfig,
    db: Database,
    notifier: Notifier,
    state: Mutex<EngineState>,
}

impl Limiter {
    /// Create a new engine. The ban mirror starts empty until
    /// [`Limiter::load_bans`] hydrates it.
    pub fn new(limits: LimitsConfig, db: Database) -> Self {
        Self {
            limits,
            db,
            notifier: Notifier::new(),
            state: Mutex::new(EngineState::default()),
        }
    }

    /// Hydrate the ban mirror from the durable store.
    ///
    /// Counters and the flagged set are process-local and always start
    /// empty; a restart grants amnesty from flagging.
    pub async fn load_bans(&self) -> Result<usize, DbError> {
        let bans = self.db.bans().list().await?;
        let mut guard = self.state.lock().await;
        for ban in bans {
            guard.banned.insert(ban.ip.clone(), ban);
        }
        let count = guard.banned.len();
        metrics::set_active_bans(count);
        debug!(count, "Ban cache hydrated");
        Ok(count)
    }

    /// Check the ban mirror for `ip`.
    ///
    /// An expired entry is removed from the mirror and, best-effort, from
    /// the store (lazy expiry); the call then reports not-banned.
    pub async fn is_banned(&self, ip: &str) -> Option<Ban> {
        let now = Utc::now();
        {
            let mut guard = self.state.lock().await;
            let expired = guard.banned.get(ip).is_some_and(|ban| ban.is_expired(now));
            if !expired {
                return guard.banned.get(ip).cloned();
            }
            guard.banned.remove(ip);
            metrics::set_active_bans(guard.banned.len());
        }
        // The mirror entry had expired; drop the durable row too.
        if let Err(e) = self.db.bans().delete(ip).await {
            warn!(ip = %ip, error = %e, "Failed to delete expired ban");
        }
        None
    }

    /// Report the engine's current view of `ip` without recording a
    /// request event.
    ///
    /// Checks in order: banned, throttling, flagged, allow. A non-empty
    /// throttle window reports THROTTLE even when the IP is back under
    /// its request budget: throttles stay sticky for the throttle window.
    pub async fn inspect(&self, ip: &str) -> Decision {
        let now = Utc::now();
        let mut expired_ban = false;

        let decision = {
            let mut guard = self.state.lock().await;
            let state = &mut *guard;

            if state.banned.get(ip).is_some_and(|b| b.is_expired(now)) {
                state.banned.remove(ip);
                metrics::set_active_bans(state.banned.len());
                expired_ban = true;
            }

            if let Some(ban) = state.banned.get(ip) {
                Decision::ban(ip.to_string(), &ban.reason)
            } else {
                let throttled = match state.throttles.get_mut(ip) {
                    Some(window) => {
                        window.prune(self.limits.throttle_window(), now);
                        !window.is_empty()
                    }
                    None => false,
                };
                if throttled {
                    Decision::throttle(ip.to_string(), self.limits.request_window_secs)
                } else if state.flagged.contains_key(ip) {
                    Decision::flag(ip.to_string())
                } else {
                    Decision::allow(ip.to_string())
                }
            }
        };

        if expired_ban
            && let Err(e) = self.db.bans().delete(ip).await
        {
            warn!(ip = %ip, error = %e, "Failed to delete expired ban");
        }

        decision
    }

    /// Record a request event and evaluate the escalation ladder.
    ///
    /// Banned IPs are not special-cased here: the transport is expected
    /// to short-circuit on [`Limiter::is_banned`] before calling. A BAN
    /// decision takes effect once the caller persists it via
    /// [`Limiter::record_auto_ban`].
    pub async fn log_request(&self, request: RequestLog) -> Decision {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;

        if state.recent.len() >= self.limits.in_memory_log_limit {
            state.recent.pop_front();
        }
        state.recent.push_back(request.clone());
        metrics::record_request_logged();

        let RequestLog { time: now, ip, .. } = request;

        let count = {
            let window = state.requests.entry(ip.clone()).or_default();
            window.prune(self.limits.request_window(), now);
            window.push(now);
            window.len()
        };

        let decision = if count <= self.limits.request_limit {
            Decision::allow(ip)
        } else if !state.flagged.contains_key(&ip) {
            // First over-limit event ever: the one-time warning. It does
            // not charge the throttle counter; the next over-limit event
            // is the first throttle.
            state.flagged.insert(ip.clone(), now);
            debug!(ip = %ip, "IP flagged");
            Decision::flag(ip)
        } else {
            let throttles = state.throttles.entry(ip.clone()).or_default();
            throttles.prune(self.limits.throttle_window(), now);
            throttles.push(now);
            if throttles.len() >= self.limits.throttle_limit {
                debug!(ip = %ip, "Auto-ban threshold reached");
                Decision::ban(ip, REASON_AUTO_BAN)
            } else {
                Decision::throttle(ip, self.limits.request_window_secs)
            }
        };

        metrics::record_decision(decision.action);
        decision
    }

    /// Persist an automatic ban, expiring after the configured ban
    /// duration, and reflect it in the mirror.
    ///
    /// Called by the transport when [`Limiter::log_request`] returned a
    /// BAN decision.
    pub async fn record_auto_ban(&self, ip: &str, reason: &str) -> Result<Ban, DbError> {
        let now = Utc::now();
        self.store_ban(Ban {
            ip: ip.to_string(),
            reason: reason.to_string(),
            banned_at: now,
            expires_at: Some(add_duration(now, self.limits.ban_duration())),
        })
        .await
    }

    /// Persist an operator ban, bypassing the ladder.
    ///
    /// A zero `duration` makes the ban permanent.
    pub async fn record_manual_ban(
        &self,
        ip: &str,
        reason: &str,
        duration: Duration,
    ) -> Result<Ban, DbError> {
        let now = Utc::now();
        self.store_ban(Ban {
            ip: ip.to_string(),
            reason: reason.to_string(),
            banned_at: now,
            expires_at: (!duration.is_zero()).then(|| add_duration(now, duration)),
        })
        .await
    }

    /// Write-through: durable store first, then mirror.
    async fn store_ban(&self, ban: Ban) -> Result<Ban, DbError> {
        self.db.bans().upsert(&ban).await?;
        let mut guard = self.state.lock().await;
        guard.banned.insert(ban.ip.clone(), ban.clone());
        metrics::set_active_bans(guard.banned.len());
        Ok(ban)
    }

    /// Remove a ban from the mirror and the store. Idempotent.
    pub async fn unban(&self, ip: &str) -> Result<(), DbError> {
        {
            let mut guard = self.state.lock().await;
            guard.banned.remove(ip);
            metrics::set_active_bans(guard.banned.len());
        }
        self.db.bans().delete(ip).await?;
        Ok(())
    }

    /// List all bans from the durable store, most recent first.
    pub async fn list_bans(&self) -> Result<Vec<Ban>, DbError> {
        self.db.bans().list().await
    }

    /// Snapshot copy of the recent-events ring.
    pub async fn recent_requests(&self) -> Vec<RequestLog> {
        self.state.lock().await.recent.iter().cloned().collect()
    }

    /// Record a message event for `user_id` if the user is under the
    /// message limit. The event is charged only when allowed.
    pub async fn can_send_message(&self, user_id: &str) -> bool {
        let now = Utc::now();
        let mut guard = self.state.lock().await;
        let window = guard.messages.entry(user_id.to_string()).or_default();
        window.prune(self.limits.message_window(), now);
        if window.len() < self.limits.message_limit {
            window.push(now);
            true
        } else {
            false
        }
    }

    /// Register a callback URL for enforcement events. Duplicates are
    /// ignored.
    pub async fn register_callback(&self, url: &str) {
        let mut guard = self.state.lock().await;
        if !guard.callbacks.iter().any(|u| u == url) {
            guard.callbacks.push(url.to_string());
        }
    }

    /// Remove a callback URL. Idempotent.
    pub async fn unregister_callback(&self, url: &str) {
        self.state.lock().await.callbacks.retain(|u| u != url);
    }

    /// Snapshot of the registered callback URLs.
    pub async fn callbacks(&self) -> Vec<String> {
        self.state.lock().await.callbacks.clone()
    }

    /// Deliver a non-ALLOW decision to all subscribers, fire-and-forget.
    ///
    /// The subscriber snapshot is taken under the engine lock; delivery
    /// happens outside it and never blocks the caller.
    pub async fn notify_callbacks(&self, decision: &Decision) {
        let urls = self.state.lock().await.callbacks.clone();
        if urls.is_empty() || decision.action == Action::Allow {
            return;
        }
        self.notifier.dispatch(urls, decision);
    }

    /// Current engine counts, for operator observation.
    pub async fn stats(&self) -> LimiterStats {
        let guard = self.state.lock().await;
        LimiterStats {
            active_bans: guard.banned.len(),
            flagged_ips: guard.flagged.len(),
            tracked_ips: guard.requests.len(),
            recent_requests: guard.recent.len(),
        }
    }

    /// One cleanup sweep: delete expired bans from the store, evict the
    /// matching mirror entries, and reclaim freed pages.
    pub async fn run_cleanup(&self) {
        let now = Utc::now();
        match self.db.bans().delete_expired(now).await {
            Ok(0) => {}
            Ok(removed) => {
                let mut guard = self.state.lock().await;
                guard.banned.retain(|_, ban| !ban.is_expired(now));
                metrics::set_active_bans(guard.banned.len());
                drop(guard);
                debug!(count = removed, "Expired bans removed");
            }
            Err(e) => warn!(error = %e, "Failed to delete expired bans"),
        }

        if let Err(e) = self.db.compact().await {
            debug!(error = %e, "Incremental vacuum failed");
        }
    }
}

/// `now + duration`, saturating instead of panicking on overflow.
fn add_duration(now: DateTime<Utc>, duration: Duration) -> DateTime<Utc> {
    TimeDelta::from_std(duration)
        .ok()
        .and_then(|span| now.checked_add_signed(span))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn test_limits() -> LimitsConfig {
        LimitsConfig {
            request_window_secs: 1,
            request_limit: 5,
            throttle_window_secs: 10,
            throttle_limit: 3,
            ban_duration_secs: 2,
            message_window_secs: 1,
            message_limit: 2,
            in_memory_log_limit: 50,
        }
    }

    async fn test_limiter_at(
        dir: &tempfile::TempDir,
        limits: LimitsConfig,
    ) -> Limiter {
        let path = dir.path().join("test.db");
        let db = Database::new(path.to_str().expect("utf8 path"))
            .await
            .expect("open db");
        Limiter::new(limits, db)
    }

    async fn test_limiter() -> (Limiter, tempfile::TempDir) {
        let dir = tempfile::tempdir().expect("tempdir");
        let limiter = test_limiter_at(&dir, test_limits()).await;
        (limiter, dir)
    }

    fn request(ip: &str) -> RequestLog {
        RequestLog {
            time: Utc::now(),
            ip: ip.to_string(),
            method: "GET".to_string(),
            path: "/".to_string(),
            user_id: None,
        }
    }

    async fn drive_to_ban(limiter: &Limiter, ip: &str) -> Decision {
        // 5 allows, 1 flag, 2 throttles, then the ban threshold.
        for _ in 0..8 {
            limiter.log_request(request(ip)).await;
        }
        let decision = limiter.log_request(request(ip)).await;
        assert_eq!(decision.action, Action::Ban);
        limiter
            .record_auto_ban(&decision.ip, decision.reason.as_deref().unwrap())
            .await
            .expect("persist auto-ban");
        decision
    }

    #[tokio::test]
    async fn test_escalation_sequence() {
        let (limiter, _dir) = test_limiter().await;

        let mut actions = Vec::new();
        for _ in 0..9 {
            actions.push(limiter.log_request(request("10.0.0.1")).await.action);
        }

        assert_eq!(
            actions,
            vec![
                Action::Allow,
                Action::Allow,
                Action::Allow,
                Action::Allow,
                Action::Allow,
                Action::Flag,
                Action::Throttle,
                Action::Throttle,
                Action::Ban,
            ]
        );

        limiter
            .record_auto_ban("10.0.0.1", REASON_AUTO_BAN)
            .await
            .unwrap();
        let inspected = limiter.inspect("10.0.0.1").await;
        assert_eq!(inspected.action, Action::Ban);
        assert_eq!(inspected.reason.as_deref(), Some(REASON_AUTO_BAN));
    }

    #[tokio::test]
    async fn test_throttle_carries_retry_after() {
        let (limiter, _dir) = test_limiter().await;

        for _ in 0..6 {
            limiter.log_request(request("10.0.0.2")).await;
        }
        let throttled = limiter.log_request(request("10.0.0.2")).await;
        assert_eq!(throttled.action, Action::Throttle);
        assert_eq!(throttled.retry_after, Some(1));
    }

    #[tokio::test]
    async fn test_flag_happens_once_per_process() {
        let (limiter, _dir) = test_limiter().await;

        for _ in 0..6 {
            limiter.log_request(request("10.0.0.3")).await;
        }
        // Let the request window (and throttle accumulation) settle far
        // enough that a new burst starts from a pruned request counter.
        tokio::time::sleep(Duration::from_millis(1200)).await;

        let mut actions = Vec::new();
        for _ in 0..6 {
            actions.push(limiter.log_request(request("10.0.0.3")).await.action);
        }
        // The sixth over-limit event goes straight to THROTTLE: the
        // one-time FLAG was already spent.
        assert_eq!(actions.iter().filter(|a| **a == Action::Flag).count(), 0);
        assert_eq!(actions[5], Action::Throttle);
    }

    #[tokio::test]
    async fn test_burst_recovery_after_window() {
        let (limiter, _dir) = test_limiter().await;

        for _ in 0..5 {
            let decision = limiter.log_request(request("10.0.0.4")).await;
            assert_eq!(decision.action, Action::Allow);
        }

        tokio::time::sleep(Duration::from_millis(1200)).await;
        let decision = limiter.log_request(request("10.0.0.4")).await;
        assert_eq!(decision.action, Action::Allow);
    }

    #[tokio::test]
    async fn test_auto_ban_expires() {
        let (limiter, _dir) = test_limiter().await;
        drive_to_ban(&limiter, "10.0.0.99").await;
        assert_eq!(limiter.inspect("10.0.0.99").await.action, Action::Ban);

        // ban_duration is 2s
        tokio::time::sleep(Duration::from_millis(2500)).await;
        let decision = limiter.inspect("10.0.0.99").await;
        assert_ne!(decision.action, Action::Ban);
        assert!(limiter.is_banned("10.0.0.99").await.is_none());
    }

    #[tokio::test]
    async fn test_lazy_expiry_removes_mirror_and_store() {
        let (limiter, _dir) = test_limiter().await;
        limiter
            .record_manual_ban("10.1.1.1", "short", Duration::from_secs(1))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(limiter.is_banned("10.1.1.1").await.is_none());
        assert!(limiter.db.bans().get("10.1.1.1").await.unwrap().is_none());
        assert_eq!(limiter.stats().await.active_bans, 0);
    }

    #[tokio::test]
    async fn test_manual_ban_and_unban() {
        let (limiter, _dir) = test_limiter().await;

        let ban = limiter
            .record_manual_ban("192.168.1.100", "abuse", Duration::from_secs(3600))
            .await
            .unwrap();
        assert!(ban.expires_at.is_some());

        let inspected = limiter.inspect("192.168.1.100").await;
        assert_eq!(inspected.action, Action::Ban);
        assert_eq!(inspected.reason.as_deref(), Some("abuse"));

        limiter.unban("192.168.1.100").await.unwrap();
        assert_eq!(limiter.inspect("192.168.1.100").await.action, Action::Allow);

        // Unban of a never-banned IP is a no-op.
        limiter.unban("192.168.1.100").await.unwrap();
    }

    #[tokio::test]
    async fn test_manual_ban_zero_duration_is_permanent() {
        let (limiter, _dir) = test_limiter().await;

        let ban = limiter
            .record_manual_ban("10.2.2.2", "permanent", Duration::ZERO)
            .await
            .unwrap();
        assert!(ban.expires_at.is_none());
        assert!(limiter.is_banned("10.2.2.2").await.is_some());
    }

    #[tokio::test]
    async fn test_ban_survives_restart_after_hydration() {
        let dir = tempfile::tempdir().expect("tempdir");

        {
            let limiter = test_limiter_at(&dir, test_limits()).await;
            limiter
                .record_manual_ban("10.3.3.3", "durable", Duration::from_secs(3600))
                .await
                .unwrap();
        }

        let limiter = test_limiter_at(&dir, test_limits()).await;
        // Fresh engine: the mirror is empty until hydration.
        assert!(limiter.is_banned("10.3.3.3").await.is_none());

        let loaded = limiter.load_bans().await.unwrap();
        assert_eq!(loaded, 1);
        assert!(limiter.is_banned("10.3.3.3").await.is_some());
        assert_eq!(limiter.inspect("10.3.3.3").await.action, Action::Ban);
    }

    #[tokio::test]
    async fn test_concurrent_same_ip() {
        let (limiter, _dir) = test_limiter().await;
        let limiter = Arc::new(limiter);

        let mut handles = Vec::new();
        for _ in 0..20 {
            let limiter = Arc::clone(&limiter);
            handles.push(tokio::spawn(async move {
                let mut actions = Vec::new();
                for _ in 0..5 {
                    actions.push(limiter.log_request(request("10.4.4.4")).await.action);
                }
                actions
            }));
        }

        let mut all = Vec::new();
        for handle in handles {
            all.extend(handle.await.expect("task panicked"));
        }

        assert_eq!(all.len(), 100);
        assert_eq!(all.iter().filter(|a| **a == Action::Flag).count(), 1);
        assert!(all.iter().filter(|a| **a == Action::Ban).count() >= 1);
    }

    #[tokio::test]
    async fn test_recent_ring_is_bounded() {
        let (limiter, _dir) = test_limiter().await;

        for i in 0..120 {
            let mut log = request("10.5.5.5");
            log.path = format!("/{i}");
            limiter.log_request(log).await;
        }

        let recent = limiter.recent_requests().await;
        assert_eq!(recent.len(), 50);
        // Oldest entries were dropped first.
        assert_eq!(recent[0].path, "/70");
        assert_eq!(recent[49].path, "/119");
    }

    #[tokio::test]
    async fn test_inspect_throttle_is_sticky() {
        let (limiter, _dir) = test_limiter().await;

        for _ in 0..7 {
            limiter.log_request(request("10.6.6.6")).await;
        }

        // No request recorded here, but the throttle window still holds
        // events, so inspect keeps reporting THROTTLE.
        let inspected = limiter.inspect("10.6.6.6").await;
        assert_eq!(inspected.action, Action::Throttle);
        assert_eq!(inspected.retry_after, Some(1));
    }

    #[tokio::test]
    async fn test_inspect_unknown_ip_allows() {
        let (limiter, _dir) = test_limiter().await;
        let decision = limiter.inspect("203.0.113.7").await;
        assert_eq!(decision.action, Action::Allow);
        assert!(decision.reason.is_none());
    }

    #[tokio::test]
    async fn test_message_counter() {
        let (limiter, _dir) = test_limiter().await;

        assert!(limiter.can_send_message("alice").await);
        assert!(limiter.can_send_message("alice").await);
        assert!(!limiter.can_send_message("alice").await);
        // Other users are unaffected.
        assert!(limiter.can_send_message("bob").await);

        tokio::time::sleep(Duration::from_millis(1200)).await;
        assert!(limiter.can_send_message("alice").await);
    }

    #[tokio::test]
    async fn test_callback_registry_dedup() {
        let (limiter, _dir) = test_limiter().await;

        limiter.register_callback("http://one.test/hook").await;
        limiter.register_callback("http://one.test/hook").await;
        limiter.register_callback("http://two.test/hook").await;
        assert_eq!(limiter.callbacks().await.len(), 2);

        limiter.unregister_callback("http://one.test/hook").await;
        assert_eq!(limiter.callbacks().await, vec!["http://two.test/hook"]);

        limiter.unregister_callback("http://never.test/hook").await;
        assert_eq!(limiter.callbacks().await.len(), 1);
    }

    #[tokio::test]
    async fn test_stats_counts() {
        let (limiter, _dir) = test_limiter().await;

        limiter.log_request(request("10.7.7.7")).await;
        limiter.log_request(request("10.7.7.8")).await;
        for _ in 0..6 {
            limiter.log_request(request("10.7.7.9")).await;
        }
        limiter
            .record_manual_ban("10.7.7.10", "abuse", Duration::ZERO)
            .await
            .unwrap();

        let stats = limiter.stats().await;
        assert_eq!(stats.active_bans, 1);
        assert_eq!(stats.flagged_ips, 1);
        assert_eq!(stats.tracked_ips, 3);
        assert_eq!(stats.recent_requests, 8);
    }

    #[tokio::test]
    async fn test_cleanup_sweeps_expired_bans() {
        let (limiter, _dir) = test_limiter().await;

        limiter
            .record_manual_ban("10.8.8.8", "short", Duration::from_secs(1))
            .await
            .unwrap();
        limiter
            .record_manual_ban("10.8.8.9", "long", Duration::from_secs(3600))
            .await
            .unwrap();

        // The store compares second-precision timestamps, so wait past
        // the expiry by more than a full second.
        tokio::time::sleep(Duration::from_millis(2200)).await;
        limiter.run_cleanup().await;

        let stats = limiter.stats().await;
        assert_eq!(stats.active_bans, 1);
        assert!(limiter.db.bans().get("10.8.8.8").await.unwrap().is_none());
        assert!(limiter.db.bans().get("10.8.8.9").await.unwrap().is_some());
    }

    #[test]
    fn test_add_duration_saturates() {
        let now = Utc::now();
        let far = add_duration(now, Duration::from_secs(u64::MAX));
        assert_eq!(far, DateTime::<Utc>::MAX_UTC);
        let hour = add_duration(now, Duration::from_secs(3600));
        assert_eq!((hour - now).num_seconds(), 3600);
    }
}
