//! Per-agent runtime state.
//!
//! # Responsibilities
//! - Track the reachability/push state of a single agent
//! - Count consecutive missed heartbeats
//! - Serialize format pushes to the same agent
//!
//! # Design Decisions
//! - State is an atomic so `status()` never waits on a push or a probe
//! - `Disabled` is sticky: only an explicit re-enable leaves it
//! - A push is tracked by an RAII guard; a guard dropped without an outcome
//!   (cancelled task, deadline) leaves the agent in `PushFailed`

use std::ops::Deref;
use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;
use tokio::sync::{Mutex as AsyncMutex, MutexGuard};

/// Agent state.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentState {
    Unknown = 0,
    Reachable = 1,
    PushInProgress = 2,
    PushFailed = 3,
    Unreachable = 4,
    Disabled = 5,
}

impl From<u8> for AgentState {
    fn from(val: u8) -> Self {
        match val {
            1 => AgentState::Reachable,
            2 => AgentState::PushInProgress,
            3 => AgentState::PushFailed,
            4 => AgentState::Unreachable,
            5 => AgentState::Disabled,
            _ => AgentState::Unknown,
        }
    }
}

/// Point-in-time view of an agent, as returned by `status()`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AgentStatus {
    pub agent_id: String,
    pub state: AgentState,
    pub consecutive_misses: u32,
    /// Unix seconds of the last successful probe or push.
    pub last_seen: Option<u64>,
    pub version: Option<String>,
    pub last_error: Option<String>,
}

#[derive(Debug, Default)]
struct Details {
    last_seen: Option<u64>,
    version: Option<String>,
    last_error: Option<String>,
}

/// Runtime handle of one agent.
#[derive(Debug)]
pub struct AgentHandle {
    pub id: String,
    state: AtomicU8,
    consecutive_misses: AtomicU32,
    details: Mutex<Details>,
    push_lock: AsyncMutex<()>,
}

impl AgentHandle {
    pub fn new(id: impl Into<String>, disabled: bool) -> Self {
        let initial = if disabled {
            AgentState::Disabled
        } else {
            AgentState::Unknown
        };
        Self {
            id: id.into(),
            state: AtomicU8::new(initial as u8),
            consecutive_misses: AtomicU32::new(0),
            details: Mutex::new(Details::default()),
            push_lock: AsyncMutex::new(()),
        }
    }

    pub fn state(&self) -> AgentState {
        AgentState::from(self.state.load(Ordering::Acquire))
    }

    pub fn is_disabled(&self) -> bool {
        self.state() == AgentState::Disabled
    }

    /// Non-blocking snapshot.
    pub fn status(&self) -> AgentStatus {
        let details = self.details.lock().unwrap_or_else(|e| e.into_inner());
        AgentStatus {
            agent_id: self.id.clone(),
            state: self.state(),
            consecutive_misses: self.consecutive_misses.load(Ordering::Relaxed),
            last_seen: details.last_seen,
            version: details.version.clone(),
            last_error: details.last_error.clone(),
        }
    }

    // --- Heartbeat ---

    /// Record a successful probe.
    ///
    /// `Unknown` and `Unreachable` become `Reachable`; a failed push stays
    /// visible until the next push succeeds.
    pub fn mark_alive(&self, version: Option<String>) {
        self.consecutive_misses.store(0, Ordering::Relaxed);
        {
            let mut details = self.details.lock().unwrap_or_else(|e| e.into_inner());
            details.last_seen = Some(unix_now());
            if version.is_some() {
                details.version = version;
            }
        }
        self.transition(|s| matches!(s, AgentState::Unknown | AgentState::Unreachable), AgentState::Reachable);
    }

    /// Record a missed heartbeat. Returns true if this miss made the agent
    /// `Unreachable`.
    pub fn mark_missed(&self, threshold: u32, error: &str) -> bool {
        let misses = self.consecutive_misses.fetch_add(1, Ordering::Relaxed) + 1;
        self.set_error(error);
        if misses < threshold {
            return false;
        }
        self.transition(
            |s| !matches!(s, AgentState::Disabled | AgentState::PushInProgress | AgentState::Unreachable),
            AgentState::Unreachable,
        )
    }

    // --- Lifecycle ---

    pub fn disable(&self) {
        self.state.store(AgentState::Disabled as u8, Ordering::Release);
    }

    /// Leave `Disabled`; the next probe decides reachability.
    pub fn enable(&self) {
        self.transition(|s| s == AgentState::Disabled, AgentState::Unknown);
    }

    /// Record a successful command round trip.
    pub fn mark_contact(&self) {
        self.consecutive_misses.store(0, Ordering::Relaxed);
        self.details.lock().unwrap_or_else(|e| e.into_inner()).last_seen = Some(unix_now());
        self.transition(|s| matches!(s, AgentState::Unknown | AgentState::Unreachable), AgentState::Reachable);
    }

    pub fn set_error(&self, error: &str) {
        self.details.lock().unwrap_or_else(|e| e.into_inner()).last_error = Some(error.to_string());
    }

    // --- Push ---

    /// Wait for exclusive push access and mark the push as started.
    ///
    /// Returns `None` if the agent is disabled.
    pub async fn begin_push(&self) -> Option<PushGuard<'_>> {
        let lock = self.push_lock.lock().await;
        let previous = self.state();
        let started = self.transition(|s| s != AgentState::Disabled, AgentState::PushInProgress);
        if !started {
            return None;
        }
        Some(PushGuard {
            handle: self,
            _lock: lock,
            previous,
            finished: false,
        })
    }

    /// True while a push holds the lock.
    pub fn push_active(&self) -> bool {
        self.push_lock.try_lock().is_err()
    }

    /// Compare-and-set loop; returns true if the state changed.
    fn transition(&self, allowed: impl Fn(AgentState) -> bool, next: AgentState) -> bool {
        let mut current = self.state.load(Ordering::Acquire);
        loop {
            if !allowed(AgentState::from(current)) {
                return false;
            }
            match self.state.compare_exchange_weak(current, next as u8, Ordering::AcqRel, Ordering::Acquire) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }
}

/// Exclusive push access to one agent.
#[derive(Debug)]
pub struct PushGuard<'a> {
    handle: &'a AgentHandle,
    _lock: MutexGuard<'a, ()>,
    /// State before the push started.
    previous: AgentState,
    finished: bool,
}

impl PushGuard<'_> {
    /// Every format was transferred or skipped.
    ///
    /// Only an acknowledged transfer counts as contact; a push that skipped
    /// everything never reached the agent and restores the prior state.
    pub fn succeed(mut self, transferred: bool) {
        self.finished = true;
        if transferred {
            self.handle.mark_contact();
            self.handle
                .transition(|s| s == AgentState::PushInProgress, AgentState::Reachable);
        } else {
            self.handle
                .transition(|s| s == AgentState::PushInProgress, self.previous);
        }
    }

    /// The push stopped on an error.
    pub fn fail(mut self, error: &str) {
        self.finished = true;
        self.handle.set_error(error);
        self.handle
            .transition(|s| s == AgentState::PushInProgress, AgentState::PushFailed);
    }
}

impl Deref for PushGuard<'_> {
    type Target = AgentHandle;
    fn deref(&self) -> &Self::Target {
        self.handle
    }
}

impl Drop for PushGuard<'_> {
    fn drop(&mut self) {
        if !self.finished {
            self.handle.set_error("push interrupted");
            self.handle
                .transition(|s| s == AgentState::PushInProgress, AgentState::PushFailed);
        }
    }
}

pub(crate) fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_misses_reach_threshold() {
        let handle = AgentHandle::new("a", false);
        handle.mark_alive(Some("1.2.0".into()));
        assert_eq!(handle.state(), AgentState::Reachable);

        assert!(!handle.mark_missed(3, "timeout"));
        assert!(!handle.mark_missed(3, "timeout"));
        assert_eq!(handle.state(), AgentState::Reachable);
        assert!(handle.mark_missed(3, "timeout"));
        assert_eq!(handle.state(), AgentState::Unreachable);
        assert!(!handle.mark_missed(3, "timeout"));

        handle.mark_alive(None);
        let status = handle.status();
        assert_eq!(status.state, AgentState::Reachable);
        assert_eq!(status.consecutive_misses, 0);
        assert_eq!(status.version.as_deref(), Some("1.2.0"));
    }

    #[test]
    fn test_disabled_is_sticky() {
        let handle = AgentHandle::new("a", true);
        handle.mark_alive(None);
        for _ in 0..5 {
            handle.mark_missed(1, "down");
        }
        assert_eq!(handle.state(), AgentState::Disabled);
        handle.enable();
        assert_eq!(handle.state(), AgentState::Unknown);
    }

    #[tokio::test]
    async fn test_push_guard_outcomes() {
        let handle = Arc::new(AgentHandle::new("a", false));

        let guard = handle.begin_push().await.unwrap();
        assert_eq!(handle.state(), AgentState::PushInProgress);
        assert!(handle.push_active());
        guard.fail("refused");
        assert_eq!(handle.state(), AgentState::PushFailed);
        assert_eq!(handle.status().last_error.as_deref(), Some("refused"));

        let guard = handle.begin_push().await.unwrap();
        guard.succeed(true);
        assert_eq!(handle.state(), AgentState::Reachable);

        {
            let _guard = handle.begin_push().await.unwrap();
        }
        assert_eq!(handle.state(), AgentState::PushFailed);
        assert!(!handle.push_active());

        handle.disable();
        assert!(handle.begin_push().await.is_none());
    }

    #[tokio::test]
    async fn test_skip_only_push_keeps_heartbeat_state() {
        let handle = AgentHandle::new("a", false);
        handle.mark_alive(None);
        for _ in 0..3 {
            handle.mark_missed(3, "timeout");
        }
        assert_eq!(handle.state(), AgentState::Unreachable);
        let seen = handle.status().last_seen;

        handle.begin_push().await.unwrap().succeed(false);
        let status = handle.status();
        assert_eq!(status.state, AgentState::Unreachable);
        assert_eq!(status.consecutive_misses, 3);
        assert_eq!(status.last_seen, seen);

        handle.begin_push().await.unwrap().succeed(true);
        assert_eq!(handle.state(), AgentState::Reachable);
        assert_eq!(handle.status().consecutive_misses, 0);
    }
}
