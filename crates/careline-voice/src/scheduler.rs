//! **FollowUpScheduler** — one cancellable, delayed "anything else?" prompt.
//!
//! A single armed slot. Arming replaces whatever was armed; the timer task checks and
//! clears the slot under the same lock `cancel` takes, so a cancelled timer never runs
//! its callback.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct FollowUpToken(u64);

impl fmt::Display for FollowUpToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "follow-up#{}", self.0)
    }
}

/// The armed follow-up, if any.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScheduledFollowUp {
    pub armed_at: DateTime<Utc>,
    pub fire_at: DateTime<Utc>,
    pub token: FollowUpToken,
}

struct Armed {
    info: ScheduledFollowUp,
    timer: JoinHandle<()>,
}

#[derive(Default)]
pub struct FollowUpScheduler {
    slot: Arc<Mutex<Option<Armed>>>,
    next_token: AtomicU64,
}

impl FollowUpScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm (or re-arm) the follow-up. `on_fire` runs at most once, on the runtime.
    pub fn arm<F>(&self, after: Duration, on_fire: F) -> FollowUpToken
    where
        F: FnOnce() + Send + 'static,
    {
        let token = FollowUpToken(self.next_token.fetch_add(1, Ordering::SeqCst) + 1);
        let armed_at = Utc::now();
        let fire_at = armed_at + chrono::Duration::from_std(after).unwrap_or_else(|_| chrono::Duration::zero());

        let Ok(mut slot) = self.slot.lock() else {
            return token;
        };
        if let Some(previous) = slot.take() {
            previous.timer.abort();
            debug!(token = %previous.info.token, "Follow-up replaced");
        }

        let shared = Arc::clone(&self.slot);
        let timer = tokio::spawn(async move {
            tokio::time::sleep(after).await;
            let fire = match shared.lock() {
                Ok(mut slot) if slot.as_ref().map(|a| a.info.token) == Some(token) => {
                    slot.take();
                    true
                }
                _ => false,
            };
            if fire {
                info!(%token, "⏰ Follow-up fired");
                on_fire();
            }
        });

        *slot = Some(Armed {
            info: ScheduledFollowUp {
                armed_at,
                fire_at,
                token,
            },
            timer,
        });
        debug!(%token, delay_ms = after.as_millis() as u64, "Follow-up armed");
        token
    }

    /// Cancel `token` if it is still the armed one. Returns true if something was cancelled.
    pub fn cancel(&self, token: FollowUpToken) -> bool {
        let Ok(mut slot) = self.slot.lock() else {
            return false;
        };
        if slot.as_ref().map(|a| a.info.token) != Some(token) {
            return false;
        }
        if let Some(armed) = slot.take() {
            armed.timer.abort();
            debug!(%token, "Follow-up cancelled");
        }
        true
    }

    /// Cancel whatever is armed.
    pub fn cancel_current(&self) -> bool {
        let Ok(mut slot) = self.slot.lock() else {
            return false;
        };
        match slot.take() {
            Some(armed) => {
                armed.timer.abort();
                debug!(token = %armed.info.token, "Follow-up cancelled");
                true
            }
            None => false,
        }
    }

    pub fn current(&self) -> Option<ScheduledFollowUp> {
        self.slot
            .lock()
            .ok()
            .and_then(|slot| slot.as_ref().map(|a| a.info.clone()))
    }

    pub fn is_armed(&self) -> bool {
        self.current().is_some()
    }
}

impl Drop for FollowUpScheduler {
    fn drop(&mut self) {
        self.cancel_current();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn counter() -> (Arc<AtomicUsize>, impl FnOnce() + Send + 'static) {
        let fired = Arc::new(AtomicUsize::new(0));
        let f = Arc::clone(&fired);
        (fired, move || {
            f.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[tokio::test(start_paused = true)]
    async fn fires_once_after_delay() {
        let scheduler = FollowUpScheduler::new();
        let (fired, cb) = counter();
        let token = scheduler.arm(Duration::from_secs(8), cb);
        assert_eq!(scheduler.current().map(|s| s.token), Some(token));

        tokio::time::sleep(Duration::from_secs(7)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(scheduler.current().is_none());
        assert!(!scheduler.cancel(token));
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_timer_never_fires() {
        let scheduler = FollowUpScheduler::new();
        let (fired, cb) = counter();
        let token = scheduler.arm(Duration::from_secs(8), cb);

        tokio::time::sleep(Duration::from_secs(7)).await;
        assert!(scheduler.cancel(token));
        assert!(!scheduler.cancel(token));
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert!(!scheduler.is_armed());
    }

    #[tokio::test(start_paused = true)]
    async fn last_arm_wins() {
        let scheduler = FollowUpScheduler::new();
        let (first, cb1) = counter();
        let (second, cb2) = counter();
        let old = scheduler.arm(Duration::from_secs(1), cb1);
        let new = scheduler.arm(Duration::from_secs(2), cb2);
        assert!(!scheduler.cancel(old));
        assert_eq!(scheduler.current().map(|s| s.token), Some(new));

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(first.load(Ordering::SeqCst), 0);
        assert_eq!(second.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_current_clears_slot() {
        let scheduler = FollowUpScheduler::new();
        let (fired, cb) = counter();
        scheduler.arm(Duration::from_millis(500), cb);
        assert!(scheduler.cancel_current());
        assert!(!scheduler.cancel_current());
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }
}
