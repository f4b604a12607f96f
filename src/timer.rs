//! Think-phase countdown timer
//!
//! One tick per period with the seconds remaining, then exactly one
//! `ThinkExpired`. Restarting an active countdown cancels the previous
//! instance first, so no stale tick or expiry can reach the session queue.

use crate::events::SessionEvent;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;
use tracing::debug;

pub struct ThinkTimer {
    handle: Option<JoinHandle<()>>,
}

impl ThinkTimer {
    pub fn new() -> Self {
        Self { handle: None }
    }

    /// Start a countdown of `duration`, ticking every `tick`. An active
    /// countdown is cancelled first.
    pub fn start(&mut self, duration: Duration, tick: Duration, events: UnboundedSender<SessionEvent>) {
        self.cancel();

        let total = (duration.as_millis() / tick.as_millis().max(1)) as u64;
        debug!("think timer started: {} ticks of {:?}", total, tick);

        self.handle = Some(tokio::spawn(async move {
            let mut remaining = total;
            let mut interval = tokio::time::interval(tick);
            // The first interval tick completes immediately; consume it so the
            // countdown starts with a full period.
            interval.tick().await;

            let _ = events.send(SessionEvent::ThinkTick {
                remaining_secs: remaining,
            });

            while remaining > 0 {
                interval.tick().await;
                remaining -= 1;
                if remaining > 0 {
                    let _ = events.send(SessionEvent::ThinkTick {
                        remaining_secs: remaining,
                    });
                }
            }

            let _ = events.send(SessionEvent::ThinkExpired);
        }));
    }

    /// Cancel the countdown if one is active. No-op otherwise.
    pub fn cancel(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }

    pub fn is_running(&self) -> bool {
        self.handle
            .as_ref()
            .map(|h| !h.is_finished())
            .unwrap_or(false)
    }
}

impl Default for ThinkTimer {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ThinkTimer {
    fn drop(&mut self) {
        self.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    async fn drain_until_closed(mut rx: mpsc::UnboundedReceiver<SessionEvent>) -> Vec<SessionEvent> {
        let mut out = Vec::new();
        while let Some(ev) = rx.recv().await {
            let expired = matches!(ev, SessionEvent::ThinkExpired);
            out.push(ev);
            if expired {
                break;
            }
        }
        out
    }

    #[tokio::test]
    async fn counts_down_and_expires_once() {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut timer = ThinkTimer::new();
        timer.start(Duration::from_millis(30), Duration::from_millis(10), tx);

        let events = drain_until_closed(rx).await;
        let ticks: Vec<u64> = events
            .iter()
            .filter_map(|e| match e {
                SessionEvent::ThinkTick { remaining_secs } => Some(*remaining_secs),
                _ => None,
            })
            .collect();
        assert_eq!(ticks, vec![3, 2, 1]);

        let expired = events
            .iter()
            .filter(|e| matches!(e, SessionEvent::ThinkExpired))
            .count();
        assert_eq!(expired, 1);
    }

    #[tokio::test]
    async fn cancel_and_restart_yields_exactly_one_expiry() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut timer = ThinkTimer::new();

        timer.start(Duration::from_millis(50), Duration::from_millis(10), tx.clone());
        tokio::time::sleep(Duration::from_millis(15)).await;
        // Restart mid-countdown; the first instance must never expire.
        timer.start(Duration::from_millis(30), Duration::from_millis(10), tx.clone());
        drop(tx);

        let mut expired = 0;
        while let Some(ev) = rx.recv().await {
            if matches!(ev, SessionEvent::ThinkExpired) {
                expired += 1;
            }
        }
        assert_eq!(expired, 1);
    }

    #[tokio::test]
    async fn cancel_is_idempotent() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut timer = ThinkTimer::new();
        timer.start(Duration::from_millis(20), Duration::from_millis(10), tx.clone());
        timer.cancel();
        timer.cancel();
        assert!(!timer.is_running());
        drop(tx);

        tokio::time::sleep(Duration::from_millis(40)).await;
        let mut expired = 0;
        while let Ok(ev) = rx.try_recv() {
            if matches!(ev, SessionEvent::ThinkExpired) {
                expired += 1;
            }
        }
        assert_eq!(expired, 0);
    }
}
