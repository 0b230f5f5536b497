//! Time-triggered rule scheduler.
//!
//! Once a minute the scheduler formats the local wall-clock time as `HH:MM`
//! and publishes every rule whose `time` equals it. There is a single state,
//! waiting for the next tick; a matching rule is dispatched on every tick in
//! which it matches, which under a one-minute tick means once per matching
//! minute.
//!
//! ```text
//! ┌──────── tick ────────┐
//! │                      ▼
//! Waiting ◀── dispatch each rule with rule.time == now(HH:MM)
//! ```
//!
//! A failed publish is logged and the pass moves on to the next rule; no
//! error ends the loop. Only the cancellation token does.

use chrono::Local;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::dispatch::{DispatchError, Dispatcher};
use crate::rules::{Rule, RuleStore};
use crate::solar::SolarResolver;

/// Scheduler period. Rule times have minute resolution.
pub const TICK_INTERVAL: Duration = Duration::from_secs(60);

/// Source of the current local time, formatted `HH:MM`.
pub trait Clock: Send + Sync {
    fn now_hhmm(&self) -> String;
}

/// The hub's local wall clock.
pub struct LocalClock;

impl Clock for LocalClock {
    fn now_hhmm(&self) -> String {
        Local::now().format("%H:%M").to_string()
    }
}

/// What one tick did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    pub matched: usize,
    pub dispatched: usize,
    pub failed: usize,
}

pub struct Scheduler<S, D, C> {
    rules: Arc<RuleStore<S>>,
    dispatcher: D,
    clock: C,
    period: Duration,
}

impl<S, D, C> Scheduler<S, D, C>
where
    S: SolarResolver,
    D: Dispatcher,
    C: Clock,
{
    pub fn new(rules: Arc<RuleStore<S>>, dispatcher: D, clock: C) -> Self {
        Self {
            rules,
            dispatcher,
            clock,
            period: TICK_INTERVAL,
        }
    }

    /// Run until `cancel` fires. The first tick happens immediately.
    pub async fn run(self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(tick_sec = self.period.as_secs(), "scheduler started");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    self.tick().await;
                }
            }
        }

        info!("scheduler stopped");
    }

    /// Evaluate all rules against the clock's current time.
    pub async fn tick(&self) -> TickReport {
        let now = self.clock.now_hhmm();
        self.tick_at(&now).await
    }

    /// Evaluate all rules against `now` (`HH:MM`).
    pub async fn tick_at(&self, now: &str) -> TickReport {
        let rules = self.rules.list().await;
        let mut report = TickReport::default();

        for rule in rules.iter().filter(|r| r.time == now) {
            report.matched += 1;
            info!(rule = rule.id, topic = %rule.topic, at = now, "scheduler: rule due");

            match self.dispatch(rule).await {
                Ok(()) => report.dispatched += 1,
                Err(e) => {
                    report.failed += 1;
                    error!(rule = rule.id, topic = %rule.topic, "scheduler: publish failed: {e}");
                }
            }
        }

        debug!(
            at = now,
            rules = rules.len(),
            matched = report.matched,
            failed = report.failed,
            "scheduler: tick"
        );
        report
    }

    async fn dispatch(&self, rule: &Rule) -> Result<(), DispatchError> {
        self.dispatcher.publish(&rule.topic, &rule.message).await
    }
}

// ===========================================================================
// Tests
// ===========================================================================
