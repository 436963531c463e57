//! Rule timing orchestrator.
//!
//! Keeps every rule's persisted `is_active` flag in line with its window and
//! fires start/stop mutations at the right instant. Each change of the rule
//! list starts a new round: the previous round's generation token is
//! cancelled, which drops all of its pending timers at once, then every rule
//! is classified again against the fresh list.

use caldaia_core::Rule;
use caldaia_store::Boiler;
use chrono::{DateTime, Duration, Local, TimeZone, Utc};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::error::Result;

/// What a rule needs next, relative to the instant it was planned at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Window open but not marked active.
    StartNow,
    /// Stopped explicitly, or its window elapsed while still marked active.
    StopNow,
    /// Running: stop when the window closes.
    StopAfter(Duration),
    /// Start when the next window opens.
    StartAfter(Duration),
    /// Stopped inside its current window: look again once the window closes.
    RecheckAfter(Duration),
    Idle,
}

/// Classify `rule` at `now`. Pure.
pub fn plan<Tz: TimeZone>(rule: &Rule, now: &DateTime<Tz>) -> Transition {
    let now_utc = now.with_timezone(&Utc);
    let should_be_active = rule.should_be_active(now);
    let should_be_stopped = rule.should_be_stopped(now);

    if should_be_active && !rule.is_active {
        return Transition::StartNow;
    }
    if should_be_stopped && rule.is_active {
        return Transition::StopNow;
    }
    if should_be_active {
        return Transition::StopAfter(rule.window_end_time(now) - now_utc);
    }
    if rule.is_active {
        return Transition::StopNow;
    }
    if rule.will_start_in_future(now) {
        return Transition::StartAfter(rule.window_start_time(now) - now_utc);
    }
    if should_be_stopped && rule.is_repeating() {
        return Transition::RecheckAfter(rule.window_end_time(now) - now_utc);
    }
    Transition::Idle
}

#[derive(Debug, Clone, Copy)]
enum Action {
    Start,
    Stop,
}

/// Transitions decided by the latest round, by rule id.
pub type Planned = Vec<(String, Transition)>;

/// Long-running reconciler for one boiler's rules.
///
/// Windows are planned in the process's local zone.
pub struct RuleTimingController {
    boiler: Boiler,
    planned: watch::Sender<Planned>,
}

impl RuleTimingController {
    pub fn new(boiler: Boiler) -> Self {
        let (planned, _) = watch::channel(Vec::new());
        Self { boiler, planned }
    }

    /// Follow the outcome of every round.
    pub fn planned(&self) -> watch::Receiver<Planned> {
        self.planned.subscribe()
    }

    /// Reconcile now and after every rule change until `shutdown` fires.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        let mut listener = self.boiler.listen_rules()?;
        info!(boiler = %self.boiler.name(), "rule timing controller started");

        loop {
            let generation = shutdown.child_token();
            let recheck = self.reconcile(listener.current(), &generation, &Local::now());

            let wake = async {
                match recheck {
                    Some(deadline) => sleep_until(deadline, &generation).await,
                    None => std::future::pending::<bool>().await,
                }
            };

            let outcome = tokio::select! {
                _ = shutdown.cancelled() => None,
                changed = listener.changed() => Some(changed.map(|_| ())),
                _ = wake => {
                    debug!("stopped window elapsed, reconciling");
                    Some(Ok(()))
                }
            };
            generation.cancel();

            match outcome {
                None => {
                    info!("rule timing controller shutting down");
                    return Ok(());
                }
                Some(result) => result?,
            }
        }
    }

    /// One round: apply immediate transitions and spawn this generation's
    /// timers. Returns the earliest instant at which the round must be
    /// recomputed without a rule change.
    fn reconcile<Tz: TimeZone>(
        &self,
        rules: &[Rule],
        generation: &CancellationToken,
        now: &DateTime<Tz>,
    ) -> Option<DateTime<Utc>> {
        let now_utc = now.with_timezone(&Utc);
        let mut recheck: Option<DateTime<Utc>> = None;
        let mut planned = Vec::with_capacity(rules.len());

        for rule in rules {
            let transition = plan(rule, now);
            debug!(rule_id = %rule.id, ?transition, "rule planned");

            match transition {
                Transition::StartNow => apply(&self.boiler, &rule.id, Action::Start),
                Transition::StopNow => apply(&self.boiler, &rule.id, Action::Stop),
                Transition::StopAfter(d) => {
                    self.spawn_timer(generation, rule.id.clone(), now_utc + d, Action::Stop)
                }
                Transition::StartAfter(d) => {
                    self.spawn_timer(generation, rule.id.clone(), now_utc + d, Action::Start)
                }
                Transition::RecheckAfter(d) => {
                    let at = now_utc + d;
                    recheck = Some(recheck.map_or(at, |r| r.min(at)));
                }
                Transition::Idle => {}
            }
            planned.push((rule.id.clone(), transition));
        }
        self.planned.send_replace(planned);
        recheck
    }

    fn spawn_timer(
        &self,
        generation: &CancellationToken,
        rule_id: String,
        deadline: DateTime<Utc>,
        action: Action,
    ) {
        let token = generation.clone();
        let boiler = self.boiler.clone();
        tokio::spawn(async move {
            if !sleep_until(deadline, &token).await {
                debug!(rule_id = %rule_id, ?action, "timer cancelled");
                return;
            }
            debug!(rule_id = %rule_id, ?action, "timer fired");
            apply(&boiler, &rule_id, action);
        });
    }
}

fn apply(boiler: &Boiler, rule_id: &str, action: Action) {
    let result = match action {
        Action::Start => boiler.start_rule(rule_id),
        Action::Stop => boiler.stop_rule(rule_id),
    };
    // Left out of sync until the next round.
    if let Err(e) = result {
        error!(rule_id = %rule_id, ?action, error = %e, "rule transition failed");
    }
}

/// Sleep until the wall clock reaches `deadline`. Returns `false` when
/// `cancel` fires first.
async fn sleep_until(deadline: DateTime<Utc>, cancel: &CancellationToken) -> bool {
    loop {
        let Ok(remaining) = (deadline - Utc::now()).to_std() else {
            return !cancel.is_cancelled();
        };
        if remaining.is_zero() {
            return !cancel.is_cancelled();
        }
        tokio::select! {
            _ = cancel.cancelled() => return false,
            _ = tokio::time::sleep(remaining) => {}
        }
    }
}
