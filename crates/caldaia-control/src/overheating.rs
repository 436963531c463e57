//! Overheating protection.
//!
//! The index is the step response of a first-order low-pass filter driven by
//! the on/off switch signal: roughly the fraction of the last few `TAU_SECS`
//! the boiler spent on. Between two samples the signal is constant, so the
//! filter output has a closed form and a handful of samples is enough to get
//! the exact value without resampling.

use std::time::Duration;

use caldaia_core::SwitchSample;
use caldaia_store::Boiler;
use chrono::{DateTime, Utc};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::Result;

/// Filter time constant, seconds.
pub const TAU_SECS: f64 = 720.0;
/// Lookback used when reading the switch history.
pub const HISTORY_SECS: f64 = 10.0 * TAU_SECS;
pub const ON_THRESHOLD: f64 = 0.9;
pub const OFF_THRESHOLD: f64 = 0.2;

/// Filter output at `end` for a time-ordered switch history.
///
/// The output starts at 0 before the first sample; `Unknown` counts as off.
pub fn overheating_index(samples: &[SwitchSample], end: DateTime<Utc>) -> f64 {
    let mut y = 0.0;
    for (i, sample) in samples.iter().enumerate() {
        let until = samples.get(i + 1).map_or(end, |next| next.time);
        let dt = (until - sample.time).num_milliseconds().max(0) as f64 / 1000.0;
        let target = if sample.state.is_on() { 1.0 } else { 0.0 };
        y = target + (y - target) * (-dt / TAU_SECS).exp();
    }
    y
}

/// Index over the lookback window ending at `now`.
///
/// The window is seeded with the state in force at its start: the last
/// earlier sample if there is one, otherwise the boiler's current state.
pub fn current_overheating_index(boiler: &Boiler, now: DateTime<Utc>) -> Result<f64> {
    let start = now - chrono::Duration::milliseconds((HISTORY_SECS * 1000.0) as i64);
    let mut samples = boiler.switch_history(start, now)?;

    let starts_late = samples.first().map_or(true, |s| s.time > start);
    if starts_late {
        let seed = match boiler.last_switch_sample_at(start)? {
            Some(prev) => Some(prev.state),
            None if samples.is_empty() => Some(boiler.info()?.state),
            None => None,
        };
        if let Some(state) = seed {
            samples.insert(0, SwitchSample { time: start, state });
        }
    }

    Ok(overheating_index(&samples, now))
}

/// New protection flag for `index`, or `None` when nothing should change.
pub fn protection_decision(index: f64, active: bool) -> Option<bool> {
    if index > ON_THRESHOLD && !active {
        Some(true)
    } else if index < OFF_THRESHOLD && active {
        Some(false)
    } else {
        None
    }
}

/// Periodically recomputes the index and toggles the protection flag.
pub struct OverheatingController {
    boiler: Boiler,
    tick: Duration,
}

impl OverheatingController {
    pub fn new(boiler: Boiler, tick: Duration) -> Self {
        Self { boiler, tick }
    }

    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        info!(tick_secs = self.tick.as_secs_f64(), "overheating controller started");
        let mut interval = tokio::time::interval(self.tick);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("overheating controller shutting down");
                    return Ok(());
                }
                _ = interval.tick() => {
                    self.evaluate(Utc::now())?;
                }
            }
        }
    }

    /// One control step; returns the new flag when it was toggled.
    pub fn evaluate(&self, now: DateTime<Utc>) -> Result<Option<bool>> {
        let index = current_overheating_index(&self.boiler, now)?;
        let active = self.boiler.info()?.is_overheating_protection_active;
        debug!(index, active, "overheating index computed");

        let Some(next) = protection_decision(index, active) else {
            return Ok(None);
        };
        self.boiler.set_overheating_protection(next)?;
        info!(index, active = next, "overheating protection toggled");
        Ok(Some(next))
    }
}
