use std::sync::Arc;

use caldaia_core::{BoilerInfo, State};
use caldaia_store::{Boiler, TemperatureSource};
use chrono::{DateTime, Duration, Local, TimeZone, Utc};
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{ControlError, Result};

/// Heating law: some rule is in its window past its delay with the reference
/// temperature below its target, and overheating protection is off.
pub fn should_heat<Tz: TimeZone>(info: &BoilerInfo, reference: f64, now: &DateTime<Tz>) -> bool {
    if info.is_overheating_protection_active {
        return false;
    }
    info.rules.iter().any(|rule| {
        rule.should_be_active(now) && !rule.is_being_delayed(now) && reference < rule.target_temp
    })
}

/// The single authority flipping the boiler between `ON` and `OFF`.
pub struct SwitchController {
    boiler: Boiler,
    sensor: Arc<dyn TemperatureSource>,
    average_window: Duration,
}

impl SwitchController {
    pub fn new(boiler: Boiler, sensor: Arc<dyn TemperatureSource>, average_window: Duration) -> Self {
        Self {
            boiler,
            sensor,
            average_window,
        }
    }

    /// Re-decide on every rule change, protection flip and temperature sample.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        let mut rules = self.boiler.listen_rules()?;
        let mut protection = self.boiler.listen_protection()?;
        let mut temperatures = self.sensor.subscribe();
        info!(boiler = %self.boiler.name(), "switch controller started");

        self.decide(None, Local::now()).await?;

        loop {
            let trigger = tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("switch controller shutting down");
                    return Ok(());
                }
                changed = rules.changed() => {
                    changed?;
                    None
                }
                changed = protection.changed() => {
                    let active = changed?;
                    debug!(active, "protection flag changed");
                    None
                }
                measure = temperatures.recv() => match measure {
                    Ok(measure) => Some(measure.value),
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "temperature stream lagged");
                        None
                    }
                    Err(RecvError::Closed) => return Err(ControlError::StreamClosed("temperature")),
                },
            };
            self.decide(trigger, Local::now()).await?;
        }
    }

    /// One decision cycle. `trigger` is the sample that caused it, if any.
    /// Rule windows are read in `now`'s zone.
    pub async fn decide<Tz: TimeZone>(
        &self,
        trigger: Option<f64>,
        now: DateTime<Tz>,
    ) -> Result<State> {
        let info = self.boiler.info()?;
        let now_utc = now.with_timezone(&Utc);
        let average = self.sensor.average(now_utc - self.average_window, now_utc).await?;
        // No data: assume warm enough and stay off.
        let reference = average.or(trigger).unwrap_or(info.max_temp);

        let target = if should_heat(&info, reference, &now) {
            State::On
        } else {
            State::Off
        };
        debug!(reference, ?average, state = %target, "switch decision");
        Ok(self.boiler.switch(target)?)
    }
}
