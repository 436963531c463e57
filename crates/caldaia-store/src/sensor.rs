use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use caldaia_core::Measure;
use chrono::{DateTime, Utc};
use rusqlite::Connection;
use tokio::sync::broadcast;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::db::init_db;
use crate::error::{Result, StoreError};
use crate::series;

const CHANNEL_CAPACITY: usize = 256;

/// Temperature readings as seen by the switch controller.
#[async_trait]
pub trait TemperatureSource: Send + Sync {
    /// Mean temperature over `[from, to]`, `None` without samples.
    async fn average(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> Result<Option<f64>>;

    /// Live stream of incoming readings.
    fn subscribe(&self) -> broadcast::Receiver<Measure>;
}

/// One sensor's persisted readings plus their live fan-out.
#[derive(Clone)]
pub struct SensorHistory {
    series: String,
    db: Arc<Mutex<Connection>>,
    tx: broadcast::Sender<Measure>,
}

impl SensorHistory {
    /// `key` identifies the sensor, e.g. `temperatura:centrale`.
    pub fn open(conn: Connection, key: &str) -> Result<Self> {
        init_db(&conn)?;
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Ok(Self {
            series: format!("temperature:{key}"),
            db: Arc::new(Mutex::new(conn)),
            tx,
        })
    }

    /// Persist a reading and push it to live subscribers.
    pub fn add(&self, measure: Measure) -> Result<()> {
        {
            let db = self.lock()?;
            series::append(&db, &self.series, measure.timestamp, measure.value)?;
        }
        debug!(series = %self.series, value = measure.value, "temperature sample added");
        let _ = self.tx.send(measure);
        Ok(())
    }

    pub fn history(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> Result<Vec<Measure>> {
        let db = self.lock()?;
        let rows = series::range(&db, &self.series, from, to)?;
        Ok(rows
            .into_iter()
            .map(|(timestamp, value)| Measure { value, timestamp })
            .collect())
    }

    /// Republish readings that other processes write to the series.
    ///
    /// Polls every `every` for samples newer than the last one seen and sends
    /// them to live subscribers, oldest first, until `shutdown` fires.
    pub async fn follow(&self, every: Duration, shutdown: CancellationToken) -> Result<()> {
        let mut cursor = {
            let db = self.lock()?;
            let now = Utc::now();
            series::last_at_or_before(&db, &self.series, now)?.map_or(now, |(t, _)| t)
        };
        info!(series = %self.series, poll_ms = every.as_millis() as u64, "following sensor series");

        let mut interval = tokio::time::interval(every);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return Ok(()),
                _ = interval.tick() => {}
            }
            let fresh = self.history(cursor + chrono::Duration::milliseconds(1), Utc::now())?;
            for measure in fresh {
                cursor = measure.timestamp;
                debug!(series = %self.series, value = measure.value, "sensor reading picked up");
                let _ = self.tx.send(measure);
            }
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.db.lock().map_err(|_| StoreError::Poisoned)
    }
}

#[async_trait]
impl TemperatureSource for SensorHistory {
    async fn average(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> Result<Option<f64>> {
        let db = self.lock()?;
        series::average(&db, &self.series, from, to)
    }

    fn subscribe(&self) -> broadcast::Receiver<Measure> {
        self.tx.subscribe()
    }
}
