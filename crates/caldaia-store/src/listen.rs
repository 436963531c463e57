use caldaia_core::BoilerInfo;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::warn;

use crate::boiler::Boiler;
use crate::error::{Result, StoreError};

/// Projects one field out of the aggregate stream and yields it only when it
/// differs from the last value seen.
pub struct FieldListener<T> {
    boiler: Boiler,
    rx: broadcast::Receiver<BoilerInfo>,
    project: fn(&BoilerInfo) -> T,
    current: T,
}

impl<T: Clone + PartialEq> FieldListener<T> {
    pub(crate) fn new(boiler: Boiler, project: fn(&BoilerInfo) -> T) -> Result<Self> {
        // Subscribe before reading so no save between the two is missed.
        let rx = boiler.subscribe();
        let current = project(&boiler.info()?);
        Ok(Self {
            boiler,
            rx,
            project,
            current,
        })
    }

    /// Value as of the last yield (or of construction).
    pub fn current(&self) -> &T {
        &self.current
    }

    /// Wait for the next change of the projected field.
    ///
    /// A lagging receiver resynchronises from the stored aggregate.
    pub async fn changed(&mut self) -> Result<T> {
        loop {
            let info = match self.rx.recv().await {
                Ok(info) => info,
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "aggregate listener lagged, re-reading store");
                    self.boiler.info()?
                }
                Err(RecvError::Closed) => return Err(StoreError::Closed),
            };
            let value = (self.project)(&info);
            if value != self.current {
                self.current = value.clone();
                return Ok(value);
            }
        }
    }
}
