// Nimbus - Environmental sensor metrics publisher for Cloud Monitoring
//
// Copyright 2022 Nick Pillitteri
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.
//

use crate::sensor::{Bme680Sensor, SensorError, SensorErrorKind, SensorSample};
use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use tokio::task;
use tracing::{Instrument, Level};

/// Source of sensor samples for the publish loop.
#[async_trait]
pub trait SampleSource: Send + Sync {
    /// Read one sample, or `None` if the sensor had no new data. Errors indicate
    /// the sensor could not be read at all.
    async fn read_sample(&self) -> Result<Option<SensorSample>, SensorError>;
}

/// Reads samples from a BME680 sensor without blocking the async runtime.
#[derive(Debug)]
pub struct SampleCollector {
    sensor: Arc<Mutex<Bme680Sensor>>,
}

impl SampleCollector {
    pub fn new(sensor: Bme680Sensor) -> Self {
        Self {
            sensor: Arc::new(Mutex::new(sensor)),
        }
    }
}

#[async_trait]
impl SampleSource for SampleCollector {
    async fn read_sample(&self) -> Result<Option<SensorSample>, SensorError> {
        let sensor = self.sensor.clone();

        // Reading the sensor sleeps while the measurement completes (~170ms) so it's
        // done on a thread where blocking is allowed.
        task::spawn_blocking(move || {
            let mut s = sensor.lock().unwrap_or_else(|e| e.into_inner());
            s.read_sample()
        })
        .instrument(tracing::span!(Level::DEBUG, "sensor_read"))
        .await
        .map_err(|e| SensorError::KindMsgCause(SensorErrorKind::Io, "sensor read task failed", Box::new(e)))?
    }
}
