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

use crate::rainfall::Rainfall;
use prometheus::{Counter, CounterVec, Encoder, Gauge, Opts, Registry, TextEncoder};
use std::error::Error;
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// Prometheus metrics about the agent itself, to help diagnose failures reading
/// the sensor or publishing to Cloud Monitoring. Sensor values are not included.
#[derive(Clone)]
pub struct AgentMetrics {
    cycles: Counter,
    publishes: Counter,
    skipped: Counter,
    errors: CounterVec,
    last_publish: Gauge,
    rainfall: Gauge,
}

impl AgentMetrics {
    pub fn new(reg: &Registry) -> Result<Self, prometheus::Error> {
        let cycles = Counter::new("nimbus_cycles_total", "Number of publish cycles started")?;
        let publishes = Counter::new("nimbus_publishes_total", "Number of batches published")?;
        let skipped = Counter::new(
            "nimbus_skipped_total",
            "Number of cycles skipped because the sensor had no new data",
        )?;
        let errors = CounterVec::new(
            Opts::new("nimbus_errors_total", "Number of errors by component"),
            &["kind"],
        )?;
        let last_publish = Gauge::new("nimbus_last_publish_timestamp", "Timestamp of last successful publish")?;
        let rainfall = Gauge::new("nimbus_rainfall", "Most recent rainfall observation, -1 when unknown")?;

        reg.register(Box::new(cycles.clone()))?;
        reg.register(Box::new(publishes.clone()))?;
        reg.register(Box::new(skipped.clone()))?;
        reg.register(Box::new(errors.clone()))?;
        reg.register(Box::new(last_publish.clone()))?;
        reg.register(Box::new(rainfall.clone()))?;

        Ok(Self {
            cycles,
            publishes,
            skipped,
            errors,
            last_publish,
            rainfall,
        })
    }

    pub fn cycle(&self) {
        self.cycles.inc();
    }

    pub fn skipped(&self) {
        self.skipped.inc();
    }

    pub fn rainfall(&self, rainfall: Rainfall) {
        self.rainfall.set(i64::from(rainfall) as f64);
    }

    pub fn error(&self, kind: &str) {
        self.errors.with_label_values(&[kind]).inc();
    }

    pub fn published(&self) {
        self.publishes.inc();

        // If we can't get the number of seconds since the epoch, skip the update
        if let Ok(d) = SystemTime::now().duration_since(UNIX_EPOCH) {
            self.last_publish.set(d.as_secs_f64());
        }
    }
}

impl fmt::Debug for AgentMetrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AgentMetrics")
            .field("cycles", &self.cycles.get())
            .field("publishes", &self.publishes.get())
            .finish()
    }
}

/// Error exposing Prometheus metrics in the text exposition format.
#[derive(Debug)]
pub struct ExpositionError(prometheus::Error);

impl fmt::Display for ExpositionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unable to encode Prometheus metrics: {}", self.0)
    }
}

impl Error for ExpositionError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        Some(&self.0)
    }
}

/// Wrapper that exposes metrics from a Prometheus registry in the text exposition format.
#[derive(Debug, Clone)]
pub struct MetricsExposition {
    registry: Registry,
}

impl MetricsExposition {
    pub fn new(registry: Registry) -> Self {
        Self { registry }
    }

    /// Gather all metrics from the registry and encode them in the text exposition format.
    pub fn encoded_text(&self) -> Result<Vec<u8>, ExpositionError> {
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();

        tracing::debug!(
            message = "encoding metric families to text exposition format",
            num_metrics = metric_families.len(),
        );

        TextEncoder::new()
            .encode(&metric_families, &mut buffer)
            .map_err(ExpositionError)
            .map(|_| buffer)
    }
}
