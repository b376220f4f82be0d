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

use std::fmt::{self, Formatter};

const CUSTOM_METRIC_PREFIX: &str = "custom.googleapis.com";

pub const TEMPERATURE: &str = "temperature";
pub const PRESSURE: &str = "pressure";
pub const HUMIDITY: &str = "humidity";
pub const GAS_RESISTANCE: &str = "gas_resistance";
pub const GAS_INDEX: &str = "gas_index";
pub const MEAS_INDEX: &str = "meas_index";
pub const HEAT_STABLE: &str = "heat_stable";

/// A metric that will be registered and published, identified by `id`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricDefinition {
    id: String,
    description: String,
}

impl MetricDefinition {
    pub fn new<S1, S2>(id: S1, description: S2) -> Self
    where
        S1: Into<String>,
        S2: Into<String>,
    {
        Self {
            id: id.into(),
            description: description.into(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    /// Fully qualified custom metric type, `custom.googleapis.com/<id>`.
    pub fn metric_type(&self) -> String {
        custom_metric_type(&self.id)
    }
}

impl fmt::Display for MetricDefinition {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        self.id.fmt(f)
    }
}

/// Fully qualified custom metric type for a metric ID.
pub fn custom_metric_type(id: &str) -> String {
    format!("{}/{}", CUSTOM_METRIC_PREFIX, id)
}

/// Ordered collection of metric definitions with unique IDs.
///
/// Iteration order is the order definitions were added and is used for every
/// structure derived from the catalog (descriptors, series, published batches).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetricCatalog {
    definitions: Vec<MetricDefinition>,
}

impl MetricCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a definition, replacing the description of an existing definition
    /// with the same ID instead of adding a duplicate.
    pub fn with(mut self, definition: MetricDefinition) -> Self {
        match self.definitions.iter_mut().find(|d| d.id == definition.id) {
            Some(existing) => *existing = definition,
            None => self.definitions.push(definition),
        }

        self
    }

    pub fn get(&self, id: &str) -> Option<&MetricDefinition> {
        self.definitions.iter().find(|d| d.id == id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.get(id).is_some()
    }

    pub fn iter(&self) -> impl ExactSizeIterator<Item = &MetricDefinition> {
        self.definitions.iter()
    }

    pub fn len(&self) -> usize {
        self.definitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.definitions.is_empty()
    }
}

/// Catalog of every value produced by a BME680 sensor reading.
pub fn sensor_catalog() -> MetricCatalog {
    MetricCatalog::new()
        .with(MetricDefinition::new(TEMPERATURE, "air temperature"))
        .with(MetricDefinition::new(PRESSURE, "barometric pressure"))
        .with(MetricDefinition::new(HUMIDITY, "air humidity"))
        .with(MetricDefinition::new(GAS_RESISTANCE, "indicator of air quality"))
        .with(MetricDefinition::new(GAS_INDEX, ""))
        .with(MetricDefinition::new(MEAS_INDEX, ""))
        .with(MetricDefinition::new(HEAT_STABLE, ""))
}
