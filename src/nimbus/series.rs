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

use crate::catalog::MetricCatalog;
use crate::monitoring::{ResourceIdentity, TimeSeriesEnvelope, RAINFALL_LABEL};
use crate::rainfall::Rainfall;
use std::collections::BTreeMap;

/// Time series envelopes for a single cycle keyed by metric ID, in catalog order.
#[derive(Debug, Clone, PartialEq)]
pub struct EnvelopeMap {
    entries: Vec<(String, TimeSeriesEnvelope)>,
}

impl EnvelopeMap {
    pub fn get(&self, id: &str) -> Option<&TimeSeriesEnvelope> {
        self.entries.iter().find(|(k, _)| k == id).map(|(_, v)| v)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut TimeSeriesEnvelope> {
        self.entries.iter_mut().find(|(k, _)| k == id).map(|(_, v)| v)
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(k, _)| k.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &TimeSeriesEnvelope)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Total number of points across all envelopes.
    pub fn num_points(&self) -> usize {
        self.entries.iter().map(|(_, v)| v.points.len()).sum()
    }

    /// Consume the map, returning envelopes in catalog order.
    pub fn into_series(self) -> Vec<TimeSeriesEnvelope> {
        self.entries.into_iter().map(|(_, v)| v).collect()
    }
}

/// Build one envelope, without any points, for every metric in the catalog.
///
/// Each envelope is labeled with `rainfall` and attributed to `resource`. Output
/// depends only on the arguments.
pub fn build_envelopes(catalog: &MetricCatalog, rainfall: Rainfall, resource: &ResourceIdentity) -> EnvelopeMap {
    let entries = catalog
        .iter()
        .map(|definition| {
            let mut labels = BTreeMap::new();
            labels.insert(RAINFALL_LABEL.to_owned(), rainfall.to_string());

            let envelope = TimeSeriesEnvelope {
                metric_type: definition.metric_type(),
                labels,
                resource: resource.clone(),
                points: Vec::new(),
            };

            (definition.id().to_owned(), envelope)
        })
        .collect();

    EnvelopeMap { entries }
}
