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

use crate::catalog::MetricDefinition;
use chrono::{SecondsFormat, TimeZone, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

pub const RAINFALL_LABEL: &str = "rainfall";
pub const GENERIC_NODE: &str = "generic_node";

const EPOCH_RFC3339: &str = "1970-01-01T00:00:00.000000000Z";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MetricKind {
    Gauge,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ValueType {
    Double,
    Int64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LabelDescriptor {
    pub key: String,
    pub value_type: ValueType,
}

/// Definition of a custom metric as registered with the monitoring API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricDescriptor {
    #[serde(rename = "type")]
    pub metric_type: String,
    pub metric_kind: MetricKind,
    pub value_type: ValueType,
    pub labels: Vec<LabelDescriptor>,
    pub description: String,
}

impl MetricDescriptor {
    /// Double valued gauge for the given metric with a single integer `rainfall` label.
    pub fn gauge(definition: &MetricDefinition) -> Self {
        Self {
            metric_type: definition.metric_type(),
            metric_kind: MetricKind::Gauge,
            value_type: ValueType::Double,
            labels: vec![LabelDescriptor {
                key: RAINFALL_LABEL.to_owned(),
                value_type: ValueType::Int64,
            }],
            description: definition.description().to_owned(),
        }
    }
}

/// The `generic_node` monitored resource that produced a metric.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceIdentity {
    pub location: String,
    pub namespace: String,
    pub node_id: String,
}

impl ResourceIdentity {
    pub fn new<S1, S2, S3>(location: S1, namespace: S2, node_id: S3) -> Self
    where
        S1: Into<String>,
        S2: Into<String>,
        S3: Into<String>,
    {
        Self {
            location: location.into(),
            namespace: namespace.into(),
            node_id: node_id.into(),
        }
    }

    pub fn resource_type(&self) -> &'static str {
        GENERIC_NODE
    }
}

/// A single double value at an instant, stored as seconds and nanoseconds since the epoch.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Point {
    pub value: f64,
    pub seconds: i64,
    pub nanos: i32,
}

impl Point {
    /// Create a point for `value` at the current wall-clock time.
    pub fn now(value: f64) -> Self {
        Self::at(value, SystemTime::now())
    }

    /// Create a point for `value` at `time`. Times before the epoch are clamped to it.
    pub fn at(value: f64, time: SystemTime) -> Self {
        let since = time.duration_since(UNIX_EPOCH).unwrap_or_default();
        Self {
            value,
            seconds: since.as_secs() as i64,
            nanos: since.subsec_nanos() as i32,
        }
    }

    /// End time of the point in RFC 3339 format with nanosecond precision.
    pub fn end_time(&self) -> String {
        match Utc.timestamp_opt(self.seconds, self.nanos as u32).single() {
            Some(t) => t.to_rfc3339_opts(SecondsFormat::Nanos, true),
            None => EPOCH_RFC3339.to_owned(),
        }
    }
}

/// Per-metric container of resource, labels, and points submitted together.
#[derive(Debug, Clone, PartialEq)]
pub struct TimeSeriesEnvelope {
    pub metric_type: String,
    pub labels: BTreeMap<String, String>,
    pub resource: ResourceIdentity,
    pub points: Vec<Point>,
}
