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

mod auth;
mod client;
mod types;

pub use crate::monitoring::auth::{TokenSource, METADATA_TIMEOUT, METADATA_TOKEN_URL};
pub use crate::monitoring::client::{BackendError, BackendErrorKind, MonitoringBackend, MonitoringClient};
pub use crate::monitoring::types::{
    LabelDescriptor, MetricDescriptor, MetricKind, Point, ResourceIdentity, TimeSeriesEnvelope, ValueType,
    GENERIC_NODE, RAINFALL_LABEL,
};
