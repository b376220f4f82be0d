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
use crate::config::project_path;
use crate::monitoring::{BackendError, MetricDescriptor, MonitoringBackend};
use std::error::Error;
use std::fmt::{self, Formatter};
use std::sync::Arc;

/// Error registering the descriptor of a particular metric
#[derive(Debug)]
pub struct RegistrationError {
    metric_type: String,
    cause: BackendError,
}

impl RegistrationError {
    pub fn metric_type(&self) -> &str {
        &self.metric_type
    }

    pub fn cause(&self) -> &BackendError {
        &self.cause
    }
}

impl fmt::Display for RegistrationError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "unable to create metric descriptor {}: {}", self.metric_type, self.cause)
    }
}

impl Error for RegistrationError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        Some(&self.cause)
    }
}

/// Registers a gauge descriptor with the monitoring API for each metric in a catalog.
///
/// Descriptors are created every time the registrar runs. The monitoring API accepts
/// identical descriptors being created again so nothing is tracked locally.
pub struct DescriptorRegistrar {
    backend: Arc<dyn MonitoringBackend>,
    project: String,
}

impl DescriptorRegistrar {
    pub fn new(backend: Arc<dyn MonitoringBackend>, project_id: &str) -> Self {
        Self {
            backend,
            project: project_path(project_id),
        }
    }

    /// Create descriptors for all metrics, in catalog order, stopping at the first
    /// one that can't be created. Returns the number of descriptors created.
    pub async fn register_all(&self, catalog: &MetricCatalog) -> Result<usize, RegistrationError> {
        for definition in catalog.iter() {
            let descriptor = MetricDescriptor::gauge(definition);

            self.backend
                .create_metric_descriptor(&self.project, &descriptor)
                .await
                .map_err(|cause| RegistrationError {
                    metric_type: descriptor.metric_type.clone(),
                    cause,
                })?;

            tracing::info!(
                message = "created metric descriptor",
                project = %self.project,
                metric_type = %descriptor.metric_type,
            );
        }

        Ok(catalog.len())
    }
}
