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

use crate::monitoring::auth::TokenSource;
use crate::monitoring::types::{MetricDescriptor, Point, TimeSeriesEnvelope};
use async_trait::async_trait;
use serde::Serialize;
use std::collections::BTreeMap;
use std::error::Error;
use std::fmt::{self, Formatter};
use std::time::Duration;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Potential kinds of errors that can be encountered calling the monitoring API
#[derive(PartialEq, Eq, Debug, Hash, Clone, Copy)]
pub enum BackendErrorKind {
    Authentication,
    Network,
    Rejected,
    Encoding,
}

impl BackendErrorKind {
    pub fn as_label(&self) -> &'static str {
        match self {
            BackendErrorKind::Authentication => "authentication",
            BackendErrorKind::Network => "network",
            BackendErrorKind::Rejected => "rejected",
            BackendErrorKind::Encoding => "encoding",
        }
    }
}

/// Error creating metric descriptors or time series in the monitoring API
#[derive(Debug)]
pub enum BackendError {
    Rejected(u16, String),
    KindMsg(BackendErrorKind, &'static str),
    KindMsgCause(BackendErrorKind, &'static str, Box<dyn Error + Send + Sync>),
}

impl BackendError {
    pub fn kind(&self) -> BackendErrorKind {
        match self {
            BackendError::Rejected(_, _) => BackendErrorKind::Rejected,
            BackendError::KindMsg(kind, _) => *kind,
            BackendError::KindMsgCause(kind, _, _) => *kind,
        }
    }
}

impl fmt::Display for BackendError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            BackendError::Rejected(status, body) => write!(f, "request rejected with HTTP {}: {}", status, body),
            BackendError::KindMsg(_, msg) => msg.fmt(f),
            BackendError::KindMsgCause(_, msg, ref e) => write!(f, "{}: {}", msg, e),
        }
    }
}

impl Error for BackendError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            BackendError::KindMsgCause(_, _, ref e) => Some(e.as_ref()),
            _ => None,
        }
    }
}

/// Operations of the monitoring API used to register and publish metrics.
///
/// `project` is the resource name of a project, `projects/<project-id>`.
#[async_trait]
pub trait MonitoringBackend: Send + Sync {
    /// Create a metric descriptor. Creating a descriptor identical to an existing
    /// one must succeed.
    async fn create_metric_descriptor(&self, project: &str, descriptor: &MetricDescriptor) -> Result<(), BackendError>;

    /// Write points for each of the given time series in a single request.
    async fn create_time_series(&self, project: &str, series: &[TimeSeriesEnvelope]) -> Result<(), BackendError>;
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateTimeSeriesRequest<'a> {
    time_series: Vec<WireTimeSeries<'a>>,
}

impl<'a> CreateTimeSeriesRequest<'a> {
    fn new(series: &'a [TimeSeriesEnvelope]) -> Self {
        Self {
            time_series: series.iter().map(WireTimeSeries::from).collect(),
        }
    }
}

#[derive(Debug, Serialize)]
struct WireTimeSeries<'a> {
    metric: WireMetric<'a>,
    resource: WireResource<'a>,
    points: Vec<WirePoint>,
}

impl<'a> From<&'a TimeSeriesEnvelope> for WireTimeSeries<'a> {
    fn from(series: &'a TimeSeriesEnvelope) -> Self {
        let mut labels = BTreeMap::new();
        labels.insert("location", series.resource.location.as_str());
        labels.insert("namespace", series.resource.namespace.as_str());
        labels.insert("node_id", series.resource.node_id.as_str());

        Self {
            metric: WireMetric {
                metric_type: &series.metric_type,
                labels: &series.labels,
            },
            resource: WireResource {
                resource_type: series.resource.resource_type(),
                labels,
            },
            points: series.points.iter().map(WirePoint::from).collect(),
        }
    }
}

#[derive(Debug, Serialize)]
struct WireMetric<'a> {
    #[serde(rename = "type")]
    metric_type: &'a str,
    labels: &'a BTreeMap<String, String>,
}

#[derive(Debug, Serialize)]
struct WireResource<'a> {
    #[serde(rename = "type")]
    resource_type: &'a str,
    labels: BTreeMap<&'static str, &'a str>,
}

#[derive(Debug, Serialize)]
struct WirePoint {
    interval: WireInterval,
    value: WireValue,
}

impl From<&Point> for WirePoint {
    fn from(point: &Point) -> Self {
        Self {
            interval: WireInterval {
                end_time: point.end_time(),
            },
            value: WireValue {
                double_value: point.value,
            },
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct WireInterval {
    end_time: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct WireValue {
    double_value: f64,
}

/// Client for the Cloud Monitoring v3 REST API.
#[derive(Debug)]
pub struct MonitoringClient {
    http: reqwest::Client,
    base_url: String,
    tokens: TokenSource,
}

impl MonitoringClient {
    pub fn new<S: Into<String>>(base_url: S, tokens: TokenSource) -> Result<Self, BackendError> {
        let http = reqwest::Client::builder().timeout(REQUEST_TIMEOUT).build().map_err(|e| {
            BackendError::KindMsgCause(BackendErrorKind::Network, "unable to create HTTP client", Box::new(e))
        })?;

        Ok(Self::from_client(http, base_url, tokens))
    }

    pub fn from_client<S: Into<String>>(http: reqwest::Client, base_url: S, tokens: TokenSource) -> Self {
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_owned(),
            tokens,
        }
    }

    async fn post<T: Serialize + ?Sized>(&self, url: String, body: &T) -> Result<(), BackendError> {
        let body = serde_json::to_vec(body).map_err(|e| {
            BackendError::KindMsgCause(BackendErrorKind::Encoding, "unable to encode request body", Box::new(e))
        })?;

        let token = self.tokens.token().await?;
        tracing::debug!(message = "sending request to monitoring API", url = %url, bytes = body.len());

        let res = self
            .http
            .post(&url)
            .bearer_auth(token)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(body)
            .send()
            .await
            .map_err(|e| {
                BackendError::KindMsgCause(
                    BackendErrorKind::Network,
                    "unable to send request to monitoring API",
                    Box::new(e),
                )
            })?;

        let status = res.status();
        if status.is_success() {
            Ok(())
        } else {
            // Best effort to include the reason the request was rejected
            let body = res.text().await.unwrap_or_default();
            Err(BackendError::Rejected(status.as_u16(), body))
        }
    }
}

#[async_trait]
impl MonitoringBackend for MonitoringClient {
    async fn create_metric_descriptor(&self, project: &str, descriptor: &MetricDescriptor) -> Result<(), BackendError> {
        let url = format!("{}/{}/metricDescriptors", self.base_url, project);
        self.post(url, descriptor).await
    }

    async fn create_time_series(&self, project: &str, series: &[TimeSeriesEnvelope]) -> Result<(), BackendError> {
        let url = format!("{}/{}/timeSeries", self.base_url, project);
        self.post(url, &CreateTimeSeriesRequest::new(series)).await
    }
}

#[cfg(test)]
mod test {
    use super::{BackendError, BackendErrorKind, CreateTimeSeriesRequest, MonitoringBackend, MonitoringClient};
    use crate::catalog::MetricDefinition;
    use crate::monitoring::auth::TokenSource;
    use crate::monitoring::types::{MetricDescriptor, Point, ResourceIdentity, TimeSeriesEnvelope};
    use crate::test::serve_fixed;
    use hyper::StatusCode;
    use serde_json::json;
    use std::collections::BTreeMap;

    fn envelope(points: Vec<Point>) -> TimeSeriesEnvelope {
        let mut labels = BTreeMap::new();
        labels.insert("rainfall".to_owned(), "3".to_owned());

        TimeSeriesEnvelope {
            metric_type: "custom.googleapis.com/temperature".to_owned(),
            labels,
            resource: ResourceIdentity::new("asia-northeast1-a", "ymotongpoo", "raspberrypi"),
            points,
        }
    }

    #[test]
    fn test_create_time_series_request_json() {
        let series = vec![envelope(vec![Point {
            value: 21.5,
            seconds: 1_650_000_000,
            nanos: 500,
        }])];

        let value = serde_json::to_value(CreateTimeSeriesRequest::new(&series)).unwrap();

        assert_eq!(
            json!({
                "timeSeries": [{
                    "metric": {
                        "type": "custom.googleapis.com/temperature",
                        "labels": {"rainfall": "3"},
                    },
                    "resource": {
                        "type": "generic_node",
                        "labels": {
                            "location": "asia-northeast1-a",
                            "namespace": "ymotongpoo",
                            "node_id": "raspberrypi",
                        },
                    },
                    "points": [{
                        "interval": {"endTime": "2022-04-15T05:20:00.000000500Z"},
                        "value": {"doubleValue": 21.5},
                    }],
                }],
            }),
            value
        );
    }

    #[test]
    fn test_backend_error_kind() {
        let err = BackendError::Rejected(403, "permission denied".to_owned());

        assert_eq!(BackendErrorKind::Rejected, err.kind());
        assert_eq!("request rejected with HTTP 403: permission denied", err.to_string());
        assert_eq!("rejected", err.kind().as_label());
    }

    #[tokio::test]
    async fn test_client_network_error() {
        let client = MonitoringClient::new("http://127.0.0.1:1/v3/", TokenSource::Static("token".to_owned())).unwrap();
        let res = client.create_time_series("projects/my-project", &[envelope(vec![])]).await;

        assert_eq!(BackendErrorKind::Network, res.unwrap_err().kind());
    }

    #[tokio::test]
    async fn test_client_create_time_series() {
        let addr = serve_fixed("/v3/projects/my-project/timeSeries", StatusCode::OK, "{}").await;
        let client = MonitoringClient::new(format!("http://{}/v3", addr), TokenSource::Static("token".to_owned())).unwrap();
        let res = client
            .create_time_series("projects/my-project", &[envelope(vec![Point::now(21.5)])])
            .await;

        assert!(res.is_ok());
    }

    #[tokio::test]
    async fn test_client_descriptor_rejected() {
        let addr = serve_fixed(
            "/v3/projects/my-project/metricDescriptors",
            StatusCode::FORBIDDEN,
            "permission denied",
        )
        .await;
        let client = MonitoringClient::new(format!("http://{}/v3", addr), TokenSource::Static("token".to_owned())).unwrap();
        let descriptor = MetricDescriptor::gauge(&MetricDefinition::new("temperature", "air temperature"));
        let res = client.create_metric_descriptor("projects/my-project", &descriptor).await;

        match res.unwrap_err() {
            BackendError::Rejected(status, body) => {
                assert_eq!(403, status);
                assert_eq!("permission denied", body);
            }
            e => panic!("unexpected error: {}", e),
        }
    }
}
