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

use crate::catalog::{sensor_catalog, MetricCatalog};
use crate::collector::SampleSource;
use crate::config::{project_path, AgentConfig, ConfigError};
use crate::metrics::AgentMetrics;
use crate::monitoring::{BackendError, MonitoringBackend, Point, ResourceIdentity};
use crate::rainfall::{Rainfall, RainfallError, RainfallSource};
use crate::registrar::{DescriptorRegistrar, RegistrationError};
use crate::sensor::{SensorError, SensorSample};
use crate::series::{build_envelopes, EnvelopeMap};
use std::error::Error;
use std::fmt::{self, Formatter};
use futures_util::FutureExt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio::time;
use tracing::{Instrument, Level};

/// Error that stops the publish loop
#[derive(Debug)]
pub enum LoopError {
    Configuration(ConfigError),
    Registration(RegistrationError),
    Sensor(SensorError),
    Publish(BackendError),
}

impl LoopError {
    pub fn as_label(&self) -> &'static str {
        match self {
            LoopError::Configuration(_) => "configuration",
            LoopError::Registration(_) => "registration",
            LoopError::Sensor(_) => "sensor",
            LoopError::Publish(_) => "publish",
        }
    }
}

impl fmt::Display for LoopError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            LoopError::Configuration(e) => write!(f, "configuration error: {}", e),
            LoopError::Registration(e) => e.fmt(f),
            LoopError::Sensor(e) => write!(f, "unable to read sensor: {}", e),
            LoopError::Publish(e) => write!(f, "unable to publish time series: {}", e),
        }
    }
}

impl Error for LoopError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            LoopError::Configuration(e) => Some(e),
            LoopError::Registration(e) => Some(e),
            LoopError::Sensor(e) => Some(e),
            LoopError::Publish(e) => Some(e),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Starting,
    Running,
    Stopped,
}

/// Result of a single cycle that didn't fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    /// A batch with this many time series was published.
    Published(usize),
    /// The sensor had no new data so nothing was published.
    Skipped,
    /// Shutdown was requested part way through so nothing was published.
    Interrupted,
}

/// Append a point for every value of `sample` to the envelope of the matching metric.
///
/// Values without an envelope (metrics not in the catalog) are ignored. Returns the
/// number of points appended.
pub fn merge_sample(envelopes: &mut EnvelopeMap, sample: &SensorSample) -> usize {
    let mut appended = 0;

    for (id, value) in sample.fields() {
        if let Some(envelope) = envelopes.get_mut(id) {
            envelope.points.push(Point::now(value));
            appended += 1;
        }
    }

    appended
}

/// Periodically read the sensor and publish its values, labeled with the current
/// rainfall, to the monitoring backend.
///
/// The loop moves from `Starting` (descriptors are registered) to `Running` (one
/// cycle every interval) to `Stopped`. `Stopped` is reached when the shutdown
/// future completes, which is not an error, or when a cycle fails. A shutdown
/// requested during a cycle stops it before the next blocking call.
pub struct PublishLoop {
    config: AgentConfig,
    catalog: MetricCatalog,
    project_id: String,
    resource: ResourceIdentity,
    backend: Arc<dyn MonitoringBackend>,
    rainfall: Arc<dyn RainfallSource>,
    samples: Arc<dyn SampleSource>,
    metrics: AgentMetrics,
    state: LoopState,
}

impl PublishLoop {
    pub fn new(
        config: AgentConfig,
        project_id: &str,
        resource: ResourceIdentity,
        backend: Arc<dyn MonitoringBackend>,
        rainfall: Arc<dyn RainfallSource>,
        samples: Arc<dyn SampleSource>,
        metrics: AgentMetrics,
    ) -> Self {
        Self {
            config,
            catalog: sensor_catalog(),
            project_id: project_id.to_owned(),
            resource,
            backend,
            rainfall,
            samples,
            metrics,
            state: LoopState::Starting,
        }
    }

    /// Publish metrics from `catalog` instead of every value the sensor reports.
    pub fn with_catalog(mut self, catalog: MetricCatalog) -> Self {
        self.catalog = catalog;
        self
    }

    pub fn state(&self) -> LoopState {
        self.state
    }

    /// Register a descriptor for every metric in the catalog and move to `Running`.
    /// Any failure moves the loop to `Stopped`.
    pub async fn start(&mut self) -> Result<usize, LoopError> {
        let registrar = DescriptorRegistrar::new(self.backend.clone(), &self.project_id);

        match registrar.register_all(&self.catalog).await {
            Ok(n) => {
                self.state = LoopState::Running;
                Ok(n)
            }
            Err(e) => {
                self.metrics.error("registration");
                self.state = LoopState::Stopped;
                Err(LoopError::Registration(e))
            }
        }
    }

    /// Fetch rainfall, read one sample, and publish it if there was one.
    ///
    /// Rainfall that can't be fetched is published as unknown, except when the
    /// weather API is not configured. Sensor and publish errors are returned.
    pub async fn run_cycle(&self) -> Result<CycleOutcome, LoopError> {
        self.cycle(&mut || false).await
    }

    /// Run a single cycle, calling `interrupted` between each blocking call and
    /// abandoning the cycle as soon as it returns true.
    async fn cycle(&self, interrupted: &mut (dyn FnMut() -> bool + Send)) -> Result<CycleOutcome, LoopError> {
        self.metrics.cycle();

        let rainfall = self.current_rainfall().await?;
        self.metrics.rainfall(rainfall);
        if interrupted() {
            return Ok(CycleOutcome::Interrupted);
        }

        let mut envelopes = build_envelopes(&self.catalog, rainfall, &self.resource);
        let sample = match self.samples.read_sample().await {
            Ok(Some(s)) => s,
            Ok(None) => {
                tracing::debug!(message = "sensor had no new data, skipping publish");
                self.metrics.skipped();
                return Ok(CycleOutcome::Skipped);
            }
            Err(e) => {
                self.metrics.error("sensor");
                return Err(LoopError::Sensor(e));
            }
        };

        if interrupted() {
            return Ok(CycleOutcome::Interrupted);
        }

        let points = merge_sample(&mut envelopes, &sample);
        let series = envelopes.into_series();

        self.backend
            .create_time_series(&project_path(&self.project_id), &series)
            .await
            .map_err(|e| {
                self.metrics.error("publish");
                LoopError::Publish(e)
            })?;

        self.metrics.published();
        tracing::info!(
            message = "published time series",
            num_series = series.len(),
            num_points = points,
            rainfall = %rainfall,
            sample = %sample,
        );

        Ok(CycleOutcome::Published(series.len()))
    }

    async fn current_rainfall(&self) -> Result<Rainfall, LoopError> {
        match self.rainfall.fetch_rainfall(self.config.coordinate).await {
            Ok(v) => Ok(v),
            Err(RainfallError::Config(e)) => {
                self.metrics.error("configuration");
                Err(LoopError::Configuration(e))
            }
            Err(e) => {
                tracing::warn!(
                    message = "unable to fetch rainfall, publishing as unknown",
                    rainfall = %Rainfall::UNKNOWN,
                    kind = e.kind().as_label(),
                    error = %e,
                );
                self.metrics.error("rainfall");
                Ok(Rainfall::UNKNOWN)
            }
        }
    }

    /// Start the loop if needed and run a cycle every interval until `shutdown`
    /// completes or a cycle fails.
    ///
    /// `shutdown` is checked before starting and between every blocking call of a
    /// cycle. Calls already in progress (a request or sensor read) are not cancelled
    /// but nothing further is done once they finish.
    pub async fn run<F>(mut self, shutdown: F) -> Result<(), LoopError>
    where
        F: Future<Output = ()> + Send,
    {
        let mut shutdown = Shutdown::new(shutdown);

        if self.state == LoopState::Starting && !shutdown.is_set() {
            self.start().await?;
        }

        if shutdown.is_set() {
            self.state = LoopState::Stopped;
        } else {
            tracing::info!(
                message = "publishing metrics",
                interval_secs = self.config.interval.as_secs(),
                num_metrics = self.catalog.len(),
                node_id = %self.resource.node_id,
            );
        }

        while self.state == LoopState::Running {
            let res = self
                .cycle(&mut || shutdown.is_set())
                .instrument(tracing::span!(Level::DEBUG, "publish_cycle"))
                .await;

            match res {
                Ok(CycleOutcome::Interrupted) => {
                    tracing::debug!(message = "cycle interrupted by shutdown");
                }
                Ok(_) => {}
                Err(e) => {
                    self.state = LoopState::Stopped;
                    return Err(e);
                }
            }

            if shutdown.is_set() {
                self.state = LoopState::Stopped;
                break;
            }

            tokio::select! {
                biased;
                _ = shutdown.wait() => {
                    self.state = LoopState::Stopped;
                }
                _ = time::sleep(self.config.interval) => {}
            }
        }

        tracing::info!(message = "publish loop stopped");
        Ok(())
    }
}

/// Shutdown future that can be checked without blocking and remembers that it completed.
struct Shutdown<F> {
    future: Pin<Box<F>>,
    fired: bool,
}

impl<F> Shutdown<F>
where
    F: Future<Output = ()>,
{
    fn new(future: F) -> Self {
        Self {
            future: Box::pin(future),
            fired: false,
        }
    }

    fn is_set(&mut self) -> bool {
        if !self.fired {
            self.fired = self.future.as_mut().now_or_never().is_some();
        }

        self.fired
    }

    async fn wait(&mut self) {
        if !self.fired {
            self.future.as_mut().await;
            self.fired = true;
        }
    }
}

#[cfg(test)]
mod test {
    use super::{merge_sample, CycleOutcome, LoopError, LoopState, PublishLoop};
    use crate::catalog::{sensor_catalog, MetricCatalog, MetricDefinition, HUMIDITY, TEMPERATURE};
    use crate::config::{AgentConfig, ConfigError, Coordinate};
    use crate::metrics::AgentMetrics;
    use crate::monitoring::ResourceIdentity;
    use crate::rainfall::{Rainfall, RainfallErrorKind};
    use crate::sensor::{SensorError, SensorErrorKind};
    use crate::series::build_envelopes;
    use crate::test::{sample, FakeBackend, FakeRainfall, FakeSamples};
    use prometheus::Registry;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::oneshot;

    fn resource() -> ResourceIdentity {
        ResourceIdentity::new("asia-northeast1-a", "ymotongpoo", "raspberrypi")
    }

    fn config() -> AgentConfig {
        AgentConfig {
            interval: Duration::from_millis(1),
            ..Default::default()
        }
    }

    fn two_metrics() -> MetricCatalog {
        MetricCatalog::new()
            .with(MetricDefinition::new(TEMPERATURE, "air temperature"))
            .with(MetricDefinition::new(HUMIDITY, "relative humidity"))
    }

    fn publish_loop(backend: Arc<FakeBackend>, rainfall: FakeRainfall, samples: Arc<FakeSamples>) -> PublishLoop {
        PublishLoop::new(
            config(),
            "my-project",
            resource(),
            backend,
            Arc::new(rainfall),
            samples,
            AgentMetrics::new(&Registry::new()).unwrap(),
        )
    }

    #[test]
    fn test_merge_sample_all_fields() {
        let mut envelopes = build_envelopes(&sensor_catalog(), Rainfall::from(0), &resource());
        let appended = merge_sample(&mut envelopes, &sample(21.5, 60.2));

        assert_eq!(7, appended);
        assert_eq!(7, envelopes.num_points());
        for (_, envelope) in envelopes.iter() {
            assert_eq!(1, envelope.points.len());
            assert!((0..=999_999_999).contains(&envelope.points[0].nanos));
        }
    }

    #[test]
    fn test_merge_sample_subset_catalog() {
        let mut envelopes = build_envelopes(&two_metrics(), Rainfall::from(0), &resource());
        let appended = merge_sample(&mut envelopes, &sample(21.5, 60.2));

        assert_eq!(2, appended);
        assert_eq!(21.5, envelopes.get(TEMPERATURE).unwrap().points[0].value);
        assert_eq!(60.2, envelopes.get(HUMIDITY).unwrap().points[0].value);
    }

    #[tokio::test]
    async fn test_start_registers_descriptors() {
        let backend = Arc::new(FakeBackend::default());
        let samples = Arc::new(FakeSamples::default());
        let mut publisher = publish_loop(backend.clone(), FakeRainfall::value(0), samples);

        assert_eq!(LoopState::Starting, publisher.state());
        assert_eq!(7, publisher.start().await.unwrap());
        assert_eq!(LoopState::Running, publisher.state());
        assert_eq!(7, backend.descriptors().len());
    }

    #[tokio::test]
    async fn test_start_registration_failure() {
        let backend = Arc::new(FakeBackend::rejecting_descriptor("custom.googleapis.com/temperature"));
        let samples = Arc::new(FakeSamples::default());
        let mut publisher = publish_loop(backend, FakeRainfall::value(0), samples);

        let res = publisher.start().await;

        assert!(matches!(res, Err(LoopError::Registration(_))));
        assert_eq!(LoopState::Stopped, publisher.state());
    }

    #[tokio::test]
    async fn test_cycle_publishes_sample_with_rainfall() {
        let backend = Arc::new(FakeBackend::default());
        let samples = Arc::new(FakeSamples::new(vec![Ok(Some(sample(21.5, 60.2)))]));
        let publisher = publish_loop(backend.clone(), FakeRainfall::value(3), samples).with_catalog(two_metrics());

        let outcome = publisher.run_cycle().await.unwrap();
        let batches = backend.batches();

        assert_eq!(CycleOutcome::Published(2), outcome);
        assert_eq!(1, batches.len());

        let (project, series) = &batches[0];
        assert_eq!("projects/my-project", project.as_str());
        assert_eq!(2, series.len());

        assert_eq!("custom.googleapis.com/temperature", series[0].metric_type);
        assert_eq!("custom.googleapis.com/humidity", series[1].metric_type);
        assert_eq!(21.5, series[0].points[0].value);
        assert_eq!(60.2, series[1].points[0].value);

        for s in series {
            assert_eq!("3", s.labels["rainfall"]);
            assert_eq!(1, s.points.len());
            assert_eq!(resource(), s.resource);
        }
    }

    #[tokio::test]
    async fn test_cycle_uses_configured_coordinate() {
        let backend = Arc::new(FakeBackend::default());
        let samples = Arc::new(FakeSamples::default());
        let rainfall = Arc::new(FakeRainfall::value(0));
        let publisher = PublishLoop::new(
            AgentConfig {
                coordinate: Coordinate::new(-71.06, 42.36),
                ..config()
            },
            "my-project",
            resource(),
            backend,
            rainfall.clone(),
            samples,
            AgentMetrics::new(&Registry::new()).unwrap(),
        );

        publisher.run_cycle().await.unwrap();

        assert_eq!(vec![Coordinate::new(-71.06, 42.36)], rainfall.coordinates());
    }

    #[tokio::test]
    async fn test_cycle_absent_sample_skips_publish() {
        let backend = Arc::new(FakeBackend::default());
        let samples = Arc::new(FakeSamples::new(vec![Ok(None)]));
        let publisher = publish_loop(backend.clone(), FakeRainfall::value(3), samples.clone());

        let outcome = publisher.run_cycle().await.unwrap();

        assert_eq!(CycleOutcome::Skipped, outcome);
        assert_eq!(1, samples.reads());
        assert!(backend.batches().is_empty());
    }

    #[tokio::test]
    async fn test_cycle_rainfall_failure_publishes_unknown() {
        let backend = Arc::new(FakeBackend::default());
        let samples = Arc::new(FakeSamples::new(vec![Ok(Some(sample(21.5, 60.2)))]));
        let publisher = publish_loop(backend.clone(), FakeRainfall::failing(RainfallErrorKind::Network), samples);

        let outcome = publisher.run_cycle().await.unwrap();
        let batches = backend.batches();

        assert_eq!(CycleOutcome::Published(7), outcome);
        for s in &batches[0].1 {
            assert_eq!("-1", s.labels["rainfall"]);
        }
    }

    #[tokio::test]
    async fn test_cycle_missing_app_id() {
        let backend = Arc::new(FakeBackend::default());
        let samples = Arc::new(FakeSamples::new(vec![Ok(Some(sample(21.5, 60.2)))]));
        let publisher = publish_loop(
            backend.clone(),
            FakeRainfall::failing(RainfallErrorKind::Configuration),
            samples.clone(),
        );

        let res = publisher.run_cycle().await;

        assert!(matches!(res, Err(LoopError::Configuration(ConfigError::MissingAppId))));
        assert_eq!(0, samples.reads());
        assert!(backend.batches().is_empty());
    }

    #[tokio::test]
    async fn test_cycle_publish_failure() {
        let backend = Arc::new(FakeBackend::rejecting_series());
        let samples = Arc::new(FakeSamples::new(vec![Ok(Some(sample(21.5, 60.2)))]));
        let publisher = publish_loop(backend, FakeRainfall::value(0), samples);

        let res = publisher.run_cycle().await;

        assert!(matches!(res, Err(LoopError::Publish(_))));
    }

    #[tokio::test]
    async fn test_run_stops_on_sensor_fault() {
        let backend = Arc::new(FakeBackend::default());
        let samples = Arc::new(FakeSamples::new(vec![
            Ok(Some(sample(21.5, 60.2))),
            Ok(None),
            Err(SensorError::KindMsg(SensorErrorKind::Io, "remote I/O error")),
            Ok(Some(sample(22.0, 61.0))),
        ]));
        let publisher = publish_loop(backend.clone(), FakeRainfall::value(0), samples.clone());

        let res = publisher.run(futures_util::future::pending()).await;

        match res {
            Err(LoopError::Sensor(e)) => assert_eq!(SensorErrorKind::Io, e.kind()),
            r => panic!("unexpected result: {:?}", r),
        }

        assert_eq!(3, samples.reads());
        assert_eq!(1, backend.batches().len());
        assert_eq!(7, backend.descriptors().len());
    }

    #[tokio::test]
    async fn test_run_shutdown_before_start() {
        let backend = Arc::new(FakeBackend::default());
        let samples = Arc::new(FakeSamples::new(vec![Ok(Some(sample(21.5, 60.2)))]));
        let publisher = publish_loop(backend.clone(), FakeRainfall::value(0), samples.clone());

        let res = publisher.run(async {}).await;

        assert!(res.is_ok());
        assert_eq!(0, samples.reads());
        assert!(backend.descriptors().is_empty());
        assert!(backend.batches().is_empty());
    }

    #[tokio::test]
    async fn test_run_shutdown_between_fetch_and_read() {
        let (tx, rx) = oneshot::channel();
        let backend = Arc::new(FakeBackend::default());
        let samples = Arc::new(FakeSamples::new(vec![Ok(Some(sample(21.5, 60.2)))]));
        let rainfall = FakeRainfall::value(3).notify_on_fetch(tx);
        let publisher = publish_loop(backend.clone(), rainfall, samples.clone());

        let res = publisher
            .run(async move {
                let _ = rx.await;
            })
            .await;

        assert!(res.is_ok());
        assert_eq!(7, backend.descriptors().len());
        assert_eq!(0, samples.reads());
        assert!(backend.batches().is_empty());
    }

    #[tokio::test]
    async fn test_run_shutdown_between_read_and_publish() {
        let (tx, rx) = oneshot::channel();
        let backend = Arc::new(FakeBackend::default());
        let samples = Arc::new(FakeSamples::new(vec![Ok(Some(sample(21.5, 60.2)))]).notify_on_read(tx));
        let publisher = publish_loop(backend.clone(), FakeRainfall::value(3), samples.clone());

        let res = publisher
            .run(async move {
                let _ = rx.await;
            })
            .await;

        assert!(res.is_ok());
        assert_eq!(1, samples.reads());
        assert!(backend.batches().is_empty());
    }

    #[tokio::test]
    async fn test_run_shutdown_during_sleep() {
        let (tx, rx) = oneshot::channel::<()>();
        let backend = Arc::new(FakeBackend::default());
        let samples = Arc::new(FakeSamples::new(vec![Ok(Some(sample(21.5, 60.2)))]));
        let publisher = PublishLoop::new(
            AgentConfig {
                interval: Duration::from_secs(3600),
                ..Default::default()
            },
            "my-project",
            resource(),
            backend.clone(),
            Arc::new(FakeRainfall::value(3)),
            samples.clone(),
            AgentMetrics::new(&Registry::new()).unwrap(),
        );

        let handle = tokio::spawn(publisher.run(async move {
            let _ = rx.await;
        }));

        // Wait for the first batch before requesting shutdown mid-sleep
        while backend.batches().is_empty() {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        tx.send(()).unwrap();

        let res = tokio::time::timeout(Duration::from_secs(5), handle).await.unwrap().unwrap();

        assert!(res.is_ok());
        assert_eq!(1, samples.reads());
        assert_eq!(1, backend.batches().len());
    }

    #[tokio::test]
    async fn test_run_registration_failure_never_cycles() {
        let backend = Arc::new(FakeBackend::rejecting_descriptor("custom.googleapis.com/pressure"));
        let samples = Arc::new(FakeSamples::default());
        let publisher = publish_loop(backend.clone(), FakeRainfall::value(0), samples.clone());

        let res = publisher.run(futures_util::future::pending()).await;

        assert!(matches!(res, Err(LoopError::Registration(_))));
        assert_eq!(0, samples.reads());
        assert!(backend.batches().is_empty());
    }
}
