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

use clap::{Parser, ValueEnum};
use hyper::service::{make_service_fn, service_fn};
use hyper::Server;
use nimbus::collector::SampleCollector;
use nimbus::config::{
    AgentConfig, Coordinate, Credentials, DEFAULT_LATITUDE, DEFAULT_LOCATION, DEFAULT_LONGITUDE,
    DEFAULT_MONITORING_URL, DEFAULT_NAMESPACE, DEFAULT_WEATHER_URL,
};
use nimbus::http::{http_route, RequestContext};
use nimbus::metrics::{AgentMetrics, MetricsExposition};
use nimbus::monitoring::{MonitoringClient, ResourceIdentity, TokenSource};
use nimbus::publish::PublishLoop;
use nimbus::rainfall::RainfallClient;
use nimbus::sensor::{Bme680Sensor, SensorSettings, I2C_ADDR_PRIMARY, I2C_ADDR_SECONDARY};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use std::{io, process};
use tokio::signal::unix::{self, SignalKind};
use tokio::sync::watch;
use tokio::task;
use tracing::{Instrument, Level};

const DEFAULT_REFRESH_SECS: u64 = 10;
const DEFAULT_LOG_LEVEL: Level = Level::INFO;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum I2cAddress {
    /// 0x76, SDO connected to ground
    Primary,
    /// 0x77, SDO connected to VDDIO
    Secondary,
    /// Try the primary address and then the secondary address
    Auto,
}

impl I2cAddress {
    fn candidates(self) -> &'static [u8] {
        match self {
            I2cAddress::Primary => &[I2C_ADDR_PRIMARY],
            I2cAddress::Secondary => &[I2C_ADDR_SECONDARY],
            I2cAddress::Auto => &[I2C_ADDR_PRIMARY, I2C_ADDR_SECONDARY],
        }
    }
}

/// Publish environmental readings from a BME680 sensor to Google Cloud Monitoring
///
/// Read temperature, pressure, humidity, and gas resistance from a BME680 sensor
/// connected to the I2C bus of a local machine, usually a Raspberry PI, and publish
/// them as custom metrics in Google Cloud Monitoring. Every point is labeled with
/// the rainfall currently observed at a fixed location by the Yahoo! weather API.
///
/// The Google Cloud project is read from the GOOGLE_CLOUD_PROJECT environment variable
/// and the Yahoo! application ID from YAHOO_APP_ID. An access token for Cloud Monitoring
/// may be set with GOOGLE_OAUTH_ACCESS_TOKEN, otherwise one is requested from the GCE
/// metadata server.
#[derive(Debug, Parser)]
#[clap(name = "nimbus", version = clap::crate_version!())]
struct NimbusApplication {
    /// Read the sensor and publish at this interval, in seconds
    #[arg(long, default_value_t = DEFAULT_REFRESH_SECS)]
    refresh_secs: u64,

    /// Logging verbosity. Allowed values are 'trace', 'debug', 'info', 'warn', and 'error'
    /// (case insensitive)
    #[arg(long, default_value_t = DEFAULT_LOG_LEVEL)]
    log_level: Level,

    /// I2C address of the BME680 sensor
    #[arg(long, value_enum, default_value_t = I2cAddress::Auto)]
    i2c_address: I2cAddress,

    /// Node ID of the generic_node resource metrics are attributed to. Defaults to
    /// the hostname of this machine
    #[arg(long)]
    node_id: Option<String>,

    /// Location of the generic_node resource metrics are attributed to
    #[arg(long, default_value = DEFAULT_LOCATION)]
    location: String,

    /// Namespace of the generic_node resource metrics are attributed to
    #[arg(long, default_value = DEFAULT_NAMESPACE)]
    namespace: String,

    /// Longitude of the place to fetch rainfall for
    #[arg(long, default_value_t = DEFAULT_LONGITUDE, allow_negative_numbers = true)]
    longitude: f64,

    /// Latitude of the place to fetch rainfall for
    #[arg(long, default_value_t = DEFAULT_LATITUDE, allow_negative_numbers = true)]
    latitude: f64,

    /// Address to expose Prometheus metrics about nimbus itself on, at the path
    /// /metrics. Not enabled by default
    #[arg(long)]
    bind: Option<SocketAddr>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let opts = NimbusApplication::parse();
    tracing::subscriber::set_global_default(
        tracing_subscriber::FmtSubscriber::builder()
            .with_max_level(opts.log_level)
            .finish(),
    )
    .expect("failed to set tracing subscriber");

    // Listen for signals before doing anything slow so an interrupt during
    // startup still results in a clean shutdown.
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    task::spawn(async move {
        // Wait for either SIGTERM or SIGINT to shutdown
        tokio::select! {
            _ = sigterm() => {}
            _ = sigint() => {}
        }

        tracing::info!(message = "received shutdown signal");
        let _ = shutdown_tx.send(true);
    });

    let credentials = Credentials::from_env().unwrap_or_else(|e| {
        tracing::error!(message = "invalid configuration", error = %e);
        process::exit(1)
    });

    let node_id = opts.node_id.clone().unwrap_or_else(|| {
        hostname().unwrap_or_else(|e| {
            tracing::error!(message = "unable to determine hostname", error = %e);
            process::exit(1)
        })
    });

    let collector = open_sensor(opts.i2c_address).unwrap_or_else(|e| {
        tracing::error!(
            message = "failed to initialize sensor",
            i2c_address = ?opts.i2c_address,
            error = %e,
        );
        process::exit(1)
    });

    let tokens = match credentials.access_token() {
        Some(token) => TokenSource::Static(token.to_owned()),
        None => TokenSource::metadata(reqwest::Client::new()),
    };

    let backend = MonitoringClient::new(DEFAULT_MONITORING_URL, tokens).unwrap_or_else(|e| {
        tracing::error!(message = "failed to create monitoring client", error = %e);
        process::exit(1)
    });

    let rainfall = RainfallClient::new(DEFAULT_WEATHER_URL, credentials.app_id().map(String::from))
        .unwrap_or_else(|e| {
            tracing::error!(message = "failed to create weather client", error = %e);
            process::exit(1)
        });

    let registry = prometheus::default_registry().clone();
    let metrics = AgentMetrics::new(&registry).unwrap_or_else(|e| {
        tracing::error!(message = "failed to register agent metrics", error = %e);
        process::exit(1)
    });

    if let Some(bind) = opts.bind {
        serve_metrics(bind, MetricsExposition::new(registry), shutdown_rx.clone());
    }

    let config = AgentConfig {
        interval: Duration::from_secs(opts.refresh_secs),
        coordinate: Coordinate::new(opts.longitude, opts.latitude),
        location: opts.location.clone(),
        namespace: opts.namespace.clone(),
    };

    let resource = ResourceIdentity::new(&config.location, &config.namespace, node_id);
    let publisher = PublishLoop::new(
        config,
        credentials.project_id(),
        resource,
        Arc::new(backend),
        Arc::new(rainfall),
        Arc::new(collector),
        metrics,
    );

    if let Err(e) = publisher.run(shutdown(shutdown_rx)).await {
        tracing::error!(message = "stopped publishing metrics", kind = e.as_label(), error = %e);
        process::exit(1)
    }

    tracing::info!(message = "shutdown");
    Ok(())
}

/// Open, configure, and start the sensor at the first address that responds
fn open_sensor(address: I2cAddress) -> Result<SampleCollector, nimbus::sensor::SensorError> {
    let mut sensor = Bme680Sensor::open(address.candidates())?;
    sensor.configure(&SensorSettings::default())?;
    sensor.power_on()?;
    Ok(SampleCollector::new(sensor))
}

fn hostname() -> Result<String, Box<dyn std::error::Error + Send + Sync>> {
    nix::unistd::gethostname()?
        .into_string()
        .map_err(|_| "hostname is not valid UTF-8".into())
}

/// Run an HTTP server exposing Prometheus metrics in the background until `shutdown` fires
fn serve_metrics(bind: SocketAddr, exposition: MetricsExposition, shutdown_rx: watch::Receiver<bool>) {
    let context = Arc::new(RequestContext::new(exposition));
    let service = make_service_fn(move |_| {
        let context = context.clone();

        async move {
            Ok::<_, hyper::Error>(service_fn(move |req| {
                http_route(req, context.clone()).instrument(tracing::span!(Level::DEBUG, "nimbus_request"))
            }))
        }
    });

    let server = Server::try_bind(&bind).unwrap_or_else(|e| {
        tracing::error!(message = "metrics server failed to start", address = %bind, error = %e);
        process::exit(1)
    });

    tracing::info!(message = "metrics server started", address = %bind);
    task::spawn(async move {
        if let Err(e) = server
            .serve(service)
            .with_graceful_shutdown(shutdown(shutdown_rx))
            .await
        {
            tracing::error!(message = "metrics server failed", error = %e);
        }
    });
}

/// Return once a shutdown signal has been received
async fn shutdown(mut rx: watch::Receiver<bool>) {
    while !*rx.borrow() {
        if rx.changed().await.is_err() {
            return;
        }
    }
}

/// Return after the first SIGTERM signal received by this process
async fn sigterm() -> io::Result<()> {
    unix::signal(SignalKind::terminate())?.recv().await;
    Ok(())
}

/// Return after the first SIGINT signal received by this process
async fn sigint() -> io::Result<()> {
    tokio::signal::ctrl_c().await
}
