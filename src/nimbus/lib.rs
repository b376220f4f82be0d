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

//! Publish BME680 environmental sensor readings to Google Cloud Monitoring.
//!
//! ## Features
//!
//! Nimbus reads temperature, pressure, humidity, and gas resistance from a
//! [BME680 sensor](https://www.bosch-sensortec.com/products/environmental-sensors/gas-sensors/bme680/)
//! connected over I2C and publishes the values as custom metrics in Google Cloud
//! Monitoring. Each point is labeled with the most recent observed rainfall for a
//! fixed location, fetched from the Yahoo! weather API. It is best run on a Raspberry
//! PI (3 or 4).
//!
//! The following custom metrics are registered and published every cycle:
//!
//! * `custom.googleapis.com/temperature` - Degrees celsius measured by the sensor.
//! * `custom.googleapis.com/pressure` - Barometric pressure in hectopascals.
//! * `custom.googleapis.com/humidity` - Relative humidity (from 0 to 100).
//! * `custom.googleapis.com/gas_resistance` - Gas resistance in ohms, an indicator of air quality.
//! * `custom.googleapis.com/gas_index` - Index of the heater profile used for the gas measurement.
//! * `custom.googleapis.com/meas_index` - Index of the measurement sequence.
//! * `custom.googleapis.com/heat_stable` - `1` if the gas heater reached a stable temperature.
//!
//! All metrics carry a `rainfall` label. A value of `-1` means no rainfall observation
//! was available for that cycle.
//!
//! ## Build
//!
//! `nimbus` is a Rust program and must be built from source using a [Rust toolchain](https://rustup.rs/)
//! . Since it's meant to be run on a Raspberry PI, you will also likely need to cross-compile it.
//!
//! ```text
//! rustup target add armv7-unknown-linux-musleabihf
//! cargo build --release --target armv7-unknown-linux-musleabihf
//! ```
//!
//! ## Run
//!
//! `nimbus` needs access to `/dev/i2c-1` and the following environment variables:
//!
//! * `GOOGLE_CLOUD_PROJECT` - ID of the project metrics are published to (required).
//! * `YAHOO_APP_ID` - Yahoo! developer application ID used to fetch rainfall (required).
//! * `GOOGLE_OAUTH_ACCESS_TOKEN` - Access token for Cloud Monitoring. When not set, a token
//!   is requested from the GCE metadata server.
//!
//! ```text
//! GOOGLE_CLOUD_PROJECT=my-project YAHOO_APP_ID=xyz nimbus --log-level debug
//! ```
//!
//! Readings are taken and published every `10s` by default. Send `SIGINT` or `SIGTERM`
//! to stop publishing.
//!

pub mod catalog;
pub mod collector;
pub mod config;
pub mod http;
pub mod metrics;
pub mod monitoring;
pub mod publish;
pub mod rainfall;
pub mod registrar;
pub mod sensor;
pub mod series;
