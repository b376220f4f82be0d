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

use crate::config::{ConfigError, Coordinate};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use std::error::Error;
use std::fmt::{self, Formatter};
use std::time::Duration;

const OBSERVATION: &str = "observation";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Observed rainfall, in millimeters per hour, or unknown.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(transparent)]
pub struct Rainfall(i64);

impl Rainfall {
    /// Marker for "no observation available", distinct from zero rainfall.
    pub const UNKNOWN: Rainfall = Rainfall(-1);

    pub fn is_unknown(&self) -> bool {
        *self == Self::UNKNOWN
    }
}

impl From<i64> for Rainfall {
    fn from(v: i64) -> Self {
        Self(v)
    }
}

impl From<Rainfall> for i64 {
    fn from(v: Rainfall) -> Self {
        v.0
    }
}

impl fmt::Display for Rainfall {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Potential kinds of errors that can be encountered fetching rainfall
#[derive(PartialEq, Eq, Debug, Hash, Clone, Copy)]
pub enum RainfallErrorKind {
    Configuration,
    Network,
    Status,
    Parse,
}

impl RainfallErrorKind {
    pub fn as_label(&self) -> &'static str {
        match self {
            RainfallErrorKind::Configuration => "configuration",
            RainfallErrorKind::Network => "network",
            RainfallErrorKind::Status => "status",
            RainfallErrorKind::Parse => "parse",
        }
    }
}

/// Error fetching or parsing a rainfall observation from the weather API
#[derive(Debug)]
pub enum RainfallError {
    Config(ConfigError),
    Status(u16),
    KindMsg(RainfallErrorKind, &'static str),
    KindMsgCause(RainfallErrorKind, &'static str, Box<dyn Error + Send + Sync>),
}

impl RainfallError {
    pub fn kind(&self) -> RainfallErrorKind {
        match self {
            RainfallError::Config(_) => RainfallErrorKind::Configuration,
            RainfallError::Status(_) => RainfallErrorKind::Status,
            RainfallError::KindMsg(kind, _) => *kind,
            RainfallError::KindMsgCause(kind, _, _) => *kind,
        }
    }
}

impl fmt::Display for RainfallError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            RainfallError::Config(e) => e.fmt(f),
            RainfallError::Status(status) => write!(f, "weather API responded with HTTP {}", status),
            RainfallError::KindMsg(_, msg) => msg.fmt(f),
            RainfallError::KindMsgCause(_, msg, ref e) => write!(f, "{}: {}", msg, e),
        }
    }
}

impl Error for RainfallError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            RainfallError::Config(e) => Some(e),
            RainfallError::KindMsgCause(_, _, ref e) => Some(e.as_ref()),
            _ => None,
        }
    }
}

/// Source of the most recent rainfall observation for a place.
#[async_trait]
pub trait RainfallSource: Send + Sync {
    /// Fetch observed rainfall at `coordinate`, returning `Rainfall::UNKNOWN` when
    /// the provider has no observation for it.
    async fn fetch_rainfall(&self, coordinate: Coordinate) -> Result<Rainfall, RainfallError>;
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct PlaceResponse {
    #[serde(default)]
    feature: Vec<Feature>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct Feature {
    property: Property,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct Property {
    weather_list: WeatherList,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct WeatherList {
    #[serde(default)]
    weather: Vec<Weather>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct Weather {
    #[serde(rename = "Type")]
    kind: String,
    #[serde(default)]
    rainfall: Value,
}

/// Parse the body of a weather API `place` response and extract observed rainfall.
///
/// Only the first feature is consulted. If it has no entry of type `observation`
/// (or there are no features at all) `Rainfall::UNKNOWN` is returned.
pub fn parse_rainfall(body: &[u8]) -> Result<Rainfall, RainfallError> {
    let res: PlaceResponse = serde_json::from_slice(body).map_err(|e| {
        RainfallError::KindMsgCause(RainfallErrorKind::Parse, "unable to parse weather response", Box::new(e))
    })?;

    let observation = res
        .feature
        .first()
        .and_then(|f| f.property.weather_list.weather.iter().find(|w| w.kind == OBSERVATION));

    match observation {
        Some(w) => rainfall_value(&w.rainfall),
        None => Ok(Rainfall::UNKNOWN),
    }
}

/// Convert a rainfall amount that may be a JSON number or a numeric string into an
/// integer, truncating any fractional part.
fn rainfall_value(v: &Value) -> Result<Rainfall, RainfallError> {
    let parsed = match v {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f.trunc() as i64)),
        Value::String(s) => {
            let s = s.trim();
            s.parse::<i64>()
                .ok()
                .or_else(|| s.parse::<f64>().ok().filter(|f| f.is_finite()).map(|f| f.trunc() as i64))
        }
        _ => None,
    };

    parsed
        .map(Rainfall::from)
        .ok_or(RainfallError::KindMsg(RainfallErrorKind::Parse, "rainfall amount is not a number"))
}

/// Client for the Yahoo! weather `place` API.
#[derive(Debug)]
pub struct RainfallClient {
    http: reqwest::Client,
    base_url: String,
    app_id: Option<String>,
}

impl RainfallClient {
    /// Create a new client. A missing application ID is not an error until rainfall
    /// is fetched.
    pub fn new<S: Into<String>>(base_url: S, app_id: Option<String>) -> Result<Self, RainfallError> {
        let http = reqwest::Client::builder().timeout(REQUEST_TIMEOUT).build().map_err(|e| {
            RainfallError::KindMsgCause(RainfallErrorKind::Network, "unable to create HTTP client", Box::new(e))
        })?;

        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_owned(),
            app_id,
        })
    }
}

#[async_trait]
impl RainfallSource for RainfallClient {
    async fn fetch_rainfall(&self, coordinate: Coordinate) -> Result<Rainfall, RainfallError> {
        let app_id = self
            .app_id
            .as_deref()
            .ok_or(RainfallError::Config(ConfigError::MissingAppId))?;

        let url = format!("{}/place", self.base_url);
        let coordinates = coordinate.to_string();
        tracing::debug!(message = "fetching rainfall", url = %url, coordinates = %coordinates);

        let res = self
            .http
            .get(&url)
            .query(&[("coordinates", coordinates.as_str()), ("appid", app_id), ("output", "json")])
            .send()
            .await
            .map_err(|e| {
                RainfallError::KindMsgCause(RainfallErrorKind::Network, "unable to send weather request", Box::new(e))
            })?;

        let status = res.status();
        if !status.is_success() {
            return Err(RainfallError::Status(status.as_u16()));
        }

        let body = res.bytes().await.map_err(|e| {
            RainfallError::KindMsgCause(RainfallErrorKind::Network, "unable to read weather response", Box::new(e))
        })?;

        parse_rainfall(&body)
    }
}
