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

use std::env;
use std::error::Error;
use std::fmt::{self, Formatter};
use std::time::Duration;

pub const PROJECT_ID_ENV: &str = "GOOGLE_CLOUD_PROJECT";
pub const APP_ID_ENV: &str = "YAHOO_APP_ID";
pub const ACCESS_TOKEN_ENV: &str = "GOOGLE_OAUTH_ACCESS_TOKEN";

pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(10);
pub const DEFAULT_LONGITUDE: f64 = 139.7041;
pub const DEFAULT_LATITUDE: f64 = 35.6618;
pub const DEFAULT_LOCATION: &str = "asia-northeast1-a";
pub const DEFAULT_NAMESPACE: &str = "ymotongpoo";
pub const DEFAULT_WEATHER_URL: &str = "https://map.yahooapis.jp/weather/V1";
pub const DEFAULT_MONITORING_URL: &str = "https://monitoring.googleapis.com/v3";

/// Longitude and latitude, in decimal degrees, of the place to fetch rainfall for.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Coordinate {
    pub longitude: f64,
    pub latitude: f64,
}

impl Coordinate {
    pub fn new(longitude: f64, latitude: f64) -> Self {
        Self { longitude, latitude }
    }
}

impl Default for Coordinate {
    fn default() -> Self {
        Self::new(DEFAULT_LONGITUDE, DEFAULT_LATITUDE)
    }
}

impl fmt::Display for Coordinate {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{},{}", self.longitude, self.latitude)
    }
}

/// Settings of the publish loop that stay the same for the lifetime of the process.
#[derive(Debug, Clone, PartialEq)]
pub struct AgentConfig {
    /// Pause between the end of one cycle and the start of the next.
    pub interval: Duration,
    pub coordinate: Coordinate,
    /// `location` label of the `generic_node` resource.
    pub location: String,
    /// `namespace` label of the `generic_node` resource.
    pub namespace: String,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            interval: DEFAULT_INTERVAL,
            coordinate: Coordinate::default(),
            location: DEFAULT_LOCATION.to_owned(),
            namespace: DEFAULT_NAMESPACE.to_owned(),
        }
    }
}

/// Error resolving required configuration from the environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    MissingProjectId,
    MissingAppId,
}

impl ConfigError {
    pub fn as_label(&self) -> &'static str {
        match self {
            ConfigError::MissingProjectId => "missing_project_id",
            ConfigError::MissingAppId => "missing_app_id",
        }
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::MissingProjectId => write!(
                f,
                "set the environment variable {} to your Google Cloud project ID",
                PROJECT_ID_ENV
            ),
            ConfigError::MissingAppId => write!(
                f,
                "set the environment variable {} to your Yahoo! application ID",
                APP_ID_ENV
            ),
        }
    }
}

impl Error for ConfigError {}

/// Credentials and identifiers read from the environment once at startup.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    project_id: String,
    app_id: Option<String>,
    access_token: Option<String>,
}

impl Credentials {
    /// Resolve credentials from environment variables of this process.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|k| env::var(k).ok())
    }

    /// Resolve credentials using `lookup` to get the value of each variable.
    ///
    /// The project ID is required and an error is returned if it is missing or
    /// empty. The application ID for rainfall is optional here since its absence
    /// is only reported when rainfall is fetched.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |k: &str| lookup(k).filter(|v| !v.trim().is_empty());
        let project_id = non_empty(PROJECT_ID_ENV).ok_or(ConfigError::MissingProjectId)?;

        Ok(Self {
            project_id,
            app_id: non_empty(APP_ID_ENV),
            access_token: non_empty(ACCESS_TOKEN_ENV),
        })
    }

    pub fn project_id(&self) -> &str {
        &self.project_id
    }

    pub fn app_id(&self) -> Option<&str> {
        self.app_id.as_deref()
    }

    pub fn access_token(&self) -> Option<&str> {
        self.access_token.as_deref()
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        // Avoid leaking secrets into logs
        f.debug_struct("Credentials")
            .field("project_id", &self.project_id)
            .field("app_id", &self.app_id.as_ref().map(|_| "<redacted>"))
            .field("access_token", &self.access_token.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Project resource name used by the monitoring API, `projects/<project-id>`.
pub fn project_path(project_id: &str) -> String {
    format!("projects/{}", project_id)
}
