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

use crate::monitoring::client::{BackendError, BackendErrorKind};
use serde::Deserialize;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

pub const METADATA_TOKEN_URL: &str =
    "http://metadata.google.internal/computeMetadata/v1/instance/service-accounts/default/token";

const METADATA_FLAVOR_HEADER: &str = "Metadata-Flavor";
const METADATA_FLAVOR: &str = "Google";

// Refresh tokens this long before they actually expire
const EXPIRY_MARGIN: Duration = Duration::from_secs(60);

/// Longest time to wait for the metadata server to return a token.
pub const METADATA_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Deserialize)]
struct MetadataToken {
    access_token: String,
    expires_in: u64,
}

/// Token obtained from the metadata server and when it must be refreshed.
#[derive(Debug, Clone)]
pub struct CachedToken {
    value: String,
    refresh_at: Instant,
}

impl CachedToken {
    fn new(token: MetadataToken, now: Instant) -> Self {
        let lifetime = Duration::from_secs(token.expires_in).saturating_sub(EXPIRY_MARGIN);
        Self {
            value: token.access_token,
            refresh_at: now + lifetime,
        }
    }

    fn is_fresh(&self, now: Instant) -> bool {
        now < self.refresh_at
    }
}

/// Source of OAuth2 bearer tokens for requests to the monitoring API.
#[derive(Debug)]
pub enum TokenSource {
    /// A token supplied by the operator, used as-is for every request.
    Static(String),
    /// Tokens for the default service account from the GCE metadata server,
    /// cached until shortly before they expire.
    Metadata {
        http: reqwest::Client,
        url: String,
        timeout: Duration,
        cached: Mutex<Option<CachedToken>>,
    },
}

impl TokenSource {
    pub fn metadata(http: reqwest::Client) -> Self {
        Self::metadata_with_url(http, METADATA_TOKEN_URL, METADATA_TIMEOUT)
    }

    /// Request tokens from `url`, failing any request that takes longer than `timeout`.
    pub fn metadata_with_url<S: Into<String>>(http: reqwest::Client, url: S, timeout: Duration) -> Self {
        TokenSource::Metadata {
            http,
            url: url.into(),
            timeout,
            cached: Mutex::new(None),
        }
    }

    /// Get a token to use for the next request.
    pub async fn token(&self) -> Result<String, BackendError> {
        match self {
            TokenSource::Static(token) => Ok(token.clone()),
            TokenSource::Metadata {
                http,
                url,
                timeout,
                cached,
            } => {
                let mut cached = cached.lock().await;
                let now = Instant::now();

                if let Some(token) = cached.as_ref().filter(|t| t.is_fresh(now)) {
                    return Ok(token.value.clone());
                }

                let token = Self::fetch_metadata_token(http, url, *timeout).await?;
                tracing::debug!(message = "fetched access token from metadata server", expires_in = token.expires_in);

                let fresh = CachedToken::new(token, now);
                let value = fresh.value.clone();
                *cached = Some(fresh);
                Ok(value)
            }
        }
    }

    async fn fetch_metadata_token(
        http: &reqwest::Client,
        url: &str,
        timeout: Duration,
    ) -> Result<MetadataToken, BackendError> {
        let res = http
            .get(url)
            .header(METADATA_FLAVOR_HEADER, METADATA_FLAVOR)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| {
                BackendError::KindMsgCause(
                    BackendErrorKind::Authentication,
                    "unable to request token from metadata server",
                    Box::new(e),
                )
            })?;

        let status = res.status();
        if !status.is_success() {
            return Err(BackendError::KindMsg(
                BackendErrorKind::Authentication,
                "metadata server refused token request",
            ));
        }

        res.json::<MetadataToken>().await.map_err(|e| {
            BackendError::KindMsgCause(
                BackendErrorKind::Authentication,
                "unable to parse token from metadata server",
                Box::new(e),
            )
        })
    }
}

#[cfg(test)]
mod test {
    use super::{CachedToken, MetadataToken, TokenSource, METADATA_TIMEOUT};
    use crate::monitoring::client::BackendErrorKind;
    use crate::test::{serve_fixed, serve_silent};
    use hyper::StatusCode;
    use std::time::{Duration, Instant};

    #[tokio::test]
    async fn test_static_token() {
        let source = TokenSource::Static("ya29.abc".to_owned());
        assert_eq!("ya29.abc", source.token().await.unwrap());
    }

    #[tokio::test]
    async fn test_metadata_token_unreachable() {
        let source = TokenSource::metadata_with_url(reqwest::Client::new(), "http://127.0.0.1:1/token", METADATA_TIMEOUT);
        let res = source.token().await;

        assert_eq!(BackendErrorKind::Authentication, res.unwrap_err().kind());
    }

    #[tokio::test]
    async fn test_metadata_token_server_never_responds() {
        let addr = serve_silent().await;
        let source = TokenSource::metadata_with_url(
            reqwest::Client::new(),
            format!("http://{}/token", addr),
            Duration::from_millis(100),
        );

        let res = tokio::time::timeout(Duration::from_secs(5), source.token())
            .await
            .expect("token request should time out on its own");

        assert_eq!(BackendErrorKind::Authentication, res.unwrap_err().kind());
    }

    #[tokio::test]
    async fn test_metadata_token_cached() {
        let body = r#"{"access_token":"ya29.xyz","expires_in":3599,"token_type":"Bearer"}"#;
        let addr = serve_fixed("/token", StatusCode::OK, body).await;
        let source = TokenSource::metadata_with_url(
            reqwest::Client::new(),
            format!("http://{}/token", addr),
            METADATA_TIMEOUT,
        );

        assert_eq!("ya29.xyz", source.token().await.unwrap());
        assert_eq!("ya29.xyz", source.token().await.unwrap());
    }

    #[test]
    fn test_metadata_token_parse() {
        let body = r#"{"access_token":"ya29.xyz","expires_in":3599,"token_type":"Bearer"}"#;
        let token: MetadataToken = serde_json::from_str(body).unwrap();

        assert_eq!("ya29.xyz", token.access_token);
        assert_eq!(3599, token.expires_in);
    }

    #[test]
    fn test_cached_token_expiry() {
        let now = Instant::now();
        let token = CachedToken::new(
            MetadataToken {
                access_token: "ya29.xyz".to_owned(),
                expires_in: 120,
            },
            now,
        );

        assert!(token.is_fresh(now));
        assert!(token.is_fresh(now + Duration::from_secs(59)));
        assert!(!token.is_fresh(now + Duration::from_secs(60)));
    }

    #[test]
    fn test_cached_token_short_lived() {
        let now = Instant::now();
        let token = CachedToken::new(
            MetadataToken {
                access_token: "ya29.xyz".to_owned(),
                expires_in: 30,
            },
            now,
        );

        assert!(!token.is_fresh(now));
    }
}
