//! ia-cloud one-shot transport.
//!
//! Implements the [`protocol::Transport`] trait over HTTPS: every logical
//! request is one `POST` of the serialized body to the service URL, and the
//! response body is parsed as one [`protocol::Response`]. There is no
//! correlation and no retry here; the orchestrator owns retry.
//!
//! ## Architectural Layer
//!
//! **Infrastructure.** HTTP client construction, proxy and redirect policy,
//! basic authentication and mapping of `reqwest` failures onto
//! [`protocol::IaCloudError`] all live here. The orchestrator sees only
//! [`protocol::Transport`].
//!
//! ## Error mapping
//!
//! | Failure | Error kind |
//! |---------|------------|
//! | connect / DNS / socket timeout | `LowerProtocol` |
//! | non-2xx HTTP status | `LowerProtocol` |
//! | body is not a JSON object | `JsonParse` |

use std::sync::RwLock;
use std::time::Duration;

use async_trait::async_trait;
use protocol::{
    serialize_request, ConnectionInfo, Credentials, IaCloudError, RequestBody, Response, Transport,
};
use reqwest::header::CONTENT_TYPE;
use thiserror::Error;
use tracing::{debug, instrument, warn};

/// Redirect limit carried over from the host's HTTP defaults.
pub const MAX_REDIRECTS: usize = 21;

/// Failures while building the HTTP client.
#[derive(Debug, Error)]
pub enum RestBuildError {
    /// The configured proxy URL could not be parsed.
    #[error("Invalid proxy '{proxy}'")]
    InvalidProxy {
        proxy: String,
        #[source]
        source: reqwest::Error,
    },

    /// The HTTP client could not be constructed (e.g. TLS backend failure).
    #[error("Cannot build HTTP client")]
    Client(#[source] reqwest::Error),
}

/// Settings for [`RestTransport`].
#[derive(Debug, Clone, PartialEq)]
pub struct RestConfig {
    pub url: String,
    pub request_timeout: Duration,
    pub proxy: Option<String>,
}

impl RestConfig {
    /// Derives the transport settings from persisted connection state.
    pub fn from_connection_info(info: &ConnectionInfo) -> Self {
        Self {
            url: info.url().to_owned(),
            request_timeout: info.request_timeout(),
            proxy: info.proxy().map(str::to_owned),
        }
    }
}

/// One-shot HTTPS [`Transport`].
pub struct RestTransport {
    client: reqwest::Client,
    url: String,
    credentials: RwLock<Option<Credentials>>,
}

impl RestTransport {
    pub fn new(config: RestConfig) -> Result<Self, RestBuildError> {
        let mut builder = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .redirect(reqwest::redirect::Policy::limited(MAX_REDIRECTS));
        if let Some(proxy) = &config.proxy {
            let https = reqwest::Proxy::https(proxy).map_err(|source| RestBuildError::InvalidProxy {
                proxy: proxy.clone(),
                source,
            })?;
            builder = builder.proxy(https);
        }
        let client = builder.build().map_err(RestBuildError::Client)?;
        Ok(Self {
            client,
            url: config.url,
            credentials: RwLock::new(None),
        })
    }

    /// Creates a transport that authenticates every request with `credentials`.
    pub fn with_credentials(
        config: RestConfig,
        credentials: Credentials,
    ) -> Result<Self, RestBuildError> {
        let transport = Self::new(config)?;
        transport.set_credentials(&credentials);
        Ok(transport)
    }

    fn credentials(&self) -> Option<Credentials> {
        self.credentials
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl Transport for RestTransport {
    #[instrument(skip_all, fields(url = %self.url, request = ?body.get("request")))]
    async fn send(
        &self,
        body: &RequestBody,
        attachment: Option<&[u8]>,
    ) -> Result<Response, IaCloudError> {
        let payload = serialize_request(body, attachment)?;
        let mut request = self
            .client
            .post(&self.url)
            .header(CONTENT_TYPE, "application/json")
            .body(payload);
        if let Some(credentials) = self.credentials() {
            request = request.basic_auth(&credentials.username, Some(&credentials.password));
        }

        let response = request.send().await.map_err(map_reqwest_error)?;
        let status = response.status();
        if !status.is_success() {
            warn!(%status, "service answered with a non-success status");
            return Err(IaCloudError::lower(format!("HTTP status {status}")));
        }
        let bytes = response.bytes().await.map_err(map_reqwest_error)?;
        debug!(len = bytes.len(), "response received");
        Response::from_slice(&bytes)
    }

    async fn close(&self) -> Result<(), IaCloudError> {
        // Nothing is held open between calls.
        Ok(())
    }

    fn set_credentials(&self, credentials: &Credentials) {
        *self
            .credentials
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = Some(credentials.clone());
    }
}

fn map_reqwest_error(err: reqwest::Error) -> IaCloudError {
    let message = if err.is_timeout() {
        "request timed out"
    } else if err.is_connect() {
        "cannot connect to service"
    } else if err.is_redirect() {
        "too many redirects"
    } else {
        "HTTP exchange failed"
    };
    warn!(error = %err, "{message}");
    IaCloudError::lower_with(message, err)
}
