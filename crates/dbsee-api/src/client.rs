use anyhow::{Context, Result};
use reqwest::StatusCode;
use reqwest::blocking::{Client, RequestBuilder, Response};
use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;

use crate::auth::TokenStore;
use crate::config::ApiConfig;

/// Non-success answers from the REST API.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Session expired. Please login again with `dbsee auth login`.")]
    Unauthorized,

    #[error("Access denied. Please check your permissions or login again.")]
    Forbidden,

    #[error("Server error ({status}): {detail}")]
    Server { status: StatusCode, detail: String },

    #[error("Request failed ({status}): {detail}")]
    Request { status: StatusCode, detail: String },
}

impl ApiError {
    pub fn from_status(status: StatusCode, body: &str) -> Self {
        let detail = serde_json::from_str::<serde_json::Value>(body)
            .ok()
            .and_then(|value| value.get("detail").and_then(|d| d.as_str()).map(str::to_owned))
            .unwrap_or_else(|| {
                if body.trim().is_empty() {
                    status
                        .canonical_reason()
                        .unwrap_or("An error occurred")
                        .to_string()
                } else {
                    body.trim().to_string()
                }
            });

        match status {
            StatusCode::UNAUTHORIZED => Self::Unauthorized,
            StatusCode::FORBIDDEN => Self::Forbidden,
            s if s.is_server_error() => Self::Server { status, detail },
            _ => Self::Request { status, detail },
        }
    }
}

/// Authenticated REST client. The bearer token is read from the store on
/// every request, and a 401 answer clears it.
pub struct ApiClient {
    http: Client,
    config: ApiConfig,
    store: TokenStore,
}

impl ApiClient {
    pub fn new(config: ApiConfig, store: TokenStore) -> Result<Self> {
        let user_agent = format!("dbsee/{}", env!("CARGO_PKG_VERSION"));
        let http = Client::builder()
            .user_agent(user_agent)
            .timeout(config.request_timeout)
            .build()
            .context("Failed to create HTTP client")?;
        Ok(Self {
            http,
            config,
            store,
        })
    }

    pub fn config(&self) -> &ApiConfig {
        &self.config
    }

    pub fn store(&self) -> &TokenStore {
        &self.store
    }

    pub(crate) fn get<T: DeserializeOwned>(&self, path: &str, what: &str) -> Result<T> {
        let request = self.http.get(self.config.endpoint(path));
        self.execute(request, what)
    }

    pub(crate) fn get_with_query<T, Q>(&self, path: &str, query: &Q, what: &str) -> Result<T>
    where
        T: DeserializeOwned,
        Q: Serialize + ?Sized,
    {
        let request = self.http.get(self.config.endpoint(path)).query(query);
        self.execute(request, what)
    }

    pub(crate) fn post<T, B>(&self, path: &str, body: &B, what: &str) -> Result<T>
    where
        T: DeserializeOwned,
        B: Serialize + ?Sized,
    {
        let request = self.http.post(self.config.endpoint(path)).json(body);
        self.execute(request, what)
    }

    /// POST without a body whose answer is not needed.
    pub(crate) fn post_empty(&self, path: &str, what: &str) -> Result<()> {
        let request = self.http.post(self.config.endpoint(path));
        let response = self.send(request, what)?;
        self.ensure_success(response)?;
        Ok(())
    }

    fn execute<T: DeserializeOwned>(&self, request: RequestBuilder, what: &str) -> Result<T> {
        let response = self.send(request, what)?;
        let response = self.ensure_success(response)?;
        response
            .json()
            .with_context(|| format!("Failed to parse {} response", what))
    }

    fn send(&self, request: RequestBuilder, what: &str) -> Result<Response> {
        let request = match self.store.token()? {
            Some(token) => request.bearer_auth(token),
            None => request,
        };
        log::debug!("Sending {} request", what);
        request.send().map_err(|e| {
            if e.is_timeout() {
                anyhow::anyhow!("Request timeout. The {} is taking too long. Please try again.", what)
            } else if e.is_connect() {
                anyhow::anyhow!(
                    "Network error. Please check your connection and ensure the backend at {} is running.",
                    self.config.base_url
                )
            } else {
                anyhow::Error::new(e).context(format!("Failed to send {} request", what))
            }
        })
    }

    fn ensure_success(&self, response: Response) -> Result<Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().unwrap_or_default();
        let error = ApiError::from_status(status, &body);
        if matches!(error, ApiError::Unauthorized) {
            log::info!("Server answered 401, clearing stored token");
            self.store.clear()?;
        }
        Err(error.into())
    }
}
