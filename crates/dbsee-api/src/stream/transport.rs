use reqwest::StatusCode;
use reqwest::blocking::{Client, Response};
use std::io::{self, BufRead, BufReader, Read};
use std::time::Duration;
use url::Url;

use super::error::StreamError;
use super::event::SearchRequest;
use crate::config::ApiConfig;

/// Opens the push channel for one search. The returned reader yields the raw
/// event-stream body; dropping it closes the connection.
///
/// A read that waits too long should fail with `ErrorKind::TimedOut` (or
/// `WouldBlock`) instead of blocking indefinitely. The consumer retries such
/// reads while the search is live and drops the body once it settles, so the
/// read bound is how long a quiet channel outlives its search.
pub trait Transport: Send + Sync {
    fn open(
        &self,
        endpoint: &str,
        request: &SearchRequest,
        credential: &str,
    ) -> Result<Box<dyn BufRead + Send>, StreamError>;
}

/// Event-stream transport over HTTP.
///
/// The credential travels as an `authorization` query parameter, the only
/// place the search stream endpoints look for it.
pub struct HttpTransport {
    client: Client,
    config: ApiConfig,
}

impl HttpTransport {
    pub fn new(config: ApiConfig) -> anyhow::Result<Self> {
        let user_agent = format!("dbsee/{}", env!("CARGO_PKG_VERSION"));
        let client = Client::builder()
            .user_agent(user_agent)
            .connect_timeout(Duration::from_secs(10))
            // Bounds each body read, not the whole stream. The consumer owns
            // the per-variant budget.
            .timeout(config.stream_poll_interval)
            .build()?;
        Ok(Self { client, config })
    }

    pub fn stream_url(
        &self,
        endpoint: &str,
        request: &SearchRequest,
        credential: &str,
    ) -> Result<Url, StreamError> {
        stream_url(&self.config, endpoint, request, credential)
    }
}

pub fn stream_url(
    config: &ApiConfig,
    endpoint: &str,
    request: &SearchRequest,
    credential: &str,
) -> Result<Url, StreamError> {
    let mut url = Url::parse(&config.endpoint(&format!("search/{}", endpoint)))
        .map_err(|e| StreamError::Transport(format!("invalid API URL: {}", e)))?;
    {
        let mut query = url.query_pairs_mut();
        query.append_pair("company_name", request.query());
        if let Some(year) = request.year_filter() {
            query.append_pair("year_filter", &year.to_string());
        }
        query.append_pair("authorization", &format!("Bearer {}", credential));
    }
    Ok(url)
}

impl Transport for HttpTransport {
    fn open(
        &self,
        endpoint: &str,
        request: &SearchRequest,
        credential: &str,
    ) -> Result<Box<dyn BufRead + Send>, StreamError> {
        let url = self.stream_url(endpoint, request, credential)?;
        log::debug!("Opening event stream at {}/search/{}", self.config.base_url, endpoint);

        let response = self
            .client
            .get(url)
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .send()
            .map_err(|e| StreamError::Transport(e.to_string()))?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(StreamError::AuthError(format!(
                "server rejected the credential ({})",
                status
            )));
        }
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            return Err(StreamError::Transport(format!(
                "unexpected status {}: {}",
                status, body
            )));
        }

        Ok(Box::new(BufReader::new(EventBody(response))))
    }
}

/// Response body whose read timeouts surface as `ErrorKind::TimedOut`.
struct EventBody(Response);

impl Read for EventBody {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.0.read(buf).map_err(|e| {
            if is_read_timeout(&e) {
                io::Error::new(io::ErrorKind::TimedOut, e)
            } else {
                e
            }
        })
    }
}

fn is_read_timeout(error: &io::Error) -> bool {
    error.kind() == io::ErrorKind::TimedOut
        || error
            .get_ref()
            .and_then(|inner| inner.downcast_ref::<reqwest::Error>())
            .is_some_and(reqwest::Error::is_timeout)
}
