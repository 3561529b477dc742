use std::time::Duration;

const DEFAULT_API_URL: &str = "http://localhost:8000/api/v1";

/// Timeout for plain REST calls (login, tables, one-shot searches).
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Wall-clock budget for a broad search streaming across every table. Always
/// longer than the direct budget.
pub const DEFAULT_BROAD_SEARCH_TIMEOUT: Duration = Duration::from_secs(300);

/// Wall-clock budget for a direct search against the priority table.
pub const DEFAULT_DIRECT_SEARCH_TIMEOUT: Duration = Duration::from_secs(120);

/// Longest a single read on a search stream may block. Bounds how long the
/// stream stays open after its search settles, and how long the server may
/// take to answer the request.
pub const DEFAULT_STREAM_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Connection settings shared by the REST client and the streaming consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiConfig {
    pub base_url: String,
    pub request_timeout: Duration,
    pub broad_search_timeout: Duration,
    pub direct_search_timeout: Duration,
    pub stream_poll_interval: Duration,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_API_URL.to_string(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            broad_search_timeout: DEFAULT_BROAD_SEARCH_TIMEOUT,
            direct_search_timeout: DEFAULT_DIRECT_SEARCH_TIMEOUT,
            stream_poll_interval: DEFAULT_STREAM_POLL_INTERVAL,
        }
    }
}

impl ApiConfig {
    /// Reads `DBSEE_API_URL`, `DBSEE_BROAD_TIMEOUT_SECS`, `DBSEE_DIRECT_TIMEOUT_SECS`
    /// and `DBSEE_STREAM_POLL_SECS`.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(url) = lookup("DBSEE_API_URL").filter(|url| !url.trim().is_empty()) {
            config.base_url = url.trim().trim_end_matches('/').to_string();
        }
        if let Some(timeout) = seconds(&lookup, "DBSEE_BROAD_TIMEOUT_SECS") {
            config.broad_search_timeout = timeout;
        }
        if let Some(timeout) = seconds(&lookup, "DBSEE_DIRECT_TIMEOUT_SECS") {
            config.direct_search_timeout = timeout;
        }
        if let Some(interval) = seconds(&lookup, "DBSEE_STREAM_POLL_SECS") {
            config.stream_poll_interval = interval;
        }

        log::debug!("Using API base URL {}", config.base_url);
        config
    }

    pub fn endpoint(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.base_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }
}

fn seconds(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<Duration> {
    let raw = lookup(key)?;
    match raw.trim().parse::<u64>() {
        Ok(secs) if secs > 0 => Some(Duration::from_secs(secs)),
        _ => {
            log::warn!("Ignoring invalid {}={:?}, expected a positive number of seconds", key, raw);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| vars.get(key).cloned()
    }

    #[test]
    fn defaults_without_environment() {
        let config = ApiConfig::from_lookup(lookup(&[]));
        assert_eq!(config, ApiConfig::default());
        assert_eq!(config.broad_search_timeout, Duration::from_secs(300));
        assert_eq!(config.direct_search_timeout, Duration::from_secs(120));
        assert_eq!(config.stream_poll_interval, Duration::from_secs(5));
    }

    #[test]
    fn broad_search_gets_the_longer_budget() {
        let config = ApiConfig::default();
        assert!(config.broad_search_timeout > config.direct_search_timeout);
    }

    #[test]
    fn overrides_from_environment() {
        let config = ApiConfig::from_lookup(lookup(&[
            ("DBSEE_API_URL", "https://dbsee.example.org/api/v1/"),
            ("DBSEE_BROAD_TIMEOUT_SECS", "15"),
            ("DBSEE_DIRECT_TIMEOUT_SECS", "not-a-number"),
            ("DBSEE_STREAM_POLL_SECS", "1"),
        ]));
        assert_eq!(config.base_url, "https://dbsee.example.org/api/v1");
        assert_eq!(config.broad_search_timeout, Duration::from_secs(15));
        assert_eq!(config.direct_search_timeout, DEFAULT_DIRECT_SEARCH_TIMEOUT);
        assert_eq!(config.stream_poll_interval, Duration::from_secs(1));
    }

    #[test]
    fn endpoint_joins_without_double_slashes() {
        let config = ApiConfig {
            base_url: "http://localhost:8000/api/v1/".to_string(),
            ..Default::default()
        };
        assert_eq!(
            config.endpoint("/tables/"),
            "http://localhost:8000/api/v1/tables/"
        );
        assert_eq!(
            config.endpoint("search/cig"),
            "http://localhost:8000/api/v1/search/cig"
        );
    }
}
