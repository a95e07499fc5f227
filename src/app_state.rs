use crate::config::ServerSettings;
use crate::error::Error;
use std::time::Duration;

const UPSTREAM_TIMEOUT: Duration = Duration::from_secs(10);

/// What the nostr.json proxy needs per request.
#[derive(Debug)]
pub struct HttpServerState {
    pub http: reqwest::Client,
    pub nip05_upstream: String,
    pub cache_max_age: Duration,
}

impl HttpServerState {
    pub fn new(settings: &ServerSettings) -> Result<Self, Error> {
        let http = reqwest::Client::builder()
            .timeout(UPSTREAM_TIMEOUT)
            .build()?;
        Ok(Self {
            http,
            nip05_upstream: settings.nip05_upstream.clone(),
            cache_max_age: settings.cache_max_age,
        })
    }

    /// Upstream URL carrying the caller's query string.
    pub fn upstream_url(&self, query: Option<&str>) -> String {
        match query.filter(|query| !query.is_empty()) {
            Some(query) => format!("{}?{}", self.nip05_upstream, query),
            None => self.nip05_upstream.clone(),
        }
    }

    pub fn cache_control(&self) -> String {
        format!("public, max-age={}", self.cache_max_age.as_secs())
    }
}
