use log::{debug, error};
use reqwest::{Client, StatusCode};
use serde_yaml::{Mapping, Value};
use std::time::Duration;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

const USER_AGENT: &str = concat!("talkproxy/", env!("CARGO_PKG_VERSION"));

/// Fetches subscription documents over HTTP.
#[derive(Debug, Clone)]
pub struct RemoteFetcher {
    client: Client,
}

impl RemoteFetcher {
    pub fn new(timeout: Duration) -> Self {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(USER_AGENT)
            .build()
            .unwrap_or_default();
        Self { client }
    }

    /// Like [`RemoteFetcher::new`] but ignores `HTTP_PROXY` and friends.
    pub fn direct(timeout: Duration) -> Self {
        let client = Client::builder()
            .no_proxy()
            .timeout(timeout)
            .user_agent(USER_AGENT)
            .build()
            .unwrap_or_default();
        Self { client }
    }

    /// GETs `url` and parses the body as a YAML mapping.
    ///
    /// Any transport error, non-200 status or unparsable body yields `None`.
    pub async fn fetch(&self, url: &str) -> Option<Mapping> {
        let res = match self.client.get(url.trim()).send().await {
            Ok(res) => res,
            Err(e) => {
                error!("failed to fetch {}: {}", url, e);
                return None;
            }
        };

        if res.status() != StatusCode::OK {
            error!("fetching {} returned HTTP {}", url, res.status());
            return None;
        }

        let text = match res.text().await {
            Ok(text) => text,
            Err(e) => {
                error!("failed to read body of {}: {}", url, e);
                return None;
            }
        };
        debug!("fetched {} bytes from {}", text.len(), url);

        match serde_yaml::from_str::<Value>(&text) {
            Ok(Value::Mapping(map)) => Some(map),
            Ok(_) => {
                error!("subscription at {} is not a YAML mapping", url);
                None
            }
            Err(e) => {
                error!("failed to parse subscription at {}: {}", url, e);
                None
            }
        }
    }
}

impl Default for RemoteFetcher {
    fn default() -> Self {
        Self::new(DEFAULT_TIMEOUT)
    }
}
