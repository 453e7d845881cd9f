//! HTTP transport for the coordination protocol
//!
//! Blocking calls are implemented by polling the server at a fixed interval
//! until it stops answering `423 Locked`.

use anyhow::{bail, Context, Result};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::thread;
use std::time::Duration;
use thiserror::Error;
use tokio::runtime::{Builder, Runtime};
use tracing::{debug, warn};

use super::{ParallelClient, SyncState};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Error, Debug)]
pub enum CoordinationError {
    #[error("coordination server at {0} is not up")]
    NotUp(String),

    #[error("the primary process exited before posting its synchronized before-suite result")]
    PrimaryGone,

    #[error("unexpected response {status} from {url}")]
    UnexpectedStatus { status: StatusCode, url: String },
}

#[derive(Debug, Serialize, Deserialize)]
struct CounterResponse {
    index: usize,
}

#[derive(Debug, Serialize, Deserialize)]
struct BeforeSuiteState {
    state: SyncState,
    data: Vec<u8>,
}

#[derive(Debug, Serialize, Deserialize)]
struct DidFinish {
    process: usize,
}

#[derive(Debug, Serialize, Deserialize)]
struct AbortResponse {
    aborted: bool,
}

/// [`ParallelClient`] speaking to a coordination server over HTTP.
///
/// Owns a current-thread runtime and blocks on each request, so it must not
/// be used from inside another tokio runtime.
pub struct HttpParallelClient {
    host: String,
    client: Client,
    runtime: Runtime,
    poll_interval: Duration,
}

impl HttpParallelClient {
    pub fn new(host: impl Into<String>) -> Result<Self> {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .context("Failed to create HTTP client")?;
        let runtime = Builder::new_current_thread()
            .enable_all()
            .build()
            .context("Failed to create coordination runtime")?;

        Ok(Self {
            host: host.into(),
            client,
            runtime,
            poll_interval: POLL_INTERVAL,
        })
    }

    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.host.trim_end_matches('/'), path)
    }

    fn get(&self, path: &str) -> Result<(StatusCode, String)> {
        let url = self.url(path);
        debug!("GET {}", url);
        self.runtime.block_on(self.send_get(&url))
    }

    async fn send_get(&self, url: &str) -> Result<(StatusCode, String)> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .with_context(|| format!("GET {url} failed"))?;
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        Ok((status, body))
    }

    fn post<T: Serialize>(&self, path: &str, payload: Option<&T>) -> Result<()> {
        let url = self.url(path);
        debug!("POST {}", url);
        self.runtime.block_on(self.send_post(&url, payload))
    }

    async fn send_post<T: Serialize>(&self, url: &str, payload: Option<&T>) -> Result<()> {
        let mut request = self.client.post(url);
        if let Some(payload) = payload {
            request = request.json(payload);
        }
        let response = request
            .send()
            .await
            .with_context(|| format!("POST {url} failed"))?;
        let status = response.status();
        if !status.is_success() {
            bail!(CoordinationError::UnexpectedStatus {
                status,
                url: url.to_string(),
            });
        }
        Ok(())
    }

    /// GET `path` until the server stops answering `423 Locked`
    fn poll(&self, path: &str) -> Result<String> {
        loop {
            let (status, body) = self.get(path)?;
            match status {
                StatusCode::LOCKED => thread::sleep(self.poll_interval),
                StatusCode::GONE => bail!(CoordinationError::PrimaryGone),
                status if status.is_success() => return Ok(body),
                status => {
                    bail!(CoordinationError::UnexpectedStatus {
                        status,
                        url: self.url(path),
                    })
                }
            }
        }
    }
}

impl ParallelClient for HttpParallelClient {
    fn connect(&self) -> Result<()> {
        let (status, _) = self.get("/up")?;
        if !status.is_success() {
            bail!(CoordinationError::NotUp(self.host.clone()));
        }
        Ok(())
    }

    fn close(&self) -> Result<()> {
        Ok(())
    }

    fn fetch_next_counter(&self) -> Result<usize> {
        let (status, body) = self.get("/counter")?;
        if !status.is_success() {
            bail!(CoordinationError::UnexpectedStatus {
                status,
                url: self.url("/counter"),
            });
        }
        let counter: CounterResponse =
            serde_json::from_str(&body).context("Invalid counter response")?;
        Ok(counter.index)
    }

    fn post_synchronized_before_suite_completed(
        &self,
        state: SyncState,
        data: Vec<u8>,
    ) -> Result<()> {
        self.post("/before-suite-completed", Some(&BeforeSuiteState { state, data }))
    }

    fn block_until_synchronized_before_suite_data(&self) -> Result<(SyncState, Vec<u8>)> {
        let body = self.poll("/before-suite-state")?;
        let state: BeforeSuiteState =
            serde_json::from_str(&body).context("Invalid before-suite state")?;
        Ok((state.state, state.data))
    }

    fn post_did_finish(&self, process: usize) -> Result<()> {
        self.post("/did-finish", Some(&DidFinish { process }))
    }

    fn block_until_non_primary_procs_have_finished(&self) -> Result<()> {
        self.poll("/have-nonprimary-procs-finished").map(|_| ())
    }

    fn post_abort(&self) -> Result<()> {
        self.post::<()>("/abort", None)
    }

    fn should_abort(&self) -> bool {
        match self.get("/abort") {
            Ok((status, body)) if status.is_success() => {
                serde_json::from_str::<AbortResponse>(&body)
                    .map(|r| r.aborted)
                    .unwrap_or(false)
            }
            Ok(_) => false,
            Err(e) => {
                warn!("could not poll abort state: {:#}", e);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url_building() {
        let client = HttpParallelClient::new("http://127.0.0.1:9000/").unwrap();
        assert_eq!(client.url("/counter"), "http://127.0.0.1:9000/counter");
        assert_eq!(client.host(), "http://127.0.0.1:9000/");
    }

    #[test]
    fn test_connect_to_unreachable_host_fails() {
        let client = HttpParallelClient::new("http://127.0.0.1:9")
            .unwrap()
            .poll_interval(Duration::from_millis(1));
        assert!(client.connect().is_err());
        assert!(!client.should_abort());
    }

    #[test]
    fn test_wire_formats() {
        let state = BeforeSuiteState {
            state: SyncState::Passed,
            data: vec![1, 2],
        };
        assert_eq!(
            serde_json::to_string(&state).unwrap(),
            r#"{"state":"passed","data":[1,2]}"#
        );
        let counter: CounterResponse = serde_json::from_str(r#"{"index":4}"#).unwrap();
        assert_eq!(counter.index, 4);
    }
}
