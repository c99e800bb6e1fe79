//! HTTP hand-off of worker responses to the manager (direct path).

use core::time::Duration;
use crackhash_core::{
    Error, Result,
    types::{WireMessage, WorkerResponse},
};
use reqwest::header::CONTENT_TYPE;

#[derive(Clone, Debug)]
pub struct ManagerClient {
    http: reqwest::Client,
    url: String,
}

impl ManagerClient {
    /// `url` is the manager's response endpoint. Every report gives up
    /// after `timeout`.
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Report {
                context: format!("failed to build HTTP client: {e}"),
            })?;
        Ok(Self {
            http,
            url: url.into(),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// PATCHes `response` to the manager. Only a 2xx answer counts as
    /// delivered.
    pub async fn report(&self, response: &WorkerResponse) -> Result<()> {
        let reply = self
            .http
            .patch(&self.url)
            .header(CONTENT_TYPE, "application/json")
            .body(response.encode()?)
            .send()
            .await
            .map_err(|e| Error::Report {
                context: format!("{}: {e}", self.url),
            })?;

        let status = reply.status();
        if !status.is_success() {
            return Err(Error::Report {
                context: format!("{} answered {status}", self.url),
            });
        }
        tracing::debug!(request_id = %response.request_id, "Response reported to manager");
        Ok(())
    }
}
