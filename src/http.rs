//! HTTP execution seam.
//!
//! `HttpExec` is the narrow boundary between the transport client and the
//! network. Production code runs on [`ReqwestExec`]; tests substitute a
//! scripted implementation so retry and conflict behavior can be asserted
//! without a live store.

use std::time::Duration;

use async_trait::async_trait;

use crate::error::StoreError;

/// A raw HTTP response: status plus body text. Status interpretation
/// (misroute, unauthenticated, conflict) belongs to the transport client.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub body: String,
}

impl HttpResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Executes a single HTTP call. No retries at this level.
#[async_trait]
pub trait HttpExec: Send + Sync {
    /// POST a JSON body and return the raw response.
    ///
    /// Errors only when no response was produced at all (connect failure,
    /// timeout). Any response, whatever the status, comes back as `Ok`.
    async fn post_json(
        &self,
        url: &str,
        body: &serde_json::Value,
    ) -> Result<HttpResponse, StoreError>;
}

/// Production executor backed by a shared `reqwest::Client`.
pub struct ReqwestExec {
    client: reqwest::Client,
}

impl ReqwestExec {
    pub fn new(timeout: Duration) -> Result<Self, StoreError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| StoreError::Request(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl HttpExec for ReqwestExec {
    async fn post_json(
        &self,
        url: &str,
        body: &serde_json::Value,
    ) -> Result<HttpResponse, StoreError> {
        let response = self
            .client
            .post(url)
            .json(body)
            .send()
            .await
            .map_err(|e| StoreError::Request(e.to_string()))?;

        let status = response.status().as_u16();
        let body = response
            .text()
            .await
            .map_err(|e| StoreError::Request(format!("failed to read response body: {}", e)))?;

        Ok(HttpResponse { status, body })
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Scripted executor shared by the module tests in this crate.

    use std::collections::VecDeque;
    use std::sync::Mutex;

    use super::*;

    /// Replays queued responses in FIFO order and records every request.
    /// When the queue runs dry it answers `200 {}`, which the sync layer
    /// reads as an empty result set.
    #[derive(Default)]
    pub(crate) struct ScriptedExec {
        responses: Mutex<VecDeque<HttpResponse>>,
        requests: Mutex<Vec<(String, serde_json::Value)>>,
    }

    impl ScriptedExec {
        pub(crate) fn new() -> Self {
            Self::default()
        }

        pub(crate) fn push(&self, status: u16, body: &str) {
            self.responses
                .lock()
                .unwrap()
                .push_back(HttpResponse { status, body: body.to_string() });
        }

        pub(crate) fn push_json(&self, status: u16, body: serde_json::Value) {
            self.push(status, &body.to_string());
        }

        pub(crate) fn requests(&self) -> Vec<(String, serde_json::Value)> {
            self.requests.lock().unwrap().clone()
        }

        pub(crate) fn request_count(&self) -> usize {
            self.requests.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl HttpExec for ScriptedExec {
        async fn post_json(
            &self,
            url: &str,
            body: &serde_json::Value,
        ) -> Result<HttpResponse, StoreError> {
            // A real request always yields to the scheduler; model that so
            // tests exercising in-flight coalescing can interleave callers.
            tokio::task::yield_now().await;

            self.requests
                .lock()
                .unwrap()
                .push((url.to_string(), body.clone()));

            Ok(self
                .responses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(HttpResponse { status: 200, body: "{}".to_string() }))
        }
    }
}
