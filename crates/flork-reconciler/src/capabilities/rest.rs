//! Management client over the runtime's REST API
//!
//! Savepoint operations are asynchronous on the server: a trigger returns a
//! request id that is polled until the operation completes.

use std::time::Duration;

use async_trait::async_trait;
use flork_common::{Error, Result};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use super::{JobInfo, ManagementClient, RunState};

/// Pause between polls of an asynchronous operation
const OPERATION_POLL_INTERVAL: Duration = Duration::from_secs(1);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Deserialize)]
struct JobsResponse {
    #[serde(default)]
    jobs: Vec<JobEntry>,
}

#[derive(Debug, Deserialize)]
struct JobEntry {
    id: String,
    status: RunState,
}

#[derive(Debug, Deserialize)]
struct TriggerResponse {
    #[serde(rename = "request-id")]
    request_id: String,
}

#[derive(Debug, Deserialize)]
struct OperationStatus {
    status: QueueStatus,
    #[serde(default)]
    operation: Option<OperationResult>,
}

#[derive(Debug, Deserialize)]
struct QueueStatus {
    id: String,
}

#[derive(Debug, Deserialize)]
struct OperationResult {
    #[serde(default)]
    location: Option<String>,
    #[serde(rename = "failure-cause", default)]
    failure_cause: Option<serde_json::Value>,
}

impl OperationStatus {
    fn is_completed(&self) -> bool {
        self.status.id == "COMPLETED"
    }
}

/// [`ManagementClient`] for one cluster's REST endpoint
pub struct RestManagementClient {
    http: reqwest::Client,
    base_url: String,
    poll_interval: Duration,
}

impl RestManagementClient {
    /// Client for the endpoint at `base_url` (scheme, host and port)
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| Error::internal("rest_client", format!("failed to build client: {e}")))?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            poll_interval: OPERATION_POLL_INTERVAL,
        })
    }

    /// Base URL requests are sent to
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn decode<T: DeserializeOwned>(&self, response: reqwest::Response) -> Result<T> {
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::runtime(
                &self.base_url,
                format!("request failed: {status} - {body}"),
            ));
        }
        response
            .json()
            .await
            .map_err(|e| Error::runtime(&self.base_url, format!("invalid response: {e}")))
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let response = self
            .http
            .get(self.url(path))
            .send()
            .await
            .map_err(|e| Error::runtime(&self.base_url, format!("GET {path} failed: {e}")))?;
        self.decode(response).await
    }

    async fn post<T: DeserializeOwned>(&self, path: &str, body: serde_json::Value) -> Result<T> {
        let response = self
            .http
            .post(self.url(path))
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::runtime(&self.base_url, format!("POST {path} failed: {e}")))?;
        self.decode(response).await
    }

    /// Poll an asynchronous operation until it completes
    async fn await_operation(&self, path: &str) -> Result<OperationResult> {
        loop {
            let status: OperationStatus = self.get(path).await?;
            if status.is_completed() {
                let result = status.operation.unwrap_or(OperationResult {
                    location: None,
                    failure_cause: None,
                });
                if let Some(cause) = &result.failure_cause {
                    return Err(Error::runtime(
                        &self.base_url,
                        format!("operation {path} failed: {}", failure_message(cause)),
                    ));
                }
                return Ok(result);
            }
            debug!(base_url = %self.base_url, operation = path, "Operation still in progress");
            tokio::time::sleep(self.poll_interval).await;
        }
    }
}

/// Most useful line of a serialized server-side exception
fn failure_message(cause: &serde_json::Value) -> String {
    cause
        .get("serialized-throwable")
        .or_else(|| cause.get("class"))
        .and_then(|v| v.as_str())
        .map(str::to_string)
        .unwrap_or_else(|| cause.to_string())
}

#[async_trait]
impl ManagementClient for RestManagementClient {
    async fn list_jobs(&self) -> Result<Vec<JobInfo>> {
        let response: JobsResponse = self.get("/jobs").await?;
        Ok(response
            .jobs
            .into_iter()
            .map(|j| JobInfo {
                id: j.id,
                state: j.status,
            })
            .collect())
    }

    async fn stop_with_savepoint(
        &self,
        job_id: &str,
        target_dir: &str,
        advance_to_end_of_event_time: bool,
    ) -> Result<String> {
        let trigger: TriggerResponse = self
            .post(
                &format!("/jobs/{job_id}/stop"),
                json!({
                    "targetDirectory": target_dir,
                    "drain": advance_to_end_of_event_time,
                }),
            )
            .await?;

        let result = self
            .await_operation(&format!("/jobs/{job_id}/savepoints/{}", trigger.request_id))
            .await?;
        result.location.ok_or_else(|| {
            Error::runtime(&self.base_url, "savepoint completed without a location")
        })
    }

    async fn cancel(&self, job_id: &str) -> Result<()> {
        let response = self
            .http
            .patch(self.url(&format!("/jobs/{job_id}?mode=cancel")))
            .send()
            .await
            .map_err(|e| Error::runtime(&self.base_url, format!("cancel failed: {e}")))?;
        let status = response.status();
        if !status.is_success() {
            return Err(Error::runtime(
                &self.base_url,
                format!("cancel of {job_id} rejected: {status}"),
            ));
        }
        Ok(())
    }

    async fn dispose_savepoint(&self, path: &str) -> Result<()> {
        let trigger: TriggerResponse = self
            .post("/savepoint-disposal", json!({ "savepoint-path": path }))
            .await?;
        self.await_operation(&format!("/savepoint-disposal/{}", trigger.request_id))
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_job_listing() {
        let response: JobsResponse = serde_json::from_value(json!({
            "jobs": [{"id": "a1b2", "status": "RUNNING"}, {"id": "c3d4", "status": "FINISHED"}]
        }))
        .unwrap();
        assert_eq!(response.jobs.len(), 2);
        assert_eq!(response.jobs[0].status, RunState::Running);
    }

    #[test]
    fn parses_completed_savepoint() {
        let status: OperationStatus = serde_json::from_value(json!({
            "status": {"id": "COMPLETED"},
            "operation": {"location": "s3://sp/savepoint-a1b2"}
        }))
        .unwrap();
        assert!(status.is_completed());
        assert_eq!(
            status.operation.unwrap().location.as_deref(),
            Some("s3://sp/savepoint-a1b2")
        );
    }

    #[test]
    fn in_progress_operation_is_not_completed() {
        let status: OperationStatus =
            serde_json::from_value(json!({"status": {"id": "IN_PROGRESS"}})).unwrap();
        assert!(!status.is_completed());
    }

    #[test]
    fn failure_message_prefers_serialized_throwable() {
        let cause = json!({"class": "java.lang.Exception", "serialized-throwable": "boom"});
        assert_eq!(failure_message(&cause), "boom");
        assert_eq!(
            failure_message(&json!({"class": "java.lang.Exception"})),
            "java.lang.Exception"
        );
    }

    #[test]
    fn trailing_slash_is_trimmed() {
        let client = RestManagementClient::new("http://wordcount-rest.analytics.svc:8081/").unwrap();
        assert_eq!(client.base_url(), "http://wordcount-rest.analytics.svc:8081");
        assert_eq!(client.url("/jobs"), "http://wordcount-rest.analytics.svc:8081/jobs");
    }
}
