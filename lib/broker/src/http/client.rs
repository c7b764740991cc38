use super::API_PREFIX;
use super::models::{
    CompletedJobsPayload, ErrorPayload, ErrorResponse, ProgressPayload, SuccessPayload,
};
use crate::{BrokerError, BrokerStatus, ProvingJobConsumer, ProvingJobProducer};
use async_trait::async_trait;
use backon::{ExponentialBuilder, Retryable};
use epoch_prover_types::{
    JobLease, JobStatus, ProofUri, ProvingJob, ProvingJobFilter, ProvingJobId, UnixMillis,
};
use reqwest::{Method, Response};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::time::Duration;
use url::Url;

/// Remote broker reached over HTTP. Requests that fail to connect are retried with exponential
/// backoff; errors returned by the broker itself are not.
#[derive(Debug, Clone)]
pub struct ProvingBrokerClient {
    http: reqwest::Client,
    base: Url,
    max_retries: usize,
    min_retry_delay: Duration,
}

impl ProvingBrokerClient {
    pub fn new(base_url: &str) -> Result<Self, BrokerError> {
        let base = Url::parse(base_url)
            .map_err(|err| BrokerError::Transport(format!("invalid broker URL {base_url}: {err}")))?;
        if base.cannot_be_a_base() {
            return Err(BrokerError::Transport(format!(
                "invalid broker URL {base_url}"
            )));
        }
        Ok(Self {
            http: reqwest::Client::new(),
            base,
            max_retries: 5,
            min_retry_delay: Duration::from_millis(100),
        })
    }

    pub fn with_retries(mut self, max_retries: usize, min_retry_delay: Duration) -> Self {
        self.max_retries = max_retries;
        self.min_retry_delay = min_retry_delay;
        self
    }

    fn url(&self, segments: &[&str]) -> Url {
        let mut url = self.base.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty()
                .extend(API_PREFIX.split('/').filter(|s| !s.is_empty()))
                .extend(segments);
        }
        url
    }

    async fn call<B: Serialize + Sync>(
        &self,
        method: Method,
        segments: &[&str],
        body: Option<&B>,
        id: Option<&ProvingJobId>,
    ) -> Result<Response, BrokerError> {
        let url = self.url(segments);
        let retry = ExponentialBuilder::default()
            .with_min_delay(self.min_retry_delay)
            .with_max_times(self.max_retries);
        let response = (|| async {
            let mut request = self.http.request(method.clone(), url.clone());
            if let Some(body) = body {
                request = request.json(body);
            }
            request.send().await
        })
        .retry(retry)
        .when(|err: &reqwest::Error| err.is_connect() || err.is_timeout())
        .notify(|err, dur| {
            tracing::warn!(%err, ?dur, %url, "retrying proving broker request");
        })
        .await
        .map_err(|err| BrokerError::Transport(err.to_string()))?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        Err(match response.json::<ErrorResponse>().await {
            Ok(body) => body.into_broker_error(id),
            Err(_) => BrokerError::Transport(format!("broker responded with {status}")),
        })
    }

    async fn json<R: DeserializeOwned>(response: Response) -> Result<R, BrokerError> {
        response
            .json()
            .await
            .map_err(|err| BrokerError::Serialization(err.to_string()))
    }

    pub async fn status(&self) -> Result<BrokerStatus, BrokerError> {
        let response = self.call::<()>(Method::GET, &["status"], None, None).await?;
        Self::json(response).await
    }
}

#[async_trait]
impl ProvingJobProducer for ProvingBrokerClient {
    async fn enqueue_proving_job(&self, job: ProvingJob) -> Result<JobStatus, BrokerError> {
        let response = self
            .call(Method::POST, &["enqueue"], Some(&job), Some(&job.id))
            .await?;
        Self::json(response).await
    }

    async fn get_proving_job_status(&self, id: &ProvingJobId) -> Result<JobStatus, BrokerError> {
        let response = self
            .call::<()>(Method::GET, &[id.as_str(), "status"], None, Some(id))
            .await?;
        Self::json(response).await
    }

    async fn cancel_proving_job(&self, id: &ProvingJobId) -> Result<(), BrokerError> {
        self.call::<()>(Method::POST, &[id.as_str(), "cancel"], None, Some(id))
            .await?;
        Ok(())
    }

    async fn get_completed_jobs(
        &self,
        ids: &[ProvingJobId],
    ) -> Result<Vec<ProvingJobId>, BrokerError> {
        let payload = CompletedJobsPayload { ids: ids.to_vec() };
        let response = self
            .call(Method::POST, &["completed"], Some(&payload), None)
            .await?;
        Self::json(response).await
    }

    async fn clean_up_job(&self, id: &ProvingJobId) -> Result<(), BrokerError> {
        self.call::<()>(Method::POST, &[id.as_str(), "cleanup"], None, Some(id))
            .await?;
        Ok(())
    }
}

#[async_trait]
impl ProvingJobConsumer for ProvingBrokerClient {
    async fn get_proving_job(
        &self,
        filter: &ProvingJobFilter,
    ) -> Result<Option<JobLease>, BrokerError> {
        let response = self
            .call(Method::POST, &["pick"], Some(filter), None)
            .await?;
        Self::json(response).await
    }

    async fn report_proving_job_progress(
        &self,
        id: &ProvingJobId,
        started_at: UnixMillis,
        filter: &ProvingJobFilter,
    ) -> Result<Option<JobLease>, BrokerError> {
        let payload = ProgressPayload {
            started_at,
            filter: filter.clone(),
        };
        let response = self
            .call(Method::POST, &[id.as_str(), "progress"], Some(&payload), Some(id))
            .await?;
        Self::json(response).await
    }

    async fn report_proving_job_success(
        &self,
        id: &ProvingJobId,
        result_ref: ProofUri,
    ) -> Result<(), BrokerError> {
        let payload = SuccessPayload { result_ref };
        self.call(Method::POST, &[id.as_str(), "success"], Some(&payload), Some(id))
            .await?;
        Ok(())
    }

    async fn report_proving_job_error(
        &self,
        id: &ProvingJobId,
        reason: String,
        retryable: bool,
        filter: Option<&ProvingJobFilter>,
    ) -> Result<Option<JobLease>, BrokerError> {
        let payload = ErrorPayload {
            reason,
            retryable,
            filter: filter.cloned(),
        };
        let response = self
            .call(Method::POST, &[id.as_str(), "error"], Some(&payload), Some(id))
            .await?;
        Self::json(response).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn urls_escape_job_ids() {
        let client = ProvingBrokerClient::new("http://127.0.0.1:3124/").unwrap();
        let url = client.url(&["1:tube:ab/cd", "status"]);
        assert_eq!(
            url.as_str(),
            "http://127.0.0.1:3124/proving-jobs/v1/1:tube:ab%2Fcd/status"
        );
        assert!(ProvingBrokerClient::new("not a url").is_err());
    }

    #[tokio::test]
    async fn unreachable_broker_is_a_transport_error() {
        let port = std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port();
        let client = ProvingBrokerClient::new(&format!("http://127.0.0.1:{port}/"))
            .unwrap()
            .with_retries(2, Duration::from_millis(1));
        let started = std::time::Instant::now();
        assert!(matches!(
            client.status().await,
            Err(BrokerError::Transport(_))
        ));
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
