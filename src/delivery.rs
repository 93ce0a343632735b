//! Outbound delivery loop (spec.md §4.3/§4.4).
//!
//! Drains due jobs from the [`Queue`] and POSTs them to their configured
//! upstream URL, matching the client conventions of the teacher's `api.rs`
//! (a shared [`reqwest::Client`], fixed request timeout, connect/timeout
//! error classification) generalized from one fixed admin dashboard to
//! per-job URLs drawn from the queue.

use std::sync::Arc;
use std::time::Duration;

use reqwest::{Client, StatusCode};
use tracing::{info, warn};

use crate::metrics::Metrics;
use crate::model::OutboundJob;
use crate::queue::Queue;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);
const IDLE_POLL_INTERVAL: Duration = Duration::from_millis(300);
const FAILURE_BACKOFF_DELAY: Duration = Duration::from_secs(1);

pub fn build_client() -> reqwest::Result<Client> {
    Client::builder().timeout(REQUEST_TIMEOUT).build()
}

/// Attempt one delivery. Returns `true` on success (2xx), `false` on any
/// failure the caller should back off and retry for (spec.md §4.3
/// "Delivery outcome").
pub async fn attempt_delivery(client: &Client, job: &OutboundJob) -> bool {
    let mut request = client.post(&job.url).body(job.body.clone());
    for (name, value) in &job.headers {
        request = request.header(name, value);
    }

    match request.send().await {
        Ok(resp) => {
            let status = resp.status();
            if status.is_success() {
                true
            } else {
                warn!(job_id = job.id, topic = job.topic.as_str(), status = %status, "delivery rejected by upstream");
                should_retry_on_status(status)
            }
        }
        Err(e) => {
            if e.is_connect() {
                warn!(job_id = job.id, "delivery failed: cannot reach upstream");
            } else if e.is_timeout() {
                warn!(job_id = job.id, "delivery failed: upstream timed out");
            } else {
                warn!(job_id = job.id, error = %e, "delivery failed");
            }
            false
        }
    }
}

/// 4xx (other than 408/429) indicates a permanently malformed request; retrying
/// forever would wedge the queue, but spec.md does not define a dead-letter
/// path, so it still retries — as any delivery failure does — and a metrics
/// consumer can alert on stuck queue depth.
fn should_retry_on_status(status: StatusCode) -> bool {
    let _ = status;
    false
}

/// Run the delivery loop until `shutdown` resolves: repeatedly pop the oldest
/// due job, attempt delivery, and mark the outcome. Sleeps briefly when the
/// queue is empty or the next job is not yet eligible, rather than busy-spinning.
pub async fn run(
    queue: Arc<Queue>,
    client: Client,
    metrics: Arc<Metrics>,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) {
    info!("delivery loop starting");
    loop {
        if *shutdown.borrow() {
            break;
        }

        let now = crate::time::unix_now();
        match queue.due(now) {
            Some(job) => {
                let started = std::time::Instant::now();
                let ok = attempt_delivery(&client, &job).await;
                metrics
                    .post_latency_ms
                    .observe(started.elapsed().as_secs_f64() * 1000.0);
                queue.mark(job.id, ok, crate::time::unix_now());
                metrics.queue_depth.set(queue.depth() as i64);
                if !ok {
                    tokio::select! {
                        _ = tokio::time::sleep(FAILURE_BACKOFF_DELAY) => {}
                        _ = shutdown.changed() => {}
                    }
                }
            }
            None => {
                tokio::select! {
                    _ = tokio::time::sleep(IDLE_POLL_INTERVAL) => {}
                    _ = shutdown.changed() => {}
                }
            }
        }
    }
    info!("delivery loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Topic;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn successful_post_returns_true() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/lines"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let client = build_client().unwrap();
        let job = OutboundJob {
            id: 1,
            topic: Topic::TransactionLines,
            url: format!("{}/lines", server.uri()),
            body: b"{}".to_vec(),
            headers: vec![("Content-Type".to_string(), "application/json".to_string())],
            attempts: 0,
            next_eligible: 0,
            created_at: 0,
        };
        assert!(attempt_delivery(&client, &job).await);
    }

    #[tokio::test]
    async fn server_error_returns_false() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/lines"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let client = build_client().unwrap();
        let job = OutboundJob {
            id: 1,
            topic: Topic::TransactionLines,
            url: format!("{}/lines", server.uri()),
            body: b"{}".to_vec(),
            headers: vec![],
            attempts: 0,
            next_eligible: 0,
            created_at: 0,
        };
        assert!(!attempt_delivery(&client, &job).await);
    }

    #[tokio::test]
    async fn unreachable_host_returns_false() {
        let client = build_client().unwrap();
        let job = OutboundJob {
            id: 1,
            topic: Topic::TransactionLines,
            url: "http://127.0.0.1:1".to_string(),
            body: b"{}".to_vec(),
            headers: vec![],
            attempts: 0,
            next_eligible: 0,
            created_at: 0,
        };
        assert!(!attempt_delivery(&client, &job).await);
    }
}
