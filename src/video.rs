//! NVR event coordinator (spec.md §4.5).
//!
//! A thin peripheral client in the shape of the teacher's `hardware_manager`:
//! a request to start a recording bracket, and a handle the caller polls or
//! holds onto, rather than a live back-reference into the transaction state
//! machine. Absence of an NVR base URL, or any failure talking to it, never
//! blocks transaction finalization — it only means `nvr_event_url` stays
//! `None` on the payloads (spec.md §4.5 "Non-blocking").

use std::time::Duration;

use reqwest::{Client, RequestBuilder};
use serde::Deserialize;
use tracing::warn;
use uuid::Uuid;

use crate::config::Config;
use crate::model::{NvrEvent, TransactionSummary};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Deserialize)]
struct CreateEventResponse {
    event_id: serde_json::Value,
    #[serde(default)]
    event_url: Option<String>,
}

fn event_id_to_string(value: &serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::String(s) => Some(s.clone()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

pub struct VideoCoordinator {
    client: Client,
    base_url: Option<String>,
    camera: String,
    label: String,
    remote_role: Option<String>,
    duration_secs: u64,
}

impl VideoCoordinator {
    pub fn new(cfg: &Config) -> Self {
        VideoCoordinator {
            client: Client::builder()
                .timeout(REQUEST_TIMEOUT)
                .build()
                .unwrap_or_else(|_| Client::new()),
            base_url: cfg.nvr_base_url.clone(),
            camera: cfg.nvr_camera.clone(),
            label: cfg.nvr_label.clone(),
            remote_role: cfg.nvr_remote_role.clone(),
            duration_secs: cfg.nvr_duration_secs,
        }
    }

    /// Whether an NVR endpoint is configured at all. Callers skip the
    /// request entirely rather than making one they know will fail, so a
    /// deployment with no camera never pays a per-transaction timeout.
    pub fn is_configured(&self) -> bool {
        self.base_url.is_some()
    }

    /// Attach the `remote-role` header, if configured, to an outbound request.
    fn with_role(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.remote_role {
            Some(role) => request.header("remote-role", role),
            None => request,
        }
    }

    /// Start (on `onStart`): open a recording bracket for a transaction that
    /// just started. Returns `None` on any failure or a response missing
    /// `event_id`; the caller logs and proceeds without blocking the
    /// transaction.
    pub async fn start_event(&self, _transaction_id: Uuid) -> Option<NvrEvent> {
        let base = self.base_url.as_ref()?;
        let url = format!("{base}/api/events/{}/{}/create", self.camera, self.label);
        let body = serde_json::json!({ "duration": self.duration_secs });
        let request = self.with_role(self.client.post(&url).json(&body));

        match request.send().await {
            Ok(resp) if resp.status().is_success() => match resp.json::<CreateEventResponse>().await {
                Ok(created) => {
                    let event_id = event_id_to_string(&created.event_id)?;
                    // Attach (spec.md §4.5): the NVR URL every line carries is
                    // the event's own API path unless the response already
                    // handed one back.
                    let event_url = created
                        .event_url
                        .or_else(|| Some(format!("{base}/api/events/{event_id}")));
                    Some(NvrEvent {
                        event_id,
                        event_url,
                        camera: self.camera.clone(),
                        label: self.label.clone(),
                    })
                }
                Err(e) => {
                    warn!(error = %e, "nvr create-event response was not the expected shape");
                    None
                }
            },
            Ok(resp) => {
                warn!(status = %resp.status(), "nvr create-event rejected");
                None
            }
            Err(e) => {
                warn!(error = %e, "nvr create-event request failed");
                None
            }
        }
    }

    /// Finish (on `onEnd`): annotate and close a recording bracket once the
    /// transaction finalizes. Every step is best-effort — a failure never
    /// blocks or retries, since the event already carries a usable id/url
    /// from `start_event` (spec.md §4.5 "Failures of annotation or end are
    /// logged, not surfaced").
    pub async fn finish_event(&self, event: &NvrEvent, summary: &TransactionSummary) {
        let Some(base) = &self.base_url else { return };
        let id = &event.event_id;

        if let Some(txn_num) = &summary.transaction_number {
            self.post_best_effort(
                format!("{base}/api/events/{id}/sub_label"),
                serde_json::json!({ "subLabel": format!("Txn {txn_num}") }),
            )
            .await;
        }

        let description = format!(
            "Txn {} | Total: {} | Items: {}",
            summary.transaction_number.as_deref().unwrap_or("?"),
            summary
                .total_amount
                .map(|a| format!("{:.2}", a.as_f64()))
                .unwrap_or_else(|| "?".to_string()),
            summary.item_count,
        );
        self.post_best_effort(
            format!("{base}/api/events/{id}/description"),
            serde_json::json!({ "description": description }),
        )
        .await;

        self.post_no_body_best_effort(format!("{base}/api/events/{id}/retain"))
            .await;

        let url = format!("{base}/api/events/{id}/end");
        if let Err(e) = self.with_role(self.client.put(&url)).send().await {
            warn!(error = %e, event_id = %event.event_id, "nvr end-event request failed");
        }
    }

    async fn post_best_effort(&self, url: String, body: serde_json::Value) {
        let request = self.with_role(self.client.post(&url).json(&body));
        if let Err(e) = request.send().await {
            warn!(error = %e, url = %url, "nvr annotation request failed");
        }
    }

    async fn post_no_body_best_effort(&self, url: String) {
        let request = self.with_role(self.client.post(&url));
        if let Err(e) = request.send().await {
            warn!(error = %e, url = %url, "nvr annotation request failed");
        }
    }
}
