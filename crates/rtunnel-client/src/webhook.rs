//! Best-effort delivery of proxy detail snapshots to an operator endpoint

use crate::config::WebhookConfig;
use crate::error::Result;
use crate::status::WorkingDetail;
use tracing::{debug, warn};

/// Fire-and-forget notification sink
pub trait WebhookNotifier: Send + Sync {
    /// Queue delivery of `detail`; never blocks and never reports failure
    fn notify(&self, detail: WorkingDetail);
}

/// Posts each snapshot as JSON to the configured URL
#[derive(Clone)]
pub struct HttpWebhook {
    client: reqwest::Client,
    url: Option<String>,
}

impl HttpWebhook {
    pub fn new(config: &WebhookConfig) -> Self {
        let url = (!config.url.is_empty()).then(|| config.url.clone());
        debug!("webhook url: {:?}", url);
        Self {
            client: reqwest::Client::new(),
            url,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.url.is_some()
    }

    async fn deliver(client: reqwest::Client, url: String, detail: WorkingDetail) -> Result<()> {
        let response = client.post(&url).json(&detail).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!(%url, %status, %body, "webhook endpoint rejected proxy detail");
        } else {
            debug!(%url, proxy = %detail.name, "webhook delivered");
        }
        Ok(())
    }
}

impl WebhookNotifier for HttpWebhook {
    fn notify(&self, detail: WorkingDetail) {
        let Some(url) = self.url.clone() else {
            debug!(proxy = %detail.name, "webhook disabled, dropping detail");
            return;
        };
        let client = self.client.clone();
        tokio::spawn(async move {
            let name = detail.name.clone();
            if let Err(e) = Self::deliver(client, url.clone(), detail).await {
                warn!(%url, proxy = %name, "webhook delivery failed: {}", e);
            }
        });
    }
}
