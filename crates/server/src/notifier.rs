use std::time::Duration;

use async_trait::async_trait;
use keystone_core::approvals::notify::ApprovalNotification;
use keystone_core::approvals::{Notifier, PortError};
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde::Serialize;

/// Posts every notification as JSON to a single webhook endpoint.
pub struct WebhookNotifier {
    client: Client,
    url: String,
    token: Option<SecretString>,
}

#[derive(Serialize)]
struct WebhookPayload<'a> {
    event_name: &'static str,
    recipients: Vec<String>,
    notification: &'a ApprovalNotification,
}

impl WebhookNotifier {
    pub fn new(
        url: impl Into<String>,
        token: Option<SecretString>,
        timeout_secs: u64,
    ) -> Result<Self, reqwest::Error> {
        let client = Client::builder().timeout(Duration::from_secs(timeout_secs.max(1))).build()?;
        Ok(Self { client, url: url.into(), token })
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn deliver(&self, notification: &ApprovalNotification) -> Result<(), PortError> {
        let payload = WebhookPayload {
            event_name: notification.event_name(),
            recipients: notification.recipients(),
            notification,
        };

        let mut request = self.client.post(&self.url).json(&payload);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token.expose_secret());
        }

        let response = request
            .send()
            .await
            .map_err(|error| PortError::Backend(format!("webhook request failed: {error}")))?;
        if !response.status().is_success() {
            return Err(PortError::Backend(format!("webhook returned {}", response.status())));
        }
        Ok(())
    }
}
