//! Webhook implementation of [`Notifier`].
//!
//! Posts a small JSON document to the configured URL when a task finishes.
//! The optional bearer token is held as a [`SecretString`] and only exposed
//! while building the request header. With no URL configured every
//! notification is dropped.

use std::time::Duration;

use conveyor_core::backend::BackendError;
use conveyor_core::backend::notify::Notifier;
use conveyor_types::config::NotifySettings;
use secrecy::{ExposeSecret, SecretString};
use serde::Serialize;

#[derive(Debug, Serialize)]
struct WebhookPayload<'a> {
    success: bool,
    owner: &'a str,
    title: &'a str,
    text: &'a str,
}

struct Endpoint {
    url: String,
    token: Option<SecretString>,
}

/// Sends task outcomes to an HTTP endpoint.
pub struct WebhookNotifier {
    client: reqwest::Client,
    endpoint: Option<Endpoint>,
    notify_success: bool,
}

impl WebhookNotifier {
    pub fn new(settings: &NotifySettings) -> Result<Self, BackendError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| BackendError::Unavailable(format!("failed to create HTTP client: {e}")))?;

        let endpoint = settings.webhook_url.clone().map(|url| Endpoint {
            url,
            token: settings.token.clone().map(SecretString::from),
        });

        Ok(Self {
            client,
            endpoint,
            notify_success: settings.notify_success,
        })
    }

    pub fn is_enabled(&self) -> bool {
        self.endpoint.is_some()
    }

    async fn send(&self, payload: WebhookPayload<'_>) -> Result<(), BackendError> {
        let Some(endpoint) = &self.endpoint else {
            tracing::debug!(title = payload.title, "no webhook configured, notification dropped");
            return Ok(());
        };

        let mut request = self.client.post(&endpoint.url).json(&payload);
        if let Some(token) = &endpoint.token {
            request = request.bearer_auth(token.expose_secret());
        }

        let response = request
            .send()
            .await
            .map_err(|e| BackendError::Unavailable(format!("webhook request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(BackendError::Rejected(format!("webhook returned {status}")));
        }
        tracing::debug!(title = payload.title, success = payload.success, "notification sent");
        Ok(())
    }
}

impl Notifier for WebhookNotifier {
    async fn notify_failure(&self, owner: &str, title: &str, cause: &str) -> Result<(), BackendError> {
        self.send(WebhookPayload {
            success: false,
            owner,
            title,
            text: cause,
        })
        .await
    }

    async fn notify_success(&self, owner: &str, title: &str, detail: &str) -> Result<(), BackendError> {
        if !self.notify_success {
            return Ok(());
        }
        self.send(WebhookPayload {
            success: true,
            owner,
            title,
            text: detail,
        })
        .await
    }
}
