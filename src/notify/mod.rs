//! Notification collaborator
//!
//! Lifecycle events are handed to a [`Notifier`] and forgotten. Delivery
//! failures are logged by the notifier and never reach the caller.

use std::sync::Arc;

use reqwest::Client;
use serde_json::json;
use tracing::{debug, error, info, warn};

use crate::config::NotificationConfig;
use crate::models::{InstanceEvent, InstanceEventKind};

/// Fire-and-forget event sink; implementations must not block
#[cfg_attr(test, mockall::automock)]
pub trait Notifier: Send + Sync {
    fn emit(&self, event: InstanceEvent);
}

/// Drops every event
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopNotifier;

impl Notifier for NoopNotifier {
    fn emit(&self, event: InstanceEvent) {
        debug!(instance_id = %event.instance_id, kind = ?event.kind, "Event dropped (notifications disabled)");
    }
}

/// Posts events to a Slack-compatible webhook
pub struct WebhookNotifier {
    webhook_url: String,
    client: Client,
}

impl WebhookNotifier {
    pub fn new(webhook_url: impl Into<String>) -> Self {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .unwrap_or_else(|_| Client::new());

        Self {
            webhook_url: webhook_url.into(),
            client,
        }
    }

    fn payload(event: &InstanceEvent) -> serde_json::Value {
        let color = match event.kind {
            InstanceEventKind::Created | InstanceEventKind::Resumed => "#36a64f",
            InstanceEventKind::Suspended | InstanceEventKind::Deleted => "#439fe0",
            InstanceEventKind::TransitionFailed => "#ff9900",
            InstanceEventKind::CreateFailed => "#ff0000",
        };

        let mut fields = vec![
            json!({ "title": "Instance", "value": event.instance_id.to_string(), "short": true }),
            json!({ "title": "User", "value": event.user_id, "short": true }),
            json!({ "title": "Status", "value": event.status.to_string(), "short": true }),
        ];
        let mut keys: Vec<_> = event.metadata.keys().collect();
        keys.sort();
        for key in keys {
            fields.push(json!({ "title": key, "value": event.metadata[key], "short": true }));
        }

        json!({
            "attachments": [{
                "color": color,
                "title": format!("Instance {:?}", event.kind),
                "text": event.message.clone().unwrap_or_default(),
                "fields": fields,
                "footer": "dbaas-provisioner",
                "ts": event.at.timestamp()
            }]
        })
    }
}

impl Notifier for WebhookNotifier {
    fn emit(&self, event: InstanceEvent) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!(instance_id = %event.instance_id, "No runtime available, event not delivered");
            return;
        };

        let client = self.client.clone();
        let url = self.webhook_url.clone();
        let payload = Self::payload(&event);

        handle.spawn(async move {
            match client.post(&url).json(&payload).send().await {
                Ok(response) if !response.status().is_success() => {
                    warn!(status = %response.status(), "Webhook returned error");
                }
                Ok(_) => {}
                Err(e) => error!(error = %e, "Failed to deliver instance event"),
            }
        });
    }
}

/// Notifier selected by configuration
pub fn from_config(config: &NotificationConfig) -> Arc<dyn Notifier> {
    match (&config.webhook_url, config.enabled) {
        (Some(url), true) => {
            info!("Webhook notifications enabled");
            Arc::new(WebhookNotifier::new(url.clone()))
        }
        _ => Arc::new(NoopNotifier),
    }
}
