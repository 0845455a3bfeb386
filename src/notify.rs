//! Out-of-band event notification.

use serde::Serialize;
use tracing::error;

use crate::error::ServerError;
use crate::event::Event;

/// A post-event hook invoked by the sink for every event.
///
/// Implementations must not block the sink: delivery happens on a task the
/// notifier spawns itself.
pub trait Notifier: Send + Sync {
    fn notify(&self, event: &Event);
}

#[derive(Debug, Serialize)]
struct WebhookMessage {
    text: String,
    attachments: Vec<WebhookAttachment>,
}

#[derive(Debug, Serialize)]
struct WebhookAttachment {
    fallback: String,
    pretext: String,
    color: String,
    text: String,
}

/// Posts a short event summary to a Slack-compatible webhook.
#[derive(Debug)]
pub struct SlackNotifier {
    url: reqwest::Url,
    client: reqwest::Client,
}

impl SlackNotifier {
    /// The URL is validated eagerly; an unparseable URL is fatal at wiring
    /// time, not at first delivery.
    pub fn new(raw_url: &str) -> Result<Self, ServerError> {
        let url = reqwest::Url::parse(raw_url)
            .map_err(|_| ServerError::InvalidWebhookUrl(raw_url.to_owned()))?;
        Ok(SlackNotifier {
            url,
            client: reqwest::Client::new(),
        })
    }
}

impl Notifier for SlackNotifier {
    fn notify(&self, event: &Event) {
        let summary = format!("[{}] {}", event.kind, event.summary);
        let message = WebhookMessage {
            text: summary.clone(),
            attachments: vec![WebhookAttachment {
                fallback: summary.clone(),
                pretext: format!("New {} event", event.kind),
                color: "warning".to_owned(),
                text: summary,
            }],
        };
        let client = self.client.clone();
        let url = self.url.clone();
        tokio::spawn(async move {
            let result = client
                .post(url)
                .json(&message)
                .send()
                .await
                .and_then(reqwest::Response::error_for_status);
            if let Err(err) = result {
                error!(%err, "webhook notify failed");
            }
        });
    }
}
