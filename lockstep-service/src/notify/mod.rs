// Notification
// Delivers the pipeline verdict to a chat webhook

use crate::error::NotifyError;
use crate::parser::models::NotifyDefinition;

use serde::Serialize;
use std::time::Duration;

/// The single message sent when a pipeline finishes
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Notification {
    pub channel: String,
    /// Sender identity shown in the channel
    pub username: String,
    pub text: String,
    pub success: bool,
    pub commit: Option<String>,
    pub pipeline: String,
}

/// Delivers notifications; implementations never retry
#[async_trait::async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, notification: &Notification) -> Result<(), NotifyError>;
}

/// Posts notifications as JSON to a webhook URL
pub struct WebhookNotifier {
    client: reqwest::Client,
    /// Opaque credential; never logged
    url: String,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>) -> Result<Self, NotifyError> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(30))
            .build()?;

        Ok(Self {
            client,
            url: url.into(),
        })
    }

    /// Build from the environment variable a pipeline's notify block names.
    ///
    /// Returns `None` when the variable is unset or empty.
    pub fn from_definition(definition: &NotifyDefinition) -> Result<Option<Self>, NotifyError> {
        match std::env::var(&definition.webhook_env) {
            Ok(url) if !url.trim().is_empty() => Self::new(url.trim()).map(Some),
            _ => Ok(None),
        }
    }
}

impl std::fmt::Debug for WebhookNotifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebhookNotifier")
            .field("url", &"<redacted>")
            .finish()
    }
}

#[async_trait::async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(&self, notification: &Notification) -> Result<(), NotifyError> {
        // reqwest puts the full URL in its error text
        let response = self
            .client
            .post(&self.url)
            .json(notification)
            .send()
            .await
            .map_err(|e| NotifyError::Request(e.without_url()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(NotifyError::Status {
                status: status.as_u16(),
                body,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod recording {
    use super::*;

    use std::sync::{Arc, Mutex};

    /// Notifier that records every notification and optionally fails
    #[derive(Clone, Default)]
    pub struct RecordingNotifier {
        sent: Arc<Mutex<Vec<Notification>>>,
        fail_with: Option<u16>,
    }

    impl RecordingNotifier {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn failing(status: u16) -> Self {
            Self {
                fail_with: Some(status),
                ..Self::default()
            }
        }

        pub fn sent(&self) -> Vec<Notification> {
            self.sent.lock().unwrap().clone()
        }
    }

    #[async_trait::async_trait]
    impl Notifier for RecordingNotifier {
        async fn notify(&self, notification: &Notification) -> Result<(), NotifyError> {
            self.sent.lock().unwrap().push(notification.clone());
            match self.fail_with {
                Some(status) => Err(NotifyError::Status {
                    status,
                    body: "unavailable".to_string(),
                }),
                None => Ok(()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_notification_payload() {
        let notification = Notification {
            channel: "#firedrake".to_string(),
            username: "lockstep".to_string(),
            text: "firedrake passed".to_string(),
            success: true,
            commit: Some("abc123".to_string()),
            pipeline: "firedrake".to_string(),
        };
        let json = serde_json::to_value(&notification).unwrap();

        assert_eq!(json["channel"], "#firedrake");
        assert_eq!(json["username"], "lockstep");
        assert_eq!(json["success"], true);
        assert_eq!(json["commit"], "abc123");
    }

    #[test]
    fn test_from_definition_without_env() {
        let definition = NotifyDefinition {
            channel: "#firedrake".to_string(),
            sender: "lockstep".to_string(),
            webhook_env: "LOCKSTEP_TEST_WEBHOOK_THAT_IS_NEVER_SET".to_string(),
        };
        assert!(WebhookNotifier::from_definition(&definition).unwrap().is_none());
    }

    #[test]
    fn test_debug_redacts_url() {
        let notifier = WebhookNotifier::new("https://hooks.example.com/secret-token").unwrap();
        let debug = format!("{:?}", notifier);
        assert!(!debug.contains("secret-token"));
    }

    #[tokio::test]
    async fn test_unreachable_webhook_is_an_error() {
        let notifier = WebhookNotifier::new("http://127.0.0.1:9/hooks/SECRET-TOKEN").unwrap();
        let notification = Notification {
            channel: "#c".to_string(),
            username: "lockstep".to_string(),
            text: "t".to_string(),
            success: false,
            commit: None,
            pipeline: "p".to_string(),
        };
        let err = notifier.notify(&notification).await.unwrap_err();
        assert!(matches!(err, NotifyError::Request(_)));
        assert!(!err.to_string().contains("SECRET-TOKEN"));
        assert!(!format!("{:?}", err).contains("SECRET-TOKEN"));
    }
}
