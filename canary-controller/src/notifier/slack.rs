use async_trait::async_trait;
use serde::Serialize;

use super::{Field, Notifier, NotifierError, Severity, Webhook};

/// Slack incoming webhook message, also understood by Rocket.Chat.
#[derive(Serialize, Debug, Clone, PartialEq)]
pub(super) struct Payload {
    pub channel: String,
    pub username: String,
    pub icon_url: String,
    pub icon_emoji: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<Attachment>,
}

#[derive(Serialize, Debug, Clone, PartialEq)]
pub(super) struct Attachment {
    pub color: String,
    pub author_name: String,
    pub text: String,
    pub mrkdwn_in: Vec<String>,
    pub fields: Vec<AttachmentField>,
}

#[derive(Serialize, Debug, Clone, PartialEq)]
pub(super) struct AttachmentField {
    pub title: String,
    pub value: String,
    pub short: bool,
}

pub(crate) struct Slack {
    webhook: Webhook,
}

impl Slack {
    pub fn new(url: &str, username: &str, channel: &str) -> Result<Self, NotifierError> {
        Ok(Self {
            webhook: Webhook::new("Slack", url, username, channel)?,
        })
    }

    fn color(severity: Severity) -> &'static str {
        match severity {
            Severity::Info => "good",
            Severity::Error => "danger",
        }
    }
}

#[async_trait]
impl Notifier for Slack {
    async fn post(
        &self,
        workload: &str,
        namespace: &str,
        message: &str,
        fields: &[Field],
        severity: Severity,
    ) -> Result<(), NotifierError> {
        let payload =
            self.webhook
                .payload(Self::color(severity), workload, namespace, message, fields);
        self.webhook.post_message(&payload).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notifier::tests::webhook_server;
    use hyper::StatusCode;
    use serde_json::json;

    #[test]
    fn payload_layout() {
        let slack = Slack::new("https://hooks.slack.com/services/x", "flagger", "general").unwrap();
        let payload = slack.webhook.payload(
            Slack::color(Severity::Error),
            "podinfo",
            "test",
            "Canary failed",
            &[Field {
                name: "Target".to_string(),
                value: "Deployment/podinfo.test".to_string(),
            }],
        );
        assert_eq!(
            json!({
                "channel": "general",
                "username": "flagger",
                "icon_url": "",
                "icon_emoji": ":rocket:",
                "attachments": [{
                    "color": "danger",
                    "author_name": "podinfo.test",
                    "text": "Canary failed",
                    "mrkdwn_in": ["text"],
                    "fields": [{
                        "title": "Target",
                        "value": "Deployment/podinfo.test",
                        "short": false
                    }]
                }]
            }),
            serde_json::to_value(&payload).unwrap()
        );
    }

    #[tokio::test]
    async fn posts_json_to_webhook() {
        let (url, body) = webhook_server(StatusCode::OK).await;
        let slack = Slack::new(&url, "flagger", "general").unwrap();
        slack
            .post("podinfo", "test", "Synced", &[], Severity::Info)
            .await
            .unwrap();
        let body = body.await.unwrap();
        assert_eq!("good", body["attachments"][0]["color"]);
        assert_eq!("podinfo.test", body["attachments"][0]["author_name"]);
    }

    #[tokio::test]
    async fn error_status_is_reported() {
        let (url, _body) = webhook_server(StatusCode::INTERNAL_SERVER_ERROR).await;
        let slack = Slack::new(&url, "flagger", "general").unwrap();
        let result = slack
            .post("podinfo", "test", "Synced", &[], Severity::Info)
            .await;
        assert!(matches!(result, Err(NotifierError::Post(_))));
    }
}
