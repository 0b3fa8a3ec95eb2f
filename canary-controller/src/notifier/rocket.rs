use async_trait::async_trait;

use super::{Field, Notifier, NotifierError, Severity, Webhook};

/// Rocket.Chat incoming webhook, fed with the Slack payload format.
pub(crate) struct Rocket {
    webhook: Webhook,
}

impl Rocket {
    pub fn new(url: &str, username: &str, channel: &str) -> Result<Self, NotifierError> {
        Ok(Self {
            webhook: Webhook::new("Rocket", url, username, channel)?,
        })
    }

    fn color(severity: Severity) -> &'static str {
        match severity {
            Severity::Info => "#0076D7",
            Severity::Error => "#FF0000",
        }
    }
}

#[async_trait]
impl Notifier for Rocket {
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

    #[tokio::test]
    async fn uses_hex_colors() {
        let (url, body) = webhook_server(StatusCode::OK).await;
        let rocket = Rocket::new(&url, "flagger", "general").unwrap();
        rocket
            .post(
                "podinfo",
                "test",
                "Canary failed",
                &[Field {
                    name: "Reason".to_string(),
                    value: "timeout".to_string(),
                }],
                Severity::Error,
            )
            .await
            .unwrap();
        let body = body.await.unwrap();
        assert_eq!("#FF0000", body["attachments"][0]["color"]);
        assert_eq!("Reason", body["attachments"][0]["fields"][0]["title"]);
        assert_eq!("general", body["channel"]);
        assert_eq!("#0076D7", Rocket::color(Severity::Info));
    }
}
