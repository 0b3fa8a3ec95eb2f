//! Outbound chat notifications (Slack and Rocket.Chat incoming webhooks).

mod rocket;
mod slack;

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use reqwest::Url;
use serde::Serialize;

pub(crate) use rocket::Rocket;
pub(crate) use slack::Slack;

const POST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Severity {
    Info,
    Error,
}

/// Additional name/value pair rendered below the message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Field {
    pub name: String,
    pub value: String,
}

#[derive(thiserror::Error, Debug)]
pub(crate) enum NotifierError {
    #[error("invalid {provider} hook URL {url}")]
    InvalidUrl { provider: &'static str, url: String },
    #[error("empty {0} username")]
    EmptyUsername(&'static str),
    #[error("empty {0} channel")]
    EmptyChannel(&'static str),
    #[error("provider {0} not supported")]
    UnsupportedProvider(String),
    #[error("posting message failed: {0}")]
    Post(#[from] reqwest::Error),
}

#[async_trait]
pub(crate) trait Notifier: Send + Sync {
    async fn post(
        &self,
        workload: &str,
        namespace: &str,
        message: &str,
        fields: &[Field],
        severity: Severity,
    ) -> Result<(), NotifierError>;
}

/// Used when no webhook is configured, accepts and drops everything.
pub(crate) struct NopNotifier;

#[async_trait]
impl Notifier for NopNotifier {
    async fn post(
        &self,
        _workload: &str,
        _namespace: &str,
        _message: &str,
        _fields: &[Field],
        _severity: Severity,
    ) -> Result<(), NotifierError> {
        Ok(())
    }
}

/// Builds the notifier for a provider name from the webhook settings.
#[derive(Debug, Clone, Default)]
pub(crate) struct Factory {
    url: String,
    username: String,
    channel: String,
}

impl Factory {
    pub fn new(url: &str, username: &str, channel: &str) -> Self {
        Self {
            url: url.to_string(),
            username: username.to_string(),
            channel: channel.to_string(),
        }
    }

    /// Without a webhook URL the provider is irrelevant and a [`NopNotifier`]
    /// is returned.
    pub fn notifier(&self, provider: &str) -> Result<Arc<dyn Notifier>, NotifierError> {
        if self.url.is_empty() {
            return Ok(Arc::new(NopNotifier));
        }
        match provider {
            "slack" => Ok(Arc::new(Slack::new(
                &self.url,
                &self.username,
                &self.channel,
            )?)),
            "rocket" => Ok(Arc::new(Rocket::new(
                &self.url,
                &self.username,
                &self.channel,
            )?)),
            other => Err(NotifierError::UnsupportedProvider(other.to_string())),
        }
    }
}

/// Webhook endpoint shared by the Slack compatible providers.
struct Webhook {
    client: reqwest::Client,
    url: Url,
    username: String,
    channel: String,
}

impl Webhook {
    fn new(
        provider: &'static str,
        url: &str,
        username: &str,
        channel: &str,
    ) -> Result<Self, NotifierError> {
        let invalid = || NotifierError::InvalidUrl {
            provider,
            url: url.to_string(),
        };
        let parsed = Url::parse(url).map_err(|_| invalid())?;
        if parsed.cannot_be_a_base() {
            return Err(invalid());
        }
        if username.is_empty() {
            return Err(NotifierError::EmptyUsername(provider));
        }
        if channel.is_empty() {
            return Err(NotifierError::EmptyChannel(provider));
        }
        let client = reqwest::Client::builder().timeout(POST_TIMEOUT).build()?;
        Ok(Self {
            client,
            url: parsed,
            username: username.to_string(),
            channel: channel.to_string(),
        })
    }

    fn payload(
        &self,
        color: &str,
        workload: &str,
        namespace: &str,
        message: &str,
        fields: &[Field],
    ) -> slack::Payload {
        slack::Payload {
            channel: self.channel.clone(),
            username: self.username.clone(),
            icon_url: String::new(),
            icon_emoji: ":rocket:".to_string(),
            text: None,
            attachments: vec![slack::Attachment {
                color: color.to_string(),
                author_name: format!("{}.{}", workload, namespace),
                text: message.to_string(),
                mrkdwn_in: vec!["text".to_string()],
                fields: fields
                    .iter()
                    .map(|f| slack::AttachmentField {
                        title: f.name.clone(),
                        value: f.value.clone(),
                        short: false,
                    })
                    .collect(),
            }],
        }
    }

    async fn post_message<T: Serialize + Sync>(&self, payload: &T) -> Result<(), NotifierError> {
        self.client
            .post(self.url.clone())
            .json(payload)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}
