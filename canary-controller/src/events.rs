use std::sync::Arc;

use canary_controller_apis::Canary;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::{Client, Resource, ResourceExt};
use kube_runtime::events::{Event, EventType, Recorder, Reporter};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;

use crate::notifier::{self, Field, Notifier};

/// Name under which events are reported.
pub(crate) const REPORTER: &str = "canary-controller";

pub(crate) const REASON_SYNCED: &str = "Synced";

const ACTION_RECONCILE: &str = "Reconcile";

/// Events waiting for the publisher, newer events are dropped beyond that.
const EVENT_BUFFER: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Severity {
    Normal,
    Warning,
}

impl From<Severity> for EventType {
    fn from(severity: Severity) -> Self {
        match severity {
            Severity::Normal => EventType::Normal,
            Severity::Warning => EventType::Warning,
        }
    }
}

impl From<Severity> for notifier::Severity {
    fn from(severity: Severity) -> Self {
        match severity {
            Severity::Normal => notifier::Severity::Info,
            Severity::Warning => notifier::Severity::Error,
        }
    }
}

/// Audit trail of reconciliation outcomes. Fire-and-forget: `record` never
/// waits for delivery and failures never reach the caller.
pub(crate) trait EventRecorder: Send + Sync {
    fn record(&self, canary: &Canary, severity: Severity, reason: &str, message: String);
}

struct PendingEvent {
    id: String,
    name: String,
    namespace: String,
    reference: ObjectReference,
    severity: Severity,
    reason: String,
    message: String,
    fields: Vec<Field>,
}

fn notification_fields(canary: &Canary) -> Vec<Field> {
    let mut fields = Vec::new();
    if let Some(version) = canary.resource_version() {
        fields.push(Field {
            name: "Resource version".to_string(),
            value: version,
        });
    }
    if let Some(image) = &canary.spec.image {
        fields.push(Field {
            name: "Image".to_string(),
            value: image.clone(),
        });
    }
    fields
}

/// Hands events over to an [`EventPublisher`], which publishes them as
/// Kubernetes Events on the [`Canary`] and forwards them to the chat notifier.
pub(crate) struct KubeEventRecorder {
    events: mpsc::Sender<PendingEvent>,
}

impl KubeEventRecorder {
    /// The returned publisher must be run for events to go anywhere.
    pub fn new(
        client: Client,
        notifier: Arc<dyn Notifier>,
        shutdown: CancellationToken,
    ) -> (Self, EventPublisher) {
        let reporter = Reporter {
            controller: REPORTER.to_string(),
            instance: std::env::var("POD_NAME").ok(),
        };
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let publisher = EventPublisher {
            recorder: Recorder::new(client, reporter),
            notifier,
            shutdown,
            events: rx,
        };
        (Self { events: tx }, publisher)
    }
}

impl EventRecorder for KubeEventRecorder {
    fn record(&self, canary: &Canary, severity: Severity, reason: &str, message: String) {
        let id = canary.id();
        match severity {
            Severity::Normal => info!("{}: {}", id, message),
            Severity::Warning => warn!("{}: {}", id, message),
        }
        let event = PendingEvent {
            name: canary.name_any(),
            namespace: canary.namespace().unwrap_or_default(),
            reference: canary.object_ref(&()),
            severity,
            reason: reason.to_string(),
            message,
            fields: notification_fields(canary),
            id,
        };
        match self.events.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) => {
                warn!("event buffer is full, dropping {} event for {}", event.reason, event.id);
            }
            Err(TrySendError::Closed(event)) => {
                debug!("not publishing {} event for {}, publisher stopped", event.reason, event.id);
            }
        }
    }
}

/// Background half of [`KubeEventRecorder`].
///
/// Once `shutdown` is cancelled no new outbound call is started, calls in
/// progress and buffered events are abandoned.
pub(crate) struct EventPublisher {
    recorder: Recorder,
    notifier: Arc<dyn Notifier>,
    shutdown: CancellationToken,
    events: mpsc::Receiver<PendingEvent>,
}

impl EventPublisher {
    /// Deliver events until shutdown or until every recorder is dropped.
    pub async fn run(mut self) {
        loop {
            let event = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                event = self.events.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };
            self.publish(&event).await;
            self.notify(&event).await;
        }
        debug!("event publisher stopped");
    }

    async fn publish(&self, pending: &PendingEvent) {
        let event = Event {
            type_: pending.severity.into(),
            reason: pending.reason.clone(),
            note: Some(pending.message.clone()),
            action: ACTION_RECONCILE.to_string(),
            secondary: None,
        };
        tokio::select! {
            _ = self.shutdown.cancelled() => {
                debug!("abandoned {} event for {}, shutting down", pending.reason, pending.id);
            }
            result = self.recorder.publish(&event, &pending.reference) => {
                if let Err(e) = result {
                    warn!("failed to publish {} event for {}: {}", pending.reason, pending.id, e);
                }
            }
        }
    }

    async fn notify(&self, pending: &PendingEvent) {
        if self.shutdown.is_cancelled() {
            return;
        }
        let post = self.notifier.post(
            &pending.name,
            &pending.namespace,
            &pending.message,
            &pending.fields,
            pending.severity.into(),
        );
        tokio::select! {
            _ = self.shutdown.cancelled() => {
                debug!("abandoned notification for {}, shutting down", pending.id);
            }
            result = post => {
                if let Err(e) = result {
                    warn!("failed to send notification for {}: {}", pending.id, e);
                }
            }
        }
    }
}
