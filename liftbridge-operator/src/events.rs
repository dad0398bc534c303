use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::{self, Recorder, Reporter};
use kube::Client;
use tracing::debug;

use crate::error::Result;
use crate::lock::LockKey;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventType {
    Normal,
    Warning,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Normal => "Normal",
            EventType::Warning => "Warning",
        }
    }
}

/// Audit trail for lease transitions.
///
/// Emission is best-effort: callers log failures and carry on, so a sink
/// must never be consulted for lock correctness.
#[async_trait]
pub trait EventSink: Send + Sync {
    fn component(&self) -> &str;

    async fn emit(&self, event_type: EventType, reason: &str, message: &str) -> Result<()>;
}

#[derive(Clone, Debug, Default)]
pub struct NoopEventSink;

#[async_trait]
impl EventSink for NoopEventSink {
    fn component(&self) -> &str {
        "noop"
    }

    async fn emit(&self, event_type: EventType, reason: &str, message: &str) -> Result<()> {
        debug!(event_type = event_type.as_str(), reason, message, "Dropping event");
        Ok(())
    }
}

/// Publishes Kubernetes events about the leader election `Lease` through
/// the kube runtime event recorder.
pub struct KubeEventSink {
    recorder: Recorder,
    reference: ObjectReference,
    component: String,
}

impl KubeEventSink {
    pub fn new(
        client: Client,
        key: LockKey,
        component: impl Into<String>,
        host: impl Into<String>,
    ) -> Self {
        let component = component.into();
        let reporter = Reporter {
            controller: component.clone(),
            instance: Some(host.into()),
        };
        Self {
            recorder: Recorder::new(client, reporter),
            reference: lease_reference(&key),
            component,
        }
    }
}

/// Reference to the `Lease` that events are attached to.
pub fn lease_reference(key: &LockKey) -> ObjectReference {
    ObjectReference {
        api_version: Some("coordination.k8s.io/v1".to_string()),
        kind: Some("Lease".to_string()),
        name: Some(key.name.clone()),
        namespace: Some(key.namespace.clone()),
        ..Default::default()
    }
}

fn to_runtime_event(event_type: EventType, reason: &str, message: &str) -> events::Event {
    events::Event {
        type_: match event_type {
            EventType::Normal => events::EventType::Normal,
            EventType::Warning => events::EventType::Warning,
        },
        reason: reason.to_string(),
        note: Some(message.to_string()),
        action: reason.to_string(),
        secondary: None,
    }
}

#[async_trait]
impl EventSink for KubeEventSink {
    fn component(&self) -> &str {
        &self.component
    }

    async fn emit(&self, event_type: EventType, reason: &str, message: &str) -> Result<()> {
        let event = to_runtime_event(event_type, reason, message);
        self.recorder.publish(&event, &self.reference).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_type_strings() {
        assert_eq!(EventType::Normal.as_str(), "Normal");
        assert_eq!(EventType::Warning.as_str(), "Warning");
    }

    #[tokio::test]
    async fn test_noop_sink_accepts_events() {
        let sink = NoopEventSink;
        sink.emit(EventType::Normal, "LeaderElection", "pod-1 became leader")
            .await
            .unwrap();
        assert_eq!(sink.component(), "noop");
    }

    #[test]
    fn test_lease_reference() {
        let reference = lease_reference(&LockKey::new("streaming", "liftbridge-operator"));
        assert_eq!(reference.kind.as_deref(), Some("Lease"));
        assert_eq!(reference.api_version.as_deref(), Some("coordination.k8s.io/v1"));
        assert_eq!(reference.name.as_deref(), Some("liftbridge-operator"));
        assert_eq!(reference.namespace.as_deref(), Some("streaming"));
    }

    #[test]
    fn test_runtime_event_fields() {
        let event = to_runtime_event(
            EventType::Warning,
            "LeaderElection",
            "pod-1 stopped leading",
        );
        assert!(matches!(event.type_, events::EventType::Warning));
        assert_eq!(event.reason, "LeaderElection");
        assert_eq!(event.note.as_deref(), Some("pod-1 stopped leading"));
        assert!(event.secondary.is_none());
    }
}
