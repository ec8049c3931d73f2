//! Kubernetes Event recording for the cluster controller.
//!
//! Events are **fire-and-forget**: failures are logged as warnings and never
//! propagate errors. A failed event must never break reconciliation.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::{EventType, Recorder, Reporter};
use kube::Client;
use parking_lot::Mutex;
use tracing::warn;

/// Trait for publishing Kubernetes Events.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Publish a Kubernetes Event on the given resource.
    ///
    /// * `reason` - Machine-readable reason (e.g. "PartitionDetected")
    /// * `action` - What was done (e.g. "Repair")
    /// * `note` - Optional human-readable message
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    );
}

/// Production implementation wrapping `kube::runtime::events::Recorder`.
pub struct KubeEventPublisher {
    recorder: Recorder,
}

impl KubeEventPublisher {
    /// Create a publisher reporting as `controller_name`
    pub fn new(client: Client, controller_name: &str) -> Self {
        let reporter = Reporter {
            controller: controller_name.to_string(),
            instance: std::env::var("POD_NAME").ok(),
        };
        Self {
            recorder: Recorder::new(client, reporter),
        }
    }
}

#[async_trait]
impl EventPublisher for KubeEventPublisher {
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    ) {
        let event = kube::runtime::events::Event {
            type_,
            reason: reason.to_string(),
            note,
            action: action.to_string(),
            secondary: None,
        };
        if let Err(e) = self.recorder.publish(&event, resource_ref).await {
            warn!(reason, action, error = %e, "Failed to publish Kubernetes event");
        }
    }
}

/// No-op implementation.
pub struct NoopEventPublisher;

#[async_trait]
impl EventPublisher for NoopEventPublisher {
    async fn publish(
        &self,
        _resource_ref: &ObjectReference,
        _type_: EventType,
        _reason: &str,
        _action: &str,
        _note: Option<String>,
    ) {
    }
}

/// A published event as captured by [`RecordingEventPublisher`]
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RecordedEvent {
    /// Name of the object the event was about
    pub object: Option<String>,
    /// True for Warning events
    pub warning: bool,
    /// Event reason
    pub reason: String,
    /// Event action
    pub action: String,
    /// Event note
    pub note: Option<String>,
}

/// Publisher that keeps events in memory, for tests and dry runs.
#[derive(Default)]
pub struct RecordingEventPublisher {
    events: Mutex<Vec<RecordedEvent>>,
}

impl RecordingEventPublisher {
    /// Events published so far
    pub fn events(&self) -> Vec<RecordedEvent> {
        self.events.lock().clone()
    }

    /// Events with the given reason
    pub fn with_reason(&self, reason: &str) -> Vec<RecordedEvent> {
        self.events
            .lock()
            .iter()
            .filter(|e| e.reason == reason)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl EventPublisher for RecordingEventPublisher {
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    ) {
        self.events.lock().push(RecordedEvent {
            object: resource_ref.name.clone(),
            warning: matches!(type_, EventType::Warning),
            reason: reason.to_string(),
            action: action.to_string(),
            note,
        });
    }
}

/// Well-known event reason strings.
pub mod reasons {
    /// Members disagree on membership and a minority was found
    pub const PARTITION_DETECTED: &str = "PartitionDetected";
    /// A minority member was restarted
    pub const MEMBER_RESTARTED: &str = "MemberRestarted";
    /// Restarting a minority member failed
    pub const MEMBER_RESTART_FAILED: &str = "MemberRestartFailed";
    /// Topology failed validation
    pub const VALIDATION_FAILED: &str = "ValidationFailed";
    /// Topology accepted with warnings (e.g., even primary count)
    pub const TOPOLOGY_WARNING: &str = "TopologyWarning";
    /// Single-primary cluster is being converted to multi-primary
    pub const SCALE_TO_CLUSTER: &str = "ScaleUpSingleToMulti";
    /// Cluster reached Ready
    pub const CLUSTER_READY: &str = "ClusterReady";
    /// Cluster left Ready
    pub const CLUSTER_DEGRADED: &str = "ClusterDegraded";
}

/// Well-known event action strings.
pub mod actions {
    /// Standard reconciliation loop
    pub const RECONCILE: &str = "Reconcile";
    /// Validating the spec
    pub const VALIDATE: &str = "Validate";
    /// Repairing a partition
    pub const REPAIR: &str = "Repair";
    /// Scaling servers
    pub const SCALE: &str = "Scale";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn publishers_are_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<NoopEventPublisher>();
        assert_send_sync::<RecordingEventPublisher>();
    }

    #[tokio::test]
    async fn recording_publisher_captures_events() {
        let publisher = RecordingEventPublisher::default();
        let obj_ref = ObjectReference {
            name: Some("graph".to_string()),
            ..Default::default()
        };
        publisher
            .publish(
                &obj_ref,
                EventType::Warning,
                reasons::PARTITION_DETECTED,
                actions::REPAIR,
                Some("graph-server-2 isolated".to_string()),
            )
            .await;
        NoopEventPublisher
            .publish(&obj_ref, EventType::Normal, reasons::CLUSTER_READY, actions::RECONCILE, None)
            .await;

        let events = publisher.with_reason(reasons::PARTITION_DETECTED);
        assert_eq!(events.len(), 1);
        assert!(events[0].warning);
        assert_eq!(events[0].object.as_deref(), Some("graph"));
        assert_eq!(publisher.events().len(), 1);
    }
}
