//! Kubernetes Event recording for the MPIJob controller.
//!
//! Provides a trait-based abstraction over `kube::runtime::events::Recorder`
//! so that the reconciliation engine can emit standard Kubernetes Events
//! visible via `kubectl describe mpijob`.
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
///
/// Implementations are expected to be fire-and-forget: `publish()` logs a
/// warning on failure but never returns an error.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Publish a Kubernetes Event on the given resource.
    ///
    /// # Arguments
    ///
    /// * `resource_ref` - The Kubernetes object this event is about
    /// * `type_` - Normal or Warning
    /// * `reason` - Machine-readable reason string (e.g. "MPIJobRunning")
    /// * `action` - What action was taken (e.g. "Reconcile")
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
    /// Create a new publisher for the given controller name.
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
            warn!(
                reason,
                action,
                error = %e,
                "Failed to publish Kubernetes event"
            );
        }
    }
}

/// No-op implementation for tests.
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

/// A published event as seen by [`RecordingEventPublisher`]
#[derive(Clone, Debug, PartialEq)]
pub struct RecordedEvent {
    /// Name of the object the event was attached to
    pub object: Option<String>,
    /// True for Warning events
    pub warning: bool,
    /// Reason string
    pub reason: String,
    /// Optional note
    pub note: Option<String>,
}

/// In-memory publisher that keeps every event, for assertions in tests.
#[derive(Default)]
pub struct RecordingEventPublisher {
    events: Mutex<Vec<RecordedEvent>>,
}

impl RecordingEventPublisher {
    /// Create an empty recorder
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of all events published so far
    pub fn events(&self) -> Vec<RecordedEvent> {
        self.events.lock().clone()
    }

    /// Number of events with the given reason
    pub fn count(&self, reason: &str) -> usize {
        self.events
            .lock()
            .iter()
            .filter(|e| e.reason == reason)
            .count()
    }
}

#[async_trait]
impl EventPublisher for RecordingEventPublisher {
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        _action: &str,
        note: Option<String>,
    ) {
        self.events.lock().push(RecordedEvent {
            object: resource_ref.name.clone(),
            warning: matches!(type_, EventType::Warning),
            reason: reason.to_string(),
            note,
        });
    }
}

/// Well-known event reason strings.
///
/// These appear in `kubectl get events` under the REASON column.
pub mod reasons {
    /// First reconcile of a job
    pub const JOB_CREATED: &str = "MPIJobCreated";
    /// Launcher is running
    pub const JOB_RUNNING: &str = "MPIJobRunning";
    /// Launcher completed successfully
    pub const JOB_SUCCEEDED: &str = "MPIJobSucceeded";
    /// Job failed terminally
    pub const JOB_FAILED: &str = "MPIJobFailed";
    /// A failed attempt is being restarted
    pub const JOB_RESTARTING: &str = "MPIJobRestarting";
    /// Spec can never converge
    pub const VALIDATION_FAILED: &str = "ValidationFailed";
    /// An owned resource could not be created
    pub const FAILED_CREATE: &str = "FailedCreate";
    /// The attempt exceeded its active deadline while running
    pub const DEADLINE_EXCEEDED: &str = "DeadlineExceeded";
    /// Workers did not become ready within the active deadline
    pub const WORKER_NOT_READY: &str = "WorkerNotReady";
    /// A worker failed while the launcher was running
    pub const WORKER_FAILED: &str = "WorkerFailed";
}

/// Well-known event action strings.
///
/// These appear in `kubectl get events` under the ACTION column.
pub mod actions {
    /// Standard reconciliation loop
    pub const RECONCILE: &str = "Reconcile";
    /// Creating owned resources
    pub const CREATE: &str = "Create";
    /// Tearing down execution units
    pub const DELETE: &str = "Delete";
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
    async fn noop_publisher_does_not_panic() {
        let publisher = NoopEventPublisher;
        let obj_ref = ObjectReference::default();
        publisher
            .publish(
                &obj_ref,
                EventType::Normal,
                reasons::JOB_RUNNING,
                actions::RECONCILE,
                Some("test".to_string()),
            )
            .await;
    }

    #[tokio::test]
    async fn recording_publisher_keeps_events() {
        let publisher = RecordingEventPublisher::new();
        let obj_ref = ObjectReference {
            name: Some("train1".to_string()),
            ..Default::default()
        };
        publisher
            .publish(
                &obj_ref,
                EventType::Warning,
                reasons::FAILED_CREATE,
                actions::CREATE,
                None,
            )
            .await;

        let events = publisher.events();
        assert_eq!(events.len(), 1);
        assert!(events[0].warning);
        assert_eq!(events[0].object.as_deref(), Some("train1"));
        assert_eq!(publisher.count(reasons::FAILED_CREATE), 1);
    }
}
