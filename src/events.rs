//! Kubernetes Event recording for natgate controllers.
//!
//! Sync results land on the owning object as standard Events, so
//! `kubectl describe externaliprule foo` shows why the appliance refused it.
//!
//! Events are fire-and-forget: failures are logged and never propagate.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::Client;
use tracing::warn;

/// Reporting component name on every Event
pub const CONTROLLER_NAME: &str = "natgate-controller";

/// Sink for Kubernetes Events
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Publish an Event on `resource_ref`
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    );
}

/// Publisher backed by `kube::runtime::events::Recorder`
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
        let event = Event {
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

/// Publisher that drops everything
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

/// Event reasons (REASON column of `kubectl get events`)
pub mod reasons {
    /// Appliance now matches the object
    pub const SYNCED: &str = "Synced";
    /// Sync failed and will be retried
    pub const SYNC_FAILED: &str = "SyncFailed";
    /// Spec can never be synced as written
    pub const INVALID_SPEC: &str = "InvalidSpec";
    /// Appliance returned a structured rejection
    pub const APPLIANCE_REJECTED: &str = "ApplianceRejected";
}

/// Event actions (ACTION column of `kubectl get events`)
pub mod actions {
    /// Declaration applied or pruned
    pub const SYNC: &str = "Sync";
    /// Appliance objects removed ahead of deletion
    pub const CLEANUP: &str = "Cleanup";
}
