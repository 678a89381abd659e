//! Reconciliation of natgate resources against the appliance
//!
//! Each resource kind has its own [`WorkQueue`] and worker pool. Workers
//! pull a key, re-read current state through the [`Resolver`], synthesize
//! complete fragments and apply the difference. Retry decisions are made
//! here from [`Error::is_retryable`]; handlers never sleep or loop.

mod endpoints;
mod external_ip_rule;
mod external_service;
pub mod k8s;
pub mod runner;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::EventType;
#[cfg(test)]
use mockall::automock;
use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::appliance::Appliance;
use crate::config::OperatorConfig;
use crate::declaration::{Fragment, Synthesizer};
use crate::events::{actions, reasons, EventPublisher};
use crate::queue::{ObjectKey, WorkQueue};
use crate::resolver::{Resolver, RuleStore};
use crate::tenant::TenantResolver;
use crate::{Error, Result};

pub use endpoints::sync_endpoints;
pub use external_ip_rule::sync_external_ip_rule;
pub use external_service::sync_external_service;

/// Resource kinds with a work queue
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    /// natgate.dev ExternalService
    ExternalService,
    /// natgate.dev ExternalIPRule
    ExternalIPRule,
    /// core/v1 Endpoints
    Endpoints,
}

impl ResourceKind {
    /// Kind name
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ExternalService => "ExternalService",
            Self::ExternalIPRule => "ExternalIPRule",
            Self::Endpoints => "Endpoints",
        }
    }

    fn api_version(&self) -> &'static str {
        match self {
            Self::ExternalService | Self::ExternalIPRule => "natgate.dev/v1alpha1",
            Self::Endpoints => "v1",
        }
    }

    /// Reference for events about `key`
    pub fn object_ref(&self, key: &ObjectKey) -> ObjectReference {
        ObjectReference {
            api_version: Some(self.api_version().to_string()),
            kind: Some(self.as_str().to_string()),
            name: Some(key.name.clone()),
            namespace: key.namespace.clone(),
            ..Default::default()
        }
    }
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of one successful sync
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyncOutcome {
    /// Appliance was changed
    Synced,
    /// Appliance already matched; nothing sent
    NoOp,
    /// Object is gone and nothing is left to clean up
    AlreadyAbsent,
}

/// Finalizer bookkeeping on natgate objects
#[cfg_attr(test, automock)]
#[async_trait]
pub trait FinalizerClient: Send + Sync {
    /// Add the cleanup finalizer if missing
    async fn add_finalizer(&self, kind: ResourceKind, key: &ObjectKey) -> Result<()>;

    /// Remove the cleanup finalizer; a missing object is not an error
    async fn remove_finalizer(&self, kind: ResourceKind, key: &ObjectKey) -> Result<()>;
}

/// One queue per resource kind
#[derive(Clone)]
pub struct Queues {
    /// ExternalService keys
    pub external_services: WorkQueue<ObjectKey>,
    /// ExternalIPRule keys
    pub external_ip_rules: WorkQueue<ObjectKey>,
    /// Endpoints keys
    pub endpoints: WorkQueue<ObjectKey>,
}

impl Queues {
    /// Create the queues with a shared backoff policy
    pub fn new(retry: crate::retry::RetryConfig) -> Self {
        Self {
            external_services: WorkQueue::new("external-services", retry.clone()),
            external_ip_rules: WorkQueue::new("external-ip-rules", retry.clone()),
            endpoints: WorkQueue::new("endpoints", retry),
        }
    }

    /// Queue for `kind`
    pub fn for_kind(&self, kind: ResourceKind) -> &WorkQueue<ObjectKey> {
        match kind {
            ResourceKind::ExternalService => &self.external_services,
            ResourceKind::ExternalIPRule => &self.external_ip_rules,
            ResourceKind::Endpoints => &self.endpoints,
        }
    }

    /// Stop dispatching on every queue
    pub fn shutdown(&self) {
        self.external_services.shutdown();
        self.external_ip_rules.shutdown();
        self.endpoints.shutdown();
    }
}

/// Shared state handed to every worker
pub struct Context {
    /// Rule resolution over cached reads
    pub resolver: Resolver,
    /// Declaration synthesis
    pub synthesizer: Synthesizer,
    /// Appliance API
    pub appliance: Arc<dyn Appliance>,
    /// Finalizer updates
    pub finalizers: Arc<dyn FinalizerClient>,
    /// Event sink
    pub events: Arc<dyn EventPublisher>,
    /// Work queues, used to fan endpoint changes out to dependents
    pub queues: Queues,
    /// Save the appliance configuration after each change
    pub persist_config: bool,
}

impl Context {
    /// Create a context from operator configuration
    pub fn new(
        store: Arc<dyn RuleStore>,
        config: &OperatorConfig,
        appliance: Arc<dyn Appliance>,
        finalizers: Arc<dyn FinalizerClient>,
        events: Arc<dyn EventPublisher>,
    ) -> Self {
        Self {
            resolver: Resolver::new(
                store,
                TenantResolver::from_config(config),
                config.synthesis.clone(),
            ),
            synthesizer: Synthesizer::new(config.synthesis.clone()),
            appliance,
            finalizers,
            events,
            queues: Queues::new(config.retry_config()),
            persist_config: config.persist_config,
        }
    }

    /// Create a context for testing with mock collaborators
    #[cfg(test)]
    pub fn for_testing(
        store: Arc<dyn crate::resolver::RuleStore>,
        appliance: Arc<dyn Appliance>,
        finalizers: Arc<dyn FinalizerClient>,
        events: Arc<dyn EventPublisher>,
    ) -> Self {
        use crate::config::TenantMapping;

        let config = OperatorConfig {
            tenants: vec![TenantMapping {
                partition: "team_a".into(),
                application: Some("egress".into()),
                namespaces: vec!["payments".into(), "billing".into()],
            }],
            ..Default::default()
        };
        Self::new(store, &config, appliance, finalizers, events)
    }

    async fn publish_synced(
        &self,
        kind: ResourceKind,
        key: &ObjectKey,
        action: &str,
        note: String,
    ) {
        self.events
            .publish(
                &kind.object_ref(key),
                EventType::Normal,
                reasons::SYNCED,
                action,
                Some(note),
            )
            .await;
    }
}

/// Converge the appliance onto `fragments` and return the number of changes
///
/// Each partition is read once; all items go out in a single PATCH.
pub(crate) async fn apply_fragments(ctx: &Context, fragments: &[Fragment]) -> Result<usize> {
    let mut current: HashMap<&str, Value> = HashMap::new();
    let mut items = Vec::new();

    for fragment in fragments {
        let partition = fragment.tenant.partition.as_str();
        if !current.contains_key(partition) {
            let declared = ctx.appliance.get_declaration(partition).await?;
            current.insert(partition, declared);
        }
        if let Some(declared) = current.get_mut(partition) {
            let planned = fragment.plan(declared)?;
            for item in &planned {
                item.apply_to(declared);
            }
            items.extend(planned);
        }
    }

    if items.is_empty() {
        debug!("appliance already converged");
        return Ok(0);
    }

    ctx.appliance.patch(&items).await?;
    if ctx.persist_config {
        ctx.appliance.save_config().await?;
    }
    Ok(items.len())
}

async fn handle(ctx: &Context, kind: ResourceKind, key: &ObjectKey) -> Result<SyncOutcome> {
    match kind {
        ResourceKind::ExternalService => sync_external_service(ctx, key).await,
        ResourceKind::ExternalIPRule => sync_external_ip_rule(ctx, key).await,
        ResourceKind::Endpoints => sync_endpoints(ctx, key).await,
    }
}

/// Dequeue, handle and acknowledge keys until the queue shuts down
///
/// Retryable failures are requeued with per-key backoff; fatal ones are
/// dropped and surfaced as a Warning event on the object.
pub async fn run_worker(ctx: Arc<Context>, kind: ResourceKind, id: usize) {
    let queue = ctx.queues.for_kind(kind).clone();
    debug!(%kind, worker = id, "worker started");

    while let Some(key) = queue.dequeue().await {
        match handle(&ctx, kind, &key).await {
            Ok(outcome) => {
                debug!(%kind, key = %key, ?outcome, "sync complete");
                queue.ack_success(&key);
            }
            Err(e @ Error::Pending { .. }) => {
                info!(%kind, key = %key, reason = %e, "waiting before cleanup");
                queue.ack_retry(&key);
            }
            Err(e) => {
                let retryable = e.is_retryable();
                if retryable {
                    warn!(%kind, key = %key, error = %e, requeues = queue.num_requeues(&key), "sync failed, requeuing");
                    queue.ack_retry(&key);
                } else {
                    error!(%kind, key = %key, error = %e, "sync failed permanently");
                    queue.ack_success(&key);
                }
                if kind != ResourceKind::Endpoints {
                    ctx.events
                        .publish(
                            &kind.object_ref(&key),
                            EventType::Warning,
                            e.reason(),
                            actions::SYNC,
                            Some(e.to_string()),
                        )
                        .await;
                }
            }
        }
    }

    debug!(%kind, worker = id, "worker stopped");
}


#[cfg(test)]
mod tests {
    use super::testing::context;
    use super::*;
    use crate::appliance::MockAppliance;
    use crate::declaration::{AddressList, Resource};
    use crate::resolver::fixtures::ip_rule;
    use crate::resolver::MockRuleStore;
    use serde_json::json;
    use std::time::Duration;

    #[test]
    fn object_refs_carry_kind_and_key() {
        let r = ResourceKind::ExternalIPRule.object_ref(&ObjectKey::namespaced("payments", "r"));
        assert_eq!(r.kind.as_deref(), Some("ExternalIPRule"));
        assert_eq!(r.api_version.as_deref(), Some("natgate.dev/v1alpha1"));
        assert_eq!(r.namespace.as_deref(), Some("payments"));
    }

    #[tokio::test]
    async fn converged_appliance_gets_no_patch() {
        let mut appliance = MockAppliance::new();
        appliance
            .expect_get_declaration()
            .times(1)
            .returning(|_| Ok(json!({"team_a": {"class": "Tenant", "egress": {"class": "Application"}}})));
        appliance.expect_patch().times(0);
        let (ctx, _) = context(MockRuleStore::new(), appliance, MockFinalizerClient::new());

        let fragments = vec![
            ctx.synthesizer
                .egress_removal(crate::tenant::TenantConfig::new("team_a", "egress"), "payments", "a"),
            ctx.synthesizer
                .egress_removal(crate::tenant::TenantConfig::new("team_a", "egress"), "payments", "b"),
        ];
        assert_eq!(apply_fragments(&ctx, &fragments).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn story_fragments_for_a_new_partition_share_one_tenant_add() {
        let mut appliance = MockAppliance::new();
        appliance
            .expect_get_declaration()
            .with(mockall::predicate::eq("team_a"))
            .times(1)
            .returning(|_| Ok(json!({})));
        appliance
            .expect_patch()
            .withf(|items| {
                let tenant_adds = items.iter().filter(|i| i.path == "/team_a").count();
                tenant_adds == 1
                    && items
                        .iter()
                        .any(|i| i.path == "/team_a/egress/k8s_snat_payments_a_src_address")
            })
            .times(1)
            .returning(|_| Ok(()));
        let (ctx, _) = context(MockRuleStore::new(), appliance, MockFinalizerClient::new());

        let tenant = crate::tenant::TenantConfig::new("team_a", "egress");
        let mut egress = Fragment::new(tenant.clone(), "k8s_egress_payments_api_");
        egress.insert(
            "k8s_egress_payments_api_dst_address",
            Resource::AddressList(AddressList {
                addresses: vec!["203.0.113.1".into()],
            }),
        );
        let mut snat = Fragment::new(tenant, "k8s_snat");
        snat.insert(
            "k8s_snat_payments_a_src_address",
            Resource::AddressList(AddressList {
                addresses: vec!["192.168.1.5".into()],
            }),
        );

        assert_eq!(apply_fragments(&ctx, &[egress, snat]).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn story_worker_drops_fatal_errors_with_warning_event() {
        let mut store = MockRuleStore::new();
        let mut invalid = ip_rule("payments", "bad", None, &["svc-a"]);
        invalid.spec.external_addresses.clear();
        let listed = invalid.clone();
        store
            .expect_get_external_ip_rule()
            .returning(move |_| Ok(Some(invalid.clone())));
        store
            .expect_list_external_ip_rules()
            .returning(move || Ok(vec![listed.clone()]));
        let mut appliance = MockAppliance::new();
        appliance.expect_patch().times(0);
        let (ctx, events) = context(store, appliance, MockFinalizerClient::new());

        let key = ObjectKey::namespaced("payments", "bad");
        ctx.queues.external_ip_rules.add(key.clone());
        let worker = tokio::spawn(run_worker(ctx.clone(), ResourceKind::ExternalIPRule, 0));

        tokio::time::timeout(Duration::from_secs(5), async {
            while events.reasons().is_empty() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();

        ctx.queues.shutdown();
        worker.await.unwrap();
        assert_eq!(events.reasons(), vec![reasons::INVALID_SPEC.to_string()]);
        assert_eq!(ctx.queues.external_ip_rules.num_requeues(&key), 0);
    }

    #[tokio::test]
    async fn story_worker_requeues_retryable_errors() {
        let mut store = MockRuleStore::new();
        let rule = ip_rule("payments", "r", None, &["svc-a"]);
        let listed = rule.clone();
        store
            .expect_get_external_ip_rule()
            .returning(move |_| Ok(Some(rule.clone())));
        store
            .expect_list_external_ip_rules()
            .returning(move || Ok(vec![listed.clone()]));
        store
            .expect_get_endpoint_addresses()
            .returning(|_, _| Ok(Some(vec![])));
        let mut finalizers = MockFinalizerClient::new();
        finalizers.expect_add_finalizer().returning(|_, _| Ok(()));
        let (ctx, events) = context(store, MockAppliance::new(), finalizers);

        let key = ObjectKey::namespaced("payments", "r");
        ctx.queues.external_ip_rules.add(key.clone());
        let worker = tokio::spawn(run_worker(ctx.clone(), ResourceKind::ExternalIPRule, 0));

        tokio::time::timeout(Duration::from_secs(5), async {
            while ctx.queues.external_ip_rules.num_requeues(&key) == 0 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();

        ctx.queues.shutdown();
        worker.await.unwrap();
        assert!(events.reasons().contains(&reasons::SYNC_FAILED.to_string()));
    }
}
