//! ExternalService sync
//!
//! Egress objects for a service are owned by the name prefix derived from
//! its key, so stale copies in tenants that no longer govern it can be
//! pruned without knowing which rule used to.

use kube::ResourceExt;
use tracing::{debug, info, instrument};

use super::{apply_fragments, Context, ResourceKind, SyncOutcome};
use crate::crd::{has_cleanup_finalizer, is_deleting, ExternalService};
use crate::declaration::Fragment;
use crate::events::actions;
use crate::queue::ObjectKey;
use crate::resolver::EgressResolution;
use crate::tenant::TenantConfig;
use crate::{Error, Result};

/// Converge the appliance onto the current state of one ExternalService
#[instrument(skip(ctx), fields(key = %key))]
pub async fn sync_external_service(ctx: &Context, key: &ObjectKey) -> Result<SyncOutcome> {
    let resolution = ctx.resolver.resolve_external_service(key).await?;
    let namespace = key.namespace_or_default();

    match resolution {
        EgressResolution::Absent => {
            info!("external service not found, nothing to do");
            Ok(SyncOutcome::AlreadyAbsent)
        }
        EgressResolution::Unwatched { service } => {
            debug!("scope has no tenant, pruning");
            release(ctx, key, &service).await
        }
        EgressResolution::Ungoverned { service, .. } => {
            debug!("no governing rule, pruning");
            release(ctx, key, &service).await
        }
        EgressResolution::Governed(governed) if governed.deleting => {
            let removals = removals(ctx, namespace, &key.name, None);
            apply_fragments(ctx, &removals).await?;
            Err(Error::pending(
                key.to_string(),
                format!("still listed by {} rule {}", governed.rule.scope, governed.rule.key),
            ))
        }
        EgressResolution::Governed(governed) => {
            if !has_cleanup_finalizer(&governed.service.metadata) {
                ctx.finalizers
                    .add_finalizer(ResourceKind::ExternalService, key)
                    .await?;
            }

            let mut fragments = vec![ctx.synthesizer.egress_fragment(&governed)];
            fragments.extend(removals(ctx, namespace, &key.name, Some(&governed.tenant)));
            let changes = apply_fragments(ctx, &fragments).await?;
            if changes == 0 {
                return Ok(SyncOutcome::NoOp);
            }

            info!(
                tenant = %governed.tenant,
                rule = %governed.rule.key,
                changes,
                "external service synced"
            );
            ctx.publish_synced(
                ResourceKind::ExternalService,
                key,
                actions::SYNC,
                format!("Applied {changes} change(s) to {}", governed.tenant),
            )
            .await;
            Ok(SyncOutcome::Synced)
        }
    }
}

/// Prune every candidate tenant, then let a deleting object go
async fn release(
    ctx: &Context,
    key: &ObjectKey,
    service: &ExternalService,
) -> Result<SyncOutcome> {
    let removals = removals(ctx, key.namespace_or_default(), &service.name_any(), None);
    let changes = apply_fragments(ctx, &removals).await?;
    if changes > 0 {
        ctx.publish_synced(
            ResourceKind::ExternalService,
            key,
            actions::CLEANUP,
            format!("Removed {changes} stale appliance object(s)"),
        )
        .await;
    }

    if has_cleanup_finalizer(&service.metadata) && is_deleting(&service.metadata) {
        ctx.finalizers
            .remove_finalizer(ResourceKind::ExternalService, key)
            .await?;
        info!("appliance objects removed, finalizer released");
    }

    Ok(if changes > 0 {
        SyncOutcome::Synced
    } else {
        SyncOutcome::NoOp
    })
}

fn removals(
    ctx: &Context,
    namespace: &str,
    name: &str,
    keep: Option<&TenantConfig>,
) -> Vec<Fragment> {
    ctx.resolver
        .tenants()
        .candidates(namespace)
        .into_iter()
        .filter(|t| Some(t) != keep)
        .map(|t| ctx.synthesizer.egress_removal(t, namespace, name))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::appliance::MockAppliance;
    use crate::controller::testing::context;
    use crate::controller::MockFinalizerClient;
    use crate::crd::{Protocol, CLEANUP_FINALIZER};
    use crate::declaration::PatchOp;
    use crate::events::reasons;
    use crate::resolver::fixtures::{deleting, external_service, namespace_rule};
    use crate::resolver::MockRuleStore;
    use mockall::predicate::eq;
    use serde_json::json;

    fn key() -> ObjectKey {
        ObjectKey::namespaced("payments", "stripe")
    }

    fn with_finalizer(mut svc: ExternalService) -> ExternalService {
        svc.metadata.finalizers = Some(vec![CLEANUP_FINALIZER.to_string()]);
        svc
    }

    fn store_with(svc: Option<ExternalService>, listed: bool) -> MockRuleStore {
        let mut store = MockRuleStore::new();
        store
            .expect_get_external_service()
            .returning(move |_| Ok(svc.clone()));
        store.expect_list_namespace_egress_rules().returning(move |_| {
            Ok(if listed {
                vec![namespace_rule("payments", "allow", &["stripe"])]
            } else {
                vec![]
            })
        });
        store
    }

    fn declared_with_stripe() -> serde_json::Value {
        json!({
            "Common": {"class": "Tenant", "Shared": {"class": "Application"}},
            "team_a": {"class": "Tenant", "egress": {
                "class": "Application",
                "k8s_egress_payments_stripe_automap": {"class": "SNAT_Translation", "type": "automap"}
            }}
        })
    }

    #[tokio::test]
    async fn absent_service_is_already_absent() {
        let (ctx, _) = context(
            store_with(None, false),
            MockAppliance::new(),
            MockFinalizerClient::new(),
        );
        assert_eq!(
            sync_external_service(&ctx, &key()).await.unwrap(),
            SyncOutcome::AlreadyAbsent
        );
    }

    #[tokio::test]
    async fn story_governed_service_is_declared_and_finalized() {
        let svc = external_service("payments", "stripe", Some("namespace"));
        let mut appliance = MockAppliance::new();
        appliance
            .expect_get_declaration()
            .returning(|_| Ok(json!({"team_a": {"class": "Tenant", "egress": {"class": "Application"}}})));
        appliance
            .expect_patch()
            .withf(|items| {
                items.iter().all(|i| i.op == PatchOp::Add)
                    && items
                        .iter()
                        .any(|i| i.path == "/team_a/egress/k8s_egress_payments_stripe_vs_https")
            })
            .times(1)
            .returning(|_| Ok(()));
        let mut finalizers = MockFinalizerClient::new();
        finalizers
            .expect_add_finalizer()
            .with(eq(ResourceKind::ExternalService), eq(key()))
            .times(1)
            .returning(|_, _| Ok(()));
        let (ctx, events) = context(store_with(Some(svc), true), appliance, finalizers);

        assert_eq!(
            sync_external_service(&ctx, &key()).await.unwrap(),
            SyncOutcome::Synced
        );
        assert_eq!(events.reasons(), vec![reasons::SYNCED.to_string()]);
    }

    #[tokio::test]
    async fn story_service_dropped_from_rule_is_pruned() {
        let svc = with_finalizer(external_service("payments", "stripe", Some("namespace")));
        let mut appliance = MockAppliance::new();
        appliance
            .expect_get_declaration()
            .returning(|_| Ok(declared_with_stripe()));
        appliance
            .expect_patch()
            .withf(|items| {
                items.len() == 1
                    && items[0].op == PatchOp::Remove
                    && items[0].path == "/team_a/egress/k8s_egress_payments_stripe_automap"
            })
            .times(1)
            .returning(|_| Ok(()));
        let mut finalizers = MockFinalizerClient::new();
        finalizers.expect_remove_finalizer().times(0);
        let (ctx, _) = context(store_with(Some(svc), false), appliance, finalizers);

        assert_eq!(
            sync_external_service(&ctx, &key()).await.unwrap(),
            SyncOutcome::Synced
        );
    }

    #[tokio::test]
    async fn story_deleting_service_waits_until_no_rule_lists_it() {
        let mut svc = with_finalizer(external_service("payments", "stripe", Some("namespace")));
        svc.metadata = deleting(svc.metadata);

        // still listed: objects are removed but the finalizer stays
        let mut appliance = MockAppliance::new();
        appliance
            .expect_get_declaration()
            .returning(|_| Ok(declared_with_stripe()));
        appliance.expect_patch().times(1).returning(|_| Ok(()));
        let mut finalizers = MockFinalizerClient::new();
        finalizers.expect_remove_finalizer().times(0);
        let (ctx, _) = context(store_with(Some(svc.clone()), true), appliance, finalizers);

        let err = sync_external_service(&ctx, &key()).await.unwrap_err();
        assert!(matches!(err, Error::Pending { .. }));
        assert!(err.is_retryable());

        // rule no longer lists it: nothing left to remove, finalizer released
        let mut appliance = MockAppliance::new();
        appliance.expect_get_declaration().returning(|_| {
            Ok(json!({"team_a": {"class": "Tenant", "egress": {"class": "Application"}}}))
        });
        appliance.expect_patch().times(0);
        let mut finalizers = MockFinalizerClient::new();
        finalizers
            .expect_remove_finalizer()
            .with(eq(ResourceKind::ExternalService), eq(key()))
            .times(1)
            .returning(|_, _| Ok(()));
        let (ctx, _) = context(store_with(Some(svc), false), appliance, finalizers);

        assert_eq!(
            sync_external_service(&ctx, &key()).await.unwrap(),
            SyncOutcome::NoOp
        );
    }

    #[tokio::test]
    async fn invalid_bandwidth_is_fatal_and_nothing_is_sent() {
        let mut svc = external_service("payments", "stripe", Some("namespace"));
        svc.spec.ports[0].bandwidth = Some("bwc_3m_irule".into());
        let mut appliance = MockAppliance::new();
        appliance.expect_patch().times(0);
        let (ctx, _) = context(store_with(Some(svc), true), appliance, MockFinalizerClient::new());

        let err = sync_external_service(&ctx, &key()).await.unwrap_err();
        assert!(matches!(err, Error::Validation { .. }));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn duplicate_port_names_are_fatal_and_nothing_is_sent() {
        let mut svc = external_service("payments", "stripe", Some("namespace"));
        let mut dns = svc.spec.ports[0].clone();
        dns.port = 53;
        dns.protocol = Protocol::Udp;
        dns.bandwidth = None;
        svc.spec.ports.push(dns);
        let mut appliance = MockAppliance::new();
        appliance.expect_patch().times(0);
        let (ctx, _) = context(store_with(Some(svc), true), appliance, MockFinalizerClient::new());

        let err = sync_external_service(&ctx, &key()).await.unwrap_err();
        assert!(matches!(err, Error::Validation { .. }));
        assert!(err.to_string().contains("port name https"));
    }
}
