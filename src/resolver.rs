//! Rule resolution
//!
//! Given the key of a changed object, decide which rules govern it and which
//! tenant the result belongs to. Every call reads fresh snapshots from the
//! [`RuleStore`]; nothing is cached between reconciliations.

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use kube::ResourceExt;
use tracing::{debug, warn};

use crate::config::SynthesisConfig;
use crate::crd::{
    is_deleting, ClusterEgressRule, EgressRule, ExternalIPRule, ExternalIPRuleSpec,
    ExternalService, NamespaceEgressRule, RuleType, ServiceEgressRule,
};
use crate::queue::ObjectKey;
use crate::tenant::{TenantConfig, TenantResolver};
use crate::{Error, Result};

/// Cached reads of every resource the resolver consults
#[cfg_attr(test, automock)]
#[async_trait]
pub trait RuleStore: Send + Sync {
    /// ExternalService by key
    async fn get_external_service(&self, key: &ObjectKey) -> Result<Option<ExternalService>>;

    /// Every ExternalService in the cluster
    async fn list_external_services(&self) -> Result<Vec<ExternalService>>;

    /// Every ClusterEgressRule
    async fn list_cluster_egress_rules(&self) -> Result<Vec<ClusterEgressRule>>;

    /// NamespaceEgressRules in `namespace`
    async fn list_namespace_egress_rules(&self, namespace: &str)
        -> Result<Vec<NamespaceEgressRule>>;

    /// ServiceEgressRules in `namespace`
    async fn list_service_egress_rules(&self, namespace: &str) -> Result<Vec<ServiceEgressRule>>;

    /// ExternalIPRule by key
    async fn get_external_ip_rule(&self, key: &ObjectKey) -> Result<Option<ExternalIPRule>>;

    /// Every ExternalIPRule in the cluster
    async fn list_external_ip_rules(&self) -> Result<Vec<ExternalIPRule>>;

    /// Ready endpoint addresses of a service; `None` when no Endpoints object exists
    async fn get_endpoint_addresses(
        &self,
        namespace: &str,
        service: &str,
    ) -> Result<Option<Vec<String>>>;
}

/// The rule object that won resolution
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GoverningRule {
    /// Scope the rule belongs to
    pub scope: RuleType,
    /// Key of the rule object
    pub key: ObjectKey,
}

/// An external service together with the rule that governs it
#[derive(Clone, Debug)]
pub struct GovernedService {
    /// Snapshot of the service
    pub service: ExternalService,
    /// Winning rule
    pub rule: GoverningRule,
    /// Target tenant
    pub tenant: TenantConfig,
    /// Sorted, de-duplicated source addresses (Service scope only)
    pub source_addresses: Vec<String>,
    /// Service carries a deletion timestamp
    pub deleting: bool,
}

/// Outcome of resolving an ExternalService
#[derive(Clone, Debug)]
pub enum EgressResolution {
    /// Object no longer exists
    Absent,
    /// Scope maps to a namespace with no configured tenant
    Unwatched {
        /// Snapshot of the service
        service: ExternalService,
    },
    /// No label, or no rule in the labelled scope lists the service
    Ungoverned {
        /// Snapshot of the service
        service: ExternalService,
        /// Service carries a deletion timestamp
        deleting: bool,
    },
    /// Exactly one rule governs the service
    Governed(Box<GovernedService>),
}

/// One ExternalIPRule ready for synthesis
#[derive(Clone, Debug, PartialEq)]
pub struct ResolvedSnatRule {
    /// Rule key
    pub key: ObjectKey,
    /// Spec with defaults applied
    pub spec: ExternalIPRuleSpec,
    /// Sorted, de-duplicated endpoint addresses of every listed service
    pub source_addresses: Vec<String>,
}

impl ResolvedSnatRule {
    /// Effective priority
    pub fn priority(&self) -> u32 {
        self.spec.priority.unwrap_or_default()
    }
}

/// Every live ExternalIPRule that shares a tenant
#[derive(Clone, Debug)]
pub struct SnatScope {
    /// Target tenant
    pub tenant: TenantConfig,
    /// Rules ordered by (priority, namespace, name)
    pub rules: Vec<ResolvedSnatRule>,
    /// Key being removed, excluded from `rules` even if a cache still holds it
    pub removed: Option<ObjectKey>,
    /// Snapshot of the rule that triggered resolution, if it still exists
    pub trigger: Option<ExternalIPRule>,
}

/// Outcome of resolving an ExternalIPRule
#[derive(Clone, Debug)]
pub enum SnatResolution {
    /// Namespace has no configured tenant
    Unwatched {
        /// Snapshot of the rule, if it still exists
        trigger: Option<ExternalIPRule>,
    },
    /// Complete rule set for the tenant
    Resolved(SnatScope),
}

/// Objects whose synthesis reads a given endpoint set
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct EndpointDependents {
    /// ExternalIPRules listing the service
    pub external_ip_rules: Vec<ObjectKey>,
    /// ExternalServices governed by a ServiceEgressRule on the service
    pub external_services: Vec<ObjectKey>,
}

/// Resolves governing rules and tenants
pub struct Resolver {
    store: Arc<dyn RuleStore>,
    tenants: TenantResolver,
    synthesis: SynthesisConfig,
}

impl Resolver {
    /// Create a resolver over `store`
    pub fn new(store: Arc<dyn RuleStore>, tenants: TenantResolver, synthesis: SynthesisConfig) -> Self {
        Self {
            store,
            tenants,
            synthesis,
        }
    }

    /// Tenant table
    pub fn tenants(&self) -> &TenantResolver {
        &self.tenants
    }

    /// Find the rule governing an ExternalService
    ///
    /// Only the rule kind selected by the service's rule-type label is
    /// consulted. Within that kind the first rule listing the service wins;
    /// the listing order of the store is not guaranteed.
    pub async fn resolve_external_service(&self, key: &ObjectKey) -> Result<EgressResolution> {
        let Some(service) = self.store.get_external_service(key).await? else {
            return Ok(EgressResolution::Absent);
        };
        let namespace = key.namespace_or_default();
        let deleting = is_deleting(&service.metadata);

        let Some(scope) = RuleType::of(&service.metadata) else {
            debug!(key = %key, "no rule-type label");
            return Ok(EgressResolution::Ungoverned { service, deleting });
        };
        let Some(tenant) = self.tenants.for_scope(scope, namespace).cloned() else {
            debug!(key = %key, %scope, "namespace has no tenant");
            return Ok(EgressResolution::Unwatched { service });
        };

        // removal must never be blocked by an invalid spec
        if !deleting {
            service.validate(&self.synthesis)?;
        }

        let name = service.name_any();
        let (rule, source_service) = match scope {
            RuleType::Global => {
                let rules = self.store.list_cluster_egress_rules().await?;
                (first_match(&rules, &name), None)
            }
            RuleType::Namespace => {
                let rules = self.store.list_namespace_egress_rules(namespace).await?;
                (first_match(&rules, &name), None)
            }
            RuleType::Service => {
                let rules = self.store.list_service_egress_rules(namespace).await?;
                let found = rules.iter().find(|r| r.governs(&name));
                (
                    found.map(ObjectKey::from_resource),
                    found.map(|r| r.spec.service.clone()),
                )
            }
        };

        let Some(rule_key) = rule else {
            debug!(key = %key, %scope, "no rule lists this service");
            return Ok(EgressResolution::Ungoverned { service, deleting });
        };

        let source_addresses = match source_service {
            Some(src) if !deleting => self.endpoint_addresses(namespace, &src).await?,
            _ => Vec::new(),
        };

        Ok(EgressResolution::Governed(Box::new(GovernedService {
            service,
            rule: GoverningRule {
                scope,
                key: rule_key,
            },
            tenant,
            source_addresses,
            deleting,
        })))
    }

    /// Collect the full SNAT rule set of the tenant an ExternalIPRule maps to
    ///
    /// Fails fast when any included rule lists a service without endpoint
    /// addresses; a partial rule set would drop live entries.
    pub async fn resolve_external_ip_rule(&self, key: &ObjectKey) -> Result<SnatResolution> {
        let trigger = self.store.get_external_ip_rule(key).await?;
        let Some(tenant) = self.tenants.for_namespace(key.namespace_or_default()).cloned() else {
            return Ok(SnatResolution::Unwatched { trigger });
        };
        let removed = match &trigger {
            Some(rule) if !is_deleting(&rule.metadata) => None,
            _ => Some(key.clone()),
        };

        let mut rules = Vec::new();
        for rule in self.store.list_external_ip_rules().await? {
            let rule_key = ObjectKey::from_resource(&rule);
            if is_deleting(&rule.metadata) || removed.as_ref() == Some(&rule_key) {
                continue;
            }
            let ns = rule_key.namespace_or_default();
            if self.tenants.for_namespace(ns) != Some(&tenant) {
                continue;
            }
            if let Err(e) = validate_snat_rule(&rule_key, &rule.spec) {
                if rule_key == *key {
                    return Err(e);
                }
                warn!(key = %rule_key, error = %e, "skipping invalid ExternalIPRule");
                continue;
            }

            let mut spec = rule.spec.clone();
            spec.apply_defaults(self.synthesis.default_priority);

            let mut sources = BTreeSet::new();
            for svc in &spec.services {
                sources.extend(self.endpoint_addresses(ns, svc).await?);
            }

            rules.push(ResolvedSnatRule {
                key: rule_key,
                spec,
                source_addresses: sources.into_iter().collect(),
            });
        }

        rules.sort_by(|a, b| {
            a.priority()
                .cmp(&b.priority())
                .then_with(|| a.key.cmp(&b.key))
        });

        Ok(SnatResolution::Resolved(SnatScope {
            tenant,
            rules,
            removed,
            trigger,
        }))
    }

    /// Objects that must be re-synced when an endpoint set changes
    pub async fn affected_by_endpoints(
        &self,
        namespace: &str,
        service: &str,
    ) -> Result<EndpointDependents> {
        let mut out = EndpointDependents::default();

        for rule in self.store.list_external_ip_rules().await? {
            if rule.namespace().as_deref() == Some(namespace)
                && rule.spec.services.iter().any(|s| s == service)
            {
                out.external_ip_rules.push(ObjectKey::from_resource(&rule));
            }
        }

        let mut services = BTreeSet::new();
        for rule in self.store.list_service_egress_rules(namespace).await? {
            if rule.spec.service == service {
                services.extend(
                    rule.spec
                        .external_services
                        .iter()
                        .map(|name| ObjectKey::namespaced(namespace, name)),
                );
            }
        }
        out.external_services = services.into_iter().collect();
        out.external_ip_rules.sort();
        Ok(out)
    }

    /// ExternalServices whose governing rule may change when a rule of
    /// `scope` changes
    ///
    /// Every service labelled with the scope is returned, not only those the
    /// rule lists now, so a service dropped from a rule is pruned as well.
    pub async fn external_services_for_rule_change(
        &self,
        scope: RuleType,
        namespace: Option<&str>,
    ) -> Result<Vec<ObjectKey>> {
        let mut keys: Vec<ObjectKey> = self
            .store
            .list_external_services()
            .await?
            .iter()
            .filter(|svc| RuleType::of(&svc.metadata) == Some(scope))
            .filter(|svc| namespace.is_none() || svc.namespace().as_deref() == namespace)
            .map(ObjectKey::from_resource)
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn endpoint_addresses(&self, namespace: &str, service: &str) -> Result<Vec<String>> {
        match self.store.get_endpoint_addresses(namespace, service).await? {
            Some(addrs) if !addrs.is_empty() => {
                let set: BTreeSet<String> = addrs.into_iter().collect();
                Ok(set.into_iter().collect())
            }
            _ => Err(Error::empty_endpoints(namespace, service)),
        }
    }
}

fn first_match<R>(rules: &[R], name: &str) -> Option<ObjectKey>
where
    R: EgressRule + kube::Resource,
{
    rules
        .iter()
        .find(|r| r.governs(name))
        .map(ObjectKey::from_resource)
}

fn validate_snat_rule(key: &ObjectKey, spec: &ExternalIPRuleSpec) -> Result<()> {
    if spec.services.is_empty() {
        return Err(Error::validation(key.to_string(), "services must not be empty"));
    }
    if spec.external_addresses.is_empty() {
        return Err(Error::validation(
            key.to_string(),
            "externalAddresses must not be empty",
        ));
    }
    Ok(())
}


#[cfg(test)]
mod tests {
    use super::fixtures::*;
    use super::*;
    use crate::config::{OperatorConfig, TenantMapping};
    use mockall::predicate::eq;

    fn tenants() -> TenantResolver {
        TenantResolver::from_config(&OperatorConfig {
            tenants: vec![
                TenantMapping {
                    partition: "team_a".into(),
                    application: Some("egress".into()),
                    namespaces: vec!["payments".into(), "billing".into()],
                },
                TenantMapping {
                    partition: "team_b".into(),
                    application: None,
                    namespaces: vec!["search".into()],
                },
            ],
            ..Default::default()
        })
    }

    fn resolver(store: MockRuleStore) -> Resolver {
        Resolver::new(Arc::new(store), tenants(), SynthesisConfig::default())
    }

    fn governed(res: EgressResolution) -> GovernedService {
        match res {
            EgressResolution::Governed(g) => *g,
            other => panic!("expected Governed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn absent_service_resolves_to_absent() {
        let mut store = MockRuleStore::new();
        store.expect_get_external_service().returning(|_| Ok(None));
        let res = resolver(store)
            .resolve_external_service(&ObjectKey::namespaced("payments", "api"))
            .await
            .unwrap();
        assert!(matches!(res, EgressResolution::Absent));
    }

    #[tokio::test]
    async fn story_label_selects_scope_and_other_scopes_are_ignored() {
        let mut store = MockRuleStore::new();
        store
            .expect_get_external_service()
            .returning(|_| Ok(Some(external_service("payments", "api", Some("namespace")))));
        store.expect_list_cluster_egress_rules().times(0);
        store.expect_list_service_egress_rules().times(0);
        store
            .expect_list_namespace_egress_rules()
            .with(eq("payments"))
            .returning(|_| Ok(vec![namespace_rule("payments", "ns-rule", &["api"])]));

        let g = governed(
            resolver(store)
                .resolve_external_service(&ObjectKey::namespaced("payments", "api"))
                .await
                .unwrap(),
        );
        assert_eq!(g.rule.scope, RuleType::Namespace);
        assert_eq!(g.rule.key, ObjectKey::namespaced("payments", "ns-rule"));
        assert_eq!(g.tenant, TenantConfig::new("team_a", "egress"));
    }

    #[tokio::test]
    async fn story_relabelling_moves_governance_to_cluster_rule() {
        let mut store = MockRuleStore::new();
        store
            .expect_get_external_service()
            .returning(|_| Ok(Some(external_service("payments", "api", Some("global")))));
        store.expect_list_namespace_egress_rules().times(0);
        store
            .expect_list_cluster_egress_rules()
            .returning(|| Ok(vec![cluster_rule("everyone", &["api"])]));

        let g = governed(
            resolver(store)
                .resolve_external_service(&ObjectKey::namespaced("payments", "api"))
                .await
                .unwrap(),
        );
        assert_eq!(g.rule.key, ObjectKey::cluster("everyone"));
        assert_eq!(g.tenant, TenantConfig::new("Common", "Shared"));
    }

    #[tokio::test]
    async fn first_match_selects_exactly_one_rule() {
        let mut store = MockRuleStore::new();
        store
            .expect_get_external_service()
            .returning(|_| Ok(Some(external_service("payments", "api", Some("namespace")))));
        store.expect_list_namespace_egress_rules().returning(|_| {
            Ok(vec![
                namespace_rule("payments", "unrelated", &["db"]),
                namespace_rule("payments", "r1", &["api"]),
                namespace_rule("payments", "r2", &["api", "db"]),
            ])
        });

        let g = governed(
            resolver(store)
                .resolve_external_service(&ObjectKey::namespaced("payments", "api"))
                .await
                .unwrap(),
        );
        let candidates = [
            ObjectKey::namespaced("payments", "r1"),
            ObjectKey::namespaced("payments", "r2"),
        ];
        assert_eq!(candidates.iter().filter(|k| **k == g.rule.key).count(), 1);
    }

    #[tokio::test]
    async fn no_listing_rule_is_ungoverned() {
        let mut store = MockRuleStore::new();
        store
            .expect_get_external_service()
            .returning(|_| Ok(Some(external_service("payments", "api", Some("namespace")))));
        store
            .expect_list_namespace_egress_rules()
            .returning(|_| Ok(vec![namespace_rule("payments", "r1", &["db"])]));

        let res = resolver(store)
            .resolve_external_service(&ObjectKey::namespaced("payments", "api"))
            .await
            .unwrap();
        assert!(matches!(res, EgressResolution::Ungoverned { deleting: false, .. }));
    }

    #[tokio::test]
    async fn unmapped_namespace_is_unwatched() {
        let mut store = MockRuleStore::new();
        store
            .expect_get_external_service()
            .returning(|_| Ok(Some(external_service("kube-system", "api", Some("namespace")))));
        let res = resolver(store)
            .resolve_external_service(&ObjectKey::namespaced("kube-system", "api"))
            .await
            .unwrap();
        assert!(matches!(res, EgressResolution::Unwatched { .. }));
    }

    #[tokio::test]
    async fn service_scope_collects_sorted_endpoint_addresses() {
        let mut store = MockRuleStore::new();
        store
            .expect_get_external_service()
            .returning(|_| Ok(Some(external_service("payments", "api", Some("service")))));
        store
            .expect_list_service_egress_rules()
            .returning(|_| Ok(vec![service_rule("payments", "r1", "checkout", &["api"])]));
        store
            .expect_get_endpoint_addresses()
            .with(eq("payments"), eq("checkout"))
            .returning(|_, _| {
                Ok(Some(vec![
                    "192.168.1.6".into(),
                    "192.168.1.5".into(),
                    "192.168.1.6".into(),
                ]))
            });

        let g = governed(
            resolver(store)
                .resolve_external_service(&ObjectKey::namespaced("payments", "api"))
                .await
                .unwrap(),
        );
        assert_eq!(g.source_addresses, vec!["192.168.1.5", "192.168.1.6"]);
    }

    #[tokio::test]
    async fn service_scope_with_empty_endpoints_is_retryable_error() {
        let mut store = MockRuleStore::new();
        store
            .expect_get_external_service()
            .returning(|_| Ok(Some(external_service("payments", "api", Some("service")))));
        store
            .expect_list_service_egress_rules()
            .returning(|_| Ok(vec![service_rule("payments", "r1", "checkout", &["api"])]));
        store
            .expect_get_endpoint_addresses()
            .returning(|_, _| Ok(Some(vec![])));

        let err = resolver(store)
            .resolve_external_service(&ObjectKey::namespaced("payments", "api"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::EmptyEndpoints { .. }));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn unsupported_bandwidth_fails_unless_deleting() {
        let bad = || {
            let mut svc = external_service("payments", "api", Some("namespace"));
            svc.spec.ports[0].bandwidth = Some("bwc_3m_irule".into());
            svc
        };

        let mut store = MockRuleStore::new();
        store
            .expect_get_external_service()
            .returning(move |_| Ok(Some(bad())));
        let err = resolver(store)
            .resolve_external_service(&ObjectKey::namespaced("payments", "api"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation { .. }));

        let mut store = MockRuleStore::new();
        store.expect_get_external_service().returning(move |_| {
            let mut svc = bad();
            svc.metadata = deleting(svc.metadata);
            Ok(Some(svc))
        });
        store
            .expect_list_namespace_egress_rules()
            .returning(|_| Ok(vec![namespace_rule("payments", "r1", &["api"])]));
        let g = governed(
            resolver(store)
                .resolve_external_service(&ObjectKey::namespaced("payments", "api"))
                .await
                .unwrap(),
        );
        assert!(g.deleting);
    }

    fn snat_store(rules: Vec<ExternalIPRule>, trigger: Option<ExternalIPRule>) -> MockRuleStore {
        let mut store = MockRuleStore::new();
        store
            .expect_get_external_ip_rule()
            .returning(move |_| Ok(trigger.clone()));
        store
            .expect_list_external_ip_rules()
            .returning(move || Ok(rules.clone()));
        store.expect_get_endpoint_addresses().returning(|_, svc| {
            Ok(match svc {
                "svc-a" => Some(vec!["192.168.1.6".into(), "192.168.1.5".into()]),
                "svc-b" => Some(vec!["192.168.2.1".into()]),
                "svc-empty" => Some(vec![]),
                _ => None,
            })
        });
        store
    }

    fn resolved(res: SnatResolution) -> SnatScope {
        match res {
            SnatResolution::Resolved(scope) => scope,
            SnatResolution::Unwatched { .. } => panic!("expected Resolved"),
        }
    }

    #[tokio::test]
    async fn story_snat_scope_is_complete_defaulted_and_ordered() {
        let trigger = ip_rule("payments", "b", None, &["svc-a"]);
        let rules = vec![
            trigger.clone(),
            ip_rule("billing", "a", Some(1000), &["svc-b"]),
            ip_rule("payments", "first", Some(500), &["svc-a", "svc-b"]),
            // other tenant
            ip_rule("search", "x", Some(1), &["svc-a"]),
        ];
        let scope = resolved(
            resolver(snat_store(rules, Some(trigger)))
                .resolve_external_ip_rule(&ObjectKey::namespaced("payments", "b"))
                .await
                .unwrap(),
        );

        assert_eq!(scope.tenant, TenantConfig::new("team_a", "egress"));
        assert!(scope.removed.is_none());
        let order: Vec<String> = scope.rules.iter().map(|r| r.key.to_string()).collect();
        assert_eq!(order, vec!["payments/first", "billing/a", "payments/b"]);
        assert_eq!(scope.rules[2].spec.priority, Some(1000));
        assert_eq!(
            scope.rules[0].source_addresses,
            vec!["192.168.1.5", "192.168.1.6", "192.168.2.1"]
        );
    }

    #[tokio::test]
    async fn deleted_rule_is_excluded_even_if_listed() {
        let mut gone = ip_rule("payments", "gone", Some(10), &["svc-a"]);
        let stale = gone.clone();
        gone.metadata = deleting(gone.metadata);
        let rules = vec![stale, ip_rule("payments", "keep", None, &["svc-b"])];

        let scope = resolved(
            resolver(snat_store(rules, Some(gone)))
                .resolve_external_ip_rule(&ObjectKey::namespaced("payments", "gone"))
                .await
                .unwrap(),
        );
        assert_eq!(scope.removed, Some(ObjectKey::namespaced("payments", "gone")));
        assert_eq!(scope.rules.len(), 1);
        assert_eq!(scope.rules[0].key.name, "keep");
    }

    #[tokio::test]
    async fn empty_endpoint_set_fails_resolution() {
        let trigger = ip_rule("payments", "r", None, &["svc-empty"]);
        let err = resolver(snat_store(vec![trigger.clone()], Some(trigger)))
            .resolve_external_ip_rule(&ObjectKey::namespaced("payments", "r"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::EmptyEndpoints { .. }));

        let trigger = ip_rule("payments", "r", None, &["svc-missing"]);
        let err = resolver(snat_store(vec![trigger.clone()], Some(trigger)))
            .resolve_external_ip_rule(&ObjectKey::namespaced("payments", "r"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::EmptyEndpoints { .. }));
    }

    #[tokio::test]
    async fn invalid_trigger_is_fatal_but_invalid_sibling_is_skipped() {
        let mut invalid = ip_rule("payments", "bad", None, &["svc-a"]);
        invalid.spec.external_addresses.clear();
        let ok = ip_rule("payments", "ok", None, &["svc-a"]);

        let err = resolver(snat_store(vec![invalid.clone(), ok.clone()], Some(invalid.clone())))
            .resolve_external_ip_rule(&ObjectKey::namespaced("payments", "bad"))
            .await
            .unwrap_err();
        assert!(!err.is_retryable());

        let scope = resolved(
            resolver(snat_store(vec![invalid, ok.clone()], Some(ok)))
                .resolve_external_ip_rule(&ObjectKey::namespaced("payments", "ok"))
                .await
                .unwrap(),
        );
        assert_eq!(scope.rules.len(), 1);
    }

    #[tokio::test]
    async fn unmapped_namespace_rule_is_unwatched() {
        let mut store = MockRuleStore::new();
        store
            .expect_get_external_ip_rule()
            .returning(|_| Ok(Some(ip_rule("kube-system", "r", None, &["svc-a"]))));
        store.expect_list_external_ip_rules().times(0);
        let res = resolver(store)
            .resolve_external_ip_rule(&ObjectKey::namespaced("kube-system", "r"))
            .await
            .unwrap();
        assert!(matches!(res, SnatResolution::Unwatched { trigger: Some(_) }));
    }

    #[tokio::test]
    async fn endpoint_change_maps_to_dependents() {
        let mut store = MockRuleStore::new();
        store.expect_list_external_ip_rules().returning(|| {
            Ok(vec![
                ip_rule("payments", "uses", None, &["checkout"]),
                ip_rule("payments", "other", None, &["cart"]),
                ip_rule("billing", "elsewhere", None, &["checkout"]),
            ])
        });
        store.expect_list_service_egress_rules().returning(|_| {
            Ok(vec![
                service_rule("payments", "s1", "checkout", &["api", "db"]),
                service_rule("payments", "s2", "cart", &["cdn"]),
            ])
        });

        let deps = resolver(store)
            .affected_by_endpoints("payments", "checkout")
            .await
            .unwrap();
        assert_eq!(
            deps.external_ip_rules,
            vec![ObjectKey::namespaced("payments", "uses")]
        );
        assert_eq!(
            deps.external_services,
            vec![
                ObjectKey::namespaced("payments", "api"),
                ObjectKey::namespaced("payments", "db")
            ]
        );
    }

    #[tokio::test]
    async fn rule_change_requeues_every_service_of_that_scope() {
        let mut store = MockRuleStore::new();
        store.expect_list_external_services().returning(|| {
            Ok(vec![
                external_service("payments", "api", Some("namespace")),
                external_service("payments", "db", Some("global")),
                external_service("billing", "ledger", Some("namespace")),
            ])
        });
        let r = resolver(store);

        let keys = r
            .external_services_for_rule_change(RuleType::Namespace, Some("payments"))
            .await
            .unwrap();
        assert_eq!(keys, vec![ObjectKey::namespaced("payments", "api")]);

        let keys = r
            .external_services_for_rule_change(RuleType::Namespace, None)
            .await
            .unwrap();
        assert_eq!(keys.len(), 2);
    }
}
