//! Kubernetes-backed collaborators
//!
//! [`KubeRuleStore`] answers every resolver read from reflector caches;
//! [`KubeFinalizers`] patches finalizers through the API server.

use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Endpoints;
use kube::api::{Patch, PatchParams};
use kube::runtime::reflector::{ObjectRef, Store};
use kube::{Api, Client, Resource};
use serde::de::DeserializeOwned;
use tracing::debug;

use super::{FinalizerClient, ResourceKind};
use crate::crd::{
    ClusterEgressRule, ExternalIPRule, ExternalService, NamespaceEgressRule, ServiceEgressRule,
    CLEANUP_FINALIZER,
};
use crate::events::CONTROLLER_NAME;
use crate::queue::ObjectKey;
use crate::resolver::RuleStore;
use crate::{Error, Result};

/// How long a read waits for a cache's initial list
const CACHE_SYNC_TIMEOUT: Duration = Duration::from_secs(30);

/// Reflector caches for every kind the resolver reads
#[derive(Clone)]
pub struct Caches {
    /// ExternalService cache
    pub external_services: Store<ExternalService>,
    /// ClusterEgressRule cache
    pub cluster_rules: Store<ClusterEgressRule>,
    /// NamespaceEgressRule cache
    pub namespace_rules: Store<NamespaceEgressRule>,
    /// ServiceEgressRule cache
    pub service_rules: Store<ServiceEgressRule>,
    /// ExternalIPRule cache
    pub ip_rules: Store<ExternalIPRule>,
    /// Endpoints cache
    pub endpoints: Store<Endpoints>,
}

impl Caches {
    /// Wait until every cache has completed its initial list
    pub async fn wait_until_ready(&self) -> Result<()> {
        ready(&self.external_services, "ExternalService").await?;
        ready(&self.cluster_rules, "ClusterEgressRule").await?;
        ready(&self.namespace_rules, "NamespaceEgressRule").await?;
        ready(&self.service_rules, "ServiceEgressRule").await?;
        ready(&self.ip_rules, "ExternalIPRule").await?;
        ready(&self.endpoints, "Endpoints").await
    }
}

async fn ready<K>(store: &Store<K>, kind: &str) -> Result<()>
where
    K: Resource + Clone + 'static,
    K::DynamicType: Eq + std::hash::Hash + Clone,
{
    match tokio::time::timeout(CACHE_SYNC_TIMEOUT, store.wait_until_ready()).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(Error::cache(kind, "*", e.to_string())),
        Err(_) => Err(Error::cache(kind, "*", "initial list not complete")),
    }
}

fn object_ref<K>(key: &ObjectKey) -> ObjectRef<K>
where
    K: Resource<DynamicType = ()>,
{
    let r = ObjectRef::new(&key.name);
    match &key.namespace {
        Some(ns) => r.within(ns),
        None => r,
    }
}

fn in_namespace<K>(store: &Store<K>, namespace: &str) -> Vec<K>
where
    K: Resource<DynamicType = ()> + Clone + 'static,
{
    store
        .state()
        .into_iter()
        .filter(|o| o.meta().namespace.as_deref() == Some(namespace))
        .map(|o| (*o).clone())
        .collect()
}

fn all<K>(store: &Store<K>) -> Vec<K>
where
    K: Resource<DynamicType = ()> + Clone + 'static,
{
    store.state().into_iter().map(|o| (*o).clone()).collect()
}

/// [`RuleStore`] over reflector caches
pub struct KubeRuleStore {
    caches: Caches,
}

impl KubeRuleStore {
    /// Read from `caches`
    pub fn new(caches: Caches) -> Self {
        Self { caches }
    }
}

#[async_trait]
impl RuleStore for KubeRuleStore {
    async fn get_external_service(&self, key: &ObjectKey) -> Result<Option<ExternalService>> {
        ready(&self.caches.external_services, "ExternalService").await?;
        Ok(self
            .caches
            .external_services
            .get(&object_ref(key))
            .map(|o| (*o).clone()))
    }

    async fn list_external_services(&self) -> Result<Vec<ExternalService>> {
        ready(&self.caches.external_services, "ExternalService").await?;
        Ok(all(&self.caches.external_services))
    }

    async fn list_cluster_egress_rules(&self) -> Result<Vec<ClusterEgressRule>> {
        ready(&self.caches.cluster_rules, "ClusterEgressRule").await?;
        Ok(all(&self.caches.cluster_rules))
    }

    async fn list_namespace_egress_rules(
        &self,
        namespace: &str,
    ) -> Result<Vec<NamespaceEgressRule>> {
        ready(&self.caches.namespace_rules, "NamespaceEgressRule").await?;
        Ok(in_namespace(&self.caches.namespace_rules, namespace))
    }

    async fn list_service_egress_rules(&self, namespace: &str) -> Result<Vec<ServiceEgressRule>> {
        ready(&self.caches.service_rules, "ServiceEgressRule").await?;
        Ok(in_namespace(&self.caches.service_rules, namespace))
    }

    async fn get_external_ip_rule(&self, key: &ObjectKey) -> Result<Option<ExternalIPRule>> {
        ready(&self.caches.ip_rules, "ExternalIPRule").await?;
        Ok(self.caches.ip_rules.get(&object_ref(key)).map(|o| (*o).clone()))
    }

    async fn list_external_ip_rules(&self) -> Result<Vec<ExternalIPRule>> {
        ready(&self.caches.ip_rules, "ExternalIPRule").await?;
        Ok(all(&self.caches.ip_rules))
    }

    async fn get_endpoint_addresses(
        &self,
        namespace: &str,
        service: &str,
    ) -> Result<Option<Vec<String>>> {
        ready(&self.caches.endpoints, "Endpoints").await?;
        let key = ObjectKey::namespaced(namespace, service);
        Ok(self
            .caches
            .endpoints
            .get(&object_ref(&key))
            .map(|ep| endpoint_addresses(&ep)))
    }
}

/// Ready addresses of every subset
fn endpoint_addresses(endpoints: &Endpoints) -> Vec<String> {
    endpoints
        .subsets
        .iter()
        .flatten()
        .flat_map(|s| s.addresses.iter().flatten())
        .map(|a| a.ip.clone())
        .collect()
}

/// [`FinalizerClient`] using merge patches
pub struct KubeFinalizers {
    client: Client,
}

impl KubeFinalizers {
    /// Patch through `client`
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api<K>(&self, key: &ObjectKey) -> Api<K>
    where
        K: Resource<Scope = k8s_openapi::NamespaceResourceScope, DynamicType = ()>,
    {
        Api::namespaced(self.client.clone(), key.namespace_or_default())
    }

    async fn update<K>(&self, key: &ObjectKey, add: bool) -> Result<()>
    where
        K: Resource<Scope = k8s_openapi::NamespaceResourceScope, DynamicType = ()>
            + Clone
            + DeserializeOwned
            + std::fmt::Debug,
    {
        let api: Api<K> = self.api(key);
        let Some(obj) = api.get_opt(&key.name).await? else {
            debug!(key = %key, "object gone, finalizer moot");
            return Ok(());
        };

        let current = obj.meta().finalizers.clone().unwrap_or_default();
        let present = current.iter().any(|f| f == CLEANUP_FINALIZER);
        if present == add {
            return Ok(());
        }
        let finalizers: Vec<String> = if add {
            current
                .into_iter()
                .chain(std::iter::once(CLEANUP_FINALIZER.to_string()))
                .collect()
        } else {
            current
                .into_iter()
                .filter(|f| f != CLEANUP_FINALIZER)
                .collect()
        };

        let patch = serde_json::json!({
            "metadata": {
                "finalizers": finalizers
            }
        });
        api.patch(
            &key.name,
            &PatchParams::apply(CONTROLLER_NAME),
            &Patch::Merge(&patch),
        )
        .await?;
        Ok(())
    }
}

#[async_trait]
impl FinalizerClient for KubeFinalizers {
    async fn add_finalizer(&self, kind: ResourceKind, key: &ObjectKey) -> Result<()> {
        match kind {
            ResourceKind::ExternalService => self.update::<ExternalService>(key, true).await,
            ResourceKind::ExternalIPRule => self.update::<ExternalIPRule>(key, true).await,
            ResourceKind::Endpoints => Ok(()),
        }
    }

    async fn remove_finalizer(&self, kind: ResourceKind, key: &ObjectKey) -> Result<()> {
        match kind {
            ResourceKind::ExternalService => self.update::<ExternalService>(key, false).await,
            ResourceKind::ExternalIPRule => self.update::<ExternalIPRule>(key, false).await,
            ResourceKind::Endpoints => Ok(()),
        }
    }
}
