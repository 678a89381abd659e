//! Tenant resolution
//!
//! Maps a cluster scope to the appliance partition and application container
//! that hold its declaration. Lookups are recomputed on every reconciliation.

use std::collections::HashMap;

use crate::config::OperatorConfig;
use crate::crd::RuleType;

/// Target partition and application for one declaration fragment
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TenantConfig {
    /// Appliance partition (AS3 tenant)
    pub partition: String,
    /// Application container inside the partition
    pub application: String,
}

impl TenantConfig {
    /// Create a tenant config
    pub fn new(partition: impl Into<String>, application: impl Into<String>) -> Self {
        Self {
            partition: partition.into(),
            application: application.into(),
        }
    }

    /// Absolute path of an object inside this tenant's application
    pub fn object_path(&self, name: &str) -> String {
        format!("/{}/{}/{}", self.partition, self.application, name)
    }
}

impl std::fmt::Display for TenantConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "/{}/{}", self.partition, self.application)
    }
}

/// Namespace → partition table plus the cluster-wide default
#[derive(Clone, Debug)]
pub struct TenantResolver {
    default: TenantConfig,
    by_namespace: HashMap<String, TenantConfig>,
}

impl TenantResolver {
    /// Build from operator configuration
    pub fn from_config(config: &OperatorConfig) -> Self {
        let mut by_namespace = HashMap::new();
        for mapping in &config.tenants {
            let tenant = TenantConfig::new(
                &mapping.partition,
                mapping
                    .application
                    .clone()
                    .unwrap_or_else(|| config.default_application.clone()),
            );
            for ns in &mapping.namespaces {
                by_namespace
                    .entry(ns.clone())
                    .or_insert_with(|| tenant.clone());
            }
        }
        Self {
            default: TenantConfig::new(&config.default_partition, &config.default_application),
            by_namespace,
        }
    }

    /// Tenant for cluster-scoped rules
    pub fn default_tenant(&self) -> &TenantConfig {
        &self.default
    }

    /// Tenant for a namespace, `None` when the namespace is not managed
    pub fn for_namespace(&self, namespace: &str) -> Option<&TenantConfig> {
        self.by_namespace.get(namespace)
    }

    /// Tenant for an egress scope
    pub fn for_scope(&self, scope: RuleType, namespace: &str) -> Option<&TenantConfig> {
        match scope {
            RuleType::Global => Some(&self.default),
            RuleType::Namespace | RuleType::Service => self.for_namespace(namespace),
        }
    }

    /// Every tenant an object from `namespace` may have been synced into
    pub fn candidates(&self, namespace: &str) -> Vec<TenantConfig> {
        let mut out = vec![self.default.clone()];
        if let Some(t) = self.for_namespace(namespace) {
            if *t != self.default {
                out.push(t.clone());
            }
        }
        out
    }

    /// All distinct tenants, default first
    pub fn all(&self) -> Vec<TenantConfig> {
        let mut out: Vec<TenantConfig> = self.by_namespace.values().cloned().collect();
        out.sort();
        out.dedup();
        out.retain(|t| *t != self.default);
        out.insert(0, self.default.clone());
        out
    }
}
