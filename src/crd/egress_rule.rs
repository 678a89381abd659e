//! Egress rule Custom Resource Definitions
//!
//! Three scopes of the same idea: a rule lists the ExternalServices whose
//! egress it governs. Which scope applies to a service is decided by the
//! service's rule-type label, never by the rules themselves.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Cluster-wide egress rule
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "natgate.dev",
    version = "v1alpha1",
    kind = "ClusterEgressRule",
    plural = "clusteregressrules",
    shortname = "cer"
)]
#[serde(rename_all = "camelCase")]
pub struct ClusterEgressRuleSpec {
    /// ExternalService names governed by this rule (any namespace)
    #[serde(default)]
    pub external_services: Vec<String>,
}

/// Namespace-wide egress rule
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "natgate.dev",
    version = "v1alpha1",
    kind = "NamespaceEgressRule",
    plural = "namespaceegressrules",
    shortname = "ner",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct NamespaceEgressRuleSpec {
    /// ExternalService names in this namespace governed by this rule
    #[serde(default)]
    pub external_services: Vec<String>,
}

/// Per-service egress rule
///
/// Traffic is matched on the endpoint addresses of `service`.
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "natgate.dev",
    version = "v1alpha1",
    kind = "ServiceEgressRule",
    plural = "serviceegressrules",
    shortname = "ser",
    namespaced,
    printcolumn = r#"{"name":"Service","type":"string","jsonPath":".spec.service"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ServiceEgressRuleSpec {
    /// ExternalService names in this namespace governed by this rule
    #[serde(default)]
    pub external_services: Vec<String>,
    /// Source service whose endpoints originate the traffic
    pub service: String,
}

/// Access to the governed service list shared by every rule scope
pub trait EgressRule {
    /// ExternalService names this rule governs
    fn external_services(&self) -> &[String];

    /// Whether this rule lists `name`
    fn governs(&self, name: &str) -> bool {
        self.external_services().iter().any(|s| s == name)
    }
}

impl EgressRule for ClusterEgressRule {
    fn external_services(&self) -> &[String] {
        &self.spec.external_services
    }
}

impl EgressRule for NamespaceEgressRule {
    fn external_services(&self) -> &[String] {
        &self.spec.external_services
    }
}

impl EgressRule for ServiceEgressRule {
    fn external_services(&self) -> &[String] {
        &self.spec.external_services
    }
}
