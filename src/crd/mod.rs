//! Custom Resource Definitions for natgate
//!
//! ExternalService declares a destination; the three egress rule kinds decide
//! which scope governs it; ExternalIPRule declares source NAT for workloads.

mod egress_rule;
mod external_ip_rule;
mod external_service;
mod types;

use kube::CustomResourceExt;

pub use egress_rule::{
    ClusterEgressRule, ClusterEgressRuleSpec, EgressRule, NamespaceEgressRule,
    NamespaceEgressRuleSpec, ServiceEgressRule, ServiceEgressRuleSpec,
};
pub use external_ip_rule::{
    DestinationMatch, DestinationPorts, ExternalIPRule, ExternalIPRuleSpec,
};
pub use external_service::{ExternalService, ExternalServicePort, ExternalServiceSpec};
pub use types::{
    has_cleanup_finalizer, is_deleting, Protocol, RuleType, CLEANUP_FINALIZER, RULE_TYPE_LABEL,
};

/// Every CRD manifest this operator owns
pub fn all_crds() -> Vec<k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition> {
    vec![
        ExternalService::crd(),
        ClusterEgressRule::crd(),
        NamespaceEgressRule::crd(),
        ServiceEgressRule::crd(),
        ExternalIPRule::crd(),
    ]
}
