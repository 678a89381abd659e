//! ExternalService Custom Resource Definition
//!
//! An ExternalService names a destination outside the cluster (addresses and
//! ports). Which egress rule hierarchy governs it is selected by the
//! `natgate.dev/rule-type` label.

use std::collections::BTreeSet;

use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::Protocol;
use crate::config::SynthesisConfig;
use crate::Error;

/// One destination port of an external service
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ExternalServicePort {
    /// Port name, unique within the service
    pub name: String,
    /// Protocol
    #[serde(default)]
    pub protocol: Protocol,
    /// Destination port
    pub port: u16,
    /// Bandwidth shaping iRule applied to traffic on this port
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bandwidth: Option<String>,
}

/// Specification for an ExternalService
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "natgate.dev",
    version = "v1alpha1",
    kind = "ExternalService",
    plural = "externalservices",
    shortname = "exsvc",
    namespaced,
    printcolumn = r#"{"name":"RuleType","type":"string","jsonPath":".metadata.labels.natgate\\.dev/rule-type"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ExternalServiceSpec {
    /// Destination addresses
    #[serde(default)]
    pub addresses: Vec<String>,
    /// Destination ports
    #[serde(default)]
    pub ports: Vec<ExternalServicePort>,
}

impl ExternalService {
    /// Check port names are unique and every bandwidth directive is in the
    /// supported registry
    ///
    /// Port names key the per-port virtual servers. Blank directives mean
    /// "no shaping" and are accepted.
    pub fn validate(&self, synthesis: &SynthesisConfig) -> Result<(), Error> {
        let mut names = BTreeSet::new();
        for port in &self.spec.ports {
            if !names.insert(port.name.as_str()) {
                return Err(Error::validation(
                    format!("{}/{}", self.namespace().unwrap_or_default(), self.name_any()),
                    format!("port name {} is used more than once", port.name),
                ));
            }
        }
        for port in &self.spec.ports {
            let Some(bw) = port.bandwidth.as_deref().map(str::trim) else {
                continue;
            };
            if !bw.is_empty() && !synthesis.supports_bandwidth(bw) {
                return Err(Error::validation(
                    format!("{}/{}", self.namespace().unwrap_or_default(), self.name_any()),
                    format!(
                        "port {} bandwidth {bw} is not one of [{}]",
                        port.name,
                        synthesis.bandwidth_irules.join(", ")
                    ),
                ));
            }
        }
        Ok(())
    }
}

impl ExternalServicePort {
    /// Bandwidth directive, `None` when blank
    pub fn shaping(&self) -> Option<&str> {
        self.bandwidth
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }
}
