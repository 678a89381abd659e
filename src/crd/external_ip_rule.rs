//! ExternalIPRule Custom Resource Definition
//!
//! Translates the source address of traffic leaving the endpoints of the
//! listed services into an explicit external address pool.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::Protocol;

/// Destination port filter
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DestinationPorts {
    /// Protocol the ports apply to
    #[serde(default)]
    pub protocol: Protocol,
    /// Ports or ranges (`"443"`, `"8000-8080"`)
    #[serde(default)]
    pub ports: Vec<String>,
}

/// Destination filter; absent or empty matches every destination
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DestinationMatch {
    /// Optional label for the destination
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Port filter
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ports: Option<DestinationPorts>,
    /// Destination addresses or CIDRs
    #[serde(default)]
    pub addresses: Vec<String>,
}

impl DestinationMatch {
    /// True when neither addresses nor ports are filtered
    pub fn is_empty(&self) -> bool {
        self.addresses.is_empty() && self.ports.as_ref().is_none_or(|p| p.ports.is_empty())
    }
}

/// Specification for an ExternalIPRule
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "natgate.dev",
    version = "v1alpha1",
    kind = "ExternalIPRule",
    plural = "externaliprules",
    shortname = "eipr",
    namespaced,
    printcolumn = r#"{"name":"Priority","type":"integer","jsonPath":".spec.priority"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ExternalIPRuleSpec {
    /// Position in the tenant's NAT policy; lower sorts first
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<u32>,
    /// Post-translation source address pool
    #[serde(default)]
    pub external_addresses: Vec<String>,
    /// Restrict translation to matching destinations
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination_match: Option<DestinationMatch>,
    /// Services whose endpoint addresses are translated
    #[serde(default)]
    pub services: Vec<String>,
    /// Map addresses 1:1 instead of port-translating through the pool
    #[serde(default)]
    pub static_nat: bool,
}

impl ExternalIPRuleSpec {
    /// Fill unset fields; a zero priority counts as unset
    pub fn apply_defaults(&mut self, default_priority: u32) {
        if self.priority.is_none_or(|p| p == 0) {
            self.priority = Some(default_priority);
        }
    }

    /// Destination filter when it actually restricts anything
    pub fn destination(&self) -> Option<&DestinationMatch> {
        self.destination_match.as_ref().filter(|d| !d.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unset_and_zero_priority_default() {
        let mut spec = ExternalIPRuleSpec::default();
        spec.apply_defaults(1000);
        assert_eq!(spec.priority, Some(1000));

        let mut spec = ExternalIPRuleSpec {
            priority: Some(0),
            ..Default::default()
        };
        spec.apply_defaults(1000);
        assert_eq!(spec.priority, Some(1000));

        let mut spec = ExternalIPRuleSpec {
            priority: Some(500),
            ..Default::default()
        };
        spec.apply_defaults(1000);
        assert_eq!(spec.priority, Some(500));
    }

    #[test]
    fn empty_destination_match_is_ignored() {
        let spec = ExternalIPRuleSpec {
            destination_match: Some(DestinationMatch {
                name: Some("anything".into()),
                ports: Some(DestinationPorts {
                    protocol: Protocol::Tcp,
                    ports: vec![],
                }),
                addresses: vec![],
            }),
            ..Default::default()
        };
        assert!(spec.destination().is_none());

        let spec = ExternalIPRuleSpec {
            destination_match: Some(DestinationMatch {
                addresses: vec!["198.51.100.0/24".into()],
                ..Default::default()
            }),
            ..Default::default()
        };
        assert!(spec.destination().is_some());
    }

    #[test]
    fn spec_deserializes_from_camel_case() {
        let spec: ExternalIPRuleSpec = serde_json::from_value(serde_json::json!({
            "externalAddresses": ["10.0.0.1"],
            "services": ["svc-a"],
            "destinationMatch": {"ports": {"protocol": "udp", "ports": ["53"]}},
            "staticNat": true
        }))
        .unwrap();
        assert_eq!(spec.priority, None);
        assert!(spec.static_nat);
        assert_eq!(
            spec.destination().and_then(|d| d.ports.as_ref()).map(|p| p.protocol),
            Some(Protocol::Udp)
        );
    }
}
