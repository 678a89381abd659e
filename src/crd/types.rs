//! Supporting types shared by the natgate CRDs

use kube::api::ObjectMeta;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Label on an ExternalService selecting which egress rule hierarchy governs it
pub const RULE_TYPE_LABEL: &str = "natgate.dev/rule-type";

/// Finalizer that holds deletion until appliance objects have been removed
pub const CLEANUP_FINALIZER: &str = "natgate.dev/appliance-cleanup";

/// Egress rule scope
///
/// The value of [`RULE_TYPE_LABEL`] on an ExternalService. Exactly one scope
/// governs a service at a time.
#[derive(Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum RuleType {
    /// ClusterEgressRule, synced into the default partition
    Global,
    /// NamespaceEgressRule
    Namespace,
    /// ServiceEgressRule
    Service,
}

impl RuleType {
    /// Parse a label value; unknown values select no scope
    pub fn from_label(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "global" | "cluster" => Some(Self::Global),
            "namespace" => Some(Self::Namespace),
            "service" => Some(Self::Service),
            _ => None,
        }
    }

    /// Scope selected by an object's labels
    pub fn of(meta: &ObjectMeta) -> Option<Self> {
        meta.labels
            .as_ref()
            .and_then(|l| l.get(RULE_TYPE_LABEL))
            .and_then(|v| Self::from_label(v))
    }
}

impl std::fmt::Display for RuleType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Global => write!(f, "global"),
            Self::Namespace => write!(f, "namespace"),
            Self::Service => write!(f, "service"),
        }
    }
}

/// Transport protocol
#[derive(
    Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq, Hash, PartialOrd, Ord,
)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    /// TCP
    Tcp,
    /// UDP
    Udp,
    /// Any protocol
    #[default]
    Any,
}

impl Protocol {
    /// Lowercase protocol name as the appliance expects it
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Tcp => "tcp",
            Self::Udp => "udp",
            Self::Any => "any",
        }
    }
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether the object has a deletion timestamp
pub fn is_deleting(meta: &ObjectMeta) -> bool {
    meta.deletion_timestamp.is_some()
}

/// Whether the object carries the cleanup finalizer
pub fn has_cleanup_finalizer(meta: &ObjectMeta) -> bool {
    meta.finalizers
        .as_ref()
        .is_some_and(|f| f.iter().any(|s| s == CLEANUP_FINALIZER))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn rule_type_parses_label_values() {
        assert_eq!(RuleType::from_label("global"), Some(RuleType::Global));
        assert_eq!(RuleType::from_label("Namespace"), Some(RuleType::Namespace));
        assert_eq!(RuleType::from_label(" service "), Some(RuleType::Service));
        assert_eq!(RuleType::from_label("pod"), None);
    }

    #[test]
    fn rule_type_reads_label_from_metadata() {
        let meta = ObjectMeta {
            labels: Some(BTreeMap::from([(
                RULE_TYPE_LABEL.to_string(),
                "namespace".to_string(),
            )])),
            ..Default::default()
        };
        assert_eq!(RuleType::of(&meta), Some(RuleType::Namespace));
        assert_eq!(RuleType::of(&ObjectMeta::default()), None);
    }

    #[test]
    fn finalizer_detection() {
        let meta = ObjectMeta {
            finalizers: Some(vec![CLEANUP_FINALIZER.to_string()]),
            ..Default::default()
        };
        assert!(has_cleanup_finalizer(&meta));
        assert!(!has_cleanup_finalizer(&ObjectMeta::default()));
    }
}
