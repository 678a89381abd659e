//! Operator configuration
//!
//! Appliance connection settings come from CLI flags and environment
//! variables; everything that shapes reconciliation is read from a YAML file
//! so that defaults (priority, port band, object names) are explicit values
//! rather than compile-time constants.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::retry::RetryConfig;
use crate::Error;

/// Connection settings for the load-balancing appliance
#[derive(Clone, Debug)]
pub struct ApplianceConfig {
    /// Base URL, e.g. `https://10.0.0.10`
    pub url: String,
    /// Basic-auth user
    pub username: String,
    /// Basic-auth password
    pub password: String,
    /// Skip TLS certificate verification
    pub insecure: bool,
    /// Per-request timeout
    pub timeout: Duration,
}

impl ApplianceConfig {
    /// Build from a host or URL, defaulting the scheme to https
    pub fn new(
        host: &str,
        username: impl Into<String>,
        password: impl Into<String>,
        insecure: bool,
    ) -> Self {
        let host = host.trim_end_matches('/');
        let url = if host.starts_with("http://") || host.starts_with("https://") {
            host.to_string()
        } else {
            format!("https://{host}")
        };
        Self {
            url,
            username: username.into(),
            password: password.into(),
            insecure,
            timeout: Duration::from_secs(60),
        }
    }
}

/// Namespace to partition mapping entry
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TenantMapping {
    /// Appliance partition (AS3 tenant)
    pub partition: String,
    /// Application container inside the partition; defaults to `defaultApplication`
    #[serde(default)]
    pub application: Option<String>,
    /// Namespaces whose objects sync into this partition
    #[serde(default)]
    pub namespaces: Vec<String>,
}

/// Values the declaration synthesizer needs
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct SynthesisConfig {
    /// Prefix of every object owned by the SNAT policy fragment
    pub snat_prefix: String,
    /// Prefix of every object owned by an egress fragment
    pub egress_prefix: String,
    /// Name of the NAT policy holding ExternalIPRule entries
    pub nat_policy_name: String,
    /// Name of the trailing catch-all automap rule; `None` omits it
    pub default_rule_name: Option<String>,
    /// Priority applied to ExternalIPRules that leave it unset
    pub default_priority: u32,
    /// Port band used by dynamic-pat translations
    pub dynamic_pat_ports: String,
    /// Supported bandwidth shaping iRules
    pub bandwidth_irules: Vec<String>,
    /// Partition holding the shaping iRules
    pub irule_partition: String,
}

impl Default for SynthesisConfig {
    fn default() -> Self {
        Self {
            snat_prefix: "k8s_snat".to_string(),
            egress_prefix: "k8s_egress".to_string(),
            nat_policy_name: "k8s_snat_policy".to_string(),
            default_rule_name: Some("k8s_snat_automap".to_string()),
            default_priority: 1000,
            dynamic_pat_ports: "10000-50000".to_string(),
            bandwidth_irules: ["1M", "2M", "5M", "10M", "20M", "50M", "100M"]
                .iter()
                .map(|bw| format!("bwc_{}_irule", bw.to_lowercase()))
                .collect(),
            irule_partition: "Common".to_string(),
        }
    }
}

impl SynthesisConfig {
    /// Whether a bandwidth directive names a supported shaping iRule
    pub fn supports_bandwidth(&self, bandwidth: &str) -> bool {
        self.bandwidth_irules.iter().any(|i| i == bandwidth)
    }
}

/// Worker pool sizes, one pool per resource kind
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct WorkerConfig {
    /// ExternalService workers
    pub external_services: usize,
    /// ExternalIPRule workers
    pub external_ip_rules: usize,
    /// Endpoints workers
    pub endpoints: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            external_services: 2,
            external_ip_rules: 2,
            endpoints: 2,
        }
    }
}

/// Requeue backoff settings
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct RetrySettings {
    /// First requeue delay in milliseconds
    pub initial_delay_ms: u64,
    /// Cap on the requeue delay in seconds
    pub max_delay_secs: u64,
    /// Growth factor per consecutive failure
    pub multiplier: f64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            initial_delay_ms: 5,
            max_delay_secs: 1000,
            multiplier: 2.0,
        }
    }
}

impl From<&RetrySettings> for RetryConfig {
    fn from(s: &RetrySettings) -> Self {
        RetryConfig {
            max_attempts: 0,
            initial_delay: Duration::from_millis(s.initial_delay_ms),
            max_delay: Duration::from_secs(s.max_delay_secs),
            backoff_multiplier: s.multiplier,
        }
    }
}

/// Top-level operator configuration file
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct OperatorConfig {
    /// Partition for cluster-scoped rules
    pub default_partition: String,
    /// Application for cluster-scoped rules and unmapped applications
    pub default_application: String,
    /// Namespace to partition table
    pub tenants: Vec<TenantMapping>,
    /// Synthesis constants
    pub synthesis: SynthesisConfig,
    /// Worker pool sizes
    pub workers: WorkerConfig,
    /// Requeue backoff
    pub retry: RetrySettings,
    /// Save the running configuration to disk after each successful apply
    pub persist_config: bool,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            default_partition: "Common".to_string(),
            default_application: "Shared".to_string(),
            tenants: Vec::new(),
            synthesis: SynthesisConfig::default(),
            workers: WorkerConfig::default(),
            retry: RetrySettings::default(),
            persist_config: false,
        }
    }
}

impl OperatorConfig {
    /// Parse and validate a YAML document
    pub fn from_yaml(content: &str) -> Result<Self, Error> {
        let config: Self = serde_yaml::from_str(content)
            .map_err(|e| Error::config(format!("invalid config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a file, or use defaults when no path is given
    pub fn load(path: Option<&Path>) -> Result<Self, Error> {
        match path {
            Some(path) => {
                let content = std::fs::read_to_string(path)
                    .map_err(|e| Error::config(format!("failed to read {}: {e}", path.display())))?;
                Self::from_yaml(&content)
            }
            None => Ok(Self::default()),
        }
    }

    /// Reject configurations that would make tenant resolution ambiguous
    pub fn validate(&self) -> Result<(), Error> {
        if self.default_partition.is_empty() {
            return Err(Error::config("defaultPartition must not be empty"));
        }
        let mut seen = std::collections::HashSet::new();
        for mapping in &self.tenants {
            if mapping.partition.is_empty() {
                return Err(Error::config("tenant partition must not be empty"));
            }
            for ns in &mapping.namespaces {
                if !seen.insert(ns.as_str()) {
                    return Err(Error::config(format!(
                        "namespace {ns} is mapped to more than one partition"
                    )));
                }
            }
        }
        let (snat, egress) = (&self.synthesis.snat_prefix, &self.synthesis.egress_prefix);
        if snat.is_empty()
            || egress.is_empty()
            || snat.starts_with(egress.as_str())
            || egress.starts_with(snat.as_str())
        {
            return Err(Error::config(
                "snatPrefix and egressPrefix must be non-empty and neither may prefix the other",
            ));
        }
        if !self
            .synthesis
            .nat_policy_name
            .starts_with(&self.synthesis.snat_prefix)
        {
            return Err(Error::config("natPolicyName must start with snatPrefix"));
        }
        if self.retry.multiplier < 1.0 {
            return Err(Error::config("retry.multiplier must be >= 1.0"));
        }
        Ok(())
    }

    /// Queue backoff as a [`RetryConfig`]
    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig::from(&self.retry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_yields_defaults() {
        let config = OperatorConfig::from_yaml("{}").unwrap();
        assert_eq!(config, OperatorConfig::default());
        assert_eq!(config.synthesis.default_priority, 1000);
        assert_eq!(config.synthesis.dynamic_pat_ports, "10000-50000");
        assert!(config.synthesis.supports_bandwidth("bwc_10m_irule"));
    }

    #[test]
    fn parses_tenant_table_and_overrides() {
        let config = OperatorConfig::from_yaml(
            r#"
defaultPartition: Common
tenants:
  - partition: team_a
    application: egress
    namespaces: [payments, billing]
  - partition: team_b
    namespaces: [search]
synthesis:
  defaultPriority: 50
  defaultRuleName: null
  bandwidthIrules: [shape_gold]
workers:
  externalIpRules: 4
retry:
  initialDelayMs: 250
persistConfig: true
"#,
        )
        .unwrap();

        assert_eq!(config.tenants.len(), 2);
        assert_eq!(config.tenants[0].application.as_deref(), Some("egress"));
        assert_eq!(config.synthesis.default_priority, 50);
        assert_eq!(config.synthesis.default_rule_name, None);
        assert!(config.synthesis.supports_bandwidth("shape_gold"));
        assert!(!config.synthesis.supports_bandwidth("bwc_10m_irule"));
        assert_eq!(config.workers.external_ip_rules, 4);
        assert_eq!(config.workers.endpoints, 2);
        assert_eq!(
            config.retry_config().initial_delay,
            Duration::from_millis(250)
        );
        assert!(config.persist_config);
    }

    #[test]
    fn namespace_mapped_twice_is_rejected() {
        let err = OperatorConfig::from_yaml(
            r#"
tenants:
  - partition: a
    namespaces: [shared]
  - partition: b
    namespaces: [shared]
"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("more than one partition"));
    }

    #[test]
    fn overlapping_owner_prefixes_are_rejected() {
        let err = OperatorConfig::from_yaml("synthesis:\n  egressPrefix: k8s_snat_egress\n")
            .unwrap_err();
        assert!(err.to_string().contains("prefix"));

        let err = OperatorConfig::from_yaml("synthesis:\n  natPolicyName: policy\n").unwrap_err();
        assert!(err.to_string().contains("natPolicyName"));
    }

    #[test]
    fn appliance_url_defaults_to_https() {
        let c = ApplianceConfig::new("10.0.0.10", "admin", "secret", true);
        assert_eq!(c.url, "https://10.0.0.10");
        let c = ApplianceConfig::new("http://bigip.local/", "admin", "secret", false);
        assert_eq!(c.url, "http://bigip.local");
    }
}
