//! Declaration synthesis
//!
//! Pure functions from resolved rules and endpoint snapshots to complete
//! [`Fragment`]s. Identical input always serializes to identical output:
//! names derive from namespace and object name, and every collection is
//! emitted in sorted order.

use std::collections::BTreeMap;

use kube::ResourceExt;

use super::{
    AddressList, BigIp, Destination, Fragment, NatPolicy, NatRule, PortList, Resource,
    ServiceForwarding, SnatTranslation, Source, TranslationKind, Use,
};
use crate::config::SynthesisConfig;
use crate::crd::Protocol;
use crate::resolver::{GovernedService, ResolvedSnatRule, SnatScope};
use crate::tenant::TenantConfig;

/// Builds declaration fragments from resolved rules
#[derive(Clone, Debug)]
pub struct Synthesizer {
    config: SynthesisConfig,
}

impl Synthesizer {
    /// Create a synthesizer with explicit naming and default values
    pub fn new(config: SynthesisConfig) -> Self {
        Self { config }
    }

    /// Synthesis settings
    pub fn config(&self) -> &SynthesisConfig {
        &self.config
    }

    /// Owner prefix of every object in a tenant's SNAT fragment
    pub fn snat_owner(&self) -> &str {
        &self.config.snat_prefix
    }

    /// Owner prefix of an external service's egress fragment
    ///
    /// Kubernetes names cannot contain `_`, so no service's prefix is a
    /// prefix of another's.
    pub fn egress_owner(&self, namespace: &str, service: &str) -> String {
        format!("{}_{}_{}_", self.config.egress_prefix, namespace, service)
    }

    /// The tenant's complete SNAT policy
    ///
    /// One NAT rule per ExternalIPRule in scope order, followed by the
    /// optional catch-all automap rule. The removed key is dropped even if
    /// it is still present in `scope.rules`. A scope with no rules yields an
    /// empty fragment, which prunes the whole policy.
    pub fn snat_fragment(&self, scope: &SnatScope) -> Fragment {
        let tenant = &scope.tenant;
        let mut fragment = Fragment::new(tenant.clone(), self.snat_owner());

        let rules: Vec<&ResolvedSnatRule> = scope
            .rules
            .iter()
            .filter(|r| scope.removed.as_ref() != Some(&r.key))
            .collect();
        if rules.is_empty() {
            return fragment;
        }

        let mut policy = NatPolicy::default();
        for rule in rules {
            policy.rules.push(self.snat_rule(&mut fragment, rule));
        }

        if let Some(default_rule) = &self.config.default_rule_name {
            let name = format!("{}_default_translation", self.config.snat_prefix);
            fragment.insert(
                name.clone(),
                Resource::SnatTranslation(SnatTranslation::automap()),
            );
            policy.rules.push(NatRule {
                name: default_rule.clone(),
                protocol: Protocol::Any.to_string(),
                source: None,
                destination: None,
                source_translation: Use::object(tenant, &name),
            });
        }

        fragment.insert(self.config.nat_policy_name.clone(), Resource::NatPolicy(policy));
        fragment
    }

    fn snat_rule(&self, fragment: &mut Fragment, rule: &ResolvedSnatRule) -> NatRule {
        let tenant = fragment.tenant.clone();
        let base = format!(
            "{}_{}_{}",
            self.config.snat_prefix,
            rule.key.namespace_or_default(),
            rule.key.name
        );

        let src_name = format!("{base}_src_address");
        fragment.insert(
            src_name.clone(),
            Resource::AddressList(AddressList {
                addresses: rule.source_addresses.clone(),
            }),
        );

        let mut protocol = Protocol::Any;
        let mut destination = Destination::default();
        if let Some(dst) = rule.spec.destination() {
            if !dst.addresses.is_empty() {
                let name = format!("{base}_dst_address");
                fragment.insert(
                    name.clone(),
                    Resource::AddressList(AddressList {
                        addresses: sorted(&dst.addresses),
                    }),
                );
                destination.address_lists.push(Use::object(&tenant, &name));
            }
            if let Some(ports) = dst.ports.as_ref().filter(|p| !p.ports.is_empty()) {
                protocol = ports.protocol;
                let name = format!("{base}_dst_ports_{}", ports.protocol);
                fragment.insert(
                    name.clone(),
                    Resource::PortList(PortList {
                        ports: sorted(&ports.ports),
                    }),
                );
                destination.port_lists.push(Use::object(&tenant, &name));
            }
        }

        let translation = if rule.spec.static_nat {
            SnatTranslation {
                kind: TranslationKind::StaticNat,
                addresses: rule.spec.external_addresses.clone(),
                ports: Vec::new(),
            }
        } else {
            SnatTranslation {
                kind: TranslationKind::DynamicPat,
                addresses: rule.spec.external_addresses.clone(),
                ports: vec![self.config.dynamic_pat_ports.clone()],
            }
        };
        let translation_name = format!("{base}_source_translation");
        fragment.insert(
            translation_name.clone(),
            Resource::SnatTranslation(translation),
        );

        NatRule {
            name: base,
            protocol: protocol.to_string(),
            source: Some(Source {
                address_lists: vec![Use::object(&tenant, &src_name)],
            }),
            destination: destination.into_option(),
            source_translation: Use::object(&tenant, &translation_name),
        }
    }

    /// Egress objects for a governed external service
    ///
    /// Deleting services yield an empty fragment so planning removes them.
    pub fn egress_fragment(&self, governed: &GovernedService) -> Fragment {
        let svc = &governed.service;
        let namespace = svc.namespace().unwrap_or_default();
        let owner = self.egress_owner(&namespace, &svc.name_any());
        let tenant = governed.tenant.clone();
        let mut fragment = Fragment::new(tenant.clone(), owner.clone());
        if governed.deleting {
            return fragment;
        }

        let dst_name = format!("{owner}dst_address");
        let has_destination = !svc.spec.addresses.is_empty();
        if has_destination {
            fragment.insert(
                dst_name.clone(),
                Resource::AddressList(AddressList {
                    addresses: sorted(&svc.spec.addresses),
                }),
            );
        }

        let src_name = format!("{owner}src_address");
        let source = (!governed.source_addresses.is_empty()).then(|| {
            fragment.insert(
                src_name.clone(),
                Resource::AddressList(AddressList {
                    addresses: governed.source_addresses.clone(),
                }),
            );
            Source {
                address_lists: vec![Use::object(&tenant, &src_name)],
            }
        });

        let automap = format!("{owner}automap");
        fragment.insert(
            automap.clone(),
            Resource::SnatTranslation(SnatTranslation::automap()),
        );

        let mut by_protocol: BTreeMap<Protocol, Vec<String>> = BTreeMap::new();
        for port in &svc.spec.ports {
            by_protocol
                .entry(port.protocol)
                .or_default()
                .push(port.port.to_string());
        }

        let mut policy = NatPolicy::default();
        for (protocol, ports) in &by_protocol {
            let ports_name = format!("{owner}dst_ports_{protocol}");
            fragment.insert(
                ports_name.clone(),
                Resource::PortList(PortList {
                    ports: sorted(ports),
                }),
            );
            let mut destination = Destination {
                address_lists: Vec::new(),
                port_lists: vec![Use::object(&tenant, &ports_name)],
            };
            if has_destination {
                destination.address_lists.push(Use::object(&tenant, &dst_name));
            }
            policy.rules.push(NatRule {
                name: format!("{owner}{protocol}"),
                protocol: protocol.to_string(),
                source: source.clone(),
                destination: Some(destination),
                source_translation: Use::object(&tenant, &automap),
            });
        }
        let policy_name = format!("{owner}nat_policy");
        fragment.insert(policy_name.clone(), Resource::NatPolicy(policy));

        for port in &svc.spec.ports {
            let irules = port
                .shaping()
                .map(|bw| BigIp {
                    bigip: format!("/{}/{}", self.config.irule_partition, bw),
                })
                .into_iter()
                .collect();
            fragment.insert(
                format!("{owner}vs_{}", port.name),
                Resource::ServiceForwarding(ServiceForwarding {
                    virtual_addresses: sorted(&svc.spec.addresses),
                    virtual_port: port.port,
                    forwarding_type: "ip".to_string(),
                    layer4: port.protocol.to_string(),
                    policy_nat: Some(Use::object(&tenant, &policy_name)),
                    irules,
                }),
            );
        }

        fragment
    }

    /// Empty egress fragment for a service in `tenant`
    ///
    /// Planning it against a tenant removes whatever the service declared
    /// there, whichever rule used to govern it.
    pub fn egress_removal(&self, tenant: TenantConfig, namespace: &str, service: &str) -> Fragment {
        Fragment::new(tenant, self.egress_owner(namespace, service))
    }
}

fn sorted(values: &[String]) -> Vec<String> {
    let mut out = values.to_vec();
    out.sort();
    out.dedup();
    out
}
