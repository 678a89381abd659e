//! Typed AS3 declaration model
//!
//! The appliance is configured per tenant (partition) and application. A
//! [`Fragment`] is everything one owner declares inside one application: the
//! tenant's SNAT policy, or the egress objects of one external service. Every
//! object a fragment owns starts with the fragment's owner prefix, which lets
//! [`Fragment::plan`] compute removals without remembering previous state.

pub mod synthesizer;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::tenant::TenantConfig;
use crate::Error;

pub use synthesizer::Synthesizer;

/// AS3 schema version stamped on full declarations
pub const SCHEMA_VERSION: &str = "3.19.0";

/// Reference to another object in the declaration
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct Use {
    /// Absolute path of the referenced object
    #[serde(rename = "use")]
    pub path: String,
}

impl Use {
    /// Reference `name` inside `tenant`
    pub fn object(tenant: &TenantConfig, name: &str) -> Self {
        Self {
            path: tenant.object_path(name),
        }
    }
}

/// Reference to an object that lives on the appliance outside AS3
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct BigIp {
    /// Absolute appliance path, e.g. `/Common/bwc_5m_irule`
    pub bigip: String,
}

/// Source match of a NAT rule
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Source {
    /// Source address lists
    pub address_lists: Vec<Use>,
}

/// Destination match of a NAT rule
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Destination {
    /// Destination address lists
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub address_lists: Vec<Use>,
    /// Destination port lists
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub port_lists: Vec<Use>,
}

impl Destination {
    fn into_option(self) -> Option<Self> {
        (!self.address_lists.is_empty() || !self.port_lists.is_empty()).then_some(self)
    }
}

/// One entry of a NAT policy
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct NatRule {
    /// Rule name, stable across re-synthesis
    pub name: String,
    /// `tcp`, `udp` or `any`
    pub protocol: String,
    /// Source match; absent matches every source
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<Source>,
    /// Destination match; absent matches every destination
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination: Option<Destination>,
    /// Translation applied to matching traffic
    pub source_translation: Use,
}

/// `NAT_Policy`: ordered rule list
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct NatPolicy {
    /// Rules in evaluation order
    pub rules: Vec<NatRule>,
}

/// Source translation strategy
#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum TranslationKind {
    /// Reuse the appliance self IP
    Automap,
    /// Pooled many-to-many with port translation
    DynamicPat,
    /// Fixed one-to-one mapping
    StaticNat,
}

/// `SNAT_Translation`
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct SnatTranslation {
    /// Translation strategy
    #[serde(rename = "type")]
    pub kind: TranslationKind,
    /// Translated address pool
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub addresses: Vec<String>,
    /// Translated port band, dynamic-pat only
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ports: Vec<String>,
}

impl SnatTranslation {
    /// Appliance self-IP translation
    pub fn automap() -> Self {
        Self {
            kind: TranslationKind::Automap,
            addresses: Vec::new(),
            ports: Vec::new(),
        }
    }
}

/// `Firewall_Address_List`
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct AddressList {
    /// Addresses or CIDRs
    pub addresses: Vec<String>,
}

/// `Firewall_Port_List`
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct PortList {
    /// Ports or ranges
    pub ports: Vec<String>,
}

/// `Service_Forwarding`: IP forwarding virtual server for egress traffic
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ServiceForwarding {
    /// Destination addresses the virtual server listens on
    pub virtual_addresses: Vec<String>,
    /// Destination port, 0 for any
    pub virtual_port: u16,
    /// Always `ip`
    pub forwarding_type: String,
    /// `tcp`, `udp` or `any`
    pub layer4: String,
    /// NAT policy applied to forwarded traffic
    #[serde(rename = "policyNAT", default, skip_serializing_if = "Option::is_none")]
    pub policy_nat: Option<Use>,
    /// Bandwidth shaping iRules
    #[serde(rename = "iRules", default, skip_serializing_if = "Vec::is_empty")]
    pub irules: Vec<BigIp>,
}

/// Any object a fragment may declare, tagged by AS3 `class`
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(tag = "class")]
pub enum Resource {
    /// `NAT_Policy`
    #[serde(rename = "NAT_Policy")]
    NatPolicy(NatPolicy),
    /// `SNAT_Translation`
    #[serde(rename = "SNAT_Translation")]
    SnatTranslation(SnatTranslation),
    /// `Firewall_Address_List`
    #[serde(rename = "Firewall_Address_List")]
    AddressList(AddressList),
    /// `Firewall_Port_List`
    #[serde(rename = "Firewall_Port_List")]
    PortList(PortList),
    /// `Service_Forwarding`
    #[serde(rename = "Service_Forwarding")]
    ServiceForwarding(ServiceForwarding),
}

/// JSON patch operation understood by the declarative endpoint
#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PatchOp {
    /// Create or replace the value at `path`
    Add,
    /// Delete the value at `path`
    Remove,
}

/// One item of an AS3 PATCH body
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct PatchItem {
    /// Operation
    pub op: PatchOp,
    /// `/{tenant}/{application}[/{object}]`
    pub path: String,
    /// New value for `add`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
}

impl PatchItem {
    fn add(path: String, value: Value) -> Self {
        Self {
            op: PatchOp::Add,
            path,
            value: Some(value),
        }
    }

    fn remove(path: String) -> Self {
        Self {
            op: PatchOp::Remove,
            path,
            value: None,
        }
    }

    /// Apply this item to a local copy of a GET result
    ///
    /// Lets later fragments of one PATCH plan against what earlier ones
    /// already add. Items whose parent is missing are skipped.
    pub fn apply_to(&self, declared: &mut Value) {
        let mut segments: Vec<&str> = self.path.split('/').filter(|s| !s.is_empty()).collect();
        let Some(last) = segments.pop() else {
            return;
        };
        let mut target = declared;
        for segment in segments {
            target = match target.get_mut(segment) {
                Some(next) => next,
                None => return,
            };
        }
        let Some(object) = target.as_object_mut() else {
            return;
        };
        match (self.op, &self.value) {
            (PatchOp::Add, Some(value)) => {
                object.insert(last.to_string(), value.clone());
            }
            (PatchOp::Add, None) => {}
            (PatchOp::Remove, _) => {
                object.remove(last);
            }
        }
    }
}

/// Complete set of objects one owner declares in one tenant application
#[derive(Clone, Debug, PartialEq)]
pub struct Fragment {
    /// Target partition and application
    pub tenant: TenantConfig,
    /// Prefix shared by every object this fragment owns
    pub owner: String,
    /// Objects by name
    pub resources: BTreeMap<String, Resource>,
}

impl Fragment {
    /// Empty fragment; planning it removes everything the owner declared
    pub fn new(tenant: TenantConfig, owner: impl Into<String>) -> Self {
        Self {
            tenant,
            owner: owner.into(),
            resources: BTreeMap::new(),
        }
    }

    /// Add an object; its name must start with the owner prefix
    pub fn insert(&mut self, name: impl Into<String>, resource: Resource) {
        let name = name.into();
        debug_assert!(name.starts_with(&self.owner), "{name} outside {}", self.owner);
        self.resources.insert(name, resource);
    }

    /// No objects declared
    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }

    /// Whether `name` belongs to this fragment's owner
    pub fn owns(&self, name: &str) -> bool {
        name.starts_with(&self.owner)
    }

    /// Canonical serialized form
    pub fn to_json(&self) -> Result<String, Error> {
        Ok(serde_json::to_string(&self.resources)?)
    }

    /// Patch items converging `current` (a GET of the tenant) onto this fragment
    ///
    /// Objects already present with the declared content produce nothing,
    /// so re-planning an applied fragment yields an empty list.
    pub fn plan(&self, current: &Value) -> Result<Vec<PatchItem>, Error> {
        let partition = &self.tenant.partition;
        let application = &self.tenant.application;

        let Some(tenant) = current.get(partition).and_then(Value::as_object) else {
            if self.is_empty() {
                return Ok(Vec::new());
            }
            let mut tenant = Map::new();
            tenant.insert("class".into(), Value::from("Tenant"));
            tenant.insert(application.clone(), self.application_value()?);
            return Ok(vec![PatchItem::add(
                format!("/{partition}"),
                Value::Object(tenant),
            )]);
        };

        let Some(app) = tenant.get(application).and_then(Value::as_object) else {
            if self.is_empty() {
                return Ok(Vec::new());
            }
            return Ok(vec![PatchItem::add(
                self.tenant.to_string(),
                self.application_value()?,
            )]);
        };

        let mut items = Vec::new();
        for (name, resource) in &self.resources {
            let desired = serde_json::to_value(resource)?;
            if !app.get(name).is_some_and(|live| contains(live, &desired)) {
                items.push(PatchItem::add(self.tenant.object_path(name), desired));
            }
        }
        let mut stale: Vec<&String> = app
            .keys()
            .filter(|name| self.owns(name) && !self.resources.contains_key(*name))
            .collect();
        stale.sort();
        items.extend(
            stale
                .into_iter()
                .map(|name| PatchItem::remove(self.tenant.object_path(name))),
        );
        Ok(items)
    }

    fn application_value(&self) -> Result<Value, Error> {
        let mut app = application_skeleton(&self.tenant.application);
        for (name, resource) in &self.resources {
            app.insert(name.clone(), serde_json::to_value(resource)?);
        }
        Ok(Value::Object(app))
    }
}

/// Optional fields natgate declares; a live value for one of them that the
/// declaration no longer carries is drift
const OPTIONAL_FIELDS: &[&str] = &[
    "source",
    "destination",
    "addressLists",
    "portLists",
    "iRules",
    "policyNAT",
    "ports",
    "addresses",
];

/// Whether `live` matches `desired`
///
/// The appliance echoes defaulted fields we never declared; those are
/// ignored unless they are one of [`OPTIONAL_FIELDS`].
fn contains(live: &Value, desired: &Value) -> bool {
    match (live, desired) {
        (Value::Object(l), Value::Object(d)) => {
            d.iter()
                .all(|(k, dv)| l.get(k).is_some_and(|lv| contains(lv, dv)))
                && OPTIONAL_FIELDS
                    .iter()
                    .all(|k| d.contains_key(*k) || l.get(*k).is_none_or(is_blank))
        }
        (Value::Array(l), Value::Array(d)) => {
            l.len() == d.len() && l.iter().zip(d).all(|(lv, dv)| contains(lv, dv))
        }
        (l, d) => l == d,
    }
}

fn is_blank(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Array(a) => a.is_empty(),
        Value::Object(o) => o.is_empty(),
        _ => false,
    }
}

fn application_skeleton(application: &str) -> Map<String, Value> {
    let mut app = Map::new();
    app.insert("class".into(), Value::from("Application"));
    let template = if application == "Shared" {
        "shared"
    } else {
        "generic"
    };
    app.insert("template".into(), Value::from(template));
    app
}

/// Full AS3 document declaring empty applications for `tenants`
///
/// Only used to create partitions the appliance does not have yet; posting
/// it for an existing tenant would wipe that tenant.
pub fn skeleton_declaration(tenants: &[TenantConfig]) -> Value {
    let mut adc = Map::new();
    adc.insert("class".into(), Value::from("ADC"));
    adc.insert("schemaVersion".into(), Value::from(SCHEMA_VERSION));
    adc.insert("id".into(), Value::from("natgate"));
    for t in tenants {
        let tenant = adc
            .entry(t.partition.clone())
            .or_insert_with(|| serde_json::json!({"class": "Tenant"}));
        if let Some(obj) = tenant.as_object_mut() {
            obj.insert(
                t.application.clone(),
                Value::Object(application_skeleton(&t.application)),
            );
        }
    }
    serde_json::json!({
        "class": "AS3",
        "action": "deploy",
        "persist": true,
        "declaration": adc,
    })
}

/// Patch item adding an empty application to an existing tenant
pub fn application_patch(tenant: &TenantConfig) -> PatchItem {
    PatchItem::add(
        tenant.to_string(),
        Value::Object(application_skeleton(&tenant.application)),
    )
}
