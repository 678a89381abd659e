//! Load-balancing appliance access
//!
//! [`Appliance`] is the seam between reconciliation and the REST API; the
//! production implementation is [`ApplianceClient`].

mod client;
pub mod license;
pub mod response;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use serde_json::Value;
use tracing::info;

use crate::declaration::{application_patch, skeleton_declaration, PatchItem};
use crate::tenant::TenantConfig;
use crate::Error;

pub use client::ApplianceClient;

/// Operations against the appliance
///
/// Implementations classify each response and never retry.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Appliance: Send + Sync {
    /// Current declaration of a partition; `{}` when it is not declared
    async fn get_declaration(&self, partition: &str) -> Result<Value, Error>;

    /// Apply JSON patch items; an empty list sends nothing
    async fn patch(&self, items: &[PatchItem]) -> Result<(), Error>;

    /// POST a full AS3 document for `tenants`
    async fn declare(&self, declaration: &Value, tenants: &[String]) -> Result<(), Error>;

    /// Persist the running configuration to disk
    async fn save_config(&self) -> Result<(), Error>;

    /// Raw license report
    async fn license(&self) -> Result<Value, Error>;
}

/// Create every partition and application that does not exist yet
///
/// Existing tenants are never re-declared; only missing applications are
/// patched into them.
pub async fn ensure_tenants(appliance: &dyn Appliance, tenants: &[TenantConfig]) -> Result<(), Error> {
    let mut missing_tenants: Vec<TenantConfig> = Vec::new();
    let mut missing_apps = Vec::new();

    for tenant in tenants {
        if missing_tenants.iter().any(|t| t.partition == tenant.partition) {
            missing_tenants.push(tenant.clone());
            continue;
        }
        let current = appliance.get_declaration(&tenant.partition).await?;
        match current.get(&tenant.partition) {
            None => missing_tenants.push(tenant.clone()),
            Some(t) if t.get(&tenant.application).is_none() => {
                missing_apps.push(application_patch(tenant))
            }
            Some(_) => {}
        }
    }

    if !missing_apps.is_empty() {
        info!(count = missing_apps.len(), "creating missing applications");
        appliance.patch(&missing_apps).await?;
    }
    if !missing_tenants.is_empty() {
        let mut names: Vec<String> = missing_tenants.iter().map(|t| t.partition.clone()).collect();
        names.sort();
        names.dedup();
        info!(tenants = ?names, "creating missing partitions");
        appliance
            .declare(&skeleton_declaration(&missing_tenants), &names)
            .await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::declaration::PatchOp;
    use mockall::predicate::eq;
    use serde_json::json;

    #[tokio::test]
    async fn story_only_missing_tenants_and_applications_are_created() {
        let mut appliance = MockAppliance::new();
        appliance
            .expect_get_declaration()
            .with(eq("Common"))
            .returning(|_| Ok(json!({"Common": {"class": "Tenant", "Shared": {"class": "Application"}}})));
        appliance
            .expect_get_declaration()
            .with(eq("team_a"))
            .times(1)
            .returning(|_| Ok(json!({"team_a": {"class": "Tenant"}})));
        appliance
            .expect_get_declaration()
            .with(eq("team_b"))
            .times(1)
            .returning(|_| Ok(json!({})));
        appliance
            .expect_patch()
            .withf(|items| {
                items.len() == 1 && items[0].op == PatchOp::Add && items[0].path == "/team_a/egress"
            })
            .times(1)
            .returning(|_| Ok(()));
        appliance
            .expect_declare()
            .withf(|doc, tenants| {
                tenants == ["team_b".to_string()]
                    && doc["declaration"]["team_b"]["one"]["class"] == "Application"
                    && doc["declaration"]["team_b"]["two"]["class"] == "Application"
            })
            .times(1)
            .returning(|_, _| Ok(()));

        ensure_tenants(
            &appliance,
            &[
                TenantConfig::new("Common", "Shared"),
                TenantConfig::new("team_a", "egress"),
                TenantConfig::new("team_b", "one"),
                TenantConfig::new("team_b", "two"),
            ],
        )
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn nothing_is_sent_when_everything_exists() {
        let mut appliance = MockAppliance::new();
        appliance
            .expect_get_declaration()
            .returning(|_| Ok(json!({"Common": {"class": "Tenant", "Shared": {}}})));
        appliance.expect_patch().times(0);
        appliance.expect_declare().times(0);

        ensure_tenants(&appliance, &[TenantConfig::new("Common", "Shared")])
            .await
            .unwrap();
    }
}
