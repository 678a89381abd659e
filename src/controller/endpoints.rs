//! Endpoints fan-out
//!
//! An endpoint set is never synced itself; its change is pushed to every
//! object whose synthesized source addresses read it.

use tracing::{debug, instrument};

use super::{Context, SyncOutcome};
use crate::queue::ObjectKey;
use crate::Result;

/// Requeue the dependents of one endpoint set
#[instrument(skip(ctx), fields(key = %key))]
pub async fn sync_endpoints(ctx: &Context, key: &ObjectKey) -> Result<SyncOutcome> {
    let dependents = ctx
        .resolver
        .affected_by_endpoints(key.namespace_or_default(), &key.name)
        .await?;

    if dependents.external_ip_rules.is_empty() && dependents.external_services.is_empty() {
        return Ok(SyncOutcome::NoOp);
    }

    debug!(
        external_ip_rules = dependents.external_ip_rules.len(),
        external_services = dependents.external_services.len(),
        "requeuing dependents"
    );
    for rule in dependents.external_ip_rules {
        ctx.queues.external_ip_rules.add(rule);
    }
    for service in dependents.external_services {
        ctx.queues.external_services.add(service);
    }
    Ok(SyncOutcome::Synced)
}
