//! ExternalIPRule sync
//!
//! Every rule of a tenant lives in one NAT policy, so any change to one rule
//! re-synthesizes the policy from the complete rule set of that tenant.

use tracing::{debug, info, instrument};

use super::{apply_fragments, Context, ResourceKind, SyncOutcome};
use crate::crd::{has_cleanup_finalizer, is_deleting};
use crate::events::actions;
use crate::queue::ObjectKey;
use crate::resolver::SnatResolution;
use crate::Result;

/// Converge the tenant's SNAT policy after a change to one ExternalIPRule
#[instrument(skip(ctx), fields(key = %key))]
pub async fn sync_external_ip_rule(ctx: &Context, key: &ObjectKey) -> Result<SyncOutcome> {
    let scope = match ctx.resolver.resolve_external_ip_rule(key).await? {
        SnatResolution::Unwatched { trigger } => {
            debug!("namespace has no tenant");
            if let Some(rule) = trigger {
                if is_deleting(&rule.metadata) && has_cleanup_finalizer(&rule.metadata) {
                    ctx.finalizers
                        .remove_finalizer(ResourceKind::ExternalIPRule, key)
                        .await?;
                }
            }
            return Ok(SyncOutcome::NoOp);
        }
        SnatResolution::Resolved(scope) => scope,
    };

    let live = scope
        .trigger
        .as_ref()
        .filter(|r| !is_deleting(&r.metadata));
    if let Some(rule) = live {
        if !has_cleanup_finalizer(&rule.metadata) {
            ctx.finalizers
                .add_finalizer(ResourceKind::ExternalIPRule, key)
                .await?;
        }
    }

    let fragment = ctx.synthesizer.snat_fragment(&scope);
    let changes = apply_fragments(ctx, std::slice::from_ref(&fragment)).await?;
    info!(
        tenant = %scope.tenant,
        rules = scope.rules.len(),
        changes,
        "snat policy converged"
    );

    match &scope.trigger {
        Some(rule) if is_deleting(&rule.metadata) => {
            if has_cleanup_finalizer(&rule.metadata) {
                ctx.finalizers
                    .remove_finalizer(ResourceKind::ExternalIPRule, key)
                    .await?;
                info!("rule removed from policy, finalizer released");
            }
        }
        Some(_) if changes > 0 => {
            ctx.publish_synced(
                ResourceKind::ExternalIPRule,
                key,
                actions::SYNC,
                format!("Applied {changes} change(s) to {}", scope.tenant),
            )
            .await;
        }
        None if changes == 0 => return Ok(SyncOutcome::AlreadyAbsent),
        _ => {}
    }

    Ok(if changes > 0 {
        SyncOutcome::Synced
    } else {
        SyncOutcome::NoOp
    })
}
