//! Controller wiring: reflectors, watch streams and worker pools

use std::fmt::Debug;
use std::future::Future;
use std::sync::Arc;

use futures::{Stream, StreamExt};
use k8s_openapi::api::core::v1::Endpoints;
use kube::runtime::reflector::{self, store::Writer};
use kube::runtime::{watcher, WatchStreamExt};
use kube::{Api, Client, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use super::k8s::{Caches, KubeFinalizers, KubeRuleStore};
use super::{run_worker, Context, ResourceKind};
use crate::appliance::Appliance;
use crate::config::OperatorConfig;
use crate::crd::{
    ClusterEgressRule, ExternalIPRule, ExternalService, NamespaceEgressRule, RuleType,
    ServiceEgressRule,
};
use crate::events::{KubeEventPublisher, CONTROLLER_NAME};
use crate::queue::ObjectKey;
use crate::Result;

/// Watcher timeout (seconds); must stay below the client read timeout
const WATCH_TIMEOUT_SECS: u32 = 25;

type WatchResult<K> = std::result::Result<K, watcher::Error>;

fn watch<K>(api: Api<K>, writer: Writer<K>) -> impl Stream<Item = WatchResult<K>> + Send
where
    K: Resource<DynamicType = ()> + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
{
    watcher(api, watcher::Config::default().timeout(WATCH_TIMEOUT_SECS))
        .default_backoff()
        .reflect(writer)
        .touched_objects()
}

/// Feed every touched object of `stream` to `on_change`
async fn drive<K, S, F, Fut>(kind: &'static str, stream: S, mut on_change: F)
where
    S: Stream<Item = WatchResult<K>>,
    F: FnMut(K) -> Fut,
    Fut: Future<Output = ()>,
{
    let mut stream = std::pin::pin!(stream);
    while let Some(event) = stream.next().await {
        match event {
            Ok(obj) => on_change(obj).await,
            Err(e) => warn!(kind, error = %e, "watch error"),
        }
    }
    warn!(kind, "watch stream ended");
}

/// Requeue every ExternalService a rule of `scope` may govern
async fn requeue_for_rule(ctx: &Context, scope: RuleType, namespace: Option<String>) {
    match ctx
        .resolver
        .external_services_for_rule_change(scope, namespace.as_deref())
        .await
    {
        Ok(keys) => {
            for key in keys {
                ctx.queues.external_services.add(key);
            }
        }
        Err(e) => warn!(%scope, error = %e, "failed to map rule change to external services"),
    }
}

/// Run the controllers until SIGINT or SIGTERM
pub async fn run(
    client: Client,
    config: &OperatorConfig,
    appliance: Arc<dyn Appliance>,
) -> Result<()> {
    let (services, services_writer) = reflector::store::<ExternalService>();
    let (cluster_rules, cluster_rules_writer) = reflector::store::<ClusterEgressRule>();
    let (namespace_rules, namespace_rules_writer) = reflector::store::<NamespaceEgressRule>();
    let (service_rules, service_rules_writer) = reflector::store::<ServiceEgressRule>();
    let (ip_rules, ip_rules_writer) = reflector::store::<ExternalIPRule>();
    let (endpoints, endpoints_writer) = reflector::store::<Endpoints>();
    let caches = Caches {
        external_services: services,
        cluster_rules,
        namespace_rules,
        service_rules,
        ip_rules,
        endpoints,
    };

    let ctx = Arc::new(Context::new(
        Arc::new(KubeRuleStore::new(caches.clone())),
        config,
        appliance,
        Arc::new(KubeFinalizers::new(client.clone())),
        Arc::new(KubeEventPublisher::new(client.clone(), CONTROLLER_NAME)),
    ));

    let mut watches = JoinSet::new();

    let queue = ctx.queues.external_services.clone();
    watches.spawn(drive(
        "ExternalService",
        watch(Api::<ExternalService>::all(client.clone()), services_writer),
        move |obj| {
            queue.add(ObjectKey::from_resource(&obj));
            std::future::ready(())
        },
    ));

    let queue = ctx.queues.external_ip_rules.clone();
    watches.spawn(drive(
        "ExternalIPRule",
        watch(Api::<ExternalIPRule>::all(client.clone()), ip_rules_writer),
        move |obj| {
            queue.add(ObjectKey::from_resource(&obj));
            std::future::ready(())
        },
    ));

    let queue = ctx.queues.endpoints.clone();
    watches.spawn(drive(
        "Endpoints",
        watch(Api::<Endpoints>::all(client.clone()), endpoints_writer),
        move |obj| {
            queue.add(ObjectKey::from_resource(&obj));
            std::future::ready(())
        },
    ));

    let rule_ctx = ctx.clone();
    watches.spawn(drive(
        "ClusterEgressRule",
        watch(Api::<ClusterEgressRule>::all(client.clone()), cluster_rules_writer),
        move |_rule| {
            let ctx = rule_ctx.clone();
            async move { requeue_for_rule(&ctx, RuleType::Global, None).await }
        },
    ));

    let rule_ctx = ctx.clone();
    watches.spawn(drive(
        "NamespaceEgressRule",
        watch(Api::<NamespaceEgressRule>::all(client.clone()), namespace_rules_writer),
        move |rule| {
            let ctx = rule_ctx.clone();
            async move { requeue_for_rule(&ctx, RuleType::Namespace, rule.namespace()).await }
        },
    ));

    let rule_ctx = ctx.clone();
    watches.spawn(drive(
        "ServiceEgressRule",
        watch(Api::<ServiceEgressRule>::all(client), service_rules_writer),
        move |rule| {
            let ctx = rule_ctx.clone();
            async move { requeue_for_rule(&ctx, RuleType::Service, rule.namespace()).await }
        },
    ));

    info!("waiting for caches to sync");
    caches.wait_until_ready().await?;

    let mut workers = JoinSet::new();
    for (kind, count) in [
        (ResourceKind::ExternalService, config.workers.external_services),
        (ResourceKind::ExternalIPRule, config.workers.external_ip_rules),
        (ResourceKind::Endpoints, config.workers.endpoints),
    ] {
        for id in 0..count.max(1) {
            workers.spawn(run_worker(ctx.clone(), kind, id));
        }
    }
    info!(workers = workers.len(), "controllers running");

    tokio::select! {
        _ = shutdown_signal() => info!("shutdown signal received"),
        Some(res) = watches.join_next() => {
            if let Err(e) = res {
                error!(error = %e, "watch task failed");
            }
        }
    }

    ctx.queues.shutdown();
    watches.abort_all();
    while let Some(res) = workers.join_next().await {
        if let Err(e) = res {
            error!(error = %e, "worker task failed");
        }
    }
    info!("controllers stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to listen for SIGINT");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
