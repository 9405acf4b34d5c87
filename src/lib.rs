pub mod config;
pub mod controller;
pub mod crd;
pub mod driver;
pub mod health;
pub mod queue;
pub mod store;
pub mod telemetry;

pub use config::OperatorConfig;
pub use controller::{BackoffConfig, Context, Error, Result, SyncResult};
pub use crd::{BackendGroup, BackendRecord, Bind, LoadBalancer, LoadBalancerDriver};
pub use health::{HealthState, Metrics};
pub use queue::{ObjectKey, WorkQueue};

use std::fmt::Debug;
use std::future::Future;
use std::sync::Arc;

use futures::StreamExt;
use k8s_openapi::NamespaceResourceScope;
use k8s_openapi::api::core::v1::{Node, Pod, Service};
use kube::runtime::reflector::{self, Store as ReflectorStore, store::Writer};
use kube::runtime::watcher::{self, Config as WatcherConfig};
use kube::runtime::WatchStreamExt;
use kube::{Api, Client, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use tracing::{info, warn};

use controller::triggers::{self, Triggered};
use controller::{
    BackendGroupReconciler, BackendRecordReconciler, BindReconciler, KubeEventPublisher,
    LoadBalancerReconciler,
};
use driver::{DriverClient, HttpTransport};
use store::{KubeStore, ReflectorCache};

/// Name reported on Kubernetes events
pub const CONTROLLER_NAME: &str = "lbcf-operator";

/// Helper to create a namespaced or cluster-wide API based on scope.
fn scoped_api<T>(client: Client, namespace: Option<&str>) -> Api<T>
where
    T: Resource<Scope = NamespaceResourceScope>,
    <T as Resource>::DynamicType: Default,
    T: Clone + DeserializeOwned + std::fmt::Debug,
{
    match namespace {
        Some(ns) => Api::namespaced(client, ns),
        None => Api::all(client),
    }
}

fn key_of<K: Resource>(obj: &K) -> ObjectKey {
    ObjectKey::new(obj.namespace().unwrap_or_default(), obj.name_any())
}

/// One work queue per reconciled kind
#[derive(Clone)]
pub struct Queues {
    pub load_balancers: Arc<WorkQueue<ObjectKey>>,
    pub backend_groups: Arc<WorkQueue<ObjectKey>>,
    pub backend_records: Arc<WorkQueue<ObjectKey>>,
    pub binds: Arc<WorkQueue<ObjectKey>>,
}

impl Queues {
    pub fn new(backoff: BackoffConfig) -> Self {
        Self {
            load_balancers: WorkQueue::new(backoff.clone()),
            backend_groups: WorkQueue::new(backoff.clone()),
            backend_records: WorkQueue::new(backoff.clone()),
            binds: WorkQueue::new(backoff),
        }
    }

    /// Enqueue every key produced by a trigger
    pub fn enqueue(&self, triggered: Triggered) {
        for key in triggered.load_balancers {
            self.load_balancers.enqueue(key);
        }
        for key in triggered.backend_groups {
            self.backend_groups.enqueue(key);
        }
        for key in triggered.binds {
            self.binds.enqueue(key);
        }
    }

    pub fn shutdown(&self) {
        self.load_balancers.shutdown();
        self.backend_groups.shutdown();
        self.backend_records.shutdown();
        self.binds.shutdown();
    }
}

/// Feed a reflector from a watch and call `on_change` for every touched object
///
/// The callback runs after the reflector applied the event, so it observes
/// the cache including the change.
async fn watch_into<K, F>(api: Api<K>, writer: Writer<K>, on_change: F)
where
    K: Resource<DynamicType = ()> + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
    F: Fn(&K) + Send + 'static,
{
    let kind = K::kind(&()).to_string();
    let stream = reflector::reflector(writer, watcher::watcher(api, WatcherConfig::default().any_semantic()))
        .default_backoff()
        .touched_objects();
    let mut stream = std::pin::pin!(stream);
    while let Some(event) = stream.next().await {
        match event {
            Ok(obj) => on_change(&obj),
            Err(e) => warn!(%kind, error = %e, "Watch error, will retry"),
        }
    }
    warn!(%kind, "Watch stream ended");
}

async fn wait_synced<K>(reader: &ReflectorStore<K>) -> Result<()>
where
    K: Resource<DynamicType = ()> + Clone + 'static,
{
    reader
        .wait_until_ready()
        .await
        .map_err(|e| Error::CacheSyncError(format!("{}: {}", K::kind(&()), e)))
}

/// Run every controller until `shutdown` resolves
///
/// Watches populate the caches, triggers map changes to owner keys, and each
/// kind is drained by its own worker pool. On shutdown the queues stop handing
/// out keys and in-flight reconciles are allowed to finish.
pub async fn run_controllers<S>(
    client: Client,
    config: OperatorConfig,
    health: Arc<HealthState>,
    shutdown: S,
) -> Result<()>
where
    S: Future<Output = ()> + Send,
{
    let scope = config.watch_namespace.as_deref();
    info!(
        scope = scope.unwrap_or("cluster-wide"),
        system_namespace = %config.system_namespace,
        "Starting LBCF controllers"
    );

    let (lb_reader, lb_writer) = reflector::store::<LoadBalancer>();
    let (group_reader, group_writer) = reflector::store::<BackendGroup>();
    let (record_reader, record_writer) = reflector::store::<BackendRecord>();
    let (bind_reader, bind_writer) = reflector::store::<Bind>();
    let (driver_reader, driver_writer) = reflector::store::<LoadBalancerDriver>();
    let (pod_reader, pod_writer) = reflector::store::<Pod>();
    let (service_reader, service_writer) = reflector::store::<Service>();
    let (node_reader, node_writer) = reflector::store::<Node>();

    let ctx = Arc::new(Context {
        load_balancers: Arc::new(KubeStore::new(client.clone(), lb_reader.clone())),
        backend_groups: Arc::new(KubeStore::new(client.clone(), group_reader.clone())),
        backend_records: Arc::new(KubeStore::new(client.clone(), record_reader.clone())),
        binds: Arc::new(KubeStore::new(client.clone(), bind_reader.clone())),
        drivers: Arc::new(ReflectorCache::new(driver_reader.clone())),
        pods: Arc::new(ReflectorCache::new(pod_reader.clone())),
        services: Arc::new(ReflectorCache::new(service_reader.clone())),
        nodes: Arc::new(ReflectorCache::new(node_reader.clone())),
        driver_client: DriverClient::new(Arc::new(HttpTransport::new()), health.telemetry()),
        events: Arc::new(KubeEventPublisher::new(
            client.clone(),
            CONTROLLER_NAME,
            Some(config.pod_name.clone()),
        )),
        system_namespace: config.system_namespace.clone(),
        conflict_retries: config.status_conflict_retries,
    });
    let queues = Queues::new(BackoffConfig::default());

    let mut watches = Vec::new();
    {
        let (ctx, queues) = (ctx.clone(), queues.clone());
        watches.push(tokio::spawn(watch_into(
            scoped_api::<LoadBalancer>(client.clone(), scope),
            lb_writer,
            move |lb| {
                queues.load_balancers.enqueue(key_of(lb));
                queues.enqueue(triggers::load_balancer_changed(&ctx, lb));
            },
        )));
    }
    {
        let queues = queues.clone();
        watches.push(tokio::spawn(watch_into(
            scoped_api::<BackendGroup>(client.clone(), scope),
            group_writer,
            move |group| queues.backend_groups.enqueue(key_of(group)),
        )));
    }
    {
        let queues = queues.clone();
        watches.push(tokio::spawn(watch_into(
            scoped_api::<BackendRecord>(client.clone(), scope),
            record_writer,
            move |record| {
                queues.backend_records.enqueue(key_of(record));
                queues.enqueue(triggers::record_changed(record));
            },
        )));
    }
    {
        let queues = queues.clone();
        watches.push(tokio::spawn(watch_into(
            scoped_api::<Bind>(client.clone(), scope),
            bind_writer,
            move |bind| queues.binds.enqueue(key_of(bind)),
        )));
    }
    {
        // shared drivers live in the system namespace, so drivers are watched cluster-wide
        let (ctx, queues) = (ctx.clone(), queues.clone());
        watches.push(tokio::spawn(watch_into(
            Api::<LoadBalancerDriver>::all(client.clone()),
            driver_writer,
            move |driver| queues.enqueue(triggers::driver_changed(&ctx, driver)),
        )));
    }
    {
        let (ctx, queues) = (ctx.clone(), queues.clone());
        watches.push(tokio::spawn(watch_into(
            scoped_api::<Pod>(client.clone(), scope),
            pod_writer,
            move |pod| queues.enqueue(triggers::pod_changed(&ctx, pod)),
        )));
    }
    {
        let (ctx, queues) = (ctx.clone(), queues.clone());
        watches.push(tokio::spawn(watch_into(
            scoped_api::<Service>(client.clone(), scope),
            service_writer,
            move |service| queues.enqueue(triggers::service_changed(&ctx, service)),
        )));
    }
    {
        let (ctx, queues) = (ctx.clone(), queues.clone());
        watches.push(tokio::spawn(watch_into(
            Api::<Node>::all(client.clone()),
            node_writer,
            move |_node| queues.enqueue(triggers::node_changed(&ctx)),
        )));
    }

    info!("Waiting for caches to sync");
    wait_synced(&lb_reader).await?;
    wait_synced(&group_reader).await?;
    wait_synced(&record_reader).await?;
    wait_synced(&bind_reader).await?;
    wait_synced(&driver_reader).await?;
    wait_synced(&pod_reader).await?;
    wait_synced(&service_reader).await?;
    wait_synced(&node_reader).await?;
    info!("Caches synced");
    health.set_ready(true).await;

    let telemetry = health.telemetry();
    let workers = futures::future::join4(
        queue::run_workers(
            queues.load_balancers.clone(),
            Arc::new(LoadBalancerReconciler { ctx: ctx.clone() }),
            config.load_balancer_workers,
            telemetry.clone(),
        ),
        queue::run_workers(
            queues.backend_groups.clone(),
            Arc::new(BackendGroupReconciler { ctx: ctx.clone() }),
            config.backend_group_workers,
            telemetry.clone(),
        ),
        queue::run_workers(
            queues.backend_records.clone(),
            Arc::new(BackendRecordReconciler { ctx: ctx.clone() }),
            config.backend_record_workers,
            telemetry.clone(),
        ),
        queue::run_workers(
            queues.binds.clone(),
            Arc::new(BindReconciler { ctx }),
            config.bind_workers,
            telemetry,
        ),
    );
    let mut workers = std::pin::pin!(workers);

    tokio::select! {
        _ = &mut workers => {
            warn!("Workers exited unexpectedly");
        }
        _ = shutdown => {
            info!("Shutting down work queues");
            health.set_ready(false).await;
            queues.shutdown();
            workers.await;
        }
    }

    for watch in watches {
        watch.abort();
    }
    info!("Controllers stopped");
    Ok(())
}
