use std::{future, sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use futures::StreamExt;
use k8s_openapi::api::batch::v1::{CronJob, Job};
use kube::{
    api::ListParams,
    runtime::{controller::Action, reflector::ObjectRef, watcher, Controller},
    Api, Client, ResourceExt,
};
use serde::Serialize;
use snafu::OptionExt as _;
use tokio::sync::RwLock;
use tracing::{error, info, instrument, warn};

pub mod cluster;
pub mod config;
pub mod crd;
pub mod error;
pub mod metrics;
pub mod tasks;
pub mod telemetry;

pub use error::*;

use crate::{
    cluster::{ClusterApi, KubeClusterApi},
    config::AppConfig,
    crd::Backup,
    metrics::Metrics,
};

pub const OPERATOR: &str = "gobackup-operator";

/// State shared between the controller and the binary
#[derive(Clone, Default)]
pub struct State {
    /// Diagnostics populated by the reconciler
    diagnostics: Arc<RwLock<Diagnostics>>,
    /// Metrics registry
    registry: prometheus::Registry,
    /// Application configuration
    config: AppConfig,
}

impl State {
    pub fn new(config: AppConfig) -> Self {
        Self { config, ..Default::default() }
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    /// Metrics getter
    pub fn metrics(&self) -> Vec<prometheus::proto::MetricFamily> {
        self.registry.gather()
    }

    /// State getter
    pub async fn diagnostics(&self) -> Diagnostics {
        self.diagnostics.read().await.clone()
    }

    /// Create a Controller Context that can update State
    pub fn to_context(&self, cluster: Arc<dyn ClusterApi>) -> Result<Arc<Context>, prometheus::Error> {
        Ok(Arc::new(Context {
            cluster,
            config: self.config.clone(),
            metrics: Metrics::default().register(&self.registry)?,
            diagnostics: self.diagnostics.clone(),
        }))
    }
}

/// Context for our reconciler
#[derive(Clone)]
pub struct Context {
    /// Every Kubernetes call goes through here
    pub cluster: Arc<dyn ClusterApi>,
    /// Diagnostics read by the binary
    pub diagnostics: Arc<RwLock<Diagnostics>>,
    /// Prometheus metrics
    pub metrics: Metrics,
    /// Application configuration
    pub config: AppConfig,
}

impl Context {
    /// Context with unregistered metrics.
    pub fn new(cluster: Arc<dyn ClusterApi>, config: AppConfig) -> Self {
        Self { cluster, config, metrics: Metrics::default(), diagnostics: Default::default() }
    }
}

#[instrument(skip(ctx, backup), fields(namespace = tracing::field::Empty, name = %backup.name_any()))]
async fn reconcile(backup: Arc<Backup>, ctx: Arc<Context>) -> Result<Action> {
    let _timer = ctx.metrics.count_and_measure();
    ctx.diagnostics.write().await.last_event = Utc::now();
    let namespace = backup.namespace().context(MissingObjectKeySnafu { field: "namespace" })?;
    tracing::Span::current().record("namespace", namespace.as_str());

    info!("Reconciling Backup \"{}\" in {}", backup.name_any(), namespace);
    tasks::backup::reconcile_backup(&ctx, &namespace, &backup.name_any()).await
}

fn error_policy(backup: Arc<Backup>, error: &AppError, ctx: Arc<Context>) -> Action {
    ctx.metrics.reconcile_failure(&backup, error);
    requeue_for(error, &ctx.config)
}

/// Validation errors wait for a spec change, everything else is retried.
fn requeue_for(error: &AppError, config: &AppConfig) -> Action {
    match error {
        err if err.is_terminal() => {
            warn!("reconcile failed permanently: {err}");
            Action::await_change()
        }
        AppError::Reference { .. } => {
            warn!("reconcile waiting on reference: {error}");
            Action::requeue(Duration::from_secs(config.reference_retry_secs))
        }
        _ => {
            warn!("reconcile failed: {error:?}");
            Action::requeue(Duration::from_secs(config.error_retry_secs))
        }
    }
}

/// Owning Backup of a Job: either directly, or through the CronJob that spawned it. The CronJob
/// carries the Backup's name.
fn backup_of_job(job: Job) -> Option<ObjectRef<Backup>> {
    let namespace = job.namespace()?;
    job.owner_references().iter().find(|owner| owner.controller == Some(true)).and_then(|owner| {
        match owner.kind.as_str() {
            "Backup" | "CronJob" => Some(ObjectRef::new(&owner.name).within(&namespace)),
            _ => None,
        }
    })
}

/// Diagnostics to be exposed by the binary
#[derive(Clone, Serialize)]
pub struct Diagnostics {
    pub last_event: DateTime<Utc>,
}

impl Default for Diagnostics {
    fn default() -> Self {
        Self { last_event: Utc::now() }
    }
}

/// Initialize the controller and shared state (given the crd is installed)
pub async fn run(state: State) -> Result<(), Box<dyn std::error::Error>> {
    let client = Client::try_default().await?;
    let backups = Api::<Backup>::all(client.clone());
    if let Err(e) = backups.list(&ListParams::default().limit(1)).await {
        error!("CRD is not queryable; {e:?}. Is the CRD installed?");
        info!("Installation: cargo run --bin crdgen | kubectl apply -f -");
        return Err(e.into());
    }

    let wc = watcher::Config::default().any_semantic();
    let ctx = state.to_context(Arc::new(KubeClusterApi::new(client.clone())))?;

    Controller::new(backups, wc.clone())
        .owns(Api::<CronJob>::all(client.clone()), wc.clone())
        .watches(Api::<Job>::all(client), wc.labels(tasks::LABEL_BACKUP), backup_of_job)
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx)
        .filter_map(|x| async move { std::result::Result::ok(x) })
        .for_each(|_| future::ready(()))
        .await;
    Ok(())
}
