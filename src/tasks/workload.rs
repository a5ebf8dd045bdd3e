//! Job, CronJob and PVC definitions running `gobackup perform` for a Backup.

use std::collections::BTreeMap;

use k8s_openapi::api::{
    batch::v1::{CronJob, CronJobSpec, Job, JobSpec},
    core::v1::PersistentVolumeClaim,
};
use kube::{Resource as _, ResourceExt as _};
use serde_json::{json, Value};
use snafu::{OptionExt as _, ResultExt as _};
use tracing::info;

use crate::{
    cluster::ClusterApi,
    config::AppConfig,
    crd::{
        Backup, BackupSchedule, Persistence, DEFAULT_FAILED_JOBS_HISTORY_LIMIT,
        DEFAULT_SUCCESSFUL_JOBS_HISTORY_LIMIT,
    },
    KubeSnafu, MissingObjectKeySnafu, Result, SerializationSnafu,
};

use super::{backup_labels, config::CONFIG_KEY, Applied};

pub const CONTAINER_NAME: &str = "gobackup";

const CONFIG_VOLUME: &str = "config";
const DATA_VOLUME: &str = "data";
const GOBACKUP_HOME: &str = "/root/.gobackup";
const CONFIG_DIR: &str = "/etc/gobackup";

fn pod_template(backup: &Backup, config: &AppConfig) -> Value {
    let name = backup.name_any();
    let persistence = backup.persistence_enabled();

    // With persistence the home directory holds gobackup state, so the config moves aside
    let (config_mount, command) = if persistence {
        (CONFIG_DIR, format!("gobackup perform -c {CONFIG_DIR}/{CONFIG_KEY}"))
    } else {
        (GOBACKUP_HOME, "gobackup perform".to_string())
    };

    let mut volume_mounts = vec![json!({ "name": CONFIG_VOLUME, "mountPath": config_mount })];
    let mut volumes = vec![json!({ "name": CONFIG_VOLUME, "secret": { "secretName": name } })];
    if persistence {
        volume_mounts.push(json!({ "name": DATA_VOLUME, "mountPath": GOBACKUP_HOME }));
        volumes.push(json!({ "name": DATA_VOLUME, "persistentVolumeClaim": { "claimName": name } }));
    }

    json!({
        "metadata": {
            "labels": backup_labels(&name),
        },
        "spec": {
            "containers": [{
                "name": CONTAINER_NAME,
                "image": config.backup_job_image,
                "imagePullPolicy": config.image_pull_policy,
                "command": ["/bin/sh", "-c", command],
                "volumeMounts": volume_mounts,
            }],
            "restartPolicy": "Never",
            "volumes": volumes,
        }
    })
}

fn job_spec(backup: &Backup, config: &AppConfig) -> Value {
    json!({
        "backoffLimit": 0,
        "ttlSecondsAfterFinished": config.job_ttl_seconds_after_finished,
        "template": pod_template(backup, config),
    })
}

fn metadata(backup: &Backup) -> Result<Value> {
    let name = backup.name_any();
    let owner = backup.controller_owner_ref(&()).context(MissingObjectKeySnafu { field: "uid" })?;
    Ok(json!({
        "name": name,
        "namespace": backup.namespace(),
        "labels": backup_labels(&name),
        "ownerReferences": [owner],
    }))
}

/// Single run Job for an immediate Backup, named after the Backup.
pub fn build_job(backup: &Backup, config: &AppConfig) -> Result<Job> {
    serde_json::from_value(json!({
        "apiVersion": "batch/v1",
        "kind": "Job",
        "metadata": metadata(backup)?,
        "spec": job_spec(backup, config),
    }))
    .context(SerializationSnafu)
}

pub fn build_cron_job(
    backup: &Backup, schedule: &BackupSchedule, config: &AppConfig,
) -> Result<CronJob> {
    serde_json::from_value(json!({
        "apiVersion": "batch/v1",
        "kind": "CronJob",
        "metadata": metadata(backup)?,
        "spec": {
            "schedule": schedule.cron,
            "suspend": schedule.effective_suspend(),
            "startingDeadlineSeconds": schedule.starting_deadline_seconds,
            "concurrencyPolicy": "Forbid",
            "successfulJobsHistoryLimit": schedule.effective_successful_jobs_history_limit(),
            "failedJobsHistoryLimit": schedule.effective_failed_jobs_history_limit(),
            "jobTemplate": {
                "metadata": {
                    "labels": backup_labels(&backup.name_any()),
                },
                "spec": job_spec(backup, config),
            },
        },
    }))
    .context(SerializationSnafu)
}

pub fn build_pvc(backup: &Backup, persistence: &Persistence) -> Result<PersistentVolumeClaim> {
    serde_json::from_value(json!({
        "apiVersion": "v1",
        "kind": "PersistentVolumeClaim",
        "metadata": metadata(backup)?,
        "spec": {
            "accessModes": [persistence.access_mode()],
            "storageClassName": persistence.storage_class,
            "resources": {
                "requests": {
                    "storage": persistence.size(),
                },
            },
        },
    }))
    .context(SerializationSnafu)
}

/// The parts of a Job spec this operator sets. Fields the API server defaults are left out, so an
/// unchanged Backup never looks different from what the server returns.
#[derive(Debug, PartialEq)]
struct JobTemplateProjection {
    labels: Option<BTreeMap<String, String>>,
    containers: Vec<ContainerProjection>,
    volumes: Vec<(String, Option<String>, Option<String>)>,
    restart_policy: Option<String>,
    ttl_seconds_after_finished: Option<i32>,
    backoff_limit: Option<i32>,
}

#[derive(Debug, PartialEq)]
struct ContainerProjection {
    name: String,
    image: Option<String>,
    image_pull_policy: Option<String>,
    command: Option<Vec<String>>,
    args: Option<Vec<String>>,
    volume_mounts: Vec<(String, String)>,
}

impl JobTemplateProjection {
    fn new(spec: Option<&JobSpec>) -> Self {
        let pod = spec.and_then(|spec| spec.template.spec.as_ref());
        Self {
            labels: spec.and_then(|spec| spec.template.metadata.as_ref()).and_then(|m| m.labels.clone()),
            containers: pod
                .map(|pod| {
                    pod.containers
                        .iter()
                        .map(|c| ContainerProjection {
                            name: c.name.clone(),
                            image: c.image.clone(),
                            image_pull_policy: c.image_pull_policy.clone(),
                            command: c.command.clone(),
                            args: c.args.clone(),
                            volume_mounts: c
                                .volume_mounts
                                .iter()
                                .flatten()
                                .map(|m| (m.name.clone(), m.mount_path.clone()))
                                .collect(),
                        })
                        .collect()
                })
                .unwrap_or_default(),
            volumes: pod
                .and_then(|pod| pod.volumes.as_ref())
                .map(|volumes| {
                    volumes
                        .iter()
                        .map(|v| {
                            (
                                v.name.clone(),
                                v.secret.as_ref().and_then(|s| s.secret_name.clone()),
                                v.persistent_volume_claim.as_ref().map(|p| p.claim_name.clone()),
                            )
                        })
                        .collect()
                })
                .unwrap_or_default(),
            restart_policy: pod.and_then(|pod| pod.restart_policy.clone()),
            ttl_seconds_after_finished: spec.and_then(|spec| spec.ttl_seconds_after_finished),
            backoff_limit: spec.and_then(|spec| spec.backoff_limit),
        }
    }
}

fn job_template_spec(spec: &CronJobSpec) -> Option<&JobSpec> {
    spec.job_template.spec.as_ref()
}

/// Whether `existing` differs from `desired` in anything this operator manages.
pub fn cron_job_needs_update(existing: &CronJob, desired: &CronJob) -> bool {
    let (Some(current), Some(wanted)) = (existing.spec.as_ref(), desired.spec.as_ref()) else {
        return existing.spec.is_some() != desired.spec.is_some();
    };

    current.schedule != wanted.schedule
        || current.starting_deadline_seconds != wanted.starting_deadline_seconds
        || current.concurrency_policy.as_deref().unwrap_or("Allow")
            != wanted.concurrency_policy.as_deref().unwrap_or("Allow")
        || current.successful_jobs_history_limit.unwrap_or(DEFAULT_SUCCESSFUL_JOBS_HISTORY_LIMIT)
            != wanted.successful_jobs_history_limit.unwrap_or(DEFAULT_SUCCESSFUL_JOBS_HISTORY_LIMIT)
        || current.failed_jobs_history_limit.unwrap_or(DEFAULT_FAILED_JOBS_HISTORY_LIMIT)
            != wanted.failed_jobs_history_limit.unwrap_or(DEFAULT_FAILED_JOBS_HISTORY_LIMIT)
        || current.suspend.unwrap_or(false) != wanted.suspend.unwrap_or(false)
        || JobTemplateProjection::new(job_template_spec(current))
            != JobTemplateProjection::new(job_template_spec(wanted))
}

/// Copy the managed fields of `desired` onto `existing`, leaving everything else as fetched.
fn merge_cron_job(existing: &mut CronJob, desired: CronJob) {
    let Some(wanted) = desired.spec else {
        return;
    };
    let Some(current) = existing.spec.as_mut() else {
        existing.spec = Some(wanted);
        return;
    };

    let template_changed = JobTemplateProjection::new(job_template_spec(current))
        != JobTemplateProjection::new(job_template_spec(&wanted));

    current.schedule = wanted.schedule;
    current.starting_deadline_seconds = wanted.starting_deadline_seconds;
    current.concurrency_policy = wanted.concurrency_policy;
    current.successful_jobs_history_limit = wanted.successful_jobs_history_limit;
    current.failed_jobs_history_limit = wanted.failed_jobs_history_limit;
    current.suspend = wanted.suspend;
    if template_changed {
        current.job_template = wanted.job_template;
    }
}

pub async fn apply_cron_job(cluster: &dyn ClusterApi, desired: CronJob) -> Result<Applied> {
    let namespace = desired.namespace().context(MissingObjectKeySnafu { field: "namespace" })?;
    let name = desired.name_any();

    let existing = cluster.get_cron_job(&namespace, &name).await.with_context(|_| KubeSnafu {
        msg: format!("Failed to fetch cronjob {namespace}/{name}"),
    })?;

    let Some(mut existing) = existing else {
        cluster.create_cron_job(&namespace, &desired).await.with_context(|_| KubeSnafu {
            msg: format!("Failed to create cronjob {namespace}/{name}"),
        })?;
        info!(namespace, name, "Created cronjob");
        return Ok(Applied::Created);
    };

    if !cron_job_needs_update(&existing, &desired) {
        return Ok(Applied::Unchanged);
    }

    merge_cron_job(&mut existing, desired);
    cluster.replace_cron_job(&namespace, &existing).await.with_context(|_| KubeSnafu {
        msg: format!("Failed to update cronjob {namespace}/{name}"),
    })?;
    info!(namespace, name, "Updated cronjob");
    Ok(Applied::Updated)
}

/// Create the PVC if it does not exist. An existing claim is never modified.
pub async fn ensure_pvc(cluster: &dyn ClusterApi, desired: PersistentVolumeClaim) -> Result<Applied> {
    let namespace = desired.namespace().context(MissingObjectKeySnafu { field: "namespace" })?;
    let name = desired.name_any();

    let existing = cluster.get_pvc(&namespace, &name).await.with_context(|_| KubeSnafu {
        msg: format!("Failed to fetch pvc {namespace}/{name}"),
    })?;
    if existing.is_some() {
        return Ok(Applied::Unchanged);
    }

    cluster.create_pvc(&namespace, &desired).await.with_context(|_| KubeSnafu {
        msg: format!("Failed to create pvc {namespace}/{name}"),
    })?;
    info!(namespace, name, "Created pvc");
    Ok(Applied::Created)
}
