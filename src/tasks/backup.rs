use std::time::Duration;

use chrono::{DateTime, Utc};
use k8s_openapi::api::batch::v1::Job;
use kube::{runtime::controller::Action, runtime::events::EventType, Resource as _, ResourceExt as _};
use snafu::ResultExt as _;
use tracing::{debug, info, warn};

use crate::{
    crd::{Backup, BackupSchedule, BackupStatus, RunPhase},
    AppError, Context, KubeSnafu, Result,
};

use super::{
    backup_selector,
    config::{apply_secret, build_config, build_secret},
    set_condition,
    status::{derive_phase, lost_run, merge_into_history, newest_job, observe_job, write_status},
    workload::{apply_cron_job, build_cron_job, build_job, build_pvc, ensure_pvc},
    Applied, PartialCondition, READY_CONDITION,
};

const CRON_FIELDS: usize = 5;

/// Status changes collected during a reconcile and written in one go.
struct StatusUpdate<'a> {
    backup: &'a Backup,
    written: BackupStatus,
    status: BackupStatus,
    now: DateTime<Utc>,
}

impl<'a> StatusUpdate<'a> {
    fn new(backup: &'a Backup, now: DateTime<Utc>) -> Self {
        let status = backup.status.clone().unwrap_or_default();
        Self { backup, written: status.clone(), status, now }
    }

    /// Returns whether the Ready condition changed.
    fn set_ready(&mut self, condition: PartialCondition<'_>) -> bool {
        let generation = self.backup.meta().generation;
        set_condition(&mut self.status.conditions, READY_CONDITION, condition, generation, self.now)
    }

    /// Success and failure counters, to detect a run finishing during this reconcile.
    fn counts(&self) -> (i32, i32) {
        (self.status.success_count, self.status.failure_count)
    }

    async fn flush(&mut self, ctx: &Context) -> Result<()> {
        if self.status == self.written {
            return Ok(());
        }
        write_status(ctx.cluster.as_ref(), self.backup, self.status.clone()).await?;
        self.written = self.status.clone();
        Ok(())
    }
}

/// Reject a Backup that can never run.
pub fn validate(backup: &Backup) -> Result<()> {
    let spec = &backup.spec;
    let invalid = |message: String| Err(AppError::Validation { message });

    if spec.database_refs.is_empty() {
        return invalid("at least one databaseRef is required".to_string());
    }
    if spec.storage_refs.is_empty() {
        return invalid("at least one storageRef is required".to_string());
    }
    if let Some(i) = spec.database_refs.iter().position(|r| r.name.is_empty()) {
        return invalid(format!("databaseRefs[{i}].name must not be empty"));
    }
    if let Some(i) = spec.storage_refs.iter().position(|r| r.name.is_empty()) {
        return invalid(format!("storageRefs[{i}].name must not be empty"));
    }
    if let Some(schedule) = &spec.schedule {
        let fields = schedule.cron.split_whitespace().count();
        if fields != CRON_FIELDS {
            return invalid(format!(
                "schedule.cron must have exactly {CRON_FIELDS} fields, got {fields} in '{}'",
                schedule.cron
            ));
        }
    }
    Ok(())
}

/// Bring the objects of one Backup in line with its spec.
pub async fn reconcile_backup(ctx: &Context, namespace: &str, name: &str) -> Result<Action> {
    let backup = ctx.cluster.get_backup(namespace, name).await.with_context(|_| KubeSnafu {
        msg: format!("Failed to fetch backup {namespace}/{name}"),
    })?;
    let Some(backup) = backup else {
        debug!(namespace, name, "Backup is gone");
        return Ok(Action::await_change());
    };
    if backup.meta().deletion_timestamp.is_some() {
        debug!(namespace, name, "Backup is being deleted");
        return Ok(Action::await_change());
    }

    let mut update = StatusUpdate::new(&backup, Utc::now());
    let result = apply(ctx, &backup, &mut update).await;

    let ready = match &result {
        Ok(_) => Some(PartialCondition {
            status: "True",
            reason: "Reconciled",
            message: "Backup resources are up to date",
        }),
        Err(AppError::Validation { message }) => {
            Some(PartialCondition { status: "False", reason: "InvalidSpec", message })
        }
        Err(AppError::Reference { message }) => {
            Some(PartialCondition { status: "False", reason: "ReferenceError", message })
        }
        Err(_) => None,
    };
    if let Some(ready) = ready {
        let reason = ready.reason;
        if update.set_ready(ready) {
            if let Err(err) = &result {
                publish(ctx, &backup, EventType::Warning, reason, "Reconciling", Some(err.to_string()))
                    .await;
            }
        }
    }

    match (result, update.flush(ctx).await) {
        (Ok(action), Ok(())) => Ok(action),
        (Ok(_), Err(err)) => Err(err),
        (Err(err), flushed) => {
            if let Err(flush_err) = flushed {
                warn!(namespace, name, %flush_err, "Failed to record reconcile failure in status");
            }
            Err(err)
        }
    }
}

async fn apply(ctx: &Context, backup: &Backup, update: &mut StatusUpdate<'_>) -> Result<Action> {
    validate(backup)?;
    let cluster = ctx.cluster.as_ref();

    if let Some(persistence) = backup.spec.persistence.as_ref().filter(|p| p.enabled) {
        if ensure_pvc(cluster, build_pvc(backup, persistence)?).await? == Applied::Created {
            publish(ctx, backup, EventType::Normal, "PersistentVolumeClaimCreated", "Creating", None)
                .await;
        }
    }

    // The workload mounts the Secret, so it goes first
    let config = build_config(cluster, backup).await?;
    match apply_secret(cluster, build_secret(backup, config)?).await? {
        Applied::Created => {
            publish(ctx, backup, EventType::Normal, "ConfigCreated", "Creating", None).await
        }
        Applied::Updated => {
            publish(ctx, backup, EventType::Normal, "ConfigUpdated", "Updating", None).await
        }
        Applied::Unchanged => {}
    }

    match &backup.spec.schedule {
        Some(schedule) => apply_scheduled(ctx, backup, schedule, update).await,
        None => apply_immediate(ctx, backup, update).await,
    }
}

async fn apply_scheduled(
    ctx: &Context, backup: &Backup, schedule: &BackupSchedule, update: &mut StatusUpdate<'_>,
) -> Result<Action> {
    let cluster = ctx.cluster.as_ref();
    let namespace = backup.namespace().unwrap_or_default();
    let name = backup.name_any();

    match apply_cron_job(cluster, build_cron_job(backup, schedule, &ctx.config)?).await? {
        Applied::Created => {
            let note = format!("Scheduled backups at '{}'", schedule.cron);
            publish(ctx, backup, EventType::Normal, "CronJobCreated", "Creating", Some(note)).await
        }
        Applied::Updated => {
            publish(ctx, backup, EventType::Normal, "CronJobUpdated", "Updating", None).await
        }
        Applied::Unchanged => {}
    }

    let jobs = cluster.list_jobs(&namespace, &backup_selector(&name)).await.with_context(|_| {
        KubeSnafu { msg: format!("Failed to list jobs of backup {namespace}/{name}") }
    })?;
    if let Some(job) = newest_job(&jobs) {
        track_run(ctx, backup, update, job).await;
    }

    Ok(Action::requeue(Duration::from_secs(ctx.config.idle_requeue_secs)))
}

async fn apply_immediate(
    ctx: &Context, backup: &Backup, update: &mut StatusUpdate<'_>,
) -> Result<Action> {
    let cluster = ctx.cluster.as_ref();
    let namespace = backup.namespace().unwrap_or_default();
    let name = backup.name_any();
    let running = Action::requeue(Duration::from_secs(ctx.config.running_requeue_secs));

    let job = cluster.get_job(&namespace, &name).await.with_context(|_| KubeSnafu {
        msg: format!("Failed to fetch job {namespace}/{name}"),
    })?;

    let Some(job) = job else {
        let Some(last_run) = update.status.last_run.clone().filter(|run| run.job_name == name) else {
            cluster.create_job(&namespace, &build_job(backup, &ctx.config)?).await.with_context(
                |_| KubeSnafu { msg: format!("Failed to create job {namespace}/{name}") },
            )?;
            info!(namespace, name, "Created backup job");
            publish(ctx, backup, EventType::Normal, "JobCreated", "Creating", None).await;
            return Ok(running);
        };

        // The Job ran already; never start it twice
        if !last_run.phase.is_terminal() {
            let phase = last_run.phase.as_str();
            warn!(namespace, name, phase, "Job removed before it was seen finishing");
            let counts = update.counts();
            let now = update.now;
            if merge_into_history(&mut update.status, lost_run(&last_run, now), now) {
                report_completion(ctx, backup, update, counts, &name).await;
            }
        }
        info!(namespace, name, "Job finished and was already removed, cleaning up");
        return finish_immediate(ctx, backup, update).await;
    };

    track_run(ctx, backup, update, &job).await;
    if derive_phase(&job).is_terminal() {
        return finish_immediate(ctx, backup, update).await;
    }
    Ok(running)
}

/// Record the run in the status, then remove everything the immediate Backup owns, itself
/// included.
async fn finish_immediate(
    ctx: &Context, backup: &Backup, update: &mut StatusUpdate<'_>,
) -> Result<Action> {
    let cluster = ctx.cluster.as_ref();
    let namespace = backup.namespace().unwrap_or_default();
    let name = backup.name_any();

    update.set_ready(PartialCondition {
        status: "True",
        reason: "Reconciled",
        message: "Backup resources are up to date",
    });
    update.flush(ctx).await?;

    cluster.delete_secret(&namespace, &name).await.with_context(|_| KubeSnafu {
        msg: format!("Failed to delete config secret {namespace}/{name}"),
    })?;
    cluster.delete_job(&namespace, &name).await.with_context(|_| KubeSnafu {
        msg: format!("Failed to delete job {namespace}/{name}"),
    })?;
    cluster.delete_backup(&namespace, &name).await.with_context(|_| KubeSnafu {
        msg: format!("Failed to delete backup {namespace}/{name}"),
    })?;
    info!(namespace, name, "Immediate backup finished and was cleaned up");

    Ok(Action::await_change())
}

async fn track_run(
    ctx: &Context, backup: &Backup, update: &mut StatusUpdate<'_>, job: &Job,
) {
    let counts = update.counts();
    let now = update.now;
    if observe_job(ctx.cluster.as_ref(), &mut update.status, job, ctx.config.log_tail_lines, now).await
    {
        report_completion(ctx, backup, update, counts, &job.name_any()).await;
    }
}

/// Count and announce a run that reached a terminal phase since `counts` was taken.
async fn report_completion(
    ctx: &Context, backup: &Backup, update: &StatusUpdate<'_>, (succeeded, failed): (i32, i32),
    job_name: &str,
) {
    let phase = if update.status.success_count > succeeded {
        RunPhase::Succeeded
    } else if update.status.failure_count > failed {
        RunPhase::Failed
    } else {
        return;
    };

    ctx.metrics.run_completed(phase);
    match phase {
        RunPhase::Succeeded => {
            let note = format!("Job {job_name} completed");
            publish(ctx, backup, EventType::Normal, "BackupSucceeded", "Backing up", Some(note)).await
        }
        _ => {
            let note = update.status.last_run.as_ref().map(|run| run.message.clone());
            publish(ctx, backup, EventType::Warning, "BackupFailed", "Backing up", note).await
        }
    }
}

/// Events are informational; failing to publish one never fails the reconcile.
async fn publish(
    ctx: &Context, backup: &Backup, type_: EventType, reason: &str, action: &str, note: Option<String>,
) {
    if let Err(err) = ctx.cluster.publish_event(backup, type_, reason, action, note).await {
        warn!(?err, name = backup.name_any(), reason, "Failed to publish event for backup");
    }
}
