//! Tracking of backup runs in the Backup status.

use chrono::{DateTime, Utc};
use k8s_openapi::api::batch::v1::Job;
use kube::ResourceExt as _;
use tracing::{debug, info};

use crate::{
    cluster::ClusterApi,
    crd::{Backup, BackupRunStatus, BackupStatus, RunPhase},
    error::is_conflict,
    AppError, Result,
};

use super::workload::CONTAINER_NAME;

pub const MAX_RECENT_RUNS: usize = 5;
pub const MAX_LOG_SIZE: usize = 4096;
pub const MAX_MESSAGE_SIZE: usize = 1024;

const TRUNCATION_MARKER: &str = "...[truncated]...\n";

/// Keep the last `max` characters of `s`. A truncated value starts with a marker and is still at
/// most `max` characters long.
pub fn truncate_tail(s: &str, max: usize) -> String {
    let len = s.chars().count();
    if len <= max {
        return s.to_string();
    }

    let marker_len = TRUNCATION_MARKER.chars().count();
    if max <= marker_len {
        return s.chars().skip(len - max).collect();
    }

    let tail: String = s.chars().skip(len - (max - marker_len)).collect();
    format!("{TRUNCATION_MARKER}{tail}")
}

/// Phase of a Job. Success wins over failure, failure over activity.
pub fn derive_phase(job: &Job) -> RunPhase {
    let status = job.status.as_ref();
    let succeeded = status.and_then(|x| x.succeeded).unwrap_or(0);
    let failed = status.and_then(|x| x.failed).unwrap_or(0);
    let active = status.and_then(|x| x.active).unwrap_or(0);

    if succeeded > 0 {
        RunPhase::Succeeded
    } else if failed > 0 {
        RunPhase::Failed
    } else if active > 0 {
        RunPhase::Running
    } else {
        RunPhase::Pending
    }
}

/// Describe `job` as a run. `logs` is only kept for failed runs.
pub fn derive_run_status(job: &Job, logs: Option<String>) -> BackupRunStatus {
    let phase = derive_phase(job);
    let status = job.status.as_ref();
    let conditions = status.and_then(|s| s.conditions.as_deref()).unwrap_or_default();

    let mut message = String::new();
    let mut failed_at = None;
    for condition in conditions.iter().filter(|c| c.status == "True") {
        match condition.type_.as_str() {
            "Complete" => message = "Backup completed successfully".to_string(),
            "Failed" => {
                let reason = condition.message.as_deref().unwrap_or_default();
                message = format!("Backup failed: {reason}");
                failed_at = condition.last_transition_time.as_ref().map(|t| t.0);
            }
            _ => {}
        }
    }

    BackupRunStatus {
        job_name: job.name_any(),
        start_time: status.and_then(|s| s.start_time.as_ref()).map(|t| t.0),
        // Failed Jobs never get a completion time
        completion_time: status.and_then(|s| s.completion_time.as_ref()).map(|t| t.0).or(failed_at),
        phase,
        message: truncate_tail(&message, MAX_MESSAGE_SIZE),
        logs: match phase {
            RunPhase::Failed => truncate_tail(logs.as_deref().unwrap_or_default(), MAX_LOG_SIZE),
            _ => String::new(),
        },
    }
}

pub const LOST_RUN_MESSAGE: &str = "Job was removed before completion was observed";

/// Close a run whose Job disappeared while it was last seen pending or running. The outcome is
/// unknown, so it is recorded as failed.
pub fn lost_run(previous: &BackupRunStatus, now: DateTime<Utc>) -> BackupRunStatus {
    BackupRunStatus {
        job_name: previous.job_name.clone(),
        start_time: previous.start_time,
        completion_time: Some(now),
        phase: RunPhase::Failed,
        message: LOST_RUN_MESSAGE.to_string(),
        logs: String::new(),
    }
}

/// Whether `status` already records `job_name` at `phase`.
pub fn is_recorded(status: &BackupStatus, job_name: &str, phase: RunPhase) -> bool {
    status
        .last_run
        .iter()
        .chain(status.recent_runs.iter())
        .any(|run| run.job_name == job_name && run.phase == phase)
}

/// Fold `run` into `status`. Returns false when the run was already recorded at its phase, in which
/// case nothing is touched.
///
/// Counters move only when a run reaches a terminal phase it was not recorded at before, so
/// observing the same finished Job again is harmless.
pub fn merge_into_history(status: &mut BackupStatus, run: BackupRunStatus, now: DateTime<Utc>) -> bool {
    if is_recorded(status, &run.job_name, run.phase) {
        return false;
    }

    match run.phase {
        RunPhase::Succeeded => {
            status.success_count += 1;
            status.failure_count = 0;
            status.last_successful_backup_time = Some(now);
        }
        RunPhase::Failed => status.failure_count += 1,
        RunPhase::Pending | RunPhase::Running => {}
    }

    status.last_backup_time = Some(now);
    status.phase = Some(run.phase);

    match status.recent_runs.iter_mut().find(|r| r.job_name == run.job_name) {
        Some(existing) => *existing = run.clone(),
        None => {
            status.recent_runs.insert(0, run.clone());
            status.recent_runs.truncate(MAX_RECENT_RUNS);
        }
    }
    status.last_run = Some(run);
    true
}

/// Newest Job by creation time.
pub fn newest_job(jobs: &[Job]) -> Option<&Job> {
    jobs.iter().max_by_key(|job| job.creation_timestamp())
}

/// Tail of the gobackup container output. Failures end up in the returned text instead of being
/// raised.
pub async fn collect_logs(
    cluster: &dyn ClusterApi, namespace: &str, job_name: &str, tail_lines: i64,
) -> String {
    let logs = match cluster.job_logs(namespace, job_name, CONTAINER_NAME, tail_lines).await {
        Ok(Some(logs)) => logs,
        Ok(None) => format!("Failed to collect logs: no pods found for job {job_name}"),
        Err(err) => {
            debug!(namespace, job = job_name, %err, "Failed to collect pod logs");
            format!("Failed to collect logs: {err}")
        }
    };
    truncate_tail(&logs, MAX_LOG_SIZE)
}

/// Record the current state of `job` in `status`. Returns whether `status` changed.
pub async fn observe_job(
    cluster: &dyn ClusterApi, status: &mut BackupStatus, job: &Job, tail_lines: i64,
    now: DateTime<Utc>,
) -> bool {
    let job_name = job.name_any();
    let phase = derive_phase(job);
    if is_recorded(status, &job_name, phase) {
        debug!(job = job_name, phase = phase.as_str(), "Run already recorded");
        return false;
    }

    let logs = match (phase, job.namespace()) {
        (RunPhase::Failed, Some(namespace)) => {
            Some(collect_logs(cluster, &namespace, &job_name, tail_lines).await)
        }
        _ => None,
    };

    info!(job = job_name, phase = phase.as_str(), "Recording backup run");
    merge_into_history(status, derive_run_status(job, logs), now)
}

/// Replace the status of `backup`. A conflicting write is dropped, the next reconcile retries it.
pub async fn write_status(cluster: &dyn ClusterApi, backup: &Backup, status: BackupStatus) -> Result<bool> {
    let mut updated = backup.clone();
    updated.status = Some(status);

    match cluster.replace_backup_status(&updated).await {
        Ok(_) => Ok(true),
        Err(err) if is_conflict(&err) => {
            info!(name = backup.name_any(), "Conflict updating backup status, will retry on next reconcile");
            Ok(false)
        }
        Err(source) => Err(AppError::KubeError {
            msg: format!("Failed to update status of backup {}", backup.name_any()),
            source,
        }),
    }
}
