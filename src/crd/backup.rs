use chrono::{DateTime, Utc};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Condition;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::{DatabaseRef, StorageRef};

/// Default size of the PVC holding gobackup state between runs.
pub const DEFAULT_PERSISTENCE_SIZE: &str = "100Mi";
pub const DEFAULT_PERSISTENCE_ACCESS_MODE: &str = "ReadWriteOnce";

pub const DEFAULT_SUCCESSFUL_JOBS_HISTORY_LIMIT: i32 = 3;
pub const DEFAULT_FAILED_JOBS_HISTORY_LIMIT: i32 = 1;

#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[kube(kind = "Backup", group = "gobackup.io", version = "v1", namespaced)]
#[kube(status = "BackupStatus", shortname = "backup")]
#[kube(
    printcolumn = r#"{"name":"Phase", "type":"string", "description":"Phase of the latest run", "jsonPath":".status.phase"}"#
)]
#[kube(
    printcolumn = r#"{"name":"Schedule", "type":"string", "jsonPath":".spec.schedule.cron"}"#
)]
#[kube(
    printcolumn = r#"{"name":"LastSuccess", "type":"date", "jsonPath":".status.lastSuccessfulBackupTime"}"#
)]
#[kube(printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#)]
#[serde(rename_all = "camelCase")]
pub struct BackupSpec {
    /// Databases to dump.
    #[serde(default)]
    pub database_refs: Vec<DatabaseRef>,

    /// Storages the dumps are uploaded to.
    #[serde(default)]
    pub storage_refs: Vec<StorageRef>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub before_script: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub after_script: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compress_with: Option<Compress>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encode_with: Option<Encode>,

    /// When set, backups run on a CronJob. Otherwise a single Job runs and the Backup deletes
    /// itself once it finishes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule: Option<BackupSchedule>,

    /// Storage for gobackup state (cycler.json) between runs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub persistence: Option<Persistence>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct BackupSchedule {
    /// Standard 5 field cron expression.
    pub cron: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suspend: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub starting_deadline_seconds: Option<i64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub successful_jobs_history_limit: Option<i32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_jobs_history_limit: Option<i32>,
}

impl BackupSchedule {
    pub fn effective_suspend(&self) -> bool {
        self.suspend.unwrap_or(false)
    }

    pub fn effective_successful_jobs_history_limit(&self) -> i32 {
        self.successful_jobs_history_limit.unwrap_or(DEFAULT_SUCCESSFUL_JOBS_HISTORY_LIMIT)
    }

    pub fn effective_failed_jobs_history_limit(&self) -> i32 {
        self.failed_jobs_history_limit.unwrap_or(DEFAULT_FAILED_JOBS_HISTORY_LIMIT)
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Persistence {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_class: Option<String>,

    /// Defaults to ReadWriteOnce.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_mode: Option<String>,

    /// Defaults to 100Mi.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<String>,
}

impl Persistence {
    pub fn access_mode(&self) -> &str {
        match self.access_mode.as_deref() {
            Some(mode) if !mode.is_empty() => mode,
            _ => DEFAULT_PERSISTENCE_ACCESS_MODE,
        }
    }

    pub fn size(&self) -> &str {
        match self.size.as_deref() {
            Some(size) if !size.is_empty() => size,
            _ => DEFAULT_PERSISTENCE_SIZE,
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct Compress {
    #[serde(rename = "type")]
    pub type_: String,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct Encode {
    #[serde(rename = "type")]
    pub type_: String,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, PartialEq, Eq, JsonSchema)]
pub enum RunPhase {
    #[default]
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl RunPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunPhase::Succeeded | RunPhase::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RunPhase::Pending => "Pending",
            RunPhase::Running => "Running",
            RunPhase::Succeeded => "Succeeded",
            RunPhase::Failed => "Failed",
        }
    }
}

/// One execution of the backup workload.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct BackupRunStatus {
    pub job_name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completion_time: Option<DateTime<Utc>>,

    #[serde(default)]
    pub phase: RunPhase,

    /// At most 1024 characters.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,

    /// Tail of the container output, only captured for failed runs. At most 4096 characters.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub logs: String,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct BackupStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<RunPhase>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_backup_time: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_successful_backup_time: Option<DateTime<Utc>>,

    /// Consecutive failures, reset by a successful run.
    #[serde(default)]
    pub failure_count: i32,

    #[serde(default)]
    pub success_count: i32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_run: Option<BackupRunStatus>,

    /// Newest first, at most 5 entries.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    #[schemars(length(max = 5))]
    pub recent_runs: Vec<BackupRunStatus>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

impl Backup {
    pub fn persistence_enabled(&self) -> bool {
        self.spec.persistence.as_ref().is_some_and(|p| p.enabled)
    }
}
