use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[serde(default)]
pub struct AppConfig {
    /// Image running `gobackup perform` inside backup Jobs.
    pub backup_job_image: String,

    pub image_pull_policy: String,

    /// Finished Jobs are removed by the cluster this many seconds after completion.
    pub job_ttl_seconds_after_finished: i32,

    /// How often an immediate Backup whose Job is still running is re-checked.
    pub running_requeue_secs: u64,

    /// Requeue interval for scheduled Backups when no events arrive.
    pub idle_requeue_secs: u64,

    /// Requeue interval after an unresolved reference.
    pub reference_retry_secs: u64,

    /// Requeue interval after a transient API failure.
    pub error_retry_secs: u64,

    /// Lines of container output captured from a failed run.
    pub log_tail_lines: i64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            backup_job_image: "huacnlee/gobackup:latest".to_string(),
            image_pull_policy: "IfNotPresent".to_string(),
            job_ttl_seconds_after_finished: 300,
            running_requeue_secs: 30,
            idle_requeue_secs: 5 * 60,
            reference_retry_secs: 60,
            error_retry_secs: 15,
            log_tail_lines: 100,
        }
    }
}
