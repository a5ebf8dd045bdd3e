use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{Condition, Time};

use crate::OPERATOR;

pub mod backup;
pub mod config;
pub mod reference;
pub mod status;
pub mod workload;

pub const LABEL_CREATED_BY: &str = "app.kubernetes.io/created-by";
pub const LABEL_BACKUP: &str = "gobackup.io/backup";

/// Condition summarizing whether the last reconcile of a Backup went through.
pub const READY_CONDITION: &str = "Ready";

/// Labels put on every object created for a Backup.
pub fn backup_labels(name: &str) -> BTreeMap<String, String> {
    maplit::btreemap! {
        LABEL_CREATED_BY.to_string() => OPERATOR.to_string(),
        LABEL_BACKUP.to_string() => name.to_string(),
    }
}

pub fn backup_selector(name: &str) -> String {
    format!("{LABEL_BACKUP}={name}")
}

/// What a create-or-update step did.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Applied {
    Created,
    Updated,
    Unchanged,
}

pub struct PartialCondition<'a> {
    pub status: &'a str,
    pub reason: &'a str,
    pub message: &'a str,
}

impl PartialCondition<'_> {
    pub fn into_condition(self, type_: &str, generation: Option<i64>, now: DateTime<Utc>) -> Condition {
        Condition {
            type_: type_.to_string(),
            status: self.status.to_string(),
            reason: self.reason.to_string(),
            message: self.message.to_string(),
            observed_generation: generation,
            last_transition_time: Time(now),
        }
    }

    /// Whether `existing` already says the same thing.
    fn matches(&self, existing: &Condition, generation: Option<i64>) -> bool {
        existing.status == self.status
            && existing.reason == self.reason
            && existing.message == self.message
            && existing.observed_generation == generation
    }
}

/// Upsert a condition. The transition time only moves when the status flips. Returns whether
/// `conditions` changed.
pub fn set_condition(
    conditions: &mut Vec<Condition>, type_: &str, condition: PartialCondition<'_>,
    generation: Option<i64>, now: DateTime<Utc>,
) -> bool {
    let Some(existing) = conditions.iter_mut().find(|c| c.type_ == type_) else {
        conditions.push(condition.into_condition(type_, generation, now));
        return true;
    };
    if condition.matches(existing, generation) {
        return false;
    }

    let transitioned = existing.status != condition.status;
    let previous = existing.last_transition_time.0;
    *existing = condition.into_condition(type_, generation, if transitioned { now } else { previous });
    true
}
