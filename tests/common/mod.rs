#![allow(dead_code)]

use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex},
};

use async_trait::async_trait;
use gobackup_operator::{
    cluster::ClusterApi,
    config::AppConfig,
    crd::{Backup, ReferenceTarget},
    Context,
};
use k8s_openapi::{
    api::{
        batch::v1::{CronJob, Job, JobCondition, JobStatus},
        core::v1::{PersistentVolumeClaim, Secret},
    },
    apimachinery::pkg::apis::meta::v1::OwnerReference,
    ByteString,
};
use kube::{
    api::ObjectMeta,
    core::ErrorResponse,
    runtime::events::EventType,
    Resource, ResourceExt,
};
use serde_json::{json, Value};
use test_context::AsyncTestContext;

pub const NS: &str = "prod";

type Key = (String, String);

fn key(namespace: &str, name: &str) -> Key {
    (namespace.to_string(), name.to_string())
}

fn api_error(code: u16, reason: &str) -> kube::Error {
    kube::Error::Api(ErrorResponse {
        status: "Failure".to_string(),
        message: format!("{reason} (fake)"),
        reason: reason.to_string(),
        code,
    })
}

#[derive(Default)]
pub struct FakeState {
    pub backups: BTreeMap<Key, Backup>,
    /// Backups removed through the API, with the status they had at that point.
    pub deleted_backups: Vec<Backup>,
    pub references: BTreeMap<(String, String, String), Value>,
    pub secrets: BTreeMap<Key, Secret>,
    pub pvcs: BTreeMap<Key, PersistentVolumeClaim>,
    pub jobs: BTreeMap<Key, Job>,
    pub cron_jobs: BTreeMap<Key, CronJob>,
    pub logs: BTreeMap<String, String>,
    pub events: Vec<(String, String)>,
    pub writes: Vec<String>,
    pub conflict_next_status_write: bool,
    resource_version: u64,
}

impl FakeState {
    fn next_version(&mut self) -> Option<String> {
        self.resource_version += 1;
        Some(self.resource_version.to_string())
    }

    fn write(&mut self, what: String) -> Option<String> {
        self.writes.push(what);
        self.next_version()
    }
}

/// In-memory cluster. Objects live in maps keyed by namespace and name; every mutating call is
/// logged in `writes`.
#[derive(Default)]
pub struct FakeCluster {
    pub state: Mutex<FakeState>,
}

impl FakeCluster {
    pub fn with<T>(&self, f: impl FnOnce(&mut FakeState) -> T) -> T {
        f(&mut self.state.lock().unwrap())
    }

    pub fn writes(&self) -> Vec<String> {
        self.with(|s| s.writes.clone())
    }

    pub fn event_reasons(&self) -> Vec<String> {
        self.with(|s| s.events.iter().map(|(_, reason)| reason.clone()).collect())
    }

    pub fn put_backup(&self, name: &str, spec: Value) -> Backup {
        self.with(|s| {
            let existing = s.backups.get(&key(NS, name)).cloned();
            let mut backup = Backup::new(name, serde_json::from_value(spec).unwrap());
            backup.metadata.namespace = Some(NS.to_string());
            backup.metadata.uid = Some(format!("{name}-uid"));
            backup.metadata.generation =
                Some(existing.as_ref().and_then(|b| b.metadata.generation).unwrap_or(0) + 1);
            backup.status = existing.and_then(|b| b.status);
            backup.metadata.resource_version = s.next_version();
            s.backups.insert(key(NS, name), backup.clone());
            backup
        })
    }

    pub fn backup(&self, name: &str) -> Option<Backup> {
        self.with(|s| s.backups.get(&key(NS, name)).cloned())
    }

    pub fn put_database(&self, name: &str, type_: &str, config: Value) {
        self.put_reference("databases", name, type_, config)
    }

    pub fn put_storage(&self, name: &str, type_: &str, config: Value) {
        self.put_reference("storages", name, type_, config)
    }

    fn put_reference(&self, plural: &str, name: &str, type_: &str, config: Value) {
        let object = json!({ "spec": { "type": type_, "config": config } });
        self.with(|s| {
            s.references.insert((plural.to_string(), NS.to_string(), name.to_string()), object)
        });
    }

    pub fn put_secret(&self, name: &str, data: &[(&str, &str)]) {
        let secret = Secret {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(NS.to_string()),
                ..Default::default()
            },
            data: Some(
                data.iter()
                    .map(|(k, v)| (k.to_string(), ByteString(v.as_bytes().to_vec())))
                    .collect(),
            ),
            ..Default::default()
        };
        self.with(|s| s.secrets.insert(key(NS, name), secret));
    }

    pub fn secret(&self, name: &str) -> Option<Secret> {
        self.with(|s| s.secrets.get(&key(NS, name)).cloned())
    }

    /// The rendered gobackup document of a Backup.
    pub fn gobackup_config(&self, name: &str) -> serde_yaml::Value {
        let secret = self.secret(name).expect("config secret");
        let data = secret.data.expect("secret data");
        serde_yaml::from_slice(&data["gobackup.yml"].0).unwrap()
    }

    pub fn job(&self, name: &str) -> Option<Job> {
        self.with(|s| s.jobs.get(&key(NS, name)).cloned())
    }

    pub fn cron_job(&self, name: &str) -> Option<CronJob> {
        self.with(|s| s.cron_jobs.get(&key(NS, name)).cloned())
    }

    pub fn pvc(&self, name: &str) -> Option<PersistentVolumeClaim> {
        self.with(|s| s.pvcs.get(&key(NS, name)).cloned())
    }

    /// Pretend the Job controller moved a Job along.
    pub fn set_job_counts(&self, name: &str, succeeded: i32, failed: i32, active: i32) {
        self.with(|s| {
            let job = s.jobs.get_mut(&key(NS, name)).expect("job exists");
            let conditions = match (succeeded, failed) {
                (1.., _) => vec![job_condition("Complete", None)],
                (_, 1..) => vec![job_condition("Failed", Some("BackoffLimitExceeded"))],
                _ => vec![],
            };
            job.status = Some(JobStatus {
                succeeded: Some(succeeded),
                failed: Some(failed),
                active: Some(active),
                conditions: Some(conditions),
                ..Default::default()
            });
        });
    }

    /// Pretend the CronJob of `backup` spawned a Job.
    pub fn spawn_scheduled_run(&self, backup: &str, job_name: &str, minute: u32) {
        self.with(|s| {
            let cron_job = s.cron_jobs.get(&key(NS, backup)).expect("cronjob exists").clone();
            let template = cron_job.spec.expect("cronjob spec").job_template;
            let job = Job {
                metadata: ObjectMeta {
                    name: Some(job_name.to_string()),
                    namespace: Some(NS.to_string()),
                    labels: template.metadata.and_then(|m| m.labels),
                    creation_timestamp: Some(
                        k8s_openapi::apimachinery::pkg::apis::meta::v1::Time(
                            chrono::DateTime::from_timestamp(i64::from(minute) * 60, 0).unwrap(),
                        ),
                    ),
                    owner_references: Some(vec![OwnerReference {
                        api_version: "batch/v1".to_string(),
                        kind: "CronJob".to_string(),
                        name: backup.to_string(),
                        uid: format!("{backup}-cron-uid"),
                        controller: Some(true),
                        ..Default::default()
                    }]),
                    ..Default::default()
                },
                spec: template.spec,
                status: None,
            };
            s.jobs.insert(key(NS, job_name), job);
        });
    }

    pub fn put_logs(&self, job_name: &str, logs: &str) {
        self.with(|s| s.logs.insert(job_name.to_string(), logs.to_string()));
    }
}

fn job_condition(type_: &str, reason: Option<&str>) -> JobCondition {
    JobCondition {
        type_: type_.to_string(),
        status: "True".to_string(),
        reason: reason.map(str::to_string),
        message: reason.map(|_| "Job has reached the specified backoff limit".to_string()),
        ..Default::default()
    }
}

fn create<T: Clone + Resource>(
    map: &mut BTreeMap<Key, T>, namespace: &str, object: &T, version: Option<String>,
) -> Result<T, kube::Error> {
    let name = object.meta().name.clone().unwrap_or_default();
    if map.contains_key(&key(namespace, &name)) {
        return Err(api_error(409, "AlreadyExists"));
    }
    let mut object = object.clone();
    object.meta_mut().namespace = Some(namespace.to_string());
    object.meta_mut().resource_version = version;
    map.insert(key(namespace, &name), object.clone());
    Ok(object)
}

fn replace<T: Clone + Resource>(
    map: &mut BTreeMap<Key, T>, namespace: &str, object: &T, version: Option<String>,
) -> Result<T, kube::Error> {
    let name = object.meta().name.clone().unwrap_or_default();
    let Some(current) = map.get(&key(namespace, &name)) else {
        return Err(api_error(404, "NotFound"));
    };
    if object.meta().resource_version.is_some()
        && object.meta().resource_version != current.meta().resource_version
    {
        return Err(api_error(409, "Conflict"));
    }
    let mut object = object.clone();
    object.meta_mut().resource_version = version;
    map.insert(key(namespace, &name), object.clone());
    Ok(object)
}

#[async_trait]
impl ClusterApi for FakeCluster {
    async fn get_backup(&self, namespace: &str, name: &str) -> Result<Option<Backup>, kube::Error> {
        Ok(self.with(|s| s.backups.get(&key(namespace, name)).cloned()))
    }

    async fn replace_backup_status(&self, backup: &Backup) -> Result<Backup, kube::Error> {
        self.with(|s| {
            if std::mem::take(&mut s.conflict_next_status_write) {
                return Err(api_error(409, "Conflict"));
            }
            let namespace = backup.namespace().unwrap_or_default();
            let version = s.write(format!("status backup/{}", backup.name_any()));
            let current = s
                .backups
                .get_mut(&key(&namespace, &backup.name_any()))
                .ok_or_else(|| api_error(404, "NotFound"))?;
            if backup.metadata.resource_version != current.metadata.resource_version {
                return Err(api_error(409, "Conflict"));
            }
            current.status = backup.status.clone();
            current.metadata.resource_version = version;
            Ok(current.clone())
        })
    }

    async fn delete_backup(&self, namespace: &str, name: &str) -> Result<(), kube::Error> {
        self.with(|s| {
            s.write(format!("delete backup/{name}"));
            if let Some(backup) = s.backups.remove(&key(namespace, name)) {
                s.deleted_backups.push(backup);
            }
        });
        Ok(())
    }

    async fn get_reference(
        &self, target: &ReferenceTarget, namespace: &str, name: &str,
    ) -> Result<Option<Value>, kube::Error> {
        Ok(self.with(|s| {
            s.references
                .get(&(target.plural.clone(), namespace.to_string(), name.to_string()))
                .cloned()
        }))
    }

    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>, kube::Error> {
        Ok(self.with(|s| s.secrets.get(&key(namespace, name)).cloned()))
    }

    async fn create_secret(&self, namespace: &str, secret: &Secret) -> Result<Secret, kube::Error> {
        self.with(|s| {
            let version = s.write(format!("create secret/{}", secret.name_any()));
            create(&mut s.secrets, namespace, secret, version)
        })
    }

    async fn replace_secret(&self, namespace: &str, secret: &Secret) -> Result<Secret, kube::Error> {
        self.with(|s| {
            let version = s.write(format!("replace secret/{}", secret.name_any()));
            replace(&mut s.secrets, namespace, secret, version)
        })
    }

    async fn delete_secret(&self, namespace: &str, name: &str) -> Result<(), kube::Error> {
        self.with(|s| {
            s.write(format!("delete secret/{name}"));
            s.secrets.remove(&key(namespace, name));
        });
        Ok(())
    }

    async fn get_pvc(
        &self, namespace: &str, name: &str,
    ) -> Result<Option<PersistentVolumeClaim>, kube::Error> {
        Ok(self.with(|s| s.pvcs.get(&key(namespace, name)).cloned()))
    }

    async fn create_pvc(
        &self, namespace: &str, pvc: &PersistentVolumeClaim,
    ) -> Result<PersistentVolumeClaim, kube::Error> {
        self.with(|s| {
            let version = s.write(format!("create pvc/{}", pvc.name_any()));
            create(&mut s.pvcs, namespace, pvc, version)
        })
    }

    async fn get_job(&self, namespace: &str, name: &str) -> Result<Option<Job>, kube::Error> {
        Ok(self.with(|s| s.jobs.get(&key(namespace, name)).cloned()))
    }

    async fn list_jobs(&self, namespace: &str, label_selector: &str) -> Result<Vec<Job>, kube::Error> {
        let (label, value) = label_selector.split_once('=').unwrap_or((label_selector, ""));
        Ok(self.with(|s| {
            s.jobs
                .iter()
                .filter(|((ns, _), job)| {
                    ns == namespace && job.labels().get(label).map(String::as_str) == Some(value)
                })
                .map(|(_, job)| job.clone())
                .collect()
        }))
    }

    async fn create_job(&self, namespace: &str, job: &Job) -> Result<Job, kube::Error> {
        self.with(|s| {
            let version = s.write(format!("create job/{}", job.name_any()));
            create(&mut s.jobs, namespace, job, version)
        })
    }

    async fn delete_job(&self, namespace: &str, name: &str) -> Result<(), kube::Error> {
        self.with(|s| {
            s.write(format!("delete job/{name}"));
            s.jobs.remove(&key(namespace, name));
        });
        Ok(())
    }

    async fn get_cron_job(
        &self, namespace: &str, name: &str,
    ) -> Result<Option<CronJob>, kube::Error> {
        Ok(self.with(|s| s.cron_jobs.get(&key(namespace, name)).cloned()))
    }

    async fn create_cron_job(
        &self, namespace: &str, cron_job: &CronJob,
    ) -> Result<CronJob, kube::Error> {
        self.with(|s| {
            let version = s.write(format!("create cronjob/{}", cron_job.name_any()));
            create(&mut s.cron_jobs, namespace, cron_job, version)
        })
    }

    async fn replace_cron_job(
        &self, namespace: &str, cron_job: &CronJob,
    ) -> Result<CronJob, kube::Error> {
        self.with(|s| {
            let version = s.write(format!("replace cronjob/{}", cron_job.name_any()));
            replace(&mut s.cron_jobs, namespace, cron_job, version)
        })
    }

    async fn job_logs(
        &self, _namespace: &str, job_name: &str, _container: &str, _tail_lines: i64,
    ) -> Result<Option<String>, kube::Error> {
        Ok(self.with(|s| s.logs.get(job_name).cloned()))
    }

    async fn publish_event(
        &self, backup: &Backup, type_: EventType, reason: &str, _action: &str, _note: Option<String>,
    ) -> Result<(), kube::Error> {
        let kind = match type_ {
            EventType::Normal => "Normal",
            EventType::Warning => "Warning",
        };
        self.with(|s| s.events.push((format!("{kind} {}", backup.name_any()), reason.to_string())));
        Ok(())
    }
}

/// A reconciler context wired to a fresh [`FakeCluster`] holding a postgres Database, an s3
/// Storage and their credentials.
pub struct Harness {
    pub cluster: Arc<FakeCluster>,
    pub ctx: Context,
}

impl Harness {
    pub async fn reconcile(
        &self, name: &str,
    ) -> gobackup_operator::Result<kube::runtime::controller::Action> {
        gobackup_operator::tasks::backup::reconcile_backup(&self.ctx, NS, name).await
    }
}

#[async_trait::async_trait]
impl AsyncTestContext for Harness {
    async fn setup() -> Self {
        let cluster = Arc::new(FakeCluster::default());
        cluster.put_database(
            "pg",
            "postgresql",
            json!({
                "host": "pg.prod.svc",
                "port": 5432,
                "database": "app",
                "username": "postgres",
                "password_ref": { "name": "pg-creds", "key": "password" },
            }),
        );
        cluster.put_storage(
            "s3",
            "s3",
            json!({
                "bucket": "backups",
                "region": "eu-west-1",
                "accessKeyID_ref": { "name": "s3-creds", "key": "access-key-id" },
                "secretAccessKey_ref": { "name": "s3-creds", "key": "secret-access-key" },
            }),
        );
        cluster.put_secret("pg-creds", &[("password", "hunter2")]);
        cluster.put_secret("s3-creds", &[("access-key-id", "AKIA"), ("secret-access-key", "shh")]);

        let ctx = Context::new(cluster.clone(), AppConfig::default());
        Harness { cluster, ctx }
    }

    async fn teardown(self) {}
}
