//! Kubernetes access used by the Backup reconciler.
//!
//! Every API call the reconciler makes goes through [`ClusterApi`], so the reconcile state machine
//! can be exercised against a mock or an in-memory cluster in tests.

use std::cmp::Reverse;

use async_trait::async_trait;
use k8s_openapi::api::{
    batch::v1::{CronJob, Job},
    core::v1::{PersistentVolumeClaim, Pod, Secret},
};
use kube::{
    api::{DeleteParams, ListParams, LogParams, PostParams, PropagationPolicy},
    core::{ApiResource, DynamicObject, GroupVersionKind},
    runtime::events::{Event, EventType, Recorder, Reporter},
    Api, Client, Resource as _, ResourceExt as _,
};

#[cfg(test)]
use mockall::automock;

use crate::{
    crd::{Backup, ReferenceTarget},
    error::is_not_found,
    OPERATOR,
};

/// Kubernetes operations needed to reconcile a Backup.
///
/// Getters return `Ok(None)` when the object does not exist; deletes treat a missing object as
/// already deleted.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClusterApi: Send + Sync {
    async fn get_backup(&self, namespace: &str, name: &str) -> Result<Option<Backup>, kube::Error>;

    /// Replace the status subresource. The resource version of `backup` is sent along, so a
    /// concurrent write results in a 409 conflict.
    async fn replace_backup_status(&self, backup: &Backup) -> Result<Backup, kube::Error>;

    async fn delete_backup(&self, namespace: &str, name: &str) -> Result<(), kube::Error>;

    /// Fetch a Database or Storage object (or any object in a compatible collection) as raw JSON.
    async fn get_reference(
        &self, target: &ReferenceTarget, namespace: &str, name: &str,
    ) -> Result<Option<serde_json::Value>, kube::Error>;

    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>, kube::Error>;
    async fn create_secret(&self, namespace: &str, secret: &Secret) -> Result<Secret, kube::Error>;
    async fn replace_secret(&self, namespace: &str, secret: &Secret)
        -> Result<Secret, kube::Error>;
    async fn delete_secret(&self, namespace: &str, name: &str) -> Result<(), kube::Error>;

    async fn get_pvc(
        &self, namespace: &str, name: &str,
    ) -> Result<Option<PersistentVolumeClaim>, kube::Error>;
    async fn create_pvc(
        &self, namespace: &str, pvc: &PersistentVolumeClaim,
    ) -> Result<PersistentVolumeClaim, kube::Error>;

    async fn get_job(&self, namespace: &str, name: &str) -> Result<Option<Job>, kube::Error>;
    async fn list_jobs(&self, namespace: &str, label_selector: &str)
        -> Result<Vec<Job>, kube::Error>;
    async fn create_job(&self, namespace: &str, job: &Job) -> Result<Job, kube::Error>;
    async fn delete_job(&self, namespace: &str, name: &str) -> Result<(), kube::Error>;

    async fn get_cron_job(
        &self, namespace: &str, name: &str,
    ) -> Result<Option<CronJob>, kube::Error>;
    async fn create_cron_job(
        &self, namespace: &str, cron_job: &CronJob,
    ) -> Result<CronJob, kube::Error>;
    async fn replace_cron_job(
        &self, namespace: &str, cron_job: &CronJob,
    ) -> Result<CronJob, kube::Error>;

    /// Last `tail_lines` lines of `container` in the newest pod of a Job, `None` if the Job has no
    /// pods.
    async fn job_logs(
        &self, namespace: &str, job_name: &str, container: &str, tail_lines: i64,
    ) -> Result<Option<String>, kube::Error>;

    async fn publish_event(
        &self, backup: &Backup, type_: EventType, reason: &str, action: &str, note: Option<String>,
    ) -> Result<(), kube::Error>;
}

/// [`ClusterApi`] backed by a live cluster.
#[derive(Clone)]
pub struct KubeClusterApi {
    client: Client,
    reporter: Reporter,
}

impl KubeClusterApi {
    pub fn new(client: Client) -> Self {
        Self { client, reporter: format!("{OPERATOR}-controller").into() }
    }

    pub fn client(&self) -> Client {
        self.client.clone()
    }
}

fn ignore_not_found(result: Result<(), kube::Error>) -> Result<(), kube::Error> {
    match result {
        Err(err) if is_not_found(&err) => Ok(()),
        other => other,
    }
}

#[async_trait]
impl ClusterApi for KubeClusterApi {
    async fn get_backup(&self, namespace: &str, name: &str) -> Result<Option<Backup>, kube::Error> {
        Api::<Backup>::namespaced(self.client(), namespace).get_opt(name).await
    }

    async fn replace_backup_status(&self, backup: &Backup) -> Result<Backup, kube::Error> {
        let namespace = backup.namespace().unwrap_or_default();
        let data = serde_json::to_vec(backup).map_err(kube::Error::SerdeError)?;
        Api::<Backup>::namespaced(self.client(), &namespace)
            .replace_status(&backup.name_any(), &PostParams::default(), data)
            .await
    }

    async fn delete_backup(&self, namespace: &str, name: &str) -> Result<(), kube::Error> {
        let result = Api::<Backup>::namespaced(self.client(), namespace)
            .delete(name, &DeleteParams::default())
            .await
            .map(|_| ());
        ignore_not_found(result)
    }

    async fn get_reference(
        &self, target: &ReferenceTarget, namespace: &str, name: &str,
    ) -> Result<Option<serde_json::Value>, kube::Error> {
        let gvk = GroupVersionKind::gvk(&target.group, &target.version, &target.kind);
        let ar = ApiResource::from_gvk_with_plural(&gvk, &target.plural);
        let object = Api::<DynamicObject>::namespaced_with(self.client(), namespace, &ar)
            .get_opt(name)
            .await?;
        Ok(object.map(|object| object.data))
    }

    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>, kube::Error> {
        Api::<Secret>::namespaced(self.client(), namespace).get_opt(name).await
    }

    async fn create_secret(&self, namespace: &str, secret: &Secret) -> Result<Secret, kube::Error> {
        Api::<Secret>::namespaced(self.client(), namespace)
            .create(&PostParams::default(), secret)
            .await
    }

    async fn replace_secret(
        &self, namespace: &str, secret: &Secret,
    ) -> Result<Secret, kube::Error> {
        Api::<Secret>::namespaced(self.client(), namespace)
            .replace(&secret.name_any(), &PostParams::default(), secret)
            .await
    }

    async fn delete_secret(&self, namespace: &str, name: &str) -> Result<(), kube::Error> {
        let result = Api::<Secret>::namespaced(self.client(), namespace)
            .delete(name, &DeleteParams::default())
            .await
            .map(|_| ());
        ignore_not_found(result)
    }

    async fn get_pvc(
        &self, namespace: &str, name: &str,
    ) -> Result<Option<PersistentVolumeClaim>, kube::Error> {
        Api::<PersistentVolumeClaim>::namespaced(self.client(), namespace).get_opt(name).await
    }

    async fn create_pvc(
        &self, namespace: &str, pvc: &PersistentVolumeClaim,
    ) -> Result<PersistentVolumeClaim, kube::Error> {
        Api::<PersistentVolumeClaim>::namespaced(self.client(), namespace)
            .create(&PostParams::default(), pvc)
            .await
    }

    async fn get_job(&self, namespace: &str, name: &str) -> Result<Option<Job>, kube::Error> {
        Api::<Job>::namespaced(self.client(), namespace).get_opt(name).await
    }

    async fn list_jobs(
        &self, namespace: &str, label_selector: &str,
    ) -> Result<Vec<Job>, kube::Error> {
        Ok(Api::<Job>::namespaced(self.client(), namespace)
            .list(&ListParams::default().labels(label_selector))
            .await?
            .items)
    }

    async fn create_job(&self, namespace: &str, job: &Job) -> Result<Job, kube::Error> {
        Api::<Job>::namespaced(self.client(), namespace).create(&PostParams::default(), job).await
    }

    async fn delete_job(&self, namespace: &str, name: &str) -> Result<(), kube::Error> {
        // Foreground so the pods go with the Job
        let result = Api::<Job>::namespaced(self.client(), namespace)
            .delete(
                name,
                &DeleteParams {
                    propagation_policy: Some(PropagationPolicy::Foreground),
                    ..Default::default()
                },
            )
            .await
            .map(|_| ());
        ignore_not_found(result)
    }

    async fn get_cron_job(
        &self, namespace: &str, name: &str,
    ) -> Result<Option<CronJob>, kube::Error> {
        Api::<CronJob>::namespaced(self.client(), namespace).get_opt(name).await
    }

    async fn create_cron_job(
        &self, namespace: &str, cron_job: &CronJob,
    ) -> Result<CronJob, kube::Error> {
        Api::<CronJob>::namespaced(self.client(), namespace)
            .create(&PostParams::default(), cron_job)
            .await
    }

    async fn replace_cron_job(
        &self, namespace: &str, cron_job: &CronJob,
    ) -> Result<CronJob, kube::Error> {
        Api::<CronJob>::namespaced(self.client(), namespace)
            .replace(&cron_job.name_any(), &PostParams::default(), cron_job)
            .await
    }

    async fn job_logs(
        &self, namespace: &str, job_name: &str, container: &str, tail_lines: i64,
    ) -> Result<Option<String>, kube::Error> {
        let pods: Api<Pod> = Api::namespaced(self.client(), namespace);
        let mut matching_pods = pods
            .list(&ListParams::default().labels(&format!("job-name={job_name}")))
            .await?
            .items;
        matching_pods.sort_unstable_by_key(|x| Reverse(x.creation_timestamp()));

        let Some(pod) = matching_pods.first() else {
            return Ok(None);
        };

        let params = LogParams {
            container: Some(container.to_string()),
            tail_lines: Some(tail_lines),
            ..Default::default()
        };
        Ok(Some(pods.logs(&pod.name_any(), &params).await?))
    }

    async fn publish_event(
        &self, backup: &Backup, type_: EventType, reason: &str, action: &str, note: Option<String>,
    ) -> Result<(), kube::Error> {
        let recorder =
            Recorder::new(self.client(), self.reporter.clone(), backup.object_ref(&()));
        recorder
            .publish(Event {
                type_,
                reason: reason.to_string(),
                note,
                action: action.to_string(),
                secondary: None,
            })
            .await
    }
}
