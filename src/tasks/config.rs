//! Rendering of the gobackup configuration document and the Secret carrying it.

use k8s_openapi::{api::core::v1::Secret, ByteString};
use kube::{api::ObjectMeta, Resource as _, ResourceExt as _};
use serde_json::{json, Value};
use snafu::{OptionExt as _, ResultExt as _};
use tracing::{debug, info};

use crate::{
    cluster::ClusterApi,
    crd::{Backup, ConfigMap, DatabaseKind, StorageKind},
    AppError, KubeSnafu, MissingObjectKeySnafu, Result, YamlSnafu,
};

use super::{
    backup_labels,
    reference::{fetch_database, fetch_storage, resolve_config, validate_database_config},
    Applied,
};

/// Key of the configuration document inside the Secret.
pub const CONFIG_KEY: &str = "gobackup.yml";

/// Resolve every reference of `backup` and render the gobackup YAML document.
///
/// All databases are validated before any secret is read.
pub async fn build_config(cluster: &dyn ClusterApi, backup: &Backup) -> Result<String> {
    let namespace = backup.namespace().context(MissingObjectKeySnafu { field: "namespace" })?;

    let mut database_specs = Vec::with_capacity(backup.spec.database_refs.len());
    for reference in &backup.spec.database_refs {
        let spec = fetch_database(cluster, &namespace, reference).await?;
        let kind = DatabaseKind::from_type(&spec.type_);
        validate_database_config(&kind, &spec.config).map_err(|message| AppError::Validation {
            message: format!("database {}: {message}", reference.name),
        })?;
        database_specs.push((reference, kind, spec));
    }

    let mut databases = ConfigMap::new();
    for (reference, kind, spec) in database_specs {
        let mut config = resolve_config(cluster, &namespace, &reference.name, &spec.config).await?;
        config.insert("type".to_string(), Value::String(kind.as_str().to_string()));
        databases.insert(reference.name.clone(), Value::Object(config));
    }

    let mut storages = ConfigMap::new();
    for reference in &backup.spec.storage_refs {
        let spec = fetch_storage(cluster, &namespace, reference).await?;
        let kind = StorageKind::from_type(&spec.type_);
        let mut config = resolve_config(cluster, &namespace, &reference.name, &spec.config).await?;
        config.insert("type".to_string(), Value::String(kind.as_str().to_string()));
        if let Some(keep) = reference.keep.filter(|keep| *keep > 0) {
            config.insert("keep".to_string(), keep.into());
        }
        if let Some(timeout) = reference.timeout.filter(|timeout| *timeout > 0) {
            config.insert("timeout".to_string(), timeout.into());
        }
        storages.insert(reference.name.clone(), Value::Object(config));
    }

    let mut model = ConfigMap::new();
    model.insert("databases".to_string(), Value::Object(databases));
    model.insert("storages".to_string(), Value::Object(storages));
    if let Some(compress) = &backup.spec.compress_with {
        model.insert("compress_with".to_string(), json!({ "type": compress.type_ }));
    }
    if let Some(encode) = &backup.spec.encode_with {
        model.insert("encode_with".to_string(), json!({ "type": encode.type_ }));
    }
    for (key, script) in
        [("before_script", &backup.spec.before_script), ("after_script", &backup.spec.after_script)]
    {
        if let Some(script) = script.as_deref().filter(|script| !script.is_empty()) {
            model.insert(key.to_string(), Value::String(script.to_string()));
        }
    }

    let mut models = ConfigMap::new();
    models.insert(backup.name_any(), Value::Object(model));
    serde_yaml::to_string(&json!({ "models": models })).context(YamlSnafu)
}

/// Secret named after the Backup holding `config` under [`CONFIG_KEY`].
pub fn build_secret(backup: &Backup, config: String) -> Result<Secret> {
    let owner = backup.controller_owner_ref(&()).context(MissingObjectKeySnafu { field: "uid" })?;
    Ok(Secret {
        metadata: ObjectMeta {
            name: Some(backup.name_any()),
            namespace: backup.namespace(),
            labels: Some(backup_labels(&backup.name_any())),
            owner_references: Some(vec![owner]),
            ..Default::default()
        },
        type_: Some("Opaque".to_string()),
        data: Some(maplit::btreemap! { CONFIG_KEY.to_string() => ByteString(config.into_bytes()) }),
        ..Default::default()
    })
}

/// Create the Secret, or replace its payload when it differs from `desired`.
pub async fn apply_secret(cluster: &dyn ClusterApi, desired: Secret) -> Result<Applied> {
    let namespace = desired.namespace().context(MissingObjectKeySnafu { field: "namespace" })?;
    let name = desired.name_any();

    let existing = cluster.get_secret(&namespace, &name).await.with_context(|_| KubeSnafu {
        msg: format!("Failed to fetch config secret {namespace}/{name}"),
    })?;

    let Some(mut existing) = existing else {
        cluster.create_secret(&namespace, &desired).await.with_context(|_| KubeSnafu {
            msg: format!("Failed to create config secret {namespace}/{name}"),
        })?;
        info!(namespace, name, "Created config secret");
        return Ok(Applied::Created);
    };

    if existing.data == desired.data && existing.string_data.is_none() {
        debug!(namespace, name, "Config secret is up to date");
        return Ok(Applied::Unchanged);
    }

    // Keep the fetched metadata so the replace carries its resource version
    existing.data = desired.data;
    existing.string_data = None;
    cluster.replace_secret(&namespace, &existing).await.with_context(|_| KubeSnafu {
        msg: format!("Failed to update config secret {namespace}/{name}"),
    })?;
    info!(namespace, name, "Updated config secret");
    Ok(Applied::Updated)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{cluster::MockClusterApi, tasks::fixtures::backup};

    fn stub_references(cluster: &mut MockClusterApi) {
        cluster.expect_get_reference().returning(|target, _, name| {
            Ok(match (target.plural.as_str(), name) {
                ("databases", "pg") => Some(json!({
                    "spec": {
                        "type": "postgresql",
                        "config": {
                            "host": "pg.prod.svc",
                            "username": "postgres",
                            "excludeTables": ["audit"],
                            "password_ref": { "name": "pg-creds", "key": "password" },
                        },
                    },
                })),
                ("storages", "s3") => Some(json!({
                    "spec": {
                        "type": "s3",
                        "config": {
                            "bucket": "backups",
                            "accessKeyID_ref": { "name": "s3-creds", "key": "id" },
                        },
                    },
                })),
                _ => None,
            })
        });
        cluster.expect_get_secret().returning(|_, name| {
            Ok(Some(Secret {
                string_data: Some(maplit::btreemap! {
                    "password".to_string() => format!("{name}-password"),
                    "id".to_string() => format!("{name}-id"),
                }),
                ..Default::default()
            }))
        });
    }

    #[tokio::test]
    async fn renders_profile_named_after_backup() {
        let mut cluster = MockClusterApi::new();
        stub_references(&mut cluster);
        let backup = backup(
            "nightly",
            json!({
                "databaseRefs": [{ "name": "pg" }],
                "storageRefs": [{ "name": "s3", "keep": 7, "timeout": 0 }],
                "compressWith": { "type": "tgz" },
                "beforeScript": "echo start",
                "afterScript": "",
            }),
        );

        let yaml = build_config(&cluster, &backup).await.unwrap();
        let document: serde_yaml::Value = serde_yaml::from_str(&yaml).unwrap();
        let model = &document["models"]["nightly"];

        assert_eq!(model["databases"]["pg"]["type"], "postgresql");
        assert_eq!(model["databases"]["pg"]["password"], "pg-creds-password");
        assert_eq!(model["databases"]["pg"]["exclude_tables"][0], "audit");
        assert_eq!(model["storages"]["s3"]["type"], "s3");
        assert_eq!(model["storages"]["s3"]["access_key_id"], "s3-creds-id");
        assert_eq!(model["storages"]["s3"]["keep"], 7);
        assert!(model["storages"]["s3"].get("timeout").is_none());
        assert_eq!(model["compress_with"]["type"], "tgz");
        assert_eq!(model["before_script"], "echo start");
        assert!(model.get("after_script").is_none());
        assert!(model.get("encode_with").is_none());
    }

    #[tokio::test]
    async fn invalid_database_config_is_rejected_before_secrets_are_read() {
        let mut cluster = MockClusterApi::new();
        cluster.expect_get_reference().returning(|_, _, _| {
            Ok(Some(json!({
                "spec": { "type": "postgresql", "config": { "rdb_path": "/dump.rdb" } },
            })))
        });
        let backup = backup(
            "nightly",
            json!({ "databaseRefs": [{ "name": "pg" }], "storageRefs": [{ "name": "s3" }] }),
        );

        let err = build_config(&cluster, &backup).await.unwrap_err();
        match err {
            AppError::Validation { message } => {
                assert!(message.contains("rdb_path"), "{message}");
                assert!(message.contains("postgresql"), "{message}");
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn secret_is_owned_and_labelled() {
        let backup = backup("nightly", json!({}));
        let secret = build_secret(&backup, "models: {}\n".to_string()).unwrap();

        assert_eq!(secret.name_any(), "nightly");
        assert_eq!(secret.namespace().as_deref(), Some("prod"));
        assert_eq!(secret.labels()["gobackup.io/backup"], "nightly");
        let owner = &secret.owner_references()[0];
        assert_eq!(owner.kind, "Backup");
        assert_eq!(owner.controller, Some(true));
        assert_eq!(secret.data.unwrap()[CONFIG_KEY].0, b"models: {}\n");
    }

    #[tokio::test]
    async fn identical_secret_is_left_alone() {
        let backup = backup("nightly", json!({}));
        let desired = build_secret(&backup, "models: {}\n".to_string()).unwrap();
        let existing = desired.clone();

        let mut cluster = MockClusterApi::new();
        cluster.expect_get_secret().return_once(move |_, _| Ok(Some(existing)));

        assert_eq!(apply_secret(&cluster, desired).await.unwrap(), Applied::Unchanged);
    }

    #[tokio::test]
    async fn changed_secret_is_replaced_in_place() {
        let backup = backup("nightly", json!({}));
        let mut existing = build_secret(&backup, "models: {}\n".to_string()).unwrap();
        existing.metadata.resource_version = Some("41".to_string());
        let desired = build_secret(&backup, "models: { nightly: {} }\n".to_string()).unwrap();

        let mut cluster = MockClusterApi::new();
        cluster.expect_get_secret().return_once(move |_, _| Ok(Some(existing)));
        cluster
            .expect_replace_secret()
            .withf(|_, secret| {
                secret.metadata.resource_version.as_deref() == Some("41")
                    && secret.data.as_ref().unwrap()[CONFIG_KEY].0 == b"models: { nightly: {} }\n"
            })
            .times(1)
            .returning(|_, secret| Ok(secret.clone()));

        assert_eq!(apply_secret(&cluster, desired).await.unwrap(), Applied::Updated);
    }

    #[tokio::test]
    async fn missing_secret_is_created() {
        let backup = backup("nightly", json!({}));
        let desired = build_secret(&backup, "models: {}\n".to_string()).unwrap();

        let mut cluster = MockClusterApi::new();
        cluster.expect_get_secret().returning(|_, _| Ok(None));
        cluster.expect_create_secret().times(1).returning(|_, secret| Ok(secret.clone()));

        assert_eq!(apply_secret(&cluster, desired).await.unwrap(), Applied::Created);
    }
}
