//! Resolution of Database and Storage references into gobackup config maps.

use k8s_openapi::api::core::v1::Secret;
use serde::de::DeserializeOwned;
use snafu::ResultExt as _;
use tracing::{debug, warn};

use crate::{
    cluster::ClusterApi,
    crd::{
        ConfigMap, DatabaseKind, DatabaseRef, DatabaseSpec, ReferenceTarget, StorageRef,
        StorageSpec,
    },
    AppError, KubeSnafu, Result,
};

/// Config keys ending in this suffix hold `{name, key}` of a Secret instead of a literal value.
pub const SECRET_REF_SUFFIX: &str = "_ref";

/// Database config keys gobackup only reads for redis.
const REDIS_ONLY_FIELDS: &[&str] = &["mode", "rdb_path", "invoke_save"];

const REDIS_MODES: &[&str] = &["copy", "sync"];

/// Map a CRD style key to the key gobackup expects. Unknown keys are returned unchanged.
pub fn normalize_key(key: &str) -> &str {
    match key {
        "excludeTables" => "exclude_tables",
        "additionalOptions" => "additional_options",
        "accessKeyID" | "accessKeyId" => "access_key_id",
        "secretAccessKey" => "secret_access_key",
        "forcePathStyle" => "force_path_style",
        "storageClass" => "storage_class",
        "maxRetries" => "max_retries",
        "authDB" | "authDb" => "auth_db",
        "invokeSave" => "invoke_save",
        "rdbPath" => "rdb_path",
        "argsRedis" => "args_redis",
        "trustServerCertificate" => "trust_server_certificate",
        "privateKey" => "private_key",
        "accountID" | "accountId" => "account_id",
        "credentialsFile" => "credentials_file",
        "tenantID" | "tenantId" => "tenant_id",
        "clientID" | "clientId" => "client_id",
        "clientSecret" => "client_secret",
        other => other,
    }
}

/// Check the redis `mode` value and keep redis-only keys out of other database types. Every
/// other key is passed through to gobackup unchecked.
///
/// Runs on the raw config, before any secret is resolved.
pub fn validate_database_config(kind: &DatabaseKind, config: &ConfigMap) -> Result<(), String> {
    if *kind == DatabaseKind::Redis {
        if let Some(mode) = config.get("mode") {
            let Some(mode) = mode.as_str() else {
                return Err("redis 'mode' must be a string".to_string());
            };
            if !REDIS_MODES.contains(&mode) {
                return Err(format!("redis 'mode' must be 'copy' or 'sync', got '{mode}'"));
            }
        }
    }

    if *kind != DatabaseKind::Redis {
        for raw_key in config.keys() {
            let key = normalize_key(raw_key.strip_suffix(SECRET_REF_SUFFIX).unwrap_or(raw_key));
            if REDIS_ONLY_FIELDS.contains(&key) {
                return Err(format!(
                    "field '{raw_key}' is only valid for redis databases, not for '{kind}'"
                ));
            }
        }
    }

    Ok(())
}

async fn fetch_spec<T: DeserializeOwned>(
    cluster: &dyn ClusterApi, target: &ReferenceTarget, namespace: &str, name: &str,
) -> Result<T> {
    let object = cluster.get_reference(target, namespace, name).await.with_context(|_| {
        KubeSnafu { msg: format!("Failed to fetch {} {namespace}/{name}", target.kind) }
    })?;

    let Some(mut object) = object else {
        return Err(AppError::Reference {
            message: format!("{} {namespace}/{name} not found in {target}", target.kind),
        });
    };

    let spec = object.get_mut("spec").map(serde_json::Value::take).unwrap_or_default();
    serde_json::from_value(spec).map_err(|err| AppError::Reference {
        message: format!("{} {namespace}/{name} has a malformed spec: {err}", target.kind),
    })
}

pub async fn fetch_database(
    cluster: &dyn ClusterApi, namespace: &str, reference: &DatabaseRef,
) -> Result<DatabaseSpec> {
    let spec: DatabaseSpec =
        fetch_spec(cluster, &reference.target(), namespace, &reference.name).await?;
    check_declared_type(reference.type_.as_deref(), &spec.type_, &reference.name);
    Ok(spec)
}

pub async fn fetch_storage(
    cluster: &dyn ClusterApi, namespace: &str, reference: &StorageRef,
) -> Result<StorageSpec> {
    let spec: StorageSpec =
        fetch_spec(cluster, &reference.target(), namespace, &reference.name).await?;
    check_declared_type(reference.type_.as_deref(), &spec.type_, &reference.name);
    Ok(spec)
}

fn check_declared_type(declared: Option<&str>, actual: &str, name: &str) {
    match declared {
        Some(declared) if !declared.is_empty() && !declared.eq_ignore_ascii_case(actual) => {
            warn!(name, declared, actual, "Reference type does not match referenced resource");
        }
        _ => {}
    }
}

/// Resolve `*_ref` keys against Secrets in `namespace` and normalize every key.
///
/// Literal values are copied first so a resolved secret wins over a literal of the same name.
pub async fn resolve_config(
    cluster: &dyn ClusterApi, namespace: &str, owner: &str, config: &ConfigMap,
) -> Result<ConfigMap> {
    let mut resolved = ConfigMap::new();

    for (key, value) in config.iter().filter(|(key, _)| !key.ends_with(SECRET_REF_SUFFIX)) {
        resolved.insert(normalize_key(key).to_string(), value.clone());
    }

    for (key, value) in config {
        let Some(field) = key.strip_suffix(SECRET_REF_SUFFIX) else {
            continue;
        };
        let (secret_name, secret_key) = parse_secret_ref(owner, key, value)?;
        debug!(owner, field, secret = secret_name, "Resolving secret reference");
        let secret = cluster.get_secret(namespace, secret_name).await.with_context(|_| {
            KubeSnafu { msg: format!("Failed to fetch secret {namespace}/{secret_name}") }
        })?;
        let Some(secret) = secret else {
            return Err(AppError::Reference {
                message: format!(
                    "secret {namespace}/{secret_name} referenced by {owner}.{key} not found"
                ),
            });
        };
        let value = secret_value(&secret, secret_key).ok_or_else(|| AppError::Reference {
            message: format!(
                "key '{secret_key}' not found in secret {namespace}/{secret_name} referenced by \
                 {owner}.{key}"
            ),
        })??;
        resolved.insert(normalize_key(field).to_string(), serde_json::Value::String(value));
    }

    Ok(resolved)
}

fn parse_secret_ref<'a>(
    owner: &str, key: &str, value: &'a serde_json::Value,
) -> Result<(&'a str, &'a str)> {
    let field = |names: &[&str]| {
        names.iter().find_map(|name| value.get(*name).and_then(serde_json::Value::as_str))
    };
    match (field(&["name", "secretName"]), field(&["key", "secretKey"])) {
        (Some(name), Some(key)) if !name.is_empty() && !key.is_empty() => Ok((name, key)),
        _ => Err(AppError::Reference {
            message: format!("{owner}.{key} must be an object with secret 'name' and 'key'"),
        }),
    }
}

/// Read a key from `data`, falling back to `stringData`.
fn secret_value(secret: &Secret, key: &str) -> Option<Result<String>> {
    if let Some(bytes) = secret.data.as_ref().and_then(|data| data.get(key)) {
        return Some(String::from_utf8(bytes.0.clone()).map_err(|_| AppError::Reference {
            message: format!(
                "key '{key}' of secret {} is not valid UTF-8",
                secret.metadata.name.as_deref().unwrap_or_default()
            ),
        }));
    }
    secret.string_data.as_ref().and_then(|data| data.get(key)).cloned().map(Ok)
}
