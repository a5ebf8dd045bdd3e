use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::{preserve_unknown_fields, ConfigMap};

#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, PartialEq, JsonSchema)]
#[kube(kind = "Storage", group = "gobackup.io", version = "v1", namespaced)]
#[kube(shortname = "storage")]
#[kube(printcolumn = r#"{"name":"Type", "type":"string", "jsonPath":".spec.type"}"#)]
pub struct StorageSpec {
    /// gobackup storage backend, e.g. s3, gcs, azure, sftp or local.
    #[serde(rename = "type")]
    pub type_: String,

    /// gobackup storage options. Any key ending in `_ref` is read from a Secret instead:
    /// `{ name: <secret>, key: <key> }`.
    #[serde(default)]
    #[schemars(schema_with = "preserve_unknown_fields")]
    pub config: ConfigMap,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StorageKind {
    Local,
    Ftp,
    Sftp,
    Scp,
    Webdav,
    S3,
    Oss,
    Gcs,
    Azure,
    R2,
    Spaces,
    B2,
    Cos,
    Us3,
    Kodo,
    Bos,
    Minio,
    Obs,
    Tos,
    Upyun,
    Other(String),
}

impl StorageKind {
    pub fn from_type(type_: &str) -> Self {
        match type_.to_ascii_lowercase().as_str() {
            "local" => Self::Local,
            "ftp" => Self::Ftp,
            "sftp" => Self::Sftp,
            "scp" => Self::Scp,
            "webdav" => Self::Webdav,
            "s3" => Self::S3,
            "oss" => Self::Oss,
            "gcs" => Self::Gcs,
            "azure" => Self::Azure,
            "r2" => Self::R2,
            "spaces" => Self::Spaces,
            "b2" => Self::B2,
            "cos" => Self::Cos,
            "us3" => Self::Us3,
            "kodo" => Self::Kodo,
            "bos" => Self::Bos,
            "minio" => Self::Minio,
            "obs" => Self::Obs,
            "tos" => Self::Tos,
            "upyun" => Self::Upyun,
            _ => Self::Other(type_.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Local => "local",
            Self::Ftp => "ftp",
            Self::Sftp => "sftp",
            Self::Scp => "scp",
            Self::Webdav => "webdav",
            Self::S3 => "s3",
            Self::Oss => "oss",
            Self::Gcs => "gcs",
            Self::Azure => "azure",
            Self::R2 => "r2",
            Self::Spaces => "spaces",
            Self::B2 => "b2",
            Self::Cos => "cos",
            Self::Us3 => "us3",
            Self::Kodo => "kodo",
            Self::Bos => "bos",
            Self::Minio => "minio",
            Self::Obs => "obs",
            Self::Tos => "tos",
            Self::Upyun => "upyun",
            Self::Other(other) => other,
        }
    }
}

impl std::fmt::Display for StorageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
