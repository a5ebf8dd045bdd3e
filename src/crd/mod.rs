pub mod backup;
pub mod database;
pub mod storage;

pub use backup::*;
pub use database::*;
pub use storage::*;

use k8s_openapi::List;
use kube::CustomResourceExt as _;
use schemars::{
    gen::SchemaGenerator,
    schema::{InstanceType, Schema, SchemaObject},
    JsonSchema,
};
use serde::{Deserialize, Serialize};

pub const API_GROUP: &str = "gobackup.io";
pub const API_VERSION: &str = "v1";

/// Opaque gobackup options carried by Database and Storage resources.
pub type ConfigMap = serde_json::Map<String, serde_json::Value>;

pub fn generate_crds() -> Result<String, serde_yaml::Error> {
    serde_yaml::to_string(&List {
        items: vec![Backup::crd(), Database::crd(), Storage::crd()],
        ..Default::default()
    })
}

pub(crate) fn preserve_unknown_fields(_: &mut SchemaGenerator) -> Schema {
    Schema::Object(SchemaObject {
        instance_type: Some(InstanceType::Object.into()),
        extensions: [(
            "x-kubernetes-preserve-unknown-fields".to_string(),
            serde_json::Value::Bool(true),
        )]
        .into_iter()
        .collect(),
        ..Default::default()
    })
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DatabaseRef {
    /// Defaults to gobackup.io.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_group: Option<String>,

    /// Expected `spec.type` of the referenced Database, e.g. postgresql.
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub type_: Option<String>,

    pub name: String,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct StorageRef {
    /// Defaults to gobackup.io.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_group: Option<String>,

    /// Expected `spec.type` of the referenced Storage, e.g. s3.
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub type_: Option<String>,

    pub name: String,

    /// Overrides `keep` of the referenced Storage.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keep: Option<i64>,

    /// Overrides `timeout` (seconds) of the referenced Storage.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<i64>,
}

/// A generic collection a reference is resolved against.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReferenceTarget {
    pub group: String,
    pub version: String,
    pub kind: String,
    pub plural: String,
}

impl ReferenceTarget {
    fn new(api_group: Option<&str>, kind: &str, plural: &str) -> Self {
        let group = match api_group {
            Some(group) if !group.is_empty() => group,
            _ => API_GROUP,
        };
        Self {
            group: group.to_string(),
            version: API_VERSION.to_string(),
            kind: kind.to_string(),
            plural: plural.to_string(),
        }
    }
}

impl DatabaseRef {
    pub fn target(&self) -> ReferenceTarget {
        ReferenceTarget::new(self.api_group.as_deref(), "Database", "databases")
    }
}

impl StorageRef {
    pub fn target(&self) -> ReferenceTarget {
        ReferenceTarget::new(self.api_group.as_deref(), "Storage", "storages")
    }
}

impl std::fmt::Display for ReferenceTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}/{}", self.plural, self.group, self.version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn references_default_to_own_group() {
        let db = DatabaseRef { name: "pg".into(), ..Default::default() };
        assert_eq!(db.target().group, API_GROUP);
        assert_eq!(db.target().plural, "databases");

        let storage = StorageRef {
            api_group: Some("example.com".into()),
            name: "s3".into(),
            ..Default::default()
        };
        assert_eq!(storage.target().group, "example.com");
        assert_eq!(storage.target().to_string(), "storages.example.com/v1");
    }

    #[test]
    fn empty_group_is_defaulted() {
        let db = DatabaseRef { api_group: Some(String::new()), name: "pg".into(), type_: None };
        assert_eq!(db.target().group, API_GROUP);
    }

    #[test]
    fn crds_render() {
        let yaml = generate_crds().unwrap();
        assert!(yaml.contains("backups.gobackup.io"));
        assert!(yaml.contains("databases.gobackup.io"));
        assert!(yaml.contains("storages.gobackup.io"));
        assert!(yaml.contains("x-kubernetes-preserve-unknown-fields"));
    }
}
