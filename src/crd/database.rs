use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::{preserve_unknown_fields, ConfigMap};

#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, PartialEq, JsonSchema)]
#[kube(kind = "Database", group = "gobackup.io", version = "v1", namespaced)]
#[kube(shortname = "db")]
#[kube(printcolumn = r#"{"name":"Type", "type":"string", "jsonPath":".spec.type"}"#)]
pub struct DatabaseSpec {
    /// One of postgresql, mysql, mariadb, mongodb, redis, mssql, influxdb, etcd.
    #[serde(rename = "type")]
    pub type_: String,

    /// gobackup database options. Any key ending in `_ref` is read from a Secret instead:
    /// `{ name: <secret>, key: <key> }`.
    #[serde(default)]
    #[schemars(schema_with = "preserve_unknown_fields")]
    pub config: ConfigMap,
}

/// Database backends gobackup knows how to dump.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DatabaseKind {
    Postgresql,
    Mysql,
    Mariadb,
    Mongodb,
    Redis,
    Mssql,
    Influxdb,
    Etcd,
    Other(String),
}

impl DatabaseKind {
    pub fn from_type(type_: &str) -> Self {
        match type_.to_ascii_lowercase().as_str() {
            "postgresql" => Self::Postgresql,
            "mysql" => Self::Mysql,
            "mariadb" => Self::Mariadb,
            "mongodb" => Self::Mongodb,
            "redis" => Self::Redis,
            "mssql" => Self::Mssql,
            "influxdb" => Self::Influxdb,
            "etcd" => Self::Etcd,
            _ => Self::Other(type_.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Postgresql => "postgresql",
            Self::Mysql => "mysql",
            Self::Mariadb => "mariadb",
            Self::Mongodb => "mongodb",
            Self::Redis => "redis",
            Self::Mssql => "mssql",
            Self::Influxdb => "influxdb",
            Self::Etcd => "etcd",
            Self::Other(other) => other,
        }
    }
}

impl std::fmt::Display for DatabaseKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_types_parse_case_insensitively() {
        assert_eq!(DatabaseKind::from_type("PostgreSQL"), DatabaseKind::Postgresql);
        assert_eq!(DatabaseKind::from_type("redis"), DatabaseKind::Redis);
        assert_eq!(DatabaseKind::from_type("MSSQL").as_str(), "mssql");
    }

    #[test]
    fn unknown_types_are_kept_verbatim() {
        let kind = DatabaseKind::from_type("sqlite");
        assert_eq!(kind, DatabaseKind::Other("sqlite".to_string()));
        assert_eq!(kind.to_string(), "sqlite");
    }
}
