#[derive(snafu::Snafu, Debug)]
#[snafu(visibility(pub(crate)))]
pub enum AppError {
    /// The Backup spec can never succeed as written. Not retried until the spec changes.
    #[snafu(display("Invalid Backup spec: {message}"))]
    Validation { message: String },

    /// A referenced Database, Storage, Secret or Secret key is missing or malformed. It may appear
    /// later, so this is retried.
    #[snafu(display("Unresolved reference: {message}"))]
    Reference { message: String },

    #[snafu(display("SerializationError: {source}"))]
    SerializationError { source: serde_json::Error },

    #[snafu(display("Unable to render gobackup config: {source}"))]
    YamlError { source: serde_yaml::Error },

    #[snafu(display("Kube Error: {msg}: {source}"))]
    KubeError { msg: String, source: kube::Error },

    #[snafu(display("Object is missing {field}"))]
    MissingObjectKey { field: &'static str },
}

impl AppError {
    pub fn metric_label(&self) -> String {
        match self {
            AppError::Validation { .. } => "validation",
            AppError::Reference { .. } => "reference",
            AppError::SerializationError { .. } => "serialization",
            AppError::YamlError { .. } => "yaml",
            AppError::KubeError { .. } => "kube",
            AppError::MissingObjectKey { .. } => "missing_object_key",
        }
        .to_string()
    }

    /// Terminal errors must not be requeued; only a spec change can fix them.
    pub fn is_terminal(&self) -> bool {
        matches!(self, AppError::Validation { .. })
    }
}

pub type Result<T, E = AppError> = std::result::Result<T, E>;

/// Status code carried by an API error, if any.
pub(crate) fn api_code(err: &kube::Error) -> Option<u16> {
    match err {
        kube::Error::Api(response) => Some(response.code),
        _ => None,
    }
}

pub(crate) fn is_not_found(err: &kube::Error) -> bool {
    api_code(err) == Some(404)
}

pub(crate) fn is_conflict(err: &kube::Error) -> bool {
    api_code(err) == Some(409)
}
