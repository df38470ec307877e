use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("Invalid job request: {0}")]
    InvalidJob(String),

    #[error("Unknown model '{0}'")]
    UnknownModel(String),

    #[error("Cannot read template file {path}: {source}")]
    TemplateIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Malformed template file {path}: {reason}")]
    TemplateFormat { path: PathBuf, reason: String },
}

impl CoreError {
    /// Whether this error points at operator-owned configuration (template
    /// or mapping files) rather than a transient fault.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Self::UnknownModel(_) | Self::TemplateIo { .. } | Self::TemplateFormat { .. }
        )
    }
}
