use camino::Utf8PathBuf;
use miette::Diagnostic;
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum PipelineError {
    #[error("invalid observation id: {0}")]
    InvalidObservationId(String),

    #[error("invalid life stage: {0} (expected Egg, Larva, Pupa, Adult or Unknown)")]
    InvalidLifeStage(String),

    #[error("invalid auth scheme: {0} (expected Token or Bearer)")]
    InvalidAuthScheme(String),

    #[error("missing required setting {0}")]
    #[diagnostic(help("set it in the environment or in a .env file"))]
    MissingConfig(&'static str),

    #[error("invalid value for {key}: {value}")]
    InvalidConfig { key: &'static str, value: String },

    #[error("catalog request failed: {0}")]
    TransientFetch(String),

    #[error("catalog returned status {status}: {message}")]
    CatalogStatus { status: u16, message: String },

    #[error("catalog response could not be parsed: {0}")]
    MalformedResponse(String),

    #[error("image transfer failed for {url}: {message}")]
    Transfer { url: String, message: String },

    #[error("annotation service rejected the credential with both Token and Bearer schemes")]
    #[diagnostic(help("check LABEL_STUDIO_API_TOKEN"))]
    Auth,

    #[error("annotation service rejected the credential (status {status})")]
    AuthRejected { status: u16 },

    #[error("annotation service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("annotation service rejected the request with status {status}: {message}")]
    PayloadRejected { status: u16, message: String },

    #[error("annotation service response could not be parsed: {0}")]
    AnnotationResponse(String),

    #[error("observation {0} is already stored")]
    DuplicateObservation(i64),

    #[error("could not encode observation data: {0}")]
    Serialization(String),

    #[error("stored row could not be read: {0}")]
    CorruptRow(String),

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("failed to open database at {0}")]
    DatabaseOpen(Utf8PathBuf),

    #[error("filesystem error: {0}")]
    Filesystem(String),
}

impl PipelineError {
    /// Catalog failures that only cost the current attempt.
    pub fn is_transient_fetch(&self) -> bool {
        matches!(
            self,
            PipelineError::TransientFetch(_) | PipelineError::CatalogStatus { .. }
        )
    }

    pub fn is_auth(&self) -> bool {
        matches!(self, PipelineError::Auth | PipelineError::AuthRejected { .. })
    }

    pub fn class(&self) -> FailureClass {
        match self {
            PipelineError::MissingConfig(_) | PipelineError::InvalidConfig { .. } => {
                FailureClass::Config
            }
            PipelineError::TransientFetch(_)
            | PipelineError::CatalogStatus { .. }
            | PipelineError::Transfer { .. }
            | PipelineError::ServiceUnavailable(_) => FailureClass::Network,
            PipelineError::Auth | PipelineError::AuthRejected { .. } => FailureClass::Auth,
            _ => FailureClass::Other,
        }
    }
}

/// Coarse grouping of errors, carried in run reports and used for exit codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureClass {
    Config,
    Network,
    Auth,
    Other,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errors_grouped_by_class() {
        assert_eq!(PipelineError::Auth.class(), FailureClass::Auth);
        assert_eq!(
            PipelineError::AuthRejected { status: 403 }.class(),
            FailureClass::Auth
        );
        assert_eq!(
            PipelineError::MissingConfig("LABEL_STUDIO_API_TOKEN").class(),
            FailureClass::Config
        );
        assert_eq!(
            PipelineError::ServiceUnavailable("status 503".to_string()).class(),
            FailureClass::Network
        );
        assert_eq!(
            PipelineError::MalformedResponse("eof".to_string()).class(),
            FailureClass::Other
        );
    }
}
