use thiserror::Error;

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("missing credentials: {}", fields.join(", "))]
    MissingCredentials { fields: Vec<String> },

    #[error("authentication failed: {0}")]
    AuthFailed(String),

    #[error("HTTP error ({status}): {body}")]
    Http { status: u16, body: String },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("no rep match for {0:?}")]
    NoRepMatch(String),

    #[error("unsupported CRM type `{0}`")]
    UnsupportedType(String),

    #[error("invalid response: {0}")]
    InvalidResponse(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("invalid input: {0}")]
    Invalid(String),

    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl SyncError {
    /// Stable kebab-case name of the error category, used in log lines.
    pub fn kind(&self) -> &'static str {
        match self {
            SyncError::MissingCredentials { .. } => "missing-credentials",
            SyncError::AuthFailed(_) => "auth-failed",
            SyncError::Http { .. } => "http-error",
            SyncError::NotFound(_) => "not-found",
            SyncError::NoRepMatch(_) => "no-rep-match",
            SyncError::UnsupportedType(_) => "unsupported-type",
            SyncError::InvalidResponse(_) => "invalid-response",
            SyncError::Config(_) => "config-error",
            SyncError::Invalid(_) => "invalid-input",
            SyncError::Transport(_) => "transport-error",
            SyncError::Database(_) => "database-error",
            SyncError::Io(_) => "io-error",
        }
    }

    /// Maps a non-2xx response status onto the taxonomy.
    pub(crate) fn from_status(status: reqwest::StatusCode, body: String) -> Self {
        match status.as_u16() {
            401 | 403 => SyncError::AuthFailed(format!("{}: {}", status, body)),
            code => SyncError::Http { status: code, body },
        }
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_credentials_lists_every_field() {
        let err = SyncError::MissingCredentials {
            fields: vec!["activecampaign.api_key".into(), "dynamics.client_id".into()],
        };
        assert_eq!(
            err.to_string(),
            "missing credentials: activecampaign.api_key, dynamics.client_id"
        );
        assert_eq!(err.kind(), "missing-credentials");
    }

    #[test]
    fn unauthorized_status_is_auth_failure() {
        let err = SyncError::from_status(reqwest::StatusCode::UNAUTHORIZED, "nope".into());
        assert_eq!(err.kind(), "auth-failed");

        let err = SyncError::from_status(reqwest::StatusCode::BAD_GATEWAY, "upstream".into());
        assert!(matches!(err, SyncError::Http { status: 502, .. }));
        assert!(err.to_string().contains("upstream"));
    }
}
