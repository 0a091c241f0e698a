/// Central error type for the Vellum pipeline
#[derive(Debug, thiserror::Error)]
pub enum VellumError {
    #[error("Audio device unavailable: {0}")]
    DeviceUnavailable(String),

    #[error("Recorder error: {0}")]
    Recorder(String),

    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("Push stream error: {0}")]
    Push(String),

    #[error("Playback error: {0}")]
    Playback(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Logging initialization error: {0}")]
    Logging(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Generic error: {0}")]
    Generic(String),
}

impl From<&str> for VellumError {
    fn from(s: &str) -> Self {
        VellumError::Generic(s.to_string())
    }
}

impl From<String> for VellumError {
    fn from(s: String) -> Self {
        VellumError::Generic(s)
    }
}

impl VellumError {
    /// True for errors that recover locally (retry/reconnect) and should not
    /// be surfaced to the session consumer.
    pub fn is_transient(&self) -> bool {
        matches!(self, VellumError::Http(_) | VellumError::Push(_))
    }
}

/// Result type alias for Vellum operations
pub type VellumResult<T> = Result<T, VellumError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_conversions() {
        let error_from_str: VellumError = "test error".into();
        assert!(matches!(error_from_str, VellumError::Generic(_)));

        let error_from_string: VellumError = "test error".to_string().into();
        assert!(matches!(error_from_string, VellumError::Generic(_)));

        let error = VellumError::DeviceUnavailable("no default input".to_string());
        assert_eq!(
            error.to_string(),
            "Audio device unavailable: no default input"
        );

        let error = VellumError::Api {
            status: 503,
            message: "upstream busy".to_string(),
        };
        assert!(error.to_string().contains("503"));
    }

    #[test]
    fn test_error_chain() {
        let io_error = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let vellum_error: VellumError = io_error.into();

        assert!(matches!(vellum_error, VellumError::Io(_)));
        assert!(vellum_error.to_string().contains("IO error"));
    }

    #[test]
    fn test_transient_classification() {
        assert!(VellumError::Push("channel closed".to_string()).is_transient());
        assert!(!VellumError::DeviceUnavailable("denied".to_string()).is_transient());
        assert!(!VellumError::Timeout("task took too long".to_string()).is_transient());
    }

    #[test]
    fn test_result_type_alias() {
        fn ok_fn() -> VellumResult<String> {
            Ok("success".to_string())
        }

        fn err_fn() -> VellumResult<String> {
            Err(VellumError::Config("missing base url".to_string()))
        }

        assert!(ok_fn().is_ok());
        assert!(matches!(err_fn(), Err(VellumError::Config(_))));
    }
}
