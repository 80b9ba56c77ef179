use thiserror::Error;

/// Application level error type used throughout the crate.
#[derive(Error, Debug)]
pub enum SimError {
    /// I/O related failure
    #[error("Io error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid or inconsistent configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// Error while parsing YAML configuration files
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Error while encoding a payload or decoding a twin document
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Broker connection, subscribe or publish failure
    #[error("Transport error: {0}")]
    Transport(String),

    /// A request/response exchange with the broker did not complete in time
    #[error("Timed out waiting for {0}")]
    Timeout(String),
}

/// Convenient alias over [`Result`] using [`SimError`]
pub type Result<T> = std::result::Result<T, SimError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_name_the_failure() {
        assert_eq!(
            SimError::Timeout("twin response".into()).to_string(),
            "Timed out waiting for twin response"
        );
        assert_eq!(
            SimError::Config("send_interval_secs must be positive".into()).to_string(),
            "Configuration error: send_interval_secs must be positive"
        );

        let err: SimError = serde_json::from_str::<serde_json::Value>("{").unwrap_err().into();
        assert!(matches!(err, SimError::Json(_)));
    }
}
