use thiserror::Error;

/// Unified error type for the transport/session/config layers.
///
/// Plugin bodies never see this type cross their boundary (§7): plugin
/// errors are logged and the offending frame is dropped, they are not
/// propagated as a `CoreError`.
#[derive(Error, Debug)]
pub enum CoreError {
    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),

    #[error("frame of {actual} bytes exceeds the {limit}-byte limit for this role")]
    FrameTooLarge { limit: usize, actual: usize },

    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    #[error("database error: {0}")]
    Database(String),

    #[error("internal: {0}")]
    Internal(String),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("cannot read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: ini::Error,
    },

    #[error("missing required key [{section}] {key}")]
    MissingKey { section: String, key: String },

    #[error("invalid value for [{section}] {key}: {reason}")]
    InvalidValue {
        section: String,
        key: String,
        reason: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_too_large_message_carries_both_sizes() {
        let err = CoreError::FrameTooLarge {
            limit: 10240,
            actual: 20000,
        };
        let text = err.to_string();
        assert!(text.contains("10240"));
        assert!(text.contains("20000"));
    }

    #[test]
    fn protocol_violation_carries_reason() {
        let err = CoreError::ProtocolViolation("unknown login scheme".into());
        assert_eq!(
            err.to_string(),
            "protocol violation: unknown login scheme"
        );
    }

    #[test]
    fn missing_key_message_names_section_and_key() {
        let err = ConfigError::MissingKey {
            section: "main".into(),
            key: "db".into(),
        };
        assert_eq!(err.to_string(), "missing required key [main] db");
    }
}
