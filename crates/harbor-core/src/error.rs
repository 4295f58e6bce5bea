//! Error types for Harbor core services

use thiserror::Error;

/// Result type alias using Harbor's core Error
pub type Result<T> = std::result::Result<T, Error>;

/// Harbor core error types with helpful messages and suggestions
#[derive(Error, Debug)]
pub enum Error {
    // Config errors (E600-E699)
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Unknown configuration key: {0}. Run `harbor config show` to see all keys.")]
    UnknownConfigKey(String),

    #[error("Failed to parse configuration file {path}: {reason}")]
    ConfigParse { path: String, reason: String },

    // Service errors (E700-E799)
    #[error("Service '{0}' is not registered")]
    ServiceNotRegistered(&'static str),

    #[error("Service scope '{0}' has been disposed")]
    ScopeDisposed(String),

    // Bus errors (E800-E899)
    #[error("Message bus closed")]
    BusClosed,

    // Generic errors
    #[error("{0}")]
    Other(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Get error code for this error type
    pub fn code(&self) -> &'static str {
        match self {
            Self::ConfigError(_) => "E600",
            Self::UnknownConfigKey(_) => "E601",
            Self::ConfigParse { .. } => "E602",
            Self::ServiceNotRegistered(_) => "E700",
            Self::ScopeDisposed(_) => "E701",
            Self::BusClosed => "E800",
            Self::Other(_) | Self::Io(_) => "E9999",
        }
    }

    /// Get suggestion for how to fix this error
    pub fn suggestion(&self) -> Option<String> {
        match self {
            Self::UnknownConfigKey(_) => Some("harbor config show".to_string()),
            Self::ConfigParse { path, .. } => Some(format!("check the TOML syntax in {}", path)),
            Self::ServiceNotRegistered(name) => {
                Some(format!("register {} with the host before loading plugins", name))
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(Error::ConfigError("x".into()).code(), "E600");
        assert_eq!(Error::ServiceNotRegistered("Clock").code(), "E700");
        assert_eq!(Error::BusClosed.code(), "E800");
        assert_eq!(Error::Other("x".into()).code(), "E9999");
    }

    #[test]
    fn test_error_suggestions() {
        assert_eq!(
            Error::UnknownConfigKey("nope".into()).suggestion().as_deref(),
            Some("harbor config show")
        );
        assert!(Error::BusClosed.suggestion().is_none());
    }

    #[test]
    fn test_error_display() {
        let err = Error::ConfigParse {
            path: "config.toml".into(),
            reason: "expected `=`".into(),
        };
        assert!(err.to_string().contains("config.toml"));
        assert!(err.to_string().contains("expected `=`"));
    }
}
