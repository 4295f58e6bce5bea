//! Harbor Core Library
//!
//! Ambient services shared by the Harbor plugin runtime and by the plugins it hosts:
//! - Host configuration (TOML, environment overrides)
//! - Error types with stable codes
//! - Service registry with per-plugin scopes
//! - Message bus for inter-plugin communication
//! - Sanitization of failure details before they reach logs or audit output

pub mod bus;
pub mod config;
pub mod error;
pub mod sanitize;
pub mod services;

pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::bus::{BusMessage, MessageBus};
    pub use crate::config::HostConfig;
    pub use crate::error::{Error, Result};
    pub use crate::services::ServiceRegistry;
}
