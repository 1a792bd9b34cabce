//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! config file (TOML)
//!     → loader.rs (read & deserialize)
//!     → validation.rs (semantic checks, every error reported)
//!     → GatewayConfig (validated, immutable)
//!     → pieces handed to the gateway, server and admin API at startup
//! ```
//!
//! # Design Decisions
//! - Config is immutable once loaded; changes require a restart
//! - All fields have defaults to allow minimal configs
//! - Validation separates syntactic (serde) from semantic checks

pub mod loader;
pub mod schema;
pub mod validation;

pub use loader::{load_config, parse_config, ConfigError};
pub use schema::{
    AdminConfig, DarkModeConfig, GatewayConfig, ListenerConfig, ObservabilityConfig,
    RegistrationConfig, RouterConfig,
};
pub use validation::{validate_config, ValidationError};
