//! Configuration for Aegis
//!
//! YAML files (durations in humantime form such as `"300ms"` or `"1m"`),
//! `AEGIS_*` environment overrides and per-domain validation.

pub mod domains;
pub mod error;
pub mod loader;
pub mod validation;

pub use domains::{
    cache::CacheConfig,
    logging::{LogLevel, LoggingConfig},
    resilience::ResilienceConfig,
    AegisConfig,
};
pub use error::{ConfigError, ConfigResult};
pub use loader::ConfigLoader;
pub use validation::Validatable;
