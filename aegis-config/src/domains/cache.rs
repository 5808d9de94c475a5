//! Cache configuration

pub use aegis_caching::{CacheConfig, PersistenceConfig};

use crate::error::ConfigResult;
use crate::validation::Validatable;

impl Validatable for CacheConfig {
    fn validate(&self) -> ConfigResult<()> {
        CacheConfig::validate(self).map_err(|err| self.validation_error(err.to_string()))
    }

    fn domain_name(&self) -> &'static str {
        "cache"
    }
}
