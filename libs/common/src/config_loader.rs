//! Layered configuration loading
//!
//! Values are merged in order: serialized defaults, then an optional YAML
//! file, then environment variables. Nested keys in the environment use `__`,
//! so `FIELDSRV_MODBUS__TIMEOUT_MS=5000` sets `modbus.timeout_ms`.

use std::path::Path;

use errors::{FieldError, FieldResult};
use figment::providers::{Env, Format, Serialized, Yaml};
use figment::Figment;
use serde::{de::DeserializeOwned, Serialize};
use tracing::{debug, info};

/// Build the layered figment without extracting it
pub fn layered<T: Serialize>(defaults: &T, file: Option<&Path>, env_prefix: &str) -> Figment {
    let mut figment = Figment::from(Serialized::defaults(defaults));

    match file {
        Some(path) if path.exists() => {
            info!("Loading configuration from {:?}", path);
            figment = figment.merge(Yaml::file(path));
        },
        Some(path) => debug!("Config file {:?} not found, using defaults", path),
        None => {},
    }

    figment.merge(Env::prefixed(env_prefix).split("__"))
}

/// Load a configuration struct from defaults, file and environment
pub fn load_config<T>(file: Option<&Path>, env_prefix: &str) -> FieldResult<T>
where
    T: Serialize + DeserializeOwned + Default,
{
    layered(&T::default(), file, env_prefix)
        .extract()
        .map_err(FieldError::from)
}
