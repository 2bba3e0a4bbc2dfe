use config::{Config, ConfigError};
use lazy_static::lazy_static;
use log::*;
use serde::Deserialize;
use std::{fmt::Debug, sync::RwLock};

lazy_static! {
    pub static ref CONFIG: RwLock<Config> = Default::default();
}

/// Look up a tunable by name, falling back to the compiled-in default if the
/// config file doesn't mention it.  Typically called once from a lazy_static
/// initializer at the use site.
pub fn get_tunable<'de, T>(name: &str, default: T) -> T
where
    T: Deserialize<'de> + Debug,
{
    match CONFIG.read().unwrap().get(name) {
        Ok(value) => {
            info!("tunable {}: using value {:?} from config file", name, value);
            value
        }
        Err(ConfigError::NotFound(_)) => default,
        Err(e) => {
            warn!("tunable {}: using default {:?}: {}", name, default, e);
            default
        }
    }
}

/// Merge a config file into the tunable registry.  Must happen before any
/// get_tunable() call whose value it should affect.
pub fn read_tunable_config(file_name: &str) {
    let mut config = CONFIG.write().unwrap();
    config.merge(config::File::with_name(file_name)).unwrap();
    info!("tunables: {}", config.cache);
}
