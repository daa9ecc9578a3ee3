use std::{env, path::PathBuf};

pub const APP_NAME: &str = "docvl";
pub const CONFIG_DIR_ENV: &str = "DOCVL_CONFIG_DIR";

/// Directory holding `config.toml`: `$DOCVL_CONFIG_DIR`, else the platform config dir.
pub fn config_dir() -> PathBuf {
    env::var(CONFIG_DIR_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            dirs::config_dir()
                .unwrap_or_else(|| fallback_home(".config"))
                .join(APP_NAME)
        })
}

pub fn default_config_file() -> PathBuf {
    config_dir().join("config.toml")
}

fn fallback_home(component: &str) -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(component)
}
