//! Locations under ~/.pastlead and config loading.

use std::fs;
use std::path::{Path, PathBuf};

use crate::db::{DbError, LeadDb};
use crate::error::PipelineError;
use crate::types::Config;

/// Get the state directory (~/.pastlead)
pub fn state_dir() -> Result<PathBuf, PipelineError> {
    let home = dirs::home_dir().ok_or(DbError::HomeDirNotFound)?;
    Ok(home.join(".pastlead"))
}

pub fn default_config_path() -> Result<PathBuf, PipelineError> {
    Ok(state_dir()?.join("config.json"))
}

/// Load configuration.
///
/// With no explicit path, a missing ~/.pastlead/config.json means defaults.
/// An explicit path must exist. The loaded config is validated, including
/// every blacklist pattern.
pub fn load_config(path: Option<&Path>) -> Result<Config, PipelineError> {
    let (config_path, explicit) = match path {
        Some(p) => (p.to_path_buf(), true),
        None => (default_config_path()?, false),
    };

    if !config_path.exists() {
        if explicit {
            return Err(PipelineError::Config(format!(
                "Config file not found at {}",
                config_path.display()
            )));
        }
        log::debug!("No config at {}, using defaults", config_path.display());
        let config = Config::default();
        config.validate()?;
        return Ok(config);
    }

    let content =
        fs::read_to_string(&config_path).map_err(|e| PipelineError::io(&config_path, e))?;
    let config: Config = serde_json::from_str(&content).map_err(|e| {
        PipelineError::Config(format!("Failed to parse {}: {}", config_path.display(), e))
    })?;
    config.validate()?;
    log::info!("Loaded config from {}", config_path.display());
    Ok(config)
}

/// Database path precedence: `--db`, then `databasePath`, then the default location.
pub fn resolve_db_path(cli_db: Option<&Path>, config: &Config) -> Result<PathBuf, PipelineError> {
    if let Some(path) = cli_db {
        return Ok(path.to_path_buf());
    }
    if let Some(path) = config.database_path.as_deref() {
        return Ok(PathBuf::from(path));
    }
    Ok(LeadDb::default_path()?)
}
