//! Config file discovery, loading and first-run defaults.

use std::path::{Path, PathBuf};

use tracing::info;

use crate::config::Config;
use crate::error::EngineError;

/// Load configuration from the given path, or the default location.
///
/// A missing file yields the defaults; a malformed one is an error.
pub fn load_config(path: Option<&Path>) -> Result<Config, EngineError> {
    let config_path = path.map_or_else(default_config_path, Path::to_path_buf);

    if config_path.exists() {
        let content = std::fs::read_to_string(&config_path)
            .map_err(|e| EngineError::Config(format!("failed to read config: {e}")))?;
        let config: Config = toml::from_str(&content)
            .map_err(|e| EngineError::Config(format!("failed to parse config: {e}")))?;
        info!(path = %config_path.display(), "loaded config");
        Ok(config)
    } else {
        info!(path = %config_path.display(), "no config file found, using defaults");
        Ok(Config::default())
    }
}

/// Write the default configuration, refusing to clobber an existing file
/// unless `force` is set. Returns the path written.
pub fn write_default_config(path: Option<&Path>, force: bool) -> Result<PathBuf, EngineError> {
    let config_path = path.map_or_else(default_config_path, Path::to_path_buf);
    if config_path.exists() && !force {
        return Err(EngineError::Config(format!(
            "{} already exists",
            config_path.display()
        )));
    }
    if let Some(parent) = config_path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| EngineError::Config(format!("failed to create config dir: {e}")))?;
    }
    let content = toml::to_string_pretty(&Config::default())
        .map_err(|e| EngineError::Config(format!("failed to serialize config: {e}")))?;
    std::fs::write(&config_path, content)
        .map_err(|e| EngineError::Config(format!("failed to write config: {e}")))?;
    info!(path = %config_path.display(), "wrote default config");
    Ok(config_path)
}

/// Get the default config directory path.
pub fn config_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("~/.config"))
        .join("syncroom")
}

/// Get the default config file path.
pub fn default_config_path() -> PathBuf {
    config_dir().join("config.toml")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch(name: &str) -> PathBuf {
        std::env::temp_dir()
            .join(format!("syncroom-setup-{}-{name}", std::process::id()))
            .join("config.toml")
    }

    #[test]
    fn missing_file_gives_defaults() {
        let path = scratch("missing");
        let config = load_config(Some(&path)).unwrap();
        assert_eq!(config.network.port_base, 24900);
    }

    #[test]
    fn written_defaults_load_back() {
        let path = scratch("roundtrip");
        let written = write_default_config(Some(&path), true).unwrap();
        assert_eq!(written, path);
        let config = load_config(Some(&path)).unwrap();
        assert_eq!(config.barriers.timeout_ms, 15_000);

        assert!(matches!(
            write_default_config(Some(&path), false),
            Err(EngineError::Config(_))
        ));
        let _ = std::fs::remove_dir_all(path.parent().unwrap());
    }

    #[test]
    fn malformed_file_is_an_error() {
        let path = scratch("malformed");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, "[network\nport_base = ").unwrap();
        assert!(matches!(load_config(Some(&path)), Err(EngineError::Config(_))));
        let _ = std::fs::remove_dir_all(path.parent().unwrap());
    }
}
