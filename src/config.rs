use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Process configuration, loaded from `tabula.toml`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Directory holding one SQLite file per database name
    pub storage_dir: PathBuf,
    /// Upper bound on concurrent blocking storage calls
    pub max_workers: usize,
    /// HTTP listen port
    pub port: u16,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            storage_dir: PathBuf::from("data"),
            max_workers: 10,
            port: 5000,
        }
    }
}

pub fn default_config_path() -> PathBuf {
    PathBuf::from("tabula.toml")
}

pub fn load_config(path: Option<&Path>) -> anyhow::Result<Option<Config>> {
    let path = path.map(Path::to_path_buf).unwrap_or_else(default_config_path);
    if !path.exists() {
        return Ok(None);
    }

    let contents = std::fs::read_to_string(&path)?;
    let config: Config = toml::from_str(&contents)?;
    Ok(Some(config))
}

pub fn write_config(path: &Path, config: &Config, force: bool) -> anyhow::Result<()> {
    if path.exists() && !force {
        anyhow::bail!("config already exists at {} (use --force to overwrite)", path.display());
    }

    let contents = toml::to_string_pretty(config)?;
    std::fs::write(path, contents)?;
    Ok(())
}

pub fn ensure_storage_dir(dir: &Path) -> anyhow::Result<()> {
    if !dir.exists() {
        std::fs::create_dir_all(dir)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_round_trips_through_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tabula.toml");

        let config = Config {
            storage_dir: PathBuf::from("/tmp/tabula"),
            max_workers: 4,
            port: 8080,
        };
        write_config(&path, &config, false).unwrap();

        let loaded = load_config(Some(&path)).unwrap().unwrap();
        assert_eq!(loaded.port, 8080);
        assert_eq!(loaded.max_workers, 4);
        assert_eq!(loaded.storage_dir, PathBuf::from("/tmp/tabula"));
    }

    #[test]
    fn missing_keys_fall_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tabula.toml");
        std::fs::write(&path, "port = 9000\n").unwrap();

        let loaded = load_config(Some(&path)).unwrap().unwrap();
        assert_eq!(loaded.port, 9000);
        assert_eq!(loaded.max_workers, Config::default().max_workers);
    }

    #[test]
    fn write_refuses_to_clobber_without_force() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tabula.toml");

        write_config(&path, &Config::default(), false).unwrap();
        assert!(write_config(&path, &Config::default(), false).is_err());
        write_config(&path, &Config::default(), true).unwrap();
    }
}
