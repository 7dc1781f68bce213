use crate::config::{Config, ConfigError};
use std::path::{Path, PathBuf};

impl Config {
    /// File name of the user-level configuration
    pub const FILENAME: &'static str = "config.json";

    /// File name looked up in the working directory
    pub const LOCAL_FILENAME: &'static str = "remote-window.json";

    /// Path of the project-local config file in `working_dir`
    pub fn local_config_path(working_dir: &Path) -> PathBuf {
        working_dir.join(Self::LOCAL_FILENAME)
    }

    /// Get all config search paths that exist, local first.
    ///
    /// Search order:
    /// 1. `{working_dir}/remote-window.json`
    /// 2. `{config_dir}/config.json` (see `DirectoryContext`)
    fn config_search_paths(working_dir: &Path, dirs: &DirectoryContext) -> Vec<PathBuf> {
        let mut paths = Vec::with_capacity(2);

        let local = Self::local_config_path(working_dir);
        if local.exists() {
            paths.push(local);
        }

        let user = dirs.config_path();
        if !paths.contains(&user) && user.exists() {
            paths.push(user);
        }

        paths
    }

    /// Find the first existing config file, checking the working directory first.
    pub fn find_config_path(working_dir: &Path, dirs: &DirectoryContext) -> Option<PathBuf> {
        Self::config_search_paths(working_dir, dirs).into_iter().next()
    }

    /// Resolve the configuration to run with.
    ///
    /// An explicit path must load; errors are returned. Otherwise the search
    /// paths are tried in order and the first one that loads wins, falling
    /// back to defaults when none does.
    pub fn resolve(
        explicit: Option<&Path>,
        working_dir: &Path,
        dirs: &DirectoryContext,
    ) -> Result<Self, ConfigError> {
        if let Some(path) = explicit {
            let config = Self::load_from_file(path)?;
            tracing::info!("Loaded config from {}", path.display());
            return Ok(config);
        }

        for path in Self::config_search_paths(working_dir, dirs) {
            match Self::load_from_file(&path) {
                Ok(config) => {
                    tracing::info!("Loaded config from {}", path.display());
                    return Ok(config);
                }
                Err(e) => {
                    tracing::warn!(
                        "Failed to load config from {}: {}, trying next option",
                        path.display(),
                        e
                    );
                }
            }
        }
        tracing::debug!("No config file found, using defaults");
        Ok(Self::default())
    }
}

/// Directory paths for configuration and logs
///
/// Only `main` should use `dirs::*` to construct this; everything else
/// receives it by parameter so tests can point it at a temp directory.
#[derive(Debug, Clone)]
pub struct DirectoryContext {
    /// e.g. ~/.config/remote-window on Linux
    pub config_dir: PathBuf,

    /// e.g. ~/.local/share/remote-window on Linux
    pub data_dir: PathBuf,
}

impl DirectoryContext {
    /// Create a DirectoryContext from the system directories
    pub fn from_system() -> std::io::Result<Self> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| {
                std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    "Could not determine config directory",
                )
            })?
            .join("remote-window");

        let data_dir = dirs::data_dir()
            .ok_or_else(|| {
                std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    "Could not determine data directory",
                )
            })?
            .join("remote-window");

        Ok(Self {
            config_dir,
            data_dir,
        })
    }

    /// All paths point inside `temp_dir`
    pub fn for_testing(temp_dir: &Path) -> Self {
        Self {
            config_dir: temp_dir.join("config"),
            data_dir: temp_dir.join("data"),
        }
    }

    pub fn config_path(&self) -> PathBuf {
        self.config_dir.join(Config::FILENAME)
    }

    /// Default log file location
    pub fn log_path(&self) -> PathBuf {
        self.data_dir.join("logs").join("rwin.log")
    }
}
