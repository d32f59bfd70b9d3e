use std::io;
use std::path::PathBuf;
use directories::{BaseDirs, ProjectDirs};
use crate::error::{DepError, Result};

/// Cache root used when nothing else is configured.
pub const DEFAULT_CACHE_DIR: &str = "~/.up/cache/";

/// The current user's home directory.
pub fn home_dir() -> io::Result<PathBuf> {
    BaseDirs::new()
        .map(|dirs| dirs.home_dir().to_path_buf())
        .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "could not determine home directory"))
}

/// Directory holding `config.toml`.
pub fn get_global_config_dir() -> Result<PathBuf> {
    let proj_dirs = ProjectDirs::from("io", "upbound", "xpdep")
        .ok_or_else(|| DepError::InvalidConfig("could not get project directories".to_string()))?;
    Ok(proj_dirs.config_dir().to_path_buf())
}
