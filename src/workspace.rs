use std::path::{Path, PathBuf};
use tracing::debug;
use crate::error::{DepError, Result};
use crate::xpkg::PackageMeta;

/// Name of the package-metadata file at the root of a project.
pub const META_FILE: &str = "crossplane.yaml";

/// A project directory and the `crossplane.yaml` it may contain.
#[derive(Debug, Clone)]
pub struct Workspace {
    dir: PathBuf,
    meta: Option<PackageMeta>,
}

impl Workspace {
    /// Loads the workspace rooted at `dir`.
    ///
    /// A missing `crossplane.yaml` is not an error; [`Workspace::meta`] then
    /// returns `None`.
    ///
    /// # Errors
    /// [`DepError::Workspace`] if the file exists but cannot be read or parsed.
    pub fn load<P: AsRef<Path>>(dir: P) -> Result<Workspace> {
        let dir = dir.as_ref().to_path_buf();
        let path = dir.join(META_FILE);
        if !path.exists() {
            debug!(dir = %dir.display(), "no {META_FILE} in workspace");
            return Ok(Workspace { dir, meta: None });
        }

        let content = std::fs::read_to_string(&path)
            .map_err(|e| DepError::Workspace(format!("{}: {e}", path.display())))?;
        let meta = serde_yaml::from_str(&content)
            .map_err(|e| DepError::Workspace(format!("{}: {e}", path.display())))?;
        Ok(Workspace {
            dir,
            meta: Some(meta),
        })
    }

    pub fn meta_path(&self) -> PathBuf {
        self.dir.join(META_FILE)
    }

    pub fn meta(&self) -> Option<&PackageMeta> {
        self.meta.as_ref()
    }

    /// Writes `meta` to `crossplane.yaml` and keeps it as the loaded metadata.
    pub fn write(&mut self, meta: &PackageMeta) -> Result<()> {
        let path = self.meta_path();
        let content = serde_yaml::to_string(meta)
            .map_err(|e| DepError::Workspace(format!("{}: {e}", path.display())))?;
        std::fs::write(&path, content).map_err(|e| DepError::WriteFailed { path, source: e })?;
        self.meta = Some(meta.clone());
        Ok(())
    }
}
