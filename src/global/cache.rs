//! Local package cache.
//!
//! Each resolved package lives under `root/<registry>/<repository>@<tag>/`
//! as two files:
//!
//! - `package.yaml`: the package-metadata document;
//! - `image.json`: digest, registry, version and package type.
//!
//! The package layer itself is not retained; dependents only need the
//! metadata document and the image record.
//!
//! Entries are written to a hidden staging directory and renamed into place,
//! so a reader sees either the previous entry or the new one, never a mix.
//! Keys must stay below the root: absolute paths, `..` and hidden components
//! are rejected before anything is read or written.

use std::io;
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use crate::dep::{Dependency, PackageType};
use crate::error::{DepError, Result};
use crate::global::fs::{Fs, OsFs};
use crate::global::utils::{DEFAULT_CACHE_DIR, home_dir};
use crate::reference::PackageRef;
use crate::xpkg::{PackageMeta, ParsedPackage};

pub const METADATA_FILE: &str = "package.yaml";
pub const IMAGE_FILE: &str = "image.json";

static UNIQUE: AtomicU64 = AtomicU64::new(0);

/// Resolves the user's home directory for `~` expansion.
pub type HomeDirFn = Arc<dyn Fn() -> io::Result<PathBuf> + Send + Sync>;

/// Everything a [`Local`] cache needs, passed once at construction.
#[derive(Clone)]
pub struct CacheConfig {
    /// Filesystem the cache reads and writes.
    pub fs: Arc<dyn Fs>,
    /// Cache root. A leading `~` is expanded with `home`.
    pub root: PathBuf,
    /// Home directory provider.
    pub home: HomeDirFn,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            fs: Arc::new(OsFs),
            root: PathBuf::from(DEFAULT_CACHE_DIR),
            home: Arc::new(home_dir),
        }
    }
}

impl std::fmt::Debug for CacheConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheConfig")
            .field("fs", &self.fs)
            .field("root", &self.root)
            .finish_non_exhaustive()
    }
}

/// Read/write access to resolved packages, as the dependency manager sees it.
pub trait PackageCache: Send + Sync {
    fn get(&self, dep: &Dependency) -> Result<ParsedPackage>;
    fn store(&self, dep: &Dependency, pkg: &ParsedPackage) -> Result<()>;
    fn contains(&self, reference: &PackageRef) -> bool;
}

/// A package together with the cache path derived from it.
#[derive(Debug, Clone, PartialEq)]
pub struct Entry {
    pkg: ParsedPackage,
    path: String,
}

impl Entry {
    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn digest(&self) -> &str {
        self.pkg.digest()
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct ImageRecord {
    digest: String,
    registry: String,
    version: String,
    #[serde(rename = "type")]
    package_type: PackageType,
}

/// Derives the cache key `<registry>/<repository>@<tag-or-digest>`.
///
/// The registry is already canonical in a [`PackageRef`], so
/// `crossplane/provider-aws:v1` and `docker.io/crossplane/provider-aws:v1`
/// land on the same key.
pub fn calculate_path(reference: &PackageRef) -> String {
    format!(
        "{}/{}@{}",
        reference.registry(),
        reference.repository(),
        reference.identifier()
    )
}

/// Filesystem-backed package cache.
pub struct Local {
    fs: Arc<dyn Fs>,
    root: PathBuf,
    writes: Mutex<()>,
}

impl std::fmt::Debug for Local {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Local")
            .field("fs", &self.fs)
            .field("root", &self.root)
            .finish_non_exhaustive()
    }
}

impl Local {
    /// Builds a cache, expanding `~` in the root and making it absolute.
    ///
    /// # Errors
    /// [`DepError::InvalidConfig`] when the home directory cannot be
    /// determined or the root cannot be made absolute.
    pub fn new(config: CacheConfig) -> Result<Local> {
        let root = expand_root(&config.root, &config.home)?;
        debug!(root = %root.display(), "opened package cache");
        Ok(Local {
            fs: config.fs,
            root,
            writes: Mutex::new(()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Looks up a pinned dependency. `dep.constraints` is taken as a concrete
    /// tag or digest; nothing is resolved here.
    ///
    /// # Errors
    /// [`DepError::InvalidReference`] when the derived key would leave the
    /// cache root, [`DepError::NotFound`] when no entry exists for it,
    /// [`DepError::Read`] when it exists but cannot be decoded.
    pub fn get(&self, dep: &Dependency) -> Result<ParsedPackage> {
        let key = calculate_path(&dep.reference()?);
        let dir = self
            .entry_dir(&key)
            .ok_or_else(|| DepError::invalid_reference(&key, "cache key escapes the cache root"))?;

        let record_path = dir.join(IMAGE_FILE);
        let record = match self.fs.read(&record_path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(DepError::NotFound { key, source: e });
            }
            Err(e) => return Err(read_error(&record_path, e)),
        };
        let record: ImageRecord =
            serde_json::from_slice(&record).map_err(|e| read_error(&record_path, e))?;

        let meta_path = dir.join(METADATA_FILE);
        let meta = self.fs.read(&meta_path).map_err(|e| read_error(&meta_path, e))?;
        let meta: PackageMeta =
            serde_yaml::from_slice(&meta).map_err(|e| read_error(&meta_path, e))?;

        debug!(key = %key, digest = %record.digest, "cache hit");
        Ok(ParsedPackage {
            meta,
            package_type: record.package_type,
            sha: record.digest,
            registry: record.registry,
            version: record.version,
        })
    }

    /// Stores `pkg` under the key derived from its own registry and version,
    /// replacing any previous entry for that key.
    ///
    /// `dep` names what was asked for and is only used for diagnostics.
    ///
    /// # Errors
    /// [`DepError::WriteFailed`] when the entry cannot be written. The
    /// previous entry, if any, is left untouched.
    pub fn store(&self, dep: &Dependency, pkg: &ParsedPackage) -> Result<()> {
        let entry = self.new_entry(pkg)?;
        debug!(requested = %dep, key = %entry.path, digest = %pkg.sha, "storing package");
        self.add(&entry, &entry.path)
    }

    /// Whether an entry exists for `reference`.
    pub fn contains(&self, reference: &PackageRef) -> bool {
        self.entry_dir(&calculate_path(reference))
            .is_some_and(|dir| self.fs.stat(&dir.join(IMAGE_FILE)).is_ok())
    }

    /// Keys of every stored entry, sorted.
    pub fn list(&self) -> Result<Vec<String>> {
        let files = match self.fs.walk(&self.root) {
            Ok(files) => files,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(read_error(&self.root, e)),
        };

        let mut keys: Vec<String> = files
            .iter()
            .filter(|f| f.file_name().is_some_and(|n| n == IMAGE_FILE))
            .filter_map(|f| f.parent()?.strip_prefix(&self.root).ok())
            .filter(|key| {
                !key.components()
                    .any(|c| c.as_os_str().to_string_lossy().starts_with('.'))
            })
            .map(|key| key.to_string_lossy().replace('\\', "/"))
            .collect();
        keys.sort();
        Ok(keys)
    }

    /// Removes every entry. The root directory itself stays.
    ///
    /// The root's children are first moved into a hidden trash directory
    /// inside the root. If any move is refused, the moved children are put
    /// back and the cache is left as it was.
    ///
    /// # Errors
    /// [`DepError::CleanFailed`] when the entries could not be moved aside.
    pub fn clean(&self) -> Result<()> {
        let _guard = self.lock();
        let clean_err = |source| DepError::CleanFailed {
            path: self.root.clone(),
            source,
        };

        match self.fs.stat(&self.root) {
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(clean_err(e)),
        }

        let trash = self.root.join(format!(
            ".trash-{}-{}",
            std::process::id(),
            UNIQUE.fetch_add(1, Ordering::Relaxed)
        ));
        self.fs.create_dir_all(&trash).map_err(clean_err)?;
        let children = match self.fs.read_dir(&self.root) {
            Ok(children) => children,
            Err(e) => {
                self.discard(&trash);
                return Err(clean_err(e));
            }
        };

        let mut moved: Vec<(PathBuf, PathBuf)> = Vec::new();
        for child in children.into_iter().filter(|c| *c != trash) {
            let Some(name) = child.file_name() else { continue };
            let aside = trash.join(name);
            if let Err(e) = self.fs.rename(&child, &aside) {
                if self.restore(&moved) {
                    self.discard(&trash);
                }
                return Err(clean_err(e));
            }
            moved.push((child, aside));
        }

        if let Err(e) = self.fs.remove_dir_all(&trash) {
            warn!(path = %trash.display(), error = %e, "cache moved aside but not fully removed");
        }
        debug!(root = %self.root.display(), entries = moved.len(), "cache cleaned");
        Ok(())
    }

    /// Moves children back out of the trash. False if any stayed behind.
    fn restore(&self, moved: &[(PathBuf, PathBuf)]) -> bool {
        let mut complete = true;
        for (original, aside) in moved.iter().rev() {
            if let Err(e) = self.fs.rename(aside, original) {
                warn!(path = %original.display(), error = %e, "failed to restore cache directory");
                complete = false;
            }
        }
        complete
    }

    /// Wraps `pkg` with the path derived from its own reference.
    pub(crate) fn new_entry(&self, pkg: &ParsedPackage) -> Result<Entry> {
        let path = calculate_path(&pkg.reference()?);
        Ok(Entry {
            pkg: pkg.clone(),
            path,
        })
    }

    /// Writes `entry` at `key`. Every cache write goes through here.
    pub(crate) fn add(&self, entry: &Entry, key: &str) -> Result<()> {
        let _guard = self.lock();
        let Some(target) = self.entry_dir(key) else {
            return Err(DepError::WriteFailed {
                path: PathBuf::from(key),
                source: io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("cache key '{key}' escapes the cache root"),
                ),
            });
        };
        let write_err = |source| DepError::WriteFailed {
            path: target.clone(),
            source,
        };

        let record = serde_json::to_vec_pretty(&ImageRecord {
            digest: entry.pkg.sha.clone(),
            registry: entry.pkg.registry.clone(),
            version: entry.pkg.version.clone(),
            package_type: entry.pkg.package_type,
        })
        .map_err(|e| write_err(io::Error::other(e)))?;
        let meta = serde_yaml::to_string(&entry.pkg.meta)
            .map_err(|e| write_err(io::Error::other(e)))?;

        let (Some(parent), Some(staging), Some(backup)) = (
            target.parent(),
            sibling(&target, "staging"),
            sibling(&target, "old"),
        ) else {
            return Err(write_err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("invalid cache key '{key}'"),
            )));
        };
        self.fs.create_dir_all(parent).map_err(write_err)?;
        self.sweep(&target);

        let staged = self
            .fs
            .create_dir_all(&staging)
            .and_then(|_| self.fs.write(&staging.join(IMAGE_FILE), &record))
            .and_then(|_| self.fs.write(&staging.join(METADATA_FILE), meta.as_bytes()));
        if let Err(e) = staged {
            self.discard(&staging);
            return Err(write_err(e));
        }

        let replacing = self.fs.stat(&target).is_ok();
        if replacing {
            if let Err(e) = self.fs.rename(&target, &backup) {
                self.discard(&staging);
                return Err(write_err(e));
            }
        }
        if let Err(e) = self.fs.rename(&staging, &target) {
            if replacing {
                if let Err(restore) = self.fs.rename(&backup, &target) {
                    warn!(path = %target.display(), error = %restore, "failed to restore previous entry");
                }
            }
            self.discard(&staging);
            return Err(write_err(e));
        }
        if replacing {
            self.discard(&backup);
        }
        Ok(())
    }

    /// The directory for `key`, unless the key is empty, leaves the root or
    /// names a hidden directory.
    fn entry_dir(&self, key: &str) -> Option<PathBuf> {
        let key = Path::new(key);
        let mut components = key.components().peekable();
        components.peek()?;
        components
            .all(|c| matches!(c, Component::Normal(name) if !name.to_string_lossy().starts_with('.')))
            .then(|| self.root.join(key))
    }

    /// Removes staging and backup directories an interrupted write of
    /// `target` left next to it. Callers hold the write lock.
    fn sweep(&self, target: &Path) {
        let (Some(parent), Some(name)) = (target.parent(), target.file_name()) else {
            return;
        };
        let name = name.to_string_lossy();
        let Ok(children) = self.fs.read_dir(parent) else {
            return;
        };
        for child in children {
            if child
                .file_name()
                .is_some_and(|n| is_leftover(&n.to_string_lossy(), &name))
            {
                debug!(path = %child.display(), "removing leftover from an interrupted write");
                self.discard(&child);
            }
        }
    }

    fn discard(&self, path: &Path) {
        if let Err(e) = self.fs.remove_dir_all(path) {
            if e.kind() != io::ErrorKind::NotFound {
                warn!(path = %path.display(), error = %e, "failed to remove temporary cache directory");
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, ()> {
        self.writes.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl PackageCache for Local {
    fn get(&self, dep: &Dependency) -> Result<ParsedPackage> {
        Local::get(self, dep)
    }

    fn store(&self, dep: &Dependency, pkg: &ParsedPackage) -> Result<()> {
        Local::store(self, dep, pkg)
    }

    fn contains(&self, reference: &PackageRef) -> bool {
        Local::contains(self, reference)
    }
}

fn expand_root(root: &Path, home: &HomeDirFn) -> Result<PathBuf> {
    let invalid = |reason: String| DepError::InvalidConfig(format!("cache root {}: {reason}", root.display()));

    let expanded = match root.strip_prefix("~") {
        Ok(rest) => home()
            .map_err(|e| invalid(format!("cannot determine home directory: {e}")))?
            .join(rest),
        Err(_) => root.to_path_buf(),
    };
    if expanded.is_absolute() {
        return Ok(expanded);
    }
    std::env::current_dir()
        .map(|cwd| cwd.join(expanded))
        .map_err(|e| invalid(e.to_string()))
}

/// A hidden, unique path next to `path`.
fn sibling(path: &Path, purpose: &str) -> Option<PathBuf> {
    let name = path.file_name()?.to_string_lossy();
    let n = UNIQUE.fetch_add(1, Ordering::Relaxed);
    Some(path.with_file_name(format!(".{name}.{purpose}-{}-{n}", std::process::id())))
}

/// Whether `file` is a staging or backup directory made by [`sibling`] for
/// the entry named `entry`.
fn is_leftover(file: &str, entry: &str) -> bool {
    let digits = |s: &str| !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit());
    ["staging", "old"].iter().any(|purpose| {
        file.strip_prefix(&format!(".{entry}.{purpose}-"))
            .and_then(|rest| rest.split_once('-'))
            .is_some_and(|(pid, n)| digits(pid) && digits(n))
    })
}

fn read_error(path: &Path, e: impl std::fmt::Display) -> DepError {
    DepError::Read {
        path: path.to_path_buf(),
        reason: e.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use crate::global::fs::{MemFs, ReadOnlyFs};
    use crate::xpkg::ObjectMeta;

    const PROVIDER_AWS: &str = "crossplane/provider-aws";

    fn provider(name: &str, sha: &str, registry: &str, version: &str) -> ParsedPackage {
        ParsedPackage {
            meta: PackageMeta {
                api_version: "meta.pkg.crossplane.io/v1alpha1".to_string(),
                kind: "Provider".to_string(),
                metadata: ObjectMeta {
                    name: name.to_string(),
                    annotations: BTreeMap::new(),
                },
                spec: Default::default(),
            },
            package_type: PackageType::Provider,
            sha: sha.to_string(),
            registry: registry.to_string(),
            version: version.to_string(),
        }
    }

    fn pkg1() -> ParsedPackage {
        provider(
            "provider-aws",
            "sha256:d507e508234732c6dc95d29c8a8c932fa8fa6a229231e309927641f99933892e",
            "index.docker.io/crossplane/provider-aws",
            "v0.20.1-alpha",
        )
    }

    fn pkg2() -> ParsedPackage {
        provider(
            "provider-gcp",
            "sha256:d507e508234732c6dc95d29c8a8c932fa8fa6a229231e309927077099933707",
            "index.docker.io/crossplane/provider-gcp",
            "v0.18.1",
        )
    }

    fn dep1() -> Dependency {
        Dependency::new(PROVIDER_AWS, PackageType::Provider, "v0.20.1-alpha")
    }

    fn dep2() -> Dependency {
        Dependency::new("crossplane/provider-gcp", PackageType::Provider, "v0.18.1")
    }

    fn root_is_home() -> HomeDirFn {
        Arc::new(|| Ok(PathBuf::from("/")))
    }

    fn new_cache(fs: Arc<dyn Fs>, root: &str) -> Local {
        Local::new(CacheConfig {
            fs,
            root: PathBuf::from(root),
            home: root_is_home(),
        })
        .unwrap()
    }

    fn cache_file_count(fs: &dyn Fs, root: &Path) -> usize {
        fs.walk(root).map(|files| files.len()).unwrap_or(0)
    }

    #[test]
    fn test_calculate_path() {
        let cases = [
            (
                "crossplane/provider-aws:v0.20.1-alpha",
                "index.docker.io/crossplane/provider-aws@v0.20.1-alpha",
            ),
            (
                "index.docker.io/crossplane/provider-aws:v0.20.1-alpha",
                "index.docker.io/crossplane/provider-aws@v0.20.1-alpha",
            ),
            (
                "docker.io/crossplane/provider-aws:v0.20.1-alpha",
                "index.docker.io/crossplane/provider-aws@v0.20.1-alpha",
            ),
            ("gcr.io/crossplane/provider-gcp:v1.0.0", "gcr.io/crossplane/provider-gcp@v1.0.0"),
            (
                "registry.upbound.io/examples-aws/getting-started:v0.14.0-240.g6a7366f",
                "registry.upbound.io/examples-aws/getting-started@v0.14.0-240.g6a7366f",
            ),
        ];
        for (reference, want) in cases {
            let r = PackageRef::parse(reference).unwrap();
            assert_eq!(calculate_path(&r), want, "reference {reference}");
        }
    }

    #[test]
    fn test_get_existing_entry() {
        let cache = new_cache(Arc::new(MemFs::new()), "/cache");
        let e = cache.new_entry(&pkg1()).unwrap();
        cache
            .add(&e, "index.docker.io/crossplane/provider-aws@v0.20.1-alpha")
            .unwrap();

        let got = cache.get(&dep1()).unwrap();
        assert_eq!(got.digest(), e.digest());
        assert_eq!(got, pkg1());
    }

    #[test]
    fn test_get_missing_entry() {
        let cache = new_cache(Arc::new(MemFs::new()), "/cache");
        let e = cache.new_entry(&pkg1()).unwrap();
        cache.add(&e, e.path()).unwrap();

        let missing = Dependency::new(PROVIDER_AWS, PackageType::Provider, "v0.20.1-alpha1");
        let err = cache.get(&missing).unwrap_err();
        match err {
            DepError::NotFound { key, source } => {
                assert_eq!(key, "index.docker.io/crossplane/provider-aws@v0.20.1-alpha1");
                assert_eq!(source.kind(), io::ErrorKind::NotFound);
            }
            other => panic!("expected NotFound, got {other:?}"),
        }
    }

    #[test]
    fn test_store_single_entry() {
        let fs = MemFs::new();
        let cache = new_cache(Arc::new(fs.clone()), "/tmp/cache");

        cache.store(&dep1(), &pkg1()).unwrap();

        assert_eq!(cache.get(&dep1()).unwrap().digest(), pkg1().sha);
        assert_eq!(cache_file_count(&fs, cache.root()), 2);
        assert!(fs
            .stat(Path::new("/tmp/cache/index.docker.io/crossplane/provider-aws@v0.20.1-alpha/package.yaml"))
            .is_ok());
    }

    #[test]
    fn test_store_second_dependency_is_additive() {
        let fs = MemFs::new();
        let cache = new_cache(Arc::new(fs.clone()), "/tmp/cache");

        cache.store(&dep1(), &pkg1()).unwrap();
        cache.store(&dep2(), &pkg2()).unwrap();

        assert_eq!(cache.get(&dep2()).unwrap().digest(), pkg2().sha);
        assert_eq!(cache.get(&dep1()).unwrap().digest(), pkg1().sha);
        assert_eq!(cache_file_count(&fs, cache.root()), 4);
    }

    #[test]
    fn test_store_replaces_existing_entry() {
        let fs = MemFs::new();
        let cache = new_cache(Arc::new(fs.clone()), "/tmp/cache");
        let mut rebuilt = pkg1();
        rebuilt.sha = pkg2().sha;

        cache.store(&dep1(), &pkg1()).unwrap();
        cache.store(&dep1(), &rebuilt).unwrap();

        assert_eq!(cache.get(&dep1()).unwrap().digest(), pkg2().sha);
        assert_eq!(cache_file_count(&fs, cache.root()), 2);
        assert_eq!(
            cache.list().unwrap(),
            vec!["index.docker.io/crossplane/provider-aws@v0.20.1-alpha"]
        );
    }

    #[test]
    fn test_store_is_keyed_by_package_not_request() {
        let fs = MemFs::new();
        let cache = new_cache(Arc::new(fs.clone()), "/tmp/cache");
        let requested = Dependency::new("crossplane/exist-xpkg", PackageType::Provider, "latest");

        cache.store(&requested, &pkg1()).unwrap();

        assert!(matches!(cache.get(&requested), Err(DepError::NotFound { .. })));
        assert_eq!(cache.get(&dep1()).unwrap().digest(), pkg1().sha);
    }

    #[test]
    fn test_store_on_read_only_fs() {
        let fs = MemFs::new();
        let cache = new_cache(Arc::new(ReadOnlyFs::new(fs.clone())), "/tmp/cache");

        let err = cache.store(&dep1(), &pkg1()).unwrap_err();

        assert!(matches!(err, DepError::WriteFailed { .. }));
        assert!(err.is_permission_denied());
        assert_eq!(cache_file_count(&fs, Path::new("/tmp/cache")), 0);
    }

    #[test]
    fn test_failed_replace_keeps_previous_entry() {
        let fs = MemFs::new();
        let writable = new_cache(Arc::new(fs.clone()), "/tmp/cache");
        writable.store(&dep1(), &pkg1()).unwrap();

        let read_only = new_cache(Arc::new(ReadOnlyFs::new(fs.clone())), "/tmp/cache");
        let mut rebuilt = pkg1();
        rebuilt.sha = pkg2().sha;
        assert!(read_only.store(&dep1(), &rebuilt).is_err());

        assert_eq!(writable.get(&dep1()).unwrap().digest(), pkg1().sha);
        assert_eq!(cache_file_count(&fs, writable.root()), 2);
    }

    #[test]
    fn test_clean() {
        let fs = MemFs::new();
        let cache = new_cache(Arc::new(fs.clone()), "~/.up/cache");
        let read_only = new_cache(Arc::new(ReadOnlyFs::new(fs.clone())), "~/.up/cache");
        assert_eq!(cache.root(), Path::new("/.up/cache"));

        let fill = || {
            let e1 = cache.new_entry(&pkg1()).unwrap();
            cache
                .add(&e1, "index.docker.io/crossplane/provider-aws@v0.20.1-alpha")
                .unwrap();
            let e2 = cache.new_entry(&pkg2()).unwrap();
            cache
                .add(&e2, "index.docker.io/crossplane/provider-gcp@v0.14.2")
                .unwrap();
        };

        fill();
        assert_eq!(cache_file_count(&fs, read_only.root()), 4);
        let err = read_only.clean().unwrap_err();
        assert!(matches!(err, DepError::CleanFailed { .. }));
        assert!(err.is_permission_denied());
        assert_eq!(cache_file_count(&fs, read_only.root()), 4);

        fill();
        assert_eq!(cache_file_count(&fs, cache.root()), 4);
        cache.clean().unwrap();
        assert_eq!(cache_file_count(&fs, cache.root()), 0);
        assert_eq!(cache_file_count(&fs, Path::new("/")), 0);
        assert!(fs.read_dir(cache.root()).unwrap().is_empty());
    }

    /// Delegates to a [`MemFs`] but fails the `fail_at`-th rename.
    #[derive(Debug)]
    struct FlakyRenameFs {
        inner: MemFs,
        renames: AtomicU64,
        fail_at: u64,
    }

    impl Fs for FlakyRenameFs {
        fn stat(&self, path: &Path) -> io::Result<crate::global::fs::FileType> {
            self.inner.stat(path)
        }

        fn read(&self, path: &Path) -> io::Result<Vec<u8>> {
            self.inner.read(path)
        }

        fn write(&self, path: &Path, contents: &[u8]) -> io::Result<()> {
            self.inner.write(path, contents)
        }

        fn create_dir_all(&self, path: &Path) -> io::Result<()> {
            self.inner.create_dir_all(path)
        }

        fn remove_dir_all(&self, path: &Path) -> io::Result<()> {
            self.inner.remove_dir_all(path)
        }

        fn rename(&self, from: &Path, to: &Path) -> io::Result<()> {
            if self.renames.fetch_add(1, Ordering::SeqCst) + 1 == self.fail_at {
                return Err(io::Error::other("device busy"));
            }
            self.inner.rename(from, to)
        }

        fn walk(&self, root: &Path) -> io::Result<Vec<PathBuf>> {
            self.inner.walk(root)
        }

        fn read_dir(&self, path: &Path) -> io::Result<Vec<PathBuf>> {
            self.inner.read_dir(path)
        }
    }

    #[test]
    fn test_clean_puts_entries_back_when_a_move_fails() {
        let fs = MemFs::new();
        let cache = new_cache(Arc::new(fs.clone()), "/cache");
        let gcp = provider(
            "provider-gcp",
            "sha256:d507e508234732c6dc95d29c8a8c932fa8fa6a229231e309927077099933707",
            "gcr.io/crossplane/provider-gcp",
            "v1.0.0",
        );
        let gcp_dep = Dependency::new("gcr.io/crossplane/provider-gcp", PackageType::Provider, "v1.0.0");
        cache.store(&dep1(), &pkg1()).unwrap();
        cache.store(&gcp_dep, &gcp).unwrap();

        // gcr.io moves first, index.docker.io is refused
        let flaky = new_cache(
            Arc::new(FlakyRenameFs {
                inner: fs.clone(),
                renames: AtomicU64::new(0),
                fail_at: 2,
            }),
            "/cache",
        );
        let err = flaky.clean().unwrap_err();

        assert!(matches!(err, DepError::CleanFailed { .. }));
        assert_eq!(cache.list().unwrap().len(), 2);
        assert_eq!(cache_file_count(&fs, cache.root()), 4);
        assert_eq!(cache.get(&dep1()).unwrap(), pkg1());
        assert_eq!(cache.get(&gcp_dep).unwrap(), gcp);
        assert_eq!(
            fs.read_dir(cache.root()).unwrap(),
            vec![PathBuf::from("/cache/gcr.io"), PathBuf::from("/cache/index.docker.io")]
        );
    }

    #[test]
    fn test_keys_outside_root_are_rejected() {
        let fs = MemFs::new();
        let cache = new_cache(Arc::new(fs.clone()), "/cache/nested");
        let e = cache.new_entry(&pkg1()).unwrap();

        for key in ["../escape@v1", "../../etc/escape@v1", "/abs/escape@v1", ".hidden/pkg@v1", ""] {
            let err = cache.add(&e, key).unwrap_err();
            assert!(matches!(err, DepError::WriteFailed { .. }), "key {key:?}");
        }
        assert_eq!(cache_file_count(&fs, Path::new("/")), 0);
    }

    #[test]
    fn test_store_removes_leftovers_of_interrupted_writes() {
        let fs = MemFs::new();
        let cache = new_cache(Arc::new(fs.clone()), "/tmp/cache");
        let parent = Path::new("/tmp/cache/index.docker.io/crossplane");
        for leftover in [
            ".provider-aws@v0.20.1-alpha.staging-4242-0",
            ".provider-aws@v0.20.1-alpha.old-4242-1",
        ] {
            fs.create_dir_all(&parent.join(leftover)).unwrap();
            fs.write(&parent.join(leftover).join(IMAGE_FILE), b"{}").unwrap();
        }

        cache.store(&dep1(), &pkg1()).unwrap();

        assert_eq!(cache_file_count(&fs, cache.root()), 2);
        assert_eq!(
            fs.read_dir(parent).unwrap(),
            vec![parent.join("provider-aws@v0.20.1-alpha")]
        );
    }

    #[test]
    fn test_leftover_names() {
        let entry = "provider-aws@v1";
        assert!(is_leftover(".provider-aws@v1.staging-12-0", entry));
        assert!(is_leftover(".provider-aws@v1.old-12-3", entry));
        // the hidden sibling of an entry tagged `v1.staging-2`
        assert!(!is_leftover(".provider-aws@v1.staging-2.staging-12-0", entry));
        assert!(!is_leftover("provider-aws@v1", entry));
        assert!(!is_leftover(".provider-aws@v1.staging-", entry));
    }

    #[test]
    fn test_clean_missing_root_is_noop() {
        let cache = new_cache(Arc::new(MemFs::new()), "/nothing/here");
        cache.clean().unwrap();
        assert!(cache.list().unwrap().is_empty());
    }

    #[test]
    fn test_relative_root_is_made_absolute() {
        let cache = new_cache(Arc::new(MemFs::new()), "relative/cache");
        assert!(cache.root().is_absolute());
        assert!(cache.root().ends_with("relative/cache"));
    }

    #[test]
    fn test_home_failure_is_config_error() {
        let err = Local::new(CacheConfig {
            fs: Arc::new(MemFs::new()),
            root: PathBuf::from("~/.up/cache"),
            home: Arc::new(|| Err(io::Error::new(io::ErrorKind::NotFound, "no home"))),
        })
        .unwrap_err();
        assert!(matches!(err, DepError::InvalidConfig(_)));
    }

    #[test]
    fn test_concurrent_stores_of_distinct_keys() {
        let fs = MemFs::new();
        let cache = new_cache(Arc::new(fs.clone()), "/tmp/cache");
        let packages: Vec<ParsedPackage> = (0..8)
            .map(|i| {
                provider(
                    "provider-aws",
                    &format!("sha256:{i:064x}"),
                    "index.docker.io/crossplane/provider-aws",
                    &format!("v0.{i}.0"),
                )
            })
            .collect();

        std::thread::scope(|s| {
            for pkg in &packages {
                let cache = &cache;
                s.spawn(move || cache.store(&dep1(), pkg).unwrap());
            }
        });

        assert_eq!(cache.list().unwrap().len(), 8);
        assert_eq!(cache_file_count(&fs, cache.root()), 16);
    }

    #[test]
    fn test_concurrent_stores_of_same_key() {
        let fs = MemFs::new();
        let cache = new_cache(Arc::new(fs.clone()), "/tmp/cache");
        let packages: Vec<ParsedPackage> = (0..8)
            .map(|i| {
                provider(
                    "provider-aws",
                    &format!("sha256:{i:064x}"),
                    "index.docker.io/crossplane/provider-aws",
                    "v0.20.1-alpha",
                )
            })
            .collect();

        std::thread::scope(|s| {
            for pkg in &packages {
                let cache = &cache;
                s.spawn(move || cache.store(&dep1(), pkg).unwrap());
            }
        });

        assert_eq!(
            cache.list().unwrap(),
            vec!["index.docker.io/crossplane/provider-aws@v0.20.1-alpha"]
        );
        let files = fs.walk(cache.root()).unwrap();
        assert_eq!(files.len(), 2);
        assert!(files.iter().all(|f| {
            !f.strip_prefix(cache.root())
                .unwrap()
                .components()
                .any(|c| c.as_os_str().to_string_lossy().starts_with('.'))
        }));
        let digest = cache.get(&dep1()).unwrap().sha;
        assert!(packages.iter().any(|p| p.sha == digest));
    }

    #[test]
    fn test_os_fs_store_and_clean() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("cache");
        let cache = Local::new(CacheConfig {
            root: root.clone(),
            ..CacheConfig::default()
        })
        .unwrap();

        cache.store(&dep1(), &pkg1()).unwrap();
        cache.store(&dep1(), &pkg1()).unwrap();
        assert_eq!(cache_file_count(&OsFs, &root), 2);
        assert_eq!(cache.get(&dep1()).unwrap(), pkg1());

        cache.clean().unwrap();
        assert!(cache.list().unwrap().is_empty());
        assert_eq!(cache_file_count(&OsFs, dir.path()), 0);
        assert_eq!(std::fs::read_dir(&root).unwrap().count(), 0);
    }
}
