use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use tracing::{debug, info};
use crate::dep::Dependency;
use crate::error::{DepError, Result};
use crate::global::cache::PackageCache;
use crate::reference::PackageRef;
use crate::resolver::Resolver;
use crate::xpkg::ParsedPackage;

/// Resolves dependencies to concrete packages and keeps them cached.
pub struct Manager {
    cache: Arc<dyn PackageCache>,
    resolver: Arc<dyn Resolver>,
}

impl Manager {
    pub fn new(cache: Arc<dyn PackageCache>, resolver: Arc<dyn Resolver>) -> Manager {
        Manager { cache, resolver }
    }

    /// Resolves `dep` to a concrete version, making sure the package is in
    /// the cache afterwards.
    ///
    /// Returns the dependency pinned to that version together with the
    /// package. A package already cached under the concrete reference is not
    /// fetched again.
    ///
    /// # Errors
    /// - [`DepError::InvalidReference`] if `dep.package` is malformed
    /// - [`DepError::ResolutionFailed`] if no version satisfies the constraint
    ///   or the registry cannot be reached
    /// - [`DepError::InvalidPackage`] if the artifact is not a package
    /// - [`DepError::WriteFailed`] if the package could not be cached
    pub fn add_all(&self, dep: &Dependency) -> Result<(Dependency, ParsedPackage)> {
        let package = PackageRef::parse_repository(&dep.package)?;
        let concrete = self.resolver.resolve(&package, &dep.constraints)?;
        let lookup = Dependency::new(&concrete.name(), dep.package_type, concrete.identifier());

        if let Some(pkg) = self.cached(&concrete, &lookup)? {
            return Ok((dep.pinned(&pkg.version, pkg.package_type), pkg));
        }

        let artifact = self.resolver.fetch(&concrete)?;
        let pkg = ParsedPackage::parse(&concrete, &artifact)?;
        self.cache.store(&lookup, &pkg)?;

        info!(package = %dep.package, version = %pkg.version, digest = %pkg.sha, "resolved dependency");
        Ok((dep.pinned(&pkg.version, pkg.package_type), pkg))
    }

    /// Resolves `dep` and, breadth-first, every package it depends on.
    ///
    /// Each package name is resolved once; the first constraint seen for it
    /// wins. The root dependency comes first in the result.
    pub fn add_with_dependencies(&self, dep: &Dependency) -> Result<Vec<(Dependency, ParsedPackage)>> {
        let mut seen = HashSet::new();
        let mut queue = VecDeque::from([dep.clone()]);
        let mut resolved = Vec::new();

        while let Some(next) = queue.pop_front() {
            let name = PackageRef::parse_repository(&next.package)?.name();
            if !seen.insert(name) {
                continue;
            }
            let (pinned, pkg) = self.add_all(&next)?;
            queue.extend(pkg.dependencies()?);
            resolved.push((pinned, pkg));
        }
        Ok(resolved)
    }

    /// Resolves independent dependencies in parallel, one thread each.
    ///
    /// Every dependency is attempted; the first error in input order is
    /// returned after all of them finished.
    pub fn add_many(&self, deps: &[Dependency]) -> Result<Vec<(Dependency, ParsedPackage)>> {
        let results: Vec<Result<(Dependency, ParsedPackage)>> = std::thread::scope(|s| {
            let handles: Vec<_> = deps
                .iter()
                .map(|dep| s.spawn(move || self.add_all(dep)))
                .collect();
            handles
                .into_iter()
                .zip(deps)
                .map(|(handle, dep)| {
                    handle.join().unwrap_or_else(|_| {
                        Err(DepError::resolution(
                            &dep.package,
                            &dep.constraints,
                            "resolver thread panicked",
                        ))
                    })
                })
                .collect()
        });
        results.into_iter().collect()
    }

    fn cached(&self, concrete: &PackageRef, lookup: &Dependency) -> Result<Option<ParsedPackage>> {
        if !self.cache.contains(concrete) {
            debug!(reference = %concrete, "cache miss");
            return Ok(None);
        }
        match self.cache.get(lookup) {
            Ok(pkg) => Ok(Some(pkg)),
            Err(DepError::NotFound { .. }) => Ok(None),
            Err(DepError::Read { path, reason }) => {
                debug!(path = %path.display(), %reason, "unreadable cache entry, fetching again");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }
}
