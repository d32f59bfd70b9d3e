//! Turning a version constraint into a concrete package reference.
//!
//! A [`Resolver`] is the only thing in this crate allowed to go over the
//! network. [`crate::registry::RegistryResolver`] talks to OCI registries;
//! [`LocalResolver`] serves packages from memory.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use crate::error::{DepError, Result};
use crate::reference::PackageRef;
use crate::util::{parse_constraint, parse_version, sort_versions};
use crate::xpkg::Artifact;

pub trait Resolver: Send + Sync {
    /// Every tag published for `package`.
    fn tags(&self, package: &PackageRef) -> Result<Vec<String>>;

    /// Downloads the package layer for a concrete tag or digest.
    fn fetch(&self, reference: &PackageRef) -> Result<Artifact>;

    /// Picks the concrete reference satisfying `constraint`.
    ///
    /// Digests are taken as-is. Otherwise an exact tag wins, then the highest
    /// semver tag matching the constraint.
    ///
    /// # Errors
    /// [`DepError::ResolutionFailed`] when no tag satisfies the constraint or
    /// the tags cannot be listed.
    fn resolve(&self, package: &PackageRef, constraint: &str) -> Result<PackageRef> {
        let constraint = constraint.trim();
        if constraint.starts_with("sha256:") {
            return PackageRef::parse(&format!("{}@{constraint}", package.name()));
        }

        let tags = self.tags(package)?;
        let tag = select_tag(&tags, constraint).ok_or_else(|| {
            DepError::resolution(
                &package.name(),
                constraint,
                format!("none of {} available tags satisfies the constraint", tags.len()),
            )
        })?;
        package.with_tag(&tag)
    }
}

/// Chooses the tag in `tags` that best satisfies `constraint`.
pub fn select_tag(tags: &[String], constraint: &str) -> Option<String> {
    if tags.iter().any(|t| t == constraint) {
        return Some(constraint.to_string());
    }

    let versions = sort_versions(tags);
    if let Some(exact) = parse_version(constraint) {
        return versions
            .into_iter()
            .find(|(v, _)| *v == exact)
            .map(|(_, tag)| tag);
    }

    let req = parse_constraint(constraint)?;
    versions
        .into_iter()
        .rev()
        .find(|(v, _)| req.matches(v))
        .map(|(_, tag)| tag)
}

/// Resolver backed by packages held in memory. Useful offline and in tests.
#[derive(Debug, Default)]
pub struct LocalResolver {
    packages: HashMap<String, BTreeMap<String, Artifact>>,
    fetches: AtomicUsize,
}

impl LocalResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publishes `artifact` under the tag or digest of `reference`.
    pub fn insert(&mut self, reference: &PackageRef, artifact: Artifact) {
        self.packages
            .entry(reference.name())
            .or_default()
            .insert(reference.identifier().to_string(), artifact);
    }

    /// Number of successful [`Resolver::fetch`] calls so far.
    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

impl Resolver for LocalResolver {
    fn tags(&self, package: &PackageRef) -> Result<Vec<String>> {
        let tags = self.packages.get(&package.name()).ok_or_else(|| {
            DepError::resolution(&package.name(), package.identifier(), "repository not found")
        })?;
        Ok(tags
            .keys()
            .filter(|t| !t.starts_with("sha256:"))
            .cloned()
            .collect())
    }

    fn fetch(&self, reference: &PackageRef) -> Result<Artifact> {
        let artifact = self
            .packages
            .get(&reference.name())
            .and_then(|tags| tags.get(reference.identifier()))
            .cloned()
            .ok_or_else(|| {
                DepError::resolution(&reference.name(), reference.identifier(), "manifest unknown")
            })?;
        self.fetches.fetch_add(1, Ordering::SeqCst);
        Ok(artifact)
    }
}
