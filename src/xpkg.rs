//! Crossplane package contents.
//!
//! A package artifact is the base layer of an OCI image: a tar archive
//! (usually gzip compressed) holding a `package.yaml` stream. The first
//! document in that stream whose `apiVersion` belongs to
//! `meta.pkg.crossplane.io` describes the package; the rest are CRDs and
//! other objects this crate does not look at.

use std::collections::BTreeMap;
use std::io::{self, Read, Write};
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use serde::{Deserialize, Serialize};
use crate::dep::{DEFAULT_CONSTRAINT, Dependency, PackageType};
use crate::error::{DepError, Result};
use crate::reference::PackageRef;
use crate::util::sha256_digest;

/// Name of the package stream inside the layer.
pub const PACKAGE_STREAM: &str = "package.yaml";
/// API group of package-metadata documents.
pub const META_API_GROUP: &str = "meta.pkg.crossplane.io";

/// A package-metadata document (`Provider` or `Configuration`), as found in
/// a package and in a project's `crossplane.yaml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PackageMeta {
    pub api_version: String,
    pub kind: String,
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: MetaSpec,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ObjectMeta {
    pub name: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetaSpec {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<MetaDependency>,
    /// Fields this crate does not interpret, kept so a rewrite loses nothing.
    #[serde(flatten)]
    pub other: BTreeMap<String, serde_yaml::Value>,
}

/// One entry of `spec.dependsOn`. Exactly one of `provider` and
/// `configuration` is set.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MetaDependency {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub configuration: Option<String>,
    #[serde(default)]
    pub version: String,
}

impl MetaDependency {
    pub fn to_dependency(&self) -> Result<Dependency> {
        let (package, package_type) = match (&self.provider, &self.configuration) {
            (Some(p), None) => (p, PackageType::Provider),
            (None, Some(c)) => (c, PackageType::Configuration),
            _ => {
                return Err(DepError::Workspace(
                    "dependsOn entries must set exactly one of provider or configuration".to_string(),
                ));
            }
        };
        let constraints = if self.version.trim().is_empty() {
            DEFAULT_CONSTRAINT
        } else {
            self.version.trim()
        };
        Ok(Dependency::new(package, package_type, constraints))
    }

    pub fn from_dependency(dep: &Dependency) -> Result<MetaDependency> {
        let mut entry = MetaDependency {
            version: dep.constraints.clone(),
            ..Default::default()
        };
        match dep.package_type {
            PackageType::Provider => entry.provider = Some(dep.package.clone()),
            PackageType::Configuration => entry.configuration = Some(dep.package.clone()),
            PackageType::Unknown => {
                return Err(DepError::Workspace(format!(
                    "cannot record {} without a package type",
                    dep.package
                )));
            }
        }
        Ok(entry)
    }

    pub fn package(&self) -> Option<&str> {
        self.provider.as_deref().or(self.configuration.as_deref())
    }
}

impl PackageMeta {
    /// The dependencies declared under `spec.dependsOn`.
    pub fn depends_on(&self) -> Result<Vec<Dependency>> {
        self.spec
            .depends_on
            .iter()
            .map(MetaDependency::to_dependency)
            .collect()
    }

    /// Inserts `dep` into `spec.dependsOn`, replacing an entry that names the
    /// same package (registry aliases count as the same package).
    pub fn upsert(&mut self, dep: &Dependency) -> Result<()> {
        let wanted = PackageRef::parse_repository(&dep.package)?;
        let entry = MetaDependency::from_dependency(dep)?;

        let existing = self.spec.depends_on.iter_mut().find(|d| {
            d.package()
                .and_then(|p| PackageRef::parse_repository(p).ok())
                .is_some_and(|r| r == wanted)
        });
        match existing {
            Some(slot) => *slot = entry,
            None => self.spec.depends_on.push(entry),
        }
        Ok(())
    }
}

/// Raw bytes of a package layer plus the digest the registry reported for it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    pub digest: String,
    pub layer: Vec<u8>,
}

impl Artifact {
    /// Packs a `package.yaml` stream into a gzip tar layer.
    pub fn from_package_yaml(package_yaml: &str) -> io::Result<Artifact> {
        let encoder = GzEncoder::new(Vec::new(), Compression::default());
        let mut builder = tar::Builder::new(encoder);

        let mut header = tar::Header::new_gnu();
        header.set_size(package_yaml.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, PACKAGE_STREAM, package_yaml.as_bytes())?;

        let mut encoder = builder.into_inner()?;
        encoder.flush()?;
        let layer = encoder.finish()?;
        Ok(Artifact {
            digest: sha256_digest(&layer),
            layer,
        })
    }
}

/// A fetched and decoded package. Identity for caching is
/// `(registry, version)`; `sha` is the artifact digest.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedPackage {
    pub meta: PackageMeta,
    pub package_type: PackageType,
    pub sha: String,
    /// Fully-qualified `registry/repository`.
    pub registry: String,
    /// Tag or digest.
    pub version: String,
}

impl ParsedPackage {
    /// Decodes `artifact`, fetched for the concrete `reference`.
    ///
    /// # Errors
    /// [`DepError::InvalidPackage`] when the layer is not a readable archive,
    /// holds no `package.yaml`, or the stream has no package-metadata
    /// document of a known kind.
    pub fn parse(reference: &PackageRef, artifact: &Artifact) -> Result<ParsedPackage> {
        let stream = read_package_stream(&artifact.layer)?;
        let meta = find_meta(&stream)?;
        let package_type = PackageType::from_kind(&meta.kind);
        if package_type == PackageType::Unknown {
            return Err(DepError::InvalidPackage(format!(
                "unsupported package kind '{}'",
                meta.kind
            )));
        }

        Ok(ParsedPackage {
            meta,
            package_type,
            sha: artifact.digest.clone(),
            registry: reference.name(),
            version: reference.identifier().to_string(),
        })
    }

    pub fn digest(&self) -> &str {
        &self.sha
    }

    pub fn name(&self) -> &str {
        &self.meta.metadata.name
    }

    /// The concrete reference this package was fetched from.
    pub fn reference(&self) -> Result<PackageRef> {
        if self.version.starts_with("sha256:") {
            PackageRef::parse(&format!("{}@{}", self.registry, self.version))
        } else {
            PackageRef::parse(&format!("{}:{}", self.registry, self.version))
        }
    }

    /// Dependencies this package declares on other packages.
    pub fn dependencies(&self) -> Result<Vec<Dependency>> {
        self.meta.depends_on()
    }
}

fn read_package_stream(layer: &[u8]) -> Result<String> {
    let invalid = |e: io::Error| DepError::InvalidPackage(format!("unreadable layer: {e}"));

    let reader: Box<dyn Read + '_> = if layer.starts_with(&[0x1f, 0x8b]) {
        Box::new(GzDecoder::new(layer))
    } else {
        Box::new(layer)
    };
    let mut archive = tar::Archive::new(reader);

    for entry in archive.entries().map_err(invalid)? {
        let mut entry = entry.map_err(invalid)?;
        let is_stream = entry
            .path()
            .map_err(invalid)?
            .file_name()
            .is_some_and(|n| n == PACKAGE_STREAM);
        if is_stream {
            let mut stream = String::new();
            entry.read_to_string(&mut stream).map_err(invalid)?;
            return Ok(stream);
        }
    }
    Err(DepError::InvalidPackage(format!("layer has no {PACKAGE_STREAM}")))
}

fn find_meta(stream: &str) -> Result<PackageMeta> {
    for document in serde_yaml::Deserializer::from_str(stream) {
        let value = serde_yaml::Value::deserialize(document)
            .map_err(|e| DepError::InvalidPackage(format!("malformed {PACKAGE_STREAM}: {e}")))?;
        let is_meta = value
            .get("apiVersion")
            .and_then(serde_yaml::Value::as_str)
            .is_some_and(|v| v.starts_with(&format!("{META_API_GROUP}/")));
        if is_meta {
            return serde_yaml::from_value(value)
                .map_err(|e| DepError::InvalidPackage(format!("malformed package metadata: {e}")));
        }
    }
    Err(DepError::InvalidPackage(
        "no package metadata document found".to_string(),
    ))
}
