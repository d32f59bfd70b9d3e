use std::fmt;
use serde::{Deserialize, Serialize};
use crate::error::{DepError, Result};
use crate::reference::PackageRef;

/// Constraint used when a package is added without a version: the highest
/// released version.
pub const DEFAULT_CONSTRAINT: &str = ">=v0.0.0";

/// Kind of Crossplane package.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum PackageType {
    Provider,
    Configuration,
    #[default]
    Unknown,
}

impl PackageType {
    /// Classifies a package-metadata `kind`.
    pub fn from_kind(kind: &str) -> PackageType {
        match kind {
            "Provider" => PackageType::Provider,
            "Configuration" => PackageType::Configuration,
            _ => PackageType::Unknown,
        }
    }
}

impl fmt::Display for PackageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PackageType::Provider => "Provider",
            PackageType::Configuration => "Configuration",
            PackageType::Unknown => "Unknown",
        };
        f.write_str(s)
    }
}

/// A declared requirement on a package.
///
/// `package` is a registry/repository path without tag. `constraints` is a
/// semver range, an exact version, a literal tag such as `latest`, or a
/// `sha256:` digest. A pinned dependency carries the concrete tag or digest.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Dependency {
    pub package: String,
    #[serde(rename = "type")]
    pub package_type: PackageType,
    pub constraints: String,
}

impl Dependency {
    pub fn new(package: &str, package_type: PackageType, constraints: &str) -> Dependency {
        Dependency {
            package: package.to_string(),
            package_type,
            constraints: constraints.to_string(),
        }
    }

    /// Parses the command line form `<package>[@<constraint>]`.
    ///
    /// The package is validated before anything touches the network; a
    /// missing constraint becomes [`DEFAULT_CONSTRAINT`].
    ///
    /// # Example
    ///
    /// ```
    /// use xpdep::Dependency;
    ///
    /// let dep = Dependency::parse("crossplane/provider-aws@v0.20.1-alpha").unwrap();
    /// assert_eq!(dep.package, "crossplane/provider-aws");
    /// assert_eq!(dep.constraints, "v0.20.1-alpha");
    /// ```
    pub fn parse(package_at_version: &str) -> Result<Dependency> {
        let (package, constraints) = match package_at_version.split_once('@') {
            Some((package, constraints)) => {
                if constraints.trim().is_empty() {
                    return Err(DepError::invalid_reference(
                        package_at_version,
                        "version after '@' cannot be empty",
                    ));
                }
                (package, constraints.trim())
            }
            None => (package_at_version, DEFAULT_CONSTRAINT),
        };
        PackageRef::parse_repository(package)?;
        Ok(Dependency::new(package, PackageType::Unknown, constraints))
    }

    /// The reference this dependency names once its constraint is treated as
    /// a concrete tag or digest.
    pub fn reference(&self) -> Result<PackageRef> {
        if self.constraints.starts_with("sha256:") {
            PackageRef::parse(&format!("{}@{}", self.package, self.constraints))
        } else {
            PackageRef::parse(&format!("{}:{}", self.package, self.constraints))
        }
    }

    /// A copy of this dependency pinned to `version`.
    pub fn pinned(&self, version: &str, package_type: PackageType) -> Dependency {
        Dependency {
            package: self.package.clone(),
            package_type,
            constraints: version.to_string(),
        }
    }
}

impl fmt::Display for Dependency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.package, self.constraints)
    }
}
