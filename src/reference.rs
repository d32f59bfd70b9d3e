use std::fmt;
use std::sync::LazyLock;
use regex::Regex;
use crate::error::{DepError, Result};

/// Fully-qualified hostname of the default registry.
pub const DEFAULT_REGISTRY: &str = "index.docker.io";
/// Short alias users write for the default registry.
pub const DEFAULT_REGISTRY_ALIAS: &str = "docker.io";
/// Tag assumed when a reference names neither a tag nor a digest.
pub const DEFAULT_TAG: &str = "latest";

static REPOSITORY_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-z0-9]+(?:(?:[._]|__|-+)[a-z0-9]+)*(?:/[a-z0-9]+(?:(?:[._]|__|-+)[a-z0-9]+)*)*$")
        .expect("repository pattern is valid")
});
static HOST_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-zA-Z0-9](?:[a-zA-Z0-9-]*[a-zA-Z0-9])?(?:\.[a-zA-Z0-9](?:[a-zA-Z0-9-]*[a-zA-Z0-9])?)*(?::[0-9]{1,5})?$")
        .expect("host pattern is valid")
});
static TAG_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[\w][\w.-]{0,127}$").expect("tag pattern is valid"));
static DIGEST_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^sha256:[a-f0-9]{64}$").expect("digest pattern is valid"));

/// What a reference points at inside a repository.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Identifier {
    Tag(String),
    Digest(String),
}

impl Identifier {
    pub fn as_str(&self) -> &str {
        match self {
            Identifier::Tag(t) => t,
            Identifier::Digest(d) => d,
        }
    }
}

/// A parsed OCI package reference: registry host, repository path and an
/// optional tag or digest.
///
/// The registry is always normalized, so `crossplane/provider-aws`,
/// `docker.io/crossplane/provider-aws` and
/// `index.docker.io/crossplane/provider-aws` compare equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PackageRef {
    registry: String,
    repository: String,
    identifier: Option<Identifier>,
}

impl PackageRef {
    /// Parses `[registry/]repository[:tag|@digest]`.
    ///
    /// # Errors
    /// Returns [`DepError::InvalidReference`] when any component is malformed.
    ///
    /// # Example
    ///
    /// ```
    /// use xpdep::PackageRef;
    ///
    /// let r = PackageRef::parse("crossplane/provider-aws:v0.20.1-alpha").unwrap();
    /// assert_eq!(r.registry(), "index.docker.io");
    /// assert_eq!(r.identifier(), "v0.20.1-alpha");
    /// ```
    pub fn parse(reference: &str) -> Result<PackageRef> {
        if reference.is_empty() {
            return Err(DepError::invalid_reference(reference, "reference is empty"));
        }

        let (name, identifier) = match reference.split_once('@') {
            Some((name, digest)) => {
                if !DIGEST_RE.is_match(digest) {
                    return Err(DepError::invalid_reference(
                        reference,
                        format!("invalid digest '{digest}'"),
                    ));
                }
                (name, Some(Identifier::Digest(digest.to_string())))
            }
            None => split_tag(reference)?,
        };

        let (registry, repository) = split_registry(name);
        if !HOST_RE.is_match(registry) {
            return Err(DepError::invalid_reference(
                reference,
                format!("invalid registry host '{registry}'"),
            ));
        }
        let registry = normalize_registry(registry);
        let repository = if registry == DEFAULT_REGISTRY && !repository.contains('/') {
            format!("library/{repository}")
        } else {
            repository.to_string()
        };

        if !REPOSITORY_RE.is_match(&repository) {
            return Err(DepError::invalid_reference(
                reference,
                format!("invalid repository '{repository}'"),
            ));
        }

        Ok(PackageRef {
            registry,
            repository,
            identifier,
        })
    }

    /// Parses a dependency package string, which must not carry a tag or digest.
    pub fn parse_repository(package: &str) -> Result<PackageRef> {
        let parsed = PackageRef::parse(package)?;
        if parsed.is_pinned() {
            return Err(DepError::invalid_reference(
                package,
                "package must not include a tag or digest",
            ));
        }
        Ok(parsed)
    }

    /// Same repository pinned to `tag`.
    pub fn with_tag(&self, tag: &str) -> Result<PackageRef> {
        if !TAG_RE.is_match(tag) {
            return Err(DepError::invalid_reference(tag, "invalid tag"));
        }
        Ok(PackageRef {
            registry: self.registry.clone(),
            repository: self.repository.clone(),
            identifier: Some(Identifier::Tag(tag.to_string())),
        })
    }

    pub fn registry(&self) -> &str {
        &self.registry
    }

    pub fn repository(&self) -> &str {
        &self.repository
    }

    /// `registry/repository`, without tag or digest.
    pub fn name(&self) -> String {
        format!("{}/{}", self.registry, self.repository)
    }

    /// The tag or digest, defaulting to `latest`.
    pub fn identifier(&self) -> &str {
        self.identifier
            .as_ref()
            .map(Identifier::as_str)
            .unwrap_or(DEFAULT_TAG)
    }

    pub fn is_pinned(&self) -> bool {
        self.identifier.is_some()
    }
}

impl fmt::Display for PackageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.identifier {
            Some(Identifier::Digest(d)) => write!(f, "{}@{}", self.name(), d),
            Some(Identifier::Tag(t)) => write!(f, "{}:{}", self.name(), t),
            None => write!(f, "{}", self.name()),
        }
    }
}

fn split_tag(reference: &str) -> Result<(&str, Option<Identifier>)> {
    let last_slash = reference.rfind('/').map(|i| i + 1).unwrap_or(0);
    match reference[last_slash..].rfind(':') {
        Some(i) => {
            let colon = last_slash + i;
            let tag = &reference[colon + 1..];
            if !TAG_RE.is_match(tag) {
                return Err(DepError::invalid_reference(
                    reference,
                    format!("invalid tag '{tag}'"),
                ));
            }
            Ok((&reference[..colon], Some(Identifier::Tag(tag.to_string()))))
        }
        None => Ok((reference, None)),
    }
}

/// A leading path component is a registry host when it looks like one.
fn split_registry(name: &str) -> (&str, &str) {
    match name.split_once('/') {
        Some((host, rest))
            if host.contains('.') || host.contains(':') || host == "localhost" =>
        {
            (host, rest)
        }
        _ => (DEFAULT_REGISTRY, name),
    }
}

fn normalize_registry(registry: &str) -> String {
    if registry == DEFAULT_REGISTRY_ALIAS {
        DEFAULT_REGISTRY.to_string()
    } else {
        registry.to_string()
    }
}
