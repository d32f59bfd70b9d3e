use std::sync::LazyLock;
use regex::Regex;
use semver::{Version, VersionReq};
use sha2::{Digest, Sha256};

static V_PREFIX_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(^|[=<>~^,\s])v(\d)").expect("v-prefix pattern is valid"));

/// Computes the OCI-style digest (`sha256:<hex>`) of `bytes`.
pub fn sha256_digest(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("sha256:{}", hex::encode(hasher.finalize()))
}

/// Parses a tag as a semantic version, tolerating a leading `v`.
pub fn parse_version(tag: &str) -> Option<Version> {
    Version::parse(tag.strip_prefix('v').unwrap_or(tag)).ok()
}

/// Parses a version constraint, tolerating `v` in front of version numbers
/// (`>=v0.0.0`, `~v1.2`).
pub fn parse_constraint(constraint: &str) -> Option<VersionReq> {
    let normalized = V_PREFIX_RE.replace_all(constraint.trim(), "$1$2");
    VersionReq::parse(&normalized).ok()
}

/// Returns the semver tags of `tags` in ascending version order.
/// Tags that are not versions are dropped.
pub fn sort_versions(tags: &[String]) -> Vec<(Version, String)> {
    let mut versions: Vec<_> = tags
        .iter()
        .filter_map(|t| parse_version(t).map(|v| (v, t.clone())))
        .collect();
    versions.sort_by(|(a, _), (b, _)| a.cmp(b));
    versions
}
