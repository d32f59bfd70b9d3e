use std::collections::HashMap;
use std::sync::{LazyLock, Mutex};
use regex::Regex;
use reqwest::StatusCode;
use reqwest::blocking::{Client, Response};
use reqwest::header::{ACCEPT, LINK, WWW_AUTHENTICATE};
use serde::Deserialize;
use tracing::debug;
use crate::config::RegistryConfig;
use crate::error::{DepError, Result};
use crate::reference::{DEFAULT_REGISTRY, PackageRef};
use crate::resolver::Resolver;
use crate::util::sha256_digest;
use crate::xpkg::Artifact;

const USER_AGENT: &str = concat!("xpdep/", env!("CARGO_PKG_VERSION"));
/// API host behind the canonical Docker Hub name.
const DOCKER_HUB_API: &str = "registry-1.docker.io";
/// Layer annotation Crossplane uses to mark the package layer.
const XPKG_ANNOTATION: &str = "io.crossplane.xpkg";
const XPKG_BASE_LAYER: &str = "base";
const CONTENT_DIGEST: &str = "docker-content-digest";

const MANIFEST_TYPES: &[&str] = &[
    "application/vnd.oci.image.manifest.v1+json",
    "application/vnd.docker.distribution.manifest.v2+json",
    "application/vnd.oci.image.index.v1+json",
    "application/vnd.docker.distribution.manifest.list.v2+json",
];

static CHALLENGE_PARAM_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"(\w+)="([^"]*)""#).expect("challenge pattern is valid"));
static NEXT_LINK_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"<([^>]+)>;\s*rel="?next"?"#).expect("link pattern is valid"));

#[derive(Debug, Deserialize)]
struct TagList {
    #[serde(default)]
    tags: Option<Vec<String>>,
}

/// An image manifest or an image index; only the fields used here.
#[derive(Debug, Deserialize)]
struct Manifest {
    #[serde(default)]
    manifests: Vec<Descriptor>,
    #[serde(default)]
    layers: Vec<Descriptor>,
}

#[derive(Debug, Clone, Deserialize)]
struct Descriptor {
    digest: String,
    #[serde(default)]
    annotations: HashMap<String, String>,
    #[serde(default)]
    platform: Option<Platform>,
}

#[derive(Debug, Clone, Deserialize)]
struct Platform {
    architecture: String,
    os: String,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    token: Option<String>,
    access_token: Option<String>,
}

/// Resolves packages against OCI distribution (v2) registries.
///
/// Anonymous pulls follow the registry's bearer challenge; a configured token
/// is sent up front instead.
pub struct RegistryResolver {
    client: Client,
    token: Option<String>,
    tokens: Mutex<HashMap<String, String>>,
}

impl RegistryResolver {
    pub fn new(config: &RegistryConfig) -> Result<RegistryResolver> {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(config.timeout())
            .danger_accept_invalid_certs(config.insecure_skip_tls_verify)
            .build()
            .map_err(|e| DepError::InvalidConfig(format!("cannot build HTTP client: {e}")))?;
        Ok(RegistryResolver {
            client,
            token: config.token.clone(),
            tokens: Mutex::new(HashMap::new()),
        })
    }

    fn get(&self, reference: &PackageRef, url: &str, accept: &[&str]) -> std::result::Result<Response, String> {
        let send = |token: Option<&str>| {
            let mut request = self.client.get(url);
            if !accept.is_empty() {
                request = request.header(ACCEPT, accept.join(", "));
            }
            if let Some(token) = token {
                request = request.bearer_auth(token);
            }
            request.send().map_err(|e| e.to_string())
        };

        debug!(url, "registry request");
        let response = send(self.bearer(reference).as_deref())?;
        if response.status() != StatusCode::UNAUTHORIZED {
            return check_status(response);
        }

        let challenge = response
            .headers()
            .get(WWW_AUTHENTICATE)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| "registry requires authentication".to_string())?
            .to_string();
        let token = self.fetch_token(&challenge, reference.repository())?;
        self.tokens
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(reference.name(), token.clone());

        check_status(send(Some(&token))?)
    }

    fn bearer(&self, reference: &PackageRef) -> Option<String> {
        self.token.clone().or_else(|| {
            self.tokens
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .get(&reference.name())
                .cloned()
        })
    }

    fn fetch_token(&self, challenge: &str, repository: &str) -> std::result::Result<String, String> {
        let params = parse_challenge(challenge)?;
        let realm = params
            .get("realm")
            .ok_or_else(|| "authentication challenge has no realm".to_string())?;
        let scope = params
            .get("scope")
            .cloned()
            .unwrap_or_else(|| format!("repository:{repository}:pull"));

        let mut request = self.client.get(realm).query(&[("scope", scope.as_str())]);
        if let Some(service) = params.get("service") {
            request = request.query(&[("service", service.as_str())]);
        }
        let response: TokenResponse = request
            .send()
            .and_then(Response::error_for_status)
            .and_then(Response::json)
            .map_err(|e| format!("token request failed: {e}"))?;
        response
            .token
            .or(response.access_token)
            .ok_or_else(|| "token response contains no token".to_string())
    }

    fn manifest(&self, reference: &PackageRef, identifier: &str) -> std::result::Result<(Manifest, String), String> {
        let url = format!(
            "{}/v2/{}/manifests/{identifier}",
            origin(reference.registry()),
            reference.repository()
        );
        let response = self.get(reference, &url, MANIFEST_TYPES)?;
        let header_digest = response
            .headers()
            .get(CONTENT_DIGEST)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = response.bytes().map_err(|e| e.to_string())?;
        let digest = header_digest.unwrap_or_else(|| sha256_digest(&body));
        let manifest = serde_json::from_slice(&body).map_err(|e| format!("malformed manifest: {e}"))?;
        Ok((manifest, digest))
    }
}

impl Resolver for RegistryResolver {
    fn tags(&self, package: &PackageRef) -> Result<Vec<String>> {
        let fail = |reason: String| DepError::resolution(&package.name(), "*", reason);
        let origin = origin(package.registry());
        let mut url = format!("{origin}/v2/{}/tags/list", package.repository());
        let mut tags = Vec::new();

        loop {
            let response = self.get(package, &url, &[]).map_err(fail)?;
            let next = response
                .headers()
                .get(LINK)
                .and_then(|v| v.to_str().ok())
                .and_then(next_link);
            let page: TagList = response.json().map_err(|e| fail(format!("malformed tag list: {e}")))?;
            tags.extend(page.tags.unwrap_or_default());
            match next {
                Some(link) if link.starts_with("http") => url = link,
                Some(link) => url = format!("{origin}{link}"),
                None => break,
            }
        }
        debug!(package = %package, count = tags.len(), "listed tags");
        Ok(tags)
    }

    fn fetch(&self, reference: &PackageRef) -> Result<Artifact> {
        let fail = |reason: String| DepError::resolution(&reference.name(), reference.identifier(), reason);

        let (mut manifest, digest) = self.manifest(reference, reference.identifier()).map_err(fail)?;
        if let Some(child) = select_manifest(&manifest.manifests) {
            let (image, _) = self.manifest(reference, &child.digest).map_err(fail)?;
            manifest = image;
        }

        let layer = select_layer(&manifest.layers)
            .ok_or_else(|| fail("manifest has no layers".to_string()))?;
        let url = format!(
            "{}/v2/{}/blobs/{}",
            origin(reference.registry()),
            reference.repository(),
            layer.digest
        );
        let bytes = self
            .get(reference, &url, &[])
            .and_then(|r| r.bytes().map_err(|e| e.to_string()))
            .map_err(fail)?;

        let actual = sha256_digest(&bytes);
        if actual != layer.digest {
            return Err(fail(format!(
                "layer digest mismatch: expected {}, got {actual}",
                layer.digest
            )));
        }
        debug!(reference = %reference, %digest, size = bytes.len(), "fetched package layer");
        Ok(Artifact {
            digest,
            layer: bytes.to_vec(),
        })
    }
}

fn check_status(response: Response) -> std::result::Result<Response, String> {
    let status = response.status();
    if status.is_success() {
        Ok(response)
    } else {
        Err(format!("registry returned {status}"))
    }
}

/// Scheme and host for a registry. Local registries are plain HTTP.
fn origin(registry: &str) -> String {
    let host = if registry == DEFAULT_REGISTRY {
        DOCKER_HUB_API
    } else {
        registry
    };
    if host.starts_with("localhost") || host.starts_with("127.0.0.1") {
        format!("http://{host}")
    } else {
        format!("https://{host}")
    }
}

fn parse_challenge(challenge: &str) -> std::result::Result<HashMap<String, String>, String> {
    let (scheme, params) = challenge
        .trim()
        .split_once(' ')
        .ok_or_else(|| format!("malformed authentication challenge '{challenge}'"))?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return Err(format!("unsupported authentication scheme '{scheme}'"));
    }
    Ok(CHALLENGE_PARAM_RE
        .captures_iter(params)
        .map(|c| (c[1].to_lowercase(), c[2].to_string()))
        .collect())
}

fn next_link(header: &str) -> Option<String> {
    NEXT_LINK_RE.captures(header).map(|c| c[1].to_string())
}

/// Prefers linux/amd64 in an image index, falling back to the first entry.
fn select_manifest(manifests: &[Descriptor]) -> Option<&Descriptor> {
    manifests
        .iter()
        .find(|m| {
            m.platform
                .as_ref()
                .is_some_and(|p| p.os == "linux" && p.architecture == "amd64")
        })
        .or_else(|| manifests.first())
}

/// The layer annotated as the package base layer, else the only or last layer.
fn select_layer(layers: &[Descriptor]) -> Option<&Descriptor> {
    layers
        .iter()
        .find(|l| l.annotations.get(XPKG_ANNOTATION).is_some_and(|v| v == XPKG_BASE_LAYER))
        .or_else(|| layers.last())
}
