//! Where manifests, boot images and volumes come from.
//!
//! The lifecycle only needs three downloads, captured by [`PackageService`].
//! [`PackageSource`] picks the implementation from `[package]` in
//! `config.toml`: a local mirror directory wins over the HTTP service.

use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::{debug, info};
use url::Url;

use crate::config::PackageConfig;
use crate::error::{Error, Result};
use crate::manifest::Manifest;
use crate::paths::expand_home;
use crate::registry::ProjectName;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(300);

#[allow(async_fn_in_trait)]
pub trait PackageService {
    async fn load_manifest(&self, name: &ProjectName) -> Result<Manifest>;

    /// The boot image of `name`.
    async fn download(&self, name: &ProjectName) -> Result<Vec<u8>>;

    async fn download_volume(&self, id: u64) -> Result<Vec<u8>>;
}

/// Path segments of a project below the service root.
fn project_segments(name: &ProjectName) -> Vec<&str> {
    match name.owner() {
        Some(owner) => vec!["community", owner, name.image()],
        None => vec!["projects", name.image()],
    }
}

// ---------------------------------------------------------------------------
// HTTP
// ---------------------------------------------------------------------------

/// Package service reached over HTTP.
///
/// ```text
/// GET {base}/projects/{name}/manifest | image
/// GET {base}/community/{owner}/{image}/manifest | image
/// GET {base}/volumes/{id}
/// ```
#[derive(Debug, Clone)]
pub struct HttpPackageService {
    client: reqwest::Client,
    base: Url,
    token: Option<String>,
}

impl HttpPackageService {
    /// `token_file` holds the API token; a missing file means anonymous
    /// requests.
    pub fn new(base: &str, token_file: &Path) -> Result<Self> {
        let base = Url::parse(base).map_err(|e| Error::package(base, e))?;
        if base.cannot_be_a_base() {
            return Err(Error::package(base.as_str(), "not a hierarchical URL"));
        }

        let token = match std::fs::read_to_string(token_file) {
            Ok(token) => Some(token.trim().to_string()).filter(|t| !t.is_empty()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => return Err(Error::io(token_file, e)),
        };

        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| Error::package(base.as_str(), e))?;

        debug!(base = %base, authenticated = token.is_some(), "http package service");
        Ok(Self {
            client,
            base,
            token,
        })
    }

    /// `base` with `segments` appended, each percent-encoded.
    pub fn endpoint(&self, segments: &[&str]) -> Url {
        let mut url = self.base.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    async fn get(&self, resource: &str, url: Url) -> Result<reqwest::Response> {
        let mut request = self.client.get(url.clone());
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .map_err(|e| Error::package(resource, e))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::package(
                resource,
                format!("{url} returned {status}: {}", body.trim()),
            ));
        }
        Ok(response)
    }

    async fn get_bytes(&self, resource: &str, url: Url) -> Result<Vec<u8>> {
        let bytes = self
            .get(resource, url)
            .await?
            .bytes()
            .await
            .map_err(|e| Error::package(resource, e))?;
        debug!(resource, bytes = bytes.len(), "downloaded");
        Ok(bytes.to_vec())
    }
}

impl PackageService for HttpPackageService {
    async fn load_manifest(&self, name: &ProjectName) -> Result<Manifest> {
        let resource = format!("manifest of {name}");
        let mut segments = project_segments(name);
        segments.push("manifest");

        self.get(&resource, self.endpoint(&segments))
            .await?
            .json::<Manifest>()
            .await
            .map_err(|e| Error::package(&resource, e))
    }

    async fn download(&self, name: &ProjectName) -> Result<Vec<u8>> {
        let mut segments = project_segments(name);
        segments.push("image");
        self.get_bytes(&format!("image of {name}"), self.endpoint(&segments))
            .await
    }

    async fn download_volume(&self, id: u64) -> Result<Vec<u8>> {
        let id_segment = id.to_string();
        self.get_bytes(
            &format!("volume {id}"),
            self.endpoint(&["volumes", id_segment.as_str()]),
        )
        .await
    }
}

// ---------------------------------------------------------------------------
// Local mirror
// ---------------------------------------------------------------------------

/// Package service backed by a directory:
///
/// ```text
/// <mirror>/<name>/{manifest,image}
/// <mirror>/<owner>/<image>/{manifest,image}
/// <mirror>/volumes/vol<id>
/// ```
#[derive(Debug, Clone)]
pub struct MirrorPackageService {
    root: PathBuf,
}

impl MirrorPackageService {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn project_dir(&self, name: &ProjectName) -> PathBuf {
        match name.owner() {
            Some(owner) => self.root.join(owner).join(name.image()),
            None => self.root.join(name.image()),
        }
    }

    async fn read(&self, resource: &str, path: &Path) -> Result<Vec<u8>> {
        let bytes = tokio::fs::read(path).await.map_err(|e| {
            Error::package(resource, format!("{}: {e}", path.display()))
        })?;
        debug!(resource, path = %path.display(), bytes = bytes.len(), "read from mirror");
        Ok(bytes)
    }
}

impl PackageService for MirrorPackageService {
    async fn load_manifest(&self, name: &ProjectName) -> Result<Manifest> {
        let resource = format!("manifest of {name}");
        let bytes = self
            .read(&resource, &self.project_dir(name).join("manifest"))
            .await?;
        Manifest::from_slice(&bytes).map_err(|e| Error::package(resource, e))
    }

    async fn download(&self, name: &ProjectName) -> Result<Vec<u8>> {
        self.read(
            &format!("image of {name}"),
            &self.project_dir(name).join("image"),
        )
        .await
    }

    async fn download_volume(&self, id: u64) -> Result<Vec<u8>> {
        self.read(
            &format!("volume {id}"),
            &self.root.join("volumes").join(format!("vol{id}")),
        )
        .await
    }
}

// ---------------------------------------------------------------------------
// Selection
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub enum PackageSource {
    Http(HttpPackageService),
    Mirror(MirrorPackageService),
    /// Every request fails with [`Error::PackageServiceUnconfigured`].
    Unconfigured,
}

impl PackageSource {
    pub fn from_config(config: &PackageConfig) -> Result<Self> {
        if let Some(mirror) = &config.mirror {
            let mirror = expand_home(mirror);
            info!(mirror = %mirror.display(), "using package mirror");
            return Ok(Self::Mirror(MirrorPackageService::new(mirror)));
        }
        if let Some(url) = &config.url {
            let token_file = expand_home(&config.token_file);
            return Ok(Self::Http(HttpPackageService::new(url, &token_file)?));
        }
        Ok(Self::Unconfigured)
    }
}

impl PackageService for PackageSource {
    async fn load_manifest(&self, name: &ProjectName) -> Result<Manifest> {
        match self {
            Self::Http(service) => service.load_manifest(name).await,
            Self::Mirror(service) => service.load_manifest(name).await,
            Self::Unconfigured => Err(Error::PackageServiceUnconfigured),
        }
    }

    async fn download(&self, name: &ProjectName) -> Result<Vec<u8>> {
        match self {
            Self::Http(service) => service.download(name).await,
            Self::Mirror(service) => service.download(name).await,
            Self::Unconfigured => Err(Error::PackageServiceUnconfigured),
        }
    }

    async fn download_volume(&self, id: u64) -> Result<Vec<u8>> {
        match self {
            Self::Http(service) => service.download_volume(id).await,
            Self::Mirror(service) => service.download_volume(id).await,
            Self::Unconfigured => Err(Error::PackageServiceUnconfigured),
        }
    }
}
