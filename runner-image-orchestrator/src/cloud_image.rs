//! Where seed images come from: Ubuntu cloud images, verified against the
//! published `SHA256SUMS`, or an operator-supplied local file.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::Client;
use runner_image_common::{Arch, BaseImage};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::AsyncWriteExt;

#[async_trait]
pub trait SeedImageSource: Send + Sync {
    /// Produce a local disk image file for (arch, base) inside `dir`.
    async fn fetch(&self, arch: Arch, base: BaseImage, dir: &Path) -> Result<PathBuf>;
}

pub fn cloud_image_file_name(arch: Arch, base: BaseImage) -> String {
    format!(
        "{}-server-cloudimg-{}.img",
        base.as_str(),
        arch.cloud_image_arch()
    )
}

/// Find the checksum for `file_name` in a `SHA256SUMS` listing.
///
/// Lines look like `<hex> *<file>` (binary mode) or `<hex>  <file>`.
pub fn parse_sha256sums(listing: &str, file_name: &str) -> Option<String> {
    listing.lines().find_map(|line| {
        let (hash, rest) = line.trim().split_once(char::is_whitespace)?;
        let name = rest.trim_start().trim_start_matches('*');
        (name == file_name && hash.len() == 64).then(|| hash.to_ascii_lowercase())
    })
}

pub struct UbuntuCloudImages {
    client: Client,
    base_url: String,
}

impl UbuntuCloudImages {
    pub fn new(base_url: &str) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn release_url(&self, base: BaseImage) -> String {
        format!("{}/{}/current", self.base_url, base.as_str())
    }

    async fn expected_checksum(&self, base: BaseImage, file_name: &str) -> Result<String> {
        let url = format!("{}/SHA256SUMS", self.release_url(base));
        let listing = self
            .client
            .get(&url)
            .timeout(Duration::from_secs(60))
            .send()
            .await?
            .error_for_status()
            .with_context(|| format!("failed to fetch {}", url))?
            .text()
            .await?;
        parse_sha256sums(&listing, file_name)
            .with_context(|| format!("{} has no entry for {}", url, file_name))
    }
}

#[async_trait]
impl SeedImageSource for UbuntuCloudImages {
    async fn fetch(&self, arch: Arch, base: BaseImage, dir: &Path) -> Result<PathBuf> {
        let file_name = cloud_image_file_name(arch, base);
        let expected = self.expected_checksum(base, &file_name).await?;
        let url = format!("{}/{}", self.release_url(base), file_name);
        let path = dir.join(&file_name);
        tracing::info!("[seed] downloading {} to {}", url, path.display());

        let resp = self
            .client
            .get(&url)
            .send()
            .await?
            .error_for_status()
            .with_context(|| format!("failed to download {}", url))?;
        let mut file = tokio::fs::File::create(&path)
            .await
            .with_context(|| format!("failed to create {}", path.display()))?;
        let mut hasher = Sha256::new();
        let mut stream = resp.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.with_context(|| format!("download of {} interrupted", url))?;
            hasher.update(&chunk);
            file.write_all(&chunk).await?;
        }
        file.flush().await?;

        let actual = hex::encode(hasher.finalize());
        if actual != expected {
            let _ = tokio::fs::remove_file(&path).await;
            bail!(
                "checksum mismatch for {}: expected {}, got {}",
                file_name,
                expected,
                actual
            );
        }
        tracing::info!("[seed] verified {} (sha256 {})", file_name, actual);
        Ok(path)
    }
}

/// A disk image already on local disk, used as-is for every (arch, base).
pub struct LocalSeedImage {
    path: PathBuf,
}

impl LocalSeedImage {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl SeedImageSource for LocalSeedImage {
    async fn fetch(&self, arch: Arch, base: BaseImage, _dir: &Path) -> Result<PathBuf> {
        if !tokio::fs::try_exists(&self.path).await.unwrap_or(false) {
            bail!(
                "seed image file {} for {}/{} does not exist",
                self.path.display(),
                base,
                arch
            );
        }
        Ok(self.path.clone())
    }
}
