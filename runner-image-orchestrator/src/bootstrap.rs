//! Shared cloud resources: security group, builder keypair, seed images.
//!
//! Many builder processes may bootstrap the same account at once. There is no
//! lock; every create is keyed by a well-known name (or a derived image id) and a
//! conflict from the cloud means another builder got there first.

use crate::cloud_image::SeedImageSource;
use crate::error::{BuildError, BuildResult};
use crate::settings::BuilderSettings;
use crate::wait::{poll_until, Probe, WaitError};
use runner_image_common::naming::{
    self, ARCHITECTURE_PROPERTY, BUILDER_KEYPAIR_NAME, SHARED_SECURITY_GROUP_DESCRIPTION,
    SHARED_SECURITY_GROUP_NAME,
};
use runner_image_common::{Arch, BaseImage, ImageStatus, SharedResources};
use runner_image_providers::inventory::{Image, ImageCreate, SecurityGroup, SecurityGroupRule};
use runner_image_providers::{CloudProvider, ProviderError};
use std::collections::BTreeMap;
use std::path::Path;
use tokio_util::sync::CancellationToken;

pub struct Bootstrapper<'a> {
    cloud: &'a dyn CloudProvider,
    settings: &'a BuilderSettings,
    seeds: &'a dyn SeedImageSource,
    cancel: &'a CancellationToken,
}

impl<'a> Bootstrapper<'a> {
    pub fn new(
        cloud: &'a dyn CloudProvider,
        settings: &'a BuilderSettings,
        seeds: &'a dyn SeedImageSource,
        cancel: &'a CancellationToken,
    ) -> Self {
        Self {
            cloud,
            settings,
            seeds,
            cancel,
        }
    }

    /// Ensure shared resources for every supported base release of `arch`.
    pub async fn initialize(&self, arch: Arch) -> BuildResult<Vec<SharedResources>> {
        tracing::info!(
            "[bootstrap] initializing cloud {} for {}",
            self.cloud.cloud_name(),
            arch
        );
        let mut out = Vec::with_capacity(BaseImage::ALL.len());
        for base in BaseImage::ALL {
            out.push(self.ensure(arch, base).await?);
        }
        Ok(out)
    }

    /// Ensure the resources one build of (arch, base) needs. Safe to call concurrently.
    pub async fn ensure(&self, arch: Arch, base: BaseImage) -> BuildResult<SharedResources> {
        let group = self.ensure_security_group().await?;
        self.ensure_keypair().await?;
        let seed_image_id = self.ensure_seed_image(arch, base).await?;
        Ok(SharedResources {
            seed_image_id,
            keypair_name: BUILDER_KEYPAIR_NAME.to_string(),
            security_group_id: group.id,
            security_group_name: group.name,
        })
    }

    async fn ensure_keypair(&self) -> BuildResult<()> {
        let map = |e: ProviderError| BuildError::bootstrap("keypair", e);
        if self
            .cloud
            .get_keypair(BUILDER_KEYPAIR_NAME)
            .await
            .map_err(map)?
            .is_some()
        {
            tracing::debug!("[bootstrap] keypair {} exists", BUILDER_KEYPAIR_NAME);
            return Ok(());
        }
        match self.cloud.create_keypair(BUILDER_KEYPAIR_NAME).await {
            Ok(keypair) => {
                tracing::info!("[bootstrap] created keypair {}", BUILDER_KEYPAIR_NAME);
                if let Some(private_key) = keypair.private_key {
                    write_private_key(&self.settings.keypair_path, &private_key)
                        .await
                        .map_err(|e| BuildError::bootstrap("keypair", format!("{:#}", e)))?;
                }
                Ok(())
            }
            Err(e) if e.is_conflict() => {
                tracing::info!(
                    "[bootstrap] keypair {} created concurrently by another builder",
                    BUILDER_KEYPAIR_NAME
                );
                Ok(())
            }
            Err(e) => Err(map(e)),
        }
    }

    async fn ensure_security_group(&self) -> BuildResult<SecurityGroup> {
        let map = |e: ProviderError| BuildError::bootstrap("security group", e);
        let mut groups = self
            .cloud
            .list_security_groups(SHARED_SECURITY_GROUP_NAME)
            .await
            .map_err(map)?;

        if groups.is_empty() {
            let group = self
                .cloud
                .create_security_group(SHARED_SECURITY_GROUP_NAME, SHARED_SECURITY_GROUP_DESCRIPTION)
                .await
                .map_err(map)?;
            tracing::info!(
                "[bootstrap] created security group {} ({})",
                group.name,
                group.id
            );
            // Re-list to see groups other builders created at the same time.
            groups = self
                .cloud
                .list_security_groups(SHARED_SECURITY_GROUP_NAME)
                .await
                .map_err(map)?;
            if !groups.iter().any(|g| g.id == group.id) {
                groups.push(group);
            }
        }

        let canonical = canonical_security_group(&groups)
            .cloned()
            .ok_or_else(|| BuildError::bootstrap("security group", "no security group found"))?;

        // Every builder removes the duplicates it sees, whoever created them.
        for extra in groups.iter().filter(|g| g.id != canonical.id) {
            tracing::info!(
                "[bootstrap] deleting duplicate security group {} (keeping {})",
                extra.id,
                canonical.id
            );
            match self.cloud.delete_security_group(&extra.id).await {
                Ok(()) => {}
                // Already gone, or still attached to another builder's VM.
                Err(e) if e.is_not_found() || e.is_conflict() => {
                    tracing::debug!(
                        "[bootstrap] skipped duplicate security group {}: {}",
                        extra.id,
                        e
                    )
                }
                Err(e) => tracing::warn!(
                    "[bootstrap] failed to delete duplicate security group {}: {}",
                    extra.id,
                    e
                ),
            }
        }

        for rule in [
            SecurityGroupRule::ingress_icmp_v4(),
            SecurityGroupRule::ingress_tcp_v4(22),
        ] {
            match self
                .cloud
                .create_security_group_rule(&canonical.id, &rule)
                .await
            {
                Ok(()) => tracing::debug!(
                    "[bootstrap] added {} {} rule to {}",
                    rule.direction,
                    rule.protocol,
                    canonical.id
                ),
                Err(e) if e.is_conflict() => {}
                Err(e) => return Err(map(e)),
            }
        }
        Ok(canonical)
    }

    async fn ensure_seed_image(&self, arch: Arch, base: BaseImage) -> BuildResult<String> {
        let map = |e: ProviderError| BuildError::bootstrap("seed image", e);
        let id = naming::seed_image_id(arch, base, self.settings.seed_generation).to_string();
        let name = naming::seed_image_name(arch, base);

        let image = match self.cloud.get_image(&id).await.map_err(map)? {
            Some(image) => image,
            None => {
                let mut properties = BTreeMap::new();
                properties.insert(
                    ARCHITECTURE_PROPERTY.to_string(),
                    arch.to_openstack().to_string(),
                );
                let request = ImageCreate {
                    id: Some(id.clone()),
                    name: name.clone(),
                    disk_format: "qcow2".to_string(),
                    container_format: "bare".to_string(),
                    properties,
                };
                match self.cloud.create_image(&request).await {
                    Ok(image) => {
                        tracing::info!("[bootstrap] created seed image record {} ({})", name, id);
                        image
                    }
                    Err(e) if e.is_conflict() => {
                        self.cloud.get_image(&id).await.map_err(map)?.ok_or_else(|| {
                            BuildError::bootstrap(
                                "seed image",
                                format!(
                                    "image id {} was used by a deleted image; raise IMAGE_BUILDER_SEED_GENERATION to re-seed",
                                    id
                                ),
                            )
                        })?
                    }
                    Err(e) => return Err(map(e)),
                }
            }
        };

        match &image.status {
            ImageStatus::Active => return Ok(id),
            ImageStatus::Queued => self.upload_seed(&image, arch, base).await?,
            status if status.is_failed() => {
                return Err(BuildError::bootstrap(
                    "seed image",
                    format!(
                        "seed image {} is {}; delete it and raise IMAGE_BUILDER_SEED_GENERATION",
                        id, status
                    ),
                ))
            }
            _ => {}
        }

        let cloud = self.cloud;
        let wait_id = id.clone();
        poll_until("seed image", self.settings.seed_upload, self.cancel, || {
            let id = wait_id.clone();
            async move {
                Ok::<_, ProviderError>(match cloud.get_image(&id).await? {
                    Some(i) if i.status == ImageStatus::Active => Probe::Ready(()),
                    Some(i) if i.status.is_failed() => {
                        Probe::Failed(format!("seed image {} is {}", id, i.status))
                    }
                    Some(_) => Probe::Pending,
                    None => Probe::Failed(format!("seed image {} disappeared", id)),
                })
            }
        })
        .await
        .map_err(|e: WaitError<ProviderError>| match e {
            WaitError::Cancelled => BuildError::Cancelled,
            other => BuildError::bootstrap("seed image", other),
        })?;
        tracing::info!("[bootstrap] seed image {} ({}) is active", name, id);
        Ok(id)
    }

    /// Upload data into a queued seed image. Losing the upload race is fine.
    async fn upload_seed(&self, image: &Image, arch: Arch, base: BaseImage) -> BuildResult<()> {
        let dir = tempfile::Builder::new()
            .prefix("image-builder-seed-")
            .tempdir_in(&self.settings.work_dir)
            .map_err(|e| BuildError::bootstrap("seed image", e))?;
        let path = self
            .seeds
            .fetch(arch, base, dir.path())
            .await
            .map_err(|e| BuildError::bootstrap("seed image", format!("{:#}", e)))?;
        tracing::info!(
            "[bootstrap] uploading seed image {} from {}",
            image.id,
            path.display()
        );
        match self.cloud.upload_image_data(&image.id, &path).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_conflict() => {
                tracing::info!(
                    "[bootstrap] seed image {} is being uploaded by another builder",
                    image.id
                );
                Ok(())
            }
            Err(e) => Err(BuildError::bootstrap("seed image", e)),
        }
    }
}

/// The group every builder agrees to use: earliest created, ties broken by id.
/// Groups without a creation time sort after all dated ones.
pub fn canonical_security_group(groups: &[SecurityGroup]) -> Option<&SecurityGroup> {
    groups
        .iter()
        .min_by_key(|g| (g.created_at.is_none(), g.created_at, &g.id))
}

async fn write_private_key(path: &Path, private_key: &str) -> anyhow::Result<()> {
    use anyhow::Context;

    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    // An older key file is read-only; replace it.
    match tokio::fs::remove_file(path).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e).with_context(|| format!("failed to remove {}", path.display())),
    }
    let mut options = tokio::fs::OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    options.mode(0o400);
    let mut file = options
        .open(path)
        .await
        .with_context(|| format!("failed to create {}", path.display()))?;
    tokio::io::AsyncWriteExt::write_all(&mut file, private_key.as_bytes()).await?;
    tracing::info!("[bootstrap] wrote builder private key to {}", path.display());
    Ok(())
}
