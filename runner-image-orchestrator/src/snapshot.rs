//! Image revisions: snapshot a finished builder VM, rotate old revisions,
//! look up the latest one and publish revisions to another cloud.

use crate::error::{BuildError, BuildResult, RotationWarning};
use crate::settings::BuilderSettings;
use crate::wait::{poll_until, PollPolicy, Probe, WaitError};
use chrono::Utc;
use runner_image_common::naming::{
    self, ARCHITECTURE_PROPERTY, FAMILY_PROPERTY, REVISION_PROPERTY,
};
use runner_image_common::{BuildVm, ImageConfig, ImageRevision, ImageStatus};
use runner_image_providers::inventory::{Image, ImageCreate, ImageFilter, SnapshotCreate};
use runner_image_providers::{CloudProvider, ProviderError};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Outcome of a rotation pass.
#[derive(Debug, Clone, Default)]
pub struct RotationReport {
    pub kept: Vec<ImageRevision>,
    pub deleted: Vec<ImageRevision>,
    pub warnings: Vec<RotationWarning>,
}

pub struct SnapshotManager<'a> {
    cloud: &'a Arc<dyn CloudProvider>,
    settings: &'a BuilderSettings,
    cancel: &'a CancellationToken,
}

impl<'a> SnapshotManager<'a> {
    pub fn new(
        cloud: &'a Arc<dyn CloudProvider>,
        settings: &'a BuilderSettings,
        cancel: &'a CancellationToken,
    ) -> Self {
        Self {
            cloud,
            settings,
            cancel,
        }
    }

    /// Turn the builder VM's disk into a new revision of `image.name` and wait for it.
    pub async fn snapshot(&self, vm: &BuildVm, image: &ImageConfig) -> BuildResult<ImageRevision> {
        let revision = naming::new_revision_suffix(Utc::now());
        let name = naming::revision_image_name(&image.name, &revision);
        let request = SnapshotCreate {
            name: name.clone(),
            properties: revision_properties(&image.name, &revision, image.arch.to_openstack()),
        };
        tracing::info!("[snapshot] creating image {} from VM {}", name, vm.id);
        let image_id = self
            .cloud
            .create_server_snapshot(&vm.id, &request)
            .await
            .map_err(|e| BuildError::Snapshot(format!("create image from VM {}: {}", vm.id, e)))?;

        match wait_image_active(self.cloud, &image_id, self.settings.snapshot, self.cancel).await {
            Ok(created) => {
                tracing::info!("[snapshot] image {} ({}) is ACTIVE", name, image_id);
                Ok(ImageRevision {
                    id: image_id,
                    name,
                    family: image.name.clone(),
                    revision,
                    created_at: created.created_at,
                })
            }
            Err(e) => {
                // A half-saved snapshot is never eligible for rotation; drop it now.
                match self.cloud.delete_image(&image_id).await {
                    Ok(()) => {}
                    Err(del) if del.is_not_found() => {}
                    Err(del) => tracing::warn!(
                        "[snapshot] failed to delete incomplete image {}: {}",
                        image_id,
                        del
                    ),
                }
                Err(match e {
                    WaitError::TimedOut(timeout) => BuildError::Snapshot(format!(
                        "image {} not ACTIVE after {:?}",
                        image_id, timeout
                    )),
                    WaitError::Failed(reason) => BuildError::Snapshot(reason),
                    WaitError::Cancelled => BuildError::Cancelled,
                    WaitError::Probe(e) => {
                        BuildError::Snapshot(format!("polling image {}: {}", image_id, e))
                    }
                })
            }
        }
    }
}

fn revision_properties(family: &str, revision: &str, arch: &str) -> BTreeMap<String, String> {
    let mut properties = BTreeMap::new();
    properties.insert(FAMILY_PROPERTY.to_string(), family.to_string());
    properties.insert(REVISION_PROPERTY.to_string(), revision.to_string());
    properties.insert(ARCHITECTURE_PROPERTY.to_string(), arch.to_string());
    properties
}

async fn wait_image_active(
    cloud: &Arc<dyn CloudProvider>,
    image_id: &str,
    policy: PollPolicy,
    cancel: &CancellationToken,
) -> Result<Image, WaitError<ProviderError>> {
    poll_until("image active", policy, cancel, || {
        let cloud = cloud.clone();
        let id = image_id.to_string();
        async move {
            Ok::<_, ProviderError>(match cloud.get_image(&id).await? {
                Some(i) if i.status == ImageStatus::Active => Probe::Ready(i),
                Some(i) if i.status.is_failed() => {
                    Probe::Failed(format!("image {} is {}", id, i.status))
                }
                Some(_) => Probe::Pending,
                None => Probe::Failed(format!("image {} disappeared", id)),
            })
        }
    })
    .await
}

/// Read a revision back from an image's properties. Images without them are not ours.
pub fn revision_from_image(image: &Image) -> Option<ImageRevision> {
    Some(ImageRevision {
        id: image.id.clone(),
        name: image.name.clone(),
        family: image.properties.get(FAMILY_PROPERTY)?.clone(),
        revision: image.properties.get(REVISION_PROPERTY)?.clone(),
        created_at: image.created_at,
    })
}

/// ACTIVE revisions of `family`, newest first (creation time, then revision suffix).
pub async fn list_revisions(
    cloud: &dyn CloudProvider,
    family: &str,
) -> Result<Vec<ImageRevision>, ProviderError> {
    let images = cloud
        .list_images(&ImageFilter::by_property(FAMILY_PROPERTY, family))
        .await?;
    let mut revisions: Vec<ImageRevision> = images
        .iter()
        .filter(|i| i.status == ImageStatus::Active)
        .filter_map(revision_from_image)
        .filter(|r| r.family == family)
        .collect();
    revisions.sort_by(|a, b| {
        b.created_at
            .cmp(&a.created_at)
            .then_with(|| b.revision.cmp(&a.revision))
    });
    Ok(revisions)
}

/// Split revisions (newest first) into kept and deleted.
///
/// Keeps `max(keep, 1)` revisions and always keeps `protect`.
pub fn plan_rotation(
    revisions: Vec<ImageRevision>,
    keep: usize,
    protect: &str,
) -> (Vec<ImageRevision>, Vec<ImageRevision>) {
    let keep = keep.max(1);
    let mut kept = Vec::with_capacity(keep);
    let mut stale = Vec::new();
    let protected_present = revisions.iter().any(|r| r.id == protect);
    for rev in revisions {
        let budget = if protected_present && !kept.iter().any(|k: &ImageRevision| k.id == protect) {
            keep - 1
        } else {
            keep
        };
        if rev.id == protect || kept.len() < budget {
            kept.push(rev);
        } else {
            stale.push(rev);
        }
    }
    (kept, stale)
}

/// Delete revisions of `family` beyond the newest `keep` (at least one).
///
/// Best-effort: failures become warnings in the report and are logged.
pub async fn rotate(
    cloud: &dyn CloudProvider,
    family: &str,
    keep: u32,
    protect: &str,
) -> RotationReport {
    let mut report = RotationReport::default();
    let revisions = match list_revisions(cloud, family).await {
        Ok(r) => r,
        Err(e) => {
            tracing::warn!(
                "[rotate] cannot list revisions of {} on {}: {}",
                family,
                cloud.cloud_name(),
                e
            );
            report.warnings.push(RotationWarning {
                image_id: String::new(),
                image_name: family.to_string(),
                message: format!("listing revisions failed: {}", e),
            });
            return report;
        }
    };
    let (kept, stale) = plan_rotation(revisions, keep as usize, protect);
    report.kept = kept;
    for rev in stale {
        match cloud.delete_image(&rev.id).await {
            Ok(()) => {
                tracing::info!("[rotate] deleted old revision {} ({})", rev.name, rev.id);
                report.deleted.push(rev);
            }
            Err(e) if e.is_not_found() => {
                tracing::info!("[rotate] old revision {} already gone", rev.id);
                report.deleted.push(rev);
            }
            Err(e) => {
                let warning = RotationWarning {
                    image_id: rev.id.clone(),
                    image_name: rev.name.clone(),
                    message: e.to_string(),
                };
                tracing::warn!("[rotate] {}", warning);
                report.warnings.push(warning);
            }
        }
    }
    tracing::info!(
        "[rotate] {} on {}: kept {}, deleted {}, warnings {}",
        family,
        cloud.cloud_name(),
        report.kept.len(),
        report.deleted.len(),
        report.warnings.len()
    );
    report
}

/// Newest ACTIVE revision of `family`, if any.
pub async fn latest_revision(
    cloud: &dyn CloudProvider,
    family: &str,
) -> BuildResult<Option<ImageRevision>> {
    Ok(list_revisions(cloud, family).await?.into_iter().next())
}

/// Copy a revision's image data into another cloud under the same name and properties.
pub async fn publish(
    source: &Arc<dyn CloudProvider>,
    target: &Arc<dyn CloudProvider>,
    revision: &ImageRevision,
    settings: &BuilderSettings,
    cancel: &CancellationToken,
) -> BuildResult<ImageRevision> {
    let fail = |message: String| BuildError::Publish {
        cloud: target.cloud_name().to_string(),
        message,
    };
    let source_image = source
        .get_image(&revision.id)
        .await
        .map_err(|e| fail(e.to_string()))?
        .ok_or_else(|| fail(format!("image {} not found on source cloud", revision.id)))?;

    let dir = tempfile::Builder::new()
        .prefix("image-builder-publish-")
        .tempdir_in(&settings.work_dir)
        .map_err(|e| fail(e.to_string()))?;
    let path = dir.path().join(format!("{}.img", revision.name));
    tracing::info!(
        "[publish] downloading {} from {}",
        revision.id,
        source.cloud_name()
    );
    source
        .download_image_data(&revision.id, &path)
        .await
        .map_err(|e| fail(format!("download from {}: {}", source.cloud_name(), e)))?;

    let request = ImageCreate {
        id: None,
        name: revision.name.clone(),
        disk_format: "qcow2".to_string(),
        container_format: "bare".to_string(),
        properties: source_image.properties.clone(),
    };
    let created = target
        .create_image(&request)
        .await
        .map_err(|e| fail(e.to_string()))?;
    tracing::info!(
        "[publish] uploading {} to {} as {}",
        revision.name,
        target.cloud_name(),
        created.id
    );

    let uploaded = match target.upload_image_data(&created.id, &path).await {
        Ok(()) => wait_image_active(target, &created.id, settings.publish, cancel)
            .await
            .map_err(|e| match e {
                WaitError::Cancelled => BuildError::Cancelled,
                other => fail(format!("image {}: {}", created.id, other)),
            }),
        Err(e) => Err(fail(format!("upload: {}", e))),
    };
    let image = match uploaded {
        Ok(image) => image,
        Err(e) => {
            if let Err(del) = target.delete_image(&created.id).await {
                tracing::warn!(
                    "[publish] failed to delete incomplete image {} on {}: {}",
                    created.id,
                    target.cloud_name(),
                    del
                );
            }
            return Err(e);
        }
    };
    tracing::info!(
        "[publish] {} is ACTIVE on {} as {}",
        revision.name,
        target.cloud_name(),
        image.id
    );
    Ok(ImageRevision {
        id: image.id,
        name: revision.name.clone(),
        family: revision.family.clone(),
        revision: revision.revision.clone(),
        created_at: image.created_at,
    })
}
