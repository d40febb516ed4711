//! End-to-end build: validate, bootstrap, launch, wait, snapshot, tear down,
//! publish, rotate.

use crate::bootstrap::{canonical_security_group, Bootstrapper};
use crate::cloud_image::SeedImageSource;
use crate::cloud_init::validate_proxy;
use crate::error::{BuildError, BuildResult};
use crate::launcher::{LaunchRequest, Launcher};
use crate::settings::BuilderSettings;
use crate::snapshot::{self, RotationReport, SnapshotManager};
use crate::state_machine::{BuildRun, BuildState};
use runner_image_common::naming::{self, BUILDER_KEYPAIR_NAME, SHARED_SECURITY_GROUP_NAME};
use runner_image_common::{
    BuildVm, CloudConfig, FlavorSelection, FlavorSizing, ImageConfig, ImageRevision, ImageStatus,
    SharedResources,
};
use runner_image_providers::CloudProvider;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunOptions {
    pub keep_revisions: u32,
    /// Assume `init` already ran; only look shared resources up.
    pub skip_bootstrap: bool,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            keep_revisions: 5,
            skip_bootstrap: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct BuildOutcome {
    pub run_id: Uuid,
    /// Identifier handed to the caller: the published image when an upload cloud is set.
    pub artifact_id: String,
    pub revision: ImageRevision,
    pub published: Option<ImageRevision>,
    pub rotation: RotationReport,
}

pub struct ImageBuilder {
    cloud: Arc<dyn CloudProvider>,
    upload_cloud: Option<Arc<dyn CloudProvider>>,
    settings: BuilderSettings,
    seeds: Arc<dyn SeedImageSource>,
    cancel: CancellationToken,
}

impl ImageBuilder {
    pub fn new(
        cloud: Arc<dyn CloudProvider>,
        settings: BuilderSettings,
        seeds: Arc<dyn SeedImageSource>,
    ) -> Self {
        Self {
            cloud,
            upload_cloud: None,
            settings,
            seeds,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_upload_cloud(mut self, cloud: Arc<dyn CloudProvider>) -> Self {
        self.upload_cloud = Some(cloud);
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn settings(&self) -> &BuilderSettings {
        &self.settings
    }

    fn bootstrapper(&self) -> Bootstrapper<'_> {
        Bootstrapper::new(
            self.cloud.as_ref(),
            &self.settings,
            self.seeds.as_ref(),
            &self.cancel,
        )
    }

    /// Create shared resources for `arch` on the build cloud.
    pub async fn initialize(
        &self,
        arch: runner_image_common::Arch,
    ) -> BuildResult<Vec<SharedResources>> {
        self.bootstrapper().initialize(arch).await
    }

    /// Id of the newest ACTIVE revision of `family`, if any.
    pub async fn latest_build_id(&self, family: &str) -> BuildResult<Option<String>> {
        naming::validate_family_name(family)
            .map_err(|e| BuildError::Configuration(e.to_string()))?;
        Ok(snapshot::latest_revision(self.cloud.as_ref(), family)
            .await?
            .map(|r| r.id))
    }

    /// Build one image and return its artifact id.
    pub async fn run(
        &self,
        cloud_config: &CloudConfig,
        image_config: &ImageConfig,
        keep_revisions: u32,
    ) -> BuildResult<String> {
        let options = RunOptions {
            keep_revisions,
            ..RunOptions::default()
        };
        Ok(self
            .build(cloud_config, image_config, options)
            .await?
            .artifact_id)
    }

    pub async fn build(
        &self,
        cloud_config: &CloudConfig,
        image_config: &ImageConfig,
        options: RunOptions,
    ) -> BuildResult<BuildOutcome> {
        let mut run = BuildRun::new(Uuid::new_v4());
        match self.drive(&mut run, cloud_config, image_config, options).await {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                tracing::error!(
                    "[orchestrator] run {} failed in {} [{}]: {}",
                    run.run_id(),
                    run.state(),
                    e.category(),
                    e
                );
                run.abort(e.category());
                Err(e)
            }
        }
    }

    async fn drive(
        &self,
        run: &mut BuildRun,
        cloud_config: &CloudConfig,
        image_config: &ImageConfig,
        options: RunOptions,
    ) -> BuildResult<BuildOutcome> {
        validate(
            cloud_config,
            image_config,
            &self.settings.min_flavor,
            self.cloud.cloud_name(),
            self.upload_cloud.is_some(),
        )?;
        self.check_cancelled()?;

        let flavor_id = resolve_flavor(
            self.cloud.as_ref(),
            &cloud_config.flavor,
            &self.settings.min_flavor,
        )
        .await?;
        let network_id = resolve_network(self.cloud.as_ref(), cloud_config.network.as_deref()).await?;
        let shared = if options.skip_bootstrap {
            self.lookup_shared(image_config).await?
        } else {
            self.bootstrapper()
                .ensure(image_config.arch, image_config.base)
                .await?
        };
        run.transition(BuildState::ResourcesReady, "shared resources in place");
        self.check_cancelled()?;

        run.transition(BuildState::VmLaunching, "creating builder VM");
        let launcher = Launcher::new(&self.cloud, &self.settings, &self.cancel);
        let (vm, mut guard) = launcher
            .launch(&LaunchRequest {
                image: image_config,
                shared: &shared,
                flavor_id: &flavor_id,
                network_id: &network_id,
                proxy: cloud_config.proxy.as_deref(),
                run_id: run.run_id(),
            })
            .await?;
        run.transition(BuildState::VmActive, "builder VM active");

        // Torn down on every path before continuing; the guard covers a dropped run.
        let staged = self.build_on_vm(run, &launcher, &vm, image_config).await;
        launcher.teardown(&vm.id).await;
        guard.disarm();
        let revision = staged?;

        let published = match &self.upload_cloud {
            Some(target) => Some(
                snapshot::publish(&self.cloud, target, &revision, &self.settings, &self.cancel)
                    .await?,
            ),
            None => None,
        };

        let mut rotation = snapshot::rotate(
            self.cloud.as_ref(),
            &image_config.name,
            options.keep_revisions,
            &revision.id,
        )
        .await;
        if let (Some(target), Some(published)) = (&self.upload_cloud, &published) {
            let remote = snapshot::rotate(
                target.as_ref(),
                &image_config.name,
                options.keep_revisions,
                &published.id,
            )
            .await;
            rotation.kept.extend(remote.kept);
            rotation.deleted.extend(remote.deleted);
            rotation.warnings.extend(remote.warnings);
        }
        run.transition(BuildState::Rotated, "old revisions rotated");

        let artifact_id = published
            .as_ref()
            .map(|p| p.id.clone())
            .unwrap_or_else(|| revision.id.clone());
        run.transition(BuildState::Done, "artifact ready");
        tracing::info!(
            "[orchestrator] run {} produced {} ({})",
            run.run_id(),
            revision.name,
            artifact_id
        );
        Ok(BuildOutcome {
            run_id: run.run_id(),
            artifact_id,
            revision,
            published,
            rotation,
        })
    }

    async fn build_on_vm(
        &self,
        run: &mut BuildRun,
        launcher: &Launcher<'_>,
        vm: &BuildVm,
        image_config: &ImageConfig,
    ) -> BuildResult<ImageRevision> {
        launcher.wait_for_build_signal(vm).await?;
        run.transition(BuildState::BuildSignaled, "provisioning script succeeded");
        self.check_cancelled()?;
        run.transition(BuildState::Snapshotting, "creating image from VM");
        let revision = SnapshotManager::new(&self.cloud, &self.settings, &self.cancel)
            .snapshot(vm, image_config)
            .await?;
        run.transition(BuildState::SnapshotReady, "image active");
        Ok(revision)
    }

    /// Shared resources for a run that skips bootstrapping. Nothing is created.
    async fn lookup_shared(&self, image_config: &ImageConfig) -> BuildResult<SharedResources> {
        let missing = |resource: &'static str, what: String| BuildError::ResourceBootstrap {
            resource,
            message: format!("{}; run `init` first", what),
        };
        let seed_id = naming::seed_image_id(
            image_config.arch,
            image_config.base,
            self.settings.seed_generation,
        )
        .to_string();
        match self.cloud.get_image(&seed_id).await? {
            Some(image) if image.status == ImageStatus::Active => {}
            Some(image) => {
                return Err(missing(
                    "seed image",
                    format!("seed image {} is {}", seed_id, image.status),
                ))
            }
            None => return Err(missing("seed image", format!("seed image {} not found", seed_id))),
        }
        if self.cloud.get_keypair(BUILDER_KEYPAIR_NAME).await?.is_none() {
            return Err(missing(
                "keypair",
                format!("keypair {} not found", BUILDER_KEYPAIR_NAME),
            ));
        }
        let groups = self
            .cloud
            .list_security_groups(SHARED_SECURITY_GROUP_NAME)
            .await?;
        let group = canonical_security_group(&groups).cloned().ok_or_else(|| {
            missing(
                "security group",
                format!("security group {} not found", SHARED_SECURITY_GROUP_NAME),
            )
        })?;
        Ok(SharedResources {
            seed_image_id: seed_id,
            keypair_name: BUILDER_KEYPAIR_NAME.to_string(),
            security_group_id: group.id,
            security_group_name: group.name,
        })
    }

    fn check_cancelled(&self) -> BuildResult<()> {
        if self.cancel.is_cancelled() {
            return Err(BuildError::Cancelled);
        }
        Ok(())
    }
}

/// Checks that need no cloud calls.
pub fn validate(
    cloud_config: &CloudConfig,
    image_config: &ImageConfig,
    min_flavor: &FlavorSizing,
    cloud_name: &str,
    has_upload_cloud: bool,
) -> BuildResult<()> {
    let config_err = |msg: String| Err(BuildError::Configuration(msg));
    if cloud_config.cloud_name.trim().is_empty() {
        return config_err("cloud name must not be empty".to_string());
    }
    if cloud_config.cloud_name != cloud_name {
        return config_err(format!(
            "cloud config names '{}' but the builder is connected to '{}'",
            cloud_config.cloud_name, cloud_name
        ));
    }
    if cloud_config.upload_cloud_name.is_some() != has_upload_cloud {
        return config_err(match &cloud_config.upload_cloud_name {
            Some(name) => format!("upload cloud '{}' is not connected", name),
            None => "an upload cloud is connected but none is configured".to_string(),
        });
    }
    naming::validate_family_name(&image_config.name)
        .map_err(|e| BuildError::Configuration(e.to_string()))?;
    if let Some(proxy) = &cloud_config.proxy {
        validate_proxy(proxy).map_err(BuildError::Configuration)?;
    }
    if let FlavorSelection::Declared(spec) = &cloud_config.flavor {
        if !spec.sizing.meets(min_flavor) {
            return config_err(format!(
                "flavor {} ({}) is below the minimum {}",
                spec.name, spec.sizing, min_flavor
            ));
        }
    }
    Ok(())
}

/// Pick the flavor id for the builder VM.
pub async fn resolve_flavor(
    cloud: &dyn CloudProvider,
    selection: &FlavorSelection,
    min: &FlavorSizing,
) -> BuildResult<String> {
    let name = match selection {
        FlavorSelection::Auto => {
            let flavors = cloud.list_flavors().await?;
            let best = flavors
                .into_iter()
                .filter(|f| f.sizing.meets(min))
                .min_by_key(|f| (f.sizing.vcpus, f.sizing.ram_mib, f.sizing.disk_gib))
                .ok_or_else(|| {
                    BuildError::Configuration(format!(
                        "no flavor on cloud {} meets the minimum {}",
                        cloud.cloud_name(),
                        min
                    ))
                })?;
            tracing::info!("[orchestrator] selected flavor {} ({})", best.name, best.sizing);
            return Ok(best.id);
        }
        FlavorSelection::Named(name) => name,
        FlavorSelection::Declared(spec) => &spec.name,
    };
    let flavor = cloud.get_flavor(name).await?.ok_or_else(|| {
        BuildError::Configuration(format!(
            "flavor {} not found on cloud {}",
            name,
            cloud.cloud_name()
        ))
    })?;
    if !flavor.sizing.meets(min) {
        return Err(BuildError::Configuration(format!(
            "flavor {} ({}) is below the minimum {}",
            flavor.name, flavor.sizing, min
        )));
    }
    if let FlavorSelection::Declared(spec) = selection {
        if spec.sizing != flavor.sizing {
            tracing::warn!(
                "[orchestrator] flavor {} declared as {} but cloud reports {}",
                spec.name,
                spec.sizing,
                flavor.sizing
            );
        }
    }
    Ok(flavor.id)
}

/// Pick the network: the named one, or the network owning the first subnet.
pub async fn resolve_network(cloud: &dyn CloudProvider, name: Option<&str>) -> BuildResult<String> {
    if let Some(name) = name {
        let network = cloud.get_network(name).await?.ok_or_else(|| {
            BuildError::Configuration(format!(
                "network {} not found on cloud {}",
                name,
                cloud.cloud_name()
            ))
        })?;
        tracing::info!("[orchestrator] using network {}", network.name);
        return Ok(network.id);
    }
    let subnets = cloud.list_subnets().await?;
    let subnet = subnets.first().ok_or_else(|| {
        BuildError::Configuration(format!("no subnets on cloud {}", cloud.cloud_name()))
    })?;
    let networks = cloud.list_networks().await?;
    let network = networks
        .into_iter()
        .find(|n| n.subnet_ids.contains(&subnet.id) || n.id == subnet.network_id)
        .ok_or_else(|| {
            BuildError::Configuration(format!(
                "no network owns subnet {} on cloud {}",
                subnet.id,
                cloud.cloud_name()
            ))
        })?;
    tracing::info!("[orchestrator] using network {}", network.name);
    Ok(network.id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use runner_image_common::{Arch, BaseImage, FlavorSpec, RunnerVersion};
    use runner_image_providers::mock::MockProvider;

    fn min() -> FlavorSizing {
        FlavorSizing {
            vcpus: 2,
            ram_mib: 8192,
            disk_gib: 20,
        }
    }

    fn configs(flavor: FlavorSelection) -> (CloudConfig, ImageConfig) {
        (
            CloudConfig {
                cloud_name: "test".to_string(),
                flavor,
                network: None,
                proxy: None,
                upload_cloud_name: None,
            },
            ImageConfig {
                arch: Arch::X64,
                base: BaseImage::Noble,
                runner_version: RunnerVersion::Latest,
                name: "runner-noble".to_string(),
            },
        )
    }

    #[test]
    fn validate_rejects_bad_input() {
        let (mut cc, mut ic) = configs(FlavorSelection::Auto);
        assert!(validate(&cc, &ic, &min(), "test", false).is_ok());
        assert!(validate(&cc, &ic, &min(), "other", false).is_err());
        assert!(validate(&cc, &ic, &min(), "test", true).is_err());

        cc.proxy = Some("http://proxy:3128".to_string());
        assert!(validate(&cc, &ic, &min(), "test", false).is_err());
        cc.proxy = None;

        ic.name = "has space".to_string();
        let err = validate(&cc, &ic, &min(), "test", false).unwrap_err();
        assert_eq!(err.category(), "configuration");
    }

    #[tokio::test]
    async fn auto_flavor_picks_smallest_sufficient() {
        let cloud = MockProvider::new("test");
        let id = resolve_flavor(&cloud, &FlavorSelection::Auto, &min())
            .await
            .unwrap();
        assert_eq!(id, "flavor-builder");
    }

    #[tokio::test]
    async fn named_flavor_is_checked_after_lookup() {
        let cloud = MockProvider::new("test");
        let err = resolve_flavor(&cloud, &FlavorSelection::Named("m1.small".into()), &min())
            .await
            .unwrap_err();
        assert!(matches!(err, BuildError::Configuration(_)));
        let err = resolve_flavor(&cloud, &FlavorSelection::Named("nope".into()), &min())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("not found"));
        let id = resolve_flavor(&cloud, &FlavorSelection::Named("m1.large".into()), &min())
            .await
            .unwrap();
        assert_eq!(id, "flavor-large");
    }

    #[tokio::test]
    async fn declared_flavor_below_minimum_needs_no_cloud() {
        let cloud = MockProvider::new("test");
        let (cc, ic) = configs(FlavorSelection::Declared(FlavorSpec {
            name: "m1.small".to_string(),
            sizing: FlavorSizing {
                vcpus: 1,
                ram_mib: 2048,
                disk_gib: 10,
            },
        }));
        let err = validate(&cc, &ic, &min(), "test", false).unwrap_err();
        assert!(matches!(err, BuildError::Configuration(_)));
        assert_eq!(cloud.total_calls(), 0);
    }

    #[tokio::test]
    async fn network_defaults_to_first_subnet_owner() {
        let cloud = MockProvider::new("test");
        assert_eq!(resolve_network(&cloud, None).await.unwrap(), "net-builder");
        assert_eq!(
            resolve_network(&cloud, Some("builder-net")).await.unwrap(),
            "net-builder"
        );
        assert!(matches!(
            resolve_network(&cloud, Some("missing")).await,
            Err(BuildError::Configuration(_))
        ));
    }
}
