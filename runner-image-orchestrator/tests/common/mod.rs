#![allow(dead_code)]

use async_trait::async_trait;
use runner_image_common::{
    Arch, BaseImage, CloudConfig, FlavorSelection, ImageConfig, RunnerVersion,
};
use runner_image_orchestrator::cloud_image::SeedImageSource;
use runner_image_orchestrator::wait::PollPolicy;
use runner_image_orchestrator::{BuilderSettings, ImageBuilder};
use runner_image_providers::mock::{MockBehavior, MockProvider};
use runner_image_providers::CloudProvider;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

pub const CLOUD: &str = "test";
pub const FAMILY: &str = "runner-noble";

/// Writes a small fake disk image instead of downloading one.
pub struct StaticSeed;

#[async_trait]
impl SeedImageSource for StaticSeed {
    async fn fetch(&self, arch: Arch, base: BaseImage, dir: &Path) -> anyhow::Result<PathBuf> {
        let path = dir.join(format!("{}-{}.img", base, arch));
        tokio::fs::write(&path, b"seed").await?;
        Ok(path)
    }
}

pub fn settings(dir: &Path) -> BuilderSettings {
    let short = PollPolicy::new(Duration::from_secs(30), Duration::from_millis(10));
    BuilderSettings {
        create_server: short,
        seed_upload: short,
        server_delete: short,
        publish: short,
        build_signal: PollPolicy::secs(3600, 30),
        snapshot: PollPolicy::secs(600, 60),
        keypair_path: dir.join("ssh").join("builder_key"),
        work_dir: dir.to_path_buf(),
        ..BuilderSettings::default()
    }
}

/// One mock cloud plus a builder connected to it.
pub struct Harness {
    pub cloud: MockProvider,
    pub dir: TempDir,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_behavior(MockBehavior::default())
    }

    pub fn with_behavior(behavior: MockBehavior) -> Self {
        Self {
            cloud: MockProvider::new(CLOUD).with_behavior(behavior),
            dir: tempfile::tempdir().expect("tempdir"),
        }
    }

    pub fn provider(&self) -> Arc<dyn CloudProvider> {
        Arc::new(self.cloud.clone())
    }

    pub fn builder(&self) -> ImageBuilder {
        ImageBuilder::new(
            self.provider(),
            settings(self.dir.path()),
            Arc::new(StaticSeed),
        )
    }
}

pub fn cloud_config() -> CloudConfig {
    CloudConfig {
        cloud_name: CLOUD.to_string(),
        flavor: FlavorSelection::Auto,
        network: None,
        proxy: None,
        upload_cloud_name: None,
    }
}

pub fn image_config() -> ImageConfig {
    ImageConfig {
        arch: Arch::X64,
        base: BaseImage::Noble,
        runner_version: RunnerVersion::Latest,
        name: FAMILY.to_string(),
    }
}
