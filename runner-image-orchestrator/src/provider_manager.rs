use anyhow::{anyhow, bail, Result};
use runner_image_providers::CloudProvider;
use std::env;
use std::sync::Arc;

pub struct ProviderManager;

impl ProviderManager {
    pub fn current_provider_name() -> String {
        env::var("IMAGE_BUILDER_PROVIDER")
            .map(|s| s.trim().to_string())
            .ok()
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| "openstack".to_string())
    }

    /// Build the provider for `cloud_name` (a clouds.yaml entry for OpenStack).
    pub fn get_provider(provider_name: &str, cloud_name: &str) -> Result<Arc<dyn CloudProvider>> {
        match provider_name.to_lowercase().as_str() {
            #[cfg(feature = "provider-openstack")]
            "openstack" => {
                let provider =
                    runner_image_providers::openstack::OpenStackProvider::from_clouds_yaml(
                        cloud_name,
                    )?;
                Ok(Arc::new(provider))
            }
            #[cfg(feature = "provider-mock")]
            "mock" => Ok(Arc::new(runner_image_providers::mock::MockProvider::new(
                cloud_name,
            ))),
            other => bail!(
                "provider '{}' is not available in this build (enable its cargo feature)",
                other
            ),
        }
    }

    /// Cloud to use when none is given on the command line.
    pub fn default_cloud_name(provider_name: &str) -> Result<String> {
        match provider_name.to_lowercase().as_str() {
            #[cfg(feature = "provider-openstack")]
            "openstack" => {
                let (path, file) = runner_image_providers::clouds::load()?;
                let name = file.determine_cloud()?;
                tracing::info!(
                    "[provider_manager] using cloud {} from {}",
                    name,
                    path.display()
                );
                Ok(name)
            }
            "mock" => Ok("mock".to_string()),
            other => Err(anyhow!("no default cloud for provider '{}'", other)),
        }
    }
}
