//! Builder VM lifecycle: create, wait for ACTIVE, wait for the build signal,
//! tear down.

use crate::cloud_init::{generate_payload, PayloadConfig};
use crate::error::{BuildError, BuildResult};
use crate::settings::BuilderSettings;
use crate::wait::{poll_until, Probe, WaitError};
use runner_image_common::naming::{self, FAMILY_PROPERTY, RUN_ID_METADATA};
use runner_image_common::signal::{scan_console, BuildSignal};
use runner_image_common::{BuildVm, ImageConfig, ServerStatus, SharedResources};
use runner_image_providers::inventory::{Server, ServerCreate};
use runner_image_providers::{CloudProvider, ProviderError};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Everything needed to start one builder VM.
#[derive(Debug, Clone)]
pub struct LaunchRequest<'a> {
    pub image: &'a ImageConfig,
    pub shared: &'a SharedResources,
    pub flavor_id: &'a str,
    pub network_id: &'a str,
    pub proxy: Option<&'a str>,
    pub run_id: Uuid,
}

pub struct Launcher<'a> {
    cloud: &'a Arc<dyn CloudProvider>,
    settings: &'a BuilderSettings,
    cancel: &'a CancellationToken,
}

impl<'a> Launcher<'a> {
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

    /// Create the builder VM and wait until it is ACTIVE.
    ///
    /// On any failure after the create call the VM is deleted before the error is
    /// returned. The returned guard is armed from the moment the create succeeds,
    /// so dropping this future mid-wait still deletes the VM.
    pub async fn launch(&self, req: &LaunchRequest<'_>) -> BuildResult<(BuildVm, VmGuard)> {
        let name = naming::builder_name(req.image.arch, req.image.base, &req.run_id);
        let signal_token = req.run_id.to_string();
        let user_data = generate_payload(&PayloadConfig {
            arch: req.image.arch,
            base: req.image.base,
            runner_version: &req.image.runner_version,
            proxy: req.proxy,
            signal_token: &signal_token,
        });
        let mut metadata = BTreeMap::new();
        metadata.insert(RUN_ID_METADATA.to_string(), signal_token.clone());
        metadata.insert(FAMILY_PROPERTY.to_string(), req.image.name.clone());

        let request = ServerCreate {
            name: name.clone(),
            image_id: req.shared.seed_image_id.clone(),
            flavor_id: req.flavor_id.to_string(),
            network_id: req.network_id.to_string(),
            key_name: req.shared.keypair_name.clone(),
            // Ids, because several groups may share the name.
            security_groups: vec![req.shared.security_group_id.clone()],
            user_data,
            metadata,
        };

        tracing::info!(
            "[launcher] creating builder VM {} (flavor={}, network={}, seed={})",
            name,
            req.flavor_id,
            req.network_id,
            req.shared.seed_image_id
        );
        let server = match self.cloud.create_server(&request).await {
            Ok(server) => server,
            Err(e) => {
                tracing::error!("[launcher] failed to create builder VM {}: {}", name, e);
                // The create may have gone through even though the response failed.
                self.cleanup_by_name(&name).await;
                return Err(BuildError::Launch(e.to_string()));
            }
        };
        tracing::info!("[launcher] builder VM {} created as {}", name, server.id);
        let mut guard = VmGuard::new(self.cloud.clone(), &server.id);

        let cloud = self.cloud.clone();
        let server_id = server.id.clone();
        let waited = poll_until("builder VM active", self.settings.create_server, self.cancel, || {
            let cloud = cloud.clone();
            let id = server_id.clone();
            async move {
                let current = match cloud.get_server(&id).await {
                    Ok(current) => current,
                    Err(e) if e.is_transient() => {
                        tracing::warn!("[launcher] retrying status check of {}: {}", id, e);
                        return Ok(Probe::Pending);
                    }
                    Err(e) => return Err(e),
                };
                Ok::<_, ProviderError>(match current {
                    Some(s) if s.status == ServerStatus::Active => Probe::Ready(s),
                    Some(s) if s.status == ServerStatus::Error => {
                        Probe::Failed(format!("builder VM {} entered ERROR state", id))
                    }
                    Some(_) => Probe::Pending,
                    None => Probe::Failed(format!("builder VM {} disappeared", id)),
                })
            }
        })
        .await;

        let active = match waited {
            Ok(server) => server,
            Err(e) => {
                self.teardown(&server.id).await;
                guard.disarm();
                return Err(match e {
                    WaitError::TimedOut(timeout) => BuildError::LaunchTimeout {
                        server_id: server.id,
                        timeout,
                    },
                    WaitError::Failed(reason) => BuildError::Launch(reason),
                    WaitError::Cancelled => BuildError::Cancelled,
                    WaitError::Probe(e) => BuildError::Provider(e),
                });
            }
        };
        tracing::info!("[launcher] builder VM {} is ACTIVE", active.id);
        Ok((to_build_vm(active, req.shared, signal_token), guard))
    }

    /// Poll the console until the provisioning script reports success or failure.
    ///
    /// The VM status is checked on every poll so a VM that drops into ERROR fails
    /// the build right away. Transient API errors and a console that is not
    /// available yet count as "no signal yet".
    pub async fn wait_for_build_signal(&self, vm: &BuildVm) -> BuildResult<()> {
        tracing::info!(
            "[launcher] waiting for build signal from {} (timeout {:?})",
            vm.id,
            self.settings.build_signal.timeout
        );
        let cloud = self.cloud.clone();
        let tail = self.settings.console_tail_lines;
        let result = poll_until("build signal", self.settings.build_signal, self.cancel, || {
            let cloud = cloud.clone();
            let id = vm.id.clone();
            let token = vm.signal_token.clone();
            async move {
                match cloud.get_server(&id).await {
                    Ok(Some(s)) if s.status == ServerStatus::Error => {
                        return Ok(Probe::Failed(format!(
                            "builder VM {} entered ERROR state during the build",
                            id
                        )))
                    }
                    Ok(Some(_)) => {}
                    Ok(None) => {
                        return Ok(Probe::Failed(format!("builder VM {} disappeared", id)))
                    }
                    Err(e) if e.is_transient() => {
                        tracing::warn!("[launcher] retrying status check of {}: {}", id, e);
                        return Ok(Probe::Pending);
                    }
                    Err(e) => return Err(e),
                }
                let output = match cloud.get_console_output(&id, Some(tail)).await {
                    Ok(output) => output,
                    // Console not available yet.
                    Err(e) if e.is_conflict() || e.is_not_found() => return Ok(Probe::Pending),
                    Err(e) if e.is_transient() => {
                        tracing::warn!("[launcher] retrying console read of {}: {}", id, e);
                        return Ok(Probe::Pending);
                    }
                    Err(e) => return Err(e),
                };
                Ok(match scan_console(&output, &token) {
                    Some(BuildSignal::Succeeded) => Probe::Ready(()),
                    Some(BuildSignal::Failed(reason)) => Probe::Failed(reason),
                    None => Probe::Pending,
                })
            }
        })
        .await;

        match result {
            Ok(()) => {
                tracing::info!("[launcher] build on {} finished successfully", vm.id);
                Ok(())
            }
            Err(WaitError::TimedOut(timeout)) => Err(BuildError::BuildTimeout {
                server_id: vm.id.clone(),
                timeout,
            }),
            Err(WaitError::Failed(reason)) => Err(BuildError::BuildFailed {
                server_id: vm.id.clone(),
                reason,
            }),
            Err(WaitError::Cancelled) => Err(BuildError::Cancelled),
            Err(WaitError::Probe(e)) => Err(BuildError::Provider(e)),
        }
    }

    /// Delete the VM and wait for it to go away. Best-effort: failures are logged.
    ///
    /// Runs to completion even when the build has been cancelled.
    pub async fn teardown(&self, server_id: &str) -> bool {
        tracing::info!("[launcher] deleting builder VM {}", server_id);
        match self.cloud.delete_server(server_id).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => return true,
            Err(e) => {
                tracing::warn!("[launcher] failed to delete builder VM {}: {}", server_id, e);
                return false;
            }
        }
        let cloud = self.cloud.clone();
        let id = server_id.to_string();
        let gone = poll_until(
            "builder VM deletion",
            self.settings.server_delete,
            &CancellationToken::new(),
            || {
                let cloud = cloud.clone();
                let id = id.clone();
                async move {
                    Ok::<_, ProviderError>(match cloud.get_server(&id).await? {
                        None => Probe::Ready(()),
                        Some(s) if s.status == ServerStatus::Deleted => Probe::Ready(()),
                        Some(_) => Probe::Pending,
                    })
                }
            },
        )
        .await;
        match gone {
            Ok(()) => {
                tracing::info!("[launcher] builder VM {} deleted", server_id);
                true
            }
            Err(e) => {
                tracing::warn!(
                    "[launcher] builder VM {} still present after delete: {}",
                    server_id,
                    e
                );
                false
            }
        }
    }

    async fn cleanup_by_name(&self, name: &str) {
        match self.cloud.list_servers(name).await {
            Ok(servers) => {
                for server in servers {
                    self.teardown(&server.id).await;
                }
            }
            Err(e) => tracing::warn!(
                "[launcher] could not look up servers named {} for cleanup: {}",
                name,
                e
            ),
        }
    }
}

fn to_build_vm(server: Server, shared: &SharedResources, signal_token: String) -> BuildVm {
    BuildVm {
        id: server.id,
        name: server.name,
        status: server.status,
        keypair_name: server
            .key_name
            .unwrap_or_else(|| shared.keypair_name.clone()),
        security_group: shared.security_group_name.clone(),
        created_at: server.created_at,
        signal_token,
    }
}

/// Deletes the VM from a background task if dropped while still armed.
///
/// Covers the case where the future driving a build is dropped mid-flight.
/// Normal exits tear the VM down explicitly and then `disarm` the guard.
pub struct VmGuard {
    cloud: Arc<dyn CloudProvider>,
    server_id: Option<String>,
}

impl VmGuard {
    pub fn new(cloud: Arc<dyn CloudProvider>, server_id: &str) -> Self {
        Self {
            cloud,
            server_id: Some(server_id.to_string()),
        }
    }

    pub fn disarm(&mut self) {
        self.server_id = None;
    }
}

impl Drop for VmGuard {
    fn drop(&mut self) {
        let Some(id) = self.server_id.take() else {
            return;
        };
        tracing::warn!("[launcher] build abandoned, scheduling delete of builder VM {}", id);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let cloud = self.cloud.clone();
                handle.spawn(async move {
                    match cloud.delete_server(&id).await {
                        Ok(()) => tracing::info!("[launcher] builder VM {} deleted", id),
                        Err(e) if e.is_not_found() => {}
                        Err(e) => tracing::warn!(
                            "[launcher] failed to delete abandoned builder VM {}: {}",
                            id,
                            e
                        ),
                    }
                });
            }
            Err(_) => tracing::error!(
                "[launcher] no runtime available to delete builder VM {}; delete it manually",
                id
            ),
        }
    }
}
