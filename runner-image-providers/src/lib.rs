use async_trait::async_trait;
use std::path::Path;

pub type ProviderResult<T> = std::result::Result<T, ProviderError>;

/// Cloud API failure, classified so callers can tell benign outcomes apart.
///
/// Classification rule (all providers): HTTP 404 is `NotFound`, HTTP 409 is
/// `Conflict` ("already exists" / "busy"), any other non-2xx is `Api`.
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("{resource} not found: {id}")]
    NotFound { resource: &'static str, id: String },
    #[error("{resource} conflict: {id}")]
    Conflict { resource: &'static str, id: String },
    #[error("cloud API error: status={status} body={body}")]
    Api { status: u16, body: String },
    #[error("cloud API transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ProviderError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, ProviderError::Conflict { .. })
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, ProviderError::NotFound { .. })
    }

    /// Failures worth retrying: transport errors and 5xx responses.
    pub fn is_transient(&self) -> bool {
        match self {
            ProviderError::Transport(_) => true,
            ProviderError::Api { status, .. } => *status >= 500,
            _ => false,
        }
    }
}

#[async_trait]
pub trait CloudProvider: Send + Sync {
    /// Profile name this provider was built from (for logs and errors).
    fn cloud_name(&self) -> &str;

    // Flavors / networks
    async fn list_flavors(&self) -> ProviderResult<Vec<inventory::Flavor>>;

    // Default implementation filters `list_flavors` by name or id.
    async fn get_flavor(&self, name_or_id: &str) -> ProviderResult<Option<inventory::Flavor>> {
        Ok(self
            .list_flavors()
            .await?
            .into_iter()
            .find(|f| f.name == name_or_id || f.id == name_or_id))
    }

    async fn list_networks(&self) -> ProviderResult<Vec<inventory::Network>>;

    // Default implementation filters `list_networks` by name or id.
    async fn get_network(&self, name_or_id: &str) -> ProviderResult<Option<inventory::Network>> {
        Ok(self
            .list_networks()
            .await?
            .into_iter()
            .find(|n| n.name == name_or_id || n.id == name_or_id))
    }

    async fn list_subnets(&self) -> ProviderResult<Vec<inventory::Subnet>>;

    // Keypairs (names are unique per account; duplicate create is `Conflict`)
    async fn get_keypair(&self, name: &str) -> ProviderResult<Option<inventory::Keypair>>;
    async fn create_keypair(&self, name: &str) -> ProviderResult<inventory::Keypair>;

    // Security groups (names are NOT unique; duplicate rule create is `Conflict`)
    async fn list_security_groups(
        &self,
        name: &str,
    ) -> ProviderResult<Vec<inventory::SecurityGroup>>;
    async fn create_security_group(
        &self,
        name: &str,
        description: &str,
    ) -> ProviderResult<inventory::SecurityGroup>;
    async fn delete_security_group(&self, id: &str) -> ProviderResult<()>;
    async fn create_security_group_rule(
        &self,
        security_group_id: &str,
        rule: &inventory::SecurityGroupRule,
    ) -> ProviderResult<()>;

    // Images. Creating with an explicit id that already exists (or existed) is `Conflict`.
    async fn get_image(&self, id: &str) -> ProviderResult<Option<inventory::Image>>;
    async fn list_images(&self, filter: &inventory::ImageFilter)
        -> ProviderResult<Vec<inventory::Image>>;
    async fn create_image(&self, request: &inventory::ImageCreate)
        -> ProviderResult<inventory::Image>;
    /// Upload image data. `Conflict` if the image is not `queued` any more.
    async fn upload_image_data(&self, id: &str, path: &Path) -> ProviderResult<()>;
    async fn download_image_data(&self, id: &str, path: &Path) -> ProviderResult<()>;
    async fn delete_image(&self, id: &str) -> ProviderResult<()>;

    // Servers
    async fn create_server(&self, request: &inventory::ServerCreate)
        -> ProviderResult<inventory::Server>;
    async fn get_server(&self, id: &str) -> ProviderResult<Option<inventory::Server>>;
    async fn list_servers(&self, name: &str) -> ProviderResult<Vec<inventory::Server>>;
    /// Tail of the server console log (`length` lines when given).
    async fn get_console_output(&self, id: &str, length: Option<u32>) -> ProviderResult<String>;
    /// Request an image of the server's disk; returns the new image id.
    async fn create_server_snapshot(
        &self,
        server_id: &str,
        request: &inventory::SnapshotCreate,
    ) -> ProviderResult<String>;
    async fn delete_server(&self, id: &str) -> ProviderResult<()>;
}

pub mod inventory {
    use chrono::{DateTime, Utc};
    use runner_image_common::{FlavorSizing, ImageStatus, ServerStatus};
    use std::collections::BTreeMap;

    #[derive(Clone, Debug, PartialEq, Eq)]
    pub struct Flavor {
        pub id: String,
        pub name: String,
        pub sizing: FlavorSizing,
    }

    #[derive(Clone, Debug, PartialEq, Eq)]
    pub struct Network {
        pub id: String,
        pub name: String,
        pub subnet_ids: Vec<String>,
    }

    #[derive(Clone, Debug, PartialEq, Eq)]
    pub struct Subnet {
        pub id: String,
        pub name: String,
        pub network_id: String,
    }

    #[derive(Clone, Debug, PartialEq, Eq)]
    pub struct Keypair {
        pub name: String,
        pub fingerprint: Option<String>,
        /// Only present in the response of a create that generated the key.
        pub private_key: Option<String>,
    }

    #[derive(Clone, Debug, PartialEq, Eq)]
    pub struct SecurityGroup {
        pub id: String,
        pub name: String,
        pub created_at: Option<DateTime<Utc>>,
    }

    #[derive(Clone, Debug, PartialEq, Eq)]
    pub struct SecurityGroupRule {
        pub direction: String,
        pub ethertype: String,
        pub protocol: String,
        pub port_range: Option<(u16, u16)>,
    }

    impl SecurityGroupRule {
        pub fn ingress_icmp_v4() -> Self {
            Self {
                direction: "ingress".to_string(),
                ethertype: "IPv4".to_string(),
                protocol: "icmp".to_string(),
                port_range: None,
            }
        }

        pub fn ingress_tcp_v4(port: u16) -> Self {
            Self {
                direction: "ingress".to_string(),
                ethertype: "IPv4".to_string(),
                protocol: "tcp".to_string(),
                port_range: Some((port, port)),
            }
        }
    }

    #[derive(Clone, Debug, PartialEq, Eq)]
    pub struct Image {
        pub id: String,
        pub name: String,
        pub status: ImageStatus,
        pub created_at: DateTime<Utc>,
        pub properties: BTreeMap<String, String>,
    }

    #[derive(Clone, Debug, Default, PartialEq, Eq)]
    pub struct ImageCreate {
        /// Explicit id; makes the create idempotent across processes.
        pub id: Option<String>,
        pub name: String,
        pub disk_format: String,
        pub container_format: String,
        pub properties: BTreeMap<String, String>,
    }

    /// All given constraints must match.
    #[derive(Clone, Debug, Default, PartialEq, Eq)]
    pub struct ImageFilter {
        pub name: Option<String>,
        pub properties: BTreeMap<String, String>,
    }

    impl ImageFilter {
        pub fn by_name(name: &str) -> Self {
            Self {
                name: Some(name.to_string()),
                properties: BTreeMap::new(),
            }
        }

        pub fn by_property(key: &str, value: &str) -> Self {
            let mut properties = BTreeMap::new();
            properties.insert(key.to_string(), value.to_string());
            Self {
                name: None,
                properties,
            }
        }

        pub fn matches(&self, image: &Image) -> bool {
            if let Some(name) = &self.name {
                if &image.name != name {
                    return false;
                }
            }
            self.properties
                .iter()
                .all(|(k, v)| image.properties.get(k) == Some(v))
        }
    }

    #[derive(Clone, Debug, PartialEq, Eq)]
    pub struct Server {
        pub id: String,
        pub name: String,
        pub status: ServerStatus,
        pub key_name: Option<String>,
        pub security_groups: Vec<String>,
        pub created_at: DateTime<Utc>,
        pub metadata: BTreeMap<String, String>,
    }

    #[derive(Clone, Debug, PartialEq, Eq)]
    pub struct ServerCreate {
        pub name: String,
        pub image_id: String,
        pub flavor_id: String,
        pub network_id: String,
        pub key_name: String,
        pub security_groups: Vec<String>,
        /// Raw user-data; providers encode it as their API requires.
        pub user_data: String,
        pub metadata: BTreeMap<String, String>,
    }

    #[derive(Clone, Debug, PartialEq, Eq)]
    pub struct SnapshotCreate {
        pub name: String,
        pub properties: BTreeMap<String, String>,
    }
}

#[cfg(feature = "openstack")]
pub mod clouds;

#[cfg(feature = "mock")]
pub mod mock;

#[cfg(feature = "openstack")]
pub mod openstack;
