use crate::clouds::{self, CloudProfile, Credentials, ProjectScope};
use crate::inventory::{
    Flavor, Image, ImageCreate, ImageFilter, Keypair, Network, SecurityGroup, SecurityGroupRule,
    Server, ServerCreate, SnapshotCreate, Subnet,
};
use crate::{CloudProvider, ProviderError, ProviderResult};
use anyhow::Context;
use async_trait::async_trait;
use base64::Engine;
use chrono::{DateTime, NaiveDateTime, Utc};
use futures_util::StreamExt;
use reqwest::{Client, Method, RequestBuilder, Response};
use runner_image_common::{FlavorSizing, ImageStatus, ServerStatus};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;
use tokio_util::io::ReaderStream;

const API_TIMEOUT: Duration = Duration::from_secs(30);
// Image data transfers are bounded by the caller, not the client.
const TRANSFER_TIMEOUT: Duration = Duration::from_secs(6 * 3600);
const NOVA_MICROVERSION: &str = "2.1";
// Re-authenticate this long before the token's stated expiry.
const TOKEN_REFRESH_MARGIN_SECS: i64 = 300;

// Glance image fields that are not user properties.
const GLANCE_CORE_FIELDS: &[&str] = &[
    "id",
    "name",
    "status",
    "created_at",
    "updated_at",
    "visibility",
    "protected",
    "checksum",
    "os_hash_algo",
    "os_hash_value",
    "owner",
    "size",
    "virtual_size",
    "min_ram",
    "min_disk",
    "disk_format",
    "container_format",
    "file",
    "schema",
    "self",
    "tags",
    "locations",
    "direct_url",
    "os_hidden",
    "stores",
];

#[derive(Clone, Copy, Debug)]
enum Service {
    Compute,
    Image,
    Network,
}

impl Service {
    fn catalog_type(&self) -> &'static str {
        match self {
            Service::Compute => "compute",
            Service::Image => "image",
            Service::Network => "network",
        }
    }
}

#[derive(Clone, Debug)]
struct Session {
    token: String,
    expires_at: Option<DateTime<Utc>>,
    compute_url: String,
    image_url: String,
    network_url: String,
}

impl Session {
    fn is_fresh(&self) -> bool {
        match self.expires_at {
            Some(at) => at - chrono::Duration::seconds(TOKEN_REFRESH_MARGIN_SECS) > Utc::now(),
            None => true,
        }
    }

    fn base(&self, service: Service) -> &str {
        match service {
            Service::Compute => &self.compute_url,
            Service::Image => &self.image_url,
            Service::Network => &self.network_url,
        }
    }
}

/// OpenStack cloud reached over Keystone v3, Nova, Glance v2 and Neutron v2.0.
pub struct OpenStackProvider {
    client: Client,
    profile: CloudProfile,
    session: RwLock<Option<Session>>,
}

impl OpenStackProvider {
    pub fn new(profile: CloudProfile) -> anyhow::Result<Self> {
        // No client-wide timeout: image transfers set their own.
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self {
            client,
            profile,
            session: RwLock::new(None),
        })
    }

    /// Build a provider for a cloud profile from the first `clouds.yaml` found.
    pub fn from_clouds_yaml(cloud_name: &str) -> anyhow::Result<Self> {
        let (path, file) = clouds::load()?;
        tracing::debug!("[openstack] using {} for cloud {}", path.display(), cloud_name);
        Self::new(file.profile(cloud_name)?)
    }

    fn auth_tokens_url(&self) -> String {
        let base = &self.profile.auth_url;
        if base.ends_with("/v3") {
            format!("{}/auth/tokens", base)
        } else {
            format!("{}/v3/auth/tokens", base)
        }
    }

    async fn authenticate(&self) -> ProviderResult<Session> {
        let url = self.auth_tokens_url();
        tracing::debug!("[openstack] POST {} (cloud={})", url, self.profile.name);
        let resp = self
            .client
            .post(&url)
            .timeout(API_TIMEOUT)
            .json(&auth_body(&self.profile.credentials))
            .send()
            .await?;
        let resp = check(resp, "token", &self.profile.name).await?;
        let token = resp
            .headers()
            .get("X-Subject-Token")
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string())
            .ok_or_else(|| anyhow::anyhow!("Keystone response has no X-Subject-Token header"))?;
        let body: Value = resp.json().await?;

        let endpoint = |service: Service| -> ProviderResult<String> {
            find_endpoint(
                &body,
                service.catalog_type(),
                &self.profile.interface,
                self.profile.region.as_deref(),
            )
            .ok_or_else(|| {
                ProviderError::Other(anyhow::anyhow!(
                    "no {} {} endpoint in service catalog of cloud {}",
                    self.profile.interface,
                    service.catalog_type(),
                    self.profile.name
                ))
            })
        };

        let session = Session {
            token,
            expires_at: body["token"]["expires_at"]
                .as_str()
                .and_then(parse_timestamp),
            compute_url: endpoint(Service::Compute)?,
            image_url: with_version(&endpoint(Service::Image)?, "v2"),
            network_url: with_version(&endpoint(Service::Network)?, "v2.0"),
        };
        tracing::info!(
            "[openstack] authenticated to cloud {} (compute={}, image={}, network={})",
            self.profile.name,
            session.compute_url,
            session.image_url,
            session.network_url
        );
        Ok(session)
    }

    async fn session(&self) -> ProviderResult<Session> {
        if let Some(session) = self.session.read().await.as_ref() {
            if session.is_fresh() {
                return Ok(session.clone());
            }
        }
        let mut guard = self.session.write().await;
        if let Some(session) = guard.as_ref() {
            if session.is_fresh() {
                return Ok(session.clone());
            }
        }
        let session = self.authenticate().await?;
        *guard = Some(session.clone());
        Ok(session)
    }

    async fn request(
        &self,
        method: Method,
        service: Service,
        path: &str,
    ) -> ProviderResult<RequestBuilder> {
        let session = self.session().await?;
        let url = format!("{}{}", session.base(service), path);
        tracing::debug!("[openstack] {} {}", method, url);
        let mut builder = self
            .client
            .request(method, &url)
            .header("X-Auth-Token", session.token)
            .timeout(API_TIMEOUT);
        if matches!(service, Service::Compute) {
            builder = builder.header("X-OpenStack-Nova-API-Version", NOVA_MICROVERSION);
        }
        Ok(builder)
    }

    async fn get_json(
        &self,
        service: Service,
        path: &str,
        resource: &'static str,
        id: &str,
    ) -> ProviderResult<Value> {
        let resp = self.request(Method::GET, service, path).await?.send().await?;
        Ok(check(resp, resource, id).await?.json().await?)
    }

    /// GET that maps 404 to `None`.
    async fn get_optional(
        &self,
        service: Service,
        path: &str,
        resource: &'static str,
        id: &str,
    ) -> ProviderResult<Option<Value>> {
        match self.get_json(service, path, resource, id).await {
            Ok(v) => Ok(Some(v)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn post_json(
        &self,
        service: Service,
        path: &str,
        body: &Value,
        resource: &'static str,
        id: &str,
    ) -> ProviderResult<Response> {
        let resp = self
            .request(Method::POST, service, path)
            .await?
            .json(body)
            .send()
            .await?;
        check(resp, resource, id).await
    }

    async fn delete(
        &self,
        service: Service,
        path: &str,
        resource: &'static str,
        id: &str,
    ) -> ProviderResult<()> {
        let resp = self
            .request(Method::DELETE, service, path)
            .await?
            .send()
            .await?;
        check(resp, resource, id).await?;
        Ok(())
    }

    async fn server_action(
        &self,
        server_id: &str,
        body: &Value,
    ) -> ProviderResult<Response> {
        self.post_json(
            Service::Compute,
            &format!("/servers/{}/action", server_id),
            body,
            "server",
            server_id,
        )
        .await
    }
}

/// Map non-2xx responses onto the shared error classification.
async fn check(resp: Response, resource: &'static str, id: &str) -> ProviderResult<Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    tracing::debug!(
        "[openstack] {} {} -> status={} body={}",
        resource,
        id,
        status.as_u16(),
        body
    );
    Err(match status.as_u16() {
        404 => ProviderError::NotFound {
            resource,
            id: id.to_string(),
        },
        409 => ProviderError::Conflict {
            resource,
            id: id.to_string(),
        },
        code => ProviderError::Api { status: code, body },
    })
}

fn find_endpoint(
    auth_body: &Value,
    service_type: &str,
    interface: &str,
    region: Option<&str>,
) -> Option<String> {
    let catalog = auth_body["token"]["catalog"].as_array()?;
    let service = catalog
        .iter()
        .find(|s| s["type"].as_str() == Some(service_type))?;
    service["endpoints"]
        .as_array()?
        .iter()
        .filter(|e| e["interface"].as_str() == Some(interface))
        .find(|e| match region {
            Some(r) => e["region"].as_str() == Some(r) || e["region_id"].as_str() == Some(r),
            None => true,
        })
        .and_then(|e| e["url"].as_str())
        .map(|u| u.trim_end_matches('/').to_string())
}

/// Glance and Neutron catalog entries usually omit the API version.
fn with_version(url: &str, version: &str) -> String {
    let url = url.trim_end_matches('/');
    if url.ends_with(&format!("/{}", version)) {
        url.to_string()
    } else {
        format!("{}/{}", url, version)
    }
}

fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(t) = DateTime::parse_from_rfc3339(raw) {
        return Some(t.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|n| n.and_utc())
}

fn str_field(v: &Value, key: &str) -> String {
    v[key].as_str().unwrap_or_default().to_string()
}

fn auth_body(credentials: &Credentials) -> Value {
    match credentials {
        Credentials::Password {
            username,
            password,
            user_domain,
            project,
        } => {
            let project = match project {
                ProjectScope::Id(id) => json!({ "id": id }),
                ProjectScope::Name { name, domain } => json!({
                    "name": name,
                    "domain": { "name": domain }
                }),
            };
            json!({
                "auth": {
                    "identity": {
                        "methods": ["password"],
                        "password": {
                            "user": {
                                "name": username,
                                "domain": { "name": user_domain },
                                "password": password
                            }
                        }
                    },
                    "scope": { "project": project }
                }
            })
        }
        Credentials::ApplicationCredential { id, secret } => json!({
            "auth": {
                "identity": {
                    "methods": ["application_credential"],
                    "application_credential": { "id": id, "secret": secret }
                }
            }
        }),
    }
}

/// `None` (with a warning) for a flavor whose vCPU count does not fit a `u32`.
fn parse_flavor(v: &Value) -> Option<Flavor> {
    let id = str_field(v, "id");
    let raw_vcpus = v["vcpus"].as_u64().unwrap_or(0);
    let vcpus = match u32::try_from(raw_vcpus) {
        Ok(vcpus) => vcpus,
        Err(_) => {
            tracing::warn!(
                "[openstack] ignoring flavor {}: vcpus={} is out of range",
                id,
                raw_vcpus
            );
            return None;
        }
    };
    Some(Flavor {
        id,
        name: str_field(v, "name"),
        sizing: FlavorSizing {
            vcpus,
            ram_mib: v["ram"].as_u64().unwrap_or(0),
            disk_gib: v["disk"].as_u64().unwrap_or(0),
        },
    })
}

fn parse_keypair(v: &Value) -> Keypair {
    Keypair {
        name: str_field(v, "name"),
        fingerprint: v["fingerprint"].as_str().map(|s| s.to_string()),
        private_key: v["private_key"].as_str().map(|s| s.to_string()),
    }
}

fn parse_security_group(v: &Value) -> SecurityGroup {
    SecurityGroup {
        id: str_field(v, "id"),
        name: str_field(v, "name"),
        created_at: v["created_at"].as_str().and_then(parse_timestamp),
    }
}

fn parse_image(v: &Value) -> Image {
    let properties = v
        .as_object()
        .map(|obj| {
            obj.iter()
                .filter(|(k, _)| !GLANCE_CORE_FIELDS.contains(&k.as_str()))
                .filter_map(|(k, val)| val.as_str().map(|s| (k.clone(), s.to_string())))
                .collect::<BTreeMap<_, _>>()
        })
        .unwrap_or_default();
    Image {
        id: str_field(v, "id"),
        name: str_field(v, "name"),
        status: ImageStatus::parse(v["status"].as_str().unwrap_or_default()),
        created_at: v["created_at"]
            .as_str()
            .and_then(parse_timestamp)
            .unwrap_or_default(),
        properties,
    }
}

fn parse_server(v: &Value) -> Server {
    let metadata = v["metadata"]
        .as_object()
        .map(|obj| {
            obj.iter()
                .filter_map(|(k, val)| val.as_str().map(|s| (k.clone(), s.to_string())))
                .collect::<BTreeMap<_, _>>()
        })
        .unwrap_or_default();
    let security_groups = v["security_groups"]
        .as_array()
        .map(|groups| {
            groups
                .iter()
                .filter_map(|g| g["name"].as_str().map(|s| s.to_string()))
                .collect()
        })
        .unwrap_or_default();
    Server {
        id: str_field(v, "id"),
        name: str_field(v, "name"),
        status: ServerStatus::parse(v["status"].as_str().unwrap_or_default()),
        key_name: v["key_name"].as_str().map(|s| s.to_string()),
        security_groups,
        created_at: v["created"]
            .as_str()
            .and_then(parse_timestamp)
            .unwrap_or_default(),
        metadata,
    }
}

/// Image id from a createImage response: body (microversion >= 2.45) or Location header.
fn snapshot_image_id(location: Option<&str>, body: &Value) -> Option<String> {
    if let Some(id) = body["image_id"].as_str() {
        return Some(id.to_string());
    }
    location
        .and_then(|l| l.trim_end_matches('/').rsplit('/').next())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
}

fn image_list_query(filter: &ImageFilter) -> Vec<(String, String)> {
    let mut query = vec![("limit".to_string(), "100".to_string())];
    if let Some(name) = &filter.name {
        query.push(("name".to_string(), name.clone()));
    }
    for (k, v) in &filter.properties {
        query.push((k.clone(), v.clone()));
    }
    query
}

#[async_trait]
impl CloudProvider for OpenStackProvider {
    fn cloud_name(&self) -> &str {
        &self.profile.name
    }

    async fn list_flavors(&self) -> ProviderResult<Vec<Flavor>> {
        let body = self
            .get_json(Service::Compute, "/flavors/detail", "flavor", "*")
            .await?;
        Ok(body["flavors"]
            .as_array()
            .map(|a| a.iter().filter_map(parse_flavor).collect())
            .unwrap_or_default())
    }

    async fn list_networks(&self) -> ProviderResult<Vec<Network>> {
        let body = self
            .get_json(Service::Network, "/networks", "network", "*")
            .await?;
        Ok(body["networks"]
            .as_array()
            .map(|a| {
                a.iter()
                    .map(|n| Network {
                        id: str_field(n, "id"),
                        name: str_field(n, "name"),
                        subnet_ids: n["subnets"]
                            .as_array()
                            .map(|s| {
                                s.iter()
                                    .filter_map(|x| x.as_str().map(|x| x.to_string()))
                                    .collect()
                            })
                            .unwrap_or_default(),
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn list_subnets(&self) -> ProviderResult<Vec<Subnet>> {
        let body = self
            .get_json(Service::Network, "/subnets", "subnet", "*")
            .await?;
        Ok(body["subnets"]
            .as_array()
            .map(|a| {
                a.iter()
                    .map(|s| Subnet {
                        id: str_field(s, "id"),
                        name: str_field(s, "name"),
                        network_id: str_field(s, "network_id"),
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn get_keypair(&self, name: &str) -> ProviderResult<Option<Keypair>> {
        Ok(self
            .get_optional(
                Service::Compute,
                &format!("/os-keypairs/{}", name),
                "keypair",
                name,
            )
            .await?
            .map(|b| parse_keypair(&b["keypair"])))
    }

    async fn create_keypair(&self, name: &str) -> ProviderResult<Keypair> {
        let body = json!({ "keypair": { "name": name } });
        let resp = self
            .post_json(Service::Compute, "/os-keypairs", &body, "keypair", name)
            .await?;
        let body: Value = resp.json().await?;
        Ok(parse_keypair(&body["keypair"]))
    }

    async fn list_security_groups(&self, name: &str) -> ProviderResult<Vec<SecurityGroup>> {
        let resp = self
            .request(Method::GET, Service::Network, "/security-groups")
            .await?
            .query(&[("name", name)])
            .send()
            .await?;
        let body: Value = check(resp, "security group", name).await?.json().await?;
        Ok(body["security_groups"]
            .as_array()
            .map(|a| {
                a.iter()
                    .map(parse_security_group)
                    // Older Neutron releases ignore the name filter.
                    .filter(|g| g.name == name)
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn create_security_group(
        &self,
        name: &str,
        description: &str,
    ) -> ProviderResult<SecurityGroup> {
        let body = json!({ "security_group": { "name": name, "description": description } });
        let resp = self
            .post_json(Service::Network, "/security-groups", &body, "security group", name)
            .await?;
        let body: Value = resp.json().await?;
        Ok(parse_security_group(&body["security_group"]))
    }

    async fn delete_security_group(&self, id: &str) -> ProviderResult<()> {
        self.delete(
            Service::Network,
            &format!("/security-groups/{}", id),
            "security group",
            id,
        )
        .await
    }

    async fn create_security_group_rule(
        &self,
        security_group_id: &str,
        rule: &SecurityGroupRule,
    ) -> ProviderResult<()> {
        let mut spec = json!({
            "security_group_id": security_group_id,
            "direction": rule.direction,
            "ethertype": rule.ethertype,
            "protocol": rule.protocol,
        });
        if let Some((min, max)) = rule.port_range {
            spec["port_range_min"] = json!(min);
            spec["port_range_max"] = json!(max);
        }
        self.post_json(
            Service::Network,
            "/security-group-rules",
            &json!({ "security_group_rule": spec }),
            "security group rule",
            security_group_id,
        )
        .await?;
        Ok(())
    }

    async fn get_image(&self, id: &str) -> ProviderResult<Option<Image>> {
        Ok(self
            .get_optional(Service::Image, &format!("/images/{}", id), "image", id)
            .await?
            .map(|b| parse_image(&b)))
    }

    async fn list_images(&self, filter: &ImageFilter) -> ProviderResult<Vec<Image>> {
        let mut images = Vec::new();
        let session = self.session().await?;
        let mut resp = self
            .request(Method::GET, Service::Image, "/images")
            .await?
            .query(&image_list_query(filter))
            .send()
            .await?;
        loop {
            let body: Value = check(resp, "image", "*").await?.json().await?;
            if let Some(page) = body["images"].as_array() {
                images.extend(page.iter().map(parse_image).filter(|i| filter.matches(i)));
            }
            // `next` is a path like `/v2/images?marker=...` relative to the service root.
            let Some(next) = body["next"].as_str() else {
                break;
            };
            let root = session
                .image_url
                .strip_suffix("/v2")
                .unwrap_or(&session.image_url);
            let url = format!("{}{}", root, next);
            tracing::debug!("[openstack] GET {}", url);
            resp = self
                .client
                .get(&url)
                .header("X-Auth-Token", &session.token)
                .timeout(API_TIMEOUT)
                .send()
                .await?;
        }
        Ok(images)
    }

    async fn create_image(&self, request: &ImageCreate) -> ProviderResult<Image> {
        let disk_format = match request.disk_format.as_str() {
            "" => "qcow2",
            other => other,
        };
        let container_format = match request.container_format.as_str() {
            "" => "bare",
            other => other,
        };
        let mut body = json!({
            "name": request.name,
            "disk_format": disk_format,
            "container_format": container_format,
            "visibility": "private",
        });
        if let Some(id) = &request.id {
            body["id"] = json!(id);
        }
        for (k, v) in &request.properties {
            body[k] = json!(v);
        }
        let id = request.id.clone().unwrap_or_else(|| request.name.clone());
        let resp = self
            .post_json(Service::Image, "/images", &body, "image", &id)
            .await?;
        let body: Value = resp.json().await?;
        Ok(parse_image(&body))
    }

    async fn upload_image_data(&self, id: &str, path: &Path) -> ProviderResult<()> {
        let file = tokio::fs::File::open(path)
            .await
            .with_context(|| format!("failed to open {}", path.display()))?;
        let len = file.metadata().await.map_err(anyhow::Error::from)?.len();
        tracing::info!(
            "[openstack] uploading {} ({} bytes) to image {}",
            path.display(),
            len,
            id
        );
        let resp = self
            .request(Method::PUT, Service::Image, &format!("/images/{}/file", id))
            .await?
            .timeout(TRANSFER_TIMEOUT)
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .header(reqwest::header::CONTENT_LENGTH, len)
            .body(reqwest::Body::wrap_stream(ReaderStream::new(file)))
            .send()
            .await?;
        check(resp, "image", id).await?;
        Ok(())
    }

    async fn download_image_data(&self, id: &str, path: &Path) -> ProviderResult<()> {
        let resp = self
            .request(Method::GET, Service::Image, &format!("/images/{}/file", id))
            .await?
            .timeout(TRANSFER_TIMEOUT)
            .send()
            .await?;
        let resp = check(resp, "image", id).await?;
        let mut file = tokio::fs::File::create(path)
            .await
            .with_context(|| format!("failed to create {}", path.display()))?;
        let mut stream = resp.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            file.write_all(&chunk).await.map_err(anyhow::Error::from)?;
        }
        file.flush().await.map_err(anyhow::Error::from)?;
        Ok(())
    }

    async fn delete_image(&self, id: &str) -> ProviderResult<()> {
        self.delete(Service::Image, &format!("/images/{}", id), "image", id)
            .await
    }

    async fn create_server(&self, request: &ServerCreate) -> ProviderResult<Server> {
        let user_data = base64::engine::general_purpose::STANDARD.encode(&request.user_data);
        let security_groups: Vec<Value> = request
            .security_groups
            .iter()
            .map(|g| json!({ "name": g }))
            .collect();
        let body = json!({
            "server": {
                "name": request.name,
                "imageRef": request.image_id,
                "flavorRef": request.flavor_id,
                "networks": [{ "uuid": request.network_id }],
                "key_name": request.key_name,
                "security_groups": security_groups,
                "user_data": user_data,
                "metadata": request.metadata,
            }
        });
        let resp = self
            .post_json(Service::Compute, "/servers", &body, "server", &request.name)
            .await?;
        let body: Value = resp.json().await?;
        let id = body["server"]["id"]
            .as_str()
            .ok_or_else(|| anyhow::anyhow!("no server id in create response"))?
            .to_string();
        // The create response only carries the id; report what was requested.
        Ok(Server {
            id,
            name: request.name.clone(),
            status: ServerStatus::Build,
            key_name: Some(request.key_name.clone()),
            security_groups: request.security_groups.clone(),
            created_at: Utc::now(),
            metadata: request.metadata.clone(),
        })
    }

    async fn get_server(&self, id: &str) -> ProviderResult<Option<Server>> {
        Ok(self
            .get_optional(Service::Compute, &format!("/servers/{}", id), "server", id)
            .await?
            .map(|b| parse_server(&b["server"])))
    }

    async fn list_servers(&self, name: &str) -> ProviderResult<Vec<Server>> {
        // Nova treats the name filter as a regex.
        let pattern = format!("^{}$", name.replace('.', "\\."));
        let resp = self
            .request(Method::GET, Service::Compute, "/servers/detail")
            .await?
            .query(&[("name", pattern.as_str())])
            .send()
            .await?;
        let body: Value = check(resp, "server", name).await?.json().await?;
        Ok(body["servers"]
            .as_array()
            .map(|a| {
                a.iter()
                    .map(parse_server)
                    .filter(|s| s.name == name)
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn get_console_output(&self, id: &str, length: Option<u32>) -> ProviderResult<String> {
        let action = match length {
            Some(n) => json!({ "os-getConsoleOutput": { "length": n } }),
            None => json!({ "os-getConsoleOutput": {} }),
        };
        let body: Value = self.server_action(id, &action).await?.json().await?;
        Ok(str_field(&body, "output"))
    }

    async fn create_server_snapshot(
        &self,
        server_id: &str,
        request: &SnapshotCreate,
    ) -> ProviderResult<String> {
        let action = json!({
            "createImage": { "name": request.name, "metadata": request.properties }
        });
        let resp = self.server_action(server_id, &action).await?;
        let location = resp
            .headers()
            .get(reqwest::header::LOCATION)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string());
        // Microversion 2.1 answers 202 with an empty body.
        let text = resp.text().await.unwrap_or_default();
        let body: Value = serde_json::from_str(&text).unwrap_or(Value::Null);
        snapshot_image_id(location.as_deref(), &body).ok_or_else(|| {
            ProviderError::Other(anyhow::anyhow!(
                "createImage on server {} returned no image id",
                server_id
            ))
        })
    }

    async fn delete_server(&self, id: &str) -> ProviderResult<()> {
        self.delete(Service::Compute, &format!("/servers/{}", id), "server", id)
            .await
    }
}
