//! `clouds.yaml` loading, following the openstacksdk search order.

use indexmap::IndexMap;
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, thiserror::Error)]
pub enum CloudsYamlError {
    #[error("no clouds.yaml found (searched: {searched})")]
    NotFound { searched: String },
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_yaml::Error,
    },
    #[error("cloud '{0}' not found in clouds.yaml")]
    UnknownCloud(String),
    #[error("clouds.yaml does not define any cloud")]
    Empty,
    #[error("cloud '{cloud}' is missing auth.{field}")]
    MissingField { cloud: String, field: &'static str },
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct CloudsFile {
    /// In file order.
    #[serde(default)]
    pub clouds: IndexMap<String, CloudEntry>,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct CloudEntry {
    #[serde(default)]
    pub auth: CloudAuth,
    pub region_name: Option<String>,
    pub interface: Option<String>,
    pub auth_type: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct CloudAuth {
    pub auth_url: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub project_name: Option<String>,
    pub project_id: Option<String>,
    pub user_domain_name: Option<String>,
    pub project_domain_name: Option<String>,
    pub application_credential_id: Option<String>,
    pub application_credential_secret: Option<String>,
}

/// Project a password-authenticated token is scoped to.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ProjectScope {
    /// Ids are unique across domains, so no domain is needed.
    Id(String),
    Name { name: String, domain: String },
}

/// Resolved credentials for one named cloud.
#[derive(Clone, Debug)]
pub enum Credentials {
    Password {
        username: String,
        password: String,
        user_domain: String,
        project: ProjectScope,
    },
    ApplicationCredential {
        id: String,
        secret: String,
    },
}

#[derive(Clone, Debug)]
pub struct CloudProfile {
    pub name: String,
    pub auth_url: String,
    pub region: Option<String>,
    pub interface: String,
    pub credentials: Credentials,
}

/// Candidate locations, highest priority first.
pub fn search_paths() -> Vec<PathBuf> {
    let mut paths = vec![PathBuf::from("clouds.yaml")];
    if let Some(home) = dirs::home_dir() {
        paths.push(home.join("clouds.yaml"));
        paths.push(home.join(".config/openstack/clouds.yaml"));
    }
    paths.push(PathBuf::from("/etc/openstack/clouds.yaml"));
    paths
}

pub fn parse(path: &Path, raw: &str) -> Result<CloudsFile, CloudsYamlError> {
    serde_yaml::from_str(raw).map_err(|source| CloudsYamlError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

/// Load the first `clouds.yaml` found in `paths`.
pub fn load_from(paths: &[PathBuf]) -> Result<(PathBuf, CloudsFile), CloudsYamlError> {
    for path in paths {
        if !path.is_file() {
            continue;
        }
        let raw = std::fs::read_to_string(path).map_err(|source| CloudsYamlError::Io {
            path: path.clone(),
            source,
        })?;
        return Ok((path.clone(), parse(path, &raw)?));
    }
    Err(CloudsYamlError::NotFound {
        searched: paths
            .iter()
            .map(|p| p.display().to_string())
            .collect::<Vec<_>>()
            .join(", "),
    })
}

pub fn load() -> Result<(PathBuf, CloudsFile), CloudsYamlError> {
    load_from(&search_paths())
}

impl CloudsFile {
    /// First cloud listed in the file, used when no cloud is given.
    pub fn determine_cloud(&self) -> Result<String, CloudsYamlError> {
        self.clouds
            .keys()
            .next()
            .cloned()
            .ok_or(CloudsYamlError::Empty)
    }

    pub fn profile(&self, name: &str) -> Result<CloudProfile, CloudsYamlError> {
        let entry = self
            .clouds
            .get(name)
            .ok_or_else(|| CloudsYamlError::UnknownCloud(name.to_string()))?;
        let missing = |field: &'static str| CloudsYamlError::MissingField {
            cloud: name.to_string(),
            field,
        };
        let auth = &entry.auth;
        let auth_url = auth.auth_url.clone().ok_or_else(|| missing("auth_url"))?;

        let use_app_cred = entry.auth_type.as_deref() == Some("v3applicationcredential")
            || auth.application_credential_id.is_some();
        let credentials = if use_app_cred {
            Credentials::ApplicationCredential {
                id: auth
                    .application_credential_id
                    .clone()
                    .ok_or_else(|| missing("application_credential_id"))?,
                secret: auth
                    .application_credential_secret
                    .clone()
                    .ok_or_else(|| missing("application_credential_secret"))?,
            }
        } else {
            Credentials::Password {
                username: auth.username.clone().ok_or_else(|| missing("username"))?,
                password: auth.password.clone().ok_or_else(|| missing("password"))?,
                user_domain: auth
                    .user_domain_name
                    .clone()
                    .unwrap_or_else(|| "Default".to_string()),
                project: match (&auth.project_id, &auth.project_name) {
                    (Some(id), _) => ProjectScope::Id(id.clone()),
                    (None, Some(name)) => ProjectScope::Name {
                        name: name.clone(),
                        domain: auth
                            .project_domain_name
                            .clone()
                            .unwrap_or_else(|| "Default".to_string()),
                    },
                    (None, None) => return Err(missing("project_name")),
                },
            }
        };

        Ok(CloudProfile {
            name: name.to_string(),
            auth_url: auth_url.trim_end_matches('/').to_string(),
            region: entry.region_name.clone(),
            interface: entry
                .interface
                .clone()
                .unwrap_or_else(|| "public".to_string()),
            credentials,
        })
    }
}
