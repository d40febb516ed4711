use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub mod naming;
pub mod signal;

// --- Errors ---

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("unsupported architecture: {0}")]
    UnsupportedArchitecture(String),
    #[error("unsupported base image: {0} (expected one of jammy, 22.04, noble, 24.04)")]
    UnsupportedBase(String),
    #[error("invalid flavor '{0}' (expected NAME or NAME:VCPUS:RAM_MIB:DISK_GIB)")]
    InvalidFlavor(String),
    #[error("invalid runner version '{0}' (expected 'latest' or MAJOR.MINOR.PATCH)")]
    InvalidRunnerVersion(String),
    #[error("invalid image name '{0}'")]
    InvalidImageName(String),
}

// --- Enums ---

/// Target CPU architecture of the built image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Arch {
    Arm64,
    X64,
}

impl Arch {
    pub const ALL: [Arch; 2] = [Arch::Arm64, Arch::X64];

    pub fn as_str(&self) -> &'static str {
        match self {
            Arch::Arm64 => "arm64",
            Arch::X64 => "x64",
        }
    }

    /// Value of the `architecture` image property understood by Nova schedulers.
    pub fn to_openstack(&self) -> &'static str {
        match self {
            Arch::Arm64 => "aarch64",
            Arch::X64 => "x86_64",
        }
    }

    /// Architecture label used by cloud-images.ubuntu.com file names.
    pub fn cloud_image_arch(&self) -> &'static str {
        match self {
            Arch::Arm64 => "arm64",
            Arch::X64 => "amd64",
        }
    }

    /// Architecture label used by actions/runner release tarballs.
    pub fn runner_arch(&self) -> &'static str {
        match self {
            Arch::Arm64 => "arm64",
            Arch::X64 => "x64",
        }
    }

    /// Architecture of the machine this process runs on.
    pub fn host() -> Result<Self, ParseError> {
        Self::from_machine(std::env::consts::ARCH)
    }

    /// Map a `uname -m` style machine string.
    pub fn from_machine(machine: &str) -> Result<Self, ParseError> {
        match machine {
            "aarch64" | "arm64" => Ok(Arch::Arm64),
            "x86_64" => Ok(Arch::X64),
            other => Err(ParseError::UnsupportedArchitecture(other.to_string())),
        }
    }
}

impl FromStr for Arch {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "arm64" | "aarch64" => Ok(Arch::Arm64),
            "x64" | "x86_64" | "amd64" => Ok(Arch::X64),
            other => Err(ParseError::UnsupportedArchitecture(other.to_string())),
        }
    }
}

impl fmt::Display for Arch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ubuntu LTS release used as the build base.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BaseImage {
    Jammy,
    Noble,
}

impl BaseImage {
    pub const ALL: [BaseImage; 2] = [BaseImage::Jammy, BaseImage::Noble];

    pub fn as_str(&self) -> &'static str {
        match self {
            BaseImage::Jammy => "jammy",
            BaseImage::Noble => "noble",
        }
    }

    /// Numeric LTS version tag, also used to pick the HWE kernel package.
    pub fn version_tag(&self) -> &'static str {
        match self {
            BaseImage::Jammy => "22.04",
            BaseImage::Noble => "24.04",
        }
    }
}

impl FromStr for BaseImage {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "jammy" | "22.04" => Ok(BaseImage::Jammy),
            "noble" | "24.04" => Ok(BaseImage::Noble),
            other => Err(ParseError::UnsupportedBase(other.to_string())),
        }
    }
}

impl fmt::Display for BaseImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle status of a compute server as reported by the cloud.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServerStatus {
    Build,
    Active,
    Shutoff,
    Error,
    Deleted,
    Other(String),
}

impl ServerStatus {
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_uppercase().as_str() {
            "BUILD" => ServerStatus::Build,
            "ACTIVE" => ServerStatus::Active,
            "SHUTOFF" => ServerStatus::Shutoff,
            "ERROR" => ServerStatus::Error,
            "DELETED" | "SOFT_DELETED" => ServerStatus::Deleted,
            other => ServerStatus::Other(other.to_string()),
        }
    }
}

impl fmt::Display for ServerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServerStatus::Build => f.write_str("BUILD"),
            ServerStatus::Active => f.write_str("ACTIVE"),
            ServerStatus::Shutoff => f.write_str("SHUTOFF"),
            ServerStatus::Error => f.write_str("ERROR"),
            ServerStatus::Deleted => f.write_str("DELETED"),
            ServerStatus::Other(s) => f.write_str(s),
        }
    }
}

/// Status of an image in the image store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ImageStatus {
    Queued,
    Saving,
    Importing,
    Active,
    Killed,
    Deleted,
    PendingDelete,
    Other(String),
}

impl ImageStatus {
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "queued" => ImageStatus::Queued,
            "saving" | "uploading" => ImageStatus::Saving,
            "importing" => ImageStatus::Importing,
            "active" => ImageStatus::Active,
            "killed" => ImageStatus::Killed,
            "deleted" | "deactivated" => ImageStatus::Deleted,
            "pending_delete" => ImageStatus::PendingDelete,
            other => ImageStatus::Other(other.to_string()),
        }
    }

    /// Terminal states an image never leaves on its own.
    pub fn is_failed(&self) -> bool {
        matches!(
            self,
            ImageStatus::Killed | ImageStatus::Deleted | ImageStatus::PendingDelete
        )
    }
}

impl fmt::Display for ImageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ImageStatus::Queued => "queued",
            ImageStatus::Saving => "saving",
            ImageStatus::Importing => "importing",
            ImageStatus::Active => "active",
            ImageStatus::Killed => "killed",
            ImageStatus::Deleted => "deleted",
            ImageStatus::PendingDelete => "pending_delete",
            ImageStatus::Other(s) => s.as_str(),
        };
        f.write_str(s)
    }
}

// --- Configuration values ---

/// CPU/RAM/disk sizing of a flavor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlavorSizing {
    pub vcpus: u32,
    pub ram_mib: u64,
    pub disk_gib: u64,
}

impl FlavorSizing {
    pub fn meets(&self, minimum: &FlavorSizing) -> bool {
        self.vcpus >= minimum.vcpus
            && self.ram_mib >= minimum.ram_mib
            && self.disk_gib >= minimum.disk_gib
    }
}

impl fmt::Display for FlavorSizing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "CPU: {} MEM: {}M DISK: {}G",
            self.vcpus, self.ram_mib, self.disk_gib
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlavorSpec {
    pub name: String,
    pub sizing: FlavorSizing,
}

/// How the builder VM flavor is chosen.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum FlavorSelection {
    /// Smallest flavor in the cloud meeting the minimum sizing.
    #[default]
    Auto,
    /// Flavor looked up by name or id; sizing checked after lookup.
    Named(String),
    /// Flavor with operator-declared sizing, checked before any cloud call.
    Declared(FlavorSpec),
}

impl FromStr for FlavorSelection {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Ok(FlavorSelection::Auto);
        }
        let parts: Vec<&str> = s.split(':').collect();
        match parts.as_slice() {
            [name] => Ok(FlavorSelection::Named(name.to_string())),
            [name, vcpus, ram, disk] if !name.is_empty() => {
                let invalid = || ParseError::InvalidFlavor(s.to_string());
                Ok(FlavorSelection::Declared(FlavorSpec {
                    name: name.to_string(),
                    sizing: FlavorSizing {
                        vcpus: vcpus.parse().map_err(|_| invalid())?,
                        ram_mib: ram.parse().map_err(|_| invalid())?,
                        disk_gib: disk.parse().map_err(|_| invalid())?,
                    },
                }))
            }
            _ => Err(ParseError::InvalidFlavor(s.to_string())),
        }
    }
}

/// GitHub Actions runner version to bake into the image.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum RunnerVersion {
    #[default]
    Latest,
    Pinned(String),
}

impl FromStr for RunnerVersion {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed.is_empty() || trimmed.eq_ignore_ascii_case("latest") {
            return Ok(RunnerVersion::Latest);
        }
        let version = trimmed.strip_prefix('v').unwrap_or(trimmed);
        let parts: Vec<&str> = version.split('.').collect();
        let valid = parts.len() == 3
            && parts
                .iter()
                .all(|p| !p.is_empty() && p.chars().all(|c| c.is_ascii_digit()));
        if !valid {
            return Err(ParseError::InvalidRunnerVersion(s.to_string()));
        }
        Ok(RunnerVersion::Pinned(version.to_string()))
    }
}

impl fmt::Display for RunnerVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunnerVersion::Latest => f.write_str("latest"),
            RunnerVersion::Pinned(v) => f.write_str(v),
        }
    }
}

/// Cloud-side settings for one build run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloudConfig {
    pub cloud_name: String,
    pub flavor: FlavorSelection,
    pub network: Option<String>,
    /// `host:port`, without scheme.
    pub proxy: Option<String>,
    pub upload_cloud_name: Option<String>,
}

/// What image to build.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageConfig {
    pub arch: Arch,
    pub base: BaseImage,
    pub runner_version: RunnerVersion,
    /// Artifact family name; every revision's image name starts with it.
    pub name: String,
}

// --- Entities ---

/// Account-wide resources reused by every build run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SharedResources {
    pub seed_image_id: String,
    pub keypair_name: String,
    pub security_group_id: String,
    pub security_group_name: String,
}

/// Ephemeral VM owned by exactly one build run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildVm {
    pub id: String,
    pub name: String,
    pub status: ServerStatus,
    pub keypair_name: String,
    pub security_group: String,
    pub created_at: DateTime<Utc>,
    /// Token the provisioning script embeds in its console build signal.
    pub signal_token: String,
}

/// One image within an artifact family.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageRevision {
    pub id: String,
    pub name: String,
    pub family: String,
    pub revision: String,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arch_parse() {
        for (s, a) in [
            ("arm64", Arch::Arm64),
            ("aarch64", Arch::Arm64),
            ("x64", Arch::X64),
            ("X86_64", Arch::X64),
            ("amd64", Arch::X64),
        ] {
            assert_eq!(s.parse::<Arch>().unwrap(), a);
        }
        assert!("riscv64".parse::<Arch>().is_err());
        assert_eq!(Arch::from_machine("x86_64").unwrap(), Arch::X64);
        assert!(Arch::from_machine("s390x").is_err());
    }

    #[test]
    fn arch_mappings_are_total() {
        assert_eq!(Arch::Arm64.to_openstack(), "aarch64");
        assert_eq!(Arch::X64.to_openstack(), "x86_64");
        assert_eq!(Arch::X64.cloud_image_arch(), "amd64");
        assert_eq!(Arch::X64.runner_arch(), "x64");
    }

    #[test]
    fn base_parse_accepts_tags_and_names() {
        assert_eq!("22.04".parse::<BaseImage>().unwrap(), BaseImage::Jammy);
        assert_eq!("jammy".parse::<BaseImage>().unwrap(), BaseImage::Jammy);
        assert_eq!("24.04".parse::<BaseImage>().unwrap(), BaseImage::Noble);
        assert_eq!("Noble".parse::<BaseImage>().unwrap(), BaseImage::Noble);
        assert_eq!(
            "focal".parse::<BaseImage>(),
            Err(ParseError::UnsupportedBase("focal".to_string()))
        );
        assert_eq!(BaseImage::Noble.version_tag(), "24.04");
    }

    #[test]
    fn flavor_selection_parse() {
        assert_eq!("".parse::<FlavorSelection>().unwrap(), FlavorSelection::Auto);
        assert_eq!(
            "m1.large".parse::<FlavorSelection>().unwrap(),
            FlavorSelection::Named("m1.large".to_string())
        );
        assert_eq!(
            "m1.small:1:2048:10".parse::<FlavorSelection>().unwrap(),
            FlavorSelection::Declared(FlavorSpec {
                name: "m1.small".to_string(),
                sizing: FlavorSizing {
                    vcpus: 1,
                    ram_mib: 2048,
                    disk_gib: 10
                },
            })
        );
        assert!("m1:x:1:1".parse::<FlavorSelection>().is_err());
        assert!("m1:1:1".parse::<FlavorSelection>().is_err());
    }

    #[test]
    fn flavor_sizing_meets() {
        let min = FlavorSizing {
            vcpus: 2,
            ram_mib: 8192,
            disk_gib: 20,
        };
        assert!(min.meets(&min));
        assert!(!FlavorSizing {
            vcpus: 2,
            ram_mib: 8191,
            disk_gib: 40
        }
        .meets(&min));
    }

    #[test]
    fn runner_version_parse() {
        assert_eq!("".parse::<RunnerVersion>().unwrap(), RunnerVersion::Latest);
        assert_eq!(
            "LATEST".parse::<RunnerVersion>().unwrap(),
            RunnerVersion::Latest
        );
        assert_eq!(
            "v2.317.0".parse::<RunnerVersion>().unwrap(),
            RunnerVersion::Pinned("2.317.0".to_string())
        );
        assert!("2.317".parse::<RunnerVersion>().is_err());
        assert!("2.317.0; rm -rf /".parse::<RunnerVersion>().is_err());
    }

    #[test]
    fn status_parse() {
        assert_eq!(ServerStatus::parse("active"), ServerStatus::Active);
        assert_eq!(
            ServerStatus::parse("REBUILD"),
            ServerStatus::Other("REBUILD".to_string())
        );
        assert_eq!(ImageStatus::parse("ACTIVE"), ImageStatus::Active);
        assert!(ImageStatus::parse("killed").is_failed());
        assert!(!ImageStatus::parse("saving").is_failed());
    }
}
