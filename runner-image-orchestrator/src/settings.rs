use crate::error::{BuildError, BuildResult};
use crate::wait::PollPolicy;
use runner_image_common::FlavorSizing;
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_CLOUD_IMAGES_URL: &str = "https://cloud-images.ubuntu.com";

/// Tunables for a builder process. Defaults are production values; every field
/// can be overridden with an `IMAGE_BUILDER_*` environment variable.
#[derive(Debug, Clone)]
pub struct BuilderSettings {
    pub min_flavor: FlavorSizing,
    /// Server create until ACTIVE.
    pub create_server: PollPolicy,
    /// ACTIVE until the provisioning script reports.
    pub build_signal: PollPolicy,
    /// Snapshot image until ACTIVE.
    pub snapshot: PollPolicy,
    /// Waiting on a seed image another builder is uploading.
    pub seed_upload: PollPolicy,
    /// Server delete until gone.
    pub server_delete: PollPolicy,
    /// Image published to the upload cloud until ACTIVE.
    pub publish: PollPolicy,
    /// Mixed into seed image ids; bump to force a re-seed.
    pub seed_generation: u32,
    /// Where the builder keypair's private key is written when the cloud generates it.
    pub keypair_path: PathBuf,
    /// Console lines fetched per build-signal poll.
    pub console_tail_lines: u32,
    pub cloud_images_url: String,
    /// Scratch space for seed and publish downloads.
    pub work_dir: PathBuf,
}

impl Default for BuilderSettings {
    fn default() -> Self {
        let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
        Self {
            min_flavor: FlavorSizing {
                vcpus: 2,
                ram_mib: 8192,
                disk_gib: 20,
            },
            create_server: PollPolicy::secs(300, 10),
            build_signal: PollPolicy::secs(3600, 30),
            snapshot: PollPolicy::secs(600, 60),
            seed_upload: PollPolicy::secs(1800, 15),
            server_delete: PollPolicy::secs(120, 5),
            publish: PollPolicy::secs(1800, 30),
            seed_generation: 1,
            keypair_path: home.join(".ssh").join("builder_key"),
            console_tail_lines: 200,
            cloud_images_url: DEFAULT_CLOUD_IMAGES_URL.to_string(),
            work_dir: std::env::temp_dir(),
        }
    }
}

impl BuilderSettings {
    pub fn from_env() -> BuildResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build settings from an arbitrary key lookup. Unparsable values fall back to
    /// defaults; numbers too large for their field are a configuration error.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> BuildResult<Self> {
        let d = Self::default();
        let num = |key: &str| -> Option<u64> {
            lookup(key)
                .and_then(|v| v.trim().parse::<u64>().ok())
                .filter(|v| *v > 0)
        };
        let count = |key: &str, default: u32| -> BuildResult<u32> {
            match num(key) {
                Some(v) => u32::try_from(v).map_err(|_| {
                    BuildError::Configuration(format!(
                        "{}={} is out of range (max {})",
                        key,
                        v,
                        u32::MAX
                    ))
                }),
                None => Ok(default),
            }
        };
        let secs = |key: &str, default: Duration| {
            num(key).map(Duration::from_secs).unwrap_or(default)
        };
        let policy = |name: &str, default: PollPolicy| PollPolicy {
            timeout: secs(&format!("IMAGE_BUILDER_{}_TIMEOUT_S", name), default.timeout),
            interval: secs(&format!("IMAGE_BUILDER_{}_INTERVAL_S", name), default.interval),
        };
        let text = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        Ok(Self {
            min_flavor: FlavorSizing {
                vcpus: count("IMAGE_BUILDER_MIN_VCPUS", d.min_flavor.vcpus)?,
                ram_mib: num("IMAGE_BUILDER_MIN_RAM_MIB").unwrap_or(d.min_flavor.ram_mib),
                disk_gib: num("IMAGE_BUILDER_MIN_DISK_GIB").unwrap_or(d.min_flavor.disk_gib),
            },
            create_server: policy("CREATE_SERVER", d.create_server),
            build_signal: policy("BUILD_SIGNAL", d.build_signal),
            snapshot: policy("SNAPSHOT", d.snapshot),
            seed_upload: policy("SEED_UPLOAD", d.seed_upload),
            server_delete: policy("SERVER_DELETE", d.server_delete),
            publish: policy("PUBLISH", d.publish),
            seed_generation: count("IMAGE_BUILDER_SEED_GENERATION", d.seed_generation)?,
            keypair_path: text("IMAGE_BUILDER_KEYPAIR_PATH")
                .map(PathBuf::from)
                .unwrap_or(d.keypair_path),
            console_tail_lines: count(
                "IMAGE_BUILDER_CONSOLE_TAIL_LINES",
                d.console_tail_lines,
            )?,
            cloud_images_url: text("IMAGE_BUILDER_CLOUD_IMAGES_URL")
                .map(|v| v.trim_end_matches('/').to_string())
                .unwrap_or(d.cloud_images_url),
            work_dir: text("IMAGE_BUILDER_WORK_DIR")
                .map(PathBuf::from)
                .unwrap_or(d.work_dir),
        })
    }
}
